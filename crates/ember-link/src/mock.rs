//! Recording channel for tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::channel::{AckPolicy, Channel, QoS};
use crate::error::{LinkError, LinkResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub ack: AckPolicy,
}

/// In-memory [`Channel`] that records every command. Tests drive inbound
/// traffic by calling component handlers directly, then assert on what
/// was recorded here.
#[derive(Debug, Default)]
pub struct MockChannel {
    publishes: Mutex<Vec<RecordedPublish>>,
    subscriptions: Mutex<Vec<String>>,
    unsubscriptions: Mutex<Vec<String>>,
    fail_publishes: AtomicBool,
    fail_subscribes: AtomicBool,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publishes(&self) -> Vec<RecordedPublish> {
        self.publishes.lock().unwrap().clone()
    }

    /// Payloads published to `topic`, in order.
    pub fn published_to(&self, topic: &str) -> Vec<Vec<u8>> {
        self.publishes
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.topic == topic)
            .map(|p| p.payload.clone())
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub fn unsubscriptions(&self) -> Vec<String> {
        self.unsubscriptions.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.publishes.lock().unwrap().clear();
        self.subscriptions.lock().unwrap().clear();
        self.unsubscriptions.lock().unwrap().clear();
    }

    pub fn set_fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_subscribes(&self, fail: bool) {
        self.fail_subscribes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        ack: AckPolicy,
    ) -> LinkResult<()> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(LinkError::Publish("mock publish failure".into()));
        }
        self.publishes.lock().unwrap().push(RecordedPublish {
            topic: topic.to_owned(),
            payload: payload.to_vec(),
            qos,
            ack,
        });
        Ok(())
    }

    async fn subscribe(&self, filters: &[&str], _qos: QoS, _ack: AckPolicy) -> LinkResult<()> {
        if self.fail_subscribes.load(Ordering::SeqCst) {
            return Err(LinkError::Subscribe("mock subscribe failure".into()));
        }
        let mut subs = self.subscriptions.lock().unwrap();
        subs.extend(filters.iter().map(|f| (*f).to_owned()));
        Ok(())
    }

    async fn unsubscribe(&self, filters: &[&str], _ack: AckPolicy) -> LinkResult<()> {
        let mut unsubs = self.unsubscriptions.lock().unwrap();
        unsubs.extend(filters.iter().map(|f| (*f).to_owned()));
        Ok(())
    }
}
