//! Inbound message fan-out.
//!
//! Components register a handler against a topic filter; the driver task
//! hands every inbound PUBLISH to [`SubscriptionDispatcher::dispatch`],
//! which runs the handlers of every matching filter. The table is
//! bounded: registration fails once the configured slots are used.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ember_protocol::filters::topic_matches;

use crate::error::{LinkError, LinkResult};

/// Receives inbound messages for a registered topic filter.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, topic: &str, payload: &[u8]);
}

struct Registration {
    filter: String,
    handler: Arc<dyn MessageHandler>,
}

pub struct SubscriptionDispatcher {
    slots: usize,
    table: Mutex<Vec<Registration>>,
}

impl SubscriptionDispatcher {
    pub fn new(slots: usize) -> Self {
        Self {
            slots,
            table: Mutex::new(Vec::new()),
        }
    }

    /// Register `handler` for `filter`. Registering the same handler for
    /// the same filter again is a no-op; a different handler under an
    /// existing filter takes a fresh slot.
    pub fn register(&self, filter: &str, handler: Arc<dyn MessageHandler>) -> LinkResult<()> {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let duplicate = table
            .iter()
            .any(|r| r.filter == filter && Arc::ptr_eq(&r.handler, &handler));
        if duplicate {
            return Ok(());
        }
        if table.len() >= self.slots {
            return Err(LinkError::SubscriptionsFull(self.slots));
        }
        table.push(Registration {
            filter: filter.to_owned(),
            handler,
        });
        Ok(())
    }

    /// Drop every registration for `filter`.
    pub fn unregister(&self, filter: &str) {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.retain(|r| r.filter != filter);
    }

    pub fn registered_count(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Run the handlers of every filter matching `topic`. Matches are
    /// collected first so no lock is held across handler awaits; a
    /// handler may register or unregister without deadlocking.
    pub async fn dispatch(&self, topic: &str, payload: &[u8]) {
        let matched: Vec<Arc<dyn MessageHandler>> = {
            let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            table
                .iter()
                .filter(|r| topic_matches(&r.filter, topic))
                .map(|r| r.handler.clone())
                .collect()
        };

        if matched.is_empty() {
            tracing::debug!(topic, "inbound message matched no subscription");
            return;
        }

        for handler in matched {
            handler.handle(topic, payload).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        hits: AtomicUsize,
        seen: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                hits: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, topic: &str, payload: &[u8]) {
            self.hits.fetch_add(1, Ordering::SeqCst);
            self.seen
                .lock()
                .unwrap()
                .push((topic.to_owned(), payload.to_vec()));
        }
    }

    #[tokio::test]
    async fn dispatches_to_matching_filters_only() {
        let dispatcher = SubscriptionDispatcher::new(8);
        let jobs = Recorder::new();
        let shadow = Recorder::new();
        dispatcher
            .register("$aws/things/+/jobs/#", jobs.clone())
            .unwrap();
        dispatcher
            .register("$aws/things/boiler-1/shadow/get/#", shadow.clone())
            .unwrap();

        dispatcher
            .dispatch("$aws/things/boiler-1/jobs/notify-next", b"{}")
            .await;

        assert_eq!(jobs.hits.load(Ordering::SeqCst), 1);
        assert_eq!(shadow.hits.load(Ordering::SeqCst), 0);
        let seen = jobs.seen.lock().unwrap();
        assert_eq!(seen[0].0, "$aws/things/boiler-1/jobs/notify-next");
    }

    #[tokio::test]
    async fn overlapping_filters_all_fire() {
        let dispatcher = SubscriptionDispatcher::new(8);
        let wide = Recorder::new();
        let narrow = Recorder::new();
        dispatcher.register("telemetry/#", wide.clone()).unwrap();
        dispatcher
            .register("telemetry/+/status", narrow.clone())
            .unwrap();

        dispatcher.dispatch("telemetry/boiler-1/status", b"ok").await;

        assert_eq!(wide.hits.load(Ordering::SeqCst), 1);
        assert_eq!(narrow.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_registration_is_a_noop() {
        let dispatcher = SubscriptionDispatcher::new(8);
        let handler = Recorder::new();
        dispatcher.register("a/b", handler.clone()).unwrap();
        dispatcher.register("a/b", handler.clone()).unwrap();

        assert_eq!(dispatcher.registered_count(), 1);
        dispatcher.dispatch("a/b", b"x").await;
        assert_eq!(handler.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_handlers_share_a_filter() {
        let dispatcher = SubscriptionDispatcher::new(8);
        let first = Recorder::new();
        let second = Recorder::new();
        dispatcher.register("a/b", first.clone()).unwrap();
        dispatcher.register("a/b", second.clone()).unwrap();

        dispatcher.dispatch("a/b", b"x").await;
        assert_eq!(first.hits.load(Ordering::SeqCst), 1);
        assert_eq!(second.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn table_is_bounded() {
        let dispatcher = SubscriptionDispatcher::new(2);
        dispatcher.register("a", Recorder::new()).unwrap();
        dispatcher.register("b", Recorder::new()).unwrap();
        let err = dispatcher.register("c", Recorder::new()).unwrap_err();
        assert!(matches!(err, LinkError::SubscriptionsFull(2)));
    }

    #[tokio::test]
    async fn unregister_frees_the_slot() {
        let dispatcher = SubscriptionDispatcher::new(1);
        let handler = Recorder::new();
        dispatcher.register("a/b", handler.clone()).unwrap();
        dispatcher.unregister("a/b");
        assert_eq!(dispatcher.registered_count(), 0);

        dispatcher.register("c/d", handler.clone()).unwrap();
        dispatcher.dispatch("a/b", b"x").await;
        assert_eq!(handler.hits.load(Ordering::SeqCst), 0);
    }
}
