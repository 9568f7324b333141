//! Shadow reconciliation: keep the cloud's desired state and the local
//! configuration groups agreeing.
//!
//! Deltas push desired values into the config setters; values a setter
//! refuses are scheduled for a delete-desired publish on the next
//! reconciliation cycle so the cloud stops re-offering them. Reported
//! state goes out every cycle from whatever the groups currently hold.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ember_link::{AckPolicy, Channel, MessageHandler, QoS, SubscriptionDispatcher};
use ember_protocol::shadows::{ShadowDelta, delete_desired_document, reported_document};
use ember_protocol::topics::ShadowTopics;
use serde_json::Value;

use crate::error::{AgentError, AgentResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigApply {
    Applied,
    /// The value is out of range for this unit; the reconciler will ask
    /// the cloud to clear it.
    Rejected,
}

/// One top-level group in the shadow document ("control", "telemetry"),
/// backed by the control-loop collaborator.
pub trait ConfigGroup: Send + Sync {
    fn name(&self) -> &str;
    fn get(&self) -> Value;
    fn set(&self, value: &Value) -> ConfigApply;
}

pub struct ShadowReconciler {
    channel: Arc<dyn Channel>,
    topics: ShadowTopics,
    groups: Vec<Arc<dyn ConfigGroup>>,
    pending_deletes: Mutex<BTreeSet<String>>,
    refresh_required: AtomicBool,
    /// Response subscriptions are issued at most once per connection.
    subscribed: AtomicBool,
}

impl ShadowReconciler {
    pub fn new(
        channel: Arc<dyn Channel>,
        thing_id: &str,
        shadow_name: &str,
        groups: Vec<Arc<dyn ConfigGroup>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel,
            topics: ShadowTopics::new(thing_id, shadow_name),
            groups,
            pending_deletes: Mutex::new(BTreeSet::new()),
            refresh_required: AtomicBool::new(false),
            subscribed: AtomicBool::new(false),
        })
    }

    pub fn attach(self: &Arc<Self>, dispatcher: &SubscriptionDispatcher) -> AgentResult<()> {
        let handler: Arc<dyn MessageHandler> = Arc::new(ShadowInbound {
            reconciler: self.clone(),
        });
        for filter in self.topics.response_filters() {
            dispatcher.register(filter, handler.clone())?;
        }
        Ok(())
    }

    /// On (re)connect: subscribe the response topics once, then request
    /// the current document. Skipped entirely while initial provisioning
    /// is still underway.
    pub async fn on_connected(&self, provisioning_active: bool) -> AgentResult<()> {
        if provisioning_active {
            tracing::debug!("provisioning incomplete, shadow sync deferred");
            return Ok(());
        }
        if self.subscribed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.channel
            .subscribe(
                &self.topics.response_filters(),
                QoS::AtLeastOnce,
                AckPolicy::Forever,
            )
            .await?;
        self.get().await?;
        // Marked only once both commands landed, so a failed attempt is
        // repeated on the next connect signal.
        self.subscribed.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn on_disconnected(&self) {
        self.subscribed.store(false, Ordering::SeqCst);
    }

    /// Request the current shadow document. Idempotent and side-effect
    /// free on the device.
    pub async fn get(&self) -> AgentResult<()> {
        self.channel
            .publish(&self.topics.get, b"{}", QoS::AtLeastOnce, AckPolicy::Default)
            .await?;
        Ok(())
    }

    /// One outgoing cycle: refresh if flagged, publish reported state,
    /// flush scheduled delete-desired documents.
    pub async fn reconcile(&self) -> AgentResult<()> {
        if self.refresh_required.swap(false, Ordering::SeqCst) {
            self.get().await?;
        }
        self.publish_reported().await?;

        let deletes: Vec<String> = {
            let mut pending = self
                .pending_deletes
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *pending).into_iter().collect()
        };
        for group in deletes {
            tracing::info!(group, "clearing rejected desired value");
            let body = serde_json::to_vec(&delete_desired_document(&group))
                .map_err(|e| AgentError::Payload(e.to_string()))?;
            self.channel
                .publish(
                    &self.topics.update,
                    &body,
                    QoS::AtLeastOnce,
                    AckPolicy::Default,
                )
                .await?;
        }
        Ok(())
    }

    async fn publish_reported(&self) -> AgentResult<()> {
        let document = reported_document(
            self.groups
                .iter()
                .map(|group| (group.name().to_owned(), group.get())),
        );
        let body =
            serde_json::to_vec(&document).map_err(|e| AgentError::Payload(e.to_string()))?;
        self.channel
            .publish(
                &self.topics.update,
                &body,
                QoS::AtLeastOnce,
                AckPolicy::Default,
            )
            .await?;
        Ok(())
    }

    /// Push each group of a desired-state object into its setter;
    /// rejected groups are queued for delete-desired.
    fn apply_desired(&self, state: &serde_json::Map<String, Value>) {
        for (name, value) in state {
            let Some(group) = self.groups.iter().find(|g| g.name() == name) else {
                tracing::debug!(group = %name, "delta for unknown config group");
                continue;
            };
            match group.set(value) {
                ConfigApply::Applied => {
                    tracing::info!(group = %name, "desired config applied");
                }
                ConfigApply::Rejected => {
                    tracing::warn!(group = %name, "desired config rejected, scheduling clear");
                    self.pending_deletes
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(name.clone());
                }
            }
        }
    }

    pub fn handle_delta(&self, payload: &[u8]) {
        let delta: ShadowDelta = match serde_json::from_slice(payload) {
            Ok(delta) => delta,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable shadow delta, dropping");
                return;
            }
        };
        if let Some(groups) = delta.groups() {
            self.apply_desired(groups);
        }
    }

    /// A full document from `get/accepted`; only its embedded delta
    /// needs applying.
    pub fn handle_document(&self, payload: &[u8]) {
        let Ok(document) = serde_json::from_slice::<Value>(payload) else {
            tracing::warn!("unparseable shadow document, dropping");
            return;
        };
        if let Some(delta) = document.pointer("/state/delta").and_then(Value::as_object) {
            self.apply_desired(delta);
        }
    }

    /// The document was deleted server-side; flag a refresh so the next
    /// cycle re-requests and re-reports.
    pub fn handle_deleted(&self) {
        tracing::warn!("shadow deleted server-side, scheduling refresh");
        self.refresh_required.store(true, Ordering::SeqCst);
    }

    /// `get` rejected: a 404 means the shadow does not exist yet, so
    /// publishing reported state creates it.
    pub async fn handle_get_rejected(&self, payload: &[u8]) -> AgentResult<()> {
        let code = serde_json::from_slice::<Value>(payload)
            .ok()
            .and_then(|v| v.get("code").and_then(Value::as_u64));
        if code == Some(404) {
            tracing::info!("shadow missing, creating from reported state");
            self.publish_reported().await
        } else {
            tracing::warn!(code = code.unwrap_or(0), "shadow get rejected");
            Ok(())
        }
    }
}

struct ShadowInbound {
    reconciler: Arc<ShadowReconciler>,
}

#[async_trait]
impl MessageHandler for ShadowInbound {
    async fn handle(&self, topic: &str, payload: &[u8]) {
        if topic.ends_with("/update/delta") {
            self.reconciler.handle_delta(payload);
        } else if topic.ends_with("/get/accepted") {
            self.reconciler.handle_document(payload);
        } else if topic.ends_with("/get/rejected") {
            if let Err(e) = self.reconciler.handle_get_rejected(payload).await {
                tracing::warn!(error = %e, "shadow create failed");
            }
        } else if topic.ends_with("/delete/accepted") {
            self.reconciler.handle_deleted();
        } else if topic.ends_with("/update/rejected") {
            tracing::warn!(topic, "shadow update rejected");
        } else {
            tracing::debug!(topic, "shadow response");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use ember_link::MockChannel;

    struct TestGroup {
        name: &'static str,
        accept: bool,
        applied: Mutex<Vec<Value>>,
    }

    impl TestGroup {
        fn new(name: &'static str, accept: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                accept,
                applied: Mutex::new(Vec::new()),
            })
        }
    }

    impl ConfigGroup for TestGroup {
        fn name(&self) -> &str {
            self.name
        }

        fn get(&self) -> Value {
            serde_json::json!({"max_heat_ratio": 0.8})
        }

        fn set(&self, value: &Value) -> ConfigApply {
            if self.accept {
                self.applied.lock().unwrap().push(value.clone());
                ConfigApply::Applied
            } else {
                ConfigApply::Rejected
            }
        }
    }

    fn reconciler(
        channel: &Arc<MockChannel>,
        groups: Vec<Arc<dyn ConfigGroup>>,
    ) -> Arc<ShadowReconciler> {
        let channel: Arc<dyn Channel> = channel.clone();
        ShadowReconciler::new(channel, "boiler-0042", "", groups)
    }

    const UPDATE_TOPIC: &str = "$aws/things/boiler-0042/shadow/update";
    const GET_TOPIC: &str = "$aws/things/boiler-0042/shadow/get";

    #[tokio::test]
    async fn accepted_delta_schedules_no_delete() {
        let channel = Arc::new(MockChannel::new());
        let control = TestGroup::new("control", true);
        let shadow = reconciler(&channel, vec![control.clone()]);

        shadow.handle_delta(br#"{"state":{"control":{"max_heat_ratio":0.5}}}"#);
        assert_eq!(
            control.applied.lock().unwrap().as_slice(),
            &[serde_json::json!({"max_heat_ratio": 0.5})]
        );

        shadow.reconcile().await.unwrap();
        let updates = channel.published_to(UPDATE_TOPIC);
        assert_eq!(updates.len(), 1, "reported document only");
        let doc: Value = serde_json::from_slice(&updates[0]).unwrap();
        assert_eq!(
            doc.pointer("/state/reported/control/max_heat_ratio"),
            Some(&serde_json::json!(0.8))
        );
    }

    #[tokio::test]
    async fn rejected_delta_clears_desired_exactly_once() {
        let channel = Arc::new(MockChannel::new());
        let shadow = reconciler(&channel, vec![TestGroup::new("control", false)]);

        shadow.handle_delta(br#"{"state":{"control":{"max_heat_ratio":9.9}}}"#);
        shadow.reconcile().await.unwrap();

        let updates = channel.published_to(UPDATE_TOPIC);
        assert_eq!(updates.len(), 2);
        let clear: Value = serde_json::from_slice(&updates[1]).unwrap();
        assert_eq!(clear, serde_json::json!({"state": {"desired": {"control": null}}}));

        // The schedule drains; the next cycle publishes no second clear.
        channel.clear();
        shadow.reconcile().await.unwrap();
        assert_eq!(channel.published_to(UPDATE_TOPIC).len(), 1);
    }

    #[tokio::test]
    async fn delta_for_unknown_group_is_ignored() {
        let channel = Arc::new(MockChannel::new());
        let shadow = reconciler(&channel, vec![TestGroup::new("control", true)]);

        shadow.handle_delta(br#"{"state":{"mystery":{"x":1}}}"#);
        shadow.reconcile().await.unwrap();
        assert_eq!(channel.published_to(UPDATE_TOPIC).len(), 1);
    }

    #[tokio::test]
    async fn connect_subscribes_once_and_requests_the_document() {
        let channel = Arc::new(MockChannel::new());
        let shadow = reconciler(&channel, vec![]);

        shadow.on_connected(false).await.unwrap();
        shadow.on_connected(false).await.unwrap();

        assert_eq!(channel.subscriptions().len(), 3);
        assert_eq!(channel.published_to(GET_TOPIC), vec![b"{}".to_vec()]);

        // A reconnect starts a fresh subscription cycle.
        shadow.on_disconnected();
        shadow.on_connected(false).await.unwrap();
        assert_eq!(channel.subscriptions().len(), 6);
    }

    #[tokio::test]
    async fn failed_subscribe_is_retried_on_the_next_connect_signal() {
        let channel = Arc::new(MockChannel::new());
        let shadow = reconciler(&channel, vec![]);

        channel.set_fail_subscribes(true);
        assert!(shadow.on_connected(false).await.is_err());
        assert!(channel.published_to(GET_TOPIC).is_empty());

        // Same connection, second signal: the cycle must still start.
        channel.set_fail_subscribes(false);
        shadow.on_connected(false).await.unwrap();
        assert_eq!(channel.subscriptions().len(), 3);
        assert_eq!(channel.published_to(GET_TOPIC), vec![b"{}".to_vec()]);

        shadow.on_connected(false).await.unwrap();
        assert_eq!(channel.subscriptions().len(), 3, "established cycle resubscribed");
    }

    #[tokio::test]
    async fn failed_get_does_not_mark_the_cycle_established() {
        let channel = Arc::new(MockChannel::new());
        let shadow = reconciler(&channel, vec![]);

        channel.set_fail_publishes(true);
        assert!(shadow.on_connected(false).await.is_err());

        channel.set_fail_publishes(false);
        shadow.on_connected(false).await.unwrap();
        assert_eq!(channel.published_to(GET_TOPIC), vec![b"{}".to_vec()]);
    }

    #[tokio::test]
    async fn connect_during_provisioning_does_nothing() {
        let channel = Arc::new(MockChannel::new());
        let shadow = reconciler(&channel, vec![]);

        shadow.on_connected(true).await.unwrap();
        assert!(channel.subscriptions().is_empty());
        assert!(channel.publishes().is_empty());
    }

    #[tokio::test]
    async fn server_side_delete_triggers_a_refresh() {
        let channel = Arc::new(MockChannel::new());
        let shadow = reconciler(&channel, vec![]);

        shadow.handle_deleted();
        shadow.reconcile().await.unwrap();
        assert_eq!(channel.published_to(GET_TOPIC), vec![b"{}".to_vec()]);

        channel.clear();
        shadow.reconcile().await.unwrap();
        assert!(channel.published_to(GET_TOPIC).is_empty());
    }

    #[tokio::test]
    async fn missing_shadow_is_created_from_reported_state() {
        let channel = Arc::new(MockChannel::new());
        let shadow = reconciler(&channel, vec![TestGroup::new("telemetry", true)]);

        shadow
            .handle_get_rejected(br#"{"code":404,"message":"No shadow exists"}"#)
            .await
            .unwrap();

        let updates = channel.published_to(UPDATE_TOPIC);
        assert_eq!(updates.len(), 1);
        let doc: Value = serde_json::from_slice(&updates[0]).unwrap();
        assert!(doc.pointer("/state/reported/telemetry").is_some());
    }

    #[tokio::test]
    async fn get_accepted_document_applies_embedded_delta() {
        let channel = Arc::new(MockChannel::new());
        let control = TestGroup::new("control", true);
        let shadow = reconciler(&channel, vec![control.clone()]);

        shadow.handle_document(
            br#"{"state":{"reported":{"control":{}},"delta":{"control":{"mains_hz":50}}}}"#,
        );
        assert_eq!(
            control.applied.lock().unwrap().as_slice(),
            &[serde_json::json!({"mains_hz": 50})]
        );
    }
}
