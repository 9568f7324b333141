//! Transport-agnostic command surface.
//!
//! Agent components talk to the broker through [`Channel`] so tests can
//! substitute the recording mock for a live connection.

use std::time::Duration;

use async_trait::async_trait;
pub use rumqttc::QoS;

use crate::error::LinkResult;

/// How long a QoS 1 command waits for its acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    /// Enqueue and return without waiting.
    NoWait,
    /// Wait up to the configured default ack timeout.
    Default,
    /// Wait up to the given duration.
    Within(Duration),
    /// Reissue the command until the broker accepts it or the session
    /// is torn down, riding out disconnects and rejected acks. Used for
    /// provisioning and the gating feature subscriptions, where giving
    /// up has no useful fallback.
    Forever,
}

#[async_trait]
pub trait Channel: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        ack: AckPolicy,
    ) -> LinkResult<()>;

    async fn subscribe(&self, filters: &[&str], qos: QoS, ack: AckPolicy) -> LinkResult<()>;

    async fn unsubscribe(&self, filters: &[&str], ack: AckPolicy) -> LinkResult<()>;
}
