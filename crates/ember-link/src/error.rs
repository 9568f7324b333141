//! Link error types.

use thiserror::Error;

/// Errors that can occur in the MQTT coordination layer.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("connection retry budget exhausted after {0} attempts")]
    RetriesExhausted(u32),

    #[error("connection lost while waiting for acknowledgement")]
    ConnectionLost,

    #[error("not connected")]
    NotConnected,

    #[error("timed out waiting for acknowledgement")]
    AckTimeout,

    #[error("publish error: {0}")]
    Publish(String),

    #[error("subscribe error: {0}")]
    Subscribe(String),

    #[error("subscription table exhausted ({0} slots)")]
    SubscriptionsFull(usize),

    #[error("TLS error: {0}")]
    Tls(String),
}

/// Convenience alias for link results.
pub type LinkResult<T> = Result<T, LinkError>;

impl LinkError {
    /// Whether the operation that produced this error is worth retrying
    /// on the same or a re-established session. Table exhaustion only
    /// clears when a slot is unregistered, so retrying it blindly spins.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LinkError::SubscriptionsFull(_))
    }
}
