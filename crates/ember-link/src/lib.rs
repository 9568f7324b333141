//! Durable MQTT connectivity for fleet devices.
//!
//! One broker session shared by every feature: a connection manager
//! drives the event loop, a bounded dispatcher fans inbound messages out
//! to registered handlers, and an ack tracker lets callers publish or
//! subscribe with a chosen acknowledgement policy.

pub mod acks;
pub mod backoff;
pub mod channel;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod mock;
pub mod tls;

pub use channel::{AckPolicy, Channel, QoS};
pub use config::LinkConfig;
pub use connection::{ConnectionManager, LinkCredentials, LinkEvent, LinkState};
pub use dispatch::{MessageHandler, SubscriptionDispatcher};
pub use error::{LinkError, LinkResult};
pub use mock::MockChannel;
pub use tls::TlsMaterial;
