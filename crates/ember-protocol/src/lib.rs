//! Shared wire types for the Emberlink device agent (edge + cloud).
//!
//! Pure data and pure functions only: topic builders for the AWS-IoT-style
//! topic space, MQTT wildcard filter matching, and the JSON documents
//! exchanged during fleet provisioning, shadow reconciliation, and OTA
//! job delivery.

pub mod filters;
pub mod jobs;
pub mod provisioning;
pub mod shadows;
pub mod topics;

pub use filters::topic_matches;
pub use jobs::*;
pub use provisioning::*;
pub use shadows::*;
