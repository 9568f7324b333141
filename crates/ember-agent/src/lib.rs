//! Device-side connectivity agent for Emberlink heating appliances.
//!
//! Embeds in the firmware as a library: the application supplies the
//! identity store, restart hook, image PAL, OTA block codec, and config
//! groups, then drives [`agent::DeviceAgent::run`] on its runtime. One
//! durable MQTT session carries fleet provisioning, firmware jobs, and
//! shadow reconciliation.

pub mod agent;
pub mod buffers;
pub mod config;
pub mod error;
pub mod identity;
pub mod ota;
pub mod provisioning;
pub mod shadow;

pub use agent::DeviceAgent;
pub use buffers::{BufferLease, BufferPool};
pub use config::{AgentConfig, OtaConfig};
pub use error::{AgentError, AgentResult};
pub use identity::{FileIdentityStore, Identity, IdentityStore, MemoryIdentityStore};
pub use ota::{BlockSink, ImagePal, ImageState, OtaCoordinator, OtaEvent, OtaJobState};
pub use provisioning::{
    DeviceControl, LinkControl, ProvisioningCoordinator, ProvisioningState,
};
pub use shadow::{ConfigApply, ConfigGroup, ShadowReconciler};
