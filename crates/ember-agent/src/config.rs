//! Agent configuration, loaded from a TOML file shipped with the unit.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use ember_link::LinkConfig;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Directory holding the identity manifest and PEM files.
    pub identity_dir: PathBuf,
    /// Named shadow to reconcile; empty selects the classic shadow.
    #[serde(default)]
    pub shadow_name: String,
    /// Seconds between outgoing shadow reconciliation cycles.
    #[serde(default = "default_reconcile_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub ota: OtaConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtaConfig {
    /// Number of block buffers set aside for firmware streaming.
    #[serde(default = "default_buffer_slots")]
    pub buffer_slots: usize,
    /// Size of one firmware block buffer in bytes.
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// Retry interval while waiting for a free buffer, in milliseconds.
    #[serde(default = "default_acquire_retry_ms")]
    pub acquire_retry_ms: u64,
}

fn default_reconcile_secs() -> u64 {
    30
}

fn default_buffer_slots() -> usize {
    4
}

fn default_block_size() -> usize {
    4096
}

fn default_acquire_retry_ms() -> u64 {
    100
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            buffer_slots: default_buffer_slots(),
            block_size: default_block_size(),
            acquire_retry_ms: default_acquire_retry_ms(),
        }
    }
}

impl AgentConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }
}
