use serde::Deserialize;

/// MQTT link configuration, loadable from TOML.
///
/// The broker endpoint, client id, and certificate material come from the
/// identity store, not from here; this covers the tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    /// MQTT broker port (default 8883 for mTLS).
    #[serde(default = "default_port")]
    pub broker_port: u16,
    /// Keep-alive interval in seconds.
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u16,
    /// Default wait for a broker acknowledgement, in milliseconds.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// Base delay for connection retry backoff, in milliseconds.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Maximum delay for connection retry backoff, in milliseconds.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Connection attempts before giving up. `None` retries forever.
    #[serde(default)]
    pub max_connect_attempts: Option<u32>,
    /// Maximum number of subscription table slots.
    #[serde(default = "default_subscription_slots")]
    pub subscription_slots: usize,
    /// Largest MQTT packet accepted in either direction, in bytes.
    /// Must cover a full firmware block plus stream framing.
    #[serde(default = "default_max_packet_bytes")]
    pub max_packet_bytes: usize,
}

fn default_port() -> u16 {
    8883
}

fn default_keepalive() -> u16 {
    60
}

fn default_ack_timeout_ms() -> u64 {
    5_000
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_subscription_slots() -> usize {
    32
}

fn default_max_packet_bytes() -> usize {
    256 * 1024
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            broker_port: default_port(),
            keepalive_secs: default_keepalive(),
            ack_timeout_ms: default_ack_timeout_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            max_connect_attempts: None,
            subscription_slots: default_subscription_slots(),
            max_packet_bytes: default_max_packet_bytes(),
        }
    }
}
