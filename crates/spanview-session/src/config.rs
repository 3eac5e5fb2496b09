use serde::Deserialize;

use spanview_protocol::frame::DEFAULT_MAX_PAYLOAD;
use spanview_protocol::messages::FecConfig;
use spanview_protocol::types::{DEFAULT_TCP_PORT, DEFAULT_UDP_PORT};

/// Session-layer configuration, shared by both roles. Deserializable from
/// the host's TOML config; every field has a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// TCP port of the host's session listener.
    pub listen_tcp_port: u16,

    /// UDP port of the host's discovery responder.
    pub listen_udp_port: u16,

    /// Wrap WiFi sessions in TLS with the host's self-signed certificate.
    pub tls_enabled: bool,

    /// Require the six-digit pairing code at handshake time.
    pub require_pairing_code: bool,

    /// Reconnect WiFi sessions automatically after transport or heartbeat
    /// failures.
    pub auto_reconnect: bool,

    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub connect_timeout_ms: u64,

    /// Cap on a single message payload.
    pub max_payload_bytes: u32,

    pub scheduler: SchedulerConfig,

    pub abr_min_bps: u32,
    pub abr_max_bps: u32,

    pub fec: FecSettings,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            listen_tcp_port: DEFAULT_TCP_PORT,
            listen_udp_port: DEFAULT_UDP_PORT,
            tls_enabled: true,
            require_pairing_code: false,
            auto_reconnect: true,
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_ms: 15_000,
            handshake_timeout_ms: 5_000,
            connect_timeout_ms: 5_000,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD,
            scheduler: SchedulerConfig::default(),
            abr_min_bps: 500_000,
            abr_max_bps: 20_000_000,
            fec: FecSettings::default(),
        }
    }
}

/// Per-class queue limits for the send scheduler.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub critical_capacity: usize,
    pub media_capacity: usize,
    pub critical_byte_budget: usize,
    pub media_byte_budget: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            critical_capacity: 256,
            media_capacity: 64,
            critical_byte_budget: 1024 * 1024,
            media_byte_budget: 16 * 1024 * 1024,
        }
    }
}

/// FEC parameters plus the group abandonment window.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct FecSettings {
    pub enabled: bool,
    pub data_shards: u8,
    pub parity_shards: u8,
    /// Groups older than the newest minus this are abandoned.
    pub window_groups: u32,
}

impl Default for FecSettings {
    fn default() -> Self {
        Self { enabled: true, data_shards: 8, parity_shards: 2, window_groups: 4 }
    }
}

impl FecSettings {
    /// The wire-announceable part of the settings.
    pub fn to_wire(self) -> FecConfig {
        FecConfig {
            enabled: self.enabled,
            data_shards: self.data_shards,
            parity_shards: self.parity_shards,
        }
    }
}
