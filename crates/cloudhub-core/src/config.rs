//! Configuration types for the CloudHub
//!
//! Every struct deserializes with `#[serde(default)]`, so a configuration file
//! only needs to name the values it changes. Durations are stored as integer
//! milliseconds/seconds like the rest of the wire-facing configuration and
//! exposed as [`Duration`] through accessor methods.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::frame::DEFAULT_MAX_FRAME_BYTES;

/// Default location of the CA certificate used to verify edge nodes
pub const DEFAULT_CA_FILE: &str = "/etc/cloudhub/ca/rootCA.crt";
/// Default location of the hub's certificate chain
pub const DEFAULT_CERT_FILE: &str = "/etc/cloudhub/certs/server.crt";
/// Default location of the hub's private key
pub const DEFAULT_KEY_FILE: &str = "/etc/cloudhub/certs/server.key";

// ----------------------------------------------------------------------------
// Hub Configuration
// ----------------------------------------------------------------------------

/// Complete configuration of one hub process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Per-node queue bounds
    pub queue: QueueConfig,
    /// Session lifecycle settings
    pub session: SessionConfig,
    /// Liveness probing
    pub keepalive: KeepaliveConfig,
    /// Cloud-side channel sizes
    pub channels: ChannelConfig,
    /// WebSocket protocol server
    pub websocket: WebSocketConfig,
    /// QUIC protocol server
    pub quic: QuicConfig,
    /// Credential file locations
    pub credentials: CredentialPaths,
    /// Supervisor settings
    pub supervisor: SupervisorConfig,
}

impl HubConfig {
    /// Reject configurations that cannot work
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.queue.validate()?;
        self.keepalive.validate()?;

        if self.session.node_limit == 0 {
            return Err(ConfigError::Invalid {
                reason: "session.node_limit must be at least 1".to_string(),
            });
        }
        if self.channels.ingress_buffer_size == 0 || self.channels.cloud_sink_buffer_size == 0 {
            return Err(ConfigError::Invalid {
                reason: "channel buffer sizes must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Names of the enabled protocol servers
    pub fn enabled_transports(&self) -> Vec<&'static str> {
        let mut enabled = Vec::new();
        if self.websocket.enabled {
            enabled.push("websocket");
        }
        if self.quic.enabled {
            enabled.push("quic");
        }
        enabled
    }
}

// ----------------------------------------------------------------------------
// Queue Configuration
// ----------------------------------------------------------------------------

/// What a node queue does when a send would exceed its bounds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueFullPolicy {
    /// Refuse the new envelope with `QueueFull`
    #[default]
    RejectNewest,
    /// Evict the oldest buffered envelopes to make room
    DropOldest,
}

/// Bounds applied to every node queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of outbound envelopes buffered per node
    pub capacity: usize,
    /// Optional limit on the total size of buffered outbound envelopes
    pub max_bytes: Option<usize>,
    /// Maximum number of inbound envelopes buffered per node
    pub inbound_capacity: usize,
    /// Behaviour when the outbound buffer is full
    pub full_policy: QueueFullPolicy,
    /// Outbound envelopes older than this are discarded instead of delivered
    pub retention_secs: Option<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            max_bytes: Some(16 * 1024 * 1024),
            inbound_capacity: 256,
            full_policy: QueueFullPolicy::RejectNewest,
            retention_secs: Some(24 * 60 * 60),
        }
    }
}

impl QueueConfig {
    /// Bounds with a fixed count capacity and no byte budget or retention
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            max_bytes: None,
            retention_secs: None,
            ..Self::default()
        }
    }

    pub fn retention(&self) -> Option<Duration> {
        self.retention_secs.map(Duration::from_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 || self.inbound_capacity == 0 {
            return Err(ConfigError::Invalid {
                reason: "queue capacities must be at least 1".to_string(),
            });
        }
        if self.max_bytes == Some(0) {
            return Err(ConfigError::Invalid {
                reason: "queue.max_bytes must be positive when set".to_string(),
            });
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Session Configuration
// ----------------------------------------------------------------------------

/// Session lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum number of simultaneously connected nodes
    pub node_limit: usize,
    /// Time allowed for TLS + protocol handshake
    pub handshake_timeout_ms: u64,
    /// Time allowed for a single frame write
    pub write_timeout_ms: u64,
    /// Time a superseding registration waits for the old session to close
    pub close_timeout_ms: u64,
    /// Buffer for control replies queued by the read loop
    pub control_buffer_size: usize,
    /// Upper bound on a single encoded frame
    pub max_frame_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            node_limit: 1000,
            handshake_timeout_ms: 10_000,
            write_timeout_ms: 30_000,
            close_timeout_ms: 5_000,
            control_buffer_size: 16,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl SessionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

/// Liveness probing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// Interval between pings
    pub interval_ms: u64,
    /// Silence after which a session is considered dead
    pub timeout_ms: u64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            timeout_ms: 90_000,
        }
    }
}

impl KeepaliveConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_ms == 0 || self.timeout_ms < self.interval_ms {
            return Err(ConfigError::Invalid {
                reason: "keepalive.interval_ms must be positive and not exceed timeout_ms"
                    .to_string(),
            });
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Channel Configuration
// ----------------------------------------------------------------------------

/// Sizes of the channels between cloud components and the hub
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Buffer size of the shared ingress stream (cloud components → dispatcher)
    pub ingress_buffer_size: usize,
    /// Buffer size of the cloud sink (sessions → cloud components)
    pub cloud_sink_buffer_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            ingress_buffer_size: 1024, // Cloud producers can be bursty
            cloud_sink_buffer_size: 1024,
        }
    }
}

// ----------------------------------------------------------------------------
// Protocol Server Configuration
// ----------------------------------------------------------------------------

/// WebSocket protocol server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    pub enabled: bool,
    /// Listen address
    pub address: String,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: "0.0.0.0:10000".to_string(),
        }
    }
}

/// QUIC protocol server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuicConfig {
    pub enabled: bool,
    /// Listen address
    pub address: String,
    /// Connection idle timeout enforced by the QUIC stack
    pub max_idle_timeout_ms: u64,
    /// ALPN protocol identifiers offered to edge nodes
    pub alpn: Vec<String>,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: "0.0.0.0:10001".to_string(),
            max_idle_timeout_ms: 120_000,
            alpn: vec!["cloudhub".to_string()],
        }
    }
}

impl QuicConfig {
    pub fn max_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.max_idle_timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// Credentials and Supervisor
// ----------------------------------------------------------------------------

/// Locations of the credential files; unset entries fall back to the defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialPaths {
    pub ca: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

/// Hub supervisor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Time allowed for background tasks to stop before they are aborted
    pub shutdown_timeout_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl SupervisorConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = HubConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.enabled_transports(), vec!["websocket"]);
        assert_eq!(config.queue.full_policy, QueueFullPolicy::RejectNewest);
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let config: HubConfig = serde_json::from_str(
            r#"{"queue":{"capacity":8,"full_policy":"drop_oldest"},"quic":{"enabled":true}}"#,
        )
        .unwrap();

        assert_eq!(config.queue.capacity, 8);
        assert_eq!(config.queue.full_policy, QueueFullPolicy::DropOldest);
        assert_eq!(config.queue.inbound_capacity, 256);
        assert!(config.quic.enabled);
        assert!(config.websocket.enabled);
        assert_eq!(config.enabled_transports(), vec!["websocket", "quic"]);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = HubConfig::default();
        config.queue.capacity = 0;
        assert!(config.validate().is_err());

        let mut config = HubConfig::default();
        config.keepalive.timeout_ms = config.keepalive.interval_ms - 1;
        assert!(config.validate().is_err());

        let mut config = HubConfig::default();
        config.session.node_limit = 0;
        assert!(config.validate().is_err());
    }
}
