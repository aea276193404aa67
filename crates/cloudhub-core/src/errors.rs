//! Error types for the CloudHub
//!
//! This module contains the error taxonomy shared by the whole workspace:
//! configuration errors (fatal at startup), queue errors (surfaced to the
//! producer), session errors (local to one connection), codec errors, and the
//! `HubError` type that unifies them all.

use std::path::PathBuf;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Errors raised while loading or validating configuration and credentials
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read credential material: {}", format_missing(.missing))]
    MissingCredentials { missing: Vec<MissingCredential> },
    #[error("Credential {kind} is empty")]
    EmptyCredential { kind: CredentialKind },
    #[error("Invalid {kind} material: {reason}")]
    InvalidCredential { kind: CredentialKind, reason: String },
    #[error("TLS configuration rejected: {0}")]
    Tls(#[from] rustls::Error),
    #[error("Invalid configuration: {reason}")]
    Invalid { reason: String },
}

/// Which of the three credential blobs an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    CaCertificate,
    ServerCertificate,
    PrivateKey,
}

impl std::fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialKind::CaCertificate => write!(f, "CA certificate"),
            CredentialKind::ServerCertificate => write!(f, "server certificate"),
            CredentialKind::PrivateKey => write!(f, "private key"),
        }
    }
}

/// One unreadable credential file
#[derive(Debug)]
pub struct MissingCredential {
    pub kind: CredentialKind,
    pub path: PathBuf,
    pub source: std::io::Error,
}

fn format_missing(missing: &[MissingCredential]) -> String {
    missing
        .iter()
        .map(|m| format!("{} at {}: {}", m.kind, m.path.display(), m.source))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors returned by node queue operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Queue for node {node_id} is full (capacity: {capacity}, bytes: {bytes})")]
    Full {
        node_id: String,
        capacity: usize,
        bytes: usize,
    },
    #[error("Queue for node {node_id} is closed")]
    Closed { node_id: String },
}

/// Errors local to a single session; they tear down that session only
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Handshake failed: {reason}")]
    HandshakeFailed { reason: String },
    #[error("Handshake timed out after {duration_ms}ms")]
    HandshakeTimeout { duration_ms: u64 },
    #[error("Invalid node id {node_id:?}: {reason}")]
    InvalidNodeId { node_id: String, reason: String },
    #[error("Read failed for node {node_id}: {reason}")]
    ReadFailed { node_id: String, reason: String },
    #[error("Write failed for node {node_id}: {reason}")]
    WriteFailed { node_id: String, reason: String },
    #[error("Write to node {node_id} timed out after {duration_ms}ms")]
    WriteTimeout { node_id: String, duration_ms: u64 },
    #[error("Keepalive timeout for node {node_id}: no traffic for {elapsed_ms}ms")]
    KeepaliveTimeout { node_id: String, elapsed_ms: u64 },
    #[error("Node limit reached: {current}/{limit} nodes connected")]
    NodeLimitReached { current: usize, limit: usize },
    #[error("Session for node {node_id} did not close within {duration_ms}ms")]
    CloseTimeout { node_id: String, duration_ms: u64 },
}

/// Errors produced while encoding or decoding wire frames
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("Frame I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ----------------------------------------------------------------------------
// Hub Error
// ----------------------------------------------------------------------------

/// Main error type for the CloudHub
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Transport error ({transport}): {reason}")]
    Transport { transport: String, reason: String },

    #[error("Channel error: {message}")]
    Channel { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HubError {
    /// Create a transport error
    pub fn transport(transport: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transport {
            transport: transport.into(),
            reason: reason.into(),
        }
    }

    /// Create a channel error
    pub fn channel(message: impl Into<String>) -> Self {
        Self::Channel {
            message: message.into(),
        }
    }

    /// True for the queue-full rejection a producer may want to retry
    pub fn is_queue_full(&self) -> bool {
        matches!(self, HubError::Queue(QueueError::Full { .. }))
    }
}

/// Result type for hub operations
pub type HubResult<T> = Result<T, HubError>;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_credentials_lists_every_file() {
        let err = ConfigError::MissingCredentials {
            missing: vec![
                MissingCredential {
                    kind: CredentialKind::CaCertificate,
                    path: PathBuf::from("/nope/ca.crt"),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                },
                MissingCredential {
                    kind: CredentialKind::PrivateKey,
                    path: PathBuf::from("/nope/server.key"),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                },
            ],
        };

        let message = err.to_string();
        assert!(message.contains("CA certificate at /nope/ca.crt"));
        assert!(message.contains("private key at /nope/server.key"));
    }

    #[test]
    fn test_queue_full_detection() {
        let err: HubError = QueueError::Full {
            node_id: "n1".to_string(),
            capacity: 4,
            bytes: 0,
        }
        .into();
        assert!(err.is_queue_full());

        let err: HubError = QueueError::Closed {
            node_id: "n1".to_string(),
        }
        .into();
        assert!(!err.is_queue_full());
    }
}
