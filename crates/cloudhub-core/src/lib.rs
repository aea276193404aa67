//! CloudHub Core
//!
//! This crate provides the foundational pieces of the cloud-side edge hub:
//! node and message identifiers, the message [`Envelope`], wire [`Frame`]s and
//! their codec, the error taxonomy, configuration structs, TLS credential
//! handling, and the [`Transport`] capability interface implemented by every
//! protocol adapter.
//!
//! The dispatch engine itself (node queues, registry, sessions, supervisor)
//! lives in `cloudhub-runtime`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod envelope;
pub mod errors;
pub mod frame;
pub mod tls;
pub mod transport;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{
    ChannelConfig, CredentialPaths, HubConfig, KeepaliveConfig, QueueConfig, QueueFullPolicy,
    QuicConfig, SessionConfig, SupervisorConfig, WebSocketConfig,
};
pub use envelope::{Envelope, Operation, CLOUD_DESTINATION};
pub use errors::{
    CodecError, ConfigError, CredentialKind, HubError, HubResult, QueueError, SessionError,
};
pub use frame::{Control, Frame};
pub use tls::TlsMaterial;
pub use transport::{FrameSink, FrameSource, PeerInfo, Transport};
pub use types::{MessageId, NodeId, SessionId, Timestamp, TransportKind};
