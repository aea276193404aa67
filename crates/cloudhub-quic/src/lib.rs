//! CloudHub QUIC Protocol Server
//!
//! Serves edge nodes over QUIC with mutual TLS. Each connection carries one
//! bidirectional stream of length-prefixed frames:
//! - the node opens the stream and sends `Register { node_id }`
//! - the hub answers `Registered { session_id }` once the session is recorded
//! - envelopes and keepalive controls follow in both directions

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod adapter;
pub mod server;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use adapter::{read_registration, QuicTransport};
pub use server::QuicServer;
