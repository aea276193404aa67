//! Transport Capability Interface
//!
//! Defines the narrow interface a session needs from a connection: read a
//! frame, write a frame, close, and the authenticated peer identity. Concrete
//! adapters live in their respective crates (`cloudhub-websocket`,
//! `cloudhub-quic`); the in-process [`memory`] adapter lives here.
//!
//! A transport is split into an independent reader and writer before a session
//! starts so the read loop and the write loop each own their half exclusively.

use std::net::SocketAddr;

use crate::errors::HubResult;
use crate::frame::Frame;
use crate::types::{NodeId, SessionId, TransportKind};

pub mod memory;

// ----------------------------------------------------------------------------
// Peer Information
// ----------------------------------------------------------------------------

/// Identity established by a transport handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Authenticated node identity
    pub node_id: NodeId,
    /// Transport the connection runs over
    pub kind: TransportKind,
    /// Remote socket address, when the transport has one
    pub remote_addr: Option<SocketAddr>,
}

impl PeerInfo {
    pub fn new(node_id: NodeId, kind: TransportKind, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            node_id,
            kind,
            remote_addr,
        }
    }
}

// ----------------------------------------------------------------------------
// Transport Traits
// ----------------------------------------------------------------------------

/// Read half of a transport
#[async_trait::async_trait]
pub trait FrameSource: Send {
    /// Read the next frame.
    ///
    /// Returns `Ok(None)` when the peer closed the connection in an orderly way.
    async fn read_frame(&mut self) -> HubResult<Option<Frame>>;
}

/// Write half of a transport
#[async_trait::async_trait]
pub trait FrameSink: Send {
    /// Write one frame and flush it to the connection
    async fn write_frame(&mut self, frame: Frame) -> HubResult<()>;

    /// Close the connection, releasing the underlying handle
    async fn close(&mut self) -> HubResult<()>;
}

/// An authenticated connection to one edge node
pub trait Transport: Send {
    /// Identity established during the handshake
    fn peer(&self) -> &PeerInfo;

    /// Frame acknowledging a successful registration, for protocols whose
    /// handshake expects one. Written before any queued envelope.
    fn registration_ack(&self, _session_id: SessionId) -> Option<Frame> {
        None
    }

    /// Split into independently owned read and write halves
    fn split(self: Box<Self>) -> (Box<dyn FrameSource>, Box<dyn FrameSink>);
}
