//! In-process transport
//!
//! A pair of bounded channels standing in for a network connection. The hub
//! side implements [`Transport`]; the [`EdgeEndpoint`] side plays the edge node.
//! Used by embedders that co-locate an edge agent with the hub, and as the edge
//! simulator in tests.

use tokio::sync::mpsc;

use crate::envelope::Envelope;
use crate::errors::{HubError, HubResult};
use crate::frame::{Control, Frame};
use crate::transport::{FrameSink, FrameSource, PeerInfo, Transport};
use crate::types::{NodeId, TransportKind};

const TRANSPORT_NAME: &str = "memory";

/// Create a connected hub-side transport and edge endpoint
pub fn pair(node_id: NodeId, buffer: usize) -> (MemoryTransport, EdgeEndpoint) {
    let (to_edge, from_hub) = mpsc::channel(buffer);
    let (to_hub, from_edge) = mpsc::channel(buffer);

    let transport = MemoryTransport {
        peer: PeerInfo::new(node_id.clone(), TransportKind::Memory, None),
        outgoing: to_edge,
        incoming: from_edge,
    };
    let endpoint = EdgeEndpoint {
        node_id,
        outgoing: Some(to_hub),
        incoming: from_hub,
    };
    (transport, endpoint)
}

// ----------------------------------------------------------------------------
// Hub Side
// ----------------------------------------------------------------------------

/// Hub side of an in-process connection
pub struct MemoryTransport {
    peer: PeerInfo,
    outgoing: mpsc::Sender<Frame>,
    incoming: mpsc::Receiver<Frame>,
}

impl Transport for MemoryTransport {
    fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSource>, Box<dyn FrameSink>) {
        let this = *self;
        (
            Box::new(MemorySource {
                incoming: this.incoming,
            }),
            Box::new(MemorySink {
                outgoing: Some(this.outgoing),
            }),
        )
    }
}

struct MemorySource {
    incoming: mpsc::Receiver<Frame>,
}

#[async_trait::async_trait]
impl FrameSource for MemorySource {
    async fn read_frame(&mut self) -> HubResult<Option<Frame>> {
        Ok(self.incoming.recv().await)
    }
}

struct MemorySink {
    outgoing: Option<mpsc::Sender<Frame>>,
}

#[async_trait::async_trait]
impl FrameSink for MemorySink {
    async fn write_frame(&mut self, frame: Frame) -> HubResult<()> {
        let sender = self
            .outgoing
            .as_ref()
            .ok_or_else(|| HubError::transport(TRANSPORT_NAME, "connection closed"))?;
        sender
            .send(frame)
            .await
            .map_err(|_| HubError::transport(TRANSPORT_NAME, "edge endpoint dropped"))
    }

    async fn close(&mut self) -> HubResult<()> {
        self.outgoing = None;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Edge Side
// ----------------------------------------------------------------------------

/// Edge side of an in-process connection
pub struct EdgeEndpoint {
    node_id: NodeId,
    outgoing: Option<mpsc::Sender<Frame>>,
    incoming: mpsc::Receiver<Frame>,
}

impl EdgeEndpoint {
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Send a raw frame to the hub
    pub async fn send(&self, frame: Frame) -> HubResult<()> {
        let sender = self
            .outgoing
            .as_ref()
            .ok_or_else(|| HubError::transport(TRANSPORT_NAME, "edge side closed"))?;
        sender
            .send(frame)
            .await
            .map_err(|_| HubError::transport(TRANSPORT_NAME, "hub side dropped"))
    }

    /// Send an envelope to the hub
    pub async fn send_envelope(&self, envelope: Envelope) -> HubResult<()> {
        self.send(Frame::message(envelope)).await
    }

    /// Receive the next raw frame; `None` once the hub closed the connection
    pub async fn recv(&mut self) -> Option<Frame> {
        self.incoming.recv().await
    }

    /// Receive the next envelope, answering keepalive pings along the way
    pub async fn next_envelope(&mut self) -> Option<Envelope> {
        while let Some(frame) = self.incoming.recv().await {
            match frame {
                Frame::Message { envelope } => return Some(envelope),
                Frame::Control {
                    control: Control::Ping { seq },
                } => {
                    // Ignore failures: the hub may already be gone
                    let _ = self.send(Frame::pong(seq)).await;
                }
                Frame::Control { .. } => {}
            }
        }
        None
    }

    /// Stop sending; the hub's read loop observes end of stream
    pub fn close(&mut self) {
        self.outgoing = None;
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Operation;

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let node_id = NodeId::new("node-1").unwrap();
        let (transport, mut edge) = pair(node_id.clone(), 4);
        assert_eq!(transport.peer().node_id, node_id);
        assert_eq!(transport.peer().kind, TransportKind::Memory);

        let (mut source, mut sink) = Box::new(transport).split();

        let envelope = Envelope::to_node("cloud", &node_id, Operation::Update, "twin", vec![1]);
        sink.write_frame(Frame::ping(1)).await.unwrap();
        sink.write_frame(Frame::message(envelope.clone()))
            .await
            .unwrap();

        // The ping is answered transparently
        assert_eq!(edge.next_envelope().await, Some(envelope));
        assert_eq!(source.read_frame().await.unwrap(), Some(Frame::pong(1)));

        edge.close();
        assert_eq!(source.read_frame().await.unwrap(), None);

        sink.close().await.unwrap();
        assert!(sink.write_frame(Frame::ping(2)).await.is_err());
        assert_eq!(edge.recv().await, None);
    }
}
