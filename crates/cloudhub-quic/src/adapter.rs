//! QUIC stream transport adapter
//!
//! A registered QUIC connection is reduced to the read and write halves of its
//! single bidirectional stream. Frames travel length-prefixed (big-endian `u32`
//! followed by the JSON body). The halves are generic byte streams, so the
//! adapter is exercised over in-memory pipes in tests and over
//! `quinn::{RecvStream, SendStream}` in production.

use async_trait::async_trait;
use cloudhub_core::frame::{read_prefixed_frame, write_prefixed_frame};
use cloudhub_core::{
    Control, Frame, FrameSink, FrameSource, HubResult, NodeId, PeerInfo, SessionError,
    SessionId, Transport,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

// ----------------------------------------------------------------------------
// Registration
// ----------------------------------------------------------------------------

/// Read the registration frame that must open every stream and return the
/// node identity it announces
pub async fn read_registration<R>(
    reader: &mut R,
    max_frame_bytes: usize,
) -> Result<NodeId, SessionError>
where
    R: AsyncRead + Unpin,
{
    let frame = read_prefixed_frame(reader, max_frame_bytes)
        .await
        .map_err(|e| SessionError::HandshakeFailed {
            reason: format!("unreadable registration frame: {}", e),
        })?;

    match frame {
        Some(Frame::Control {
            control: Control::Register { node_id },
        }) => {
            let node_id = NodeId::new(node_id)?;
            debug!("QUIC registration received for node {}", node_id);
            Ok(node_id)
        }
        Some(other) => Err(SessionError::HandshakeFailed {
            reason: format!("expected a register frame, got {}", other.kind_name()),
        }),
        None => Err(SessionError::HandshakeFailed {
            reason: "stream closed before registration".to_string(),
        }),
    }
}

// ----------------------------------------------------------------------------
// Transport
// ----------------------------------------------------------------------------

/// A registered stream bound to one node
pub struct QuicTransport<R, W> {
    reader: R,
    writer: W,
    peer: PeerInfo,
    max_frame_bytes: usize,
}

impl<R, W> QuicTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W, peer: PeerInfo, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            writer,
            peer,
            max_frame_bytes,
        }
    }
}

impl<R, W> Transport for QuicTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    fn registration_ack(&self, session_id: SessionId) -> Option<Frame> {
        Some(Frame::control(Control::Registered { session_id }))
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSource>, Box<dyn FrameSink>) {
        let this = *self;
        (
            Box::new(StreamSource {
                reader: this.reader,
                max_frame_bytes: this.max_frame_bytes,
            }),
            Box::new(StreamSink {
                writer: this.writer,
                max_frame_bytes: this.max_frame_bytes,
            }),
        )
    }
}

struct StreamSource<R> {
    reader: R,
    max_frame_bytes: usize,
}

#[async_trait]
impl<R> FrameSource for StreamSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read_frame(&mut self) -> HubResult<Option<Frame>> {
        Ok(read_prefixed_frame(&mut self.reader, self.max_frame_bytes).await?)
    }
}

struct StreamSink<W> {
    writer: W,
    max_frame_bytes: usize,
}

#[async_trait]
impl<W> FrameSink for StreamSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_frame(&mut self, frame: Frame) -> HubResult<()> {
        Ok(write_prefixed_frame(&mut self.writer, &frame, self.max_frame_bytes).await?)
    }

    async fn close(&mut self) -> HubResult<()> {
        // Finishes the send side; the peer reads a clean end of stream
        match self.writer.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use cloudhub_core::frame::DEFAULT_MAX_FRAME_BYTES;
    use cloudhub_core::{Envelope, Operation, TransportKind};

    async fn registration_from(frames: &[Frame]) -> Result<NodeId, SessionError> {
        let (mut edge, mut hub) = tokio::io::duplex(64 * 1024);
        for frame in frames {
            write_prefixed_frame(&mut edge, frame, DEFAULT_MAX_FRAME_BYTES)
                .await
                .unwrap();
        }
        drop(edge);
        read_registration(&mut hub, DEFAULT_MAX_FRAME_BYTES).await
    }

    #[tokio::test]
    async fn test_register_frame_names_the_node() {
        let frame = Frame::control(Control::Register {
            node_id: "edge-7".to_string(),
        });
        let node_id = registration_from(&[frame]).await.unwrap();
        assert_eq!(node_id.as_str(), "edge-7");
    }

    #[tokio::test]
    async fn test_non_register_first_frame_is_rejected() {
        let result = registration_from(&[Frame::ping(1)]).await;
        assert!(matches!(result, Err(SessionError::HandshakeFailed { .. })));

        let envelope = Envelope::to_cloud("edge-7", Operation::Insert, "twin", vec![]);
        let result = registration_from(&[Frame::message(envelope)]).await;
        assert!(matches!(result, Err(SessionError::HandshakeFailed { .. })));
    }

    #[tokio::test]
    async fn test_empty_stream_and_bad_identity_are_rejected() {
        assert!(matches!(
            registration_from(&[]).await,
            Err(SessionError::HandshakeFailed { .. })
        ));

        let frame = Frame::control(Control::Register {
            node_id: String::new(),
        });
        assert!(matches!(
            registration_from(&[frame]).await,
            Err(SessionError::InvalidNodeId { .. })
        ));
    }

    #[tokio::test]
    async fn test_sink_and_source_share_the_prefixed_codec() {
        let (hub_side, edge_side) = tokio::io::duplex(64 * 1024);
        let (hub_read, hub_write) = tokio::io::split(hub_side);
        let (mut edge_read, mut edge_write) = tokio::io::split(edge_side);

        let peer = PeerInfo::new(NodeId::new("edge-7").unwrap(), TransportKind::Quic, None);
        let transport = QuicTransport::new(hub_read, hub_write, peer, DEFAULT_MAX_FRAME_BYTES);
        assert_eq!(
            transport.registration_ack(SessionId::new(3)),
            Some(Frame::control(Control::Registered {
                session_id: SessionId::new(3)
            }))
        );
        let (mut source, mut sink) = Box::new(transport).split();

        sink.write_frame(Frame::ping(9)).await.unwrap();
        let received = read_prefixed_frame(&mut edge_read, DEFAULT_MAX_FRAME_BYTES)
            .await
            .unwrap();
        assert_eq!(received, Some(Frame::ping(9)));

        write_prefixed_frame(&mut edge_write, &Frame::pong(9), DEFAULT_MAX_FRAME_BYTES)
            .await
            .unwrap();
        assert_eq!(source.read_frame().await.unwrap(), Some(Frame::pong(9)));

        sink.close().await.unwrap();
        let after_close = read_prefixed_frame(&mut edge_read, DEFAULT_MAX_FRAME_BYTES)
            .await
            .unwrap();
        assert_eq!(after_close, None);
    }
}
