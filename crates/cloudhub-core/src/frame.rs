//! Wire frames and codec
//!
//! Every frame on the wire carries exactly one envelope or one protocol-internal
//! control message. Frames are JSON documents; message-oriented transports
//! (WebSocket) send one frame per message, stream transports (QUIC) prefix each
//! frame with its length as a big-endian `u32`.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::envelope::Envelope;
use crate::errors::CodecError;
use crate::types::SessionId;

/// Default upper bound for a single encoded frame
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

// ----------------------------------------------------------------------------
// Frame Types
// ----------------------------------------------------------------------------

/// One unit on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Frame {
    /// Application envelope
    Message { envelope: Envelope },
    /// Protocol-internal control message
    Control { control: Control },
}

/// Protocol-internal control messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Control {
    /// Liveness check
    Ping { seq: u64 },
    /// Answer to a liveness check
    Pong { seq: u64 },
    /// First frame of a stream transport: the node announces its identity
    Register { node_id: String },
    /// Hub acknowledgement of a registration
    Registered { session_id: SessionId },
}

impl Frame {
    pub fn message(envelope: Envelope) -> Self {
        Frame::Message { envelope }
    }

    pub fn control(control: Control) -> Self {
        Frame::Control { control }
    }

    pub fn ping(seq: u64) -> Self {
        Frame::control(Control::Ping { seq })
    }

    pub fn pong(seq: u64) -> Self {
        Frame::control(Control::Pong { seq })
    }

    /// Short name used in logs
    pub fn kind_name(&self) -> &'static str {
        match self {
            Frame::Message { .. } => "message",
            Frame::Control { control } => match control {
                Control::Ping { .. } => "ping",
                Control::Pong { .. } => "pong",
                Control::Register { .. } => "register",
                Control::Registered { .. } => "registered",
            },
        }
    }
}

// ----------------------------------------------------------------------------
// Codec
// ----------------------------------------------------------------------------

/// Encode a frame into its JSON body
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(frame)?)
}

/// Decode a JSON body into a frame
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, CodecError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Write one length-prefixed frame to a byte stream
pub async fn write_prefixed_frame<W>(
    writer: &mut W,
    frame: &Frame,
    max_frame_bytes: usize,
) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let body = encode_frame(frame)?;
    if body.len() > max_frame_bytes || body.len() > u32::MAX as usize {
        return Err(CodecError::FrameTooLarge {
            size: body.len(),
            max: max_frame_bytes,
        });
    }

    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame from a byte stream.
///
/// Returns `Ok(None)` when the stream ends at a frame boundary.
pub async fn read_prefixed_frame<R>(
    reader: &mut R,
    max_frame_bytes: usize,
) -> Result<Option<Frame>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if len > max_frame_bytes {
        return Err(CodecError::FrameTooLarge {
            size: len,
            max: max_frame_bytes,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode_frame(&body).map(Some)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Operation;
    use crate::types::Timestamp;

    #[test]
    fn test_control_frame_shape() {
        let json = serde_json::to_value(Frame::ping(7)).unwrap();
        assert_eq!(json["kind"], "control");
        assert_eq!(json["control"]["type"], "ping");
        assert_eq!(json["control"]["seq"], 7);

        let register: Frame = serde_json::from_str(
            r#"{"kind":"control","control":{"type":"register","node_id":"edge-1"}}"#,
        )
        .unwrap();
        assert_eq!(
            register,
            Frame::control(Control::Register {
                node_id: "edge-1".to_string()
            })
        );
    }

    #[test]
    fn test_malformed_frame_is_rejected() {
        assert!(matches!(
            decode_frame(b"{\"kind\":\"bogus\"}"),
            Err(CodecError::Malformed(_))
        ));
        assert!(decode_frame(b"not json").is_err());
    }

    #[tokio::test]
    async fn test_prefixed_frames_over_stream() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let envelope = Envelope::to_cloud("node-1", Operation::Insert, "pod/status", b"up".to_vec())
            .with_timestamp(Timestamp::new(5));

        write_prefixed_frame(&mut client, &Frame::message(envelope.clone()), 1024)
            .await
            .unwrap();
        write_prefixed_frame(&mut client, &Frame::pong(3), 1024)
            .await
            .unwrap();
        drop(client);

        let first = read_prefixed_frame(&mut server, 1024).await.unwrap();
        assert_eq!(first, Some(Frame::message(envelope)));
        let second = read_prefixed_frame(&mut server, 1024).await.unwrap();
        assert_eq!(second, Some(Frame::pong(3)));
        let end = read_prefixed_frame(&mut server, 1024).await.unwrap();
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn test_oversized_frames_are_refused() {
        let big = Envelope::to_cloud("node-1", Operation::Upload, "blob", vec![0u8; 4096]);
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        let err = write_prefixed_frame(&mut client, &Frame::message(big), 512)
            .await
            .unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { max: 512, .. }));

        // A peer announcing a huge frame is rejected before allocating it
        client.write_u32(10_000).await.unwrap();
        let err = read_prefixed_frame(&mut server, 512).await.unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { size: 10_000, .. }));
    }
}
