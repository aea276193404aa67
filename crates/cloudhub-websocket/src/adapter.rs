//! WebSocket transport adapter
//!
//! Wraps an upgraded [`WebSocketStream`] as a [`Transport`]:
//! - one JSON [`Frame`] per text or binary message
//! - keepalive pings and pongs map to native WebSocket Ping/Pong messages,
//!   carrying the sequence number as 8 big-endian bytes
//! - a Close message or a closed connection reads as end of stream
//!
//! The adapter is generic over the byte stream so the same code serves TLS
//! connections in production and plain TCP in tests.

use std::net::SocketAddr;

use async_trait::async_trait;
use cloudhub_core::frame::{decode_frame, encode_frame};
use cloudhub_core::{
    CodecError, Control, Frame, FrameSink, FrameSource, HubError, HubResult, NodeId, PeerInfo,
    SessionError, Transport, TransportKind,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig as WsProtocolConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::identity::{node_id_from_request, NODE_ID_HEADER};

const TRANSPORT_NAME: &str = "websocket";

// ----------------------------------------------------------------------------
// Upgrade
// ----------------------------------------------------------------------------

/// Run the WebSocket upgrade on an established stream and bind the node
/// identity named by the request.
///
/// Requests without a valid identity are refused with HTTP 400.
pub async fn accept_websocket<S>(
    stream: S,
    remote_addr: Option<SocketAddr>,
    max_frame_bytes: usize,
) -> Result<WebSocketTransport<S>, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut identity: Option<NodeId> = None;
    let callback = |request: &Request, response: Response| {
        let header = request
            .headers()
            .get(NODE_ID_HEADER)
            .and_then(|value| value.to_str().ok());
        match node_id_from_request(header, request.uri().path()) {
            Ok(node_id) => {
                identity = Some(node_id);
                Ok(response)
            }
            Err(e) => Err(bad_request(e.to_string())),
        }
    };

    let config = WsProtocolConfig {
        max_message_size: Some(max_frame_bytes),
        max_frame_size: Some(max_frame_bytes),
        ..WsProtocolConfig::default()
    };
    let websocket = tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(config))
        .await
        .map_err(|e| SessionError::HandshakeFailed {
            reason: format!("websocket upgrade failed: {}", e),
        })?;

    let node_id = identity.ok_or_else(|| SessionError::HandshakeFailed {
        reason: "upgrade completed without a node identity".to_string(),
    })?;

    debug!("WebSocket upgrade complete for node {}", node_id);
    Ok(WebSocketTransport::new(
        websocket,
        PeerInfo::new(node_id, TransportKind::WebSocket, remote_addr),
        max_frame_bytes,
    ))
}

fn bad_request(reason: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

// ----------------------------------------------------------------------------
// Transport
// ----------------------------------------------------------------------------

/// An upgraded WebSocket connection bound to one node
pub struct WebSocketTransport<S> {
    websocket: WebSocketStream<S>,
    peer: PeerInfo,
    max_frame_bytes: usize,
}

impl<S> WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(websocket: WebSocketStream<S>, peer: PeerInfo, max_frame_bytes: usize) -> Self {
        Self {
            websocket,
            peer,
            max_frame_bytes,
        }
    }
}

impl<S> Transport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSource>, Box<dyn FrameSink>) {
        let this = *self;
        let (sink, stream) = this.websocket.split();
        (
            Box::new(WebSocketSource {
                stream,
                max_frame_bytes: this.max_frame_bytes,
            }),
            Box::new(WebSocketSink {
                sink,
                max_frame_bytes: this.max_frame_bytes,
            }),
        )
    }
}

struct WebSocketSource<S> {
    stream: SplitStream<WebSocketStream<S>>,
    max_frame_bytes: usize,
}

#[async_trait]
impl<S> FrameSource for WebSocketSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn read_frame(&mut self) -> HubResult<Option<Frame>> {
        loop {
            let message = match self.stream.next().await {
                None => return Ok(None),
                Some(Ok(message)) => message,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => return Ok(None),
                Some(Err(e)) => return Err(HubError::transport(TRANSPORT_NAME, e.to_string())),
            };

            match message {
                Message::Text(text) => return self.decode(text.as_bytes()).map(Some),
                Message::Binary(bytes) => return self.decode(&bytes).map(Some),
                Message::Ping(data) => return Ok(Some(Frame::ping(sequence_from(&data)))),
                Message::Pong(data) => return Ok(Some(Frame::pong(sequence_from(&data)))),
                Message::Close(_) => return Ok(None),
                Message::Frame(_) => continue,
            }
        }
    }
}

impl<S> WebSocketSource<S> {
    fn decode(&self, bytes: &[u8]) -> HubResult<Frame> {
        if bytes.len() > self.max_frame_bytes {
            return Err(CodecError::FrameTooLarge {
                size: bytes.len(),
                max: self.max_frame_bytes,
            }
            .into());
        }
        Ok(decode_frame(bytes)?)
    }
}

struct WebSocketSink<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
    max_frame_bytes: usize,
}

#[async_trait]
impl<S> FrameSink for WebSocketSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn write_frame(&mut self, frame: Frame) -> HubResult<()> {
        let message = match frame {
            Frame::Control {
                control: Control::Ping { seq },
            } => Message::Ping(seq.to_be_bytes().to_vec()),
            Frame::Control {
                control: Control::Pong { seq },
            } => Message::Pong(seq.to_be_bytes().to_vec()),
            other => {
                let bytes = encode_frame(&other)?;
                if bytes.len() > self.max_frame_bytes {
                    return Err(CodecError::FrameTooLarge {
                        size: bytes.len(),
                        max: self.max_frame_bytes,
                    }
                    .into());
                }
                let text = String::from_utf8(bytes)
                    .map_err(|e| HubError::transport(TRANSPORT_NAME, e.to_string()))?;
                Message::Text(text)
            }
        };

        self.sink
            .send(message)
            .await
            .map_err(|e| HubError::transport(TRANSPORT_NAME, e.to_string()))
    }

    async fn close(&mut self) -> HubResult<()> {
        match self.sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(HubError::transport(TRANSPORT_NAME, e.to_string())),
        }
    }
}

/// Keepalive sequence carried in a Ping/Pong payload; 0 if absent
fn sequence_from(data: &[u8]) -> u64 {
    data.get(..8)
        .and_then(|bytes| <[u8; 8]>::try_from(bytes).ok())
        .map(u64::from_be_bytes)
        .unwrap_or(0)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
