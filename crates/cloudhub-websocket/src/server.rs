//! WebSocket Protocol Server
//!
//! TCP listener → TLS (client certificate required) → WebSocket upgrade →
//! [`Session`](cloudhub_runtime::Session). Each connection is handshaken on
//! its own task, bounded by the session handshake timeout, so a slow client
//! never stalls the accept loop.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use cloudhub_core::{
    HubError, HubResult, SessionError, Transport, TransportKind, WebSocketConfig,
};
use cloudhub_runtime::{ProtocolServer, ServerContext};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::adapter::{accept_websocket, WebSocketTransport};

const SERVER_NAME: &str = "websocket";

/// WebSocket protocol server
pub struct WebSocketServer {
    config: WebSocketConfig,
}

impl WebSocketServer {
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ProtocolServer for WebSocketServer {
    fn name(&self) -> &'static str {
        SERVER_NAME
    }

    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn serve(self: Box<Self>, context: ServerContext) -> HubResult<()> {
        let tls = context.credentials.server_config(&[])?;
        let acceptor = TlsAcceptor::from(tls);

        let listener = TcpListener::bind(&self.config.address)
            .await
            .map_err(|e| {
                HubError::transport(
                    SERVER_NAME,
                    format!("failed to bind {}: {}", self.config.address, e),
                )
            })?;
        info!("WebSocket server listening on {}", self.config.address);

        loop {
            let (tcp, remote_addr) = tokio::select! {
                _ = context.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("WebSocket accept failed: {}", e);
                        continue;
                    }
                },
            };

            debug!("Accepted TCP connection from {}", remote_addr);
            let acceptor = acceptor.clone();
            let connection = context.clone();
            context.spawn_tracked(async move {
                handle_connection(connection, acceptor, tcp, remote_addr).await;
            });
        }

        info!("WebSocket server stopped");
        Ok(())
    }
}

async fn handle_connection(
    context: ServerContext,
    acceptor: TlsAcceptor,
    tcp: TcpStream,
    remote_addr: SocketAddr,
) {
    let timeout = context.session.handshake_timeout();
    let max_frame_bytes = context.session.max_frame_bytes;

    let outcome = tokio::select! {
        _ = context.cancel.cancelled() => return,
        result = tokio::time::timeout(
            timeout,
            handshake(acceptor, tcp, remote_addr, max_frame_bytes),
        ) => result,
    };

    let transport = match outcome {
        Ok(Ok(transport)) => transport,
        Ok(Err(e)) => {
            warn!("WebSocket handshake with {} failed: {}", remote_addr, e);
            return;
        }
        Err(_) => {
            warn!(
                "{}",
                SessionError::HandshakeTimeout {
                    duration_ms: timeout.as_millis() as u64
                }
            );
            return;
        }
    };

    info!(
        "Node {} connected over WebSocket from {}",
        transport.peer().node_id,
        remote_addr
    );
    let registry = Arc::clone(&context.registry);
    // Session failures are logged by the session itself
    let _ = context.session(Box::new(transport)).run(registry).await;
}

async fn handshake(
    acceptor: TlsAcceptor,
    tcp: TcpStream,
    remote_addr: SocketAddr,
    max_frame_bytes: usize,
) -> Result<WebSocketTransport<tokio_rustls::server::TlsStream<TcpStream>>, SessionError> {
    let tls = acceptor
        .accept(tcp)
        .await
        .map_err(|e| SessionError::HandshakeFailed {
            reason: format!("TLS handshake failed: {}", e),
        })?;
    accept_websocket(tls, Some(remote_addr), max_frame_bytes).await
}
