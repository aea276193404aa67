//! QUIC Protocol Server
//!
//! quinn endpoint → TLS 1.3 with client certificates → first bidirectional
//! stream → `Register` frame → [`Session`](cloudhub_runtime::Session). The
//! session writes the `Registered` acknowledgement once the registry has
//! recorded it. The connection is closed when the session ends.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use cloudhub_core::{
    HubError, HubResult, PeerInfo, QuicConfig, SessionError, TlsMaterial, Transport,
    TransportKind,
};
use cloudhub_runtime::{ProtocolServer, ServerContext};
use quinn::crypto::rustls::QuicServerConfig;
use quinn::{Connection, Endpoint, IdleTimeout, Incoming, RecvStream, SendStream, VarInt};
use tracing::{debug, info, warn};

use crate::adapter::{read_registration, QuicTransport};

const SERVER_NAME: &str = "quic";

/// Application close code for an orderly session end
const CLOSE_NORMAL: u32 = 0;
/// Application close code for a rejected registration or a failed session
const CLOSE_ERROR: u32 = 1;

/// QUIC protocol server
pub struct QuicServer {
    config: QuicConfig,
}

impl QuicServer {
    pub fn new(config: QuicConfig) -> Self {
        Self { config }
    }

    fn endpoint_config(&self, credentials: &TlsMaterial) -> HubResult<quinn::ServerConfig> {
        let tls = credentials.server_config(&self.config.alpn)?;
        let crypto = QuicServerConfig::try_from(tls).map_err(|e| {
            HubError::transport(SERVER_NAME, format!("invalid QUIC TLS configuration: {}", e))
        })?;

        let idle = IdleTimeout::try_from(self.config.max_idle_timeout()).map_err(|e| {
            HubError::transport(SERVER_NAME, format!("invalid idle timeout: {}", e))
        })?;
        let mut transport = quinn::TransportConfig::default();
        transport.max_idle_timeout(Some(idle));

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
        server_config.transport_config(Arc::new(transport));
        Ok(server_config)
    }
}

#[async_trait]
impl ProtocolServer for QuicServer {
    fn name(&self) -> &'static str {
        SERVER_NAME
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Quic
    }

    async fn serve(self: Box<Self>, context: ServerContext) -> HubResult<()> {
        let server_config = self.endpoint_config(&context.credentials)?;
        let address: SocketAddr = self.config.address.parse().map_err(|e| {
            HubError::transport(
                SERVER_NAME,
                format!("invalid listen address {}: {}", self.config.address, e),
            )
        })?;
        let endpoint = Endpoint::server(server_config, address).map_err(|e| {
            HubError::transport(SERVER_NAME, format!("failed to bind {}: {}", address, e))
        })?;
        info!(
            "QUIC server listening on {} (idle timeout {}ms)",
            address, self.config.max_idle_timeout_ms
        );

        loop {
            let incoming = tokio::select! {
                _ = context.cancel.cancelled() => break,
                incoming = endpoint.accept() => match incoming {
                    Some(incoming) => incoming,
                    None => break,
                },
            };

            debug!("Incoming QUIC connection from {}", incoming.remote_address());
            let connection = context.clone();
            context.spawn_tracked(async move {
                handle_connection(connection, incoming).await;
            });
        }

        endpoint.close(VarInt::from_u32(CLOSE_NORMAL), b"hub stopping");
        info!("QUIC server stopped");
        Ok(())
    }
}

async fn handle_connection(context: ServerContext, incoming: Incoming) {
    let remote_addr = incoming.remote_address();
    let timeout = context.session.handshake_timeout();
    let max_frame_bytes = context.session.max_frame_bytes;

    let outcome = tokio::select! {
        _ = context.cancel.cancelled() => return,
        result = tokio::time::timeout(
            timeout,
            handshake(incoming, remote_addr, max_frame_bytes),
        ) => result,
    };

    let (connection, transport) = match outcome {
        Ok(Ok(accepted)) => accepted,
        Ok(Err(e)) => {
            warn!("QUIC handshake with {} failed: {}", remote_addr, e);
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

    let node_id = transport.peer().node_id.clone();
    info!("Node {} connected over QUIC from {}", node_id, remote_addr);

    let registry = Arc::clone(&context.registry);
    let result = context.session(Box::new(transport)).run(registry).await;
    let (code, reason) = match &result {
        Ok(reason) => (CLOSE_NORMAL, reason.to_string()),
        Err(e) => (CLOSE_ERROR, e.to_string()),
    };
    connection.close(VarInt::from_u32(code), reason.as_bytes());
    debug!("QUIC connection for node {} closed", node_id);
}

async fn handshake(
    incoming: Incoming,
    remote_addr: SocketAddr,
    max_frame_bytes: usize,
) -> Result<(Connection, QuicTransport<RecvStream, SendStream>), SessionError> {
    let connection = incoming.await.map_err(|e| SessionError::HandshakeFailed {
        reason: format!("QUIC handshake failed: {}", e),
    })?;

    let (send, mut recv) = connection
        .accept_bi()
        .await
        .map_err(|e| SessionError::HandshakeFailed {
            reason: format!("no stream opened: {}", e),
        })?;

    let node_id = match read_registration(&mut recv, max_frame_bytes).await {
        Ok(node_id) => node_id,
        Err(e) => {
            connection.close(VarInt::from_u32(CLOSE_ERROR), b"registration rejected");
            return Err(e);
        }
    };

    let peer = PeerInfo::new(node_id, TransportKind::Quic, Some(remote_addr));
    let transport = QuicTransport::new(recv, send, peer, max_frame_bytes);
    Ok((connection, transport))
}
