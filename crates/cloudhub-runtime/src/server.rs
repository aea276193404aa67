//! Protocol Server Interface
//!
//! A protocol server owns one listener (WebSocket, QUIC, ...) and turns every
//! authenticated connection into a [`Session`]. Servers run independently of
//! each other under the hub supervisor: a server that fails to bind ends on its
//! own without affecting the rest of the hub.

use std::sync::Arc;

use async_trait::async_trait;
use cloudhub_core::{
    HubResult, KeepaliveConfig, SessionConfig, TlsMaterial, Transport, TransportKind,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::registry::QueueRegistry;
use crate::session::{CloseReason, Session};

/// Everything a protocol server needs from the hub
#[derive(Clone)]
pub struct ServerContext {
    /// Shared queue registry
    pub registry: Arc<QueueRegistry>,
    /// Session lifecycle settings
    pub session: SessionConfig,
    /// Liveness probing
    pub keepalive: KeepaliveConfig,
    /// Credential material for the server's TLS configuration
    pub credentials: TlsMaterial,
    /// Cancelled when the server should stop accepting and close its sessions
    pub cancel: CancellationToken,
    sessions: TaskTracker,
}

impl ServerContext {
    pub fn new(
        registry: Arc<QueueRegistry>,
        session: SessionConfig,
        keepalive: KeepaliveConfig,
        credentials: TlsMaterial,
        cancel: CancellationToken,
        sessions: TaskTracker,
    ) -> Self {
        Self {
            registry,
            session,
            keepalive,
            credentials,
            cancel,
            sessions,
        }
    }

    /// Context for one server, with a cancellation token of its own
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            ..self.clone()
        }
    }

    /// Build a session for an authenticated transport
    pub fn session(&self, transport: Box<dyn Transport>) -> Session {
        Session::new(
            transport,
            self.session.clone(),
            self.keepalive.clone(),
            &self.cancel,
        )
    }

    /// Run `session` on a task tracked by the hub, so shutdown can wait for it
    pub fn spawn_session(&self, session: Session) -> JoinHandle<HubResult<CloseReason>> {
        let registry = self.registry.clone();
        self.sessions.spawn(session.run(registry))
    }

    /// Spawn a tracked task for per-connection work such as a handshake
    pub fn spawn_tracked<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.sessions.spawn(task)
    }
}

/// A listener that produces sessions
#[async_trait]
pub trait ProtocolServer: Send {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Transport this server accepts
    fn kind(&self) -> TransportKind;

    /// Bind, accept and run sessions until `context.cancel` fires.
    ///
    /// Returns an error only when the server cannot operate at all, such as a
    /// failed bind.
    async fn serve(self: Box<Self>, context: ServerContext) -> HubResult<()>;
}
