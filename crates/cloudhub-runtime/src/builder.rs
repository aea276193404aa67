//! Hub Builder API
//!
//! Assembles a running hub from configuration, credential material and a set
//! of protocol servers, and hands back a [`HubHandle`] for cloud components:
//! the registry, the ingress sender, stop signalling and graceful shutdown.

use std::future::Future;
use std::sync::Arc;

use cloudhub_core::{
    ConfigError, Envelope, HubConfig, HubResult, NodeId, TlsMaterial, Transport,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::channel::{create_ingress_channel, CloudSinkSender, IngressSender};
use crate::dispatcher::Dispatcher;
use crate::registry::QueueRegistry;
use crate::server::{ProtocolServer, ServerContext};
use crate::session::CloseReason;
use crate::supervisor::{TaskHealthStatus, TaskSupervisor};

// ----------------------------------------------------------------------------
// Hub Builder
// ----------------------------------------------------------------------------

/// Builder for a running hub
pub struct HubBuilder {
    config: HubConfig,
    credentials: Option<TlsMaterial>,
    cloud_sink: Option<CloudSinkSender>,
    servers: Vec<Box<dyn ProtocolServer>>,
}

impl HubBuilder {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            credentials: None,
            cloud_sink: None,
            servers: Vec::new(),
        }
    }

    /// Credential material shared by every protocol server
    pub fn with_credentials(mut self, credentials: TlsMaterial) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Forward node-originated envelopes to `sink`
    pub fn with_cloud_sink(mut self, sink: CloudSinkSender) -> Self {
        self.cloud_sink = Some(sink);
        self
    }

    /// Add a protocol server
    pub fn add_server(mut self, server: Box<dyn ProtocolServer>) -> Self {
        self.servers.push(server);
        self
    }

    /// Validate, construct the registry and start every task.
    ///
    /// Configuration and credential problems are fatal and reported before
    /// anything is spawned.
    pub async fn build_and_start(self) -> HubResult<HubHandle> {
        info!("Starting CloudHub");

        self.config.validate()?;
        let credentials = self.credentials.ok_or_else(|| ConfigError::Invalid {
            reason: "no credential material supplied".to_string(),
        })?;
        credentials.server_config(&[])?;

        let mut registry = QueueRegistry::new(self.config.queue.clone(), self.config.session.clone());
        if let Some(sink) = self.cloud_sink {
            registry = registry.with_cloud_sink(sink);
        }
        let registry = Arc::new(registry);

        let cancel = CancellationToken::new();
        let sessions = TaskTracker::new();
        let mut supervisor = TaskSupervisor::new();

        let (ingress, ingress_receiver) = create_ingress_channel(&self.config.channels);
        let dispatcher = Dispatcher::new(registry.clone(), ingress_receiver, cancel.clone());
        supervisor.spawn("dispatcher", dispatcher.run());

        let context = ServerContext::new(
            registry.clone(),
            self.config.session.clone(),
            self.config.keepalive.clone(),
            credentials,
            cancel.clone(),
            sessions.clone(),
        );

        if self.servers.is_empty() {
            warn!("No protocol servers enabled; only in-process sessions can attach");
        }
        for server in self.servers {
            info!("Starting {} protocol server ({})", server.name(), server.kind());
            let name = server.name();
            supervisor.spawn(name, server.serve(context.child()));
        }

        info!("CloudHub started");
        Ok(HubHandle {
            config: self.config,
            registry,
            ingress,
            context,
            cancel,
            sessions,
            supervisor,
        })
    }
}

// ----------------------------------------------------------------------------
// Hub Handle
// ----------------------------------------------------------------------------

/// Undelivered envelopes collected at shutdown
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Outbound envelopes still queued, grouped by node, oldest first
    pub undelivered: Vec<(NodeId, Vec<Envelope>)>,
    /// Supervised tasks aborted because they did not stop in time
    pub aborted_tasks: usize,
    /// Session tasks still closing their transport when the shutdown wait
    /// ended; they finish on their own within the session close timeout
    pub unfinished_sessions: usize,
}

impl ShutdownReport {
    /// Total number of undelivered envelopes
    pub fn total_undelivered(&self) -> usize {
        self.undelivered.iter().map(|(_, envelopes)| envelopes.len()).sum()
    }

    /// Undelivered envelopes for one node
    pub fn for_node(&self, node_id: &NodeId) -> &[Envelope] {
        self.undelivered
            .iter()
            .find(|(id, _)| id == node_id)
            .map(|(_, envelopes)| envelopes.as_slice())
            .unwrap_or(&[])
    }
}

/// Handle to a running hub
pub struct HubHandle {
    config: HubConfig,
    registry: Arc<QueueRegistry>,
    ingress: IngressSender,
    context: ServerContext,
    cancel: CancellationToken,
    sessions: TaskTracker,
    supervisor: TaskSupervisor,
}

impl HubHandle {
    /// The shared queue registry
    pub fn registry(&self) -> Arc<QueueRegistry> {
        self.registry.clone()
    }

    /// Sender for cloud-originated envelopes
    pub fn ingress(&self) -> IngressSender {
        self.ingress.clone()
    }

    /// Root cancellation token; cancelling it stops the whole hub
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Status of the dispatcher and every protocol server
    pub fn health_summary(&self) -> Vec<(String, TaskHealthStatus)> {
        self.supervisor.health_summary()
    }

    /// Attach an already authenticated transport, such as an in-process one
    pub fn attach(&self, transport: Box<dyn Transport>) -> JoinHandle<HubResult<CloseReason>> {
        let session = self.context.session(transport);
        self.context.spawn_session(session)
    }

    /// Wait until `signal` completes or the hub is cancelled
    pub async fn wait_for_stop<F>(&self, signal: F)
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            _ = signal => info!("Stop signal received"),
            _ = self.cancel.cancelled() => info!("Hub cancelled"),
        }
    }

    /// Stop every task and session, then report what was left undelivered.
    ///
    /// Queues are neither closed nor persisted; their remaining outbound
    /// envelopes move into the report.
    pub async fn shutdown(mut self) -> ShutdownReport {
        info!("Shutting down CloudHub");
        let timeout = self.config.supervisor.shutdown_timeout();
        self.cancel.cancel();

        let aborted_tasks = self.supervisor.shutdown(timeout).await;

        self.sessions.close();
        let mut unfinished_sessions = 0;
        if tokio::time::timeout(timeout, self.sessions.wait()).await.is_err() {
            unfinished_sessions = self.sessions.len();
            warn!(
                "{} session tasks still running after {:?}",
                unfinished_sessions, timeout
            );
        }

        let report = ShutdownReport {
            undelivered: self.registry.drain_all(),
            aborted_tasks,
            unfinished_sessions,
        };
        for (node_id, envelopes) in &report.undelivered {
            warn!(
                "Node {} has {} undelivered envelopes at shutdown",
                node_id,
                envelopes.len()
            );
        }
        info!(
            "CloudHub stopped ({} undelivered envelopes)",
            report.total_undelivered()
        );
        report
    }
}

// ----------------------------------------------------------------------------
// Test Utilities
// ----------------------------------------------------------------------------

/// Self-signed credential material for tests and local experiments
#[cfg(test)]
pub(crate) fn test_credentials() -> TlsMaterial {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_pem = cert.serialize_pem().unwrap();
    TlsMaterial::new(
        cert_pem.clone().into_bytes(),
        cert_pem.into_bytes(),
        cert.serialize_private_key_pem().into_bytes(),
    )
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use cloudhub_core::transport::memory;
    use cloudhub_core::{
        ConfigError, Frame, FrameSink, FrameSource, HubError, Operation, PeerInfo, TransportKind,
    };
    use std::time::Duration;

    struct FailingServer;

    #[async_trait::async_trait]
    impl ProtocolServer for FailingServer {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn kind(&self) -> TransportKind {
            TransportKind::Memory
        }

        async fn serve(self: Box<Self>, _context: ServerContext) -> HubResult<()> {
            Err(HubError::transport("failing", "bind failed"))
        }
    }

    #[tokio::test]
    async fn test_missing_credentials_are_fatal() {
        let result = HubBuilder::new(HubConfig::default()).build_and_start().await;
        assert!(matches!(
            result,
            Err(HubError::Config(ConfigError::Invalid { .. }))
        ));

        let garbage = TlsMaterial::new(b"ca".to_vec(), b"cert".to_vec(), b"key".to_vec());
        let result = HubBuilder::new(HubConfig::default())
            .with_credentials(garbage)
            .build_and_start()
            .await;
        assert!(matches!(
            result,
            Err(HubError::Config(ConfigError::InvalidCredential { .. }))
        ));
    }

    #[tokio::test]
    async fn test_failed_server_does_not_stop_hub() {
        let hub = HubBuilder::new(HubConfig::default())
            .with_credentials(test_credentials())
            .add_server(Box::new(FailingServer))
            .build_and_start()
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(hub.is_running());
        assert!(hub
            .health_summary()
            .contains(&("dispatcher".to_string(), TaskHealthStatus::Running)));

        let node_id = NodeId::new("n1").unwrap();
        let (transport, mut edge) = memory::pair(node_id.clone(), 8);
        let session = hub.attach(Box::new(transport));
        hub.ingress()
            .submit_and_confirm(Envelope::to_node("cloud", &node_id, Operation::Update, "twin", vec![]))
            .await
            .unwrap();
        assert!(edge.next_envelope().await.is_some());

        let report = hub.shutdown().await;
        assert_eq!(report.total_undelivered(), 0);
        assert_eq!(report.unfinished_sessions, 0);
        assert_eq!(session.await.unwrap().unwrap(), CloseReason::Shutdown);
    }

    struct SlowCloseTransport {
        peer: PeerInfo,
    }

    struct IdleSource;

    #[async_trait::async_trait]
    impl FrameSource for IdleSource {
        async fn read_frame(&mut self) -> HubResult<Option<Frame>> {
            std::future::pending().await
        }
    }

    struct SlowCloseSink;

    #[async_trait::async_trait]
    impl FrameSink for SlowCloseSink {
        async fn write_frame(&mut self, _frame: Frame) -> HubResult<()> {
            Ok(())
        }

        async fn close(&mut self) -> HubResult<()> {
            std::future::pending().await
        }
    }

    impl Transport for SlowCloseTransport {
        fn peer(&self) -> &PeerInfo {
            &self.peer
        }

        fn split(self: Box<Self>) -> (Box<dyn FrameSource>, Box<dyn FrameSink>) {
            (Box::new(IdleSource), Box::new(SlowCloseSink))
        }
    }

    #[tokio::test]
    async fn test_sessions_outliving_shutdown_are_reported_not_aborted() {
        let mut config = HubConfig::default();
        config.supervisor.shutdown_timeout_ms = 50;
        config.session.close_timeout_ms = 500;

        let hub = HubBuilder::new(config)
            .with_credentials(test_credentials())
            .build_and_start()
            .await
            .unwrap();
        let registry = hub.registry();
        let transport = SlowCloseTransport {
            peer: PeerInfo::new(NodeId::new("n1").unwrap(), TransportKind::Memory, None),
        };
        let session = hub.attach(Box::new(transport));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = hub.shutdown().await;
        assert_eq!(report.aborted_tasks, 0);
        assert_eq!(report.unfinished_sessions, 1);

        // The session still completes once its close timeout expires
        let reason = tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reason, CloseReason::Shutdown);
        assert_eq!(registry.connected_nodes(), 0);
    }
}
