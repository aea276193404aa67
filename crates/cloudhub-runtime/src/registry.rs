//! Queue Registry
//!
//! Maps node identities to their [`NodeQueue`] and to the session currently
//! serving them. It provides:
//! - lazy, race-free queue creation (at most one queue per node, ever)
//! - routing of published envelopes to node queues or to the cloud side
//! - per-node serialized session registration with supersede semantics
//! - identity-checked deregistration, so a late-exiting old session cannot
//!   evict its replacement
//!
//! Registrations for different nodes never contend: each node has its own
//! slot lock inside a sharded map.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use cloudhub_core::{
    Envelope, HubError, HubResult, NodeId, QueueConfig, QueueError, SessionConfig, SessionError,
};
use dashmap::DashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::channel::CloudSinkSender;
use crate::queue::NodeQueue;
use crate::session::{CloseReason, SessionHandle};

// ----------------------------------------------------------------------------
// Routing Outcome
// ----------------------------------------------------------------------------

/// Where a published envelope went
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Buffered in the destination node's outbound queue
    Node(NodeId),
    /// Forwarded to the attached cloud sink
    CloudSink,
    /// Buffered in the source node's inbound queue (no cloud sink attached)
    NodeInbound(NodeId),
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Node(node_id) => write!(f, "node {}", node_id),
            Route::CloudSink => write!(f, "cloud sink"),
            Route::NodeInbound(node_id) => write!(f, "inbound buffer of {}", node_id),
        }
    }
}

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    to_cloud: AtomicU64,
    rejected: AtomicU64,
    registered: AtomicU64,
    superseded: AtomicU64,
    stale_deregistrations: AtomicU64,
}

/// Point-in-time registry statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Envelopes accepted into node queues
    pub published: u64,
    /// Node-originated envelopes handed to the cloud side
    pub to_cloud: u64,
    /// Envelopes refused by a queue or the cloud sink
    pub rejected: u64,
    /// Sessions successfully registered
    pub registered: u64,
    /// Sessions closed because a newer one registered
    pub superseded: u64,
    /// Deregistrations ignored because a newer session owned the node
    pub stale_deregistrations: u64,
    /// Nodes with an active session
    pub connected: usize,
    /// Nodes with a queue
    pub queues: usize,
}

// ----------------------------------------------------------------------------
// Queue Registry
// ----------------------------------------------------------------------------

type SessionSlot = Arc<Mutex<Option<SessionHandle>>>;

/// Shared map of node queues and active sessions
pub struct QueueRegistry {
    queue_config: QueueConfig,
    session_config: SessionConfig,
    queues: DashMap<NodeId, Arc<NodeQueue>>,
    sessions: DashMap<NodeId, SessionSlot>,
    connected: AtomicUsize,
    cloud_sink: Option<CloudSinkSender>,
    counters: Counters,
}

impl fmt::Debug for QueueRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueRegistry")
            .field("queues", &self.queues.len())
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .field("cloud_sink", &self.cloud_sink.is_some())
            .finish()
    }
}

impl QueueRegistry {
    /// Create an empty registry; node-originated envelopes stay in inbound buffers
    pub fn new(queue_config: QueueConfig, session_config: SessionConfig) -> Self {
        Self {
            queue_config,
            session_config,
            queues: DashMap::new(),
            sessions: DashMap::new(),
            connected: AtomicUsize::new(0),
            cloud_sink: None,
            counters: Counters::default(),
        }
    }

    /// Forward node-originated envelopes to `sink` instead of inbound buffers
    pub fn with_cloud_sink(mut self, sink: CloudSinkSender) -> Self {
        self.cloud_sink = Some(sink);
        self
    }

    /// Return the node's queue, creating it on first use
    pub fn get_or_create(&self, node_id: &NodeId) -> Arc<NodeQueue> {
        if let Some(queue) = self.queues.get(node_id) {
            return queue.value().clone();
        }

        self.queues
            .entry(node_id.clone())
            .or_insert_with(|| {
                debug!("Creating queue for node {}", node_id);
                Arc::new(NodeQueue::new(node_id.clone(), self.queue_config.clone()))
            })
            .value()
            .clone()
    }

    pub fn get(&self, node_id: &NodeId) -> Option<Arc<NodeQueue>> {
        self.queues.get(node_id).map(|queue| queue.value().clone())
    }

    /// Deregister a node: close and forget its queue and close its session.
    ///
    /// Envelopes still buffered are returned through the closed queue's
    /// [`NodeQueue::drain`].
    pub async fn remove(&self, node_id: &NodeId) -> Option<Arc<NodeQueue>> {
        let queue = self.queues.remove(node_id).map(|(_, queue)| queue);
        if let Some(queue) = &queue {
            queue.close();
        }

        let slot = self.sessions.remove(node_id).map(|(_, slot)| slot);
        if let Some(slot) = slot {
            if let Some(session) = slot.lock().await.take() {
                self.connected.fetch_sub(1, Ordering::SeqCst);
                session.close_with(CloseReason::NodeRemoved);
            }
        }

        info!("Removed node {}", node_id);
        queue
    }

    /// Route an envelope without blocking.
    ///
    /// Cloud-bound envelopes go to the cloud sink when one is attached and to
    /// the source node's inbound buffer otherwise; everything else is appended
    /// to the destination node's queue.
    pub fn publish(&self, envelope: Envelope) -> HubResult<Route> {
        let result = if envelope.is_cloud_bound() {
            self.route_to_cloud(envelope)
        } else {
            self.route_to_node(envelope)
        };

        if result.is_err() {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn route_to_node(&self, envelope: Envelope) -> HubResult<Route> {
        let node_id = NodeId::new(envelope.destination())?;
        self.get_or_create(&node_id).send(envelope)?;
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        Ok(Route::Node(node_id))
    }

    fn route_to_cloud(&self, envelope: Envelope) -> HubResult<Route> {
        let route = match &self.cloud_sink {
            Some(sink) => {
                let source = envelope.source().to_string();
                sink.try_send(envelope).map_err(|e| match e {
                    TrySendError::Full(_) => HubError::from(QueueError::Full {
                        node_id: source,
                        capacity: sink.max_capacity(),
                        bytes: 0,
                    }),
                    TrySendError::Closed(_) => HubError::channel("cloud sink closed"),
                })?;
                Route::CloudSink
            }
            None => {
                let node_id = NodeId::new(envelope.source())?;
                self.get_or_create(&node_id).deliver(envelope)?;
                Route::NodeInbound(node_id)
            }
        };

        self.counters.to_cloud.fetch_add(1, Ordering::Relaxed);
        Ok(route)
    }

    // ------------------------------------------------------------------------
    // Session Registration
    // ------------------------------------------------------------------------

    /// Record `handle` as the node's active session.
    ///
    /// An existing session for the node is closed first and awaited (bounded
    /// by the close timeout). Registering a node that has no session fails
    /// with [`SessionError::NodeLimitReached`] when the hub is full.
    pub async fn register_session(&self, handle: SessionHandle) -> HubResult<()> {
        let node_id = handle.node_id().clone();
        let slot = self.slot(&node_id);
        let mut current = slot.lock().await;

        match current.take() {
            Some(existing) if existing.id() == handle.id() => {
                *current = Some(existing);
                return Ok(());
            }
            Some(existing) => {
                info!(
                    "Session {} supersedes session {} for node {}",
                    handle.id(),
                    existing.id(),
                    node_id
                );
                existing.close_with(CloseReason::Superseded);
                if let Err(e) = existing
                    .wait_closed(self.session_config.close_timeout())
                    .await
                {
                    warn!("{}; registering session {} anyway", e, handle.id());
                }
                self.counters.superseded.fetch_add(1, Ordering::Relaxed);
            }
            None => self.reserve_connection()?,
        }

        *current = Some(handle);
        drop(current);

        self.get_or_create(&node_id);
        self.counters.registered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Forget `handle` if it is still the node's active session.
    ///
    /// Returns false, without touching the mapping, when a newer session has
    /// already replaced it.
    pub async fn deregister_session(&self, handle: &SessionHandle) -> bool {
        let Some(slot) = self.sessions.get(handle.node_id()).map(|s| s.value().clone()) else {
            self.stale_deregistration(handle);
            return false;
        };

        let mut current = slot.lock().await;
        match current.as_ref() {
            Some(active) if active.id() == handle.id() => {
                *current = None;
                self.connected.fetch_sub(1, Ordering::SeqCst);
                debug!(
                    "Deregistered session {} for node {}",
                    handle.id(),
                    handle.node_id()
                );
                true
            }
            _ => {
                self.stale_deregistration(handle);
                false
            }
        }
    }

    /// The node's active session, if any
    pub async fn session(&self, node_id: &NodeId) -> Option<SessionHandle> {
        let slot = self.sessions.get(node_id).map(|s| s.value().clone())?;
        let current = slot.lock().await;
        current.clone()
    }

    /// Number of nodes with an active session
    pub fn connected_nodes(&self) -> usize {
        self.connected.load(Ordering::SeqCst)
    }

    /// Identities of every node with a queue
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.queues.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            published: self.counters.published.load(Ordering::Relaxed),
            to_cloud: self.counters.to_cloud.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            registered: self.counters.registered.load(Ordering::Relaxed),
            superseded: self.counters.superseded.load(Ordering::Relaxed),
            stale_deregistrations: self.counters.stale_deregistrations.load(Ordering::Relaxed),
            connected: self.connected_nodes(),
            queues: self.queues.len(),
        }
    }

    /// Take every undelivered outbound envelope, grouped by node
    pub fn drain_all(&self) -> Vec<(NodeId, Vec<Envelope>)> {
        let queues: Vec<_> = self
            .queues
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut drained: Vec<_> = queues
            .into_iter()
            .filter_map(|queue| {
                let envelopes = queue.drain();
                (!envelopes.is_empty()).then(|| (queue.node_id().clone(), envelopes))
            })
            .collect();
        drained.sort_by(|a, b| a.0.cmp(&b.0));
        drained
    }

    // ------------------------------------------------------------------------
    // Internal Helpers
    // ------------------------------------------------------------------------

    fn slot(&self, node_id: &NodeId) -> SessionSlot {
        self.sessions
            .entry(node_id.clone())
            .or_default()
            .value()
            .clone()
    }

    fn reserve_connection(&self) -> Result<(), SessionError> {
        let limit = self.session_config.node_limit;
        self.connected
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < limit).then_some(current + 1)
            })
            .map(|_| ())
            .map_err(|current| SessionError::NodeLimitReached { current, limit })
    }

    fn stale_deregistration(&self, handle: &SessionHandle) {
        self.counters
            .stale_deregistrations
            .fetch_add(1, Ordering::Relaxed);
        debug!(
            "Ignoring stale deregistration of session {} for node {}",
            handle.id(),
            handle.node_id()
        );
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::create_cloud_sink;
    use cloudhub_core::{ChannelConfig, Operation};

    fn node(name: &str) -> NodeId {
        NodeId::new(name).unwrap()
    }

    fn registry(capacity: usize) -> QueueRegistry {
        QueueRegistry::new(QueueConfig::with_capacity(capacity), SessionConfig::default())
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let registry = registry(4);
        let a = registry.get_or_create(&node("n1"));
        let b = registry.get_or_create(&node("n1"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.node_ids(), vec![node("n1")]);
    }

    #[test]
    fn test_publish_routes_by_destination() {
        let registry = registry(4);
        let route = registry
            .publish(Envelope::to_node("cloud", &node("n1"), Operation::Insert, "r", vec![]))
            .unwrap();
        assert_eq!(route, Route::Node(node("n1")));
        assert_eq!(registry.get(&node("n1")).unwrap().len(), 1);
        assert!(registry.get(&node("n2")).is_none());
    }

    #[test]
    fn test_publish_surfaces_queue_full() {
        let registry = registry(1);
        let envelope = || Envelope::to_node("cloud", &node("n1"), Operation::Insert, "r", vec![]);
        registry.publish(envelope()).unwrap();

        let err = registry.publish(envelope()).unwrap_err();
        assert!(err.is_queue_full());
        assert_eq!(registry.stats().rejected, 1);
        assert_eq!(registry.stats().published, 1);
    }

    #[test]
    fn test_publish_rejects_invalid_destination() {
        let registry = registry(4);
        let envelope = Envelope::new("cloud", "bad/node", Operation::Insert, "r", vec![]);
        assert!(matches!(
            registry.publish(envelope),
            Err(HubError::Session(SessionError::InvalidNodeId { .. }))
        ));
    }

    #[test]
    fn test_cloud_bound_without_sink_goes_to_inbound() {
        let registry = registry(4);
        let envelope = Envelope::to_cloud("n1", Operation::Response, "r", vec![1]);
        assert_eq!(
            registry.publish(envelope).unwrap(),
            Route::NodeInbound(node("n1"))
        );
        assert_eq!(registry.get(&node("n1")).unwrap().inbound_len(), 1);
    }

    #[tokio::test]
    async fn test_cloud_bound_with_sink() {
        let (sink, mut cloud) = create_cloud_sink(&ChannelConfig {
            cloud_sink_buffer_size: 1,
            ..ChannelConfig::default()
        });
        let registry = registry(4).with_cloud_sink(sink);

        let envelope = Envelope::to_cloud("n1", Operation::Response, "r", vec![1]);
        assert_eq!(registry.publish(envelope.clone()).unwrap(), Route::CloudSink);
        assert!(registry.publish(envelope.clone()).unwrap_err().is_queue_full());
        assert_eq!(cloud.recv().await, Some(envelope));
        assert_eq!(registry.stats().to_cloud, 1);
    }

    #[tokio::test]
    async fn test_remove_closes_queue() {
        let registry = registry(4);
        registry
            .publish(Envelope::to_node("cloud", &node("n1"), Operation::Insert, "r", vec![]))
            .unwrap();

        let removed = registry.remove(&node("n1")).await.unwrap();
        assert!(removed.is_closed());
        assert_eq!(removed.drain().len(), 1);
        assert!(registry.get(&node("n1")).is_none());
    }

    #[test]
    fn test_drain_all_groups_by_node() {
        let registry = registry(4);
        for name in ["b", "a", "b"] {
            registry
                .publish(Envelope::to_node("cloud", &node(name), Operation::Insert, "r", vec![]))
                .unwrap();
        }
        registry.get_or_create(&node("empty"));

        let drained = registry.drain_all();
        let counts: Vec<_> = drained
            .iter()
            .map(|(id, envelopes)| (id.as_str().to_string(), envelopes.len()))
            .collect();
        assert_eq!(counts, vec![("a".to_string(), 1), ("b".to_string(), 2)]);
        assert!(registry.drain_all().is_empty());
    }
}
