//! Session
//!
//! The live binding between one authenticated connection and one node queue.
//! A session:
//! - registers itself with the [`QueueRegistry`], superseding any older
//!   session of the same node
//! - runs a read loop (frames → `publish`) and a write loop (queue → frames,
//!   control replies, keepalive pings) until either one exits
//! - closes its transport, reaches [`SessionState::Closed`] and deregisters
//!
//! The node queue outlives the session, so envelopes buffered while a node is
//! away are delivered by its next session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use cloudhub_core::{
    Control, Frame, FrameSink, FrameSource, HubError, HubResult, KeepaliveConfig, NodeId,
    PeerInfo, SessionConfig, SessionError, SessionId, Transport, TransportKind,
};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queue::NodeQueue;
use crate::registry::QueueRegistry;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique session id
pub fn next_session_id() -> SessionId {
    SessionId::new(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
}

// ----------------------------------------------------------------------------
// Session State
// ----------------------------------------------------------------------------

/// Lifecycle of a session; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Why a session ended without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The node closed the connection
    PeerClosed,
    /// A newer session registered for the same node
    Superseded,
    /// The node was removed from the registry
    NodeRemoved,
    /// [`SessionHandle::close`] was called
    Requested,
    /// The hub is shutting down
    Shutdown,
    /// The node queue was closed underneath the session
    QueueClosed,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            CloseReason::PeerClosed => "closed by peer",
            CloseReason::Superseded => "superseded by a newer session",
            CloseReason::NodeRemoved => "node removed",
            CloseReason::Requested => "close requested",
            CloseReason::Shutdown => "hub shutdown",
            CloseReason::QueueClosed => "queue closed",
        };
        write!(f, "{}", text)
    }
}

// ----------------------------------------------------------------------------
// Session Handle
// ----------------------------------------------------------------------------

struct SessionShared {
    id: SessionId,
    peer: PeerInfo,
    state: watch::Sender<SessionState>,
    cancel: CancellationToken,
    close_reason: Mutex<Option<CloseReason>>,
}

/// Cheaply cloneable handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionShared>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.inner.id)
            .field("node_id", &self.inner.peer.node_id)
            .field("kind", &self.inner.peer.kind)
            .field("state", &self.state())
            .finish()
    }
}

impl SessionHandle {
    fn new(id: SessionId, peer: PeerInfo, cancel: CancellationToken) -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        Self {
            inner: Arc::new(SessionShared {
                id,
                peer,
                state,
                cancel,
                close_reason: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn node_id(&self) -> &NodeId {
        &self.inner.peer.node_id
    }

    pub fn kind(&self) -> TransportKind {
        self.inner.peer.kind
    }

    pub fn remote_addr(&self) -> Option<std::net::SocketAddr> {
        self.inner.peer.remote_addr
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Ask the session to stop
    pub fn close(&self) {
        self.close_with(CloseReason::Requested);
    }

    /// Ask the session to stop, recording why.
    ///
    /// A session that never started moves straight to `Closed`.
    pub fn close_with(&self, reason: CloseReason) {
        {
            let mut recorded = self
                .inner
                .close_reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            recorded.get_or_insert(reason);
        }
        self.inner.state.send_if_modified(|state| {
            if *state == SessionState::Connecting {
                *state = SessionState::Closed;
                true
            } else {
                false
            }
        });
        self.inner.cancel.cancel();
    }

    /// Wait until the session reaches `Closed`
    pub async fn wait_closed(&self, timeout: Duration) -> Result<(), SessionError> {
        let mut state = self.subscribe();
        let outcome = tokio::time::timeout(timeout, state.wait_for(|s| *s == SessionState::Closed))
            .await
            .map(|_| ());
        outcome.map_err(|_| SessionError::CloseTimeout {
            node_id: self.node_id().to_string(),
            duration_ms: timeout.as_millis() as u64,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    fn recorded_reason(&self) -> Option<CloseReason> {
        *self
            .inner
            .close_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Connecting → Active; false if the session was closed before starting
    fn activate(&self) -> bool {
        self.inner.state.send_if_modified(|state| {
            if *state == SessionState::Connecting {
                *state = SessionState::Active;
                true
            } else {
                false
            }
        })
    }

    fn begin_closing(&self) {
        self.inner.state.send_if_modified(|state| {
            if matches!(*state, SessionState::Connecting | SessionState::Active) {
                *state = SessionState::Closing;
                true
            } else {
                false
            }
        });
    }

    fn mark_closed(&self) {
        self.inner.state.send_replace(SessionState::Closed);
    }
}

// ----------------------------------------------------------------------------
// Session
// ----------------------------------------------------------------------------

/// A transport bound to a node, ready to run
pub struct Session {
    handle: SessionHandle,
    transport: Box<dyn Transport>,
    config: SessionConfig,
    keepalive: KeepaliveConfig,
}

impl Session {
    /// Create a session whose cancellation follows `parent`
    pub fn new(
        transport: Box<dyn Transport>,
        config: SessionConfig,
        keepalive: KeepaliveConfig,
        parent: &CancellationToken,
    ) -> Self {
        Self::with_id(next_session_id(), transport, config, keepalive, parent)
    }

    /// Create a session with a pre-allocated id
    pub fn with_id(
        id: SessionId,
        transport: Box<dyn Transport>,
        config: SessionConfig,
        keepalive: KeepaliveConfig,
        parent: &CancellationToken,
    ) -> Self {
        let handle = SessionHandle::new(id, transport.peer().clone(), parent.child_token());
        Self {
            handle,
            transport,
            config,
            keepalive,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Register, pump frames until either loop exits, then tear down.
    ///
    /// Returns the reason for an orderly close, or the error that ended the
    /// session. Either way the session is `Closed` and deregistered on return.
    pub async fn run(self, registry: Arc<QueueRegistry>) -> HubResult<CloseReason> {
        let Session {
            handle,
            transport,
            config,
            keepalive,
        } = self;
        let node_id = handle.node_id().clone();
        let close_timeout = config.close_timeout();

        if let Err(e) = registry.register_session(handle.clone()).await {
            warn!(
                "Rejecting session {} for node {}: {}",
                handle.id(),
                node_id,
                e
            );
            let (_, mut sink) = transport.split();
            close_sink(sink.as_mut(), &node_id, close_timeout).await;
            drop(sink);
            handle.mark_closed();
            return Err(e);
        }

        let ack = transport.registration_ack(handle.id());
        let (source, mut sink) = transport.split();
        let queue = registry.get_or_create(&node_id);

        let result = if handle.activate() {
            info!(
                "Session {} for node {} active over {}",
                handle.id(),
                node_id,
                handle.kind()
            );
            let pumps = Pumps {
                node_id: node_id.clone(),
                cancel: handle.cancel_token(),
                config,
                keepalive,
            };
            pumps.drive(source, sink.as_mut(), ack, queue, registry.clone()).await
        } else {
            Ok(CloseReason::Shutdown)
        };

        handle.begin_closing();
        close_sink(sink.as_mut(), &node_id, close_timeout).await;
        drop(sink);
        handle.mark_closed();
        registry.deregister_session(&handle).await;

        match result {
            Ok(reason) => {
                let reason = handle.recorded_reason().unwrap_or(reason);
                info!("Session {} for node {} {}", handle.id(), node_id, reason);
                Ok(reason)
            }
            Err(e) => {
                warn!("Session {} for node {} failed: {}", handle.id(), node_id, e);
                Err(HubError::from(e))
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Read and Write Loops
// ----------------------------------------------------------------------------

/// Time since the peer was last heard from
struct Liveness {
    started: Instant,
    last_seen_ms: AtomicU64,
}

impl Liveness {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_seen_ms.store(now, Ordering::Relaxed);
    }

    fn silence(&self) -> Duration {
        let now = self.started.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_seen_ms.load(Ordering::Relaxed)))
    }
}

struct Pumps {
    node_id: NodeId,
    cancel: CancellationToken,
    config: SessionConfig,
    keepalive: KeepaliveConfig,
}

impl Pumps {
    async fn drive(
        self,
        source: Box<dyn FrameSource>,
        sink: &mut dyn FrameSink,
        ack: Option<Frame>,
        queue: Arc<NodeQueue>,
        registry: Arc<QueueRegistry>,
    ) -> Result<CloseReason, SessionError> {
        if let Some(frame) = ack {
            if !self.write(sink, frame).await? {
                return Ok(CloseReason::Shutdown);
            }
        }

        let liveness = Arc::new(Liveness::new());
        let (control_tx, control_rx) = mpsc::channel(self.config.control_buffer_size.max(1));

        let reader = tokio::spawn(read_loop(
            source,
            registry,
            self.node_id.clone(),
            liveness.clone(),
            control_tx,
            self.cancel.clone(),
        ));

        let written = self.write_loop(sink, &queue, control_rx, &liveness).await;
        self.cancel.cancel();

        let read = match reader.await {
            Ok(result) => result,
            Err(e) => Err(SessionError::ReadFailed {
                node_id: self.node_id.to_string(),
                reason: format!("read task ended abnormally: {}", e),
            }),
        };

        match (written, read) {
            (Err(e), _) | (_, Err(e)) => Err(e),
            (Ok(CloseReason::Shutdown), Ok(reason)) => Ok(reason),
            (Ok(reason), _) => Ok(reason),
        }
    }

    async fn write_loop(
        &self,
        sink: &mut dyn FrameSink,
        queue: &NodeQueue,
        mut control: mpsc::Receiver<Frame>,
        liveness: &Liveness,
    ) -> Result<CloseReason, SessionError> {
        let interval = self.keepalive.interval();
        let mut keepalive = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ping_seq = 0u64;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return Ok(CloseReason::Shutdown),

                Some(frame) = control.recv() => {
                    if !self.write(sink, frame).await? {
                        return Ok(CloseReason::Shutdown);
                    }
                }

                _ = keepalive.tick() => {
                    let silence = liveness.silence();
                    if silence >= self.keepalive.timeout() {
                        return Err(SessionError::KeepaliveTimeout {
                            node_id: self.node_id.to_string(),
                            elapsed_ms: silence.as_millis() as u64,
                        });
                    }
                    ping_seq += 1;
                    if !self.write(sink, Frame::ping(ping_seq)).await? {
                        return Ok(CloseReason::Shutdown);
                    }
                }

                next = queue.checkout() => match next {
                    Ok(checkout) => {
                        let frame = Frame::message(checkout.envelope().clone());
                        match self.write(sink, frame).await {
                            Ok(true) => {
                                queue.commit(&checkout);
                                debug!(
                                    "Delivered envelope {} to node {}",
                                    checkout.envelope().id(),
                                    self.node_id
                                );
                            }
                            Ok(false) => {
                                queue.restore(checkout);
                                return Ok(CloseReason::Shutdown);
                            }
                            Err(e) => {
                                queue.restore(checkout);
                                return Err(e);
                            }
                        }
                    }
                    Err(_) => return Ok(CloseReason::QueueClosed),
                },
            }
        }
    }

    /// Write one frame within the write timeout.
    ///
    /// Returns `Ok(false)` when the session was cancelled before the write
    /// completed.
    async fn write(&self, sink: &mut dyn FrameSink, frame: Frame) -> Result<bool, SessionError> {
        let timeout = self.config.write_timeout();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Ok(false),
            written = tokio::time::timeout(timeout, sink.write_frame(frame)) => match written {
                Ok(Ok(())) => Ok(true),
                Ok(Err(e)) => Err(SessionError::WriteFailed {
                    node_id: self.node_id.to_string(),
                    reason: e.to_string(),
                }),
                Err(_) => Err(SessionError::WriteTimeout {
                    node_id: self.node_id.to_string(),
                    duration_ms: timeout.as_millis() as u64,
                }),
            },
        }
    }
}

async fn read_loop(
    mut source: Box<dyn FrameSource>,
    registry: Arc<QueueRegistry>,
    node_id: NodeId,
    liveness: Arc<Liveness>,
    control: mpsc::Sender<Frame>,
    cancel: CancellationToken,
) -> Result<CloseReason, SessionError> {
    let result = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(CloseReason::Shutdown),
            next = source.read_frame() => next,
        };

        match next {
            Ok(Some(frame)) => {
                liveness.touch();
                handle_inbound(frame, &registry, &node_id, &control);
            }
            Ok(None) => {
                info!("Node {} closed the connection", node_id);
                break Ok(CloseReason::PeerClosed);
            }
            Err(e) => {
                break Err(SessionError::ReadFailed {
                    node_id: node_id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    };

    cancel.cancel();
    result
}

fn handle_inbound(
    frame: Frame,
    registry: &QueueRegistry,
    node_id: &NodeId,
    control: &mpsc::Sender<Frame>,
) {
    match frame {
        Frame::Message { envelope } => {
            let envelope = envelope.into_cloud_bound(node_id);
            let id = envelope.id().clone();
            match registry.publish(envelope) {
                Ok(route) => debug!("Envelope {} from node {} routed to {}", id, node_id, route),
                Err(e) => warn!("Dropping envelope {} from node {}: {}", id, node_id, e),
            }
        }
        Frame::Control {
            control: Control::Ping { seq },
        } => {
            if control.try_send(Frame::pong(seq)).is_err() {
                debug!("Control buffer full, skipping pong {} to node {}", seq, node_id);
            }
        }
        Frame::Control {
            control: Control::Pong { seq },
        } => debug!("Keepalive pong {} from node {}", seq, node_id),
        Frame::Control { control } => {
            debug!("Ignoring unexpected control frame {:?} from node {}", control, node_id)
        }
    }
}

/// Close the transport, giving up after `timeout` so a peer that stopped
/// reading cannot hold the session in `Closing`
async fn close_sink(sink: &mut dyn FrameSink, node_id: &NodeId, timeout: Duration) {
    match tokio::time::timeout(timeout, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Error closing transport for node {}: {}", node_id, e),
        Err(_) => warn!(
            "Closing transport for node {} timed out after {:?}, dropping it",
            node_id, timeout
        ),
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
