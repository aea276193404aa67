//! Node Queue
//!
//! One queue per edge node, holding:
//! - the outbound buffer (cloud → node) drained by the node's session
//! - the inbound buffer (node → cloud) used when no cloud sink is attached
//!
//! Outbound envelopes leave in exactly the order they were accepted. Senders
//! never block: a send that would exceed the count capacity or the byte budget
//! either fails with [`QueueError::Full`] or evicts the oldest envelopes,
//! depending on [`QueueFullPolicy`]. Receivers wait on a [`Notify`] and pop
//! synchronously, so a receive future dropped by `select!` never loses an
//! envelope.
//!
//! A session writer takes envelopes through [`NodeQueue::checkout`]. The
//! checked-out envelope stays counted against the bounds until the writer
//! either commits it (written) or restores it to the head (write failed), so
//! the queue never holds more than its capacity.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cloudhub_core::{Envelope, NodeId, QueueConfig, QueueError, QueueFullPolicy};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

// ----------------------------------------------------------------------------
// Queue Statistics
// ----------------------------------------------------------------------------

/// Counters describing what a queue did with the envelopes offered to it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Outbound envelopes accepted
    pub enqueued: u64,
    /// Outbound envelopes handed to a receiver
    pub dequeued: u64,
    /// Outbound envelopes refused with `QueueFull`
    pub rejected: u64,
    /// Outbound envelopes evicted by the drop-oldest policy
    pub evicted: u64,
    /// Outbound envelopes discarded because they outlived the retention period
    pub expired: u64,
    /// Checked-out envelopes restored after a failed write
    pub requeued: u64,
    /// Inbound envelopes accepted
    pub inbound: u64,
}

// ----------------------------------------------------------------------------
// Node Queue
// ----------------------------------------------------------------------------

struct Queued {
    envelope: Envelope,
    size: usize,
    enqueued_at: Instant,
}

struct InFlight {
    ticket: u64,
    queued: Queued,
}

#[derive(Default)]
struct QueueState {
    outbound: VecDeque<Queued>,
    outbound_bytes: usize,
    in_flight: Option<InFlight>,
    next_ticket: u64,
    inbound: VecDeque<Envelope>,
    closed: bool,
    stats: QueueStats,
}

impl QueueState {
    fn held_len(&self) -> usize {
        self.outbound.len() + usize::from(self.in_flight.is_some())
    }

    fn held_bytes(&self) -> usize {
        self.outbound_bytes + self.in_flight.as_ref().map_or(0, |f| f.queued.size)
    }

    /// Put the checked-out envelope back at the head, keeping its age
    fn restore_in_flight(&mut self) -> bool {
        match self.in_flight.take() {
            Some(in_flight) => {
                self.outbound_bytes += in_flight.queued.size;
                self.outbound.push_front(in_flight.queued);
                self.stats.requeued += 1;
                true
            }
            None => false,
        }
    }
}

/// An outbound envelope handed to a writer and not yet confirmed.
///
/// Pass it to [`NodeQueue::commit`] once written or to
/// [`NodeQueue::restore`] when the write failed.
#[derive(Debug)]
pub struct Checkout {
    ticket: u64,
    envelope: Envelope,
}

impl Checkout {
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }
}

/// Bounded FIFO buffers for one edge node
pub struct NodeQueue {
    node_id: NodeId,
    config: QueueConfig,
    state: Mutex<QueueState>,
    outbound_ready: Notify,
    inbound_ready: Notify,
}

impl std::fmt::Debug for NodeQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("NodeQueue")
            .field("node_id", &self.node_id)
            .field("outbound", &state.outbound.len())
            .field("outbound_bytes", &state.outbound_bytes)
            .field("in_flight", &state.in_flight.is_some())
            .field("inbound", &state.inbound.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl NodeQueue {
    /// Create an empty queue for `node_id`
    pub fn new(node_id: NodeId, config: QueueConfig) -> Self {
        Self {
            node_id,
            config,
            state: Mutex::new(QueueState::default()),
            outbound_ready: Notify::new(),
            inbound_ready: Notify::new(),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Append an outbound envelope without blocking.
    ///
    /// Fails with [`QueueError::Closed`] after [`close`](Self::close) and with
    /// [`QueueError::Full`] when the envelope does not fit and the policy is
    /// [`QueueFullPolicy::RejectNewest`], or when the envelope alone exceeds
    /// the byte budget.
    pub fn send(&self, envelope: Envelope) -> Result<(), QueueError> {
        let size = envelope.size_hint();
        let mut state = self.lock();

        if state.closed {
            return Err(self.closed_error());
        }

        if self.config.max_bytes.is_some_and(|max| size > max) {
            state.stats.rejected += 1;
            return Err(self.full_error(&state));
        }

        while !self.fits(&state, size) {
            match self.config.full_policy {
                QueueFullPolicy::RejectNewest => {
                    state.stats.rejected += 1;
                    return Err(self.full_error(&state));
                }
                QueueFullPolicy::DropOldest => match state.outbound.pop_front() {
                    Some(evicted) => {
                        state.outbound_bytes -= evicted.size;
                        state.stats.evicted += 1;
                        warn!(
                            "Queue for node {} full, evicting oldest envelope {}",
                            self.node_id,
                            evicted.envelope.id()
                        );
                    }
                    // Only the checked-out envelope is left and it cannot be evicted
                    None => {
                        state.stats.rejected += 1;
                        return Err(self.full_error(&state));
                    }
                },
            }
        }

        state.outbound_bytes += size;
        state.stats.enqueued += 1;
        state.outbound.push_back(Queued {
            envelope,
            size,
            enqueued_at: Instant::now(),
        });
        drop(state);

        self.outbound_ready.notify_one();
        Ok(())
    }

    /// Wait for the next outbound envelope.
    ///
    /// Cancel safe: dropping the future before it completes leaves the queue
    /// untouched. Fails with [`QueueError::Closed`] once the queue is closed.
    pub async fn receive(&self) -> Result<Envelope, QueueError> {
        loop {
            let notified = self.outbound_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return Err(self.closed_error());
                }
                if let Some(queued) = self.pop_live(&mut state) {
                    state.stats.dequeued += 1;
                    return Ok(queued.envelope);
                }
            }

            notified.await;
        }
    }

    /// Pop the next outbound envelope if one is buffered
    pub fn try_receive(&self) -> Option<Envelope> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        let queued = self.pop_live(&mut state)?;
        state.stats.dequeued += 1;
        Some(queued.envelope)
    }

    /// Wait for the next outbound envelope and hold it as in flight.
    ///
    /// The envelope keeps counting toward `len` and `bytes` until it is
    /// committed or restored. A checkout left outstanding by a writer that went
    /// away is restored to the head before the next one is taken. Cancel safe
    /// in the same way as [`receive`](Self::receive).
    pub async fn checkout(&self) -> Result<Checkout, QueueError> {
        loop {
            let notified = self.outbound_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return Err(self.closed_error());
                }
                if state.restore_in_flight() {
                    debug!(
                        "Restored abandoned in-flight envelope for node {}",
                        self.node_id
                    );
                }
                if let Some(queued) = self.pop_live(&mut state) {
                    state.next_ticket += 1;
                    let checkout = Checkout {
                        ticket: state.next_ticket,
                        envelope: queued.envelope.clone(),
                    };
                    state.in_flight = Some(InFlight {
                        ticket: checkout.ticket,
                        queued,
                    });
                    return Ok(checkout);
                }
            }

            notified.await;
        }
    }

    /// Confirm a checked-out envelope as written.
    ///
    /// Returns false when the checkout was already superseded by a newer one.
    pub fn commit(&self, checkout: &Checkout) -> bool {
        let mut state = self.lock();
        if !state
            .in_flight
            .as_ref()
            .is_some_and(|f| f.ticket == checkout.ticket)
        {
            return false;
        }
        state.in_flight = None;
        state.stats.dequeued += 1;
        true
    }

    /// Put a checked-out envelope back at the head after a failed write.
    ///
    /// The envelope keeps its original age, so one that keeps failing still
    /// expires. Returns false when the checkout was already superseded.
    pub fn restore(&self, checkout: Checkout) -> bool {
        let mut state = self.lock();
        if !state
            .in_flight
            .as_ref()
            .is_some_and(|f| f.ticket == checkout.ticket)
        {
            return false;
        }
        state.restore_in_flight();
        drop(state);

        debug!("Restored undelivered envelope for node {}", self.node_id);
        self.outbound_ready.notify_one();
        true
    }

    /// Buffer an envelope received from the node for cloud consumers
    pub fn deliver(&self, envelope: Envelope) -> Result<(), QueueError> {
        let mut state = self.lock();
        if state.closed {
            return Err(self.closed_error());
        }
        if state.inbound.len() >= self.config.inbound_capacity {
            return Err(QueueError::Full {
                node_id: self.node_id.to_string(),
                capacity: self.config.inbound_capacity,
                bytes: 0,
            });
        }

        state.inbound.push_back(envelope);
        state.stats.inbound += 1;
        drop(state);

        self.inbound_ready.notify_one();
        Ok(())
    }

    /// Wait for the next envelope received from the node
    pub async fn recv_inbound(&self) -> Result<Envelope, QueueError> {
        loop {
            let notified = self.inbound_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(envelope) = state.inbound.pop_front() {
                    return Ok(envelope);
                }
                if state.closed {
                    return Err(self.closed_error());
                }
            }

            notified.await;
        }
    }

    /// Pop the next inbound envelope if one is buffered
    pub fn try_recv_inbound(&self) -> Option<Envelope> {
        self.lock().inbound.pop_front()
    }

    /// Close the queue, waking every waiting receiver.
    ///
    /// Buffered outbound envelopes stay available to [`drain`](Self::drain).
    pub fn close(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);

        debug!("Closed queue for node {}", self.node_id);
        self.outbound_ready.notify_waiters();
        self.inbound_ready.notify_waiters();
    }

    /// Remove and return every held outbound envelope, oldest first.
    ///
    /// An outstanding checkout is included and can no longer be committed.
    pub fn drain(&self) -> Vec<Envelope> {
        let mut state = self.lock();
        state.restore_in_flight();
        state.outbound_bytes = 0;
        std::mem::take(&mut state.outbound)
            .into_iter()
            .map(|queued| queued.envelope)
            .collect()
    }

    /// Number of held outbound envelopes, including one checked out
    pub fn len(&self) -> usize {
        self.lock().held_len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().held_len() == 0
    }

    /// Total size of held outbound envelopes, including one checked out
    pub fn bytes(&self) -> usize {
        self.lock().held_bytes()
    }

    /// Number of buffered inbound envelopes
    pub fn inbound_len(&self) -> usize {
        self.lock().inbound.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn stats(&self) -> QueueStats {
        self.lock().stats
    }

    // ------------------------------------------------------------------------
    // Internal Helpers
    // ------------------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fits(&self, state: &QueueState, size: usize) -> bool {
        state.held_len() < self.config.capacity
            && self
                .config
                .max_bytes
                .map_or(true, |max| state.held_bytes() + size <= max)
    }

    /// Pop the head, discarding envelopes that outlived the retention period
    fn pop_live(&self, state: &mut QueueState) -> Option<Queued> {
        let retention = self.config.retention();
        while let Some(queued) = state.outbound.pop_front() {
            state.outbound_bytes -= queued.size;
            if is_expired(queued.enqueued_at, retention) {
                state.stats.expired += 1;
                warn!(
                    "Discarding envelope {} for node {}: retention period exceeded",
                    queued.envelope.id(),
                    self.node_id
                );
                continue;
            }
            return Some(queued);
        }
        None
    }

    fn full_error(&self, state: &QueueState) -> QueueError {
        QueueError::Full {
            node_id: self.node_id.to_string(),
            capacity: self.config.capacity,
            bytes: state.held_bytes(),
        }
    }

    fn closed_error(&self) -> QueueError {
        QueueError::Closed {
            node_id: self.node_id.to_string(),
        }
    }
}

fn is_expired(enqueued_at: Instant, retention: Option<Duration>) -> bool {
    retention.is_some_and(|retention| enqueued_at.elapsed() > retention)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
