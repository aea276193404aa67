//! Dispatcher Task
//!
//! Drains the shared ingress stream and routes each envelope through
//! [`QueueRegistry::publish`]. Publishing never waits on a node, so one slow
//! or absent node cannot hold up delivery to any other.

use std::sync::Arc;

use cloudhub_core::HubResult;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{IngressItem, IngressReceiver};
use crate::registry::QueueRegistry;

/// Counters reported when the dispatcher stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub rejected: u64,
}

/// Routes cloud-originated envelopes into node queues
pub struct Dispatcher {
    registry: Arc<QueueRegistry>,
    ingress: IngressReceiver,
    cancel: CancellationToken,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<QueueRegistry>,
        ingress: IngressReceiver,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            ingress,
            cancel,
            stats: DispatchStats::default(),
        }
    }

    /// Main dispatch loop.
    ///
    /// Stops when cancelled or when every ingress sender is gone. On
    /// cancellation the items already buffered on the ingress stream are still
    /// routed, so they end up in node queues rather than being lost.
    pub async fn run(mut self) -> HubResult<DispatchStats> {
        info!("Dispatcher starting");

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    self.ingress.close();
                    while let Ok(item) = self.ingress.try_recv() {
                        self.dispatch(item);
                    }
                    break;
                }

                item = self.ingress.recv() => match item {
                    Some(item) => self.dispatch(item),
                    None => {
                        debug!("All ingress senders dropped");
                        break;
                    }
                },
            }
        }

        info!(
            "Dispatcher stopped: {} dispatched, {} rejected",
            self.stats.dispatched, self.stats.rejected
        );
        Ok(self.stats)
    }

    fn dispatch(&mut self, item: IngressItem) {
        let IngressItem { envelope, ack } = item;
        let id = envelope.id().clone();
        let destination = envelope.destination().to_string();
        let result = self.registry.publish(envelope);

        match &result {
            Ok(route) => {
                self.stats.dispatched += 1;
                debug!("Dispatched envelope {} to {}", id, route);
            }
            Err(e) => {
                self.stats.rejected += 1;
                if ack.is_none() {
                    warn!(
                        "Rejected envelope {} for destination {:?}: {}",
                        id, destination, e
                    );
                }
            }
        }

        if let Some(ack) = ack {
            // The producer may have stopped waiting
            let _ = ack.send(result);
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
