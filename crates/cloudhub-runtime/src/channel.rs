//! Channels between cloud components and the hub
//!
//! - The ingress stream carries cloud-originated envelopes to the dispatcher.
//!   Producers may ask for a confirmation carrying the routing outcome, so a
//!   `QueueFull` rejection reaches them instead of only the log.
//! - The cloud sink carries node-originated envelopes to cloud components.

use cloudhub_core::{ChannelConfig, Envelope, HubError, HubResult};
use tokio::sync::{mpsc, oneshot};

use crate::registry::Route;

/// One envelope on the ingress stream
#[derive(Debug)]
pub struct IngressItem {
    pub envelope: Envelope,
    /// Receives the routing outcome when the producer asked for it
    pub ack: Option<oneshot::Sender<HubResult<Route>>>,
}

/// Receiving end of the ingress stream, owned by the dispatcher
pub type IngressReceiver = mpsc::Receiver<IngressItem>;

/// Sending end of the cloud sink
pub type CloudSinkSender = mpsc::Sender<Envelope>;
/// Receiving end of the cloud sink, owned by cloud components
pub type CloudSinkReceiver = mpsc::Receiver<Envelope>;

/// Handle cloud components use to submit envelopes for dispatch
#[derive(Debug, Clone)]
pub struct IngressSender {
    inner: mpsc::Sender<IngressItem>,
}

impl IngressSender {
    /// Submit an envelope, waiting only for room on the ingress stream
    pub async fn submit(&self, envelope: Envelope) -> HubResult<()> {
        self.inner
            .send(IngressItem {
                envelope,
                ack: None,
            })
            .await
            .map_err(|_| HubError::channel("dispatcher is not running"))
    }

    /// Submit without waiting; fails when the ingress stream is full
    pub fn try_submit(&self, envelope: Envelope) -> HubResult<()> {
        self.inner
            .try_send(IngressItem {
                envelope,
                ack: None,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => HubError::channel("ingress stream is full"),
                mpsc::error::TrySendError::Closed(_) => {
                    HubError::channel("dispatcher is not running")
                }
            })
    }

    /// Submit an envelope and wait for the dispatcher's routing decision
    pub async fn submit_and_confirm(&self, envelope: Envelope) -> HubResult<Route> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.inner
            .send(IngressItem {
                envelope,
                ack: Some(ack_tx),
            })
            .await
            .map_err(|_| HubError::channel("dispatcher is not running"))?;

        ack_rx
            .await
            .map_err(|_| HubError::channel("dispatcher stopped before routing the envelope"))?
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// Create the ingress stream between cloud components and the dispatcher
pub fn create_ingress_channel(config: &ChannelConfig) -> (IngressSender, IngressReceiver) {
    let (tx, rx) = mpsc::channel(config.ingress_buffer_size);
    (IngressSender { inner: tx }, rx)
}

/// Create the cloud sink for node-originated envelopes
pub fn create_cloud_sink(config: &ChannelConfig) -> (CloudSinkSender, CloudSinkReceiver) {
    mpsc::channel(config.cloud_sink_buffer_size)
}
