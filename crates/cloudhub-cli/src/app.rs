//! Hub application assembly
//!
//! Loads credential material, wires the enabled protocol servers into a
//! [`HubBuilder`] and runs the hub until a stop signal arrives.

use std::future::Future;

use cloudhub_core::{HubConfig, TlsMaterial};
use cloudhub_quic::QuicServer;
use cloudhub_runtime::{create_cloud_sink, CloudSinkReceiver, HubBuilder, ShutdownReport};
use cloudhub_websocket::WebSocketServer;
use tracing::{debug, info};

use crate::error::{CliError, Result};

/// A hub ready to start: configuration checked and credentials loaded
pub struct HubApp {
    config: HubConfig,
    credentials: TlsMaterial,
}

impl HubApp {
    /// Check that there is something to serve and load the credentials.
    ///
    /// Fails before any listener is bound.
    pub fn new(config: HubConfig) -> Result<Self> {
        if config.enabled_transports().is_empty() {
            return Err(CliError::NoTransports);
        }

        let credentials = TlsMaterial::load(&config.credentials)?;
        credentials.validate()?;
        Ok(Self {
            config,
            credentials,
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Run the hub until `signal` completes, then shut it down
    pub async fn run<F>(self, signal: F) -> Result<ShutdownReport>
    where
        F: Future<Output = ()>,
    {
        info!(
            "Enabled transports: {}",
            self.config.enabled_transports().join(", ")
        );

        let (sink, upstream) = create_cloud_sink(&self.config.channels);
        let mut builder = HubBuilder::new(self.config.clone())
            .with_credentials(self.credentials)
            .with_cloud_sink(sink);
        if self.config.websocket.enabled {
            builder = builder.add_server(Box::new(WebSocketServer::new(
                self.config.websocket.clone(),
            )));
        }
        if self.config.quic.enabled {
            builder = builder.add_server(Box::new(QuicServer::new(self.config.quic.clone())));
        }

        let hub = builder.build_and_start().await?;
        let upstream = tokio::spawn(log_upstream(upstream));

        hub.wait_for_stop(signal).await;
        let report = hub.shutdown().await;
        upstream.abort();
        Ok(report)
    }
}

/// Node-originated envelopes have no cloud consumer in the standalone binary
async fn log_upstream(mut upstream: CloudSinkReceiver) {
    while let Some(envelope) = upstream.recv().await {
        info!(
            "Upstream {} {} from node {} ({} bytes)",
            envelope.operation(),
            envelope.resource(),
            envelope.source(),
            envelope.payload().len()
        );
    }
    debug!("Cloud sink closed");
}
