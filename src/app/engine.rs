use super::config::EngineConfig;
use super::endpoint::EndpointClient;
use super::fanout::FanoutIngress;
use crate::buffer::{PushOutcome, QueueError, QueueSender, bounded};
use crate::domain::{EndpointError, Entry, ShutdownError, WriteError};
use crate::reliability::{INGRESS_ENDPOINT, Metrics, drop_reason};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cloneable write-only entry point into a running engine.
#[derive(Clone)]
pub struct IngressHandle {
    tx: QueueSender<Entry>,
}

impl IngressHandle {
    /// Queues an entry, waiting for room under the `block` policy.
    /// Fails with [`QueueError::Closed`] once the engine is shutting down.
    pub async fn send(&self, entry: Entry) -> Result<PushOutcome, QueueError> {
        self.tx.send(entry).await
    }

    pub fn try_send(&self, entry: Entry) -> Result<PushOutcome, QueueError> {
        self.tx.try_send(entry)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A running set of endpoint clients fed from one ingress queue.
pub struct Engine {
    ingress: QueueSender<Entry>,
    metrics: Metrics,
    clients: Vec<EndpointClient>,
    fanout: Option<JoinHandle<()>>,
    fanout_shutdown: CancellationToken,
}

impl Engine {
    /// Validates `config`, builds every endpoint client and only then spawns
    /// any task. Must be called inside a tokio runtime.
    pub fn start(config: EngineConfig) -> Result<Self, WriteError> {
        config.validate()?;
        let metrics = Metrics::new()?;

        let mut clients = Vec::with_capacity(config.endpoints.len());
        for (index, endpoint) in config.endpoints.iter().enumerate() {
            let name = endpoint.resolved_name(index);
            let client = EndpointClient::new(
                name.clone(),
                endpoint.clone(),
                config.external_labels.clone(),
                &metrics,
            )
            .map_err(|source| WriteError::Client {
                endpoint: name,
                source,
            })?;
            clients.push(client);
        }

        let (ingress, rx) = bounded(
            config.ingress.capacity,
            config.ingress.policy,
            metrics.dropped_counter(INGRESS_ENDPOINT, drop_reason::QUEUE_FULL),
        );

        for client in &mut clients {
            client.start();
        }

        let fanout_shutdown = CancellationToken::new();
        let handles = clients.iter().map(EndpointClient::handle).collect();
        let fanout = FanoutIngress::new(rx, handles, fanout_shutdown.clone()).spawn();

        info!("Engine started with {} endpoint(s)", clients.len());

        Ok(Self {
            ingress,
            metrics,
            clients,
            fanout: Some(fanout),
            fanout_shutdown,
        })
    }

    pub fn ingress(&self) -> IngressHandle {
        IngressHandle {
            tx: self.ingress.clone(),
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &str> {
        self.clients.iter().map(EndpointClient::name)
    }

    /// Stops ingress, flushes every endpoint and waits for the outcome.
    ///
    /// Each endpoint gets its own `shutdown_grace`; whatever it could not
    /// deliver in time is listed in the returned error.
    pub async fn shutdown(mut self) -> Result<(), ShutdownError> {
        info!("Shutting down engine");
        self.fanout_shutdown.cancel();
        for client in &mut self.clients {
            client.start_grace_period();
        }

        let mut failures: Vec<EndpointError> = Vec::new();
        if let Some(fanout) = self.fanout.take()
            && let Err(e) = fanout.await
        {
            failures.push(EndpointError::Worker {
                endpoint: INGRESS_ENDPOINT.to_string(),
                reason: e.to_string(),
            });
        }

        let results = join_all(self.clients.iter_mut().map(|client| client.stop())).await;
        failures.extend(results.into_iter().filter_map(Result::err));

        if failures.is_empty() {
            info!("Engine shut down cleanly");
            Ok(())
        } else {
            for failure in &failures {
                warn!("{}", failure);
            }
            Err(ShutdownError { failures })
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.fanout_shutdown.cancel();
    }
}
