use super::endpoint::EndpointHandle;
use crate::buffer::{QueueError, QueueReceiver};
use crate::domain::Entry;
use futures::future::join_all;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Moves entries from the shared ingress queue to every endpoint client.
pub struct FanoutIngress {
    rx: QueueReceiver<Entry>,
    clients: Vec<EndpointHandle>,
    shutdown: CancellationToken,
}

impl FanoutIngress {
    pub fn new(
        rx: QueueReceiver<Entry>,
        clients: Vec<EndpointHandle>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            rx,
            clients,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs until shutdown is requested or every producer is gone, then
    /// forwards whatever is still queued before returning.
    pub async fn run(mut self) {
        let mut forwarded: u64 = 0;
        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                entry = self.rx.recv() => match entry {
                    Some(entry) => {
                        self.forward(entry).await;
                        forwarded += 1;
                    }
                    None => break,
                },
            }
        }

        self.rx.close();
        let mut drained: u64 = 0;
        while let Some(entry) = self.rx.try_recv() {
            self.forward(entry).await;
            drained += 1;
        }
        info!(
            "Fan-out stopped after forwarding {} entries ({} drained at shutdown)",
            forwarded + drained,
            drained
        );
    }

    /// Submits to all clients at once, so one client waiting for queue room
    /// does not hold the entry back from the others.
    async fn forward(&self, entry: Entry) {
        let entry = Arc::new(entry);
        let results = join_all(
            self.clients
                .iter()
                .map(|client| client.submit(Arc::clone(&entry))),
        )
        .await;

        for (client, result) in self.clients.iter().zip(results) {
            if let Err(QueueError::Closed) = result {
                debug!("Endpoint {} no longer accepts entries", client.name());
            }
        }
    }
}
