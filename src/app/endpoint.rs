use crate::app::config::EndpointConfig;
use crate::buffer::{
    Batch, BatchManager, FlushReason, PushOutcome, QueueError, QueueReceiver, QueueSender,
    bounded,
};
use crate::domain::{EndpointError, Entry, LabelSet};
use crate::reliability::{
    Delivery, DeliveryError, DeliveryFailure, EndpointMetrics, Metrics, ReliableSender,
    drop_reason,
};
use crate::sender::ClientError;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type SendOutcome = (usize, Result<Delivery, DeliveryError>);

/// Write side of an endpoint client's queue.
#[derive(Clone)]
pub struct EndpointHandle {
    name: Arc<str>,
    tx: QueueSender<Arc<Entry>>,
}

impl EndpointHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues `entry` for this endpoint, waiting for room under the
    /// `block` policy.
    pub async fn submit(&self, entry: Arc<Entry>) -> Result<PushOutcome, QueueError> {
        self.tx.send(entry).await
    }

    pub fn try_submit(&self, entry: Arc<Entry>) -> Result<PushOutcome, QueueError> {
        self.tx.try_send(entry)
    }
}

/// One remote push target: its queue, its batch manager and its send pool.
///
/// Clients share nothing with each other. A stalled endpoint only ever
/// fills its own send backlog, and drops from it once it is full.
pub struct EndpointClient {
    name: Arc<str>,
    config: EndpointConfig,
    engine_labels: LabelSet,
    metrics: EndpointMetrics,
    sender: ReliableSender,
    tx: QueueSender<Arc<Entry>>,
    rx: Option<QueueReceiver<Arc<Entry>>>,
    shutdown: CancellationToken,
    abort: CancellationToken,
    worker: Option<JoinHandle<WorkerReport>>,
    grace: Option<JoinHandle<()>>,
}

impl EndpointClient {
    pub fn new(
        name: impl Into<String>,
        config: EndpointConfig,
        engine_labels: LabelSet,
        metrics: &Metrics,
    ) -> Result<Self, ClientError> {
        let name: Arc<str> = Arc::from(name.into());
        let metrics = metrics.endpoint(&name);
        let abort = CancellationToken::new();
        let sender = ReliableSender::new(&config, metrics.clone(), abort.clone())?;
        let (tx, rx) = bounded(
            config.queue.capacity,
            config.queue.policy,
            metrics.dropped_counter(drop_reason::QUEUE_FULL),
        );

        Ok(Self {
            name,
            config,
            engine_labels,
            metrics,
            sender,
            tx,
            rx: Some(rx),
            shutdown: CancellationToken::new(),
            abort,
            worker: None,
            grace: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metrics(&self) -> &EndpointMetrics {
        &self.metrics
    }

    pub fn handle(&self) -> EndpointHandle {
        EndpointHandle {
            name: Arc::clone(&self.name),
            tx: self.tx.clone(),
        }
    }

    /// Spawns the accumulation and flush task. Calling it twice is a no-op.
    pub fn start(&mut self) {
        let Some(rx) = self.rx.take() else {
            warn!("Endpoint {} already started", self.name);
            return;
        };

        let worker = Worker {
            name: Arc::clone(&self.name),
            manager: BatchManager::new(self.config.batch_config(&self.engine_labels)),
            metrics: self.metrics.clone(),
            sender: self.sender.clone(),
            rx,
            backlog: VecDeque::new(),
            max_pending: self.config.max_pending_batches.max(1),
            in_flight: JoinSet::new(),
            max_in_flight: self.config.max_in_flight.max(1),
            shutdown: self.shutdown.clone(),
            shutting_down: false,
            report: WorkerReport::default(),
        };

        info!(
            "Starting endpoint {} -> {} (batch_wait={:?}, batch_size={}, max_in_flight={})",
            self.name,
            self.config.url,
            self.config.batch_wait,
            self.config.batch_size,
            self.config.max_in_flight
        );
        self.worker = Some(tokio::spawn(worker.run()));
    }

    /// Starts the shutdown grace clock: once it runs out, pending sends and
    /// backoffs are aborted. Arming it again has no effect.
    pub fn start_grace_period(&mut self) {
        if self.grace.is_some() {
            return;
        }
        let abort = self.abort.clone();
        let grace = self.config.shutdown_grace;
        let name = Arc::clone(&self.name);
        self.grace = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if !abort.is_cancelled() {
                warn!(
                    "Shutdown grace period of {:?} elapsed for {}, aborting pending sends",
                    grace, name
                );
                abort.cancel();
            }
        }));
    }

    /// Flushes whatever is buffered or queued and waits for every send to
    /// resolve, bounded by the grace period.
    pub async fn stop(&mut self) -> Result<(), EndpointError> {
        self.start_grace_period();
        self.shutdown.cancel();

        let result = match self.worker.take() {
            Some(worker) => match worker.await {
                Ok(report) => report.into_result(&self.name),
                Err(e) => Err(EndpointError::Worker {
                    endpoint: self.name.to_string(),
                    reason: e.to_string(),
                }),
            },
            None => Ok(()),
        };

        if let Some(grace) = self.grace.take() {
            grace.abort();
        }
        info!("Endpoint {} stopped", self.name);
        result
    }

    pub fn shutdown_grace(&self) -> Duration {
        self.config.shutdown_grace
    }
}

impl Drop for EndpointClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(grace) = self.grace.take() {
            grace.abort();
        }
    }
}

#[derive(Debug, Default)]
struct WorkerReport {
    lost_batches: usize,
    lost_entries: usize,
    last_error: Option<String>,
}

impl WorkerReport {
    fn record_loss(&mut self, entries: usize, error: String) {
        self.lost_batches += 1;
        self.lost_entries += entries;
        self.last_error = Some(error);
    }

    fn into_result(self, endpoint: &str) -> Result<(), EndpointError> {
        if self.lost_batches == 0 {
            return Ok(());
        }
        Err(EndpointError::ShutdownLoss {
            endpoint: endpoint.to_string(),
            batches: self.lost_batches,
            entries: self.lost_entries,
            last_error: self.last_error.unwrap_or_default(),
        })
    }
}

/// Accumulates and flushes for one endpoint.
///
/// The loop never waits on a send. Flushed batches wait in `backlog`
/// (FIFO, at most `max_pending`) until one of `max_in_flight` slots frees up.
struct Worker {
    name: Arc<str>,
    manager: BatchManager,
    metrics: EndpointMetrics,
    sender: ReliableSender,
    rx: QueueReceiver<Arc<Entry>>,
    backlog: VecDeque<Batch>,
    max_pending: usize,
    in_flight: JoinSet<SendOutcome>,
    max_in_flight: usize,
    shutdown: CancellationToken,
    shutting_down: bool,
    report: WorkerReport,
}

impl Worker {
    async fn run(mut self) -> WorkerReport {
        loop {
            let deadline = self.manager.deadline();
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    self.settle(joined);
                    self.start_sends();
                }
                entry = self.rx.recv() => match entry {
                    Some(entry) => {
                        self.accept(entry);
                        if self.manager.size_triggered() {
                            self.dispatch(FlushReason::Size);
                        }
                    }
                    None => break,
                },
                () = sleep_until(deadline.unwrap_or_else(far_future)), if deadline.is_some() => {
                    self.dispatch(FlushReason::Time);
                }
            }
        }

        self.drain().await;
        self.report
    }

    async fn drain(&mut self) {
        self.shutting_down = true;
        self.rx.close();
        while let Some(entry) = self.rx.try_recv() {
            self.accept(entry);
            if self.manager.size_triggered() {
                self.dispatch(FlushReason::Size);
            }
        }
        self.dispatch(FlushReason::Shutdown);

        while let Some(joined) = self.in_flight.join_next().await {
            self.settle(joined);
            self.start_sends();
        }
    }

    fn accept(&mut self, entry: Arc<Entry>) {
        self.metrics.record_received();
        if let Err(e) = self.manager.append(entry) {
            debug!("Endpoint {} dropped entry: {}", self.name, e);
            self.metrics.record_dropped(e.reason(), 1);
        }
    }

    fn dispatch(&mut self, reason: FlushReason) {
        for batch in self.manager.flush(reason) {
            debug!(
                "Flushing batch {} for {} ({} entries, {} bytes, reason={})",
                batch.id(),
                self.name,
                batch.entry_count(),
                batch.bytes(),
                reason.as_str()
            );
            if self.backlog.len() >= self.max_pending {
                warn!(
                    "Endpoint {} has {} batches waiting to be sent, dropping batch {} ({} entries)",
                    self.name,
                    self.backlog.len(),
                    batch.id(),
                    batch.entry_count()
                );
                self.metrics
                    .record_dropped(drop_reason::BACKLOG_FULL, batch.entry_count());
                if self.shutting_down {
                    self.report
                        .record_loss(batch.entry_count(), "send backlog full".to_string());
                }
                continue;
            }
            self.backlog.push_back(batch);
        }
        self.start_sends();
    }

    /// Moves backlogged batches into free send slots, oldest first.
    fn start_sends(&mut self) {
        while self.in_flight.len() < self.max_in_flight {
            let Some(batch) = self.backlog.pop_front() else {
                break;
            };
            let sender = self.sender.clone();
            self.in_flight
                .spawn(async move { (batch.entry_count(), sender.deliver(&batch).await) });
        }
    }

    fn settle(&mut self, joined: Result<SendOutcome, JoinError>) {
        match joined {
            Ok((_, Ok(_))) => {}
            Ok((entries, Err(e))) => {
                if self.shutting_down || e.kind == DeliveryFailure::Aborted {
                    self.report.record_loss(entries, e.kind.to_string());
                }
            }
            Err(e) => {
                error!("Send task for {} failed: {}", self.name, e);
                self.report.record_loss(0, e.to_string());
            }
        }
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365)
}
