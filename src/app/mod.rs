pub mod config;
pub mod endpoint;
pub mod engine;
pub mod fanout;
pub mod logging_system;
pub mod shutdown;

pub use config::{
    Cli, ConfigError, EndpointConfig, EngineConfig, LogFormat, LogLevel, QueueConfig, RetryConfig,
};
pub use endpoint::{EndpointClient, EndpointHandle};
pub use engine::{Engine, IngressHandle};
pub use fanout::FanoutIngress;
pub use logging_system::{LoggingError, LoggingSystem};
pub use shutdown::wait_for_signal;

use crate::domain::{Entry, LabelSet};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Labels for stdin lines when none are given with `--label`.
const DEFAULT_JOB: (&str, &str) = ("job", "loki-write");

/// Binary entry point: pushes stdin lines until EOF or a shutdown signal.
pub async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.load()?;

    let mut logging = LoggingSystem::new();
    logging.add_default_directives();
    logging.initialize(config.log_level, config.log_format)?;

    info!("Starting loki-write v{}", crate::VERSION);
    for (index, endpoint) in config.endpoints.iter().enumerate() {
        info!(
            "Endpoint {}: url={}, tenant={:?}",
            endpoint.resolved_name(index),
            endpoint.url,
            endpoint.tenant_id
        );
    }

    let engine = Engine::start(config)?;
    let metrics_shutdown = CancellationToken::new();
    let exporter = spawn_metrics_server(&cli, &engine, &metrics_shutdown);

    let labels = if cli.labels.is_empty() {
        LabelSet::from([DEFAULT_JOB])
    } else {
        cli.labels.iter().cloned().collect()
    };

    tokio::select! {
        () = wait_for_signal() => {}
        result = forward_stdin(engine.ingress(), labels) => match result {
            Ok(lines) => info!("stdin closed after {} lines", lines),
            Err(e) => error!("Failed to read stdin: {}", e),
        },
    }

    let outcome = engine.shutdown().await;
    metrics_shutdown.cancel();
    if let Some(exporter) = exporter
        && let Err(e) = exporter.await
    {
        warn!("Metrics server task failed: {}", e);
    }

    outcome?;
    info!("loki-write stopped");
    Ok(())
}

#[cfg(feature = "metrics-server")]
fn spawn_metrics_server(
    cli: &Cli,
    engine: &Engine,
    shutdown: &CancellationToken,
) -> Option<tokio::task::JoinHandle<()>> {
    let port = cli.metrics_port?;
    let exporter = crate::reliability::PrometheusExporter::new(engine.metrics().clone(), port);
    let shutdown = shutdown.clone();
    Some(tokio::spawn(async move {
        if let Err(e) = exporter.serve(shutdown).await {
            error!("Metrics server failed: {}", e);
        }
    }))
}

#[cfg(not(feature = "metrics-server"))]
fn spawn_metrics_server(
    cli: &Cli,
    _engine: &Engine,
    _shutdown: &CancellationToken,
) -> Option<tokio::task::JoinHandle<()>> {
    if cli.metrics_port.is_some() {
        warn!("Built without the metrics-server feature, ignoring --metrics-port");
    }
    None
}

async fn forward_stdin(ingress: IngressHandle, labels: LabelSet) -> std::io::Result<u64> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut forwarded = 0;
    while let Some(line) = lines.next_line().await? {
        if line.is_empty() {
            continue;
        }
        if ingress.send(Entry::now(labels.clone(), line)).await.is_err() {
            break;
        }
        forwarded += 1;
    }
    Ok(forwarded)
}
