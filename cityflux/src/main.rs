use std::env;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cityflux_core::config::PipelineConfig;
use cityflux_core::health::PipelineHealth;
use cityflux_core::metrics::start_metrics_server;
use cityflux_core::pipeline::{Pipeline, PipelineReport};
use cityflux_core::schema::StreamKind;
use cityflux_core::storage::Storage;
use cityflux_core::storage::fs::FileStore;
use cityflux_core::transport::Transport;
use cityflux_core::transport::memory::InMemoryLog;
use cityflux_simulator::{Simulator, SimulatorConfig};

mod setup_tracing;

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);
/// Partitions per topic of the in-process log used with `--simulate`.
const SIMULATED_PARTITIONS: u16 = 4;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = env::args().collect();
    info!(?args, "Starting with args");

    let config = Arc::new(PipelineConfig::load(env::vars())?);
    info!(?config, "Loaded pipeline config");

    let cancel = CancellationToken::new();
    let shutdown_token = cancel.clone();
    let shutdown_handle = tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_token.cancel();
    });

    let result = if args.iter().any(|arg| arg == "--simulate") {
        run_simulated(config, cancel).await
    } else if args.iter().any(|arg| arg == "--produce") {
        produce(config, cancel).await
    } else {
        run_streaming(config, cancel).await
    };

    if !shutdown_handle.is_finished() {
        shutdown_handle.abort();
    }
    result
}

/// Runs the simulator and the pipeline in one process over an in-memory log.
async fn run_simulated(
    config: Arc<PipelineConfig>,
    cancel: CancellationToken,
) -> Result<(), Box<dyn Error>> {
    let storage = open_storage(&config).await?;
    let log = InMemoryLog::new(SIMULATED_PARTITIONS);

    let pipeline = StreamKind::ALL
        .into_iter()
        .fold(Pipeline::builder(Arc::clone(&config), storage), |builder, kind| {
            builder.stream(kind, log.subscribe(config.topic(kind)))
        })
        .build()?;

    let sim_config = SimulatorConfig::load(env::vars(), &config)?;
    let simulator = tokio::spawn(Simulator::new(sim_config, log).run(cancel.clone()));

    run_pipeline(pipeline, config.metrics_addr, cancel).await?;

    match simulator.await {
        Ok(Ok(report)) => info!(steps = report.steps, arrived = report.arrived, "Simulator stopped"),
        Ok(Err(e)) => warn!(?e, "Simulator failed"),
        Err(e) => warn!(?e, "Simulator task failed"),
    }
    Ok(())
}

#[cfg(feature = "kafka")]
async fn run_streaming(
    config: Arc<PipelineConfig>,
    cancel: CancellationToken,
) -> Result<(), Box<dyn Error>> {
    use cityflux_core::transport::kafka::KafkaTransport;

    let storage = open_storage(&config).await?;
    let mut builder = Pipeline::builder(Arc::clone(&config), storage);
    for kind in StreamKind::ALL {
        let transport = KafkaTransport::subscribe(&config, config.topic(kind)).await?;
        builder = builder.stream(kind, transport);
    }
    run_pipeline(builder.build()?, config.metrics_addr, cancel).await
}

#[cfg(not(feature = "kafka"))]
async fn run_streaming(
    _config: Arc<PipelineConfig>,
    _cancel: CancellationToken,
) -> Result<(), Box<dyn Error>> {
    Err("built without the `kafka` feature, run with --simulate instead".into())
}

/// Publishes simulated journeys to Kafka without running the pipeline.
#[cfg(feature = "kafka")]
async fn produce(
    config: Arc<PipelineConfig>,
    cancel: CancellationToken,
) -> Result<(), Box<dyn Error>> {
    use cityflux_core::transport::kafka::KafkaProducer;

    let producer = KafkaProducer::connect(&config.bootstrap_servers)?;
    let sim_config = SimulatorConfig::load(env::vars(), &config)?;
    let report = Simulator::new(sim_config, producer)
        .run(cancel)
        .await
        .map_err(|e| format!("Error running simulator: {e:?}"))?;
    info!(steps = report.steps, sent = ?report.sent, "Simulator stopped");
    Ok(())
}

#[cfg(not(feature = "kafka"))]
async fn produce(
    _config: Arc<PipelineConfig>,
    _cancel: CancellationToken,
) -> Result<(), Box<dyn Error>> {
    Err("built without the `kafka` feature, --produce is unavailable".into())
}

async fn open_storage(config: &PipelineConfig) -> Result<FileStore, Box<dyn Error>> {
    if config.storage.credentials.is_some() {
        warn!(
            path = %config.storage.path_prefix.display(),
            "Object storage credentials are set but records go to the local filesystem, ignoring them"
        );
    }
    Ok(FileStore::open(&config.storage.path_prefix).await?)
}

async fn run_pipeline<T, S>(
    pipeline: Pipeline<T, S>,
    metrics_addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<(), Box<dyn Error>>
where
    T: Transport,
    S: Storage,
{
    let health_token = cancel.child_token();
    let health_handle = tokio::spawn(log_health(pipeline.health(), health_token.clone()));
    let metrics_handle = tokio::spawn(start_metrics_server(
        metrics_addr,
        pipeline.health(),
        health_token.clone(),
    ));

    let result = pipeline.run(cancel).await;
    health_token.cancel();
    if let Err(e) = health_handle.await {
        warn!(?e, "Health reporter failed");
    }
    match metrics_handle.await {
        Ok(Ok(())) => {}
        // the pipeline runs on without its metrics endpoint
        Ok(Err(e)) => warn!(error = %e, "Metrics server failed"),
        Err(e) => warn!(?e, "Metrics server task failed"),
    }

    let report = result.map_err(|e| format!("Error running pipeline: {e:?}"))?;
    log_report(&report);
    Ok(())
}

fn log_report(report: &PipelineReport) {
    info!(
        events_ingested = report.events_ingested,
        records_dropped = report.records_dropped,
        windows_emitted = report.windows_emitted,
        partial_windows = report.partial_windows,
        late_events = report.late_events,
        late_events_by_stream = ?report.late_events_by_stream,
        late_log_evicted = report.late_log_evicted,
        replayed_skipped = report.replayed_skipped,
        open_windows = report.open_windows,
        global_watermark = ?report.global_watermark,
        "Pipeline stopped"
    );
}

async fn log_health(health: PipelineHealth, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(HEALTH_LOG_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        for (stream, status) in health.snapshot() {
            info!(
                %stream,
                watermark = ?status.watermark,
                idle = status.idle,
                committed = ?status.committed,
                late_events = status.late_events,
                halted = ?status.halted,
                "Stream health"
            );
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => {
                error!(?e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                error!(?e, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
