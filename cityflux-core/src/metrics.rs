//! Prometheus metrics of the pipeline. Every metric is registered once in a global registry and
//! rendered in the OpenMetrics text format by [encode_metrics]. [start_metrics_server] serves the
//! registry together with liveness, readiness and the per-stream health signals.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::OnceLock;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::Result;
use crate::error::Error;
use crate::health::{PipelineHealth, StreamHealth};
use crate::schema::StreamKind;

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

const REGISTRY_PREFIX: &str = "cityflux";

const STREAM_LABEL: &str = "stream";
const OPERATION_LABEL: &str = "operation";

const INGESTED_TOTAL: &str = "ingested";
const SCHEMA_ERRORS_TOTAL: &str = "schema_errors";
const LATE_EVENTS_TOTAL: &str = "late_events";
const BEHIND_WATERMARK_TOTAL: &str = "behind_watermark";
const LATE_LOG_EVICTED_TOTAL: &str = "late_log_evicted";
const WINDOWS_EMITTED_TOTAL: &str = "windows_emitted";
const PARTIAL_WINDOWS_TOTAL: &str = "partial_windows";
const CHECKPOINT_COMMITS_TOTAL: &str = "checkpoint_commits";
const RETRIES_TOTAL: &str = "retries";
const STREAM_WATERMARK: &str = "stream_watermark_ms";
const GLOBAL_WATERMARK: &str = "global_watermark_ms";
const OPEN_WINDOWS: &str = "open_windows";
const HELD_OFFSETS: &str = "held_offsets";

type Labels = Vec<(String, String)>;

struct GlobalRegistry {
    // each metric is registered exactly once, a plain mutex is enough
    registry: parking_lot::Mutex<Registry>,
}

static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(|| GlobalRegistry {
        registry: parking_lot::Mutex::new(Registry::with_prefix(REGISTRY_PREFIX)),
    })
}

pub struct PipelineMetrics {
    pub ingested: Family<Labels, Counter>,
    pub schema_errors: Family<Labels, Counter>,
    pub late_events: Family<Labels, Counter>,
    /// Events older than their own stream's watermark that still found an open window.
    pub behind_watermark: Family<Labels, Counter>,
    pub late_log_evicted: Counter,
    pub windows_emitted: Counter,
    pub partial_windows: Counter,
    pub checkpoint_commits: Counter,
    pub retries: Family<Labels, Counter>,
    pub stream_watermark: Family<Labels, Gauge>,
    pub global_watermark: Gauge,
    pub open_windows: Gauge,
    /// Consumed offsets still needed by a pending write, they pin the checkpoint.
    pub held_offsets: Gauge,
}

impl PipelineMetrics {
    fn new() -> Self {
        let metrics = Self {
            ingested: Family::default(),
            schema_errors: Family::default(),
            late_events: Family::default(),
            behind_watermark: Family::default(),
            late_log_evicted: Counter::default(),
            windows_emitted: Counter::default(),
            partial_windows: Counter::default(),
            checkpoint_commits: Counter::default(),
            retries: Family::default(),
            stream_watermark: Family::default(),
            global_watermark: Gauge::default(),
            open_windows: Gauge::default(),
            held_offsets: Gauge::default(),
        };

        let mut registry = global_registry().registry.lock();
        registry.register(
            INGESTED_TOTAL,
            "Events that passed validation, per stream",
            metrics.ingested.clone(),
        );
        registry.register(
            SCHEMA_ERRORS_TOTAL,
            "Records dropped for failing schema validation, per stream",
            metrics.schema_errors.clone(),
        );
        registry.register(
            LATE_EVENTS_TOTAL,
            "Events that arrived after their window closed, per stream",
            metrics.late_events.clone(),
        );
        registry.register(
            BEHIND_WATERMARK_TOTAL,
            "Events behind their stream's watermark admitted into a still open window",
            metrics.behind_watermark.clone(),
        );
        registry.register(
            LATE_LOG_EVICTED_TOTAL,
            "Late events evicted from the bounded in-memory late-event log",
            metrics.late_log_evicted.clone(),
        );
        registry.register(
            WINDOWS_EMITTED_TOTAL,
            "Joined records durably written and checkpointed",
            metrics.windows_emitted.clone(),
        );
        registry.register(
            PARTIAL_WINDOWS_TOTAL,
            "Joined records emitted without data from every stream",
            metrics.partial_windows.clone(),
        );
        registry.register(
            CHECKPOINT_COMMITS_TOTAL,
            "Checkpoint documents persisted",
            metrics.checkpoint_commits.clone(),
        );
        registry.register(
            RETRIES_TOTAL,
            "Retries of transient failures, per operation",
            metrics.retries.clone(),
        );
        registry.register(
            STREAM_WATERMARK,
            "Watermark of each stream, in epoch milliseconds",
            metrics.stream_watermark.clone(),
        );
        registry.register(
            GLOBAL_WATERMARK,
            "Pipeline-wide watermark, in epoch milliseconds",
            metrics.global_watermark.clone(),
        );
        registry.register(
            OPEN_WINDOWS,
            "Windows currently accumulating events",
            metrics.open_windows.clone(),
        );
        registry.register(
            HELD_OFFSETS,
            "Consumed offsets held back from the checkpoint by pending writes",
            metrics.held_offsets.clone(),
        );
        metrics
    }

    pub fn inc_retry(&self, operation: &str) {
        self.retries
            .get_or_create(&vec![(OPERATION_LABEL.to_string(), operation.to_string())])
            .inc();
    }
}

static PIPELINE_METRICS: OnceLock<PipelineMetrics> = OnceLock::new();

pub fn pipeline_metrics() -> &'static PipelineMetrics {
    PIPELINE_METRICS.get_or_init(PipelineMetrics::new)
}

/// Labels identifying `stream`.
pub fn stream_labels(stream: StreamKind) -> Labels {
    vec![(STREAM_LABEL.to_string(), stream.as_str().to_string())]
}

/// Snapshot of every registered metric in the OpenMetrics text format.
pub fn encode_metrics() -> Result<String> {
    // make sure the pipeline metrics are registered even if nothing was recorded yet
    pipeline_metrics();
    let registry = global_registry().registry.lock();
    let mut buffer = String::new();
    encode(&mut buffer, &registry)
        .map_err(|e| Error::Pipeline(format!("Failed to encode metrics: {e}")))?;
    Ok(buffer)
}

// metrics_handler returns a snapshot of the global registry
pub async fn metrics_handler() -> Response {
    match encode_metrics() {
        Ok(buffer) => {
            debug!(bytes = buffer.len(), "Exposing metrics");
            ([(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)], buffer).into_response()
        }
        Err(e) => {
            error!(error = %e, "Failed to expose metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn livez() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// Not ready once any stream has halted.
async fn readyz(State(health): State<PipelineHealth>) -> StatusCode {
    let halted: Vec<_> = health
        .snapshot()
        .into_iter()
        .filter(|(_, status)| status.halted.is_some())
        .map(|(stream, _)| stream)
        .collect();
    if halted.is_empty() {
        StatusCode::NO_CONTENT
    } else {
        error!(?halted, "Pipeline is not ready, streams halted");
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn stream_health(
    State(health): State<PipelineHealth>,
) -> Json<BTreeMap<StreamKind, StreamHealth>> {
    Json(health.snapshot())
}

/// router for metrics and health endpoints
fn metrics_router(health: PipelineHealth) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/livez", get(livez))
        .route("/readyz", get(readyz))
        .route("/health", get(stream_health))
        .with_state(health)
}

/// Serves the metrics endpoints on `addr` until `cancel` fires.
pub async fn start_metrics_server(
    addr: SocketAddr,
    health: PipelineHealth,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Metrics(format!("Binding metrics server to {addr}: {e}")))?;
    serve_metrics(listener, health, cancel).await
}

async fn serve_metrics(
    listener: TcpListener,
    health: PipelineHealth,
    cancel: CancellationToken,
) -> Result<()> {
    let addr = listener
        .local_addr()
        .map_err(|e| Error::Metrics(format!("Reading metrics server address: {e}")))?;
    info!(%addr, "Metrics server started");
    axum::serve(listener, metrics_router(health))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| Error::Metrics(format!("Running metrics server: {e}")))?;
    info!(%addr, "Metrics server stopped");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::indexing_slicing)]
mod tests {
    use axum::body::to_bytes;

    use super::*;

    async fn body(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_metrics_are_encoded() {
        let metrics = pipeline_metrics();
        metrics
            .late_events
            .get_or_create(&stream_labels(StreamKind::Weather))
            .inc();
        metrics.inc_retry("sink write");
        metrics.global_watermark.set(60_000);

        let encoded = encode_metrics().unwrap();
        assert!(encoded.contains("cityflux_late_events_total{stream=\"weather\"}"));
        assert!(encoded.contains("cityflux_retries_total{operation=\"sink write\"}"));
        assert!(encoded.contains("cityflux_global_watermark_ms"));
    }

    #[test]
    fn test_stream_labels() {
        assert_eq!(
            stream_labels(StreamKind::TrafficCamera),
            vec![("stream".to_string(), "traffic_camera".to_string())]
        );
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        pipeline_metrics()
            .late_events
            .get_or_create(&stream_labels(StreamKind::Gps))
            .inc();

        let response = metrics_handler().await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            OPENMETRICS_CONTENT_TYPE
        );
        let text = body(response).await;
        assert!(text.contains("cityflux_late_events_total{stream=\"gps\"}"));
        assert!(text.contains("cityflux_held_offsets"));
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let health = PipelineHealth::new([StreamKind::Vehicle, StreamKind::Weather]);
        assert_eq!(livez().await, StatusCode::NO_CONTENT);
        assert_eq!(readyz(State(health.clone())).await, StatusCode::NO_CONTENT);

        health.record_late(StreamKind::Vehicle);
        health.halt(StreamKind::Weather, "unauthorized".into());
        assert_eq!(
            readyz(State(health.clone())).await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        let Json(snapshot) = stream_health(State(health.clone())).await;
        assert_eq!(snapshot[&StreamKind::Vehicle].late_events, 1);

        let encoded = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(encoded["vehicle"]["lateEvents"], 1);
        assert_eq!(encoded["weather"]["halted"], "unauthorized");
    }

    #[tokio::test]
    async fn test_metrics_server_stops_on_cancel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve_metrics(
            listener,
            PipelineHealth::default(),
            cancel.clone(),
        ));

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
