//! The pipeline coordinator. Recovers from the checkpoint, starts one ingestor task per stream
//! and the sink writer pool, and drives the join loop: the single owner of every window and of the
//! watermark tracker.
//!
//! ```text
//! transport ──► ingestor (per stream) ──► join loop ──► sink writer pool ──► storage
//!                                            ▲                 │
//!                                            └──── acks ───────┘
//! ```
//!
//! No window state is persisted. Open windows are rebuilt on restart by replaying every stream
//! from its committed offset.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::checkpoint::Checkpoint;
use crate::config::PipelineConfig;
use crate::error::Error;
use crate::health::PipelineHealth;
use crate::ingest::{StreamBatch, StreamIngestor};
use crate::join::late::{LateEvent, LateEventLog};
use crate::join::{Admission, JoinEngine};
use crate::metrics::{pipeline_metrics, stream_labels};
use crate::retry::with_backoff;
use crate::schema::StreamKind;
use crate::sink::{CheckpointManager, SharedTracker, SinkAck, SinkRequest, SinkWriterPool};
use crate::storage::Storage;
use crate::tracker::OffsetTracker;
use crate::transport::Transport;
use crate::watermark::{MIN_WATERMARK, Watermark, WatermarkTracker};
use crate::window::WindowAssigner;

/// What a pipeline run did, returned when it stops.
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub events_ingested: u64,
    /// Records dropped for failing validation.
    pub records_dropped: u64,
    /// Events older than their own stream's watermark that were still joined.
    pub behind_watermark: u64,
    pub windows_emitted: u64,
    pub partial_windows: u64,
    pub late_events: u64,
    /// Replayed input of windows written before the restart.
    pub replayed_skipped: u64,
    /// Windows still open at shutdown. Rebuilt by replay on the next start.
    pub open_windows: usize,
    pub global_watermark: Option<Watermark>,
    /// Late events per stream, including those evicted from the late log.
    pub late_events_by_stream: BTreeMap<StreamKind, u64>,
    pub late_log_evicted: u64,
    pub late_log: Vec<LateEvent>,
    pub checkpoint: Checkpoint,
}

pub struct PipelineBuilder<T, S> {
    config: Arc<PipelineConfig>,
    storage: S,
    streams: BTreeMap<StreamKind, T>,
}

impl<T, S> PipelineBuilder<T, S>
where
    T: Transport,
    S: Storage,
{
    /// Adds the transport `kind` is read from. Adding a stream twice replaces the first one.
    pub fn stream(mut self, kind: StreamKind, transport: T) -> Self {
        self.streams.insert(kind, transport);
        self
    }

    pub fn build(self) -> Result<Pipeline<T, S>> {
        self.config.validate()?;
        if self.streams.is_empty() {
            return Err(Error::Config("a pipeline needs at least one stream".into()));
        }
        let health = PipelineHealth::new(self.streams.keys().copied());
        Ok(Pipeline {
            config: self.config,
            storage: self.storage,
            streams: self.streams,
            health,
        })
    }
}

pub struct Pipeline<T, S> {
    config: Arc<PipelineConfig>,
    storage: S,
    streams: BTreeMap<StreamKind, T>,
    health: PipelineHealth,
}

impl<T, S> Pipeline<T, S>
where
    T: Transport,
    S: Storage,
{
    pub fn builder(config: Arc<PipelineConfig>, storage: S) -> PipelineBuilder<T, S> {
        PipelineBuilder {
            config,
            storage,
            streams: BTreeMap::new(),
        }
    }

    /// Handle on the health signals, usable while [Self::run] is in progress.
    pub fn health(&self) -> PipelineHealth {
        self.health.clone()
    }

    /// Runs until `cancel` fires or a fatal error occurs. Either way the ingestors are stopped and
    /// already queued commits are allowed to finish before returning.
    pub async fn run(self, cancel: CancellationToken) -> Result<PipelineReport> {
        let Self {
            config,
            storage,
            streams,
            health,
        } = self;

        let checkpoint = with_backoff("checkpoint read", &config.sink_retry, &cancel, || {
            storage.read_checkpoint()
        })
        .await?
        .unwrap_or_default();
        info!(
            offsets = ?checkpoint.offsets,
            emitted = checkpoint.emitted.len(),
            "Recovered checkpoint"
        );

        let assigner = match config.window_slide {
            Some(slide) => WindowAssigner::sliding(config.window_size, slide)?,
            None => WindowAssigner::tumbling(config.window_size)?,
        };
        let watermarks = WatermarkTracker::new(
            config.allowed_lateness,
            config.idle_timeout,
            streams.keys().copied(),
            Instant::now(),
        )?;
        let engine = JoinEngine::new(
            checkpoint
                .emitted
                .iter()
                .map(|record| (record.window.clone(), record.inputs.clone())),
        );
        let tracker: SharedTracker = Arc::new(parking_lot::Mutex::new(
            OffsetTracker::from_checkpoint(&checkpoint),
        ));

        let mut ingestors = Vec::with_capacity(streams.len());
        let mut committers = BTreeMap::new();
        for (stream, transport) in streams {
            committers.insert(stream, transport.committer());
            let mut ingestor = StreamIngestor::new(stream, transport, &config);
            ingestor
                .seek_committed(&checkpoint.stream_offsets(stream))
                .await?;
            ingestors.push(ingestor);
        }

        // cancelled only on a fatal error, a graceful stop lets pending retries run out
        let hard_shutdown = CancellationToken::new();
        let manager = CheckpointManager::new(
            storage,
            checkpoint,
            Arc::clone(&tracker),
            committers,
            health.clone(),
            config.storage.buckets,
            config.sink_retry.clone(),
            hard_shutdown.clone(),
        );
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let pool = SinkWriterPool::start(
            config.sink_workers,
            config.sink_queue_capacity,
            manager.clone(),
            ack_tx,
        );

        let (batch_tx, batch_rx) = mpsc::channel(config.ingest_channel_capacity);
        let ingest_cancel = cancel.child_token();
        let mut ingest_tasks = JoinSet::new();
        for ingestor in ingestors {
            let stream = ingestor.stream();
            let tx = batch_tx.clone();
            let cancel = ingest_cancel.clone();
            ingest_tasks.spawn(async move { (stream, ingestor.run(tx, cancel).await) });
        }
        drop(batch_tx);
        info!(streams = ingest_tasks.len(), "Pipeline started");

        let join_loop = JoinLoop {
            config: Arc::clone(&config),
            assigner,
            watermarks,
            engine,
            tracker,
            late_log: LateEventLog::new(config.late_log_capacity),
            pool,
            health,
            report: PipelineReport::default(),
        };

        let outcome = join_loop
            .run(batch_rx, ack_rx, ingest_tasks, ingest_cancel, &cancel, hard_shutdown)
            .await;
        let mut report = outcome?;
        report.checkpoint = manager.checkpoint().await;
        info!(
            windows_emitted = report.windows_emitted,
            late_events = report.late_events,
            open_windows = report.open_windows,
            "Pipeline stopped"
        );
        Ok(report)
    }
}

struct JoinLoop {
    config: Arc<PipelineConfig>,
    assigner: WindowAssigner,
    watermarks: WatermarkTracker,
    engine: JoinEngine,
    tracker: SharedTracker,
    late_log: LateEventLog,
    pool: SinkWriterPool,
    health: PipelineHealth,
    report: PipelineReport,
}

impl JoinLoop {
    async fn run(
        mut self,
        mut batch_rx: mpsc::Receiver<StreamBatch>,
        mut ack_rx: mpsc::UnboundedReceiver<SinkAck>,
        mut ingest_tasks: JoinSet<(StreamKind, Result<()>)>,
        ingest_cancel: CancellationToken,
        cancel: &CancellationToken,
        hard_shutdown: CancellationToken,
    ) -> Result<PipelineReport> {
        let mut idle_check = tokio::time::interval(self.config.idle_check_interval);
        idle_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Cancellation received, shutting down the pipeline");
                    break Ok(());
                }
                Some(ack) = ack_rx.recv() => self.handle_ack(ack),
                Some(joined) = ingest_tasks.join_next() => self.handle_ingestor_exit(joined),
                Some(batch) = batch_rx.recv() => self.handle_batch(batch).await,
                _ = idle_check.tick() => self.check_idle().await,
            };
            if let Err(e) = step {
                error!(error = %e, "Fatal error, shutting down the pipeline");
                break Err(e);
            }
        };

        if result.is_err() {
            hard_shutdown.cancel();
        }

        // stop reading first, then let the sink drain whatever is already queued
        ingest_cancel.cancel();
        drop(batch_rx);
        while let Some(joined) = ingest_tasks.join_next().await {
            if let Err(e) = self.handle_ingestor_exit(joined) {
                warn!(error = %e, "Ingestor failed during shutdown");
            }
        }
        let Self {
            mut engine,
            watermarks,
            late_log,
            pool,
            mut report,
            ..
        } = self;
        let mut result = result;
        if let Err(e) = pool.shutdown().await {
            result = result.and(Err(e));
        }

        while let Some(ack) = ack_rx.recv().await {
            if let Err(e) = apply_ack(&mut engine, &mut report, ack) {
                result = match result {
                    Ok(()) => Err(e),
                    // a worker that stopped is only the symptom, prefer the error that stopped it
                    Err(Error::Pipeline(_)) if !matches!(e, Error::Cancelled) => Err(e),
                    Err(current) => Err(current),
                };
            }
        }

        report.open_windows = engine.open_windows();
        let global = watermarks.global_watermark();
        report.global_watermark = (global != MIN_WATERMARK).then_some(global);
        report.late_events_by_stream = StreamKind::ALL
            .into_iter()
            .map(|stream| (stream, late_log.total(stream)))
            .filter(|(_, total)| *total > 0)
            .collect();
        report.late_log_evicted = late_log.evicted();
        report.late_log = late_log.iter().cloned().collect();
        result.map(|()| report)
    }

    fn handle_ack(&mut self, ack: SinkAck) -> Result<()> {
        apply_ack(&mut self.engine, &mut self.report, ack)?;
        pipeline_metrics()
            .open_windows
            .set(self.engine.open_windows() as i64);
        self.publish_held_offsets();
        Ok(())
    }

    fn publish_held_offsets(&self) {
        let held = self.tracker.lock().in_flight();
        pipeline_metrics().held_offsets.set(held as i64);
    }

    fn handle_ingestor_exit(
        &mut self,
        joined: std::result::Result<(StreamKind, Result<()>), tokio::task::JoinError>,
    ) -> Result<()> {
        match joined {
            Ok((_, Ok(()))) => Ok(()),
            Ok((stream, Err(e))) => {
                self.health.halt(stream, e.to_string());
                Err(e)
            }
            Err(e) => Err(Error::Pipeline(format!("ingestor task failed: {e}"))),
        }
    }

    async fn handle_batch(&mut self, StreamBatch { stream, batch }: StreamBatch) -> Result<()> {
        self.watermarks.record_activity(stream, Instant::now());
        self.report.records_dropped += batch.dropped.len() as u64;
        {
            let mut tracker = self.tracker.lock();
            for offset in &batch.dropped {
                tracker.track(stream, *offset, 0);
            }
        }

        let mut late = Vec::new();
        for event in batch.events {
            self.report.events_ingested += 1;
            let event_time = event.event_time();
            if self.watermarks.is_late(stream, event_time) {
                // its own stream moved on, but the window may still be open
                self.report.behind_watermark += 1;
                pipeline_metrics()
                    .behind_watermark
                    .get_or_create(&stream_labels(stream))
                    .inc();
            }
            self.watermarks.advance(stream, event_time);

            let mut holds = 0;
            for key in self.assigner.assign(event.event.device_id(), event_time) {
                match self.engine.admit(key.clone(), &event) {
                    Admission::Accepted => holds += 1,
                    Admission::AlreadyEmitted => {
                        debug!(window = %key, offset = %event.offset, "Skipping replayed input of an emitted window");
                        self.report.replayed_skipped += 1;
                    }
                    Admission::Late { closed_through } => {
                        holds += 1;
                        late.push(LateEvent {
                            event: event.clone(),
                            window: key,
                            watermark: closed_through,
                        });
                    }
                }
            }
            // observed and held in one step so no commit can move past it in between
            self.tracker.lock().track(stream, event.offset, holds);
        }

        for late in late {
            self.record_late(late).await?;
        }
        self.publish_held_offsets();
        self.publish_watermarks();
        self.close_ready().await
    }

    async fn record_late(&mut self, late: LateEvent) -> Result<()> {
        let stream = late.stream();
        warn!(%stream, offset = %late.offset(), window = %late.window, watermark = %late.watermark, "Late event");
        self.report.late_events += 1;
        self.health.record_late(stream);
        let metrics = pipeline_metrics();
        metrics.late_events.get_or_create(&stream_labels(stream)).inc();
        if self.late_log.push(late.clone()) {
            metrics.late_log_evicted.inc();
        }
        self.pool.dispatch(SinkRequest::Late(late)).await
    }

    async fn check_idle(&mut self) -> Result<()> {
        let newly_idle = self.watermarks.refresh_idleness(Instant::now());
        self.publish_watermarks();
        if newly_idle.is_empty() {
            return Ok(());
        }
        self.close_ready().await
    }

    /// Hands every window the global watermark has passed to the sink.
    async fn close_ready(&mut self) -> Result<()> {
        let global = self.watermarks.global_watermark();
        for closed in self.engine.close_windows(global) {
            debug!(window = %closed.key, partial = closed.record.is_partial(), "Emitting window");
            self.pool.dispatch(SinkRequest::Window(closed)).await?;
        }
        pipeline_metrics()
            .open_windows
            .set(self.engine.open_windows() as i64);
        Ok(())
    }

    fn publish_watermarks(&self) {
        let metrics = pipeline_metrics();
        for stream in StreamKind::ALL {
            let Some(health) = self.health.stream(stream) else {
                continue;
            };
            let watermark = self.watermarks.current_watermark(stream);
            let idle = self.watermarks.is_idle(stream);
            let published = (watermark != MIN_WATERMARK).then_some(watermark);
            if health.idle != idle || health.watermark != published {
                self.health.set_watermark(stream, watermark, idle);
            }
            if watermark != MIN_WATERMARK {
                metrics
                    .stream_watermark
                    .get_or_create(&stream_labels(stream))
                    .set(watermark.timestamp_millis());
            }
        }
        let global = self.watermarks.global_watermark();
        if global != MIN_WATERMARK {
            metrics.global_watermark.set(global.timestamp_millis());
        }
    }
}

fn apply_ack(engine: &mut JoinEngine, report: &mut PipelineReport, ack: SinkAck) -> Result<()> {
    match ack {
        SinkAck::Committed { key, partial } => {
            engine.mark_committed(&key);
            report.windows_emitted += 1;
            let metrics = pipeline_metrics();
            metrics.windows_emitted.inc();
            if partial {
                report.partial_windows += 1;
                metrics.partial_windows.inc();
            }
            debug!(window = %key, partial, "Window committed");
            Ok(())
        }
        SinkAck::LateLogged(late) => {
            debug!(offset = %late.offset(), window = %late.window, "Late event persisted");
            Ok(())
        }
        SinkAck::Failed(e) => Err(e),
    }
}
