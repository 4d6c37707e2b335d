//! Durable emission of joined records and late events.
//!
//! [CheckpointManager::commit] writes a record and then advances the checkpoint, always in that
//! order: a crash in between replays the window's input, the window is rebuilt identically and the
//! rewrite overwrites the first copy in place. [SinkWriterPool] runs the commits on a fixed set of
//! workers, routing by device so all commits of one device are ordered.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::checkpoint::Checkpoint;
use crate::error::Error;
use crate::health::PipelineHealth;
use crate::join::late::LateEvent;
use crate::join::{ClosedWindow, JoinedRecord};
use crate::message::StreamOffset;
use crate::metrics::pipeline_metrics;
use crate::retry::{RetryConfig, with_backoff};
use crate::schema::StreamKind;
use crate::storage::Storage;
use crate::tracker::OffsetTracker;
use crate::transport::OffsetCommitter;
use crate::window::{WindowKey, route};

/// Offsets the pipeline has consumed and which of them are still needed.
pub type SharedTracker = Arc<parking_lot::Mutex<OffsetTracker>>;

/// Writes records and advances the checkpoint document. Clones share the same checkpoint.
#[derive(Clone)]
pub struct CheckpointManager<S, C> {
    storage: S,
    checkpoint: Arc<tokio::sync::Mutex<Checkpoint>>,
    tracker: SharedTracker,
    committers: Arc<BTreeMap<StreamKind, C>>,
    health: PipelineHealth,
    buckets: u16,
    retry: RetryConfig,
    /// Stops retrying. Only fired on a hard shutdown, a graceful one lets queued commits finish.
    hard_shutdown: CancellationToken,
}

impl<S, C> CheckpointManager<S, C>
where
    S: Storage,
    C: OffsetCommitter,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: S,
        checkpoint: Checkpoint,
        tracker: SharedTracker,
        committers: BTreeMap<StreamKind, C>,
        health: PipelineHealth,
        buckets: u16,
        retry: RetryConfig,
        hard_shutdown: CancellationToken,
    ) -> Self {
        Self {
            storage,
            checkpoint: Arc::new(tokio::sync::Mutex::new(checkpoint)),
            tracker,
            committers: Arc::new(committers),
            health,
            buckets,
            retry,
            hard_shutdown,
        }
    }

    /// Writes `record` to the partition path of `key` and then advances the checkpoint past the
    /// window's input `offsets`. Returns the offsets that moved.
    pub async fn commit(
        &self,
        key: &WindowKey,
        record: &JoinedRecord,
        offsets: &[(StreamKind, StreamOffset)],
    ) -> Result<Vec<(StreamKind, StreamOffset)>> {
        let path = key.partition_path(self.buckets);
        let encoded = record.encode()?;
        with_backoff("sink write", &self.retry, &self.hard_shutdown, || {
            self.storage.write(&path, encoded.clone())
        })
        .await?;
        debug!(window = %key, path, "Joined record written");

        self.release(offsets);
        self.advance(Some((key, offsets))).await
    }

    /// Persists a late event under `late/` and releases its hold on the input offset.
    pub async fn log_late(&self, late: &LateEvent) -> Result<Vec<(StreamKind, StreamOffset)>> {
        let path = late.partition_path();
        let encoded = late.encode()?;
        with_backoff("late write", &self.retry, &self.hard_shutdown, || {
            self.storage.write(&path, encoded.clone())
        })
        .await?;

        self.release(&[(late.stream(), late.offset())]);
        self.advance(None).await
    }

    /// A copy of the checkpoint as last persisted.
    pub async fn checkpoint(&self) -> Checkpoint {
        self.checkpoint.lock().await.clone()
    }

    fn release(&self, offsets: &[(StreamKind, StreamOffset)]) {
        let mut tracker = self.tracker.lock();
        for (stream, offset) in offsets {
            tracker.release(*stream, *offset);
        }
    }

    /// Moves the checkpoint to the current committable offsets in one atomic document write, then
    /// forwards the advanced offsets to the transport.
    async fn advance(
        &self,
        emission: Option<(&WindowKey, &[(StreamKind, StreamOffset)])>,
    ) -> Result<Vec<(StreamKind, StreamOffset)>> {
        // commits are serialized on the document, so the committable offsets read under it only
        // ever grow
        let mut checkpoint = self.checkpoint.lock().await;
        let committable = self.tracker.lock().committable();

        let mut next = checkpoint.clone();
        let advanced = next.merge_offsets(&committable);
        if let Some((key, offsets)) = emission {
            next.record_emission(key, offsets);
        }
        let pruned = next.prune_emissions();
        if advanced.is_empty() && emission.is_none() && pruned.is_empty() {
            return Ok(advanced);
        }
        let now = Utc::now();
        next.updated_at = Some(now);

        with_backoff("checkpoint write", &self.retry, &self.hard_shutdown, || {
            self.storage.write_checkpoint(&next)
        })
        .await?;
        pipeline_metrics().checkpoint_commits.inc();
        self.health.record_commit(&next.offsets, now);
        *checkpoint = next;
        drop(checkpoint);

        for (stream, offset) in &advanced {
            let Some(committer) = self.committers.get(stream) else {
                continue;
            };
            // storage is the source of truth on recovery, the transport copy is informational
            if let Err(e) = committer.commit_offset(*offset).await {
                warn!(%stream, %offset, error = %e, "Failed to commit offset to the transport");
            }
        }
        Ok(advanced)
    }
}

#[derive(Debug, Clone)]
pub enum SinkRequest {
    Window(ClosedWindow),
    Late(LateEvent),
}

impl SinkRequest {
    fn device_id(&self) -> &str {
        match self {
            SinkRequest::Window(window) => &window.key.device_id,
            SinkRequest::Late(late) => &late.window.device_id,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SinkAck {
    /// The window's record is written and the checkpoint covers it.
    Committed { key: WindowKey, partial: bool },
    LateLogged(LateEvent),
    /// The worker stopped on this error.
    Failed(Error),
}

/// Fixed set of sink workers, each with a bounded queue. A full queue back-pressures the caller of
/// [SinkWriterPool::dispatch].
pub struct SinkWriterPool {
    senders: Vec<mpsc::Sender<SinkRequest>>,
    handles: Vec<JoinHandle<()>>,
}

impl SinkWriterPool {
    pub fn start<S, C>(
        workers: usize,
        queue_capacity: usize,
        manager: CheckpointManager<S, C>,
        ack_tx: mpsc::UnboundedSender<SinkAck>,
    ) -> Self
    where
        S: Storage,
        C: OffsetCommitter,
    {
        let workers = workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let (tx, rx) = mpsc::channel(queue_capacity.max(1));
            senders.push(tx);
            handles.push(tokio::spawn(run_worker(
                worker,
                rx,
                manager.clone(),
                ack_tx.clone(),
            )));
        }
        info!(workers, queue_capacity, "Sink writer pool started");
        Self { senders, handles }
    }

    /// Queues `request` on the worker owning its device, waiting for room.
    pub async fn dispatch(&self, request: SinkRequest) -> Result<()> {
        let worker = route(request.device_id(), self.senders.len());
        let Some(sender) = self.senders.get(worker) else {
            return Err(Error::Pipeline(format!("no sink worker {worker}")));
        };
        sender
            .send(request)
            .await
            .map_err(|_| Error::Pipeline(format!("sink worker {worker} has stopped")))
    }

    /// Closes the queues and waits until every queued request is processed.
    pub async fn shutdown(self) -> Result<()> {
        drop(self.senders);
        for handle in self.handles {
            handle
                .await
                .map_err(|e| Error::Pipeline(format!("sink worker panicked: {e}")))?;
        }
        info!("Sink writer pool stopped");
        Ok(())
    }
}

async fn run_worker<S, C>(
    worker: usize,
    mut rx: mpsc::Receiver<SinkRequest>,
    manager: CheckpointManager<S, C>,
    ack_tx: mpsc::UnboundedSender<SinkAck>,
) where
    S: Storage,
    C: OffsetCommitter,
{
    while let Some(request) = rx.recv().await {
        let ack = match request {
            SinkRequest::Window(window) => manager
                .commit(&window.key, &window.record, &window.offsets)
                .await
                .map(|_| SinkAck::Committed {
                    partial: window.record.is_partial(),
                    key: window.key,
                }),
            SinkRequest::Late(late) => manager.log_late(&late).await.map(|_| SinkAck::LateLogged(late)),
        };

        match ack {
            Ok(ack) => {
                // the join loop only goes away after the pool is shut down
                let _ = ack_tx.send(ack);
            }
            Err(e) => {
                error!(worker, error = %e, "Sink worker stopping on error");
                let _ = ack_tx.send(SinkAck::Failed(e));
                return;
            }
        }
    }
    debug!(worker, "Sink worker queue closed");
}

#[cfg(test)]
#[allow(clippy::indexing_slicing)]
mod tests {
    use std::time::Duration;

    use chrono::{DateTime, TimeZone};

    use super::*;
    use crate::join::JoinEngine;
    use crate::message::IngestedEvent;
    use crate::schema::{Event, GeoPoint, VehicleEvent};
    use crate::storage::memory::InMemoryStore;
    use crate::transport::memory::{InMemoryCommitter, InMemoryLog};
    use crate::transport::Transport;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn vehicle(device: &str, secs: i64, sequence: i64) -> IngestedEvent {
        IngestedEvent {
            stream: StreamKind::Vehicle,
            offset: StreamOffset::new(0, sequence),
            event: Event::Vehicle(VehicleEvent {
                id: format!("v-{sequence}"),
                device_id: device.into(),
                event_time: at(secs),
                location: GeoPoint {
                    latitude: 51.5,
                    longitude: -0.12,
                },
                speed: 30.0,
                direction: "North-East".into(),
                make: None,
                model: None,
                year: None,
                fuel_type: None,
            }),
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
            factor: 2.0,
            jitter: 0.0,
            max_attempts: 3,
        }
    }

    struct Fixture {
        store: InMemoryStore,
        log: InMemoryLog,
        tracker: SharedTracker,
        manager: CheckpointManager<InMemoryStore, InMemoryCommitter>,
    }

    fn fixture() -> Fixture {
        let store = InMemoryStore::new();
        let log = InMemoryLog::new(1);
        let committer = log.subscribe("vehicle_data").committer();
        let tracker = SharedTracker::default();
        let manager = CheckpointManager::new(
            store.clone(),
            Checkpoint::default(),
            Arc::clone(&tracker),
            BTreeMap::from([(StreamKind::Vehicle, committer)]),
            PipelineHealth::new([StreamKind::Vehicle]),
            4,
            fast_retry(),
            CancellationToken::new(),
        );
        Fixture {
            store,
            log,
            tracker,
            manager,
        }
    }

    fn closed_window(events: &[IngestedEvent]) -> ClosedWindow {
        let mut engine = JoinEngine::default();
        for event in events {
            let key = WindowKey {
                device_id: event.event.device_id().to_string(),
                window_start_ms: 0,
                window_size_ms: 60_000,
            };
            engine.admit(key, event);
        }
        engine.close_windows(at(60)).remove(0)
    }

    #[tokio::test]
    async fn test_commit_writes_then_advances_checkpoint() {
        let f = fixture();
        let events = [vehicle("V1", 10, 0), vehicle("V1", 20, 1)];
        for event in &events {
            f.tracker.lock().track(event.stream, event.offset, 1);
        }
        let window = closed_window(&events);

        let advanced = f
            .manager
            .commit(&window.key, &window.record, &window.offsets)
            .await
            .unwrap();
        assert_eq!(advanced, vec![(StreamKind::Vehicle, StreamOffset::new(0, 1))]);

        let path = window.key.partition_path(4);
        assert!(f.store.get(&path).is_some());
        let checkpoint = f.store.read_checkpoint().await.unwrap().unwrap();
        assert_eq!(checkpoint.committed(StreamKind::Vehicle, 0), Some(1));
        // the emission is fully covered by the committed offsets
        assert!(checkpoint.emitted.is_empty());
        assert_eq!(f.log.committed("vehicle_data"), BTreeMap::from([(0, 1)]));
    }

    #[tokio::test]
    async fn test_committing_twice_leaves_one_record() {
        let f = fixture();
        let events = [vehicle("V1", 10, 0)];
        f.tracker.lock().track(StreamKind::Vehicle, StreamOffset::new(0, 0), 2);
        let window = closed_window(&events);

        for _ in 0..2 {
            f.manager
                .commit(&window.key, &window.record, &window.offsets)
                .await
                .unwrap();
        }
        assert_eq!(f.store.paths("joined/").len(), 1);
        let stored: JoinedRecord =
            serde_json::from_slice(&f.store.get(&window.key.partition_path(4)).unwrap()).unwrap();
        assert_eq!(stored, window.record);
    }

    #[tokio::test]
    async fn test_checkpoint_stops_below_held_offsets() {
        let f = fixture();
        let first = vehicle("V1", 10, 0);
        let second = vehicle("V2", 20, 1);
        f.tracker.lock().track(StreamKind::Vehicle, first.offset, 1);
        f.tracker.lock().track(StreamKind::Vehicle, second.offset, 1);

        // V2's window commits first, V1's is still emitting
        let window = closed_window(std::slice::from_ref(&second));
        f.manager
            .commit(&window.key, &window.record, &window.offsets)
            .await
            .unwrap();

        let checkpoint = f.manager.checkpoint().await;
        assert_eq!(checkpoint.committed(StreamKind::Vehicle, 0), None);
        // the written window is remembered until its input is covered
        assert_eq!(
            checkpoint.emitted_windows().cloned().collect::<Vec<_>>(),
            vec![window.key.clone()]
        );

        let window = closed_window(std::slice::from_ref(&first));
        f.manager
            .commit(&window.key, &window.record, &window.offsets)
            .await
            .unwrap();
        let checkpoint = f.manager.checkpoint().await;
        assert_eq!(checkpoint.committed(StreamKind::Vehicle, 0), Some(1));
        assert!(checkpoint.emitted.is_empty());
    }

    #[tokio::test]
    async fn test_transient_sink_failure_is_retried() {
        let f = fixture();
        let events = [vehicle("V1", 10, 0)];
        f.tracker.lock().track(StreamKind::Vehicle, StreamOffset::new(0, 0), 1);
        let window = closed_window(&events);

        f.store.faults().fail_transient(2);
        f.manager
            .commit(&window.key, &window.record, &window.offsets)
            .await
            .unwrap();
        assert_eq!(f.store.paths("joined/").len(), 1);
    }

    #[tokio::test]
    async fn test_corruption_leaves_checkpoint_untouched() {
        let f = fixture();
        let events = [vehicle("V1", 10, 0)];
        f.tracker.lock().track(StreamKind::Vehicle, StreamOffset::new(0, 0), 1);
        let window = closed_window(&events);

        f.store.faults().set_fatal(true);
        let result = f
            .manager
            .commit(&window.key, &window.record, &window.offsets)
            .await;
        assert!(matches!(result, Err(Error::SinkCorruption(_))));
        assert_eq!(f.manager.checkpoint().await, Checkpoint::default());
        assert!(f.log.committed("vehicle_data").is_empty());
    }

    #[tokio::test]
    async fn test_pool_commits_and_drains_on_shutdown() {
        let f = fixture();
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
        let pool = SinkWriterPool::start(2, 1, f.manager.clone(), ack_tx);

        for (sequence, device) in ["V1", "V2", "V3"].into_iter().enumerate() {
            let event = vehicle(device, 10, sequence as i64);
            f.tracker.lock().track(event.stream, event.offset, 1);
            pool.dispatch(SinkRequest::Window(closed_window(&[event])))
                .await
                .unwrap();
        }
        pool.shutdown().await.unwrap();

        let mut committed = Vec::new();
        while let Some(ack) = ack_rx.recv().await {
            match ack {
                SinkAck::Committed { key, partial } => {
                    assert!(partial);
                    committed.push(key.device_id);
                }
                other => panic!("unexpected ack {other:?}"),
            }
        }
        committed.sort();
        assert_eq!(committed, vec!["V1", "V2", "V3"]);
        assert_eq!(f.store.paths("joined/").len(), 3);
        assert_eq!(
            f.manager.checkpoint().await.committed(StreamKind::Vehicle, 0),
            Some(2)
        );
    }

    #[tokio::test]
    async fn test_pool_reports_fatal_errors() {
        let f = fixture();
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
        let pool = SinkWriterPool::start(1, 4, f.manager.clone(), ack_tx);

        f.store.faults().set_fatal(true);
        pool.dispatch(SinkRequest::Window(closed_window(&[vehicle("V1", 10, 0)])))
            .await
            .unwrap();
        assert!(matches!(
            ack_rx.recv().await,
            Some(SinkAck::Failed(Error::SinkCorruption(_)))
        ));
        pool.shutdown().await.unwrap();
    }
}
