//! Per-stream ingestion. Each stream gets its own [StreamIngestor] running as an independent task:
//! it reads from the transport, validates every record against the schema registry and forwards
//! the valid events to the join loop. Offsets are never committed here.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::config::PipelineConfig;
use crate::error::Error;
use crate::message::{IngestBatch, IngestedEvent};
use crate::metrics::{pipeline_metrics, stream_labels};
use crate::retry::RetryConfig;
use crate::schema::{self, StreamKind};
use crate::transport::Transport;

/// A batch of one stream on its way to the join loop.
#[derive(Debug, Clone)]
pub struct StreamBatch {
    pub stream: StreamKind,
    pub batch: IngestBatch,
}

pub struct StreamIngestor<T> {
    stream: StreamKind,
    transport: T,
    batch_size: usize,
    poll_timeout: Duration,
    retry: RetryConfig,
    /// Largest event time seen by this ingestor. Informational; the tracker owns the watermark.
    max_event_time: Option<DateTime<Utc>>,
}

impl<T: Transport> StreamIngestor<T> {
    pub fn new(stream: StreamKind, transport: T, config: &PipelineConfig) -> Self {
        Self {
            stream,
            transport,
            batch_size: config.batch_size,
            poll_timeout: config.poll_timeout,
            retry: config.ingest_retry.clone(),
            max_event_time: None,
        }
    }

    pub fn stream(&self) -> StreamKind {
        self.stream
    }

    pub fn local_watermark(&self) -> Option<DateTime<Utc>> {
        self.max_event_time
    }

    /// Positions the reader right after the committed sequence of every checkpointed partition.
    pub async fn seek_committed(&mut self, committed: &BTreeMap<u16, i64>) -> Result<()> {
        for (partition, sequence) in committed {
            self.transport.seek(*partition, sequence + 1).await?;
            info!(stream = %self.stream, partition, from = sequence + 1, "Resuming from checkpoint");
        }
        Ok(())
    }

    /// Reads up to `max_batch` records and validates them. Invalid records are dropped and
    /// reported by offset. A non-empty batch in which every record is invalid means the stream is
    /// unreadable and fails with [Error::FatalIngest].
    pub async fn poll(&mut self, max_batch: usize) -> Result<IngestBatch> {
        let records = self.transport.poll(max_batch, self.poll_timeout).await?;
        let labels = stream_labels(self.stream);

        let mut batch = IngestBatch::default();
        let mut last_error = None;
        for record in records {
            match schema::validate(self.stream, &record.payload) {
                Ok(event) => batch.events.push(IngestedEvent {
                    stream: self.stream,
                    offset: record.offset,
                    event,
                }),
                Err(e) => {
                    warn!(stream = %self.stream, offset = %record.offset, error = %e, "Dropping invalid record");
                    pipeline_metrics().schema_errors.get_or_create(&labels).inc();
                    batch.dropped.push(record.offset);
                    last_error = Some(e);
                }
            }
        }

        if batch.events.is_empty()
            && let Some(e) = last_error
        {
            return Err(Error::FatalIngest(format!(
                "all {} records of a batch from {} failed validation, last error: {e}",
                batch.dropped.len(),
                self.transport.topic()
            )));
        }

        pipeline_metrics()
            .ingested
            .get_or_create(&labels)
            .inc_by(batch.events.len() as u64);
        if let Some(max) = batch.events.iter().map(IngestedEvent::event_time).max()
            && self.max_event_time.is_none_or(|current| max > current)
        {
            self.max_event_time = Some(max);
        }
        Ok(batch)
    }

    /// Polls until cancelled, forwarding non-empty batches to `tx`. Transient transport errors
    /// are retried with backoff; anything else, or running out of retries, stops the stream.
    pub async fn run(mut self, tx: mpsc::Sender<StreamBatch>, cancel: CancellationToken) -> Result<()> {
        let stream = self.stream;
        let max_batch = self.batch_size;
        let mut backoff = self.retry.backoff();
        info!(%stream, topic = self.transport.topic(), "Ingestor started");

        loop {
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                polled = self.poll(max_batch) => polled,
            };

            let batch = match polled {
                Ok(batch) => {
                    backoff = self.retry.backoff();
                    batch
                }
                Err(e) if e.is_retryable() => {
                    let Some(delay) = backoff.next() else {
                        error!(%stream, attempts = backoff.attempt(), error = %e, "Ingest retries exhausted");
                        return Err(Error::RetriesExhausted {
                            attempts: backoff.attempt(),
                            last: Box::new(e),
                        });
                    };
                    let retry_attempt = backoff.attempt();
                    warn!(%stream, ?retry_attempt, ?delay, error = %e, "Retrying due to retryable error.");
                    pipeline_metrics().inc_retry("ingest poll");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
                Err(e) => {
                    error!(%stream, error = %e, "Ingestor halted");
                    return Err(e);
                }
            };

            if batch.is_empty() {
                continue;
            }
            debug!(%stream, records = batch.len(), watermark = ?self.local_watermark(), "Forwarding batch");
            tokio::select! {
                _ = cancel.cancelled() => break,
                sent = tx.send(StreamBatch { stream, batch }) => {
                    if sent.is_err() {
                        // the join loop is gone, nothing left to feed
                        break;
                    }
                }
            }
        }

        info!(%stream, watermark = ?self.local_watermark(), "Ingestor stopped");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::message::StreamOffset;
    use crate::transport::memory::InMemoryLog;

    const TOPIC: &str = "gps_data";

    fn gps(id: &str, ts: &str) -> String {
        format!(
            r#"{{"id":"{id}","deviceId":"V1","timestamp":"{ts}","speed":42.5,"direction":"North-East","vehicleType":"private"}}"#
        )
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            poll_timeout: Duration::from_millis(20),
            ingest_retry: RetryConfig {
                initial_interval: Duration::from_millis(1),
                max_interval: Duration::from_millis(5),
                factor: 2.0,
                jitter: 0.0,
                max_attempts: 3,
            },
            ..PipelineConfig::default()
        }
    }

    fn ingestor(log: &InMemoryLog) -> StreamIngestor<crate::transport::memory::InMemoryConsumer> {
        StreamIngestor::new(StreamKind::Gps, log.subscribe(TOPIC), &config())
    }

    #[tokio::test]
    async fn test_poll_drops_invalid_records() {
        let log = InMemoryLog::new(1);
        log.append(TOPIC, Some("V1"), gps("g1", "2025-01-01T00:00:10"));
        log.append(TOPIC, Some("V1"), r#"{"id":"g2","deviceId":"V1"}"#);
        log.append(TOPIC, Some("V1"), gps("g3", "2025-01-01T00:00:05"));

        let mut ingestor = ingestor(&log);
        let batch = ingestor.poll(10).await.unwrap();
        assert_eq!(batch.events.len(), 2);
        assert_eq!(batch.dropped, vec![StreamOffset::new(0, 1)]);
        assert_eq!(batch.events[1].event.id(), "g3");
        assert_eq!(
            ingestor.local_watermark(),
            Some("2025-01-01T00:00:10Z".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn test_all_invalid_batch_is_fatal() {
        let log = InMemoryLog::new(1);
        log.append(TOPIC, Some("V1"), "not json");
        log.append(TOPIC, Some("V1"), r#"{"id":"g2"}"#);

        let mut ingestor = ingestor(&log);
        assert!(matches!(ingestor.poll(10).await, Err(Error::FatalIngest(_))));
    }

    #[tokio::test]
    async fn test_empty_poll_is_not_an_error() {
        let log = InMemoryLog::new(1);
        let mut ingestor = ingestor(&log);
        assert!(ingestor.poll(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_seek_committed() {
        let log = InMemoryLog::new(1);
        for i in 0..4 {
            log.append(TOPIC, Some("V1"), gps(&format!("g{i}"), "2025-01-01T00:00:10"));
        }
        let mut ingestor = ingestor(&log);
        ingestor
            .seek_committed(&BTreeMap::from([(0, 1)]))
            .await
            .unwrap();
        let batch = ingestor.poll(10).await.unwrap();
        let offsets: Vec<i64> = batch.events.iter().map(|e| e.offset.sequence).collect();
        assert_eq!(offsets, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_run_retries_transient_errors() {
        let log = InMemoryLog::new(1);
        log.append(TOPIC, Some("V1"), gps("g1", "2025-01-01T00:00:10"));
        log.faults(TOPIC).fail_transient(2);

        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(ingestor(&log).run(tx, cancel.clone()));

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.stream, StreamKind::Gps);
        assert_eq!(batch.batch.events.len(), 1);

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_run_halts_on_fatal_error() {
        let log = InMemoryLog::new(1);
        log.faults(TOPIC).set_fatal(true);

        let (tx, _rx) = mpsc::channel(4);
        let result = ingestor(&log).run(tx, CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::FatalIngest(_))));
    }

    #[tokio::test]
    async fn test_run_gives_up_after_retries() {
        let log = InMemoryLog::new(1);
        log.faults(TOPIC).fail_transient(100);

        let (tx, _rx) = mpsc::channel(4);
        let result = ingestor(&log).run(tx, CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(Error::RetriesExhausted { attempts: 3, .. })
        ));
    }
}
