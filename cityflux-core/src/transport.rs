//! The durable, partitioned, append-only log the telemetry streams are read from. Readers never
//! commit their own progress; offsets are committed by the checkpoint component only after the
//! window they contributed to is durably written.

use std::time::Duration;

use bytes::Bytes;

use crate::Result;
use crate::message::{StreamOffset, TransportRecord};

/// In-memory partitioned log.
pub mod memory;

/// Kafka backed transport.
#[cfg(feature = "kafka")]
pub mod kafka;

/// A subscription to one topic. Obtained from the concrete transport's `subscribe`.
#[trait_variant::make(Send)]
pub trait Transport: Send + 'static {
    type Committer: OffsetCommitter;

    fn topic(&self) -> &str;

    /// Positions the reader so that the next record returned from `partition` is the one at
    /// `sequence`.
    async fn seek(&mut self, partition: u16, sequence: i64) -> Result<()>;

    /// Returns up to `max_batch` records, waiting at most `timeout` when none are available.
    /// An empty batch is not an error.
    async fn poll(&mut self, max_batch: usize, timeout: Duration) -> Result<Vec<TransportRecord>>;

    fn committer(&self) -> Self::Committer;
}

/// Commits consumed positions back to the transport. Invoked only by the checkpoint component.
#[trait_variant::make(Send)]
pub trait OffsetCommitter: Clone + Send + Sync + 'static {
    /// Marks every record up to and including `offset` in its partition as consumed.
    async fn commit_offset(&self, offset: StreamOffset) -> Result<()>;
}

/// Publishes records onto topics. Used by the simulator.
#[trait_variant::make(Send)]
pub trait TopicProducer: Clone + Send + Sync + 'static {
    async fn send(&self, topic: &str, key: &str, payload: Bytes) -> Result<()>;

    /// Waits until every record sent so far is durably accepted.
    async fn flush(&self) -> Result<()>;
}
