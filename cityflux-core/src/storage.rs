//! Partitioned object storage for joined records, late events and the checkpoint document.

use bytes::Bytes;

use crate::Result;
use crate::checkpoint::Checkpoint;
use crate::error::Error;

/// Local filesystem storage.
pub mod fs;

/// In-memory storage.
pub mod memory;

#[trait_variant::make(Send)]
pub trait Storage: Clone + Send + Sync + 'static {
    /// Writes `record` at `partition_path`, replacing whatever was there. Writing the same record
    /// twice leaves one record.
    async fn write(&self, partition_path: &str, record: Bytes) -> Result<()>;

    async fn read(&self, partition_path: &str) -> Result<Option<Bytes>>;

    /// The persisted checkpoint, `None` on a fresh start. An unreadable document is
    /// [Error::SinkCorruption].
    async fn read_checkpoint(&self) -> Result<Option<Checkpoint>>;

    /// Replaces the checkpoint document atomically.
    async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;
}

pub(crate) fn encode_checkpoint(checkpoint: &Checkpoint) -> Result<Bytes> {
    serde_json::to_vec_pretty(checkpoint)
        .map(Bytes::from)
        .map_err(|e| Error::SinkCorruption(format!("Failed to encode checkpoint: {e}")))
}

pub(crate) fn decode_checkpoint(raw: &[u8]) -> Result<Checkpoint> {
    serde_json::from_slice(raw)
        .map_err(|e| Error::SinkCorruption(format!("Failed to decode checkpoint: {e}")))
}
