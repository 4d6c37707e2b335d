use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;

use crate::Result;
use crate::checkpoint::{CHECKPOINT_PATH, Checkpoint};
use crate::error::Error;
use crate::fault::{Fault, FaultInjector};
use crate::storage::{Storage, decode_checkpoint, encode_checkpoint};

/// Storage held in process memory. Clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    records: Arc<RwLock<BTreeMap<String, Bytes>>>,
    writes: Arc<AtomicUsize>,
    faults: Arc<FaultInjector>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Faults applied to writes.
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Every stored path under `prefix`, in order.
    pub fn paths(&self, prefix: &str) -> Vec<String> {
        self.records
            .read()
            .keys()
            .filter(|path| path.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn get(&self, path: &str) -> Option<Bytes> {
        self.records.read().get(path).cloned()
    }

    /// Number of successful writes, overwrites included.
    #[cfg(test)]
    pub(crate) fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }
}

impl Storage for InMemoryStore {
    async fn write(&self, partition_path: &str, record: Bytes) -> Result<()> {
        match self.faults.check() {
            Some(Fault::Transient) => {
                return Err(Error::SinkUnavailable(format!(
                    "storage unavailable writing {partition_path}"
                )));
            }
            Some(Fault::Fatal) => {
                return Err(Error::SinkCorruption(format!(
                    "storage rejected {partition_path}"
                )));
            }
            None => {}
        }
        self.records
            .write()
            .insert(partition_path.to_string(), record);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn read(&self, partition_path: &str) -> Result<Option<Bytes>> {
        Ok(self.get(partition_path))
    }

    async fn read_checkpoint(&self) -> Result<Option<Checkpoint>> {
        self.get(CHECKPOINT_PATH)
            .map(|raw| decode_checkpoint(&raw))
            .transpose()
    }

    async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let encoded = encode_checkpoint(checkpoint)?;
        self.write(CHECKPOINT_PATH, encoded).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_overwrite_keeps_one_record() {
        let store = InMemoryStore::new();
        store.write("joined/a.json", Bytes::from("1")).await.unwrap();
        store.write("joined/a.json", Bytes::from("1")).await.unwrap();
        assert_eq!(store.paths("joined/"), vec!["joined/a.json".to_string()]);
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn test_faults() {
        let store = InMemoryStore::new();
        store.faults().fail_transient(1);
        assert!(matches!(
            store.write("x", Bytes::new()).await,
            Err(Error::SinkUnavailable(_))
        ));
        assert!(store.write("x", Bytes::new()).await.is_ok());
    }
}
