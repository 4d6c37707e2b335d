use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::Result;
use crate::error::Error;
use crate::fault::{Fault, FaultInjector};
use crate::message::{StreamOffset, TransportRecord};
use crate::transport::{OffsetCommitter, TopicProducer, Transport};

/// Partitioned, append-only, in-process log. Clones share the same topics.
#[derive(Debug, Clone)]
pub struct InMemoryLog {
    topics: Arc<RwLock<HashMap<String, Arc<TopicLog>>>>,
    partitions: u16,
}

#[derive(Debug)]
struct TopicLog {
    name: String,
    partitions: Vec<RwLock<Vec<StoredRecord>>>,
    committed: Mutex<BTreeMap<u16, i64>>,
    appended: Notify,
    faults: FaultInjector,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<String>,
    payload: Bytes,
}

impl InMemoryLog {
    pub fn new(partitions: u16) -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            partitions: partitions.max(1),
        }
    }

    fn topic_log(&self, topic: &str) -> Arc<TopicLog> {
        if let Some(log) = self.topics.read().get(topic) {
            return Arc::clone(log);
        }
        let mut topics = self.topics.write();
        let log = topics.entry(topic.to_string()).or_insert_with(|| {
            Arc::new(TopicLog {
                name: topic.to_string(),
                partitions: (0..self.partitions).map(|_| RwLock::new(Vec::new())).collect(),
                committed: Mutex::new(BTreeMap::new()),
                appended: Notify::new(),
                faults: FaultInjector::new(),
            })
        });
        Arc::clone(log)
    }

    /// Opens a reader positioned at the beginning of every partition of `topic`.
    pub fn subscribe(&self, topic: &str) -> InMemoryConsumer {
        let log = self.topic_log(topic);
        let positions = vec![0; log.partitions.len()];
        InMemoryConsumer {
            log,
            positions,
            next_partition: 0,
        }
    }

    /// Appends a record. Records with the same key land on the same partition.
    pub fn append(&self, topic: &str, key: Option<&str>, payload: impl Into<Bytes>) -> StreamOffset {
        let log = self.topic_log(topic);
        let partition = match key {
            Some(key) => partition_for(key, log.partitions.len()),
            None => 0,
        };
        let sequence = {
            let Some(records) = log.partitions.get(usize::from(partition)) else {
                unreachable!("partition is always computed modulo the partition count")
            };
            let mut records = records.write();
            records.push(StoredRecord {
                key: key.map(str::to_string),
                payload: payload.into(),
            });
            records.len() as i64 - 1
        };
        log.appended.notify_waiters();
        StreamOffset::new(partition, sequence)
    }

    /// Fault injector applied to every poll of `topic`.
    pub fn faults(&self, topic: &str) -> FaultHandle {
        FaultHandle(self.topic_log(topic))
    }

    /// Offsets committed for `topic`, per partition.
    pub fn committed(&self, topic: &str) -> BTreeMap<u16, i64> {
        self.topic_log(topic).committed.lock().clone()
    }

    pub fn len(&self, topic: &str) -> usize {
        self.topic_log(topic)
            .partitions
            .iter()
            .map(|records| records.read().len())
            .sum()
    }
}

/// Gives tests access to the fault injector of a topic.
#[derive(Debug, Clone)]
pub struct FaultHandle(Arc<TopicLog>);

impl std::ops::Deref for FaultHandle {
    type Target = FaultInjector;

    fn deref(&self) -> &Self::Target {
        &self.0.faults
    }
}

fn partition_for(key: &str, partitions: usize) -> u16 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as u16
}

#[derive(Debug)]
pub struct InMemoryConsumer {
    log: Arc<TopicLog>,
    /// Next sequence to read, per partition.
    positions: Vec<i64>,
    next_partition: usize,
}

impl InMemoryConsumer {
    fn read_available(&mut self, max_batch: usize) -> Vec<TransportRecord> {
        let partition_count = self.log.partitions.len();
        let mut batch = Vec::new();

        // round-robin the starting partition so one busy partition cannot starve the others
        for step in 0..partition_count {
            let idx = (self.next_partition + step) % partition_count;
            let (Some(records), Some(position)) =
                (self.log.partitions.get(idx), self.positions.get_mut(idx))
            else {
                continue;
            };
            let records = records.read();
            let start = usize::try_from(*position).unwrap_or(0);
            for (seq, record) in records.iter().enumerate().skip(start) {
                if batch.len() >= max_batch {
                    break;
                }
                batch.push(TransportRecord {
                    offset: StreamOffset::new(idx as u16, seq as i64),
                    key: record.key.clone(),
                    payload: record.payload.clone(),
                });
                *position = seq as i64 + 1;
            }
        }
        self.next_partition = (self.next_partition + 1) % partition_count;
        batch
    }
}

impl Transport for InMemoryConsumer {
    type Committer = InMemoryCommitter;

    fn topic(&self) -> &str {
        &self.log.name
    }

    async fn seek(&mut self, partition: u16, sequence: i64) -> Result<()> {
        let Some(position) = self.positions.get_mut(usize::from(partition)) else {
            return Err(Error::FatalIngest(format!(
                "topic {} has no partition {partition}",
                self.log.name
            )));
        };
        *position = sequence.max(0);
        Ok(())
    }

    async fn poll(&mut self, max_batch: usize, timeout: Duration) -> Result<Vec<TransportRecord>> {
        match self.log.faults.check() {
            Some(Fault::Transient) => {
                return Err(Error::TransientIngest(format!(
                    "topic {} temporarily unavailable",
                    self.log.name
                )));
            }
            Some(Fault::Fatal) => {
                return Err(Error::FatalIngest(format!(
                    "not authorized to read topic {}",
                    self.log.name
                )));
            }
            None => {}
        }

        // register for wakeups before looking, so an append between the read and the wait is seen
        let log = Arc::clone(&self.log);
        let appended = log.appended.notified();
        let batch = self.read_available(max_batch);
        if !batch.is_empty() {
            return Ok(batch);
        }
        if tokio::time::timeout(timeout, appended).await.is_err() {
            return Ok(Vec::new());
        }
        Ok(self.read_available(max_batch))
    }

    fn committer(&self) -> Self::Committer {
        InMemoryCommitter {
            log: Arc::clone(&self.log),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryCommitter {
    log: Arc<TopicLog>,
}

impl OffsetCommitter for InMemoryCommitter {
    async fn commit_offset(&self, offset: StreamOffset) -> Result<()> {
        let mut committed = self.log.committed.lock();
        let entry = committed.entry(offset.partition).or_insert(offset.sequence);
        *entry = (*entry).max(offset.sequence);
        Ok(())
    }
}

impl TopicProducer for InMemoryLog {
    async fn send(&self, topic: &str, key: &str, payload: Bytes) -> Result<()> {
        self.append(topic, Some(key), payload);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
