use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rdkafka::Offset;
use rdkafka::client::ClientContext;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::stream_consumer::StreamConsumer;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::topic_partition_list::TopicPartitionList;
use tracing::{debug, info, warn};

use crate::Result;
use crate::config::PipelineConfig;
use crate::error::Error;
use crate::message::{StreamOffset, TransportRecord};
use crate::transport::{OffsetCommitter, TopicProducer, Transport};

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);
const PRODUCE_TIMEOUT: Duration = Duration::from_secs(5);

struct CityfluxContext;

impl ClientContext for CityfluxContext {}

impl ConsumerContext for CityfluxContext {
    fn pre_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        info!("Pre rebalance {:?}", rebalance);
    }

    fn post_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        info!("Post rebalance {:?}", rebalance);
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        debug!("Committed offsets: {:?}", result);
    }
}

type CityfluxConsumer = StreamConsumer<CityfluxContext>;

/// Authorization failures never heal on their own, everything else is worth retrying.
fn classify(context: &str, err: KafkaError) -> Error {
    match err.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::GroupAuthorizationFailed
            | RDKafkaErrorCode::ClusterAuthorizationFailed
            | RDKafkaErrorCode::UnknownTopicOrPartition,
        ) => Error::FatalIngest(format!("{context}: {err}")),
        _ => Error::TransientIngest(format!("{context}: {err}")),
    }
}

/// Reader of one topic with manual partition assignment, so start positions can be taken from
/// the checkpoint instead of the consumer group.
pub struct KafkaTransport {
    consumer: Arc<CityfluxConsumer>,
    topic: String,
    positions: BTreeMap<i32, Offset>,
    /// Read error that cut a batch short, reported by the next poll.
    pending_error: Option<Error>,
}

impl KafkaTransport {
    pub async fn subscribe(config: &PipelineConfig, topic: &str) -> Result<Self> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.consumer_group)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "false")
            .set_log_level(RDKafkaLogLevel::Warning);

        let consumer: Arc<CityfluxConsumer> = Arc::new(
            client_config
                .create_with_context(CityfluxContext)
                .map_err(|e| classify("Failed to create Kafka consumer", e))?,
        );

        // fetch_metadata blocks on librdkafka
        let metadata_consumer = Arc::clone(&consumer);
        let metadata_topic = topic.to_string();
        let partitions = tokio::task::spawn_blocking(move || {
            let metadata = metadata_consumer
                .fetch_metadata(Some(&metadata_topic), METADATA_TIMEOUT)
                .map_err(|e| classify("Failed to fetch metadata", e))?;
            let Some(topic_metadata) = metadata.topics().first() else {
                return Err(Error::FatalIngest(format!(
                    "No metadata for topic {metadata_topic}"
                )));
            };
            Ok(topic_metadata
                .partitions()
                .iter()
                .map(|p| p.id())
                .collect::<Vec<_>>())
        })
        .await
        .map_err(|e| Error::Pipeline(format!("Metadata task failed: {e:?}")))??;

        let mut transport = Self {
            consumer,
            topic: topic.to_string(),
            positions: partitions.into_iter().map(|p| (p, Offset::Stored)).collect(),
            pending_error: None,
        };
        transport.assign()?;
        info!(topic, partitions = transport.positions.len(), "Subscribed to Kafka topic");
        Ok(transport)
    }

    fn assign(&mut self) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        for (partition, offset) in &self.positions {
            tpl.add_partition_offset(&self.topic, *partition, *offset)
                .map_err(|e| classify("Failed to build assignment", e))?;
        }
        self.consumer
            .assign(&tpl)
            .map_err(|e| classify("Failed to assign partitions", e))
    }
}

impl Transport for KafkaTransport {
    type Committer = KafkaCommitter;

    fn topic(&self) -> &str {
        &self.topic
    }

    async fn seek(&mut self, partition: u16, sequence: i64) -> Result<()> {
        let partition = i32::from(partition);
        if !self.positions.contains_key(&partition) {
            return Err(Error::FatalIngest(format!(
                "topic {} has no partition {partition}",
                self.topic
            )));
        }
        self.positions.insert(partition, Offset::Offset(sequence));
        self.assign()
    }

    async fn poll(&mut self, max_batch: usize, timeout: Duration) -> Result<Vec<TransportRecord>> {
        let consumer = &self.consumer;
        let records = read_batch(
            move || async move {
                let message = consumer
                    .recv()
                    .await
                    .map_err(|e| classify("Failed to read messages", e))?;
                to_record(&message)
            },
            &mut self.pending_error,
            max_batch,
            timeout,
        )
        .await?;
        debug!(topic = %self.topic, count = records.len(), "Read messages from Kafka");
        Ok(records)
    }

    fn committer(&self) -> Self::Committer {
        KafkaCommitter {
            consumer: Arc::clone(&self.consumer),
            topic: self.topic.clone(),
        }
    }
}

fn to_record(message: &BorrowedMessage<'_>) -> Result<TransportRecord> {
    let Ok(partition) = u16::try_from(message.partition()) else {
        return Err(Error::FatalIngest(format!(
            "partition {} out of range",
            message.partition()
        )));
    };
    Ok(TransportRecord {
        offset: StreamOffset::new(partition, message.offset()),
        key: message.key().map(|k| String::from_utf8_lossy(k).to_string()),
        payload: message
            .payload()
            .map(Bytes::copy_from_slice)
            .unwrap_or_default(),
    })
}

/// Reads up to `max_batch` records until `timeout`. The consumer position moves with every read,
/// so a failed read after some records must not discard them: the batch is returned and the
/// error is parked in `pending` for the next call.
async fn read_batch<F, Fut>(
    mut next: F,
    pending: &mut Option<Error>,
    max_batch: usize,
    timeout: Duration,
) -> Result<Vec<TransportRecord>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<TransportRecord>>,
{
    if let Some(err) = pending.take() {
        return Err(err);
    }

    let mut records = Vec::new();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    while records.len() < max_batch {
        tokio::select! {
            biased;

            _ = &mut deadline => break,

            read = next() => match read {
                Ok(record) => records.push(record),
                Err(e) if records.is_empty() => return Err(e),
                Err(e) => {
                    warn!(?e, read = records.len(), "Read failed mid-batch, keeping the records already read");
                    *pending = Some(e);
                    break;
                }
            },
        }
    }
    Ok(records)
}

#[derive(Clone)]
pub struct KafkaCommitter {
    consumer: Arc<CityfluxConsumer>,
    topic: String,
}

impl OffsetCommitter for KafkaCommitter {
    async fn commit_offset(&self, offset: StreamOffset) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        // Kafka commits the position of the next record to read
        tpl.add_partition_offset(
            &self.topic,
            i32::from(offset.partition),
            Offset::Offset(offset.sequence + 1),
        )
        .map_err(|e| classify("Failed to build commit", e))?;

        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || {
            consumer
                .commit(&tpl, CommitMode::Sync)
                .map_err(|e| classify("Failed to commit offsets", e))
        })
        .await
        .map_err(|e| Error::Pipeline(format!("Commit task failed: {e:?}")))?
    }
}

#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
}

impl KafkaProducer {
    pub fn connect(bootstrap_servers: &str) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", bootstrap_servers)
            .set("message.timeout.ms", "5000")
            .set("client.id", "cityflux-simulator")
            .create()
            .map_err(|e| Error::Config(format!("Failed to create Kafka producer: {e}")))?;
        Ok(Self { producer })
    }
}

impl TopicProducer for KafkaProducer {
    async fn send(&self, topic: &str, key: &str, payload: Bytes) -> Result<()> {
        let record = FutureRecord::to(topic).key(key).payload(payload.as_ref());
        match self.producer.send(record, PRODUCE_TIMEOUT).await {
            Ok(_) => Ok(()),
            Err((e, _)) => {
                warn!(topic, ?e, "Failed to produce record");
                Err(classify("Failed to produce record", e))
            }
        }
    }

    async fn flush(&self) -> Result<()> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(PRODUCE_TIMEOUT))
            .await
            .map_err(|e| Error::Pipeline(format!("Flush task failed: {e:?}")))?
            .map_err(|e| classify("Failed to flush producer", e))
    }
}
