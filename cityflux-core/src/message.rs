use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::schema::{Event, StreamKind};

/// Position of a record in its transport partition. Sequences increase monotonically per
/// partition and are only meaningful together with the stream they came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamOffset {
    pub partition: u16,
    pub sequence: i64,
}

impl StreamOffset {
    pub fn new(partition: u16, sequence: i64) -> Self {
        Self {
            partition,
            sequence,
        }
    }
}

impl fmt::Display for StreamOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.partition, self.sequence)
    }
}

/// A raw record as read from a transport topic, before schema validation.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRecord {
    pub offset: StreamOffset,
    pub key: Option<String>,
    pub payload: Bytes,
}

/// A validated event together with where it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestedEvent {
    pub stream: StreamKind,
    pub offset: StreamOffset,
    pub event: Event,
}

impl IngestedEvent {
    pub fn event_time(&self) -> DateTime<Utc> {
        self.event.event_time()
    }

    /// Total order used inside a window: event time, then position in the stream.
    pub(crate) fn order_key(&self) -> (DateTime<Utc>, StreamOffset) {
        (self.event.event_time(), self.offset)
    }
}

/// Result of one successful poll of a stream.
#[derive(Debug, Clone, Default)]
pub struct IngestBatch {
    pub events: Vec<IngestedEvent>,
    /// Offsets of records dropped because they failed validation. They still count as consumed.
    pub dropped: Vec<StreamOffset>,
}

impl IngestBatch {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.dropped.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len() + self.dropped.len()
    }
}
