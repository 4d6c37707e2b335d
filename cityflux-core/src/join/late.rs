//! Events that arrived after their window was closed. They are kept in a bounded log and persisted
//! under `late/` for offline reconciliation, never joined.

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::Result;
use crate::error::Error;
use crate::message::{IngestedEvent, StreamOffset};
use crate::schema::{Event, StreamKind};
use crate::watermark::Watermark;
use crate::window::WindowKey;

#[derive(Debug, Clone, PartialEq)]
pub struct LateEvent {
    pub event: IngestedEvent,
    /// The closed window the event belonged to.
    pub window: WindowKey,
    /// Watermark of the closure pass that closed the window.
    pub watermark: Watermark,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LateRecord<'a> {
    stream: StreamKind,
    offset: StreamOffset,
    window: &'a WindowKey,
    watermark: DateTime<Utc>,
    event: &'a Event,
}

impl LateEvent {
    pub fn stream(&self) -> StreamKind {
        self.event.stream
    }

    pub fn offset(&self) -> StreamOffset {
        self.event.offset
    }

    /// Storage location, derived from the stream offset and window so a replayed late event
    /// overwrites its earlier copy.
    pub fn partition_path(&self) -> String {
        format!(
            "late/date={}/stream={}/p{}-{}-{}.json",
            self.event.event_time().format("%Y-%m-%d"),
            self.event.stream,
            self.event.offset.partition,
            self.event.offset.sequence,
            self.window.window_start_ms,
        )
    }

    pub fn encode(&self) -> Result<Bytes> {
        let record = LateRecord {
            stream: self.event.stream,
            offset: self.event.offset,
            window: &self.window,
            watermark: self.watermark,
            event: &self.event.event,
        };
        serde_json::to_vec(&record)
            .map(Bytes::from)
            .map_err(|e| Error::SinkCorruption(format!("Failed to encode late event: {e}")))
    }
}

/// Bounded in-memory log of late events. When full the oldest entry is evicted.
#[derive(Debug, Clone)]
pub struct LateEventLog {
    capacity: usize,
    entries: VecDeque<LateEvent>,
    evicted: u64,
    per_stream: BTreeMap<StreamKind, u64>,
}

impl LateEventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::new(),
            evicted: 0,
            per_stream: BTreeMap::new(),
        }
    }

    /// Appends `late`, returning `true` if an older entry had to be evicted.
    pub fn push(&mut self, late: LateEvent) -> bool {
        *self.per_stream.entry(late.stream()).or_default() += 1;
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front();
            self.evicted += 1;
            true
        } else {
            false
        };
        self.entries.push_back(late);
        evicted
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &LateEvent> {
        self.entries.iter()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Every late event ever recorded for `stream`, evicted ones included.
    pub fn total(&self, stream: StreamKind) -> u64 {
        self.per_stream.get(&stream).copied().unwrap_or_default()
    }
}
