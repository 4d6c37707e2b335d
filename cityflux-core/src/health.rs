//! Per-stream health signals for operators: last commit, watermark, idleness, late events and
//! whether the stream halted.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::schema::StreamKind;
use crate::watermark::{MIN_WATERMARK, Watermark};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamHealth {
    /// `None` until the stream delivered its first event.
    pub watermark: Option<Watermark>,
    pub idle: bool,
    /// Last durably committed sequence per partition.
    pub committed: BTreeMap<u16, i64>,
    pub last_commit_at: Option<DateTime<Utc>>,
    pub late_events: u64,
    pub halted: Option<String>,
}

/// Cheaply cloneable handle; every clone sees the same state.
#[derive(Debug, Clone, Default)]
pub struct PipelineHealth {
    streams: Arc<RwLock<BTreeMap<StreamKind, StreamHealth>>>,
}

impl PipelineHealth {
    pub fn new(streams: impl IntoIterator<Item = StreamKind>) -> Self {
        let streams = streams
            .into_iter()
            .map(|stream| (stream, StreamHealth::default()))
            .collect();
        Self {
            streams: Arc::new(RwLock::new(streams)),
        }
    }

    pub(crate) fn set_watermark(&self, stream: StreamKind, watermark: Watermark, idle: bool) {
        let mut streams = self.streams.write();
        let health = streams.entry(stream).or_default();
        health.watermark = (watermark != MIN_WATERMARK).then_some(watermark);
        health.idle = idle;
    }

    pub(crate) fn record_commit(
        &self,
        offsets: &BTreeMap<StreamKind, BTreeMap<u16, i64>>,
        at: DateTime<Utc>,
    ) {
        let mut streams = self.streams.write();
        for (stream, partitions) in offsets {
            let health = streams.entry(*stream).or_default();
            health.committed.clone_from(partitions);
            health.last_commit_at = Some(at);
        }
    }

    pub(crate) fn record_late(&self, stream: StreamKind) {
        self.streams.write().entry(stream).or_default().late_events += 1;
    }

    pub(crate) fn halt(&self, stream: StreamKind, reason: String) {
        self.streams.write().entry(stream).or_default().halted = Some(reason);
    }

    pub fn snapshot(&self) -> BTreeMap<StreamKind, StreamHealth> {
        self.streams.read().clone()
    }

    pub fn stream(&self, stream: StreamKind) -> Option<StreamHealth> {
        self.streams.read().get(&stream).cloned()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_health_updates_are_shared() {
        let health = PipelineHealth::new([StreamKind::Vehicle, StreamKind::Weather]);
        let handle = health.clone();

        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        handle.set_watermark(StreamKind::Vehicle, now, false);
        handle.set_watermark(StreamKind::Weather, MIN_WATERMARK, true);
        handle.record_late(StreamKind::Vehicle);
        handle.record_commit(
            &BTreeMap::from([(StreamKind::Vehicle, BTreeMap::from([(0, 9)]))]),
            now,
        );
        handle.halt(StreamKind::Weather, "unauthorized".into());

        let snapshot = health.snapshot();
        let vehicle = &snapshot[&StreamKind::Vehicle];
        assert_eq!(vehicle.watermark, Some(now));
        assert_eq!(vehicle.late_events, 1);
        assert_eq!(vehicle.committed, BTreeMap::from([(0, 9)]));
        assert_eq!(vehicle.last_commit_at, Some(now));

        let weather = health.stream(StreamKind::Weather).unwrap();
        assert_eq!(weather.watermark, None);
        assert!(weather.idle);
        assert_eq!(weather.halted.as_deref(), Some("unauthorized"));
    }
}
