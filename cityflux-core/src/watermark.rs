//! Event-time progress. Each stream's watermark is the largest event time it has delivered minus
//! the allowed lateness, and the pipeline-wide watermark is the minimum across streams, so a
//! window is only closed once every stream has moved past its end.
//!
//! A stream that delivers nothing for `idle_timeout` (processing time) is considered idle and stops
//! holding back the global watermark until it delivers again. The global watermark is ratcheted, it
//! never moves backward even when an idle stream resumes behind it.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::Result;
use crate::error::Error;
use crate::schema::StreamKind;

pub type Watermark = DateTime<Utc>;

/// Watermark of a stream that has not delivered any event yet.
pub const MIN_WATERMARK: Watermark = DateTime::<Utc>::MIN_UTC;

#[derive(Debug, Clone)]
struct StreamClock {
    max_event_time: Option<DateTime<Utc>>,
    last_active: Instant,
    idle: bool,
}

#[derive(Debug)]
pub struct WatermarkTracker {
    allowed_lateness: chrono::Duration,
    idle_timeout: Option<Duration>,
    streams: BTreeMap<StreamKind, StreamClock>,
    global: Watermark,
}

impl WatermarkTracker {
    pub fn new(
        allowed_lateness: Duration,
        idle_timeout: Option<Duration>,
        streams: impl IntoIterator<Item = StreamKind>,
        now: Instant,
    ) -> Result<Self> {
        let allowed_lateness = chrono::Duration::from_std(allowed_lateness)
            .map_err(|e| Error::Config(format!("allowed lateness out of range: {e}")))?;
        let streams = streams
            .into_iter()
            .map(|stream| {
                (
                    stream,
                    StreamClock {
                        max_event_time: None,
                        last_active: now,
                        idle: false,
                    },
                )
            })
            .collect();
        Ok(Self {
            allowed_lateness,
            idle_timeout,
            streams,
            global: MIN_WATERMARK,
        })
    }

    /// Records that `stream` delivered an event at `event_time`. Returns the stream's watermark.
    pub fn advance(&mut self, stream: StreamKind, event_time: DateTime<Utc>) -> Watermark {
        let clock = self.streams.entry(stream).or_insert_with(|| StreamClock {
            max_event_time: None,
            last_active: Instant::now(),
            idle: false,
        });
        if clock.max_event_time.is_none_or(|max| event_time > max) {
            clock.max_event_time = Some(event_time);
        }
        self.recompute_global();
        self.current_watermark(stream)
    }

    /// Records that `stream` delivered records at processing time `now`, clearing idleness.
    pub fn record_activity(&mut self, stream: StreamKind, now: Instant) {
        if let Some(clock) = self.streams.get_mut(&stream) {
            clock.last_active = now;
            if clock.idle {
                clock.idle = false;
                tracing::info!(%stream, "Stream resumed, no longer idle");
                self.recompute_global();
            }
        }
    }

    /// Marks streams silent for longer than the idle timeout as idle. Returns the newly idle ones.
    pub fn refresh_idleness(&mut self, now: Instant) -> Vec<StreamKind> {
        let Some(idle_timeout) = self.idle_timeout else {
            return Vec::new();
        };
        let mut newly_idle = Vec::new();
        for (stream, clock) in self.streams.iter_mut() {
            if !clock.idle && now.saturating_duration_since(clock.last_active) >= idle_timeout {
                clock.idle = true;
                newly_idle.push(*stream);
            }
        }
        if !newly_idle.is_empty() {
            tracing::info!(streams = ?newly_idle, "Streams idle, excluded from the global watermark");
            self.recompute_global();
        }
        newly_idle
    }

    pub fn current_watermark(&self, stream: StreamKind) -> Watermark {
        self.streams
            .get(&stream)
            .and_then(|clock| clock.max_event_time)
            .map_or(MIN_WATERMARK, |max| {
                max.checked_sub_signed(self.allowed_lateness)
                    .unwrap_or(MIN_WATERMARK)
            })
    }

    /// Whether `event_time` is already behind the watermark of its own stream.
    pub fn is_late(&self, stream: StreamKind, event_time: DateTime<Utc>) -> bool {
        event_time < self.current_watermark(stream)
    }

    pub fn is_idle(&self, stream: StreamKind) -> bool {
        self.streams.get(&stream).is_some_and(|clock| clock.idle)
    }

    pub fn global_watermark(&self) -> Watermark {
        self.global
    }

    fn recompute_global(&mut self) {
        let active = self
            .streams
            .iter()
            .filter(|(_, clock)| !clock.idle)
            .map(|(stream, _)| self.current_watermark(*stream))
            .min();
        // with every stream idle nothing is in flight, the slowest stream that delivered anything
        // bounds what can still arrive
        let candidate = active.or_else(|| {
            self.streams
                .iter()
                .filter(|(_, clock)| clock.max_event_time.is_some())
                .map(|(stream, _)| self.current_watermark(*stream))
                .min()
        });
        if let Some(candidate) = candidate
            && candidate > self.global
        {
            self.global = candidate;
        }
    }
}
