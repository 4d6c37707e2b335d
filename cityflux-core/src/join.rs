//! Temporal join of the five streams. Events are accumulated per [WindowKey] and, once the global
//! watermark has passed the end of a window, materialized into one [JoinedRecord] holding whatever
//! each stream contributed. Missing streams are not waited for.
//!
//! Lifecycle of a window: `Open` while accumulating, `Closing` once the watermark passed its end,
//! `Emitting` while the sink writes and checkpoints the record, `Closed` afterwards. The state is
//! dropped on `Closed` and the key can never be opened again: any event that maps to it from then
//! on is late.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Result;
use crate::error::Error;
use crate::message::{IngestedEvent, StreamOffset};
use crate::schema::{
    EmergencyEvent, Event, GpsEvent, StreamKind, TrafficCameraEvent, VehicleEvent, WeatherEvent,
};
use crate::watermark::{MIN_WATERMARK, Watermark};
use crate::window::WindowKey;

/// Bounded log of events that missed their window.
pub mod late;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPhase {
    Open,
    Closing,
    Emitting,
    Closed,
}

/// Outcome of offering an event to a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// The window was closed by the closure pass at `closed_through`.
    Late { closed_through: Watermark },
    /// The window was already written before a restart and the event is a replay of its input.
    AlreadyEmitted,
}

#[derive(Debug)]
struct WindowState {
    phase: WindowPhase,
    events: BTreeMap<StreamKind, Vec<IngestedEvent>>,
}

impl WindowState {
    fn new() -> Self {
        Self {
            phase: WindowPhase::Open,
            events: BTreeMap::new(),
        }
    }

    /// Keeps each stream's events ordered by event time, ties broken by stream offset. Duplicates
    /// are kept.
    fn insert(&mut self, event: IngestedEvent) {
        let events = self.events.entry(event.stream).or_default();
        let key = event.order_key();
        let idx = events.partition_point(|existing| existing.order_key() <= key);
        events.insert(idx, event);
    }

    fn offsets(&self) -> Vec<(StreamKind, StreamOffset)> {
        self.events
            .values()
            .flatten()
            .map(|event| (event.stream, event.offset))
            .collect()
    }
}

/// A window that left the `Open` phase, ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedWindow {
    pub key: WindowKey,
    pub record: JoinedRecord,
    /// Every input offset of the window, one entry per accepted event.
    pub offsets: Vec<(StreamKind, StreamOffset)>,
}

/// One joined row per window. Streams that contributed nothing are left out of the serialized
/// form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinedRecord {
    pub device_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vehicle: Vec<VehicleEvent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gps: Vec<GpsEvent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traffic_camera: Vec<TrafficCameraEvent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub weather: Vec<WeatherEvent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub emergency: Vec<EmergencyEvent>,
}

impl JoinedRecord {
    fn materialize(key: &WindowKey, state: &WindowState) -> Self {
        let mut record = JoinedRecord {
            device_id: key.device_id.clone(),
            window_start: key.start_time(),
            window_end: key.end_time(),
            vehicle: Vec::new(),
            gps: Vec::new(),
            traffic_camera: Vec::new(),
            weather: Vec::new(),
            emergency: Vec::new(),
        };
        for event in state.events.values().flatten() {
            match &event.event {
                Event::Vehicle(e) => record.vehicle.push(e.clone()),
                Event::Gps(e) => record.gps.push(e.clone()),
                Event::TrafficCamera(e) => record.traffic_camera.push(e.clone()),
                Event::Weather(e) => record.weather.push(e.clone()),
                Event::Emergency(e) => record.emergency.push(e.clone()),
            }
        }
        record
    }

    /// Streams with at least one event in the window.
    pub fn streams(&self) -> Vec<StreamKind> {
        let present = [
            (StreamKind::Vehicle, !self.vehicle.is_empty()),
            (StreamKind::Gps, !self.gps.is_empty()),
            (StreamKind::TrafficCamera, !self.traffic_camera.is_empty()),
            (StreamKind::Weather, !self.weather.is_empty()),
            (StreamKind::Emergency, !self.emergency.is_empty()),
        ];
        present
            .into_iter()
            .filter_map(|(stream, present)| present.then_some(stream))
            .collect()
    }

    /// Whether some stream contributed nothing.
    pub fn is_partial(&self) -> bool {
        self.streams().len() < StreamKind::ALL.len()
    }

    pub fn encode(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::SinkCorruption(format!("Failed to encode joined record: {e}")))
    }
}

/// Owns every window. Driven by the single join loop, so no locking is needed.
#[derive(Debug)]
pub struct JoinEngine {
    windows: BTreeMap<WindowKey, WindowState>,
    /// Watermark of the last closure pass. Every window ending at or before it is closed.
    closed_through: Watermark,
    /// Windows written before a restart, with the highest input offset per stream partition.
    recovered: HashMap<WindowKey, Vec<(StreamKind, StreamOffset)>>,
}

impl Default for JoinEngine {
    fn default() -> Self {
        Self::new(std::iter::empty())
    }
}

impl JoinEngine {
    /// Creates an engine that treats replayed input of the `recovered` windows as already
    /// emitted.
    pub fn new(
        recovered: impl IntoIterator<Item = (WindowKey, Vec<(StreamKind, StreamOffset)>)>,
    ) -> Self {
        Self {
            windows: BTreeMap::new(),
            closed_through: MIN_WATERMARK,
            recovered: recovered.into_iter().collect(),
        }
    }

    /// Offers `event` to the window `key`.
    pub fn admit(&mut self, key: WindowKey, event: &IngestedEvent) -> Admission {
        if let Some(inputs) = self.recovered.get(&key) {
            let replayed = inputs.iter().any(|(stream, offset)| {
                *stream == event.stream
                    && offset.partition == event.offset.partition
                    && event.offset.sequence <= offset.sequence
            });
            return if replayed {
                Admission::AlreadyEmitted
            } else {
                Admission::Late {
                    closed_through: self.closed_through,
                }
            };
        }

        if key.end_time() <= self.closed_through {
            return Admission::Late {
                closed_through: self.closed_through,
            };
        }

        let state = self.windows.entry(key).or_insert_with(WindowState::new);
        if state.phase != WindowPhase::Open {
            return Admission::Late {
                closed_through: self.closed_through,
            };
        }
        state.insert(event.clone());
        Admission::Accepted
    }

    /// Closes every open window whose end the `global` watermark has reached and materializes its
    /// record. The returned windows are in `Emitting` until [Self::mark_committed].
    pub fn close_windows(&mut self, global: Watermark) -> Vec<ClosedWindow> {
        if global > self.closed_through {
            self.closed_through = global;
        }
        let closed_through = self.closed_through;
        // recovered windows the watermark has passed are covered by the late rule from now on
        self.recovered
            .retain(|key, _| key.end_time() > closed_through);

        let mut closed = Vec::new();
        for (key, state) in self.windows.iter_mut() {
            if state.phase != WindowPhase::Open || key.end_time() > closed_through {
                continue;
            }
            state.phase = WindowPhase::Closing;
            let record = JoinedRecord::materialize(key, state);
            let offsets = state.offsets();
            state.phase = WindowPhase::Emitting;
            debug!(window = %key, events = offsets.len(), "Window closed");
            closed.push(ClosedWindow {
                key: key.clone(),
                record,
                offsets,
            });
        }
        closed
    }

    /// Drops the state of a window whose record is durably written and checkpointed. Returns
    /// `false` if the window was not emitting.
    pub fn mark_committed(&mut self, key: &WindowKey) -> bool {
        match self.windows.get(key) {
            Some(state) if state.phase == WindowPhase::Emitting => {
                self.windows.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn phase(&self, key: &WindowKey) -> Option<WindowPhase> {
        match self.windows.get(key) {
            Some(state) => Some(state.phase),
            None if key.end_time() <= self.closed_through || self.recovered.contains_key(key) => {
                Some(WindowPhase::Closed)
            }
            None => None,
        }
    }

    pub fn closed_through(&self) -> Watermark {
        self.closed_through
    }

    /// Windows still accumulating events.
    pub fn open_windows(&self) -> usize {
        self.windows
            .values()
            .filter(|state| state.phase == WindowPhase::Open)
            .count()
    }

    /// Windows handed to the sink and not yet committed.
    pub fn emitting_windows(&self) -> usize {
        self.windows
            .values()
            .filter(|state| state.phase == WindowPhase::Emitting)
            .count()
    }
}

#[cfg(test)]
#[allow(clippy::indexing_slicing)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::schema::GeoPoint;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn key(device: &str, start_secs: i64) -> WindowKey {
        WindowKey {
            device_id: device.into(),
            window_start_ms: start_secs * 1000,
            window_size_ms: 60_000,
        }
    }

    fn vehicle(secs: i64, sequence: i64) -> IngestedEvent {
        IngestedEvent {
            stream: StreamKind::Vehicle,
            offset: StreamOffset::new(0, sequence),
            event: Event::Vehicle(VehicleEvent {
                id: format!("v-{sequence}"),
                device_id: "V1".into(),
                event_time: at(secs),
                location: GeoPoint {
                    latitude: 51.5074,
                    longitude: -0.1278,
                },
                speed: 42.0,
                direction: "North-East".into(),
                make: Some("BMW".into()),
                model: Some("C500".into()),
                year: Some(2024),
                fuel_type: Some("Hybrid".into()),
            }),
        }
    }

    fn gps(secs: i64, partition: u16, sequence: i64) -> IngestedEvent {
        IngestedEvent {
            stream: StreamKind::Gps,
            offset: StreamOffset::new(partition, sequence),
            event: Event::Gps(GpsEvent {
                id: format!("g-{partition}-{sequence}"),
                device_id: "V1".into(),
                event_time: at(secs),
                speed: 37.5,
                direction: "North-East".into(),
                vehicle_type: Some("private".into()),
            }),
        }
    }

    fn weather(secs: i64, sequence: i64) -> IngestedEvent {
        IngestedEvent {
            stream: StreamKind::Weather,
            offset: StreamOffset::new(0, sequence),
            event: Event::Weather(WeatherEvent {
                id: format!("w-{sequence}"),
                device_id: "V1".into(),
                event_time: at(secs),
                location: None,
                temperature: 12.5,
                precipitation: Some(0.4),
                weather_condition: "Rain".into(),
                wind_speed: None,
                humidity: Some(80),
                air_quality_index: None,
            }),
        }
    }

    #[test]
    fn test_partial_join() {
        let mut engine = JoinEngine::default();
        assert_eq!(engine.admit(key("V1", 0), &vehicle(10, 0)), Admission::Accepted);
        assert_eq!(engine.admit(key("V1", 0), &weather(20, 0)), Admission::Accepted);
        assert_eq!(engine.open_windows(), 1);

        // the watermark has not reached the end yet
        assert!(engine.close_windows(at(59)).is_empty());
        assert_eq!(engine.phase(&key("V1", 0)), Some(WindowPhase::Open));

        let closed = engine.close_windows(at(60));
        assert_eq!(closed.len(), 1);
        let record = &closed[0].record;
        assert_eq!(record.vehicle.len(), 1);
        assert_eq!(record.weather.len(), 1);
        assert!(record.gps.is_empty());
        assert!(record.is_partial());
        assert_eq!(record.streams(), vec![StreamKind::Vehicle, StreamKind::Weather]);

        let encoded: serde_json::Value = serde_json::from_slice(&record.encode().unwrap()).unwrap();
        assert!(encoded.get("vehicle").is_some());
        assert!(encoded.get("weather").is_some());
        for absent in ["gps", "trafficCamera", "emergency"] {
            assert!(encoded.get(absent).is_none(), "{absent} should be absent");
        }
    }

    #[test]
    fn test_lifecycle_and_late_events() {
        let mut engine = JoinEngine::default();
        engine.admit(key("V1", 0), &vehicle(10, 0));

        let closed = engine.close_windows(at(75));
        assert_eq!(closed.len(), 1);
        assert_eq!(engine.phase(&key("V1", 0)), Some(WindowPhase::Emitting));

        // late while emitting
        assert_eq!(
            engine.admit(key("V1", 0), &gps(40, 0, 3)),
            Admission::Late {
                closed_through: at(75)
            }
        );

        assert!(engine.mark_committed(&key("V1", 0)));
        assert!(!engine.mark_committed(&key("V1", 0)));
        assert_eq!(engine.phase(&key("V1", 0)), Some(WindowPhase::Closed));

        // late once closed, and the window is never re-opened or re-emitted
        assert!(matches!(
            engine.admit(key("V1", 0), &gps(40, 0, 4)),
            Admission::Late { .. }
        ));
        assert!(engine.close_windows(at(200)).is_empty());
        assert_eq!(engine.open_windows(), 0);
    }

    #[test]
    fn test_window_never_seen_is_late_after_watermark() {
        let mut engine = JoinEngine::default();
        engine.close_windows(at(120));
        assert!(matches!(
            engine.admit(key("V2", 0), &gps(30, 0, 0)),
            Admission::Late { .. }
        ));
        assert_eq!(engine.admit(key("V2", 120), &gps(130, 0, 1)), Admission::Accepted);
    }

    #[test]
    fn test_events_ordered_by_time_then_offset() {
        let mut engine = JoinEngine::default();
        let k = key("V1", 0);
        engine.admit(k.clone(), &gps(30, 1, 5));
        engine.admit(k.clone(), &gps(20, 0, 9));
        engine.admit(k.clone(), &gps(30, 0, 7));
        // exact duplicate is kept
        engine.admit(k.clone(), &gps(30, 0, 7));

        let closed = engine.close_windows(at(60));
        let ids: Vec<&str> = closed[0].record.gps.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["g-0-9", "g-0-7", "g-0-7", "g-1-5"]);
        assert_eq!(closed[0].offsets.len(), 4);
    }

    #[test]
    fn test_replayed_input_of_recovered_window() {
        let mut engine = JoinEngine::new([(
            key("V1", 0),
            vec![
                (StreamKind::Vehicle, StreamOffset::new(0, 4)),
                (StreamKind::Gps, StreamOffset::new(0, 2)),
            ],
        )]);

        assert_eq!(
            engine.admit(key("V1", 0), &vehicle(10, 3)),
            Admission::AlreadyEmitted
        );
        assert_eq!(engine.admit(key("V1", 0), &gps(15, 0, 2)), Admission::AlreadyEmitted);
        // input the written record never saw
        assert!(matches!(
            engine.admit(key("V1", 0), &gps(15, 0, 3)),
            Admission::Late { .. }
        ));
        assert_eq!(engine.phase(&key("V1", 0)), Some(WindowPhase::Closed));
        assert!(engine.close_windows(at(60)).is_empty());
    }
}
