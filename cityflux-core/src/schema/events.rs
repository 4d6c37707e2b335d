use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::StreamKind;

/// Parses an event timestamp. RFC 3339 strings keep their offset and are normalized to UTC; naive
/// ISO-8601 strings (no offset) are taken to be UTC.
pub fn parse_event_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

fn deserialize_event_time<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_event_time(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp `{raw}`")))
}

/// A WGS84 position. Accepted on the wire as `[lat, lon]`, `"lat, lon"`, `"(lat, lon)"` or
/// `{"latitude": .., "longitude": ..}`; always written in the object form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawLocation")]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawLocation {
    Pair(f64, f64),
    Text(String),
    Object { latitude: f64, longitude: f64 },
}

impl TryFrom<RawLocation> for GeoPoint {
    type Error = String;

    fn try_from(raw: RawLocation) -> Result<Self, Self::Error> {
        let (latitude, longitude) = match raw {
            RawLocation::Pair(lat, lon) | RawLocation::Object { latitude: lat, longitude: lon } => {
                (lat, lon)
            }
            RawLocation::Text(text) => {
                let inner = text
                    .trim()
                    .trim_start_matches(['(', '['])
                    .trim_end_matches([')', ']']);
                let mut parts = inner.split(',').map(|part| part.trim().parse::<f64>());
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(Ok(lat)), Some(Ok(lon)), None) => (lat, lon),
                    _ => return Err(format!("invalid location `{text}`")),
                }
            }
        };

        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return Err(format!("location ({latitude}, {longitude}) out of range"));
        }
        Ok(GeoPoint {
            latitude,
            longitude,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleEvent {
    pub id: String,
    pub device_id: String,
    #[serde(rename = "timestamp", deserialize_with = "deserialize_event_time")]
    pub event_time: DateTime<Utc>,
    pub location: GeoPoint,
    pub speed: f64,
    pub direction: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub make: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i64>,
    #[serde(default, alias = "fullType", skip_serializing_if = "Option::is_none")]
    pub fuel_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpsEvent {
    pub id: String,
    pub device_id: String,
    #[serde(rename = "timestamp", deserialize_with = "deserialize_event_time")]
    pub event_time: DateTime<Utc>,
    pub speed: f64,
    pub direction: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficCameraEvent {
    pub id: String,
    pub device_id: String,
    #[serde(rename = "timestamp", deserialize_with = "deserialize_event_time")]
    pub event_time: DateTime<Utc>,
    pub camera_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    pub snapshot: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherEvent {
    pub id: String,
    pub device_id: String,
    #[serde(rename = "timestamp", deserialize_with = "deserialize_event_time")]
    pub event_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    #[serde(alias = "tempreture")]
    pub temperature: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precipitation: Option<f64>,
    pub weather_condition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wind_speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub air_quality_index: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyEvent {
    pub id: String,
    pub device_id: String,
    #[serde(rename = "timestamp", deserialize_with = "deserialize_event_time")]
    pub event_time: DateTime<Utc>,
    pub incident_id: String,
    #[serde(rename = "type")]
    pub incident_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A validated telemetry event. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    Vehicle(VehicleEvent),
    Gps(GpsEvent),
    TrafficCamera(TrafficCameraEvent),
    Weather(WeatherEvent),
    Emergency(EmergencyEvent),
}

impl Event {
    pub fn kind(&self) -> StreamKind {
        match self {
            Event::Vehicle(_) => StreamKind::Vehicle,
            Event::Gps(_) => StreamKind::Gps,
            Event::TrafficCamera(_) => StreamKind::TrafficCamera,
            Event::Weather(_) => StreamKind::Weather,
            Event::Emergency(_) => StreamKind::Emergency,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Event::Vehicle(e) => &e.id,
            Event::Gps(e) => &e.id,
            Event::TrafficCamera(e) => &e.id,
            Event::Weather(e) => &e.id,
            Event::Emergency(e) => &e.id,
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            Event::Vehicle(e) => &e.device_id,
            Event::Gps(e) => &e.device_id,
            Event::TrafficCamera(e) => &e.device_id,
            Event::Weather(e) => &e.device_id,
            Event::Emergency(e) => &e.device_id,
        }
    }

    pub fn event_time(&self) -> DateTime<Utc> {
        match self {
            Event::Vehicle(e) => e.event_time,
            Event::Gps(e) => e.event_time,
            Event::TrafficCamera(e) => e.event_time,
            Event::Weather(e) => e.event_time,
            Event::Emergency(e) => e.event_time,
        }
    }
}
