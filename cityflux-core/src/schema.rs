//! Event schema registry. The five record shapes are declared once, as field tables, and every
//! ingestor validates raw transport payloads against them. A payload that passes the table is
//! decoded into its typed [Event].

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

mod events;
pub use events::{
    EmergencyEvent, Event, GeoPoint, GpsEvent, TrafficCameraEvent, VehicleEvent, WeatherEvent,
    parse_event_time,
};

/// The five telemetry streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Vehicle,
    Gps,
    TrafficCamera,
    Weather,
    Emergency,
}

impl StreamKind {
    pub const ALL: [StreamKind; 5] = [
        StreamKind::Vehicle,
        StreamKind::Gps,
        StreamKind::TrafficCamera,
        StreamKind::Weather,
        StreamKind::Emergency,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Vehicle => "vehicle",
            StreamKind::Gps => "gps",
            StreamKind::TrafficCamera => "traffic_camera",
            StreamKind::Weather => "weather",
            StreamKind::Emergency => "emergency",
        }
    }

    /// Field table of this stream's record shape.
    pub fn fields(&self) -> &'static [FieldSpec] {
        match self {
            StreamKind::Vehicle => VEHICLE_FIELDS,
            StreamKind::Gps => GPS_FIELDS,
            StreamKind::TrafficCamera => TRAFFIC_CAMERA_FIELDS,
            StreamKind::Weather => WEATHER_FIELDS,
            StreamKind::Emergency => EMERGENCY_FIELDS,
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Double,
    Integer,
    Timestamp,
    Location,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::String => "string",
            FieldType::Double => "double",
            FieldType::Integer => "integer",
            FieldType::Timestamp => "timestamp",
            FieldType::Location => "location",
        };
        f.write_str(name)
    }
}

/// One entry of a record shape. `alias` is an alternative wire name accepted for the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub alias: Option<&'static str>,
    pub field_type: FieldType,
    pub required: bool,
}

impl FieldSpec {
    const fn required(name: &'static str, field_type: FieldType) -> Self {
        Self {
            name,
            alias: None,
            field_type,
            required: true,
        }
    }

    const fn optional(name: &'static str, field_type: FieldType) -> Self {
        Self {
            name,
            alias: None,
            field_type,
            required: false,
        }
    }

    const fn alias(self, alias: &'static str) -> Self {
        Self {
            alias: Some(alias),
            ..self
        }
    }

    fn lookup<'a>(&self, object: &'a Map<String, Value>) -> Option<&'a Value> {
        object
            .get(self.name)
            .or_else(|| self.alias.and_then(|alias| object.get(alias)))
            .filter(|value| !value.is_null())
    }
}

const ID: FieldSpec = FieldSpec::required("id", FieldType::String);
const DEVICE_ID: FieldSpec = FieldSpec::required("deviceId", FieldType::String);
const TIMESTAMP: FieldSpec = FieldSpec::required("timestamp", FieldType::Timestamp);

const VEHICLE_FIELDS: &[FieldSpec] = &[
    ID,
    DEVICE_ID,
    TIMESTAMP,
    FieldSpec::required("location", FieldType::Location),
    FieldSpec::required("speed", FieldType::Double),
    FieldSpec::required("direction", FieldType::String),
    FieldSpec::optional("make", FieldType::String),
    FieldSpec::optional("model", FieldType::String),
    FieldSpec::optional("year", FieldType::Integer),
    FieldSpec::optional("fuelType", FieldType::String).alias("fullType"),
];

const GPS_FIELDS: &[FieldSpec] = &[
    ID,
    DEVICE_ID,
    TIMESTAMP,
    FieldSpec::required("speed", FieldType::Double),
    FieldSpec::required("direction", FieldType::String),
    FieldSpec::optional("vehicleType", FieldType::String),
];

const TRAFFIC_CAMERA_FIELDS: &[FieldSpec] = &[
    ID,
    DEVICE_ID,
    TIMESTAMP,
    FieldSpec::required("cameraId", FieldType::String),
    FieldSpec::optional("location", FieldType::Location),
    FieldSpec::required("snapshot", FieldType::String),
];

const WEATHER_FIELDS: &[FieldSpec] = &[
    ID,
    DEVICE_ID,
    TIMESTAMP,
    FieldSpec::optional("location", FieldType::Location),
    FieldSpec::required("temperature", FieldType::Double).alias("tempreture"),
    FieldSpec::optional("precipitation", FieldType::Double),
    FieldSpec::required("weatherCondition", FieldType::String),
    FieldSpec::optional("windSpeed", FieldType::Double),
    FieldSpec::optional("humidity", FieldType::Integer),
    FieldSpec::optional("airQualityIndex", FieldType::Double),
];

const EMERGENCY_FIELDS: &[FieldSpec] = &[
    ID,
    DEVICE_ID,
    TIMESTAMP,
    FieldSpec::required("incidentId", FieldType::String),
    FieldSpec::required("type", FieldType::String),
    FieldSpec::optional("location", FieldType::Location),
    FieldSpec::required("status", FieldType::String),
    FieldSpec::optional("description", FieldType::String),
];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("required field `{field}` is missing")]
    MissingField { field: &'static str },

    #[error("field `{field}` expected {expected}, found {found}")]
    TypeMismatch {
        field: &'static str,
        expected: FieldType,
        found: &'static str,
    },

    #[error("field `{field}` is not a valid timestamp: {value}")]
    InvalidTimestamp { field: &'static str, value: String },
}

/// Validates a raw payload against the field table of `kind` and decodes it.
pub fn validate(kind: StreamKind, raw: &[u8]) -> Result<Event, SchemaError> {
    let value: Value =
        serde_json::from_slice(raw).map_err(|e| SchemaError::Malformed(e.to_string()))?;
    let Value::Object(object) = &value else {
        return Err(SchemaError::Malformed(format!(
            "expected a JSON object, found {}",
            json_type(&value)
        )));
    };

    for field in kind.fields() {
        check_field(field, object)?;
    }

    let decoded = match kind {
        StreamKind::Vehicle => serde_json::from_value(value).map(Event::Vehicle),
        StreamKind::Gps => serde_json::from_value(value).map(Event::Gps),
        StreamKind::TrafficCamera => serde_json::from_value(value).map(Event::TrafficCamera),
        StreamKind::Weather => serde_json::from_value(value).map(Event::Weather),
        StreamKind::Emergency => serde_json::from_value(value).map(Event::Emergency),
    };
    decoded.map_err(|e| SchemaError::Malformed(e.to_string()))
}

fn check_field(field: &FieldSpec, object: &Map<String, Value>) -> Result<(), SchemaError> {
    let Some(value) = field.lookup(object) else {
        return if field.required {
            Err(SchemaError::MissingField { field: field.name })
        } else {
            Ok(())
        };
    };

    let mismatch = || SchemaError::TypeMismatch {
        field: field.name,
        expected: field.field_type,
        found: json_type(value),
    };

    match field.field_type {
        FieldType::String if value.is_string() => Ok(()),
        FieldType::Double if value.is_number() => Ok(()),
        FieldType::Integer if value.is_i64() || value.is_u64() => Ok(()),
        FieldType::Timestamp => {
            let raw = value.as_str().ok_or_else(mismatch)?;
            parse_event_time(raw)
                .map(|_| ())
                .ok_or_else(|| SchemaError::InvalidTimestamp {
                    field: field.name,
                    value: raw.to_string(),
                })
        }
        FieldType::Location => GeoPoint::deserialize(value)
            .map(|_| ())
            .map_err(|_| mismatch()),
        _ => Err(mismatch()),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::*;

    fn vehicle_payload() -> Value {
        json!({
            "id": "4c0e1d7a-6a43-4a7e-9d8e-0f3f9c6f1c2a",
            "deviceId": "vehicle-nf-123",
            "timestamp": "2025-01-01T10:00:30.500000",
            "location": [51.5074, -0.1278],
            "speed": 27.5,
            "direction": "North-East",
            "make": "BMW",
            "model": "C500",
            "year": 2025,
            "fullType": "Hybrid"
        })
    }

    fn bytes(value: &Value) -> Vec<u8> {
        serde_json::to_vec(value).unwrap()
    }

    #[test]
    fn test_validate_vehicle() {
        let event = validate(StreamKind::Vehicle, &bytes(&vehicle_payload())).unwrap();
        assert_eq!(event.kind(), StreamKind::Vehicle);
        assert_eq!(event.device_id(), "vehicle-nf-123");
        assert_eq!(
            event.event_time(),
            Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 30).unwrap()
                + chrono::Duration::milliseconds(500)
        );

        let Event::Vehicle(vehicle) = event else {
            panic!("expected a vehicle event");
        };
        assert_eq!(vehicle.fuel_type.as_deref(), Some("Hybrid"));
        assert_eq!(vehicle.year, Some(2025));
        assert_eq!(
            vehicle.location,
            GeoPoint {
                latitude: 51.5074,
                longitude: -0.1278
            }
        );
    }

    #[test]
    fn test_validate_each_kind() {
        let cases = [
            (
                StreamKind::Gps,
                json!({"id": "g1", "deviceId": "d", "timestamp": "2025-01-01T00:00:00Z",
                       "speed": 12, "direction": "North-East", "vehicleType": "private"}),
            ),
            (
                StreamKind::TrafficCamera,
                json!({"id": "t1", "deviceId": "d", "timestamp": "2025-01-01T00:00:00Z",
                       "cameraId": "Nikon-Cam123", "location": "51.5, -0.12", "snapshot": "Base64EncodedString"}),
            ),
            (
                StreamKind::Weather,
                json!({"id": "w1", "deviceId": "d", "timestamp": "2025-01-01T00:00:00+01:00",
                       "tempreture": 12.5, "weatherCondition": "Rain", "humidity": 80,
                       "location": {"latitude": 51.5, "longitude": -0.12}}),
            ),
            (
                StreamKind::Emergency,
                json!({"id": "e1", "deviceId": "d", "timestamp": "2025-01-01 00:00:00",
                       "incidentId": "i1", "type": "Fire", "status": "Active",
                       "description": "Description of the incident"}),
            ),
        ];

        for (kind, payload) in cases {
            let event = validate(kind, &bytes(&payload))
                .unwrap_or_else(|e| panic!("{kind} should validate: {e}"));
            assert_eq!(event.kind(), kind);
        }
    }

    #[test]
    fn test_weather_offset_timestamp_normalized_to_utc() {
        let payload = json!({"id": "w1", "deviceId": "d", "timestamp": "2025-01-01T01:00:00+01:00",
                             "temperature": 3.0, "weatherCondition": "Snowy"});
        let event = validate(StreamKind::Weather, &bytes(&payload)).unwrap();
        assert_eq!(
            event.event_time(),
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_missing_required_field() {
        let mut payload = vehicle_payload();
        payload.as_object_mut().unwrap().remove("deviceId");
        assert_eq!(
            validate(StreamKind::Vehicle, &bytes(&payload)),
            Err(SchemaError::MissingField { field: "deviceId" })
        );

        let mut payload = vehicle_payload();
        payload["speed"] = Value::Null;
        assert_eq!(
            validate(StreamKind::Vehicle, &bytes(&payload)),
            Err(SchemaError::MissingField { field: "speed" })
        );
    }

    #[test]
    fn test_type_mismatch() {
        let mut payload = vehicle_payload();
        payload["speed"] = json!("fast");
        assert_eq!(
            validate(StreamKind::Vehicle, &bytes(&payload)),
            Err(SchemaError::TypeMismatch {
                field: "speed",
                expected: FieldType::Double,
                found: "string"
            })
        );

        let mut payload = vehicle_payload();
        payload["year"] = json!(2025.5);
        assert!(matches!(
            validate(StreamKind::Vehicle, &bytes(&payload)),
            Err(SchemaError::TypeMismatch { field: "year", .. })
        ));

        let mut payload = vehicle_payload();
        payload["location"] = json!([51.5]);
        assert!(matches!(
            validate(StreamKind::Vehicle, &bytes(&payload)),
            Err(SchemaError::TypeMismatch {
                field: "location",
                ..
            })
        ));
    }

    #[test]
    fn test_invalid_timestamp() {
        let mut payload = vehicle_payload();
        payload["timestamp"] = json!("yesterday");
        assert_eq!(
            validate(StreamKind::Vehicle, &bytes(&payload)),
            Err(SchemaError::InvalidTimestamp {
                field: "timestamp",
                value: "yesterday".into()
            })
        );
    }

    #[test]
    fn test_malformed_payload() {
        assert!(matches!(
            validate(StreamKind::Gps, b"not json"),
            Err(SchemaError::Malformed(_))
        ));
        assert!(matches!(
            validate(StreamKind::Gps, b"[1, 2, 3]"),
            Err(SchemaError::Malformed(_))
        ));
    }

    #[test]
    fn test_serialized_event_validates_again() {
        let event = validate(StreamKind::Vehicle, &bytes(&vehicle_payload())).unwrap();
        let Event::Vehicle(vehicle) = &event else {
            unreachable!()
        };
        let encoded = serde_json::to_vec(vehicle).unwrap();
        assert_eq!(validate(StreamKind::Vehicle, &encoded).unwrap(), event);
    }
}
