//! A simulated vehicle driving from central London to Birmingham. Each step moves the vehicle a
//! hundredth of the way (plus some road noise) and advances its clock by 30 to 60 seconds, then
//! reports what every sensor observed at that moment.

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rand::seq::IndexedRandom;
use uuid::Uuid;

use cityflux_core::schema::{
    EmergencyEvent, Event, GeoPoint, GpsEvent, TrafficCameraEvent, VehicleEvent, WeatherEvent,
};

use crate::error::{Error, Result};

pub const LONDON: GeoPoint = GeoPoint {
    latitude: 51.5074,
    longitude: -0.1278,
};

pub const BIRMINGHAM: GeoPoint = GeoPoint {
    latitude: 52.4862,
    longitude: -1.8904,
};

/// Steps from start to destination.
pub const JOURNEY_STEPS: u32 = 100;

const ROAD_NOISE: f64 = 0.0005;
const CAMERA_ID: &str = "Nikon-Cam123";
const MAKES: [&str; 4] = ["BMW", "Audi", "Tesla", "TATA"];
const MODELS: [&str; 4] = ["C500", "C100", "C200", "C300"];
const WEATHER_CONDITIONS: [&str; 4] = ["Sunny", "Cloudy", "Rain", "Snow"];
const INCIDENT_TYPES: [&str; 3] = ["Fire", "Medical", "Police"];
const INCIDENT_STATUSES: [&str; 2] = ["Active", "Resolved"];
/// Chance of an emergency report per step.
const INCIDENT_PROBABILITY: f64 = 0.05;

/// Position and clock of one simulated vehicle. Only advanced by its own journey.
#[derive(Debug, Clone)]
pub struct VehicleState {
    device_id: String,
    location: GeoPoint,
    clock: DateTime<Utc>,
    step: u32,
}

impl VehicleState {
    pub fn new(device_id: impl Into<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.into(),
            location: LONDON,
            clock: start_time,
            step: 0,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn location(&self) -> GeoPoint {
        self.location
    }

    pub fn clock(&self) -> DateTime<Utc> {
        self.clock
    }

    pub fn arrived(&self) -> bool {
        self.step >= JOURNEY_STEPS
    }

    fn advance<R: Rng>(&mut self, rng: &mut R) {
        let steps = f64::from(JOURNEY_STEPS);
        self.location.latitude += (BIRMINGHAM.latitude - LONDON.latitude) / steps
            + rng.random_range(-ROAD_NOISE..=ROAD_NOISE);
        self.location.longitude += (BIRMINGHAM.longitude - LONDON.longitude) / steps
            + rng.random_range(-ROAD_NOISE..=ROAD_NOISE);
        self.clock += Duration::seconds(rng.random_range(30..=60));
        self.step += 1;
    }
}

fn pick<'a, R: Rng>(rng: &mut R, choices: &'a [&'a str]) -> String {
    choices.choose(rng).copied().unwrap_or_default().to_string()
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Moves `state` one step and returns the readings taken there, all sharing the new timestamp.
pub fn step<R: Rng>(state: &mut VehicleState, rng: &mut R) -> Vec<Event> {
    state.advance(rng);
    let device_id = state.device_id.clone();
    let event_time = state.clock;
    let location = state.location;

    let mut events = vec![
        Event::Vehicle(VehicleEvent {
            id: new_id(),
            device_id: device_id.clone(),
            event_time,
            location,
            speed: rng.random_range(10.0..40.0),
            direction: "North-East".to_string(),
            make: Some(pick(rng, &MAKES)),
            model: Some(pick(rng, &MODELS)),
            year: Some(2025),
            fuel_type: Some("Hybrid".to_string()),
        }),
        Event::Gps(GpsEvent {
            id: new_id(),
            device_id: device_id.clone(),
            event_time,
            speed: rng.random_range(0.0..40.0),
            direction: "North-East".to_string(),
            vehicle_type: Some("private".to_string()),
        }),
        Event::TrafficCamera(TrafficCameraEvent {
            id: new_id(),
            device_id: device_id.clone(),
            event_time,
            camera_id: CAMERA_ID.to_string(),
            location: Some(location),
            snapshot: "Base64EncodedString".to_string(),
        }),
        Event::Weather(WeatherEvent {
            id: new_id(),
            device_id: device_id.clone(),
            event_time,
            location: Some(location),
            temperature: rng.random_range(-5.0..26.0),
            precipitation: Some(rng.random_range(0.0..25.0)),
            weather_condition: pick(rng, &WEATHER_CONDITIONS),
            wind_speed: Some(rng.random_range(0.0..100.0)),
            humidity: Some(rng.random_range(0..=100)),
            air_quality_index: Some(rng.random_range(0.0..500.0)),
        }),
    ];

    if rng.random_bool(INCIDENT_PROBABILITY) {
        events.push(Event::Emergency(EmergencyEvent {
            id: new_id(),
            device_id,
            event_time,
            incident_id: new_id(),
            incident_type: pick(rng, &INCIDENT_TYPES),
            location: Some(location),
            status: pick(rng, &INCIDENT_STATUSES),
            description: Some("Description of the incident".to_string()),
        }));
    }
    events
}

/// Wire form of an event: the bare record, without the kind tag, as the ingestors expect it.
pub fn encode(event: &Event) -> Result<Bytes> {
    let encoded = match event {
        Event::Vehicle(e) => serde_json::to_vec(e),
        Event::Gps(e) => serde_json::to_vec(e),
        Event::TrafficCamera(e) => serde_json::to_vec(e),
        Event::Weather(e) => serde_json::to_vec(e),
        Event::Emergency(e) => serde_json::to_vec(e),
    };
    encoded
        .map(Bytes::from)
        .map_err(|e| Error::Encode(format!("Failed to encode {} event: {e}", event.kind())))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use cityflux_core::schema;

    use super::*;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn test_journey_ends_near_birmingham() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut state = VehicleState::new("vehicle-001", start());
        let mut previous = state.clock();
        while !state.arrived() {
            step(&mut state, &mut rng);
            let elapsed = (state.clock() - previous).num_seconds();
            assert!((30..=60).contains(&elapsed), "{elapsed}s between readings");
            previous = state.clock();
        }

        // the road noise adds up to at most 0.05 degrees over the whole journey
        let location = state.location();
        assert!((location.latitude - BIRMINGHAM.latitude).abs() < 0.05 + 1e-9);
        assert!((location.longitude - BIRMINGHAM.longitude).abs() < 0.05 + 1e-9);
    }

    #[test]
    fn test_readings_pass_the_schema_registry() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut state = VehicleState::new("vehicle-001", start());
        for _ in 0..JOURNEY_STEPS {
            let events = step(&mut state, &mut rng);
            assert!(events.len() >= 4);
            for event in events {
                let encoded = encode(&event).unwrap();
                let decoded = schema::validate(event.kind(), &encoded).unwrap();
                assert_eq!(decoded.kind(), event.kind());
                assert_eq!(decoded.id(), event.id());
                assert_eq!(decoded.device_id(), "vehicle-001");
                assert_eq!(decoded.event_time(), state.clock());
            }
        }
    }

    #[test]
    fn test_vehicles_are_independent() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut first = VehicleState::new("vehicle-001", start());
        let second = VehicleState::new("vehicle-002", start());
        step(&mut first, &mut rng);
        assert_ne!(first.location(), second.location());
        assert_eq!(second.location(), LONDON);
        assert_eq!(second.clock(), start());
    }
}
