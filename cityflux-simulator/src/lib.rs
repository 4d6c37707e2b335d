//! Synthetic telemetry for CityFlux. Each simulated vehicle drives from London to Birmingham and
//! publishes its vehicle, GPS, traffic camera and weather readings (and the occasional emergency)
//! to the five stream topics, keyed by device id.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use cityflux_core::config::PipelineConfig;
use cityflux_core::schema::StreamKind;
use cityflux_core::transport::TopicProducer;

pub use self::error::{Error, Result};

/// Error types of the simulator.
pub mod error;

/// Vehicle state and the per-step sensor readings.
pub mod journey;

use journey::VehicleState;

const ENV_VEHICLES: &str = "CITYFLUX_SIM_VEHICLES";
const ENV_PACE_MS: &str = "CITYFLUX_SIM_PACE_MS";
const ENV_SEED: &str = "CITYFLUX_SIM_SEED";

const DEFAULT_VEHICLES: usize = 1;

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub vehicles: usize,
    /// Wall-clock pause between steps. Event time always advances by the sampled 30 to 60 s.
    pub pace: Duration,
    pub seed: Option<u64>,
    pub topics: BTreeMap<StreamKind, String>,
    pub start_time: DateTime<Utc>,
}

impl SimulatorConfig {
    pub fn load<K, V>(env_vars: impl IntoIterator<Item = (K, V)>, pipeline: &PipelineConfig) -> Result<Self>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let env_vars: HashMap<String, String> = env_vars
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .filter(|(key, _)| [ENV_VEHICLES, ENV_PACE_MS, ENV_SEED].contains(&key.as_str()))
            .collect();

        let parse = |var: &str| -> Result<Option<u64>> {
            env_vars
                .get(var)
                .map(|raw| {
                    raw.trim()
                        .parse::<u64>()
                        .map_err(|e| Error::Config(format!("invalid value `{raw}` for {var}: {e}")))
                })
                .transpose()
        };

        let vehicles = parse(ENV_VEHICLES)?.map_or(DEFAULT_VEHICLES, |n| n as usize);
        if vehicles == 0 {
            return Err(Error::Config(format!("{ENV_VEHICLES} must be positive")));
        }

        Ok(Self {
            vehicles,
            pace: Duration::from_millis(parse(ENV_PACE_MS)?.unwrap_or(0)),
            seed: parse(ENV_SEED)?,
            topics: StreamKind::ALL
                .into_iter()
                .map(|kind| (kind, pipeline.topic(kind).to_string()))
                .collect(),
            start_time: Utc::now(),
        })
    }

    fn topic(&self, kind: StreamKind) -> Result<&str> {
        self.topics
            .get(&kind)
            .map(String::as_str)
            .ok_or_else(|| Error::Config(format!("no topic configured for {kind}")))
    }
}

/// What a simulation run published.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulationReport {
    pub steps: u64,
    pub sent: BTreeMap<StreamKind, u64>,
    /// Whether every vehicle reached Birmingham (false when cancelled early).
    pub arrived: bool,
}

pub struct Simulator<P> {
    config: SimulatorConfig,
    producer: P,
}

impl<P: TopicProducer> Simulator<P> {
    pub fn new(config: SimulatorConfig, producer: P) -> Self {
        Self { config, producer }
    }

    /// Drives every vehicle until it arrives or `cancel` fires, publishing each reading as it is
    /// taken. Vehicles are stepped round-robin so their event times stay roughly aligned.
    pub async fn run(self, cancel: CancellationToken) -> Result<SimulationReport> {
        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let mut vehicles: Vec<VehicleState> = (1..=self.config.vehicles)
            .map(|n| VehicleState::new(format!("vehicle-{n:03}"), self.config.start_time))
            .collect();
        let mut report = SimulationReport::default();

        info!(vehicles = vehicles.len(), "Starting journey simulation");
        while !vehicles.iter().all(VehicleState::arrived) {
            if cancel.is_cancelled() {
                info!(steps = report.steps, "Simulation cancelled");
                self.producer.flush().await?;
                return Ok(report);
            }

            for vehicle in vehicles.iter_mut().filter(|v| !v.arrived()) {
                for event in journey::step(vehicle, &mut rng) {
                    let kind = event.kind();
                    let payload = journey::encode(&event)?;
                    self.producer
                        .send(self.config.topic(kind)?, vehicle.device_id(), payload)
                        .await?;
                    *report.sent.entry(kind).or_default() += 1;
                }
                debug!(device_id = vehicle.device_id(), clock = %vehicle.clock(), "Vehicle advanced");
            }
            report.steps += 1;

            if !self.config.pace.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.config.pace) => {}
                }
            }
        }

        self.producer.flush().await?;
        report.arrived = true;
        info!(steps = report.steps, sent = ?report.sent, "All vehicles arrived in Birmingham");
        Ok(report)
    }
}
