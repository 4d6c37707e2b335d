//! Pipeline configuration, built once at start-up and shared read-only. No component reads the
//! environment on its own.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::Result;
use crate::error::Error;
use crate::retry::RetryConfig;
use crate::schema::StreamKind;

const DEFAULT_BOOTSTRAP_SERVERS: &str = "localhost:9092";
const DEFAULT_CONSUMER_GROUP: &str = "cityflux";
const DEFAULT_ALLOWED_LATENESS_SECS: u64 = 300;
const DEFAULT_WINDOW_SIZE_SECS: u64 = 60;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;
const DEFAULT_BATCH_SIZE: usize = 500;
const DEFAULT_POLL_TIMEOUT_MS: u64 = 500;
const DEFAULT_SINK_WORKERS: usize = 4;
const DEFAULT_SINK_QUEUE_CAPACITY: usize = 64;
const DEFAULT_LATE_LOG_CAPACITY: usize = 10_000;
const DEFAULT_STORAGE_PATH: &str = "var/cityflux";
const DEFAULT_STORAGE_BUCKETS: u16 = 16;
const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:2469";

const ENV_BOOTSTRAP_SERVERS: &str = "KAFKA_BOOTSTRAP_SERVER";
const ENV_VEHICLE_TOPIC: &str = "VEHICLE_TOPIC";
const ENV_GPS_TOPIC: &str = "GPS_TOPIC";
const ENV_TRAFFIC_TOPIC: &str = "TRAFFIC_TOPIC";
const ENV_WEATHER_TOPIC: &str = "WEATHER_TOPIC";
const ENV_EMERGENCY_TOPIC: &str = "EMERGENCY_TOPIC";
const ENV_CONSUMER_GROUP: &str = "CITYFLUX_CONSUMER_GROUP";
const ENV_ALLOWED_LATENESS_SECS: &str = "CITYFLUX_ALLOWED_LATENESS_SECS";
const ENV_WINDOW_SIZE_SECS: &str = "CITYFLUX_WINDOW_SIZE_SECS";
const ENV_WINDOW_SLIDE_SECS: &str = "CITYFLUX_WINDOW_SLIDE_SECS";
const ENV_IDLE_TIMEOUT_SECS: &str = "CITYFLUX_IDLE_TIMEOUT_SECS";
const ENV_BATCH_SIZE: &str = "CITYFLUX_BATCH_SIZE";
const ENV_POLL_TIMEOUT_MS: &str = "CITYFLUX_POLL_TIMEOUT_MS";
const ENV_SINK_WORKERS: &str = "CITYFLUX_SINK_WORKERS";
const ENV_SINK_QUEUE_CAPACITY: &str = "CITYFLUX_SINK_QUEUE_CAPACITY";
const ENV_LATE_LOG_CAPACITY: &str = "CITYFLUX_LATE_LOG_CAPACITY";
const ENV_STORAGE_PATH: &str = "CITYFLUX_STORAGE_PATH";
const ENV_STORAGE_BUCKETS: &str = "CITYFLUX_STORAGE_BUCKETS";
const ENV_ACCESS_KEY: &str = "AWS_ACCESS_KEY";
const ENV_SECRET_KEY: &str = "AWS_SECRET_KEY";
const ENV_METRICS_ADDR: &str = "CITYFLUX_METRICS_ADDR";

const KNOWN_VARS: [&str; 21] = [
    ENV_BOOTSTRAP_SERVERS,
    ENV_VEHICLE_TOPIC,
    ENV_GPS_TOPIC,
    ENV_TRAFFIC_TOPIC,
    ENV_WEATHER_TOPIC,
    ENV_EMERGENCY_TOPIC,
    ENV_CONSUMER_GROUP,
    ENV_ALLOWED_LATENESS_SECS,
    ENV_WINDOW_SIZE_SECS,
    ENV_WINDOW_SLIDE_SECS,
    ENV_IDLE_TIMEOUT_SECS,
    ENV_BATCH_SIZE,
    ENV_POLL_TIMEOUT_MS,
    ENV_SINK_WORKERS,
    ENV_SINK_QUEUE_CAPACITY,
    ENV_LATE_LOG_CAPACITY,
    ENV_STORAGE_PATH,
    ENV_STORAGE_BUCKETS,
    ENV_ACCESS_KEY,
    ENV_SECRET_KEY,
    ENV_METRICS_ADDR,
];

/// Object-storage credentials. Never printed.
#[derive(Clone, PartialEq)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &"<redacted>")
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    /// Root under which joined records, late events and the checkpoint are written.
    pub path_prefix: PathBuf,
    /// Number of hash buckets joined records are spread over within a day partition.
    pub buckets: u16,
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub bootstrap_servers: String,
    pub consumer_group: String,
    pub topics: BTreeMap<StreamKind, String>,
    pub allowed_lateness: Duration,
    pub window_size: Duration,
    /// Sliding windows when set, tumbling windows otherwise.
    pub window_slide: Option<Duration>,
    /// How long a stream may stay silent before it stops holding back the global watermark.
    pub idle_timeout: Option<Duration>,
    pub idle_check_interval: Duration,
    pub batch_size: usize,
    pub poll_timeout: Duration,
    /// Capacity of the channel between the ingestors and the join loop.
    pub ingest_channel_capacity: usize,
    pub sink_workers: usize,
    pub sink_queue_capacity: usize,
    pub late_log_capacity: usize,
    pub storage: StorageConfig,
    pub ingest_retry: RetryConfig,
    pub sink_retry: RetryConfig,
    /// Where `/metrics`, `/livez`, `/readyz` and `/health` are served.
    pub metrics_addr: SocketAddr,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: DEFAULT_BOOTSTRAP_SERVERS.to_string(),
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            topics: StreamKind::ALL
                .into_iter()
                .map(|kind| (kind, default_topic(kind).to_string()))
                .collect(),
            allowed_lateness: Duration::from_secs(DEFAULT_ALLOWED_LATENESS_SECS),
            window_size: Duration::from_secs(DEFAULT_WINDOW_SIZE_SECS),
            window_slide: None,
            idle_timeout: Some(Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS)),
            idle_check_interval: Duration::from_secs(1),
            batch_size: DEFAULT_BATCH_SIZE,
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            ingest_channel_capacity: 16,
            sink_workers: DEFAULT_SINK_WORKERS,
            sink_queue_capacity: DEFAULT_SINK_QUEUE_CAPACITY,
            late_log_capacity: DEFAULT_LATE_LOG_CAPACITY,
            storage: StorageConfig {
                path_prefix: PathBuf::from(DEFAULT_STORAGE_PATH),
                buckets: DEFAULT_STORAGE_BUCKETS,
                credentials: None,
            },
            ingest_retry: RetryConfig::default(),
            sink_retry: RetryConfig::default(),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 2469)),
        }
    }
}

fn default_topic(kind: StreamKind) -> &'static str {
    match kind {
        StreamKind::Vehicle => "vehicle_data",
        StreamKind::Gps => "gps_data",
        StreamKind::TrafficCamera => "traffic_data",
        StreamKind::Weather => "weather_data",
        StreamKind::Emergency => "emergency_data",
    }
}

fn topic_var(kind: StreamKind) -> &'static str {
    match kind {
        StreamKind::Vehicle => ENV_VEHICLE_TOPIC,
        StreamKind::Gps => ENV_GPS_TOPIC,
        StreamKind::TrafficCamera => ENV_TRAFFIC_TOPIC,
        StreamKind::Weather => ENV_WEATHER_TOPIC,
        StreamKind::Emergency => ENV_EMERGENCY_TOPIC,
    }
}

impl PipelineConfig {
    /// Builds the configuration from environment variables, falling back to defaults for
    /// anything unset.
    pub fn load<K, V>(env_vars: impl IntoIterator<Item = (K, V)>) -> Result<Self>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let env_vars: HashMap<String, String> = env_vars
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .filter(|(key, _)| KNOWN_VARS.contains(&key.as_str()))
            .collect();

        let get_var = |var: &str| env_vars.get(var).map(|v| v.trim().to_string());

        let parse_var = |var: &str, default| -> Result<u64> {
            match get_var(var) {
                Some(raw) => parse(var, &raw),
                None => Ok(default),
            }
        };

        let mut config = Self::default();

        if let Some(servers) = get_var(ENV_BOOTSTRAP_SERVERS) {
            config.bootstrap_servers = servers;
        }
        if let Some(group) = get_var(ENV_CONSUMER_GROUP) {
            config.consumer_group = group;
        }
        for kind in StreamKind::ALL {
            if let Some(topic) = get_var(topic_var(kind)) {
                config.topics.insert(kind, topic);
            }
        }

        config.allowed_lateness = Duration::from_secs(parse_var(
            ENV_ALLOWED_LATENESS_SECS,
            DEFAULT_ALLOWED_LATENESS_SECS,
        )?);
        config.window_size =
            Duration::from_secs(parse_var(ENV_WINDOW_SIZE_SECS, DEFAULT_WINDOW_SIZE_SECS)?);
        config.window_slide = get_var(ENV_WINDOW_SLIDE_SECS)
            .map(|raw| parse::<u64>(ENV_WINDOW_SLIDE_SECS, &raw))
            .transpose()?
            .map(Duration::from_secs);
        config.idle_timeout =
            match parse_var(ENV_IDLE_TIMEOUT_SECS, DEFAULT_IDLE_TIMEOUT_SECS)? {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            };
        config.batch_size = parse_var(ENV_BATCH_SIZE, DEFAULT_BATCH_SIZE as u64)? as usize;
        config.poll_timeout =
            Duration::from_millis(parse_var(ENV_POLL_TIMEOUT_MS, DEFAULT_POLL_TIMEOUT_MS)?);
        config.sink_workers = parse_var(ENV_SINK_WORKERS, DEFAULT_SINK_WORKERS as u64)? as usize;
        config.sink_queue_capacity =
            parse_var(ENV_SINK_QUEUE_CAPACITY, DEFAULT_SINK_QUEUE_CAPACITY as u64)? as usize;
        config.late_log_capacity =
            parse_var(ENV_LATE_LOG_CAPACITY, DEFAULT_LATE_LOG_CAPACITY as u64)? as usize;

        if let Some(path) = get_var(ENV_STORAGE_PATH) {
            config.storage.path_prefix = PathBuf::from(path);
        }
        if let Some(raw) = get_var(ENV_STORAGE_BUCKETS) {
            config.storage.buckets = parse(ENV_STORAGE_BUCKETS, &raw)?;
        }
        config.metrics_addr = parse(
            ENV_METRICS_ADDR,
            &get_var(ENV_METRICS_ADDR).unwrap_or_else(|| DEFAULT_METRICS_ADDR.to_string()),
        )?;
        config.storage.credentials = match (get_var(ENV_ACCESS_KEY), get_var(ENV_SECRET_KEY)) {
            (Some(access_key), Some(secret_key)) => Some(Credentials {
                access_key,
                secret_key,
            }),
            (None, None) => None,
            _ => {
                return Err(Error::Config(format!(
                    "{ENV_ACCESS_KEY} and {ENV_SECRET_KEY} must be set together"
                )));
            }
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_size.as_millis() == 0 {
            return Err(Error::Config("window size must be positive".into()));
        }
        if let Some(slide) = self.window_slide
            && (slide.as_millis() == 0 || slide > self.window_size)
        {
            return Err(Error::Config(format!(
                "window slide {slide:?} must be positive and at most the window size {:?}",
                self.window_size
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch size must be positive".into()));
        }
        if self.sink_workers == 0 || self.sink_queue_capacity == 0 {
            return Err(Error::Config(
                "sink workers and queue capacity must be positive".into(),
            ));
        }
        if self.ingest_channel_capacity == 0 {
            return Err(Error::Config("ingest channel capacity must be positive".into()));
        }
        if self.storage.buckets == 0 {
            return Err(Error::Config("storage buckets must be positive".into()));
        }
        if self.late_log_capacity == 0 {
            return Err(Error::Config("late log capacity must be positive".into()));
        }
        Ok(())
    }

    pub fn topic(&self, kind: StreamKind) -> &str {
        self.topics
            .get(&kind)
            .map(String::as_str)
            .unwrap_or_else(|| default_topic(kind))
    }
}

fn parse<T: FromStr>(var: &str, raw: &str) -> Result<T>
where
    T::Err: fmt::Display,
{
    raw.parse()
        .map_err(|e| Error::Config(format!("Invalid value {raw:?} for {var}: {e}")))
}
