//! Core of the CityFlux telemetry pipeline. Five geospatial streams (vehicle, GPS, traffic
//! camera, weather and emergency) are validated, aligned on event time and joined per device and
//! time window. Every window is written exactly once in effect, even across crashes and restarts.
//!
//! The main pieces:
//! - [schema]: the single registry of the five record shapes.
//! - [ingest]: one reader task per stream.
//! - [watermark] and [window]: event-time progress and window assignment.
//! - [join]: the temporal join and the late-event log.
//! - [sink] and [checkpoint]: durable, idempotent emission and recovery.
//! - [pipeline]: the coordinator tying them together.

pub use self::error::{Error, Result};

/// Pipeline configuration.
pub mod config;

/// Error types of the pipeline.
pub mod error;

/// Retry policy with bounded exponential backoff.
pub mod retry;

/// Event schema registry.
pub mod schema;

/// Transport and validated records.
pub mod message;

/// Partitioned logs the streams are read from.
pub mod transport;

/// Per-stream ingestion.
pub mod ingest;

/// Event-time watermarks.
pub mod watermark;

/// Window assignment.
pub mod window;

/// Temporal join engine.
pub mod join;

/// The persisted checkpoint document.
pub mod checkpoint;

/// Offsets held by windows that are not yet durable.
pub mod tracker;

/// Record and checkpoint storage.
pub mod storage;

/// Writes joined records and advances the checkpoint.
pub mod sink;

/// The pipeline coordinator.
pub mod pipeline;

/// Per-stream health signals.
pub mod health;

/// Prometheus metrics.
pub mod metrics;

/// Fault injection for the in-memory transport and storage.
pub mod fault;
