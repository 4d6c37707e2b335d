//! Window assignment. Windows are aligned to the epoch: a window of size `S` (and slide `P`,
//! equal to `S` for tumbling windows) starts at every multiple of `P` and covers `[start, start + S)`.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::error::Error;

/// Identity of one device's window. Equal keys always describe the same window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowKey {
    pub device_id: String,
    pub window_start_ms: i64,
    pub window_size_ms: i64,
}

impl WindowKey {
    pub fn end_ms(&self) -> i64 {
        self.window_start_ms.saturating_add(self.window_size_ms)
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        millis_to_time(self.window_start_ms)
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        millis_to_time(self.end_ms())
    }

    /// Stable bucket of the device, independent of process and platform.
    pub fn bucket(&self, buckets: u16) -> u16 {
        device_bucket(&self.device_id, buckets)
    }

    /// Storage location of the joined record of this window. Deterministic, so re-writing the same
    /// window overwrites the earlier copy, and distinct keys never share a file.
    pub fn partition_path(&self, buckets: u16) -> String {
        format!(
            "joined/date={}/bucket={:02}/{}_{}_{}.json",
            self.start_time().format("%Y-%m-%d"),
            self.bucket(buckets),
            escape_device_id(&self.device_id),
            self.window_start_ms,
            self.window_size_ms,
        )
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}, {})",
            self.device_id,
            self.window_start_ms,
            self.end_ms()
        )
    }
}

pub(crate) fn millis_to_time(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(if ms < 0 {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    })
}

/// FNV-1a over the device id. `DefaultHasher` is not guaranteed stable across releases and the
/// bucket ends up in storage paths.
pub(crate) fn device_bucket(device_id: &str, buckets: u16) -> u16 {
    let hash = device_id
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325_u64, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
        });
    (hash % u64::from(buckets.max(1))) as u16
}

/// In-process routing hash, for choosing a worker.
pub(crate) fn route(device_id: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    device_id.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

/// Percent-encodes every byte outside `[A-Za-z0-9-]`. The result is a single path component with
/// no `_`, so the file name splits back into device, start and size unambiguously.
fn escape_device_id(device_id: &str) -> String {
    let mut escaped = String::with_capacity(device_id.len());
    for byte in device_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            escaped.push(char::from(byte));
        } else {
            escaped.push_str(&format!("%{byte:02X}"));
        }
    }
    escaped
}

/// Maps an event to the windows that contain it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAssigner {
    size_ms: i64,
    slide_ms: i64,
}

impl WindowAssigner {
    pub fn tumbling(size: Duration) -> Result<Self> {
        Self::sliding(size, size)
    }

    pub fn sliding(size: Duration, slide: Duration) -> Result<Self> {
        let size_ms = i64::try_from(size.as_millis())
            .map_err(|_| Error::Config(format!("window size {size:?} too large")))?;
        let slide_ms = i64::try_from(slide.as_millis())
            .map_err(|_| Error::Config(format!("window slide {slide:?} too large")))?;
        if size_ms <= 0 || slide_ms <= 0 || slide_ms > size_ms {
            return Err(Error::Config(format!(
                "invalid window size {size:?} / slide {slide:?}"
            )));
        }
        Ok(Self { size_ms, slide_ms })
    }

    pub fn size_ms(&self) -> i64 {
        self.size_ms
    }

    /// Every window containing `event_time`, in ascending start order. Exactly one for tumbling
    /// windows.
    pub fn assign(&self, device_id: &str, event_time: DateTime<Utc>) -> Vec<WindowKey> {
        let ts = event_time.timestamp_millis();
        // floor towards negative infinity, so pre-epoch times align like the rest
        let last_start = ts.div_euclid(self.slide_ms) * self.slide_ms;

        let mut starts = Vec::with_capacity((self.size_ms / self.slide_ms) as usize);
        let mut start = last_start;
        while start > ts.saturating_sub(self.size_ms) {
            starts.push(start);
            start -= self.slide_ms;
        }
        starts.reverse();

        starts
            .into_iter()
            .map(|window_start_ms| WindowKey {
                device_id: device_id.to_string(),
                window_start_ms,
                window_size_ms: self.size_ms,
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::indexing_slicing)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at_ms(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    #[test]
    fn test_tumbling_assignment() {
        let assigner = WindowAssigner::tumbling(Duration::from_secs(60)).unwrap();

        let keys = assigner.assign("V1", at_ms(59_999));
        assert_eq!(
            keys,
            vec![WindowKey {
                device_id: "V1".into(),
                window_start_ms: 0,
                window_size_ms: 60_000
            }]
        );

        // the end is exclusive
        let keys = assigner.assign("V1", at_ms(60_000));
        assert_eq!(keys[0].window_start_ms, 60_000);
        assert_eq!(keys[0].end_ms(), 120_000);
    }

    #[test]
    fn test_pre_epoch_alignment() {
        let assigner = WindowAssigner::tumbling(Duration::from_secs(60)).unwrap();
        let keys = assigner.assign("V1", at_ms(-1));
        assert_eq!(keys[0].window_start_ms, -60_000);
        assert_eq!(keys[0].end_ms(), 0);
    }

    #[test]
    fn test_sliding_assignment() {
        let assigner =
            WindowAssigner::sliding(Duration::from_secs(60), Duration::from_secs(20)).unwrap();
        let starts: Vec<_> = assigner
            .assign("V1", at_ms(65_000))
            .into_iter()
            .map(|k| k.window_start_ms)
            .collect();
        assert_eq!(starts, vec![20_000, 40_000, 60_000]);
    }

    #[test]
    fn test_invalid_windows() {
        assert!(WindowAssigner::tumbling(Duration::ZERO).is_err());
        assert!(WindowAssigner::sliding(Duration::from_secs(10), Duration::from_secs(20)).is_err());
    }

    #[test]
    fn test_partition_path_is_deterministic() {
        let key = WindowKey {
            device_id: "vehicle nf/123".into(),
            window_start_ms: Utc
                .with_ymd_and_hms(2025, 1, 2, 3, 4, 0)
                .unwrap()
                .timestamp_millis(),
            window_size_ms: 60_000,
        };
        let path = key.partition_path(16);
        assert_eq!(path, key.clone().partition_path(16));
        assert!(path.starts_with("joined/date=2025-01-02/bucket="));
        assert!(path.ends_with(&format!(
            "/vehicle%20nf%2F123_{}_60000.json",
            key.window_start_ms
        )));
        assert!(key.bucket(16) < 16);
    }

    #[test]
    fn test_distinct_keys_have_distinct_paths() {
        let key = |device_id: &str, window_start_ms: i64, window_size_ms: i64| WindowKey {
            device_id: device_id.into(),
            window_start_ms,
            window_size_ms,
        };
        let keys = [
            key("dev/0", 0, 60_000),
            key("dev_0", 0, 60_000),
            key("dev%2F0", 0, 60_000),
            key("dev 0", 0, 60_000),
            key("dev.0", 0, 60_000),
            // the device id cannot swallow the separator
            key("a_1", 2, 60_000),
            key("a", 1_2, 60_000),
            key("..", 0, 60_000),
            key("", 0, 60_000),
            key("dev-0", -60_000, 60_000),
            key("dev-0", 0, 120_000),
        ];
        for buckets in [1, 16] {
            let paths: std::collections::HashSet<_> =
                keys.iter().map(|k| k.partition_path(buckets)).collect();
            assert_eq!(paths.len(), keys.len());
        }
        assert!(key("..", 0, 60_000).partition_path(1).ends_with("/%2E%2E_0_60000.json"));
    }

    #[test]
    fn test_device_bucket_is_stable() {
        // FNV-1a("") = offset basis
        assert_eq!(device_bucket("", 1000), (0xcbf2_9ce4_8422_2325_u64 % 1000) as u16);
        assert_eq!(device_bucket("V1", 8), device_bucket("V1", 8));
        assert!(route("V1", 3) < 3);
    }
}
