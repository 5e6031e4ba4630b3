use serde::{Deserialize, Serialize};

/// Global knobs that tune ingestion behaviour.
///
/// All fields carry defaults so existing deployments can progressively adopt
/// new settings without supplying a full configuration payload.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct IngestConfig {
    /// Queue sizing and dequeue batching.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Retry/backoff policy shared by all workers.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Lease defaults (TTL, renewal thresholds, housekeeping cadence).
    #[serde(default)]
    pub lease: LeaseConfig,
    /// Filesystem watch event stream configuration.
    #[serde(default)]
    pub watch: WatchConfig,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum jobs a single lease call may claim.
    pub max_lease_batch: usize,
    /// Terminal jobs older than this many days are purged by housekeeping.
    pub terminal_retention_days: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_lease_batch: 32,
            terminal_retention_days: 14,
        }
    }
}

/// Lease/heartbeat tuning for worker tasks.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Default TTL for job leases (seconds)
    pub lease_ttl_secs: i64,
    /// Renew when remaining TTL drops below this fraction of the original TTL (e.g. 0.5)
    pub renew_at_fraction: f32,
    /// Housekeeping cadence for scanning expired leases (ms)
    pub housekeeper_interval_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 30,
            renew_at_fraction: 0.5,
            housekeeper_interval_ms: 15_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u16,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Percentage-based jitter to spread out retries.
    pub jitter_ratio: f32,
    /// Minimum jitter in milliseconds so short delays still spread a bit.
    pub jitter_min_ms: u64,
}

impl RetryConfig {
    pub fn backoff_base(&self) -> core::time::Duration {
        core::time::Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> core::time::Duration {
        core::time::Duration::from_millis(self.backoff_max_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 2_000,
            backoff_max_ms: 5 * 60 * 1_000,
            jitter_ratio: 0.25,
            jitter_min_ms: 250,
        }
    }
}

/// Tuning controls for the file-change event stream.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Events fetched per poll when streaming to a consumer group.
    pub fetch_limit: i64,
    /// Buffered events per subscriber channel.
    pub channel_capacity: usize,
    /// Polling cadence in milliseconds when the log is drained.
    pub poll_interval_ms: u64,
    /// Processed events older than this many days are deleted.
    pub retention_days: i64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            fetch_limit: 256,
            channel_capacity: 512,
            poll_interval_ms: 500,
            retention_days: 30,
        }
    }
}
