//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Engine configuration.
///
/// Durations are (de)serialized as milliseconds so the file format stays
/// plain JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Interval between analysis status polls.
    #[serde(rename = "poll_interval_ms", with = "duration_ms")]
    pub poll_interval: Duration,

    /// Budget for tracker-initiated analysis polling. Also the time a batch
    /// waits for a unit's analysis before halting.
    #[serde(rename = "analysis_timeout_ms", with = "duration_ms")]
    pub analysis_timeout: Duration,

    /// Budget for the poll started right after a single-unit generation.
    #[serde(rename = "post_generation_poll_timeout_ms", with = "duration_ms")]
    pub post_generation_poll_timeout: Duration,

    /// Interval between batch status polls when following a batch.
    #[serde(rename = "batch_poll_interval_ms", with = "duration_ms")]
    pub batch_poll_interval: Duration,

    /// Interval at which a batch driver refreshes its record while a unit
    /// is in progress.
    #[serde(rename = "batch_heartbeat_interval_ms", with = "duration_ms")]
    pub batch_heartbeat_interval: Duration,

    /// A running batch whose record has not changed for this long has no live
    /// driver and may be taken over.
    #[serde(rename = "batch_stale_after_ms", with = "duration_ms")]
    pub batch_stale_after: Duration,

    /// Finished batches kept attached for `wait` and `halt_error`. Older
    /// ones are released when a new batch attaches.
    pub retained_finished_batches: usize,

    /// Capacity of the tracker and batch event channels.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            analysis_timeout: Duration::from_secs(5 * 60),
            post_generation_poll_timeout: Duration::from_secs(30),
            batch_poll_interval: Duration::from_secs(2),
            batch_heartbeat_interval: Duration::from_secs(30),
            batch_stale_after: Duration::from_secs(2 * 60),
            retained_finished_batches: 32,
            event_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Set the analysis poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the analysis timeout.
    pub fn with_analysis_timeout(mut self, timeout: Duration) -> Self {
        self.analysis_timeout = timeout;
        self
    }

    /// Set the post-generation poll timeout.
    pub fn with_post_generation_poll_timeout(mut self, timeout: Duration) -> Self {
        self.post_generation_poll_timeout = timeout;
        self
    }

    /// Set the batch poll interval.
    pub fn with_batch_poll_interval(mut self, interval: Duration) -> Self {
        self.batch_poll_interval = interval;
        self
    }

    /// Set how many finished batches stay attached.
    pub fn with_retained_finished_batches(mut self, count: usize) -> Self {
        self.retained_finished_batches = count;
        self
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
