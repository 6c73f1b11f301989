//! Deduplication configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-topic deduplication knobs.
///
/// **Important**: `enabled` only expresses intent; the engine moves between
/// states on the next status check, and an in-flight recovery or tear-down
/// finishes before a new transition starts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DedupOptions {
    /// Gate for the whole engine. Disabled topics publish without
    /// classification.
    pub enabled: bool,
    /// Take a snapshot after this many persisted entries. `0` disables the
    /// count-based trigger.
    pub snapshot_entries_interval: u64,
    /// Cap on the number of producers a snapshot records. Producers beyond
    /// the cap stay tracked in memory but are re-learned from replay after
    /// a restart, if their entries are still above the watermark.
    pub max_tracked_producers: usize,
    /// Disconnected producers idle longer than this are purged from the
    /// sequence maps.
    pub producer_inactivity_timeout: Duration,
    /// Period of the time-based snapshot trigger. `None` disables it.
    pub snapshot_interval: Option<Duration>,
    /// Producer-name prefix identifying messages copied from another
    /// cluster.
    pub replicator_prefix: String,
}

impl Default for DedupOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            snapshot_entries_interval: 1000,
            max_tracked_producers: 10_000,
            producer_inactivity_timeout: Duration::from_secs(6 * 60 * 60),
            snapshot_interval: Some(Duration::from_secs(120)),
            replicator_prefix: "replicator-".to_string(),
        }
    }
}

impl DedupOptions {
    /// Create options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_snapshot_entries_interval(mut self, entries: u64) -> Self {
        self.snapshot_entries_interval = entries;
        self
    }

    pub fn with_max_tracked_producers(mut self, max: usize) -> Self {
        self.max_tracked_producers = max;
        self
    }

    pub fn with_producer_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.producer_inactivity_timeout = timeout;
        self
    }

    pub fn with_snapshot_interval(mut self, interval: Option<Duration>) -> Self {
        self.snapshot_interval = interval;
        self
    }

    pub fn with_replicator_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.replicator_prefix = prefix.into();
        self
    }
}
