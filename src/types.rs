//! Core types for the durable topic publish pipeline.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// A coordinate in the append log.
///
/// Positions are:
/// - Totally ordered: later appends compare greater
/// - Persistent: valid for the log's lifetime
/// - Unique: each appended entry has exactly one position
///
/// Conceptually a `(segment, offset)` pair; callers should treat it as
/// opaque apart from ordering.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub segment: u64,
    pub offset: u64,
}

impl Position {
    /// Sentinel that sorts before every appended entry.
    pub const ORIGIN: Position = Position {
        segment: 0,
        offset: 0,
    };

    pub const fn new(segment: u64, offset: u64) -> Self {
        Position { segment, offset }
    }

    /// Check if this is the origin sentinel (nothing appended, or nothing
    /// consumed, depending on the context it came from).
    pub fn is_origin(&self) -> bool {
        *self == Position::ORIGIN
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment, self.offset)
    }
}

impl FromStr for Position {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (segment, offset) = s
            .split_once(':')
            .ok_or_else(|| format!("position must be <segment>:<offset>, got {s:?}"))?;
        let segment = segment
            .parse::<u64>()
            .map_err(|e| format!("bad segment in {s:?}: {e}"))?;
        let offset = offset
            .parse::<u64>()
            .map_err(|e| format!("bad offset in {s:?}: {e}"))?;
        Ok(Position { segment, offset })
    }
}

/// Lifecycle of deduplication for one topic.
///
/// ```text
/// Initialized -> { Disabled | Recovering } -> Enabled <-> Removing -> Disabled
/// any state -> Failed (re-attempted on the next status check)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Constructed, no transition attempted yet.
    Initialized = 0,
    /// Deduplication is off; publishes bypass classification.
    Disabled = 1,
    /// Snapshot load + replay in progress; publishes are deferred.
    Recovering = 2,
    /// Fully recovered; publishes are classified.
    Enabled = 3,
    /// Tear-down in progress; publishes are deferred.
    Removing = 4,
    /// A cursor or replay operation failed; publishes halt until a
    /// status check succeeds.
    Failed = 5,
}

impl Status {
    fn from_u8(v: u8) -> Status {
        match v {
            0 => Status::Initialized,
            1 => Status::Disabled,
            2 => Status::Recovering,
            3 => Status::Enabled,
            4 => Status::Removing,
            _ => Status::Failed,
        }
    }
}

/// Lock-free view of [`Status`] for the read-often publish path.
///
/// All transitions are serialized elsewhere (the engine's transition mutex);
/// this only provides memory-ordered visibility.
#[derive(Debug)]
pub struct AtomicStatus(AtomicU8);

impl AtomicStatus {
    pub fn new(status: Status) -> Self {
        AtomicStatus(AtomicU8::new(status as u8))
    }

    pub fn load(&self) -> Status {
        Status::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, status: Status) {
        self.0.store(status as u8, Ordering::Release);
    }
}

/// Outcome of classifying one message against the dedup state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DedupDecision {
    /// Not seen before; proceed to append.
    Accept,
    /// Confirmed duplicate of a persisted message.
    Duplicate,
    /// Accepted for append earlier but not yet confirmed persisted; the
    /// producer should retry after a short back-off.
    Indeterminate,
}

/// Producer-visible acknowledgement for one publish.
///
/// Fatal rejections are reported separately as
/// [`PublishError`](crate::error::PublishError).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Durably appended at `position`.
    Accepted {
        position: Position,
        sequence_id: u64,
    },
    /// Rejected as a duplicate; the producer may advance past `sequence_id`.
    Duplicate {
        sequence_id: u64,
        last_sequence_id: u64,
    },
    /// Outcome unknown (a prior append of this sequence id is still in
    /// flight). The producer must retry; this is not a loss.
    Indeterminate { sequence_id: u64 },
}
