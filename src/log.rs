//! The append-log collaborator contract, plus an in-process implementation.
//!
//! The storage engine behind a topic is external to this crate: an ordered,
//! append-only durable byte stream with named cursors. [`AppendLog`] is the
//! seam the publish pipeline and dedup engine talk through; [`MemoryLog`]
//! backs the test suite and embedded usage.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::LogError;
use crate::types::Position;

/// Completion handle for an initiated append.
///
/// [`AppendLog::append`] initiates the write synchronously (so initiation
/// order is call order) and hands back one of these to await durability.
#[derive(Debug)]
pub struct PendingAppend {
    rx: oneshot::Receiver<Result<Position, LogError>>,
}

impl PendingAppend {
    /// Create an unresolved append and the sender that completes it.
    pub fn pending() -> (oneshot::Sender<Result<Position, LogError>>, PendingAppend) {
        let (tx, rx) = oneshot::channel();
        (tx, PendingAppend { rx })
    }

    /// An append that already completed.
    pub fn ready(result: Result<Position, LogError>) -> PendingAppend {
        let (tx, pending) = PendingAppend::pending();
        let _ = tx.send(result);
        pending
    }

    /// Wait for the append to become durable.
    pub async fn wait(self) -> Result<Position, LogError> {
        self.rx.await.map_err(|_| LogError::Closed)?
    }
}

/// Persisted cursor state as read back at open time.
///
/// A cursor is a `(mark-delete position, properties)` pair: the watermark
/// below which entries may be garbage-collected, and a small int64 property
/// map replaced atomically with every mark-delete.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Cursor {
    pub name: String,
    pub mark_delete: Position,
    pub properties: BTreeMap<String, i64>,
}

/// Contract required of the storage engine backing a topic.
#[async_trait]
pub trait AppendLog: Send + Sync + 'static {
    /// Initiate a durable append. Positions are handed out in initiation
    /// order and are strictly increasing.
    fn append(&self, payload: Bytes) -> PendingAppend;

    /// Open the named cursor, creating it at [`Position::ORIGIN`] if absent.
    /// The cursor survives process restarts.
    async fn open_cursor(&self, name: &str) -> Result<Cursor, LogError>;

    /// Delete the named cursor. Fails with [`LogError::CursorNotFound`] if
    /// it does not exist; callers that need idempotent deletion treat that
    /// as success.
    async fn delete_cursor(&self, name: &str) -> Result<(), LogError>;

    /// Atomically advance the cursor's mark-delete watermark and replace its
    /// properties. The watermark never moves backwards.
    async fn mark_delete(
        &self,
        name: &str,
        position: Position,
        properties: BTreeMap<String, i64>,
    ) -> Result<(), LogError>;

    /// Invoke `handler` for every entry after the cursor's mark-delete
    /// watermark, in log order. Returns the last position visited, or `None`
    /// if the range was empty.
    async fn replay_range(
        &self,
        name: &str,
        handler: &mut (dyn for<'a> FnMut(Position, &'a Bytes) + Send),
    ) -> Result<Option<Position>, LogError>;

    /// Position of the most recent durable entry, or [`Position::ORIGIN`]
    /// if nothing has been appended.
    fn last_confirmed(&self) -> Position;
}

const DEFAULT_SEGMENT_CAPACITY: u64 = 1024;

/// In-process [`AppendLog`].
///
/// Cursor and entry state live behind an `Arc`, so an engine can be dropped
/// and rebuilt over the same log to exercise crash-recovery paths. Appends
/// can be held (`hold_appends`/`release_appends`) to keep completions in
/// flight, or failed (`fail_appends`) to inject write errors, both of which
/// the tests lean on for deterministic timing.
pub struct MemoryLog {
    segment_capacity: u64,
    state: Mutex<MemState>,
}

#[derive(Default)]
struct MemState {
    entries: Vec<(Position, Bytes)>,
    appended: u64,
    cursors: HashMap<String, CursorState>,
    hold: bool,
    fail: bool,
    held: Vec<(Position, oneshot::Sender<Result<Position, LogError>>)>,
}

#[derive(Clone, Default)]
struct CursorState {
    mark_delete: Position,
    properties: BTreeMap<String, i64>,
}

impl MemoryLog {
    pub fn new() -> Self {
        MemoryLog::with_segment_capacity(DEFAULT_SEGMENT_CAPACITY)
    }

    /// Roll to a new segment after `capacity` entries. Small capacities make
    /// multi-segment position ordering easy to exercise.
    pub fn with_segment_capacity(capacity: u64) -> Self {
        MemoryLog {
            segment_capacity: capacity.max(1),
            state: Mutex::new(MemState::default()),
        }
    }

    /// Park append completions until [`release_appends`](Self::release_appends).
    /// Entries are still written in order; only the acknowledgement is held.
    pub fn hold_appends(&self) {
        self.state.lock().hold = true;
    }

    /// Complete all held appends and stop holding new ones.
    pub fn release_appends(&self) {
        let held = {
            let mut state = self.state.lock();
            state.hold = false;
            std::mem::take(&mut state.held)
        };
        for (position, tx) in held {
            let _ = tx.send(Ok(position));
        }
    }

    /// Fail every append until turned off again. No entry is written.
    pub fn fail_appends(&self, fail: bool) {
        self.state.lock().fail = fail;
    }

    /// Number of entries written.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_position(&self, appended: u64) -> Position {
        Position::new(
            1 + appended / self.segment_capacity,
            1 + appended % self.segment_capacity,
        )
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        MemoryLog::new()
    }
}

#[async_trait]
impl AppendLog for MemoryLog {
    fn append(&self, payload: Bytes) -> PendingAppend {
        let (tx, pending) = PendingAppend::pending();
        let mut state = self.state.lock();

        if state.fail {
            let _ = tx.send(Err(LogError::Append("injected append failure".into())));
            return pending;
        }

        let position = self.next_position(state.appended);
        state.appended += 1;
        state.entries.push((position, payload));

        if state.hold {
            state.held.push((position, tx));
        } else {
            let _ = tx.send(Ok(position));
        }
        pending
    }

    async fn open_cursor(&self, name: &str) -> Result<Cursor, LogError> {
        let mut state = self.state.lock();
        let cursor = state.cursors.entry(name.to_string()).or_default().clone();
        Ok(Cursor {
            name: name.to_string(),
            mark_delete: cursor.mark_delete,
            properties: cursor.properties,
        })
    }

    async fn delete_cursor(&self, name: &str) -> Result<(), LogError> {
        let mut state = self.state.lock();
        state
            .cursors
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| LogError::CursorNotFound(name.to_string()))
    }

    async fn mark_delete(
        &self,
        name: &str,
        position: Position,
        properties: BTreeMap<String, i64>,
    ) -> Result<(), LogError> {
        let mut state = self.state.lock();
        let cursor = state
            .cursors
            .get_mut(name)
            .ok_or_else(|| LogError::CursorNotFound(name.to_string()))?;
        // A stale position can lose the single-flight race; never rewind.
        cursor.mark_delete = cursor.mark_delete.max(position);
        cursor.properties = properties;
        Ok(())
    }

    async fn replay_range(
        &self,
        name: &str,
        handler: &mut (dyn for<'a> FnMut(Position, &'a Bytes) + Send),
    ) -> Result<Option<Position>, LogError> {
        let (watermark, entries) = {
            let state = self.state.lock();
            let cursor = state
                .cursors
                .get(name)
                .ok_or_else(|| LogError::CursorNotFound(name.to_string()))?;
            (cursor.mark_delete, state.entries.clone())
        };

        let mut last = None;
        for (position, payload) in entries {
            if position > watermark {
                handler(position, &payload);
                last = Some(position);
            }
        }
        Ok(last)
    }

    fn last_confirmed(&self) -> Position {
        let state = self.state.lock();
        state
            .entries
            .last()
            .map(|(position, _)| *position)
            .unwrap_or(Position::ORIGIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_positions_roll_segments_in_order() {
        let log = MemoryLog::with_segment_capacity(2);
        let mut positions = Vec::new();
        for i in 0..5u8 {
            positions.push(log.append(Bytes::from(vec![i])).wait().await.unwrap());
        }
        assert_eq!(positions[0], Position::new(1, 1));
        assert_eq!(positions[1], Position::new(1, 2));
        assert_eq!(positions[2], Position::new(2, 1));
        for pair in positions.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert_eq!(log.last_confirmed(), positions[4]);
    }

    #[tokio::test]
    async fn test_cursor_state_survives_reopen() {
        let log = MemoryLog::new();
        let pos = log.append(Bytes::from_static(b"x")).wait().await.unwrap();

        log.open_cursor("recovery").await.unwrap();
        let mut props = BTreeMap::new();
        props.insert("alpha".to_string(), 7);
        log.mark_delete("recovery", pos, props.clone()).await.unwrap();

        let cursor = log.open_cursor("recovery").await.unwrap();
        assert_eq!(cursor.mark_delete, pos);
        assert_eq!(cursor.properties, props);
    }

    #[tokio::test]
    async fn test_mark_delete_never_rewinds() {
        let log = MemoryLog::new();
        let first = log.append(Bytes::from_static(b"a")).wait().await.unwrap();
        let second = log.append(Bytes::from_static(b"b")).wait().await.unwrap();

        log.open_cursor("recovery").await.unwrap();
        log.mark_delete("recovery", second, BTreeMap::new())
            .await
            .unwrap();
        log.mark_delete("recovery", first, BTreeMap::new())
            .await
            .unwrap();

        let cursor = log.open_cursor("recovery").await.unwrap();
        assert_eq!(cursor.mark_delete, second);
    }

    #[tokio::test]
    async fn test_replay_starts_after_watermark() {
        let log = MemoryLog::new();
        let mut positions = Vec::new();
        for i in 0..4u8 {
            positions.push(log.append(Bytes::from(vec![i])).wait().await.unwrap());
        }

        log.open_cursor("recovery").await.unwrap();
        log.mark_delete("recovery", positions[1], BTreeMap::new())
            .await
            .unwrap();

        let mut seen = Vec::new();
        let last = log
            .replay_range("recovery", &mut |position, payload| {
                seen.push((position, payload[0]));
            })
            .await
            .unwrap();

        assert_eq!(seen, vec![(positions[2], 2), (positions[3], 3)]);
        assert_eq!(last, Some(positions[3]));
    }

    #[tokio::test]
    async fn test_delete_cursor_reports_missing() {
        let log = MemoryLog::new();
        assert!(matches!(
            log.delete_cursor("nope").await,
            Err(LogError::CursorNotFound(_))
        ));
        log.open_cursor("real").await.unwrap();
        assert_ok!(log.delete_cursor("real").await);
    }

    #[tokio::test]
    async fn test_held_appends_complete_on_release() {
        let log = std::sync::Arc::new(MemoryLog::new());
        log.hold_appends();

        let pending = log.append(Bytes::from_static(b"x"));
        let waiter = tokio::spawn(async move { pending.wait().await });

        // Entry exists before the ack is released.
        assert_eq!(log.len(), 1);
        log.release_appends();
        let position = waiter.await.unwrap().unwrap();
        assert_eq!(position, Position::new(1, 1));
    }

    #[tokio::test]
    async fn test_injected_append_failure() {
        let log = MemoryLog::new();
        log.fail_appends(true);
        let err = log.append(Bytes::from_static(b"x")).wait().await.unwrap_err();
        assert!(matches!(err, LogError::Append(_)));
        assert!(log.is_empty());

        log.fail_appends(false);
        assert_ok!(log.append(Bytes::from_static(b"y")).wait().await);
    }
}
