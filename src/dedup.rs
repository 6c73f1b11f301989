//! The deduplication engine: tracks the highest sequence id accepted and
//! persisted per producer, recovers that state from the append log after a
//! restart, and periodically snapshots it into the recovery cursor.
//!
//! One engine exists per topic. Classification is synchronous and never
//! performs I/O; cursor operations, replay and snapshots are async and run
//! under a per-topic transition mutex or a single-flight guard.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::DedupOptions;
use crate::error::LogError;
use crate::log::AppendLog;
use crate::metadata::{MessageMetadata, PublishContext};
use crate::retry::RetryConfig;
use crate::types::{AtomicStatus, DedupDecision, Position, Status};

/// Name of the recovery cursor the engine owns on the append log.
pub const RECOVERY_CURSOR: &str = "dedup-recovery";

/// Synthetic key suffixes for producers deduplicated by replicated ledger
/// position: `<name>_LID` tracks the ledger id, `<name>_EID` the entry id.
const LID_SUFFIX: &str = "_LID";
const EID_SUFFIX: &str = "_EID";

/// Re-check period of the snapshot timer while the time-based trigger is
/// configured off.
const TIMER_IDLE_RECHECK: Duration = Duration::from_secs(30);

fn pair_keys(producer: &str) -> (String, String) {
    (
        format!("{producer}{LID_SUFFIX}"),
        format!("{producer}{EID_SUFFIX}"),
    )
}

/// Per-topic deduplication engine.
///
/// Thread-safe: the publish pipeline is the only caller that must be
/// serialized (per producer), and it serializes itself; status checks,
/// purges and snapshot triggers may run concurrently from shared pools.
pub struct Deduplicator<L: AppendLog> {
    topic: String,
    log: Arc<L>,
    options: Mutex<DedupOptions>,
    status: AtomicStatus,
    /// Highest sequence id accepted for append, per producer. The lock
    /// covers read-decide-write as one step and is never held across I/O.
    pushed: Mutex<HashMap<String, u64>>,
    /// Highest sequence id confirmed appended, per producer. Writers merge
    /// with max; readers tolerate a slightly stale value.
    persisted: DashMap<String, u64>,
    /// Disconnected producers and when they were last seen.
    inactive: Mutex<HashMap<String, Instant>>,
    snapshot_counter: AtomicU64,
    /// Single-flight guard: at most one mark-delete in flight per cursor.
    snapshot_taking: AtomicBool,
    last_snapshot_at: Mutex<Instant>,
    /// Engine's view of the cursor watermark; advanced on snapshot success.
    mark_delete: Mutex<Position>,
    /// Serializes status transitions. Contenders defer instead of waiting.
    transition: tokio::sync::Mutex<()>,
    retry: RetryConfig,
    weak: Weak<Self>,
}

impl<L: AppendLog> Deduplicator<L> {
    /// Create the engine and spawn its snapshot timer. Must be called from
    /// within a tokio runtime. No transition is attempted until
    /// [`check_status`](Self::check_status).
    pub fn new(topic: impl Into<String>, log: Arc<L>, options: DedupOptions) -> Arc<Self> {
        let engine = Arc::new_cyclic(|weak| Deduplicator {
            topic: topic.into(),
            log,
            options: Mutex::new(options),
            status: AtomicStatus::new(Status::Initialized),
            pushed: Mutex::new(HashMap::new()),
            persisted: DashMap::new(),
            inactive: Mutex::new(HashMap::new()),
            snapshot_counter: AtomicU64::new(0),
            snapshot_taking: AtomicBool::new(false),
            last_snapshot_at: Mutex::new(Instant::now()),
            mark_delete: Mutex::new(Position::ORIGIN),
            transition: tokio::sync::Mutex::new(()),
            retry: RetryConfig::default(),
            weak: weak.clone(),
        });
        engine.spawn_snapshot_timer();
        engine
    }

    pub fn status(&self) -> Status {
        self.status.load()
    }

    pub fn is_enabled(&self) -> bool {
        self.status.load() == Status::Enabled
    }

    pub fn options(&self) -> DedupOptions {
        self.options.lock().clone()
    }

    /// Replace the configuration. Takes effect on the next status check /
    /// snapshot trigger.
    pub fn set_options(&self, options: DedupOptions) {
        *self.options.lock() = options;
    }

    /// Whether a producer name carries the configured replicator prefix.
    pub fn is_remote_producer(&self, producer: &str) -> bool {
        let options = self.options.lock();
        !options.replicator_prefix.is_empty() && producer.starts_with(&options.replicator_prefix)
    }

    pub fn pushed_sequence(&self, producer: &str) -> Option<u64> {
        self.pushed.lock().get(producer).copied()
    }

    pub fn persisted_sequence(&self, producer: &str) -> Option<u64> {
        self.persisted.get(producer).map(|v| *v)
    }

    pub(crate) fn is_marked_inactive(&self, producer: &str) -> bool {
        self.inactive.lock().contains_key(producer)
    }

    // ---- classification ----------------------------------------------

    /// Classify one publish against the accepted/persisted sequence state.
    ///
    /// Accepting advances `pushed` before the caller initiates the append;
    /// an append failure afterwards intentionally leaves `pushed` ahead of
    /// `persisted` (retries of that sequence id read as indeterminate until
    /// the topic reloads or a later attempt lands).
    pub fn classify(&self, ctx: &PublishContext) -> DedupDecision {
        if self.status.load() != Status::Enabled || ctx.repl_marker {
            return DedupDecision::Accept;
        }
        // All chunks of a group share one sequence id; only the last chunk
        // consults or updates the maps.
        if ctx.chunked && !ctx.last_chunk {
            return DedupDecision::Accept;
        }
        if ctx.remote && ctx.supports_repl_dedup_v2 {
            if let Some((lid, eid)) = ctx.repl_source_position {
                return self.classify_source_position(&ctx.producer, lid, eid);
            }
        }
        self.classify_sequence(
            ctx.dedup_producer(),
            ctx.dedup_sequence_id(),
            ctx.dedup_highest_sequence_id(),
        )
    }

    fn classify_sequence(&self, producer: &str, sequence_id: u64, highest: u64) -> DedupDecision {
        let mut pushed = self.pushed.lock();
        if let Some(&last) = pushed.get(producer) {
            if sequence_id <= last {
                // Accepted before; persisted decides between a confirmed
                // duplicate and an in-flight unknown.
                let persisted = self.persisted.get(producer).map(|v| *v);
                return match persisted {
                    Some(p) if sequence_id <= p => DedupDecision::Duplicate,
                    _ => DedupDecision::Indeterminate,
                };
            }
        }
        pushed.insert(producer.to_string(), highest);
        DedupDecision::Accept
    }

    fn classify_source_position(&self, producer: &str, lid: u64, eid: u64) -> DedupDecision {
        let (key_lid, key_eid) = pair_keys(producer);
        let mut pushed = self.pushed.lock();
        if let (Some(&last_lid), Some(&last_eid)) = (pushed.get(&key_lid), pushed.get(&key_eid)) {
            if (lid, eid) <= (last_lid, last_eid) {
                let persisted_lid = self.persisted.get(&key_lid).map(|v| *v);
                let persisted_eid = self.persisted.get(&key_eid).map(|v| *v);
                return match (persisted_lid, persisted_eid) {
                    (Some(pl), Some(pe)) if (lid, eid) <= (pl, pe) => DedupDecision::Duplicate,
                    _ => DedupDecision::Indeterminate,
                };
            }
        }
        pushed.insert(key_lid, lid);
        pushed.insert(key_eid, eid);
        DedupDecision::Accept
    }

    // ---- record-persisted --------------------------------------------

    /// Record a successful append of a non-marker message, and fire the
    /// count-based snapshot trigger when due.
    pub fn record_persisted(&self, ctx: &PublishContext, position: Position) {
        if self.status.load() != Status::Enabled || ctx.repl_marker {
            return;
        }

        if ctx.remote && ctx.supports_repl_dedup_v2 && ctx.repl_source_position.is_some() {
            let (lid, eid) = ctx.repl_source_position.unwrap_or_default();
            let (key_lid, key_eid) = pair_keys(&ctx.producer);
            // The two-key update must be atomic with respect to
            // classification, which reads the pair under the same lock.
            let _guard = self.pushed.lock();
            let current_lid = self.persisted.get(&key_lid).map(|v| *v);
            let current_eid = self.persisted.get(&key_eid).map(|v| *v);
            let advance = match (current_lid, current_eid) {
                (Some(l), Some(e)) => (lid, eid) > (l, e),
                _ => true,
            };
            if advance {
                self.persisted.insert(key_lid, lid);
                self.persisted.insert(key_eid, eid);
            }
        } else if !ctx.chunked || ctx.last_chunk {
            let producer = ctx.dedup_producer().to_string();
            let highest = ctx.dedup_highest_sequence_id();
            self.persisted
                .entry(producer)
                .and_modify(|v| *v = (*v).max(highest))
                .or_insert(highest);
        }

        let interval = self.options.lock().snapshot_entries_interval;
        let count = self.snapshot_counter.fetch_add(1, Ordering::AcqRel) + 1;
        if interval > 0 && count >= interval {
            self.snapshot_counter.store(0, Ordering::Release);
            if let Some(engine) = self.weak.upgrade() {
                tokio::spawn(async move { engine.take_snapshot(position).await });
            }
        }
    }

    // ---- status state machine ----------------------------------------

    /// Reconcile the engine status with the configured intent, running
    /// recovery or tear-down as needed. Concurrent callers that find a
    /// transition in flight defer via a jittered retry instead of waiting.
    pub async fn check_status(&self) {
        let should_enable = self.options.lock().enabled;
        let _guard = match self.transition.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!(topic = %self.topic, "dedup transition in flight, deferring status check");
                self.schedule_recheck();
                return;
            }
        };

        match (self.status.load(), should_enable) {
            (Status::Recovering | Status::Removing, _) => {
                self.schedule_recheck();
            }
            (Status::Enabled, true) | (Status::Disabled, false) => {}
            (_, true) => {
                if let Err(err) = self.enable().await {
                    error!(topic = %self.topic, ?err, "dedup recovery failed, publishes halted");
                    self.status.store(Status::Failed);
                }
            }
            (_, false) => {
                if let Err(err) = self.disable().await {
                    error!(topic = %self.topic, ?err, "dedup tear-down failed");
                    self.status.store(Status::Failed);
                }
            }
        }
    }

    fn schedule_recheck(&self) {
        let Some(engine) = self.weak.upgrade() else {
            return;
        };
        let delay = self.retry.delay_for(0);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            engine.check_status().await;
        });
    }

    /// Open the recovery cursor, seed the maps from its snapshot, replay
    /// the suffix of the log, and enter `Enabled`.
    async fn enable(&self) -> Result<(), LogError> {
        self.status.store(Status::Recovering);
        info!(topic = %self.topic, "recovering dedup state");

        // A crash mid-recovery may leave partial state; start clean so the
        // replay is idempotent.
        self.pushed.lock().clear();
        self.persisted.clear();
        self.inactive.lock().clear();

        let cursor = self.log.open_cursor(RECOVERY_CURSOR).await?;
        *self.mark_delete.lock() = cursor.mark_delete;

        {
            let mut pushed = self.pushed.lock();
            let mut inactive = self.inactive.lock();
            let now = Instant::now();
            for (name, &sequence) in &cursor.properties {
                let sequence = sequence.max(0) as u64;
                pushed.insert(name.clone(), sequence);
                self.persisted.insert(name.clone(), sequence);
                // Assume disconnected until a session says otherwise.
                inactive.insert(name.clone(), now);
            }
        }

        let mut replayed: u64 = 0;
        let mut handler = |position: Position, entry: &bytes::Bytes| {
            let (meta, _) = match MessageMetadata::decode(entry) {
                Ok(decoded) => decoded,
                Err(err) => {
                    warn!(topic = %self.topic, %position, ?err, "skipping undecodable entry during replay");
                    return;
                }
            };
            if meta.is_replication_marker() {
                return;
            }
            let sequence = meta.effective_highest_sequence_id();
            {
                let mut pushed = self.pushed.lock();
                let slot = pushed.entry(meta.producer_name.clone()).or_insert(sequence);
                *slot = (*slot).max(sequence);
            }
            self.persisted
                .entry(meta.producer_name)
                .and_modify(|v| *v = (*v).max(sequence))
                .or_insert(sequence);
            replayed += 1;
        };
        let last_replayed = self.log.replay_range(RECOVERY_CURSOR, &mut handler).await?;

        let interval = self.options.lock().snapshot_entries_interval;
        if interval > 0 && replayed >= interval {
            if let Some(position) = last_replayed {
                self.take_snapshot(position).await;
            }
            self.snapshot_counter.store(0, Ordering::Release);
        } else if interval > 0 {
            self.snapshot_counter.store(replayed % interval, Ordering::Release);
        }

        info!(topic = %self.topic, replayed, "dedup recovery complete");
        self.status.store(Status::Enabled);
        Ok(())
    }

    /// Delete the recovery cursor and drop all tracked state.
    async fn disable(&self) -> Result<(), LogError> {
        self.status.store(Status::Removing);
        match self.log.delete_cursor(RECOVERY_CURSOR).await {
            Ok(()) => {}
            Err(LogError::CursorNotFound(_)) => {}
            Err(err) => return Err(err),
        }
        self.pushed.lock().clear();
        self.persisted.clear();
        self.inactive.lock().clear();
        *self.mark_delete.lock() = Position::ORIGIN;
        self.status.store(Status::Disabled);
        info!(topic = %self.topic, "dedup disabled");
        Ok(())
    }

    // ---- snapshots ---------------------------------------------------

    /// Write a bounded snapshot of `persisted` into the recovery cursor's
    /// properties and advance its mark-delete watermark to `position`.
    ///
    /// Single-flight: a call that finds another snapshot in progress is
    /// dropped, not queued; the next trigger retries. Failures are logged
    /// and never propagated to producers.
    pub async fn take_snapshot(&self, position: Position) {
        if self
            .snapshot_taking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(topic = %self.topic, %position, "snapshot already in progress, dropping trigger");
            return;
        }

        let snapshot = self.build_snapshot();
        match self
            .log
            .mark_delete(RECOVERY_CURSOR, position, snapshot)
            .await
        {
            Ok(()) => {
                *self.last_snapshot_at.lock() = Instant::now();
                let mut mark_delete = self.mark_delete.lock();
                *mark_delete = (*mark_delete).max(position);
                debug!(topic = %self.topic, %position, "dedup snapshot taken");
            }
            Err(err) => {
                warn!(topic = %self.topic, %position, ?err, "dedup snapshot failed, will retry on next trigger");
            }
        }
        self.snapshot_taking.store(false, Ordering::Release);
    }

    fn build_snapshot(&self) -> BTreeMap<String, i64> {
        let cap = self.options.lock().max_tracked_producers;
        let mut entries: Vec<(String, u64)> = self
            .persisted
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        entries.sort();
        if entries.len() > cap {
            debug!(
                topic = %self.topic,
                omitted = entries.len() - cap,
                "snapshot capped, omitted producers will be re-learned from replay"
            );
        }
        entries
            .into_iter()
            .take(cap)
            .map(|(name, sequence)| (name, sequence as i64))
            .collect()
    }

    fn spawn_snapshot_timer(&self) {
        let weak = self.weak.clone();
        tokio::spawn(async move {
            loop {
                let period = match weak.upgrade() {
                    Some(engine) => engine.options.lock().snapshot_interval,
                    None => break,
                };
                tokio::time::sleep(period.unwrap_or(TIMER_IDLE_RECHECK)).await;
                match weak.upgrade() {
                    Some(engine) if period.is_some() => engine.snapshot_if_stale().await,
                    Some(_) => {}
                    None => break,
                }
            }
        });
    }

    /// Time-based trigger: snapshot at the log tail if the configured
    /// period elapsed and the log advanced past the watermark.
    pub(crate) async fn snapshot_if_stale(&self) {
        if self.status.load() != Status::Enabled {
            return;
        }
        let Some(period) = self.options.lock().snapshot_interval else {
            return;
        };
        if self.last_snapshot_at.lock().elapsed() < period {
            return;
        }
        let tail = self.log.last_confirmed();
        if tail <= *self.mark_delete.lock() {
            return;
        }
        self.take_snapshot(tail).await;
    }

    // ---- producer lifecycle ------------------------------------------

    /// A producer session connected. Purged sequence entries are not
    /// resurrected; a purged producer starts fresh.
    pub fn producer_connected(&self, producer: &str) {
        self.inactive.lock().remove(producer);
    }

    /// A producer session disconnected. Tracked for purge only while
    /// deduplication is enabled; otherwise the map is lazily emptied so a
    /// disable transition does not leave it growing.
    pub fn producer_disconnected(&self, producer: &str) {
        let mut inactive = self.inactive.lock();
        if self.status.load() == Status::Enabled {
            inactive.insert(producer.to_string(), Instant::now());
        } else if !inactive.is_empty() {
            inactive.clear();
        }
    }

    /// Drop every producer that has been disconnected longer than the
    /// configured timeout, then force a snapshot so the removals persist.
    /// Driven by the caller's maintenance scheduler.
    pub async fn purge_inactive_producers(&self) {
        let timeout = self.options.lock().producer_inactivity_timeout;
        let now = Instant::now();
        let expired: Vec<String> = {
            let mut inactive = self.inactive.lock();
            let expired: Vec<String> = inactive
                .iter()
                .filter(|(_, &last_active)| now.duration_since(last_active) >= timeout)
                .map(|(name, _)| name.clone())
                .collect();
            for name in &expired {
                inactive.remove(name);
            }
            expired
        };
        if expired.is_empty() {
            return;
        }

        {
            let mut pushed = self.pushed.lock();
            for name in &expired {
                pushed.remove(name);
                self.persisted.remove(name);
            }
        }
        info!(topic = %self.topic, purged = expired.len(), "purged inactive producers");

        if self.status.load() == Status::Enabled {
            let position = *self.mark_delete.lock();
            self.take_snapshot(position).await;
        }
    }
}
