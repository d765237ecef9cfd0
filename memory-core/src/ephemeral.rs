//! Ephemeral state store for tool results and per-session scratch data.
//!
//! Nothing written here is ever reachable from the durable memory path. Each
//! entry has exactly one authoritative `expires_at`; reads check it lazily and
//! a background sweeper removes expired entries in bounded batches.
//!
//! Entries live in a sharded [`DashMap`], so writers for different sessions
//! never contend on a single lock. A separate expiry index, ordered by
//! `(expires_at, generation)`, drives both the sweeper and capacity eviction.
//! Index entries may go stale when a key is overwritten concurrently; every
//! removal re-checks the entry's generation, so a stale index entry can never
//! remove a newer value.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::EphemeralConfig;
use crate::error::Result;
use crate::logging::SweepEvent;

/// Source of the current time for expiry decisions
pub trait Clock: fmt::Debug + Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Used in tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write().unwrap_or_else(|p| p.into_inner());
        *now = expiry_after(*now, by);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.write().unwrap_or_else(|p| p.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().unwrap_or_else(|p| p.into_inner())
    }
}

/// Namespace used for one session's volatile state.
pub fn session_namespace(session_id: &str, scope: &str) -> String {
    format!("session/{}/{}", session_id, scope)
}

/// Fully qualified key of an entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryKey {
    pub namespace: String,
    pub key: String,
}

impl EntryKey {
    pub fn new(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
        }
    }
}

/// A stored value with its expiry
#[derive(Debug, Clone, PartialEq)]
pub struct EphemeralEntry {
    pub namespace: String,
    pub key: String,
    pub value: Value,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
    pub expires_at: DateTime<Utc>,
}

impl EphemeralEntry {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug)]
struct Slot {
    entry: EphemeralEntry,
    generation: u64,
}

type IndexKey = (DateTime<Utc>, u64);

/// Outcome of a sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries removed because they had expired
    pub removed: usize,
    /// Index entries examined, including stale ones
    pub scanned: usize,
    /// Number of batches the sweep was split into
    pub batches: usize,
}

impl SweepReport {
    fn absorb(&mut self, batch: BatchOutcome) {
        self.removed += batch.removed;
        self.scanned += batch.scanned;
        self.batches += 1;
    }
}

#[derive(Debug, Clone, Copy)]
struct BatchOutcome {
    removed: usize,
    scanned: usize,
    done: bool,
}

/// Counters for observability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EphemeralStats {
    pub evictions: u64,
    pub expired_reads: u64,
    pub swept: u64,
}

/// Shared TTL store, safe for concurrent use across sessions.
pub struct EphemeralStore {
    entries: DashMap<EntryKey, Slot>,
    expiry_index: Mutex<BTreeMap<IndexKey, EntryKey>>,
    next_generation: AtomicU64,
    capacity: usize,
    default_ttl: Duration,
    namespace_ttls: BTreeMap<String, Duration>,
    sweep_batch_size: usize,
    clock: Arc<dyn Clock>,
    evictions: AtomicU64,
    expired_reads: AtomicU64,
    swept: AtomicU64,
}

impl fmt::Debug for EphemeralStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralStore")
            .field("len", &self.entries.len())
            .field("capacity", &self.capacity)
            .field("default_ttl", &self.default_ttl)
            .field("sweep_batch_size", &self.sweep_batch_size)
            .finish()
    }
}

impl EphemeralStore {
    /// Create a store using the system clock
    pub fn new(config: &EphemeralConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a store with an explicit clock
    pub fn with_clock(config: &EphemeralConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            expiry_index: Mutex::new(BTreeMap::new()),
            next_generation: AtomicU64::new(0),
            capacity: config.capacity.max(1),
            default_ttl: config.default_ttl(),
            namespace_ttls: config
                .namespace_ttls
                .iter()
                .map(|(ns, secs)| (ns.clone(), Duration::from_secs(*secs)))
                .collect(),
            sweep_batch_size: config.sweep_batch_size.max(1),
            clock,
            evictions: AtomicU64::new(0),
            expired_reads: AtomicU64::new(0),
            swept: AtomicU64::new(0),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Default TTL for a namespace.
    ///
    /// An exact namespace match wins; otherwise the last `/`-separated segment
    /// is looked up, so `session/abc/tool` picks up the `tool` setting.
    pub fn ttl_for(&self, namespace: &str) -> Duration {
        if let Some(ttl) = self.namespace_ttls.get(namespace) {
            return *ttl;
        }
        namespace
            .rsplit('/')
            .next()
            .and_then(|scope| self.namespace_ttls.get(scope))
            .copied()
            .unwrap_or(self.default_ttl)
    }

    /// Insert or overwrite a value. Always resets `expires_at` to `now + ttl`.
    ///
    /// At capacity, the entry nearest to expiry is evicted to make room.
    pub fn set(&self, namespace: &str, key: &str, value: impl Into<Value>, ttl: Duration) {
        let now = self.clock.now();
        let entry_key = EntryKey::new(namespace, key);

        if !self.entries.contains_key(&entry_key) {
            self.make_room();
        }

        let expires_at = expiry_after(now, ttl);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let slot = Slot {
            entry: EphemeralEntry {
                namespace: namespace.to_string(),
                key: key.to_string(),
                value: value.into(),
                created_at: now,
                ttl,
                expires_at,
            },
            generation,
        };

        let previous = self.entries.insert(entry_key.clone(), slot);
        let mut index = self.lock_index();
        if let Some(previous) = previous {
            index.remove(&(previous.entry.expires_at, previous.generation));
        }
        index.insert((expires_at, generation), entry_key);
    }

    /// Insert using the namespace's default TTL
    pub fn put(&self, namespace: &str, key: &str, value: impl Into<Value>) {
        let ttl = self.ttl_for(namespace);
        self.set(namespace, key, value, ttl);
    }

    /// Serialize and insert a typed value
    pub fn set_typed<T: Serialize>(&self, namespace: &str, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.set(namespace, key, value, ttl);
        Ok(())
    }

    /// Read a value if present and not yet expired.
    ///
    /// An expired entry reads as absent whether or not a sweep has run, and is
    /// removed on the way out.
    pub fn get(&self, namespace: &str, key: &str) -> Option<Value> {
        self.live_entry(namespace, key).map(|entry| entry.value)
    }

    /// Read and deserialize a value
    pub fn get_as<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Result<Option<T>> {
        match self.get(namespace, key) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Snapshot of a live entry including its timestamps
    pub fn entry(&self, namespace: &str, key: &str) -> Option<EphemeralEntry> {
        self.live_entry(namespace, key)
    }

    pub fn contains(&self, namespace: &str, key: &str) -> bool {
        self.live_entry(namespace, key).is_some()
    }

    fn live_entry(&self, namespace: &str, key: &str) -> Option<EphemeralEntry> {
        let now = self.clock.now();
        let entry_key = EntryKey::new(namespace, key);

        let (expires_at, generation) = match self.entries.get(&entry_key) {
            Some(slot) if !slot.entry.is_expired_at(now) => return Some(slot.entry.clone()),
            Some(slot) => (slot.entry.expires_at, slot.generation),
            None => return None,
        };

        self.expired_reads.fetch_add(1, Ordering::Relaxed);
        if self
            .entries
            .remove_if(&entry_key, |_, slot| slot.generation == generation)
            .is_some()
        {
            self.lock_index().remove(&(expires_at, generation));
        }
        None
    }

    /// Remove a value. Returns whether a live entry was removed.
    pub fn remove(&self, namespace: &str, key: &str) -> bool {
        let now = self.clock.now();
        match self.entries.remove(&EntryKey::new(namespace, key)) {
            Some((_, slot)) => {
                self.lock_index().remove(&(slot.entry.expires_at, slot.generation));
                !slot.entry.is_expired_at(now)
            }
            None => false,
        }
    }

    /// Drop every entry in a namespace, e.g. when a session ends.
    ///
    /// Shards are locked one at a time. Index entries for removed keys are
    /// left for the sweeper, which skips them.
    pub fn clear_namespace(&self, namespace: &str) -> usize {
        let mut removed = 0usize;
        self.entries.retain(|key, _| {
            let keep = key.namespace != namespace;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Number of stored entries, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> EphemeralStats {
        EphemeralStats {
            evictions: self.evictions.load(Ordering::Relaxed),
            expired_reads: self.expired_reads.load(Ordering::Relaxed),
            swept: self.swept.load(Ordering::Relaxed),
        }
    }

    /// Remove every entry with `expires_at <= now`.
    ///
    /// Work is split into batches of `sweep_batch_size`; the index lock is
    /// released between batches so concurrent `get`/`set` calls interleave.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        loop {
            let batch = self.sweep_batch(now);
            report.absorb(batch);
            if batch.done {
                break;
            }
        }
        report
    }

    /// Like [`EphemeralStore::sweep`] at the clock's current time, yielding
    /// to the runtime between batches.
    pub async fn sweep_incremental(&self) -> SweepReport {
        let now = self.clock.now();
        let mut report = SweepReport::default();
        loop {
            let batch = self.sweep_batch(now);
            report.absorb(batch);
            if batch.done {
                break;
            }
            tokio::task::yield_now().await;
        }
        report
    }

    fn sweep_batch(&self, now: DateTime<Utc>) -> BatchOutcome {
        let due = {
            let mut index = self.lock_index();
            let mut due = Vec::with_capacity(self.sweep_batch_size);
            while due.len() < self.sweep_batch_size {
                let next_is_due = index
                    .first_key_value()
                    .map(|(&(expires_at, _), _)| expires_at <= now)
                    .unwrap_or(false);
                if !next_is_due {
                    break;
                }
                if let Some(item) = index.pop_first() {
                    due.push(item);
                }
            }
            due
        };

        let scanned = due.len();
        let mut removed = 0usize;
        for ((_, generation), key) in due {
            let gone = self
                .entries
                .remove_if(&key, |_, slot| slot.generation == generation && slot.entry.is_expired_at(now))
                .is_some();
            if gone {
                removed += 1;
            }
        }
        self.swept.fetch_add(removed as u64, Ordering::Relaxed);

        BatchOutcome {
            removed,
            scanned,
            done: scanned < self.sweep_batch_size,
        }
    }

    fn make_room(&self) {
        while self.entries.len() >= self.capacity {
            if !self.evict_nearest_expiry() {
                break;
            }
        }
    }

    fn evict_nearest_expiry(&self) -> bool {
        loop {
            let candidate = self.lock_index().pop_first();
            let ((_, generation), key) = match candidate {
                Some(candidate) => candidate,
                None => return false,
            };
            if self
                .entries
                .remove_if(&key, |_, slot| slot.generation == generation)
                .is_some()
            {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(namespace = %key.namespace, key = %key.key, "evicted ephemeral entry at capacity");
                return true;
            }
        }
    }

    fn lock_index(&self) -> MutexGuard<'_, BTreeMap<IndexKey, EntryKey>> {
        self.expiry_index.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for EphemeralStore {
    fn default() -> Self {
        Self::new(&EphemeralConfig::default())
    }
}

/// Run [`EphemeralStore::sweep_incremental`] every `interval` until
/// `cancellation` fires.
pub fn spawn_sweeper(
    store: Arc<EphemeralStore>,
    interval: Duration,
    cancellation: CancellationToken,
) -> JoinHandle<()> {
    let interval = interval.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => break,
                _ = ticker.tick() => {
                    let report = store.sweep_incremental().await;
                    if report.removed > 0 {
                        let event = SweepEvent::new(report.removed, report.scanned, report.batches, store.len());
                        tracing::debug!(target: crate::EVENT_LOGGER_NAME, "{}", event);
                    }
                }
            }
        }
        tracing::debug!("ephemeral sweeper stopped");
    })
}

fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
