//! In-Memory Key-Value Store
//!
//! A `DashMap`-backed stand-in for the key-value cache service. TTLs are
//! honored against the injected [`Clock`], so tests can expire entries by
//! moving time forward, and reads/writes can be made to fail on demand.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock, elapsed_between};
use crate::traits::{BatchOp, CacheBatch, CounterState, KeyValueStore};

#[derive(Debug, Clone)]
enum StoredValue {
    Hash(HashMap<String, String>),
    List(Vec<String>),
    Set(HashSet<String>),
    Counter(u64),
}

/// Stored value with expiration tracking
#[derive(Debug, Clone)]
struct StoredEntry {
    value: StoredValue,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredEntry {
    fn new(value: StoredValue) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

/// Operation counters for a [`MemoryStore`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStoreStats {
    pub hits: u64,
    pub misses: u64,
    pub batches: u64,
    pub rejected_ops: u64,
}

/// In-process key-value store
///
/// **Use Case**: tests, local development, single-process deployments
///
/// **Atomicity**:
/// - batches take an exclusive gate, so readers never observe half a batch
/// - `check_and_increment` holds the key's map entry for the whole
///   read-check-increment-expire sequence
///
/// **Failure injection**: [`fail_reads`](Self::fail_reads) and
/// [`fail_writes`](Self::fail_writes) make the matching operations return
/// errors, simulating an unreachable cache service.
///
/// **Example**:
/// ```rust
/// use stake_cache::backends::MemoryStore;
/// use stake_cache::{CacheBatch, KeyValueStore};
/// use std::time::Duration;
///
/// # async fn example() -> anyhow::Result<()> {
/// let store = MemoryStore::new();
/// let batch = CacheBatch::new()
///     .hash_set("stake:1", vec![("amount".into(), "10".into())])
///     .expire("stake:1", Duration::from_secs(60));
/// store.execute(&batch).await?;
/// assert_eq!(store.hash_get_all("stake:1").await?.len(), 1);
/// # Ok(())
/// # }
/// ```
pub struct MemoryStore {
    entries: Arc<DashMap<String, StoredEntry>>,
    /// Batches write-lock, single reads read-lock
    gate: RwLock<()>,
    clock: Arc<dyn Clock>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    batches: AtomicU64,
    rejected_ops: AtomicU64,
}

impl MemoryStore {
    /// Create a store on the system clock
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store that expires entries against `clock`
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        info!("Initializing in-memory key-value store");

        Self {
            entries: Arc::new(DashMap::new()),
            gate: RwLock::new(()),
            clock,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            rejected_ops: AtomicU64::new(0),
        }
    }

    /// Make every read fail (`true`) or succeed again (`false`)
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every write, including counter updates, fail
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail both reads and writes
    pub fn set_unavailable(&self, unavailable: bool) {
        self.fail_reads(unavailable);
        self.fail_writes(unavailable);
    }

    /// Whether a live (non-expired) key exists
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Remaining time-to-live of a live key, `None` if absent or persistent
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        let entry = self.entries.get(key)?;
        if entry.is_expired(now) {
            return None;
        }
        entry.expires_at.map(|at| elapsed_between(now, at))
    }

    /// Current value of a live counter
    #[must_use]
    pub fn counter_value(&self, key: &str) -> Option<u64> {
        let now = self.clock.now();
        let entry = self.entries.get(key)?;
        match entry.value {
            StoredValue::Counter(count) if !entry.is_expired(now) => Some(count),
            _ => None,
        }
    }

    /// Members of a live set
    #[must_use]
    pub fn set_members(&self, key: &str) -> HashSet<String> {
        let now = self.clock.now();
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => match &entry.value {
                StoredValue::Set(members) => members.clone(),
                _ => HashSet::new(),
            },
            _ => HashSet::new(),
        }
    }

    /// Remove expired entries
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let _gate = self.gate.write();
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            if entry.is_expired(now) {
                removed += 1;
                false
            } else {
                true
            }
        });
        if removed > 0 {
            debug!(count = removed, "[Memory] Cleaned up expired entries");
        }
        removed
    }

    #[must_use]
    pub fn stats(&self) -> MemoryStoreStats {
        MemoryStoreStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            rejected_ops: self.rejected_ops.load(Ordering::Relaxed),
        }
    }

    fn check_reads(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            self.rejected_ops.fetch_add(1, Ordering::Relaxed);
            bail!("memory store: injected read failure");
        }
        Ok(())
    }

    fn check_writes(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            self.rejected_ops.fetch_add(1, Ordering::Relaxed);
            bail!("memory store: injected write failure");
        }
        Ok(())
    }

    /// Live entry for `key`, dropping it first if it has expired
    fn live_entry(&self, key: &str, now: DateTime<Utc>) -> Option<StoredEntry> {
        let entry = self.entries.get(key)?;
        if entry.is_expired(now) {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.clone())
    }

    fn apply(&self, op: &BatchOp, now: DateTime<Utc>) {
        match op {
            BatchOp::HashSet { key, fields } => {
                let mut entry = self.writable_entry(key, now);
                match &mut entry.value {
                    StoredValue::Hash(map) => {
                        map.extend(fields.iter().cloned());
                    }
                    other => *other = StoredValue::Hash(fields.iter().cloned().collect()),
                }
            }
            BatchOp::SetAdd { key, member } => {
                let mut entry = self.writable_entry(key, now);
                match &mut entry.value {
                    StoredValue::Set(members) => {
                        members.insert(member.clone());
                    }
                    other => *other = StoredValue::Set(HashSet::from([member.clone()])),
                }
            }
            BatchOp::ListPush { key, values } => {
                let mut entry = self.writable_entry(key, now);
                match &mut entry.value {
                    StoredValue::List(items) => items.extend(values.iter().cloned()),
                    other => *other = StoredValue::List(values.clone()),
                }
            }
            BatchOp::Expire { key, ttl } => {
                if let Some(mut entry) = self.entries.get_mut(key) {
                    if !entry.is_expired(now) {
                        entry.expires_at = Some(now + chrono_ttl(*ttl));
                    }
                }
            }
            BatchOp::Delete { key } => {
                self.entries.remove(key);
            }
        }
    }

    /// Entry to write into; expired entries are replaced by an empty one
    fn writable_entry(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> dashmap::mapref::one::RefMut<'_, String, StoredEntry> {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StoredEntry::new(StoredValue::Hash(HashMap::new())));
        if entry.is_expired(now) {
            *entry = StoredEntry::new(StoredValue::Hash(HashMap::new()));
        }
        entry
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn chrono_ttl(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX)
}

/// Glob match supporting `*` (any run) and `?` (any single char)
pub(crate) fn glob_matches(pattern: &str, candidate: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let candidate: Vec<char> = candidate.chars().collect();

    let (mut p, mut c) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while c < candidate.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, c));
                p += 1;
            }
            Some(&ch) if ch == '?' || candidate.get(c) == Some(&ch) => {
                p += 1;
                c += 1;
            }
            _ => match backtrack {
                Some((star_p, star_c)) => {
                    p = star_p + 1;
                    c = star_c + 1;
                    backtrack = Some((star_p, star_c + 1));
                }
                None => return false,
            },
        }
    }

    pattern.get(p..).is_some_and(|rest| rest.iter().all(|&ch| ch == '*'))
}

// ===== Trait Implementations =====

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        self.check_reads()?;
        let _gate = self.gate.read();
        let now = self.clock.now();

        match self.live_entry(key, now).map(|entry| entry.value) {
            Some(StoredValue::Hash(map)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(map)
            }
            Some(_) => bail!("WRONGTYPE key '{key}' does not hold a hash"),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(HashMap::new())
            }
        }
    }

    async fn execute(&self, batch: &CacheBatch) -> Result<()> {
        self.check_writes()?;
        let _gate = self.gate.write();
        let now = self.clock.now();

        for op in batch.ops() {
            self.apply(op, now);
        }
        self.batches.fetch_add(1, Ordering::Relaxed);
        debug!(ops = batch.ops().len(), "[Memory] Applied batch");
        Ok(())
    }

    async fn list_range(&self, key: &str) -> Result<Option<Vec<String>>> {
        self.check_reads()?;
        let _gate = self.gate.read();
        let now = self.clock.now();

        match self.live_entry(key, now).map(|entry| entry.value) {
            Some(StoredValue::List(items)) if !items.is_empty() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(items))
            }
            Some(StoredValue::List(_)) | None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Some(_) => bail!("WRONGTYPE key '{key}' does not hold a list"),
        }
    }

    async fn delete_matching(&self, pattern: &str) -> Result<usize> {
        self.check_writes()?;
        let _gate = self.gate.write();

        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| glob_matches(pattern, entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for key in &keys {
            self.entries.remove(key);
        }

        debug!(pattern = %pattern, count = keys.len(), "[Memory] Removed keys matching pattern");
        Ok(keys.len())
    }

    async fn read_counter(&self, key: &str) -> Result<u64> {
        self.check_reads()?;
        let _gate = self.gate.read();
        let now = self.clock.now();

        match self.live_entry(key, now).map(|entry| entry.value) {
            Some(StoredValue::Counter(count)) => Ok(count),
            Some(_) => bail!("WRONGTYPE key '{key}' does not hold a counter"),
            None => Ok(0),
        }
    }

    async fn increment(&self, key: &str) -> Result<u64> {
        self.check_writes()?;
        let _gate = self.gate.read();
        let now = self.clock.now();

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if !occupied.get().is_expired(now) => {
                let StoredValue::Counter(count) = &mut occupied.get_mut().value else {
                    bail!("WRONGTYPE key '{key}' does not hold a counter");
                };
                *count += 1;
                Ok(*count)
            }
            Entry::Occupied(mut expired) => {
                expired.insert(StoredEntry::new(StoredValue::Counter(1)));
                Ok(1)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredEntry::new(StoredValue::Counter(1)));
                Ok(1)
            }
        }
    }

    async fn check_and_increment(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<CounterState> {
        self.check_writes()?;
        let _gate = self.gate.read();
        let now = self.clock.now();

        // The entry guard holds the shard lock until the end of the match,
        // which makes the whole sequence indivisible for this key.
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if !occupied.get().is_expired(now) => {
                let entry = occupied.get_mut();
                let StoredValue::Counter(count) = &mut entry.value else {
                    bail!("WRONGTYPE key '{key}' does not hold a counter");
                };
                let resets_in = entry.expires_at.map(|at| elapsed_between(now, at));
                if *count >= limit {
                    return Ok(CounterState {
                        allowed: false,
                        count: *count,
                        resets_in,
                    });
                }
                *count += 1;
                Ok(CounterState {
                    allowed: true,
                    count: *count,
                    resets_in,
                })
            }
            Entry::Occupied(mut expired) => {
                if limit == 0 {
                    expired.remove();
                    return Ok(CounterState {
                        allowed: false,
                        count: 0,
                        resets_in: None,
                    });
                }
                expired.insert(StoredEntry {
                    value: StoredValue::Counter(1),
                    expires_at: Some(now + chrono_ttl(window)),
                });
                Ok(CounterState {
                    allowed: true,
                    count: 1,
                    resets_in: Some(window),
                })
            }
            Entry::Vacant(vacant) => {
                if limit == 0 {
                    return Ok(CounterState {
                        allowed: false,
                        count: 0,
                        resets_in: None,
                    });
                }
                vacant.insert(StoredEntry {
                    value: StoredValue::Counter(1),
                    expires_at: Some(now + chrono_ttl(window)),
                });
                Ok(CounterState {
                    allowed: true,
                    count: 1,
                    resets_in: Some(window),
                })
            }
        }
    }

    async fn health_check(&self) -> bool {
        !self.fail_reads.load(Ordering::SeqCst) && !self.fail_writes.load(Ordering::SeqCst)
    }

    fn name(&self) -> &'static str {
        "Memory"
    }
}
