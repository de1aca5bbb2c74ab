//! Record Cache - single-entity projections with stale-while-revalidate
//!
//! A record is stored as a hash at `<kind>:<id>` holding its fields plus
//! `cachedAt` (epoch milliseconds). With stale-while-revalidate enabled the
//! hash outlives its freshness window by `stale_extension`, so a reader can
//! still get it, flagged stale, instead of falling through to the store.
//!
//! Cache faults never escape this module: writes degrade to a logged no-op,
//! reads degrade to a miss.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::DateTime;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::models::{OwnerId, Stake, StakeId, StakePeriod};
use crate::retry::{RetryPolicy, retry};
use crate::traits::{CacheBatch, KeyValueStore};

/// Field holding the time of the last cache write
pub const CACHED_AT_FIELD: &str = "cachedAt";

/// Freshness and eviction rules for one class of cached records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    /// How long a record counts as fresh
    pub ttl: Duration,
    /// Keep serving (flagged stale) after `ttl` instead of evicting
    pub stale_while_revalidate: bool,
    /// Extra lifetime granted on top of `ttl` when stale-while-revalidate is on
    pub stale_extension: Duration,
}

impl CachePolicy {
    /// Stake records: fresh for 5 minutes, kept 5 more while stale
    pub const STAKE_RECORD: Self = Self {
        ttl: Duration::from_secs(300),
        stale_while_revalidate: true,
        stale_extension: Duration::from_secs(300),
    };

    /// User records: fresh for 10 minutes, kept 10 more while stale
    pub const USER_RECORD: Self = Self {
        ttl: Duration::from_secs(600),
        stale_while_revalidate: true,
        stale_extension: Duration::from_secs(600),
    };

    /// Short-lived data: evicted exactly at 60 seconds
    pub const SHORT_LIVED: Self = Self {
        ttl: Duration::from_secs(60),
        stale_while_revalidate: false,
        stale_extension: Duration::ZERO,
    };

    /// Physical lifetime of the stored entry
    #[must_use]
    pub fn expiry(&self) -> Duration {
        if self.stale_while_revalidate {
            self.ttl + self.stale_extension
        } else {
            self.ttl
        }
    }

    /// Stale once strictly more than `ttl` has passed since `cached_at_ms`
    #[must_use]
    pub fn is_stale(&self, cached_at_ms: i64, now_ms: i64) -> bool {
        if !self.stale_while_revalidate {
            return false;
        }
        let ttl_ms = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        now_ms.saturating_sub(cached_at_ms) > ttl_ms
    }
}

/// A type that can be projected into the key-value cache
pub trait Cacheable: Sized + Send + Sync {
    /// Key namespace, e.g. `stake`
    const KIND: &'static str;

    fn cache_id(&self) -> i64;

    /// Set that indexes every id of this record's owner, if any
    fn owner_index_key(&self) -> Option<String>;

    /// Field map written to the cache (without `cachedAt`)
    fn to_fields(&self) -> Vec<(String, String)>;

    /// Rebuild from a cached field map
    ///
    /// # Errors
    ///
    /// Returns an error when a field is missing or malformed.
    fn from_fields(fields: &HashMap<String, String>) -> Result<Self>;

    #[must_use]
    fn cache_key_for(id: i64) -> String {
        format!("{}:{id}", Self::KIND)
    }
}

/// Key of the set holding every stake id of an owner
#[must_use]
pub fn owner_stakes_key(owner_id: OwnerId) -> String {
    format!("user:{owner_id}:stakes")
}

fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> Result<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("cached record is missing field '{name}'"))
}

impl Cacheable for Stake {
    const KIND: &'static str = "stake";

    fn cache_id(&self) -> i64 {
        self.id
    }

    fn owner_index_key(&self) -> Option<String> {
        Some(owner_stakes_key(self.owner_id))
    }

    fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("id".to_string(), self.id.to_string()),
            ("ownerId".to_string(), self.owner_id.to_string()),
            ("amount".to_string(), self.amount.to_string()),
            ("periodMonths".to_string(), self.period.months().to_string()),
            (
                "createdAt".to_string(),
                self.created_at.timestamp_micros().to_string(),
            ),
        ]
    }

    fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let created_at_us: i64 = field(fields, "createdAt")?.parse()?;
        let months: i32 = field(fields, "periodMonths")?.parse()?;
        Ok(Self {
            id: field(fields, "id")?.parse()?,
            owner_id: field(fields, "ownerId")?.parse()?,
            amount: field(fields, "amount")?.parse()?,
            period: StakePeriod::try_from(months)?,
            created_at: DateTime::from_timestamp_micros(created_at_us)
                .context("cached createdAt out of range")?,
        })
    }
}

/// Outcome of a best-effort cache write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheWrite {
    Stored,
    /// The write was abandoned after retries; the caller carries on
    Degraded,
}

impl CacheWrite {
    #[must_use]
    pub fn is_degraded(self) -> bool {
        self == Self::Degraded
    }
}

/// Outcome of a cache read
#[derive(Debug, Clone, PartialEq)]
pub struct CacheLookup<R> {
    pub record: Option<R>,
    pub is_stale: bool,
}

impl<R> CacheLookup<R> {
    #[must_use]
    pub fn absent() -> Self {
        Self {
            record: None,
            is_stale: false,
        }
    }

    /// Present and within its freshness window
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.record.is_some() && !self.is_stale
    }
}

/// Counters shared by the record and listing caches
#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    pub(crate) degraded_writes: AtomicU64,
    pub(crate) degraded_reads: AtomicU64,
}

/// Record cache over a [`KeyValueStore`]
#[derive(Clone)]
pub struct RecordCache {
    kv: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    counters: Arc<CacheCounters>,
}

impl RecordCache {
    #[must_use]
    pub fn new(kv: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self::with_counters(kv, clock, retry, Arc::new(CacheCounters::default()))
    }

    pub(crate) fn with_counters(
        kv: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        counters: Arc<CacheCounters>,
    ) -> Self {
        Self {
            kv,
            clock,
            retry,
            counters,
        }
    }

    /// Write `record` with `cachedAt = now` and index it under its owner
    ///
    /// Never fails: exhausted retries are logged and reported as
    /// [`CacheWrite::Degraded`].
    pub async fn put<R: Cacheable>(&self, record: &R, policy: &CachePolicy) -> CacheWrite {
        let key = R::cache_key_for(record.cache_id());
        let mut fields = record.to_fields();
        fields.push((CACHED_AT_FIELD.to_string(), self.clock.now_millis().to_string()));

        let mut batch = CacheBatch::new()
            .hash_set(key.clone(), fields)
            .expire(key.clone(), policy.expiry());
        if let Some(index_key) = record.owner_index_key() {
            batch = batch.set_add(index_key, record.cache_id().to_string());
        }

        let kv = &self.kv;
        let result = retry(&self.retry, "record_cache.put", |_| true, |_| kv.execute(&batch)).await;

        match result {
            Ok(()) => {
                debug!(key = %key, ttl_secs = policy.expiry().as_secs(), "Cached record");
                CacheWrite::Stored
            }
            Err(exhausted) => {
                self.counters.degraded_writes.fetch_add(1, Ordering::Relaxed);
                warn!(
                    key = %key,
                    attempts = exhausted.attempts,
                    error = %exhausted.last_error,
                    "Cache write abandoned, continuing without cache"
                );
                CacheWrite::Degraded
            }
        }
    }

    /// Read a record and judge its freshness under `policy`
    ///
    /// Never fails: exhausted retries and undecodable entries read as absent.
    pub async fn get<R: Cacheable>(&self, id: StakeId, policy: &CachePolicy) -> CacheLookup<R> {
        let key = R::cache_key_for(id);
        let kv = &self.kv;
        let result = retry(&self.retry, "record_cache.get", |_| true, |_| {
            kv.hash_get_all(&key)
        })
        .await;

        let fields = match result {
            Ok(fields) if fields.is_empty() => return CacheLookup::absent(),
            Ok(fields) => fields,
            Err(exhausted) => {
                self.counters.degraded_reads.fetch_add(1, Ordering::Relaxed);
                warn!(
                    key = %key,
                    attempts = exhausted.attempts,
                    error = %exhausted.last_error,
                    "Cache read abandoned, treating as miss"
                );
                return CacheLookup::absent();
            }
        };

        let decoded = R::from_fields(&fields).and_then(|record| {
            let cached_at: i64 = field(&fields, CACHED_AT_FIELD)?.parse()?;
            Ok((record, cached_at))
        });

        match decoded {
            Ok((record, cached_at)) => CacheLookup {
                is_stale: policy.is_stale(cached_at, self.clock.now_millis()),
                record: Some(record),
            },
            Err(e) => {
                warn!(key = %key, error = %e, "Undecodable cache entry, treating as miss");
                CacheLookup::absent()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryStore;
    use crate::clock::ManualClock;
    use chrono::Utc;

    fn stake(id: StakeId, owner_id: OwnerId) -> Stake {
        Stake {
            id,
            owner_id,
            amount: 125.5,
            period: StakePeriod::SixMonths,
            created_at: Utc::now(),
        }
    }

    fn setup() -> (RecordCache, Arc<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let cache = RecordCache::new(store.clone(), clock.clone(), RetryPolicy::NONE);
        (cache, store, clock)
    }

    #[test]
    fn test_policy_expiry_and_staleness() {
        assert_eq!(CachePolicy::STAKE_RECORD.expiry(), Duration::from_secs(600));
        assert_eq!(CachePolicy::USER_RECORD.expiry(), Duration::from_secs(1200));
        assert_eq!(CachePolicy::SHORT_LIVED.expiry(), Duration::from_secs(60));

        let policy = CachePolicy::STAKE_RECORD;
        assert!(!policy.is_stale(0, 300_000));
        assert!(policy.is_stale(0, 300_001));
        assert!(!CachePolicy::SHORT_LIVED.is_stale(0, 10_000_000));
    }

    #[tokio::test]
    async fn test_put_then_get_is_fresh_then_stale() {
        let (cache, store, clock) = setup();
        let record = stake(1, 7);

        assert_eq!(cache.put(&record, &CachePolicy::STAKE_RECORD).await, CacheWrite::Stored);
        assert!(store.set_members(&owner_stakes_key(7)).contains("1"));

        let lookup: CacheLookup<Stake> = cache.get(1, &CachePolicy::STAKE_RECORD).await;
        assert!(lookup.is_fresh());
        assert_eq!(lookup.record.as_ref().map(|s| s.id), Some(1));

        clock.advance(Duration::from_secs(301));
        let lookup: CacheLookup<Stake> = cache.get(1, &CachePolicy::STAKE_RECORD).await;
        assert!(lookup.is_stale);
        assert!(lookup.record.is_some());

        // physically evicted after ttl + stale extension
        clock.advance(Duration::from_secs(300));
        let lookup: CacheLookup<Stake> = cache.get(1, &CachePolicy::STAKE_RECORD).await;
        assert_eq!(lookup, CacheLookup::absent());
    }

    #[tokio::test]
    async fn test_short_lived_evicts_at_ttl() {
        let (cache, _store, clock) = setup();
        cache.put(&stake(2, 7), &CachePolicy::SHORT_LIVED).await;

        clock.advance(Duration::from_secs(59));
        let lookup: CacheLookup<Stake> = cache.get(2, &CachePolicy::SHORT_LIVED).await;
        assert!(lookup.is_fresh());

        clock.advance(Duration::from_secs(1));
        let lookup: CacheLookup<Stake> = cache.get(2, &CachePolicy::SHORT_LIVED).await;
        assert!(lookup.record.is_none());
    }

    #[tokio::test]
    async fn test_round_trip_preserves_fields() {
        let (cache, _store, _clock) = setup();
        let record = stake(3, 9);
        cache.put(&record, &CachePolicy::STAKE_RECORD).await;

        let lookup: CacheLookup<Stake> = cache.get(3, &CachePolicy::STAKE_RECORD).await;
        let cached = lookup.record.unwrap();
        assert_eq!(cached.amount, record.amount);
        assert_eq!(cached.period, record.period);
        assert_eq!(
            cached.created_at.timestamp_micros(),
            record.created_at.timestamp_micros()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_degrade_instead_of_erroring() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let cache = RecordCache::new(store.clone(), clock, RetryPolicy::CACHE);

        store.set_unavailable(true);
        assert_eq!(
            cache.put(&stake(4, 7), &CachePolicy::STAKE_RECORD).await,
            CacheWrite::Degraded
        );
        let lookup: CacheLookup<Stake> = cache.get(4, &CachePolicy::STAKE_RECORD).await;
        assert_eq!(lookup, CacheLookup::absent());

        // two attempts each for the write and the read
        assert_eq!(store.stats().rejected_ops, 4);
    }

    #[tokio::test]
    async fn test_corrupt_entry_reads_as_miss() {
        let (cache, store, _clock) = setup();
        store
            .execute(&CacheBatch::new().hash_set("stake:5", vec![("id".into(), "five".into())]))
            .await
            .unwrap();

        let lookup: CacheLookup<Stake> = cache.get(5, &CachePolicy::STAKE_RECORD).await;
        assert_eq!(lookup, CacheLookup::absent());
    }
}
