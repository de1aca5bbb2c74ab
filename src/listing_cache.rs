//! Listing Cache - ordered id lists per (owner, page, page size)
//!
//! Pages are never patched. Any write by an owner deletes every cached page
//! of that owner, and the next read rebuilds the page from the store.
//!
//! Each owner also has a listing generation, bumped by every invalidation
//! and embedded in the page key. A reader captures the generation before it
//! loads from the store and writes its page under that generation, so a load
//! that raced with a write lands on a key no later reader looks up.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, warn};

use crate::models::{OwnerId, StakeId};
use crate::record_cache::{CacheCounters, CachePolicy, CacheWrite};
use crate::retry::{RetryPolicy, retry};
use crate::traits::{CacheBatch, KeyValueStore};

/// Cache key of one listing page
#[must_use]
pub fn page_key(owner_id: OwnerId, generation: u64, page: u32, page_size: u32) -> String {
    format!("stakes:owner:{owner_id}:v{generation}:page:{page}:size:{page_size}")
}

/// Pattern matching every page key of an owner, across generations
#[must_use]
pub fn owner_page_pattern(owner_id: OwnerId) -> String {
    format!("stakes:owner:{owner_id}:v*")
}

/// Counter holding an owner's listing generation; it has no expiry
#[must_use]
pub fn generation_key(owner_id: OwnerId) -> String {
    format!("stakes:owner:{owner_id}:generation")
}

/// Listing cache over a [`KeyValueStore`]
#[derive(Clone)]
pub struct ListingCache {
    kv: Arc<dyn KeyValueStore>,
    retry: RetryPolicy,
    counters: Arc<CacheCounters>,
}

impl ListingCache {
    #[must_use]
    pub fn new(kv: Arc<dyn KeyValueStore>, retry: RetryPolicy) -> Self {
        Self::with_counters(kv, retry, Arc::new(CacheCounters::default()))
    }

    pub(crate) fn with_counters(
        kv: Arc<dyn KeyValueStore>,
        retry: RetryPolicy,
        counters: Arc<CacheCounters>,
    ) -> Self {
        Self { kv, retry, counters }
    }

    /// Current listing generation of `owner_id`, `None` on cache failure
    pub async fn generation(&self, owner_id: OwnerId) -> Option<u64> {
        let key = generation_key(owner_id);
        let kv = &self.kv;

        match retry(&self.retry, "listing_cache.generation", |_| true, |_| {
            kv.read_counter(&key)
        })
        .await
        {
            Ok(generation) => Some(generation),
            Err(exhausted) => {
                self.counters.degraded_reads.fetch_add(1, Ordering::Relaxed);
                warn!(
                    owner_id,
                    attempts = exhausted.attempts,
                    error = %exhausted.last_error,
                    "Listing generation read abandoned, bypassing page cache"
                );
                None
            }
        }
    }

    /// Replace a page of `generation` with `ordered_ids` in one atomic batch
    ///
    /// An empty page is not stored; it only clears any previous entry.
    pub async fn put_page(
        &self,
        owner_id: OwnerId,
        generation: u64,
        page: u32,
        page_size: u32,
        ordered_ids: &[StakeId],
        policy: &CachePolicy,
    ) -> CacheWrite {
        let key = page_key(owner_id, generation, page, page_size);
        let mut batch = CacheBatch::new().delete(key.clone());
        if !ordered_ids.is_empty() {
            let values = ordered_ids.iter().map(ToString::to_string).collect();
            batch = batch
                .list_push(key.clone(), values)
                .expire(key.clone(), policy.expiry());
        }

        let kv = &self.kv;
        match retry(&self.retry, "listing_cache.put_page", |_| true, |_| kv.execute(&batch)).await {
            Ok(()) => {
                debug!(key = %key, ids = ordered_ids.len(), "Cached listing page");
                CacheWrite::Stored
            }
            Err(exhausted) => {
                self.counters.degraded_writes.fetch_add(1, Ordering::Relaxed);
                warn!(
                    key = %key,
                    attempts = exhausted.attempts,
                    error = %exhausted.last_error,
                    "Listing page write abandoned"
                );
                CacheWrite::Degraded
            }
        }
    }

    /// Ordered ids of a cached page, `None` on miss or cache failure
    pub async fn get_page(
        &self,
        owner_id: OwnerId,
        generation: u64,
        page: u32,
        page_size: u32,
    ) -> Option<Vec<StakeId>> {
        let key = page_key(owner_id, generation, page, page_size);
        let kv = &self.kv;

        let items = match retry(&self.retry, "listing_cache.get_page", |_| true, |_| {
            kv.list_range(&key)
        })
        .await
        {
            Ok(items) => items?,
            Err(exhausted) => {
                self.counters.degraded_reads.fetch_add(1, Ordering::Relaxed);
                warn!(
                    key = %key,
                    attempts = exhausted.attempts,
                    error = %exhausted.last_error,
                    "Listing page read abandoned, treating as miss"
                );
                return None;
            }
        };

        match items
            .iter()
            .map(|id| id.parse::<StakeId>())
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(ids) => Some(ids),
            Err(e) => {
                warn!(key = %key, error = %e, "Undecodable listing page, treating as miss");
                None
            }
        }
    }

    /// Bump the listing generation of `owner_id` and delete its cached pages
    ///
    /// Called before a write for that owner returns, so the owner's next read
    /// cannot see a page that predates the write, including one written late
    /// by a reader that loaded before the write.
    pub async fn invalidate_owner(&self, owner_id: OwnerId) -> CacheWrite {
        let (generation_key, pattern) = (generation_key(owner_id), owner_page_pattern(owner_id));
        let (kv, generation_key, pattern) = (&self.kv, &generation_key, &pattern);

        match retry(&self.retry, "listing_cache.invalidate_owner", |_| true, |_| async move {
            let generation = kv.increment(generation_key).await?;
            let removed = kv.delete_matching(pattern).await?;
            Ok::<_, anyhow::Error>((generation, removed))
        })
        .await
        {
            Ok((generation, removed)) => {
                debug!(owner_id, generation, removed, "Invalidated owner listing pages");
                CacheWrite::Stored
            }
            Err(exhausted) => {
                self.counters.degraded_writes.fetch_add(1, Ordering::Relaxed);
                warn!(
                    owner_id,
                    attempts = exhausted.attempts,
                    error = %exhausted.last_error,
                    "Listing invalidation abandoned; pages expire with their TTL"
                );
                CacheWrite::Degraded
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryStore;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn setup() -> (ListingCache, Arc<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        (ListingCache::new(store.clone(), RetryPolicy::NONE), store, clock)
    }

    #[tokio::test]
    async fn test_put_then_invalidate_then_get_is_absent() {
        let (cache, _store, _clock) = setup();
        let policy = CachePolicy::STAKE_RECORD;

        cache.put_page(1, 0, 1, 20, &[11, 10], &policy).await;
        assert_eq!(cache.get_page(1, 0, 1, 20).await, Some(vec![11, 10]));

        assert_eq!(cache.invalidate_owner(1).await, CacheWrite::Stored);
        assert_eq!(cache.get_page(1, 0, 1, 20).await, None);
    }

    #[tokio::test]
    async fn test_invalidation_bumps_generation() {
        let (cache, store, _clock) = setup();
        let policy = CachePolicy::STAKE_RECORD;

        assert_eq!(cache.generation(1).await, Some(0));
        cache.invalidate_owner(1).await;
        cache.invalidate_owner(1).await;
        assert_eq!(cache.generation(1).await, Some(2));
        assert_eq!(cache.generation(12).await, Some(0));

        // a page written under a superseded generation is never looked up
        cache.put_page(1, 1, 1, 20, &[5], &policy).await;
        assert_eq!(cache.get_page(1, 2, 1, 20).await, None);
        assert!(store.contains_key(&generation_key(1)));
    }

    #[tokio::test]
    async fn test_invalidation_is_owner_scoped() {
        let (cache, _store, _clock) = setup();
        let policy = CachePolicy::STAKE_RECORD;

        cache.put_page(1, 0, 1, 20, &[1], &policy).await;
        cache.put_page(1, 0, 2, 20, &[2], &policy).await;
        cache.put_page(12, 0, 1, 20, &[3], &policy).await;

        cache.invalidate_owner(1).await;
        assert_eq!(cache.get_page(1, 0, 1, 20).await, None);
        assert_eq!(cache.get_page(1, 0, 2, 20).await, None);
        assert_eq!(cache.generation(12).await, Some(0));
        assert_eq!(cache.get_page(12, 0, 1, 20).await, Some(vec![3]));
    }

    #[tokio::test]
    async fn test_put_page_replaces_previous_list() {
        let (cache, store, _clock) = setup();
        let policy = CachePolicy::STAKE_RECORD;

        cache.put_page(1, 0, 1, 20, &[3, 2, 1], &policy).await;
        cache.put_page(1, 0, 1, 20, &[4, 3], &policy).await;
        assert_eq!(cache.get_page(1, 0, 1, 20).await, Some(vec![4, 3]));
        assert_eq!(store.ttl(&page_key(1, 0, 1, 20)), Some(Duration::from_secs(600)));

        cache.put_page(1, 0, 1, 20, &[], &policy).await;
        assert_eq!(cache.get_page(1, 0, 1, 20).await, None);
    }

    #[tokio::test]
    async fn test_pages_expire_with_policy() {
        let (cache, _store, clock) = setup();
        cache.put_page(1, 0, 1, 20, &[1], &CachePolicy::SHORT_LIVED).await;

        clock.advance(Duration::from_secs(60));
        assert_eq!(cache.get_page(1, 0, 1, 20).await, None);
    }

    #[tokio::test]
    async fn test_unavailable_store_degrades() {
        let (cache, store, _clock) = setup();
        store.set_unavailable(true);

        assert!(cache.put_page(1, 0, 1, 20, &[1], &CachePolicy::STAKE_RECORD).await.is_degraded());
        assert!(cache.invalidate_owner(1).await.is_degraded());
        assert_eq!(cache.generation(1).await, None);
        assert_eq!(cache.get_page(1, 0, 1, 20).await, None);
    }
}
