//! Stake Service - read and write paths over cache, limiter and datastore
//!
//! **Write path**: rate limit → persist → cache the record → invalidate the
//! owner's listing pages. Only the persist step can fail the request.
//!
//! **List path**: rate limit → owner's listing generation → cached page →
//! resolve every id from the record cache. A page is served from cache only when every id resolves to
//! a fresh record; anything else reloads the whole page from the datastore
//! and repopulates both caches.
//!
//! **Single read**: rate limit → record cache. A stale hit is served as-is
//! while one background task per id reloads it from the datastore.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::ServiceConfig;
use crate::error::Result;
use crate::listing_cache::ListingCache;
use crate::models::{ListQuery, NewStake, OwnerId, Stake, StakeId, StakeLookup, StakePage};
use crate::rate_limiter::{RateLimitScope, RateLimiter, RequestContext};
use crate::record_cache::{CacheCounters, CacheLookup, CachePolicy, RecordCache};
use crate::store_client::BackingStoreClient;
use crate::traits::KeyValueStore;

/// Removes an id from the in-flight refresh map when the refresh ends,
/// including on panic
struct RefreshGuard {
    map: Arc<DashMap<StakeId, ()>>,
    id: StakeId,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.map.remove(&self.id);
    }
}

#[derive(Debug, Default)]
struct ServiceCounters {
    list_hits: AtomicU64,
    list_misses: AtomicU64,
    record_hits: AtomicU64,
    record_misses: AtomicU64,
    stale_reads: AtomicU64,
    background_refreshes: AtomicU64,
}

/// Resilience layer in front of the stakes datastore
#[derive(Clone)]
pub struct StakeService {
    kv: Arc<dyn KeyValueStore>,
    store: Arc<BackingStoreClient>,
    records: RecordCache,
    listings: ListingCache,
    limiter: RateLimiter,
    policy: CachePolicy,
    counters: Arc<ServiceCounters>,
    cache_counters: Arc<CacheCounters>,
    refreshing: Arc<DashMap<StakeId, ()>>,
}

impl StakeService {
    /// Wire a service from its parts
    ///
    /// Most callers go through [`StakeServiceBuilder`](crate::StakeServiceBuilder).
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        store: Arc<BackingStoreClient>,
        clock: Arc<dyn Clock>,
        config: &ServiceConfig,
    ) -> Self {
        let cache_counters = Arc::new(CacheCounters::default());
        Self {
            records: RecordCache::with_counters(
                Arc::clone(&kv),
                clock,
                config.cache_retry,
                Arc::clone(&cache_counters),
            ),
            listings: ListingCache::with_counters(
                Arc::clone(&kv),
                config.cache_retry,
                Arc::clone(&cache_counters),
            ),
            limiter: RateLimiter::with_rules(
                Arc::clone(&kv),
                config.rate_limits.clone(),
                config.limiter_failure_policy,
            ),
            kv,
            store,
            policy: config.stake_policy,
            counters: Arc::new(ServiceCounters::default()),
            cache_counters,
            refreshing: Arc::new(DashMap::new()),
        }
    }

    /// Persist a new stake for `stake.owner_id`
    ///
    /// On return the owner's listing pages are already invalidated (or the
    /// invalidation was logged as degraded), so the owner's next list read
    /// includes the new stake.
    ///
    /// # Errors
    ///
    /// - [`StakeError::RateLimited`](crate::StakeError::RateLimited) when the
    ///   global or `stake-create` scope is exhausted
    /// - [`StakeError::Store`](crate::StakeError::Store) when the insert fails
    pub async fn create_stake(&self, ctx: &RequestContext, stake: NewStake) -> Result<Stake> {
        self.limiter.apply(ctx, RateLimitScope::StakeCreate).await?;

        let created = self.store.create_record(&stake).await?;
        info!(
            stake_id = created.id,
            owner_id = created.owner_id,
            period_months = created.period.months(),
            "Stake created"
        );

        self.records.put(&created, &self.policy).await;
        self.listings.invalidate_owner(created.owner_id).await;

        Ok(created)
    }

    /// One page of `owner_id`'s stakes, newest first
    ///
    /// # Errors
    ///
    /// - [`StakeError::RateLimited`](crate::StakeError::RateLimited) when the
    ///   global or `stake-get` scope is exhausted
    /// - [`StakeError::Store`](crate::StakeError::Store) when the page had to
    ///   be loaded and the datastore failed
    pub async fn list_stakes(
        &self,
        ctx: &RequestContext,
        owner_id: OwnerId,
        query: ListQuery,
    ) -> Result<StakePage> {
        self.limiter.apply(ctx, RateLimitScope::StakeGet).await?;
        let (page, page_size) = (query.page(), query.page_size());

        // captured before the store load; a page loaded across a write by
        // this owner is then written under a superseded generation
        let generation = self.listings.generation(owner_id).await;

        if let Some(generation) = generation {
            if let Some(ids) = self.listings.get_page(owner_id, generation, page, page_size).await {
                if let Some(items) = self.resolve_fresh(&ids).await {
                    self.counters.list_hits.fetch_add(1, Ordering::Relaxed);
                    debug!(owner_id, page, page_size, items = items.len(), "Listing served from cache");
                    return Ok(StakePage {
                        items,
                        served_from_cache: true,
                    });
                }
                debug!(owner_id, page, page_size, "Listing page incomplete or stale, reloading");
            }
        }

        self.counters.list_misses.fetch_add(1, Ordering::Relaxed);
        let items = self.store.list_records(owner_id, &query).await?;

        join_all(items.iter().map(|stake| self.records.put(stake, &self.policy))).await;
        if let Some(generation) = generation {
            let ids: Vec<StakeId> = items.iter().map(|stake| stake.id).collect();
            self.listings
                .put_page(owner_id, generation, page, page_size, &ids, &self.policy)
                .await;
        }

        Ok(StakePage {
            items,
            served_from_cache: false,
        })
    }

    /// Every record of `ids`, in order, if each one is cached and fresh
    async fn resolve_fresh(&self, ids: &[StakeId]) -> Option<Vec<Stake>> {
        let lookups: Vec<CacheLookup<Stake>> =
            join_all(ids.iter().map(|id| self.records.get(*id, &self.policy))).await;

        lookups
            .into_iter()
            .map(|lookup| if lookup.is_stale { None } else { lookup.record })
            .collect()
    }

    /// A single stake by id, `None` when it does not exist
    ///
    /// # Errors
    ///
    /// - [`StakeError::RateLimited`](crate::StakeError::RateLimited) when the
    ///   global or `stake-get` scope is exhausted
    /// - [`StakeError::Store`](crate::StakeError::Store) on a cache miss when
    ///   the datastore failed
    pub async fn get_stake(&self, ctx: &RequestContext, id: StakeId) -> Result<Option<StakeLookup>> {
        self.limiter.apply(ctx, RateLimitScope::StakeGet).await?;

        let lookup: CacheLookup<Stake> = self.records.get(id, &self.policy).await;
        if let Some(stake) = lookup.record {
            self.counters.record_hits.fetch_add(1, Ordering::Relaxed);
            if lookup.is_stale {
                self.counters.stale_reads.fetch_add(1, Ordering::Relaxed);
                self.spawn_refresh(id);
            }
            return Ok(Some(StakeLookup {
                stake,
                served_from_cache: true,
                stale: lookup.is_stale,
            }));
        }

        self.counters.record_misses.fetch_add(1, Ordering::Relaxed);
        let Some(stake) = self.store.find_record(id).await? else {
            debug!(stake_id = id, "Stake not found");
            return Ok(None);
        };
        self.records.put(&stake, &self.policy).await;

        Ok(Some(StakeLookup {
            stake,
            served_from_cache: false,
            stale: false,
        }))
    }

    /// Reload a stale record in the background, at most once at a time per id
    fn spawn_refresh(&self, id: StakeId) {
        if self.refreshing.insert(id, ()).is_some() {
            debug!(stake_id = id, "Refresh already in flight");
            return;
        }
        let guard = RefreshGuard {
            map: Arc::clone(&self.refreshing),
            id,
        };

        let store = Arc::clone(&self.store);
        let records = self.records.clone();
        let policy = self.policy;
        let counters = Arc::clone(&self.counters);

        tokio::spawn(async move {
            let _guard = guard;
            match store.find_record(id).await {
                Ok(Some(fresh)) => {
                    records.put(&fresh, &policy).await;
                    counters.background_refreshes.fetch_add(1, Ordering::Relaxed);
                    debug!(stake_id = id, "Stale record refreshed");
                }
                Ok(None) => debug!(stake_id = id, "Stale record no longer in datastore"),
                Err(e) => warn!(stake_id = id, error = %e, "Background refresh failed"),
            }
        });
    }

    /// Whether a background refresh for `id` is currently running
    #[must_use]
    pub fn is_refreshing(&self, id: StakeId) -> bool {
        self.refreshing.contains_key(&id)
    }

    /// Probe the datastore and the key-value store
    pub async fn health_check(&self) -> ServiceHealth {
        let (store_healthy, cache_healthy) =
            tokio::join!(self.store.health_check(), self.kv.health_check());
        if !store_healthy || !cache_healthy {
            warn!(store_healthy, cache_healthy, "Service health check failed");
        }
        ServiceHealth {
            store_healthy,
            cache_healthy,
        }
    }

    #[must_use]
    pub fn stats(&self) -> ServiceStats {
        let list_hits = self.counters.list_hits.load(Ordering::Relaxed);
        let list_misses = self.counters.list_misses.load(Ordering::Relaxed);
        let total_lists = list_hits + list_misses;

        ServiceStats {
            list_hits,
            list_misses,
            list_hit_rate: if total_lists > 0 {
                (list_hits as f64 / total_lists as f64) * 100.0
            } else {
                0.0
            },
            record_hits: self.counters.record_hits.load(Ordering::Relaxed),
            record_misses: self.counters.record_misses.load(Ordering::Relaxed),
            stale_reads: self.counters.stale_reads.load(Ordering::Relaxed),
            background_refreshes: self.counters.background_refreshes.load(Ordering::Relaxed),
            degraded_cache_writes: self.cache_counters.degraded_writes.load(Ordering::Relaxed),
            degraded_cache_reads: self.cache_counters.degraded_reads.load(Ordering::Relaxed),
            rate_limited: self.limiter.rejected(),
            fail_open_decisions: self.limiter.fail_open_decisions(),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<BackingStoreClient> {
        &self.store
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }
}

/// Result of [`StakeService::health_check`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    pub store_healthy: bool,
    pub cache_healthy: bool,
}

impl ServiceHealth {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.store_healthy && self.cache_healthy
    }
}

/// Service statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
    pub list_hits: u64,
    pub list_misses: u64,
    pub list_hit_rate: f64,
    pub record_hits: u64,
    pub record_misses: u64,
    pub stale_reads: u64,
    pub background_refreshes: u64,
    pub degraded_cache_writes: u64,
    pub degraded_cache_reads: u64,
    pub rate_limited: u64,
    pub fail_open_decisions: u64,
}
