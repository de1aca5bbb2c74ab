//! Common utilities for integration tests
//!
//! This module provides shared test infrastructure including:
//! - In-memory service environments on a manual clock
//! - Request context and seeding helpers
//! - Redis connection helpers for the ignored live tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use stake_cache::backends::{MemoryDatastore, MemoryStore};
use stake_cache::listing_cache::{generation_key, page_key};
use stake_cache::{
    KeyValueStore, ManualClock, NewStake, OwnerId, RateLimitRule, RateLimitScope, RequestContext,
    RetryPolicy, ServiceConfig, Stake, StakeService, StakeServiceBuilder,
};

/// Get Redis URL from environment or use default
pub fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

/// Create a test key with unique prefix
pub fn test_key(name: &str) -> String {
    format!("test_{}_{}", name, rand::random::<u32>())
}

/// A service over in-memory backends, with handles to poke at them
pub struct TestEnv {
    pub service: StakeService,
    pub kv: Arc<MemoryStore>,
    pub datastore: MemoryDatastore,
    pub clock: Arc<ManualClock>,
}

/// Config with limits high enough that seeding never trips them, and
/// single-attempt cache retries so failure tests stay fast
pub fn relaxed_config() -> ServiceConfig {
    let minute = Duration::from_secs(60);
    ServiceConfig {
        cache_retry: RetryPolicy::NONE,
        ..ServiceConfig::default()
    }
    .with_rate_limit(RateLimitScope::Global, RateLimitRule::new(10_000, minute))
    .with_rate_limit(RateLimitScope::StakeCreate, RateLimitRule::new(10_000, minute))
    .with_rate_limit(RateLimitScope::StakeGet, RateLimitRule::new(10_000, minute))
}

/// Build a service over fresh in-memory backends
pub async fn setup_with_config(config: ServiceConfig) -> TestEnv {
    let clock = Arc::new(ManualClock::default());
    let kv = Arc::new(MemoryStore::with_clock(clock.clone()));
    let datastore = MemoryDatastore::with_clock(clock.clone());

    let service = StakeServiceBuilder::new()
        .with_config(config)
        .with_kv_store(kv.clone())
        .with_connector(Arc::new(datastore.clone()))
        .with_clock(clock.clone())
        .build()
        .await
        .expect("Failed to build test service");

    TestEnv {
        service,
        kv,
        datastore,
        clock,
    }
}

pub async fn setup() -> TestEnv {
    setup_with_config(relaxed_config()).await
}

pub fn user_ctx(user_id: OwnerId) -> RequestContext {
    RequestContext::authenticated(user_id, "198.51.100.7")
}

/// Create `count` stakes for `owner_id`, one second apart; returns them
/// oldest first
pub async fn seed_stakes(env: &TestEnv, owner_id: OwnerId, count: usize) -> Vec<Stake> {
    let mut created = Vec::with_capacity(count);
    for i in 0..count {
        let amount = 100.0 + i as f64;
        let stake = env
            .service
            .create_stake(&user_ctx(owner_id), NewStake::new(owner_id, amount, 3).unwrap())
            .await
            .expect("Failed to seed stake");
        created.push(stake);
        env.clock.advance(Duration::from_secs(1));
    }
    created
}

/// Whether `owner_id`'s page is cached under the owner's current generation
pub async fn page_cached(env: &TestEnv, owner_id: OwnerId, page: u32, page_size: u32) -> bool {
    let generation = env
        .kv
        .read_counter(&generation_key(owner_id))
        .await
        .expect("Failed to read listing generation");
    env.kv.contains_key(&page_key(owner_id, generation, page, page_size))
}
