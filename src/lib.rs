//! Stake Cache
//!
//! Resilience layer for serving stake records out of a relational datastore:
//! - **Record Cache**: per-record hashes in a key-value store with stale-while-revalidate
//! - **Listing Cache**: ordered id lists per owner page, invalidated on every owner write
//! - **Rate Limiter**: atomic fixed-window counters, global plus per-endpoint, fail-open
//! - **Backing Store Client**: age-renewed datastore sessions with bounded retry
//! - **Stake Service**: the read and write paths that tie them together
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use stake_cache::{ListQuery, NewStake, RequestContext, StakeServiceBuilder};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     stake_cache::telemetry::init_tracing();
//!
//!     // Redis + PostgreSQL from REDIS_URL / STAKES_DB_* variables
//!     let service = StakeServiceBuilder::from_env().build().await?;
//!     let ctx = RequestContext::authenticated(7, "203.0.113.10");
//!
//!     let stake = service.create_stake(&ctx, NewStake::new(7, 500.0, 12)?).await?;
//!     let page = service.list_stakes(&ctx, 7, ListQuery::new(1, 20)?).await?;
//!     assert_eq!(page.items.first().map(|s| s.id), Some(stake.id));
//!
//!     let stats = service.stats();
//!     tracing::info!("List hit rate: {:.2}%", stats.list_hit_rate);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! write: limiter → datastore insert → record cache put → owner pages invalidated
//! list:  limiter → listing page → every id fresh in record cache? → return
//!                                  ↓ no (or page missing)
//!                                  datastore page → repopulate both caches
//! get:   limiter → record cache → fresh: return | stale: return + refresh | miss: datastore
//! ```
//!
//! Cache and limiter faults never fail a request; only datastore failures,
//! rate-limit rejections and invalid input reach the caller as [`StakeError`].

pub mod backends;
pub mod builder;
pub mod clock;
pub mod config;
pub mod error;
pub mod listing_cache;
pub mod models;
pub mod rate_limiter;
pub mod record_cache;
pub mod retry;
pub mod stake_service;
pub mod store_client;
pub mod telemetry;
pub mod traits;

pub use builder::StakeServiceBuilder;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DbConfig, ServiceConfig};
pub use error::{RejectedOperation, Result, StakeError};
pub use listing_cache::ListingCache;
pub use models::{ListQuery, NewStake, OwnerId, Stake, StakeId, StakeLookup, StakePage, StakePeriod};
pub use rate_limiter::{
    LimiterFailurePolicy, RateDecision, RateLimitRule, RateLimitScope, RateLimiter, RequestContext,
    Subject,
};
pub use record_cache::{CacheLookup, CachePolicy, CacheWrite, Cacheable, RecordCache};
pub use retry::{RetryExhausted, RetryPolicy};
pub use stake_service::{ServiceHealth, ServiceStats, StakeService};
pub use store_client::BackingStoreClient;
pub use traits::{BatchOp, CacheBatch, CounterState, KeyValueStore, StoreConnector, StoreSession};

// Re-export async_trait for backend implementors
pub use async_trait::async_trait;
