//! Backend Implementations
//!
//! # Available Backends
//!
//! ## Key-Value Cache Service
//! - **Redis** - Shared cache across instances, Lua-scripted rate counter (default, feature: `redis`)
//! - **Memory** - `DashMap`-based in-process store with TTLs and failure injection
//!
//! ## Relational Datastore
//! - **`PostgreSQL`** - `deadpool-postgres` pooled sessions (default, feature: `postgres`)
//! - **Memory** - In-process table with failure injection and session counters
//!
//! # Usage
//!
//! ```rust,no_run
//! use stake_cache::DbConfig;
//! use stake_cache::backends::{PostgresConnector, RedisStore};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let redis = RedisStore::new().await?;
//! let postgres = PostgresConnector::new(DbConfig::from_env());
//! # Ok(())
//! # }
//! ```

pub mod memory_datastore;
pub mod memory_store;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "redis")]
pub mod redis_store;

pub use memory_datastore::{InjectedFailure, MemoryDatastore, MemorySession};
pub use memory_store::{MemoryStore, MemoryStoreStats};

#[cfg(feature = "postgres")]
pub use postgres::{PostgresConnector, PostgresSession};

#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
