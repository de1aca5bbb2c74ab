//! Backend Traits
//!
//! The resilience layer talks to two kinds of external systems, both behind
//! traits so the core never names a concrete product:
//!
//! - `KeyValueStore`: the key-value cache service holding record
//!   projections, listing pages and rate counters
//! - `StoreConnector` / `StoreSession`: the relational datastore that is the
//!   source of truth for stakes
//!
//! # Example: Custom Key-Value Backend
//!
//! ```rust,ignore
//! use stake_cache::{KeyValueStore, CacheBatch, CounterState, async_trait};
//! use std::collections::HashMap;
//! use std::time::Duration;
//! use anyhow::Result;
//!
//! struct MyKv {
//!     // Your implementation
//! }
//!
//! #[async_trait]
//! impl KeyValueStore for MyKv {
//!     async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
//!         // Your implementation
//!     }
//!
//!     async fn execute(&self, batch: &CacheBatch) -> Result<()> {
//!         // Apply every op or none
//!     }
//!
//!     // ... list_range, delete_matching, read_counter, increment,
//!     // check_and_increment, health_check
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{NewStake, OwnerId, Stake, StakeId};

/// One write inside a [`CacheBatch`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Set fields on a hash, creating it if needed
    HashSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    /// Add a member to a set
    SetAdd { key: String, member: String },
    /// Append values to the tail of a list
    ListPush { key: String, values: Vec<String> },
    /// Set the time-to-live of an existing key
    Expire { key: String, ttl: Duration },
    /// Remove a key of any type
    Delete { key: String },
}

/// Ordered group of writes applied as one indivisible unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheBatch {
    ops: Vec<BatchOp>,
}

impl CacheBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn hash_set(mut self, key: impl Into<String>, fields: Vec<(String, String)>) -> Self {
        self.ops.push(BatchOp::HashSet {
            key: key.into(),
            fields,
        });
        self
    }

    #[must_use]
    pub fn set_add(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.ops.push(BatchOp::SetAdd {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    #[must_use]
    pub fn list_push(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.ops.push(BatchOp::ListPush {
            key: key.into(),
            values,
        });
        self
    }

    #[must_use]
    pub fn expire(mut self, key: impl Into<String>, ttl: Duration) -> Self {
        self.ops.push(BatchOp::Expire {
            key: key.into(),
            ttl,
        });
        self
    }

    #[must_use]
    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.ops.push(BatchOp::Delete { key: key.into() });
        self
    }

    #[must_use]
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Outcome of one atomic check-and-increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterState {
    /// `false` when the counter was already at the limit (nothing mutated)
    pub allowed: bool,
    /// Counter value after the operation
    pub count: u64,
    /// Time until the window expires, if the counter has an expiry
    pub resets_in: Option<Duration>,
}

/// Key-value cache service used for record projections, listing pages and
/// rate counters
///
/// Implementations must be `Send + Sync`; every method is one round trip
/// (or one pipeline) against the service.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// All fields of a hash; an empty map means the key is absent
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Apply a batch of writes as one indivisible unit
    async fn execute(&self, batch: &CacheBatch) -> Result<()>;

    /// Every element of a list, or `None` when the key is absent
    async fn list_range(&self, key: &str) -> Result<Option<Vec<String>>>;

    /// Delete every key matching a glob pattern (`*` and `?`), returning
    /// how many were removed
    async fn delete_matching(&self, pattern: &str) -> Result<usize>;

    /// Value of a plain counter; an absent key reads as 0
    async fn read_counter(&self, key: &str) -> Result<u64>;

    /// Atomically add one to a persistent counter, returning the new value
    async fn increment(&self, key: &str) -> Result<u64>;

    /// Atomically: if the counter at `key` is at or above `limit`, report
    /// not-allowed without touching it; otherwise increment it and, when it
    /// went from absent to 1, expire it after `window`
    async fn check_and_increment(&self, key: &str, limit: u64, window: Duration)
        -> Result<CounterState>;

    /// Check if the service is reachable
    async fn health_check(&self) -> bool;

    /// Backend name for logging
    fn name(&self) -> &'static str {
        "unknown"
    }
}

/// Opens sessions against the relational datastore
#[async_trait]
pub trait StoreConnector: Send + Sync {
    /// Open a new session (typically a pool of connections)
    async fn connect(&self) -> Result<Arc<dyn StoreSession>>;

    fn name(&self) -> &'static str {
        "unknown"
    }
}

/// A live session against the relational datastore
///
/// Sessions are shared across concurrent requests; implementations handle
/// their own connection pooling.
#[async_trait]
pub trait StoreSession: Send + Sync {
    /// Create tables and indexes if they do not exist
    async fn initialize_schema(&self) -> Result<()>;

    /// Insert a stake and return the stored row
    async fn insert_stake(&self, stake: &NewStake) -> Result<Stake>;

    /// Load one stake by id
    async fn find_stake(&self, id: StakeId) -> Result<Option<Stake>>;

    /// An owner's stakes, newest first
    async fn select_stakes(&self, owner_id: OwnerId, limit: i64, offset: i64)
        -> Result<Vec<Stake>>;

    /// Trivial round trip
    async fn ping(&self) -> Result<()>;

    /// Release the session's resources
    async fn close(&self) -> Result<()>;
}
