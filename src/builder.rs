//! Stake Service Builder
//!
//! Assembles a [`StakeService`] from a [`ServiceConfig`] and optional custom
//! backends.
//!
//! # Example: Using Default Backends
//!
//! ```rust,no_run
//! use stake_cache::StakeServiceBuilder;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Redis + PostgreSQL, configured from the environment
//!     let service = StakeServiceBuilder::from_env().build().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Example: In-Memory Backends
//!
//! ```rust
//! use stake_cache::StakeServiceBuilder;
//! use stake_cache::backends::{MemoryDatastore, MemoryStore};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let service = StakeServiceBuilder::new()
//!     .with_kv_store(Arc::new(MemoryStore::new()))
//!     .with_connector(Arc::new(MemoryDatastore::new()))
//!     .build()
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::ServiceConfig;
use crate::stake_service::StakeService;
use crate::store_client::BackingStoreClient;
use crate::traits::{KeyValueStore, StoreConnector};

/// Builder for [`StakeService`]
///
/// # Default Behavior
///
/// Backends not provided explicitly are created from the config:
/// - **Key-value store**: `RedisStore` at `config.redis_url` (feature `redis`)
/// - **Datastore**: `PostgresConnector` over `config.database` (feature `postgres`)
/// - **Clock**: [`SystemClock`]
///
/// The datastore schema is created during `build()` unless
/// [`skip_schema_init`](Self::skip_schema_init) is called.
pub struct StakeServiceBuilder {
    config: ServiceConfig,
    kv: Option<Arc<dyn KeyValueStore>>,
    connector: Option<Arc<dyn StoreConnector>>,
    clock: Option<Arc<dyn Clock>>,
    init_schema: bool,
}

impl StakeServiceBuilder {
    /// Builder over [`ServiceConfig::default`]
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: ServiceConfig::default(),
            kv: None,
            connector: None,
            clock: None,
            init_schema: true,
        }
    }

    /// Builder over [`ServiceConfig::from_env`]
    #[must_use]
    pub fn from_env() -> Self {
        Self::new().with_config(ServiceConfig::from_env())
    }

    #[must_use]
    pub fn with_config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom key-value store instead of Redis
    #[must_use]
    pub fn with_kv_store(mut self, kv: Arc<dyn KeyValueStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    /// Use a custom datastore connector instead of PostgreSQL
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn StoreConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Do not create the schema during `build()`
    #[must_use]
    pub fn skip_schema_init(mut self) -> Self {
        self.init_schema = false;
        self
    }

    /// Build the service
    ///
    /// # Errors
    ///
    /// Fails when a default backend cannot be created (unreachable Redis,
    /// disabled feature) or when schema creation fails.
    pub async fn build(self) -> Result<StakeService> {
        info!("Building stake service...");

        let kv: Arc<dyn KeyValueStore> = match self.kv {
            Some(kv) => {
                info!(backend = kv.name(), "Using custom key-value store");
                kv
            }
            None => default_kv_store(&self.config).await?,
        };

        let connector: Arc<dyn StoreConnector> = match self.connector {
            Some(connector) => {
                info!(backend = connector.name(), "Using custom datastore connector");
                connector
            }
            None => default_connector(&self.config)?,
        };

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);

        let store = Arc::new(BackingStoreClient::with_options(
            connector,
            Arc::clone(&clock),
            self.config.session_max_age,
            self.config.store_retry,
        ));
        if self.init_schema {
            store.initialize_schema().await?;
        }

        let service = StakeService::new(kv, store, clock, &self.config);
        info!(
            session_max_age_secs = self.config.session_max_age.as_secs(),
            limiter_failure_policy = ?self.config.limiter_failure_policy,
            "Stake service built successfully"
        );
        Ok(service)
    }
}

impl Default for StakeServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "redis")]
async fn default_kv_store(config: &ServiceConfig) -> Result<Arc<dyn KeyValueStore>> {
    info!("Using default key-value store (Redis)");
    Ok(Arc::new(crate::backends::RedisStore::with_url(&config.redis_url).await?))
}

#[cfg(not(feature = "redis"))]
async fn default_kv_store(_config: &ServiceConfig) -> Result<Arc<dyn KeyValueStore>> {
    anyhow::bail!("no key-value store configured and the `redis` feature is disabled")
}

#[cfg(feature = "postgres")]
fn default_connector(config: &ServiceConfig) -> Result<Arc<dyn StoreConnector>> {
    info!("Using default datastore (PostgreSQL)");
    Ok(Arc::new(crate::backends::PostgresConnector::new(config.database.clone())))
}

#[cfg(not(feature = "postgres"))]
fn default_connector(_config: &ServiceConfig) -> Result<Arc<dyn StoreConnector>> {
    anyhow::bail!("no datastore connector configured and the `postgres` feature is disabled")
}
