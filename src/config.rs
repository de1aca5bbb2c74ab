//! Service configuration
//!
//! Everything here is fixed when the service is built; nothing is
//! overridable per request.

use std::collections::HashMap;
use std::time::Duration;

use crate::rate_limiter::{LimiterFailurePolicy, RateLimitRule, RateLimitScope};
use crate::record_cache::CachePolicy;
use crate::retry::RetryPolicy;

/// Default maximum age of a datastore session before it is renewed
pub const DEFAULT_SESSION_MAX_AGE: Duration = Duration::from_secs(30 * 60);

/// Database connection configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    /// PostgreSQL host
    pub host: String,
    /// PostgreSQL port
    pub port: u16,
    /// Database name
    pub dbname: String,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
    /// Maximum pool size
    pub max_size: usize,
    /// Wait/create timeout for pooled connections
    pub timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "stakes".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            max_size: 16,
            timeout: Duration::from_secs(10),
        }
    }
}

impl DbConfig {
    /// Read `STAKES_DB_*` environment variables, falling back to defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("STAKES_DB_HOST").unwrap_or(defaults.host),
            port: env_parse("STAKES_DB_PORT").unwrap_or(defaults.port),
            dbname: std::env::var("STAKES_DB_NAME").unwrap_or(defaults.dbname),
            user: std::env::var("STAKES_DB_USER").unwrap_or(defaults.user),
            password: std::env::var("STAKES_DB_PASSWORD").unwrap_or(defaults.password),
            max_size: env_parse("STAKES_DB_POOL_SIZE").unwrap_or(defaults.max_size),
            timeout: env_parse("STAKES_DB_TIMEOUT_SECS").map_or(defaults.timeout, Duration::from_secs),
        }
    }
}

/// Full configuration of a [`StakeService`](crate::StakeService)
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Key-value cache service URL
    pub redis_url: String,
    /// Relational datastore connection
    pub database: DbConfig,
    /// Sessions at least this old are replaced before use
    pub session_max_age: Duration,
    /// Retry discipline for datastore operations
    pub store_retry: RetryPolicy,
    /// Retry discipline for cache reads and writes
    pub cache_retry: RetryPolicy,
    /// Policy for stake record projections and listing pages
    pub stake_policy: CachePolicy,
    /// Limit and window per scope
    pub rate_limits: HashMap<RateLimitScope, RateLimitRule>,
    /// What to do when the counter store itself fails
    pub limiter_failure_policy: LimiterFailurePolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            database: DbConfig::default(),
            session_max_age: DEFAULT_SESSION_MAX_AGE,
            store_retry: RetryPolicy::STORE,
            cache_retry: RetryPolicy::CACHE,
            stake_policy: CachePolicy::STAKE_RECORD,
            rate_limits: RateLimitScope::default_rules(),
            limiter_failure_policy: LimiterFailurePolicy::FailOpen,
        }
    }
}

impl ServiceConfig {
    /// Defaults overridden by environment variables
    ///
    /// - `REDIS_URL`
    /// - `STAKES_DB_HOST`, `STAKES_DB_PORT`, `STAKES_DB_NAME`, `STAKES_DB_USER`,
    ///   `STAKES_DB_PASSWORD`, `STAKES_DB_POOL_SIZE`, `STAKES_DB_TIMEOUT_SECS`
    /// - `STAKES_SESSION_MAX_AGE_SECS`
    /// - `STAKES_RATE_LIMIT_FAIL_CLOSED` (`true`/`1` to fail closed)
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let fail_closed = std::env::var("STAKES_RATE_LIMIT_FAIL_CLOSED")
            .is_ok_and(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "yes"));

        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            database: DbConfig::from_env(),
            session_max_age: env_parse("STAKES_SESSION_MAX_AGE_SECS")
                .map_or(defaults.session_max_age, Duration::from_secs),
            limiter_failure_policy: if fail_closed {
                LimiterFailurePolicy::FailClosed
            } else {
                LimiterFailurePolicy::FailOpen
            },
            ..defaults
        }
    }

    /// Override one scope's rule
    #[must_use]
    pub fn with_rate_limit(mut self, scope: RateLimitScope, rule: RateLimitRule) -> Self {
        self.rate_limits.insert(scope, rule);
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}
