//! Redis Store - Distributed Key-Value Backend
//!
//! Redis-backed implementation of [`KeyValueStore`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::{debug, info};

use crate::traits::{BatchOp, CacheBatch, CounterState, KeyValueStore};

/// Check-and-increment with conditional expiry, executed server-side
///
/// Returns `{allowed, count, ttl_ms}`; `ttl_ms` is Redis' `PTTL` reply (-1
/// for no expiry, -2 for a missing key). The window is in milliseconds.
const CHECK_AND_INCREMENT_SCRIPT: &str = r"
local limit = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current >= limit then
  return {0, current, redis.call('PTTL', KEYS[1])}
end
current = redis.call('INCR', KEYS[1])
if current == 1 then
  redis.call('PEXPIRE', KEYS[1], window_ms)
end
return {1, current, redis.call('PTTL', KEYS[1])}
";

/// Redis key-value store with `ConnectionManager` for automatic reconnection
///
/// This is the default cache service backend, providing:
/// - Shared state across every instance of the service
/// - Automatic reconnection via `ConnectionManager`
/// - MULTI/EXEC pipelines for atomic batches
/// - Cursor-based pattern deletes (SCAN, never KEYS)
/// - A server-side Lua script for the rate-limit counter
pub struct RedisStore {
    /// Redis connection manager - handles reconnection automatically
    conn_manager: ConnectionManager,
    counter_script: Script,
    /// Hit counter
    hits: Arc<AtomicU64>,
    /// Miss counter
    misses: Arc<AtomicU64>,
    /// Batch counter
    batches: Arc<AtomicU64>,
}

impl RedisStore {
    /// Create new Redis store from `REDIS_URL` (default `redis://127.0.0.1:6379`)
    /// # Errors
    ///
    /// Returns an error if the Redis client cannot be created or connection fails.
    pub async fn new() -> Result<Self> {
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        Self::with_url(&redis_url).await
    }

    /// Create new Redis store with custom URL
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection string (e.g., `<redis://localhost:6379>`)
    /// # Errors
    ///
    /// Returns an error if the Redis client cannot be created or connection fails.
    pub async fn with_url(redis_url: &str) -> Result<Self> {
        info!(redis_url = %redis_url, "Initializing Redis store with ConnectionManager");

        let client = Client::open(redis_url)
            .with_context(|| format!("Failed to create Redis client with URL: {redis_url}"))?;

        let conn_manager = ConnectionManager::new(client)
            .await
            .context("Failed to establish Redis connection manager")?;

        let mut conn = conn_manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis PING health check failed")?;

        info!(redis_url = %redis_url, "Redis store connected successfully");

        Ok(Self {
            conn_manager,
            counter_script: Script::new(CHECK_AND_INCREMENT_SCRIPT),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            batches: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Scan keys matching a pattern (glob-style: *, ?, [])
    ///
    /// Uses Redis SCAN command (non-blocking, cursor-based iteration)
    /// This is safe for production use, unlike KEYS command.
    /// # Errors
    ///
    /// Returns an error if the Redis command fails.
    pub async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn_manager.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            // SCAN cursor MATCH pattern COUNT 100
            let result: (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;

            cursor = result.0;
            keys.extend(result.1);

            if cursor == 0 {
                break;
            }
        }

        debug!(pattern = %pattern, count = keys.len(), "[Redis] Scanned keys matching pattern");
        Ok(keys)
    }

    /// Remove multiple keys at once (bulk delete)
    /// # Errors
    ///
    /// Returns an error if the Redis command fails.
    pub async fn remove_bulk(&self, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn_manager.clone();
        let count: usize = conn.del(keys).await?;
        debug!(count = count, "[Redis] Removed keys in bulk");
        Ok(count)
    }

    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    // PEXPIRE 0 deletes the key; keep at least one millisecond
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Translate a batch into one MULTI/EXEC pipeline
fn build_pipeline(batch: &CacheBatch) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic();

    for op in batch.ops() {
        match op {
            BatchOp::HashSet { key, fields } => {
                let cmd = pipe.cmd("HSET").arg(key);
                for (field, value) in fields {
                    cmd.arg(field).arg(value);
                }
                cmd.ignore();
            }
            BatchOp::SetAdd { key, member } => {
                pipe.cmd("SADD").arg(key).arg(member).ignore();
            }
            BatchOp::ListPush { key, values } => {
                if !values.is_empty() {
                    pipe.cmd("RPUSH").arg(key).arg(values).ignore();
                }
            }
            BatchOp::Expire { key, ttl } => {
                pipe.cmd("PEXPIRE").arg(key).arg(ttl_millis(*ttl)).ignore();
            }
            BatchOp::Delete { key } => {
                pipe.cmd("DEL").arg(key).ignore();
            }
        }
    }

    pipe
}

// ===== Trait Implementations =====

use async_trait::async_trait;

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn_manager.clone();

        let fields: HashMap<String, String> = conn
            .hgetall(key)
            .await
            .with_context(|| format!("HGETALL {key} failed"))?;
        if fields.is_empty() {
            self.misses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(fields)
    }

    async fn execute(&self, batch: &CacheBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn_manager.clone();
        let pipe = build_pipeline(batch);
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .context("Redis MULTI/EXEC batch failed")?;

        self.batches.fetch_add(1, Ordering::Relaxed);
        debug!(ops = batch.ops().len(), "[Redis] Executed atomic batch");
        Ok(())
    }

    async fn list_range(&self, key: &str) -> Result<Option<Vec<String>>> {
        let mut conn = self.conn_manager.clone();

        let items: Vec<String> = conn
            .lrange(key, 0, -1)
            .await
            .with_context(|| format!("LRANGE {key} failed"))?;
        // Redis never stores an empty list, so empty means absent
        if items.is_empty() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            Ok(None)
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
            Ok(Some(items))
        }
    }

    async fn delete_matching(&self, pattern: &str) -> Result<usize> {
        let keys = self.scan_keys(pattern).await?;
        self.remove_bulk(&keys).await
    }

    async fn read_counter(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn_manager.clone();

        let value: Option<u64> = conn
            .get(key)
            .await
            .with_context(|| format!("GET {key} failed"))?;
        Ok(value.unwrap_or(0))
    }

    async fn increment(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn_manager.clone();

        let value: u64 = conn
            .incr(key, 1)
            .await
            .with_context(|| format!("INCR {key} failed"))?;
        Ok(value)
    }

    async fn check_and_increment(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<CounterState> {
        let mut conn = self.conn_manager.clone();

        let (allowed, count, ttl_ms): (i64, i64, i64) = self
            .counter_script
            .key(key)
            .arg(limit)
            .arg(ttl_millis(window))
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("rate counter script failed for {key}"))?;

        Ok(CounterState {
            allowed: allowed == 1,
            count: count.unsigned_abs(),
            resets_in: (ttl_ms > 0).then(|| Duration::from_millis(ttl_ms.unsigned_abs())),
        })
    }

    async fn health_check(&self) -> bool {
        let mut conn = self.conn_manager.clone();
        let reply: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        reply.is_ok_and(|reply| reply == "PONG")
    }

    fn name(&self) -> &'static str {
        "Redis"
    }
}
