//! Backing Store Client - session lifecycle and retry for the datastore
//!
//! The client owns at most one live session. A session is used until it is
//! `max_age` old; the next call after that opens a replacement, swaps it in and
//! closes the old one in the background. Requests already holding the old
//! session finish on it.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, elapsed_between};
use crate::error::{Result, StakeError, is_transient};
use crate::models::{ListQuery, NewStake, OwnerId, Stake, StakeId};
use crate::retry::{RetryPolicy, retry};
use crate::traits::{StoreConnector, StoreSession};

/// Whether a session opened at `opened_at` must be replaced at `now`
#[must_use]
pub fn is_expired(opened_at: DateTime<Utc>, now: DateTime<Utc>, max_age: Duration) -> bool {
    elapsed_between(opened_at, now) >= max_age
}

struct ActiveSession {
    session: Arc<dyn StoreSession>,
    opened_at: DateTime<Utc>,
    generation: u64,
}

/// Handle to the relational datastore
///
/// **Example**:
/// ```rust
/// use stake_cache::backends::MemoryDatastore;
/// use stake_cache::{BackingStoreClient, NewStake, SystemClock};
/// use std::sync::Arc;
///
/// # async fn example() -> stake_cache::Result<()> {
/// let client = BackingStoreClient::new(Arc::new(MemoryDatastore::new()), Arc::new(SystemClock));
/// client.initialize_schema().await?;
/// let stake = client.create_record(&NewStake::new(7, 250.0, 6)?).await?;
/// assert_eq!(client.find_record(stake.id).await?, Some(stake));
/// # Ok(())
/// # }
/// ```
pub struct BackingStoreClient {
    connector: Arc<dyn StoreConnector>,
    clock: Arc<dyn Clock>,
    max_age: Duration,
    retry: RetryPolicy,
    current: RwLock<Option<Arc<ActiveSession>>>,
    /// Held while a replacement session is being opened
    renewal: Mutex<()>,
    generations: AtomicU64,
}

impl BackingStoreClient {
    /// Client with the default session age and store retry policy
    pub fn new(connector: Arc<dyn StoreConnector>, clock: Arc<dyn Clock>) -> Self {
        Self::with_options(
            connector,
            clock,
            crate::config::DEFAULT_SESSION_MAX_AGE,
            RetryPolicy::STORE,
        )
    }

    pub fn with_options(
        connector: Arc<dyn StoreConnector>,
        clock: Arc<dyn Clock>,
        max_age: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            connector,
            clock,
            max_age,
            retry,
            current: RwLock::new(None),
            renewal: Mutex::new(()),
            generations: AtomicU64::new(0),
        }
    }

    /// Live session that is still young enough
    fn usable(&self) -> Option<Arc<dyn StoreSession>> {
        let now = self.clock.now();
        self.current
            .read()
            .as_ref()
            .filter(|active| !is_expired(active.opened_at, now, self.max_age))
            .map(|active| Arc::clone(&active.session))
    }

    /// Current session, opening or renewing it first when needed
    ///
    /// # Errors
    ///
    /// Propagates the connector's error when no session could be opened.
    pub async fn session(&self) -> anyhow::Result<Arc<dyn StoreSession>> {
        if let Some(session) = self.usable() {
            return Ok(session);
        }

        let _renewal = self.renewal.lock().await;
        // Another request may have renewed while we waited for the gate
        if let Some(session) = self.usable() {
            return Ok(session);
        }

        let session = self
            .connector
            .connect()
            .await
            .with_context(|| format!("Failed to open {} session", self.connector.name()))?;
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let fresh = Arc::new(ActiveSession {
            session: Arc::clone(&session),
            opened_at: self.clock.now(),
            generation,
        });

        let previous = self.current.write().replace(fresh);
        match previous {
            Some(old) => {
                info!(
                    backend = self.connector.name(),
                    generation,
                    replaced = old.generation,
                    "Renewed datastore session"
                );
                tokio::spawn(async move {
                    if let Err(e) = old.session.close().await {
                        warn!(generation = old.generation, error = %e, "Failed to close old datastore session");
                    }
                });
            }
            None => info!(backend = self.connector.name(), generation, "Opened datastore session"),
        }

        Ok(session)
    }

    /// Generation number of the current session, 0 before the first connect
    #[must_use]
    pub fn session_generation(&self) -> u64 {
        self.current.read().as_ref().map_or(0, |active| active.generation)
    }

    /// Run `op` against the current session under the retry policy
    ///
    /// Each attempt re-fetches the session, so a retry after the session
    /// aged out runs on the replacement.
    async fn with_session<T, F, Fut>(&self, operation: &'static str, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn StoreSession>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let op = &op;
        retry(&self.retry, operation, is_transient, |_| async move {
            let session = self.session().await?;
            op(session).await
        })
        .await
        .map_err(|exhausted| {
            error!(
                operation,
                attempts = exhausted.attempts,
                error = %exhausted.last_error,
                "Datastore operation failed"
            );
            StakeError::Store {
                operation,
                attempts: exhausted.attempts,
                source: exhausted.last_error,
            }
        })
    }

    /// Create the stakes table if it does not exist
    ///
    /// # Errors
    ///
    /// [`StakeError::Store`] once retries are exhausted.
    pub async fn initialize_schema(&self) -> Result<()> {
        self.with_session("initialize_schema", |session| async move {
            session.initialize_schema().await
        })
        .await?;
        debug!("Datastore schema initialized");
        Ok(())
    }

    /// Insert a stake and return the stored row
    ///
    /// # Errors
    ///
    /// [`StakeError::Store`] once retries are exhausted or the store rejects
    /// the row.
    pub async fn create_record(&self, stake: &NewStake) -> Result<Stake> {
        self.with_session("create_record", |session| async move {
            session.insert_stake(stake).await
        })
        .await
    }

    /// One page of an owner's stakes, newest first
    ///
    /// # Errors
    ///
    /// [`StakeError::Store`] once retries are exhausted.
    pub async fn list_records(&self, owner_id: OwnerId, query: &ListQuery) -> Result<Vec<Stake>> {
        let (limit, offset) = (query.limit(), query.offset());
        self.with_session("list_records", |session| async move {
            session.select_stakes(owner_id, limit, offset).await
        })
        .await
    }

    /// A single stake by id
    ///
    /// # Errors
    ///
    /// [`StakeError::Store`] once retries are exhausted.
    pub async fn find_record(&self, id: StakeId) -> Result<Option<Stake>> {
        self.with_session("find_record", |session| async move { session.find_stake(id).await })
            .await
    }

    /// Ping the datastore once, without retries
    pub async fn health_check(&self) -> bool {
        let session = match self.session().await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Datastore health check could not open a session");
                return false;
            }
        };
        match session.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Datastore health check failed");
                false
            }
        }
    }

    /// Close the current session; the next call opens a new one
    ///
    /// # Errors
    ///
    /// Propagates the session's close error.
    pub async fn close(&self) -> anyhow::Result<()> {
        let previous = self.current.write().take();
        if let Some(active) = previous {
            active.session.close().await?;
            info!(generation = active.generation, "Closed datastore session");
        }
        Ok(())
    }
}
