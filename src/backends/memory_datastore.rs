//! In-Memory Datastore
//!
//! Relational stand-in for tests and local runs. Every session handed out by
//! the connector shares one table, so renewing a session never loses rows.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::SubsecRound;
use parking_lot::Mutex;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::error::RejectedOperation;
use crate::models::{NewStake, OwnerId, Stake, StakeId};
use crate::traits::{StoreConnector, StoreSession};

/// Failure to inject into upcoming datastore calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Retryable, e.g. a dropped connection
    Transient,
    /// Permanent, e.g. a constraint violation
    Rejected,
}

#[derive(Debug, Default)]
struct Table {
    rows: Vec<Stake>,
    next_id: StakeId,
    schema_ready: bool,
}

#[derive(Debug)]
struct Shared {
    table: Mutex<Table>,
    clock: Arc<dyn Clock>,
    pending_failures: Mutex<VecDeque<InjectedFailure>>,
    connect_failures: Mutex<u32>,
    connects: AtomicU64,
    closes: AtomicU64,
    operations: AtomicU64,
}

impl Shared {
    fn next_failure(&self) -> Result<()> {
        self.operations.fetch_add(1, Ordering::Relaxed);
        match self.pending_failures.lock().pop_front() {
            Some(InjectedFailure::Transient) => bail!("memory datastore: injected transient failure"),
            Some(InjectedFailure::Rejected) => Err(RejectedOperation::new(
                "memory datastore: injected permanent failure",
            )
            .into()),
            None => Ok(()),
        }
    }
}

/// In-process datastore; acts as its own [`StoreConnector`]
#[derive(Debug, Clone)]
pub struct MemoryDatastore {
    shared: Arc<Shared>,
}

impl MemoryDatastore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// `created_at` of inserted rows is read from `clock`
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(Shared {
                table: Mutex::new(Table {
                    next_id: 1,
                    ..Table::default()
                }),
                clock,
                pending_failures: Mutex::new(VecDeque::new()),
                connect_failures: Mutex::new(0),
                connects: AtomicU64::new(0),
                closes: AtomicU64::new(0),
                operations: AtomicU64::new(0),
            }),
        }
    }

    /// Make the next `count` session operations fail with `kind`
    pub fn fail_next(&self, count: usize, kind: InjectedFailure) {
        self.shared
            .pending_failures
            .lock()
            .extend(std::iter::repeat_n(kind, count));
    }

    /// Make the next `count` connection attempts fail
    pub fn fail_next_connects(&self, count: u32) {
        *self.shared.connect_failures.lock() = count;
    }

    /// Sessions opened so far
    #[must_use]
    pub fn connects(&self) -> u64 {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Sessions closed so far
    #[must_use]
    pub fn closes(&self) -> u64 {
        self.shared.closes.load(Ordering::SeqCst)
    }

    /// Session operations attempted so far (failed ones included)
    #[must_use]
    pub fn operations(&self) -> u64 {
        self.shared.operations.load(Ordering::SeqCst)
    }

    /// Rows currently stored
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.table.lock().rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryDatastore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreConnector for MemoryDatastore {
    async fn connect(&self) -> Result<Arc<dyn StoreSession>> {
        {
            let mut remaining = self.shared.connect_failures.lock();
            if *remaining > 0 {
                *remaining -= 1;
                bail!("memory datastore: injected connect failure");
            }
        }
        let generation = self.shared.connects.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(generation, "[MemoryDatastore] Session opened");
        Ok(Arc::new(MemorySession {
            shared: Arc::clone(&self.shared),
            generation,
            closed: AtomicBool::new(false),
        }))
    }

    fn name(&self) -> &'static str {
        "Memory"
    }
}

/// Session over a [`MemoryDatastore`]
#[derive(Debug)]
pub struct MemorySession {
    shared: Arc<Shared>,
    generation: u64,
    closed: AtomicBool,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("memory datastore: session {} is closed", self.generation);
        }
        Ok(())
    }
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn initialize_schema(&self) -> Result<()> {
        self.ensure_open()?;
        self.shared.next_failure()?;
        self.shared.table.lock().schema_ready = true;
        Ok(())
    }

    async fn insert_stake(&self, stake: &NewStake) -> Result<Stake> {
        self.ensure_open()?;
        self.shared.next_failure()?;
        let mut table = self.shared.table.lock();
        if !table.schema_ready {
            return Err(RejectedOperation::new("relation \"stakes\" does not exist").into());
        }
        let row = Stake {
            id: table.next_id,
            owner_id: stake.owner_id,
            amount: stake.amount,
            period: stake.period,
            // timestamptz precision
            created_at: self.shared.clock.now().trunc_subsecs(6),
        };
        table.next_id += 1;
        table.rows.push(row.clone());
        Ok(row)
    }

    async fn find_stake(&self, id: StakeId) -> Result<Option<Stake>> {
        self.ensure_open()?;
        self.shared.next_failure()?;
        let table = self.shared.table.lock();
        Ok(table.rows.iter().find(|row| row.id == id).cloned())
    }

    async fn select_stakes(
        &self,
        owner_id: OwnerId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Stake>> {
        self.ensure_open()?;
        self.shared.next_failure()?;
        let table = self.shared.table.lock();
        let mut rows: Vec<Stake> = table
            .rows
            .iter()
            .filter(|row| row.owner_id == owner_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(rows
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(0))
            .take(usize::try_from(limit).unwrap_or(0))
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_open()?;
        self.shared.next_failure()
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shared.closes.fetch_add(1, Ordering::SeqCst);
            debug!(generation = self.generation, "[MemoryDatastore] Session closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::StakePeriod;
    use std::time::Duration;

    #[tokio::test]
    async fn test_select_orders_newest_first() {
        let clock = Arc::new(ManualClock::default());
        let store = MemoryDatastore::with_clock(clock.clone());
        let session = store.connect().await.unwrap();
        session.initialize_schema().await.unwrap();

        for _ in 0..3 {
            session
                .insert_stake(&NewStake::new(7, 10.0, 3).unwrap())
                .await
                .unwrap();
            clock.advance(Duration::from_secs(1));
        }
        session
            .insert_stake(&NewStake::new(8, 10.0, 3).unwrap())
            .await
            .unwrap();

        let rows = session.select_stakes(7, 2, 0).await.unwrap();
        assert_eq!(rows.iter().map(|s| s.id).collect::<Vec<_>>(), vec![3, 2]);
        let rows = session.select_stakes(7, 2, 2).await.unwrap();
        assert_eq!(rows.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1]);
        assert_eq!(rows.first().map(|s| s.period), Some(StakePeriod::ThreeMonths));
    }

    #[tokio::test]
    async fn test_insert_requires_schema() {
        let store = MemoryDatastore::new();
        let session = store.connect().await.unwrap();
        let err = session
            .insert_stake(&NewStake::new(1, 1.0, 1).unwrap())
            .await
            .unwrap_err();
        assert!(!crate::error::is_transient(&err));
    }

    #[tokio::test]
    async fn test_closed_session_rejects_calls() {
        let store = MemoryDatastore::new();
        let session = store.connect().await.unwrap();
        session.close().await.unwrap();
        session.close().await.unwrap();

        assert!(session.ping().await.is_err());
        assert_eq!(store.closes(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed_in_order() {
        let store = MemoryDatastore::new();
        store.fail_next_connects(1);
        assert!(store.connect().await.is_err());

        let session = store.connect().await.unwrap();
        store.fail_next(1, InjectedFailure::Transient);
        store.fail_next(1, InjectedFailure::Rejected);

        let first = session.ping().await.unwrap_err();
        assert!(crate::error::is_transient(&first));
        let second = session.ping().await.unwrap_err();
        assert!(!crate::error::is_transient(&second));
        assert!(session.ping().await.is_ok());
        assert_eq!(store.connects(), 1);
    }
}
