//! PostgreSQL Datastore
//!
//! Sessions are `deadpool-postgres` pools over `tokio-postgres`. One pool is
//! one session in the sense of [`BackingStoreClient`](crate::BackingStoreClient):
//! it is shared by concurrent requests and replaced wholesale when it ages out.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::{NoTls, Row};
use tracing::{debug, info};

use crate::config::DbConfig;
use crate::error::RejectedOperation;
use crate::models::{NewStake, OwnerId, Stake, StakeId, StakePeriod};
use crate::traits::{StoreConnector, StoreSession};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS stakes (
    id BIGSERIAL PRIMARY KEY,
    owner_id BIGINT NOT NULL,
    amount DOUBLE PRECISION NOT NULL CHECK (amount > 0),
    period_months INTEGER NOT NULL CHECK (period_months IN (1, 3, 6, 12)),
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_stakes_owner_created
    ON stakes (owner_id, created_at DESC, id DESC);
";

const STAKE_COLUMNS: &str = "id, owner_id, amount, period_months, created_at";

fn create_pool(config: &DbConfig) -> Result<Pool> {
    let mut cfg = Config::new();
    cfg.host = Some(config.host.clone());
    cfg.port = Some(config.port);
    cfg.dbname = Some(config.dbname.clone());
    cfg.user = Some(config.user.clone());
    cfg.password = Some(config.password.clone());
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    let mut pool_cfg = deadpool_postgres::PoolConfig::new(config.max_size);
    pool_cfg.timeouts.wait = Some(config.timeout);
    pool_cfg.timeouts.create = Some(config.timeout);
    cfg.pool = Some(pool_cfg);

    cfg.create_pool(Some(Runtime::Tokio1), NoTls)
        .context("Failed to create PostgreSQL pool")
}

/// Opens pooled PostgreSQL sessions
#[derive(Debug, Clone)]
pub struct PostgresConnector {
    config: DbConfig,
}

impl PostgresConnector {
    #[must_use]
    pub fn new(config: DbConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl StoreConnector for PostgresConnector {
    async fn connect(&self) -> Result<Arc<dyn StoreSession>> {
        info!(host = %self.config.host, db = %self.config.dbname, "Opening PostgreSQL session");
        let pool = create_pool(&self.config)?;
        // Fail fast if the database is unreachable instead of on first query
        let _client = pool
            .get()
            .await
            .context("Failed to acquire initial PostgreSQL connection")?;
        Ok(Arc::new(PostgresSession { pool }))
    }

    fn name(&self) -> &'static str {
        "PostgreSQL"
    }
}

/// A pooled PostgreSQL session
pub struct PostgresSession {
    pool: Pool,
}

impl PostgresSession {
    async fn client(&self) -> Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .context("Failed to acquire PostgreSQL connection")
    }
}

/// Permanent SQLSTATE classes: data exceptions, integrity violations,
/// syntax/access errors
fn classify(err: tokio_postgres::Error, what: &str) -> anyhow::Error {
    let permanent = err
        .code()
        .is_some_and(|state| ["22", "23", "42"].iter().any(|class| state.code().starts_with(class)));
    if permanent {
        anyhow::Error::new(RejectedOperation::new(format!("{what}: {err}")))
    } else {
        anyhow::Error::new(err).context(what.to_string())
    }
}

fn stake_from_row(row: &Row) -> Result<Stake> {
    let months: i32 = row.try_get("period_months")?;
    let period = StakePeriod::try_from(months)
        .map_err(|e| RejectedOperation::new(format!("stored stake has invalid period: {e}")))?;
    Ok(Stake {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        amount: row.try_get("amount")?,
        period,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl StoreSession for PostgresSession {
    async fn initialize_schema(&self) -> Result<()> {
        let client = self.client().await?;
        client
            .batch_execute(SCHEMA_SQL)
            .await
            .map_err(|e| classify(e, "initialize schema"))?;
        debug!("[Postgres] Schema ready");
        Ok(())
    }

    async fn insert_stake(&self, stake: &NewStake) -> Result<Stake> {
        let client = self.client().await?;
        let sql = format!(
            "INSERT INTO stakes (owner_id, amount, period_months) VALUES ($1, $2, $3) RETURNING {STAKE_COLUMNS}"
        );
        let row = client
            .query_one(&sql, &[&stake.owner_id, &stake.amount, &stake.period.months()])
            .await
            .map_err(|e| classify(e, "insert stake"))?;
        stake_from_row(&row)
    }

    async fn find_stake(&self, id: StakeId) -> Result<Option<Stake>> {
        let client = self.client().await?;
        let sql = format!("SELECT {STAKE_COLUMNS} FROM stakes WHERE id = $1");
        let row = client
            .query_opt(&sql, &[&id])
            .await
            .map_err(|e| classify(e, "find stake"))?;
        row.as_ref().map(stake_from_row).transpose()
    }

    async fn select_stakes(
        &self,
        owner_id: OwnerId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Stake>> {
        let client = self.client().await?;
        let sql = format!(
            "SELECT {STAKE_COLUMNS} FROM stakes WHERE owner_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3"
        );
        let rows = client
            .query(&sql, &[&owner_id, &limit, &offset])
            .await
            .map_err(|e| classify(e, "select stakes"))?;
        rows.iter().map(stake_from_row).collect()
    }

    async fn ping(&self) -> Result<()> {
        let client = self.client().await?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| classify(e, "ping"))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close();
        debug!("[Postgres] Session pool closed");
        Ok(())
    }
}
