//! PostgreSQL persistence of reconciled pool rows.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, Connection, Pool, Postgres, Row};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{SyncError, SyncResult};
use crate::repository::PoolRepository;
use crate::types::conversions::{h256_to_string, string_to_h256};
use crate::types::{PoolId, PoolInfo};

/// PostgreSQL connection pool type alias.
pub type DbPool = Pool<Postgres>;

const SCHEMA: &str = "pool_sync";

/// Connects with exponential backoff and makes sure the schema exists.
pub async fn connect(database_url: &str) -> Result<DbPool> {
    let mut last_err: Option<anyhow::Error> = None;
    let max_attempts: u32 = 10;
    for attempt in 1..=max_attempts {
        match PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
        {
            Ok(pool) => {
                info!(attempt, max_attempts, "connected to database");
                match initialize_database(&pool).await {
                    Ok(()) => return Ok(pool),
                    Err(e) => last_err = Some(e),
                }
            }
            Err(e) => {
                last_err = Some(e.into());
            }
        }

        let delay_ms = (500u64 << attempt.min(4)).min(8_000);
        warn!(attempt, delay_ms, "database connect failed, retrying");
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("database connect failed")))
        .context("giving up on database connection")
}

pub async fn initialize_database(pool: &DbPool) -> Result<()> {
    const MIGRATION_LOCK_ID: i64 = 0x504F_4F4C_5359_4E43; // "POOLSYNC"

    let mut conn = pool.acquire().await?;
    let mut tx = conn.begin().await?;

    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(MIGRATION_LOCK_ID)
        .execute(tx.as_mut())
        .await?;

    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", SCHEMA))
        .execute(tx.as_mut())
        .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {}.pool_infos (
            domain TEXT NOT NULL,
            pool_id TEXT NOT NULL,
            chain_id TEXT NOT NULL,
            account_id TEXT NOT NULL,
            base_asset_id TEXT NOT NULL,
            target_asset_id TEXT NOT NULL,
            reserves_id TEXT,
            base_asset_pooled TEXT NOT NULL,
            target_asset_pooled TEXT NOT NULL,
            account_pool_share TEXT NOT NULL,
            base_asset_reserves TEXT,
            target_asset_reserves TEXT,
            is_favorite BOOLEAN NOT NULL,
            order_index INTEGER,
            farms TEXT NOT NULL DEFAULT '[]',
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (domain, pool_id)
        )",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    tx.commit().await?;
    info!("database schema ready");
    Ok(())
}

fn parse_decimal(column: &str, raw: &str) -> SyncResult<Decimal> {
    Decimal::from_str(raw).map_err(|e| SyncError::Repository(format!("{column}: {e}")))
}

fn parse_id(column: &str, raw: &str) -> SyncResult<ethers::types::H256> {
    string_to_h256(raw).map_err(|e| SyncError::Repository(format!("{column}: {e}")))
}

fn row_to_pool_info(row: &sqlx::postgres::PgRow) -> SyncResult<PoolInfo> {
    let text = |c: &str| row.try_get::<String, _>(c).map_err(SyncError::from);
    let opt_text = |c: &str| row.try_get::<Option<String>, _>(c).map_err(SyncError::from);

    let reserves_id = opt_text("reserves_id")?
        .map(|s| parse_id("reserves_id", &s))
        .transpose()?;
    let base_reserves = opt_text("base_asset_reserves")?
        .map(|s| parse_decimal("base_asset_reserves", &s))
        .transpose()?;
    let target_reserves = opt_text("target_asset_reserves")?
        .map(|s| parse_decimal("target_asset_reserves", &s))
        .transpose()?;
    let farms: Vec<String> = serde_json::from_str(&text("farms")?)
        .map_err(|e| SyncError::Repository(format!("farms: {e}")))?;
    let order_index: Option<i32> = row.try_get("order_index")?;

    Ok(PoolInfo {
        pool_id: PoolId(parse_id("pool_id", &text("pool_id")?)?),
        chain_id: text("chain_id")?,
        account_id: parse_id("account_id", &text("account_id")?)?,
        base_asset_id: parse_id("base_asset_id", &text("base_asset_id")?)?,
        target_asset_id: parse_id("target_asset_id", &text("target_asset_id")?)?,
        reserves_id,
        base_asset_pooled: parse_decimal("base_asset_pooled", &text("base_asset_pooled")?)?,
        target_asset_pooled: parse_decimal("target_asset_pooled", &text("target_asset_pooled")?)?,
        account_pool_share: parse_decimal("account_pool_share", &text("account_pool_share")?)?,
        base_asset_reserves: base_reserves,
        target_asset_reserves: target_reserves,
        is_favorite: row.try_get("is_favorite")?,
        order_index: order_index.and_then(|i| u32::try_from(i).ok()),
        farms,
    })
}

/// [`PoolRepository`] over PostgreSQL. Decimals are stored as TEXT so no precision is lost.
pub struct PgPoolRepository {
    pool: DbPool,
}

impl PgPoolRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        Ok(Self::new(connect(database_url).await?))
    }
}

#[async_trait]
impl PoolRepository for PgPoolRepository {
    async fn fetch_all(&self, domain: &str) -> SyncResult<Vec<PoolInfo>> {
        let rows = sqlx::query(&format!(
            "SELECT pool_id, chain_id, account_id, base_asset_id, target_asset_id, reserves_id,
                    base_asset_pooled, target_asset_pooled, account_pool_share,
                    base_asset_reserves, target_asset_reserves, is_favorite, order_index, farms
             FROM {}.pool_infos WHERE domain = $1 ORDER BY pool_id",
            SCHEMA
        ))
        .bind(domain)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_pool_info).collect()
    }

    async fn save(&self, domain: &str, upserts: &[PoolInfo], deletes: &[PoolId]) -> SyncResult<()> {
        if upserts.is_empty() && deletes.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;

        for id in deletes {
            sqlx::query(&format!(
                "DELETE FROM {}.pool_infos WHERE domain = $1 AND pool_id = $2",
                SCHEMA
            ))
            .bind(domain)
            .bind(h256_to_string(&id.0))
            .execute(&mut *tx)
            .await?;
        }

        for info in upserts {
            let farms = serde_json::to_string(&info.farms)
                .map_err(|e| SyncError::Repository(e.to_string()))?;
            sqlx::query(&format!(
                "INSERT INTO {}.pool_infos (
                    domain, pool_id, chain_id, account_id, base_asset_id, target_asset_id,
                    reserves_id, base_asset_pooled, target_asset_pooled, account_pool_share,
                    base_asset_reserves, target_asset_reserves, is_favorite, order_index, farms,
                    updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, NOW())
                ON CONFLICT (domain, pool_id) DO UPDATE SET
                    reserves_id = EXCLUDED.reserves_id,
                    base_asset_pooled = EXCLUDED.base_asset_pooled,
                    target_asset_pooled = EXCLUDED.target_asset_pooled,
                    account_pool_share = EXCLUDED.account_pool_share,
                    base_asset_reserves = EXCLUDED.base_asset_reserves,
                    target_asset_reserves = EXCLUDED.target_asset_reserves,
                    is_favorite = EXCLUDED.is_favorite,
                    order_index = EXCLUDED.order_index,
                    farms = EXCLUDED.farms,
                    updated_at = NOW()",
                SCHEMA
            ))
            .bind(domain)
            .bind(h256_to_string(&info.pool_id.0))
            .bind(&info.chain_id)
            .bind(h256_to_string(&info.account_id))
            .bind(h256_to_string(&info.base_asset_id))
            .bind(h256_to_string(&info.target_asset_id))
            .bind(info.reserves_id.as_ref().map(h256_to_string))
            .bind(info.base_asset_pooled.to_string())
            .bind(info.target_asset_pooled.to_string())
            .bind(info.account_pool_share.to_string())
            .bind(info.base_asset_reserves.map(|d| d.to_string()))
            .bind(info.target_asset_reserves.map(|d| d.to_string()))
            .bind(info.is_favorite)
            .bind(info.order_index.and_then(|i| i32::try_from(i).ok()))
            .bind(farms)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
