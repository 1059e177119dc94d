//! # APY Cache
//!
//! Maps a pool's reserve account to its annualized yield. The first lookup fetches the whole
//! yield table in one remote call; later lookups are served from memory.
//!
//! Concurrent lookups while a fetch is in flight share that fetch (single flight) and all
//! receive its result. A failed fetch is handed to every waiter but is not cached, so the
//! next lookup retries. With a TTL configured, an expired table is refetched on the next
//! lookup; without one the table lives until [`ApyCache::invalidate`] or process exit.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::metrics;
use crate::types::conversions::string_to_h256;
use crate::types::{AccountId, ApyEntry};

pub type ApyTable = Arc<HashMap<AccountId, Decimal>>;

/// Source of the full yield table.
#[async_trait]
pub trait ApyFetcher: Send + Sync {
    async fn fetch_all(&self) -> SyncResult<HashMap<AccountId, Decimal>>;
}

type InFlightFetch = Shared<BoxFuture<'static, SyncResult<ApyTable>>>;

enum CacheState {
    Empty,
    InFlight { generation: u64, fetch: InFlightFetch },
    Ready { table: ApyTable, fetched_at: Instant },
}

struct Inner {
    state: CacheState,
    generation: u64,
}

pub struct ApyCache {
    fetcher: Arc<dyn ApyFetcher>,
    ttl: Option<Duration>,
    inner: Mutex<Inner>,
}

impl ApyCache {
    pub fn new(fetcher: Arc<dyn ApyFetcher>, ttl: Option<Duration>) -> Self {
        Self {
            fetcher,
            ttl,
            inner: Mutex::new(Inner {
                state: CacheState::Empty,
                generation: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Yield of the pool whose reserves live at `reserves_id`. `None` when the table
    /// has no entry for it.
    pub async fn get_apy(&self, reserves_id: &AccountId) -> SyncResult<Option<Decimal>> {
        let table = self.table().await?;
        Ok(table.get(reserves_id).copied())
    }

    pub async fn entry(&self, reserves_id: &AccountId) -> SyncResult<ApyEntry> {
        Ok(ApyEntry {
            reserves_id: *reserves_id,
            value: self.get_apy(reserves_id).await?,
        })
    }

    /// Drops the cached table. An in-flight fetch still completes for its waiters but
    /// its result is not stored.
    pub fn invalidate(&self) {
        let mut inner = self.lock();
        inner.generation += 1;
        inner.state = CacheState::Empty;
    }

    async fn table(&self) -> SyncResult<ApyTable> {
        let (generation, fetch) = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            match &inner.state {
                CacheState::Ready { table, fetched_at } if !self.expired(*fetched_at) => {
                    metrics::increment_cache_hit("apy");
                    return Ok(table.clone());
                }
                CacheState::InFlight { generation, fetch } => {
                    metrics::increment_cache_hit("apy_inflight");
                    (*generation, fetch.clone())
                }
                _ => {
                    metrics::increment_cache_miss("apy");
                    inner.generation += 1;
                    let generation = inner.generation;
                    let fetcher = self.fetcher.clone();
                    let fetch = async move {
                        debug!("fetching yield table");
                        fetcher.fetch_all().await.map(Arc::new)
                    }
                    .boxed()
                    .shared();
                    inner.state = CacheState::InFlight {
                        generation,
                        fetch: fetch.clone(),
                    };
                    (generation, fetch)
                }
            }
        };

        let result = fetch.await;

        let mut inner = self.lock();
        let current = matches!(
            inner.state,
            CacheState::InFlight { generation: g, .. } if g == generation
        );
        if current {
            inner.state = match &result {
                Ok(table) => {
                    info!(entries = table.len(), "yield table cached");
                    CacheState::Ready {
                        table: table.clone(),
                        fetched_at: Instant::now(),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "yield table fetch failed");
                    CacheState::Empty
                }
            };
        }
        result
    }

    fn expired(&self, fetched_at: Instant) -> bool {
        self.ttl.map_or(false, |ttl| fetched_at.elapsed() >= ttl)
    }
}

const POOLS_QUERY: &str = r#"
query Pools($after: Cursor) {
  pools(first: 500, after: $after) {
    nodes { reservesId apy }
    pageInfo { hasNextPage endCursor }
  }
}"#;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApyNode {
    reserves_id: String,
    apy: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PoolsPage {
    nodes: Vec<ApyNode>,
    page_info: Option<PageInfo>,
}

/// Parses one GraphQL page into `(reserves_id, apy)` rows and the next cursor.
/// Rows with an unparsable id or no value are skipped.
fn parse_page(body: Value) -> SyncResult<(Vec<(AccountId, Decimal)>, Option<String>)> {
    if let Some(errors) = body.get("errors") {
        return Err(SyncError::Apy(format!("graphql errors: {errors}")));
    }
    let pools = body
        .get("data")
        .and_then(|d| d.get("pools"))
        .cloned()
        .ok_or_else(|| SyncError::Apy("response has no data.pools".into()))?;
    let page: PoolsPage =
        serde_json::from_value(pools).map_err(|e| SyncError::Apy(e.to_string()))?;

    let mut rows = Vec::with_capacity(page.nodes.len());
    for node in page.nodes {
        let Some(apy) = node.apy else { continue };
        match string_to_h256(&node.reserves_id) {
            Ok(id) => rows.push((id, apy)),
            Err(e) => debug!(error = %e, "skipping yield row"),
        }
    }

    let next = page
        .page_info
        .filter(|p| p.has_next_page)
        .and_then(|p| p.end_cursor);
    Ok((rows, next))
}

/// Fetches the yield table from a SubQuery-style GraphQL endpoint.
pub struct SubqueryApyFetcher {
    client: reqwest::Client,
    endpoint: String,
}

impl SubqueryApyFetcher {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl ApyFetcher for SubqueryApyFetcher {
    async fn fetch_all(&self) -> SyncResult<HashMap<AccountId, Decimal>> {
        let mut table = HashMap::new();
        let mut after: Option<String> = None;

        loop {
            let body: Value = self
                .client
                .post(&self.endpoint)
                .json(&json!({ "query": POOLS_QUERY, "variables": { "after": after } }))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            let (rows, next) = parse_page(body)?;
            table.extend(rows);
            match next {
                Some(cursor) => after = Some(cursor),
                None => break,
            }
        }
        Ok(table)
    }
}
