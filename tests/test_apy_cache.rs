//! Integration tests for the single-flight APY cache
//!
//! Tests cover:
//! - Concurrent lookups share one remote fetch
//! - A failed fetch is shared by its waiters but never cached
//! - Invalidation while a fetch is in flight

mod common;

use async_trait::async_trait;
use common::{id, settle};
use pool_sync_sdk::apy_cache::{ApyCache, ApyFetcher};
use pool_sync_sdk::types::AccountId;
use pool_sync_sdk::{SyncError, SyncResult};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Fetcher that blocks until the test releases it.
struct GatedFetcher {
    calls: AtomicUsize,
    gate: Semaphore,
    fail: AtomicBool,
}

impl GatedFetcher {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            gate: Semaphore::new(0),
            fail: AtomicBool::new(false),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn release(&self) {
        self.gate.add_permits(1);
    }
}

#[async_trait]
impl ApyFetcher for GatedFetcher {
    async fn fetch_all(&self) -> SyncResult<HashMap<AccountId, Decimal>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.gate
            .acquire()
            .await
            .map_err(|e| SyncError::Apy(e.to_string()))?
            .forget();
        if self.fail.load(Ordering::SeqCst) {
            return Err(SyncError::Apy("subquery returned 502".into()));
        }
        Ok((1..=4u8).map(|i| (id(i), Decimal::from(i))).collect())
    }
}

fn spawn_lookups(
    cache: &Arc<ApyCache>,
) -> Vec<tokio::task::JoinHandle<SyncResult<Option<Decimal>>>> {
    (1..=5u8)
        .map(|i| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_apy(&id(i)).await })
        })
        .collect()
}

#[tokio::test]
async fn concurrent_lookups_share_one_fetch() {
    let fetcher = GatedFetcher::new();
    let cache = Arc::new(ApyCache::new(fetcher.clone(), None));

    let lookups = spawn_lookups(&cache);
    settle().await;
    assert_eq!(fetcher.calls(), 1, "all five lookups wait on the same fetch");

    fetcher.release();
    let mut results = Vec::new();
    for lookup in lookups {
        results.push(lookup.await.unwrap().unwrap());
    }
    assert_eq!(
        results,
        vec![
            Some(Decimal::from(1)),
            Some(Decimal::from(2)),
            Some(Decimal::from(3)),
            Some(Decimal::from(4)),
            None
        ]
    );

    // served from the cached table
    assert_eq!(cache.get_apy(&id(2)).await.unwrap(), Some(Decimal::from(2)));
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn failed_fetch_fails_every_waiter_and_is_retried_later() {
    let fetcher = GatedFetcher::new();
    fetcher.fail.store(true, Ordering::SeqCst);
    let cache = Arc::new(ApyCache::new(fetcher.clone(), None));

    let lookups = spawn_lookups(&cache);
    settle().await;
    fetcher.release();
    for lookup in lookups {
        assert!(matches!(lookup.await.unwrap(), Err(SyncError::Apy(_))));
    }
    assert_eq!(fetcher.calls(), 1);

    fetcher.fail.store(false, Ordering::SeqCst);
    fetcher.release();
    assert_eq!(cache.get_apy(&id(3)).await.unwrap(), Some(Decimal::from(3)));
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn invalidate_during_fetch_discards_its_result() {
    let fetcher = GatedFetcher::new();
    let cache = Arc::new(ApyCache::new(fetcher.clone(), None));

    let lookup = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.get_apy(&id(1)).await })
    };
    settle().await;
    cache.invalidate();
    fetcher.release();
    assert_eq!(lookup.await.unwrap().unwrap(), Some(Decimal::from(1)));

    fetcher.release();
    let entry = cache.entry(&id(4)).await.unwrap();
    assert_eq!(entry.reserves_id, id(4));
    assert_eq!(entry.value, Some(Decimal::from(4)));
    assert_eq!(fetcher.calls(), 2);
}
