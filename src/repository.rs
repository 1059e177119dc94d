use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::SyncResult;
use crate::types::{PoolId, PoolInfo};

/// Keyed persistent store of [`PoolInfo`] rows, partitioned by a domain string.
#[async_trait]
pub trait PoolRepository: Send + Sync {
    async fn fetch_all(&self, domain: &str) -> SyncResult<Vec<PoolInfo>>;

    /// Applies `upserts` and `deletes` as one atomic batch.
    async fn save(&self, domain: &str, upserts: &[PoolInfo], deletes: &[PoolId]) -> SyncResult<()>;
}

#[derive(Default)]
pub struct InMemoryPoolRepository {
    domains: DashMap<String, HashMap<PoolId, PoolInfo>>,
    saves: AtomicUsize,
}

impl InMemoryPoolRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `save` calls applied so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn get(&self, domain: &str, id: &PoolId) -> Option<PoolInfo> {
        self.domains.get(domain).and_then(|rows| rows.get(id).cloned())
    }
}

#[async_trait]
impl PoolRepository for InMemoryPoolRepository {
    async fn fetch_all(&self, domain: &str) -> SyncResult<Vec<PoolInfo>> {
        let mut rows: Vec<PoolInfo> = self
            .domains
            .get(domain)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default();
        rows.sort_by_key(|r| r.pool_id);
        Ok(rows)
    }

    async fn save(&self, domain: &str, upserts: &[PoolInfo], deletes: &[PoolId]) -> SyncResult<()> {
        let mut rows = self.domains.entry(domain.to_string()).or_default();
        for id in deletes {
            rows.remove(id);
        }
        for row in upserts {
            rows.insert(row.pool_id, row.clone());
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PoolIdentity;
    use ethers::types::H256;
    use rust_decimal::Decimal;

    fn row(target: u8) -> PoolInfo {
        let identity = PoolIdentity::new(H256::repeat_byte(1), H256::repeat_byte(target), H256::zero());
        PoolInfo {
            pool_id: identity.pool_id(),
            chain_id: "sora".into(),
            account_id: identity.account_id,
            base_asset_id: identity.base_asset_id,
            target_asset_id: identity.target_asset_id,
            reserves_id: None,
            base_asset_pooled: Decimal::ZERO,
            target_asset_pooled: Decimal::ZERO,
            account_pool_share: Decimal::ZERO,
            base_asset_reserves: None,
            target_asset_reserves: None,
            is_favorite: false,
            order_index: None,
            farms: vec![],
        }
    }

    #[tokio::test]
    async fn domains_are_isolated() {
        let repo = InMemoryPoolRepository::new();
        repo.save("pools", &[row(2), row(3)], &[]).await.unwrap();
        repo.save("other", &[row(4)], &[]).await.unwrap();

        assert_eq!(repo.fetch_all("pools").await.unwrap().len(), 2);
        assert_eq!(repo.fetch_all("other").await.unwrap().len(), 1);
        assert!(repo.fetch_all("empty").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_applies_upserts_and_deletes() {
        let repo = InMemoryPoolRepository::new();
        repo.save("pools", &[row(2), row(3)], &[]).await.unwrap();

        let mut updated = row(3);
        updated.is_favorite = true;
        repo.save("pools", &[updated.clone()], &[row(2).pool_id])
            .await
            .unwrap();

        let rows = repo.fetch_all("pools").await.unwrap();
        assert_eq!(rows, vec![updated]);
        assert_eq!(repo.save_count(), 2);
    }
}
