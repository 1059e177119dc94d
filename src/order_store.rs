//! Persisted explicit pool order, one ordered list of pool ids per domain.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::types::PoolId;

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn load(&self, domain: &str) -> SyncResult<Vec<PoolId>>;
    async fn store(&self, domain: &str, order: &[PoolId]) -> SyncResult<()>;
}

#[derive(Default)]
pub struct InMemoryOrderStore {
    orders: DashMap<String, Vec<PoolId>>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn load(&self, domain: &str) -> SyncResult<Vec<PoolId>> {
        Ok(self
            .orders
            .get(domain)
            .map(|o| o.value().clone())
            .unwrap_or_default())
    }

    async fn store(&self, domain: &str, order: &[PoolId]) -> SyncResult<()> {
        self.orders.insert(domain.to_string(), order.to_vec());
        Ok(())
    }
}

/// JSON file holding `{ domain: [pool_id, ...] }`. Writes go to a temp file that is
/// renamed over the target.
pub struct FileOrderStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileOrderStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    async fn read_all(&self) -> SyncResult<HashMap<String, Vec<PoolId>>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| SyncError::Repository(format!("order file is corrupt: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(SyncError::Repository(e.to_string())),
        }
    }
}

#[async_trait]
impl OrderStore for FileOrderStore {
    async fn load(&self, domain: &str) -> SyncResult<Vec<PoolId>> {
        Ok(self.read_all().await?.remove(domain).unwrap_or_default())
    }

    async fn store(&self, domain: &str, order: &[PoolId]) -> SyncResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut all = self.read_all().await?;
        all.insert(domain.to_string(), order.to_vec());

        let bytes =
            serde_json::to_vec_pretty(&all).map_err(|e| SyncError::Repository(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| SyncError::Repository(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| SyncError::Repository(e.to_string()))?;

        debug!(domain, entries = order.len(), path = %self.path.display(), "pool order stored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::H256;

    #[tokio::test]
    async fn file_store_round_trips_per_domain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("order.json");
        let store = FileOrderStore::new(&path);

        assert!(store.load("pools").await.unwrap().is_empty());

        let order = vec![PoolId(H256::repeat_byte(2)), PoolId(H256::repeat_byte(1))];
        store.store("pools", &order).await.unwrap();
        store.store("other", &order[..1]).await.unwrap();

        let reopened = FileOrderStore::new(&path);
        assert_eq!(reopened.load("pools").await.unwrap(), order);
        assert_eq!(reopened.load("other").await.unwrap().len(), 1);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_a_repository_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("order.json");
        std::fs::write(&path, b"{not json").unwrap();

        let err = FileOrderStore::new(&path).load("pools").await.unwrap_err();
        assert!(matches!(err, SyncError::Repository(_)));
    }
}
