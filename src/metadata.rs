//! Runtime storage schema: which storage items exist, how their map keys are hashed,
//! and where that schema comes from for a given chain.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{SyncError, SyncResult};
use crate::types::ChainId;

/// How one map key part is folded into the storage key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageHasher {
    /// Raw bytes.
    Identity,
    /// `keccak256(part)[..16] ++ part`. The raw part stays recoverable.
    Keccak128Concat,
}

impl StorageHasher {
    /// Bytes the hasher prepends in front of the raw part.
    pub fn prefix_len(&self) -> usize {
        match self {
            StorageHasher::Identity => 0,
            StorageHasher::Keccak128Concat => 16,
        }
    }
}

/// Hasher and encoded length of one key part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageKeySpec {
    pub hasher: StorageHasher,
    pub len: usize,
}

impl StorageKeySpec {
    pub const fn account(hasher: StorageHasher) -> Self {
        Self { hasher, len: 32 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoragePath {
    pub pallet: &'static str,
    pub item: &'static str,
}

impl StoragePath {
    pub const fn new(pallet: &'static str, item: &'static str) -> Self {
        Self { pallet, item }
    }
}

pub const DEX_INFOS: StoragePath = StoragePath::new("DexManager", "DexInfos");
pub const POOL_PROPERTIES: StoragePath = StoragePath::new("PoolXyk", "Properties");
pub const POOL_RESERVES: StoragePath = StoragePath::new("PoolXyk", "Reserves");
pub const ACCOUNT_POOLS: StoragePath = StoragePath::new("PoolXyk", "AccountPools");
pub const POOL_PROVIDERS: StoragePath = StoragePath::new("PoolXyk", "PoolProviders");
pub const TOTAL_ISSUANCES: StoragePath = StoragePath::new("PoolXyk", "TotalIssuances");
pub const ENABLED_SOURCES: StoragePath = StoragePath::new("TradingPair", "EnabledSources");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEntrySchema {
    pub keys: Vec<StorageKeySpec>,
}

/// Decode schema of one chain runtime.
#[derive(Debug, Clone, Default)]
pub struct RuntimeSchema {
    entries: HashMap<StoragePath, StorageEntrySchema>,
}

impl RuntimeSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, path: StoragePath, keys: Vec<StorageKeySpec>) -> Self {
        self.entries.insert(path, StorageEntrySchema { keys });
        self
    }

    pub fn entry(&self, path: &StoragePath) -> SyncResult<&StorageEntrySchema> {
        self.entries.get(path).ok_or_else(|| {
            SyncError::Unexpected(format!(
                "storage item {}.{} missing from runtime schema",
                path.pallet, path.item
            ))
        })
    }

    /// Schema of the XYK pool pallets as deployed on SORA-style runtimes.
    pub fn pool_xyk() -> Self {
        let hashed = StorageKeySpec::account(StorageHasher::Keccak128Concat);
        Self::new()
            .with_entry(
                DEX_INFOS,
                vec![StorageKeySpec {
                    hasher: StorageHasher::Identity,
                    len: 4,
                }],
            )
            .with_entry(POOL_PROPERTIES, vec![hashed, hashed])
            .with_entry(POOL_RESERVES, vec![hashed, hashed])
            .with_entry(ACCOUNT_POOLS, vec![hashed, hashed])
            .with_entry(POOL_PROVIDERS, vec![hashed, hashed])
            .with_entry(TOTAL_ISSUANCES, vec![hashed])
            .with_entry(ENABLED_SOURCES, vec![hashed, hashed])
    }
}

/// Supplies the current decode schema of a chain.
#[async_trait]
pub trait ChainMetadataProvider: Send + Sync {
    /// Fails with `MetadataUnavailable` until the schema for `chain` is known.
    async fn schema(&self, chain: &ChainId) -> SyncResult<Arc<RuntimeSchema>>;
}

/// Metadata provider backed by schemas installed at startup or after a runtime fetch.
#[derive(Default)]
pub struct StaticMetadataProvider {
    schemas: DashMap<ChainId, Arc<RuntimeSchema>>,
}

impl StaticMetadataProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, chain: impl Into<ChainId>, schema: RuntimeSchema) {
        self.schemas.insert(chain.into(), Arc::new(schema));
    }

    pub fn with_schema(chain: impl Into<ChainId>, schema: RuntimeSchema) -> Self {
        let provider = Self::new();
        provider.install(chain, schema);
        provider
    }
}

#[async_trait]
impl ChainMetadataProvider for StaticMetadataProvider {
    async fn schema(&self, chain: &ChainId) -> SyncResult<Arc<RuntimeSchema>> {
        self.schemas
            .get(chain)
            .map(|s| s.value().clone())
            .ok_or_else(|| SyncError::MetadataUnavailable {
                chain_id: chain.clone(),
            })
    }
}
