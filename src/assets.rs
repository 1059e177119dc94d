use std::collections::HashMap;

use crate::error::{SyncError, SyncResult};
use crate::settings::AssetConfig;
use crate::types::conversions::string_to_h256;
use crate::types::AssetId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetInfo {
    pub symbol: String,
    pub precision: u32,
}

/// Resolves an asset to its declared decimal precision and display symbol.
pub trait AssetCatalog: Send + Sync {
    fn asset(&self, id: &AssetId) -> Option<AssetInfo>;

    fn precision(&self, id: &AssetId) -> SyncResult<u32> {
        self.asset(id)
            .map(|a| a.precision)
            .ok_or(SyncError::UnknownAsset(*id))
    }

    fn symbol(&self, id: &AssetId) -> Option<String> {
        self.asset(id).map(|a| a.symbol)
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticAssetCatalog {
    assets: HashMap<AssetId, AssetInfo>,
}

impl StaticAssetCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_asset(mut self, id: AssetId, symbol: impl Into<String>, precision: u32) -> Self {
        self.assets.insert(
            id,
            AssetInfo {
                symbol: symbol.into(),
                precision,
            },
        );
        self
    }

    pub fn from_settings(assets: &[AssetConfig]) -> anyhow::Result<Self> {
        let mut catalog = Self::new();
        for asset in assets {
            let id = string_to_h256(&asset.id)?;
            catalog = catalog.with_asset(id, asset.symbol.clone(), asset.precision);
        }
        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

impl AssetCatalog for StaticAssetCatalog {
    fn asset(&self, id: &AssetId) -> Option<AssetInfo> {
        self.assets.get(id).cloned()
    }
}
