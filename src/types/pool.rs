use ethers::types::H256;
use ethers::utils::keccak256;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::conversions::h256_to_string;

/// On-chain asset identifier (32-byte hash).
pub type AssetId = H256;
/// On-chain account identifier (32-byte public key or derived address).
pub type AccountId = H256;
/// Name of the chain a connection or record belongs to.
pub type ChainId = String;

/// Composite key of one account's position in one pool.
///
/// Stable across refreshes. Used for diffing and for the favorites/order overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolIdentity {
    pub base_asset_id: AssetId,
    pub target_asset_id: AssetId,
    pub account_id: AccountId,
}

impl PoolIdentity {
    pub fn new(base_asset_id: AssetId, target_asset_id: AssetId, account_id: AccountId) -> Self {
        Self {
            base_asset_id,
            target_asset_id,
            account_id,
        }
    }

    /// Deterministic pool id: keccak256(base ++ target ++ account).
    pub fn pool_id(&self) -> PoolId {
        let mut preimage = Vec::with_capacity(96);
        preimage.extend_from_slice(self.base_asset_id.as_bytes());
        preimage.extend_from_slice(self.target_asset_id.as_bytes());
        preimage.extend_from_slice(self.account_id.as_bytes());
        PoolId(H256::from(keccak256(preimage)))
    }
}

/// Hash of a [`PoolIdentity`]; the primary key of persisted pool rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolId(pub H256);

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&h256_to_string(&self.0))
    }
}

/// Raw reserve magnitudes of a pool prior to decimal conversion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReserveSnapshot {
    /// Base asset reserves.
    pub reserves: u128,
    /// Target asset reserves (named `fees` on chain).
    pub fees: u128,
}

/// Pool existence and topology, independent of any account.
#[derive(Debug, Clone, PartialEq)]
pub struct LiquidityPair {
    pub pair_id: String,
    pub chain_id: ChainId,
    pub base_asset_id: AssetId,
    pub target_asset_id: AssetId,
    /// Reserve account of the pool. `None` until resolved.
    pub reserves_id: Option<AccountId>,
    pub reserves: Option<Decimal>,
    pub fees: Option<Decimal>,
}

impl LiquidityPair {
    pub fn pair_id_for(base: &AssetId, target: &AssetId) -> String {
        format!("{}-{}", h256_to_string(base), h256_to_string(target))
    }
}

/// One account's position in one pool, derived fresh on every aggregation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountPool {
    pub pool_id: PoolId,
    pub account_id: AccountId,
    pub chain_id: ChainId,
    pub base_asset_id: AssetId,
    pub target_asset_id: AssetId,
    pub base_asset_pooled: Decimal,
    pub target_asset_pooled: Decimal,
    /// Percentage of the pool owned by the account, in `[0, 100]`.
    pub account_pool_share: Decimal,
    pub reserves_id: AccountId,
}

impl AccountPool {
    pub fn identity(&self) -> PoolIdentity {
        PoolIdentity::new(self.base_asset_id, self.target_asset_id, self.account_id)
    }
}

/// Persisted pool projection: an [`AccountPool`] joined with pair reserves,
/// plus the local overlay (favorite flag, order position, farms).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolInfo {
    pub pool_id: PoolId,
    pub chain_id: ChainId,
    pub account_id: AccountId,
    pub base_asset_id: AssetId,
    pub target_asset_id: AssetId,
    pub reserves_id: Option<AccountId>,
    pub base_asset_pooled: Decimal,
    pub target_asset_pooled: Decimal,
    pub account_pool_share: Decimal,
    pub base_asset_reserves: Option<Decimal>,
    pub target_asset_reserves: Option<Decimal>,
    pub is_favorite: bool,
    /// Position in the persisted explicit order list, if present there.
    pub order_index: Option<u32>,
    #[serde(default)]
    pub farms: Vec<String>,
}

impl PoolInfo {
    /// Builds a fresh row from remote data. Overlay fields get their defaults.
    pub fn from_remote(pool: &AccountPool, pair: Option<&LiquidityPair>) -> Self {
        Self {
            pool_id: pool.pool_id,
            chain_id: pool.chain_id.clone(),
            account_id: pool.account_id,
            base_asset_id: pool.base_asset_id,
            target_asset_id: pool.target_asset_id,
            reserves_id: Some(pool.reserves_id),
            base_asset_pooled: pool.base_asset_pooled,
            target_asset_pooled: pool.target_asset_pooled,
            account_pool_share: pool.account_pool_share,
            base_asset_reserves: pair.and_then(|p| p.reserves),
            target_asset_reserves: pair.and_then(|p| p.fees),
            is_favorite: true,
            order_index: None,
            farms: Vec::new(),
        }
    }

    pub fn identity(&self) -> PoolIdentity {
        PoolIdentity::new(self.base_asset_id, self.target_asset_id, self.account_id)
    }
}

/// Memoized yield of a pool's reserves. `None` means queried but not available.
#[derive(Debug, Clone, PartialEq)]
pub struct ApyEntry {
    pub reserves_id: AccountId,
    pub value: Option<Decimal>,
}
