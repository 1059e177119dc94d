//! # Chain Aggregator
//!
//! Fans storage queries out per asset, joins the result sets and derives each account's
//! position in a pool.
//!
//! Raw magnitudes are converted to decimals here, exactly once, with each asset's
//! declared precision. Per-item failures (undecodable values, unresolved reserve accounts,
//! assets missing from the catalog) drop that item from aggregate results; connectivity
//! failures abort the whole operation.

use async_trait::async_trait;
use borsh::{BorshDeserialize, BorshSerialize};
use ethers::types::{H256, U256};
use futures::stream::{self, BoxStream, StreamExt};
use indexmap::{IndexMap, IndexSet};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::assets::AssetCatalog;
use crate::connection::SubscriptionId;
use crate::error::{SyncError, SyncResult};
use crate::metadata::{
    ACCOUNT_POOLS, DEX_INFOS, ENABLED_SOURCES, POOL_PROPERTIES, POOL_PROVIDERS, POOL_RESERVES,
    TOTAL_ISSUANCES,
};
use crate::storage_key::KeyPart;
use crate::storage_query::{StorageEntry, StorageQueryBuilder};
use crate::types::conversions::raw_to_decimal;
use crate::types::{
    AccountId, AccountPool, AssetId, ChainId, LiquidityPair, PoolIdentity, ReserveSnapshot,
};

/// Precision of pool-share (LP) tokens.
pub const POOL_TOKEN_PRECISION: u32 = 18;

/// Liquidity source code of XYK pools in `TradingPair.EnabledSources`.
pub const XYK_SOURCE: u8 = 1;

#[derive(BorshDeserialize, BorshSerialize, Debug, Clone, PartialEq, Eq)]
pub struct DexInfo {
    pub base_asset_id: [u8; 32],
    pub is_public: bool,
}

/// `(reserves_account, fees_account)`
pub type PoolProperties = ([u8; 32], [u8; 32]);
/// `(reserves, fees)`
pub type PoolReservesValue = (u128, u128);

/// An account's derived position in one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolPosition {
    pub account_pool_share: Decimal,
    pub base_asset_pooled: Decimal,
    pub target_asset_pooled: Decimal,
}

/// Derives share and pooled amounts from raw on-chain magnitudes.
///
/// With `total_issuance == 0` every value is zero. The provider balance is capped at the
/// total issuance so the share stays within `[0, 100]`.
pub fn derive_position(
    provider_balance: u128,
    total_issuance: u128,
    reserves: ReserveSnapshot,
    base_precision: u32,
    target_precision: u32,
) -> SyncResult<PoolPosition> {
    if total_issuance == 0 {
        return Ok(PoolPosition::default());
    }
    let total = U256::from(total_issuance);
    let provider = U256::from(provider_balance.min(total_issuance));

    let share_raw = provider * U256::from(100u8) * U256::exp10(POOL_TOKEN_PRECISION as usize) / total;
    let base_raw = U256::from(reserves.reserves) * provider / total;
    let target_raw = U256::from(reserves.fees) * provider / total;

    let convert = |raw: U256, precision: u32| {
        raw_to_decimal(raw, precision).map_err(|e| SyncError::decode("pool position", e))
    };

    Ok(PoolPosition {
        account_pool_share: convert(share_raw, POOL_TOKEN_PRECISION)?,
        base_asset_pooled: convert(base_raw, base_precision)?,
        target_asset_pooled: convert(target_raw, target_precision)?,
    })
}

/// Remote pool data consumed by the coordinator.
#[async_trait]
pub trait PoolDataSource: Send + Sync {
    fn chain_id(&self) -> &ChainId;

    async fn list_base_assets(&self) -> SyncResult<Vec<AssetId>>;

    async fn account_pools(
        &self,
        account: &AccountId,
        base: &AssetId,
    ) -> SyncResult<Vec<AccountPool>>;

    async fn all_pairs_for_base_asset(&self, base: &AssetId) -> SyncResult<Vec<LiquidityPair>>;

    async fn is_pair_enabled(&self, base: &AssetId, target: &AssetId) -> SyncResult<bool>;

    async fn is_pair_presented_in_network(
        &self,
        base: &AssetId,
        target: &AssetId,
    ) -> SyncResult<bool>;
}

/// Storage change feed with one item per pushed change set.
pub struct ChangeStream<T> {
    pub id: SubscriptionId,
    pub events: BoxStream<'static, SyncResult<T>>,
}

/// Push notifications the coordinator subscribes to.
#[async_trait]
pub trait PoolChangeFeed: Send + Sync {
    /// Target assets of the account's pools for `base`, on every membership change.
    async fn watch_account_pools(
        &self,
        account: &AccountId,
        base: &AssetId,
    ) -> SyncResult<ChangeStream<Vec<AssetId>>>;

    /// One item per change of the pool's reserves.
    async fn watch_pool_reserves(
        &self,
        base: &AssetId,
        target: &AssetId,
    ) -> SyncResult<ChangeStream<()>>;

    async fn unwatch(&self, id: &SubscriptionId) -> SyncResult<()>;
}

pub struct ChainAggregator {
    chain_id: ChainId,
    queries: Arc<StorageQueryBuilder>,
    assets: Arc<dyn AssetCatalog>,
    max_concurrency: usize,
}

impl ChainAggregator {
    pub fn new(
        chain_id: impl Into<ChainId>,
        queries: Arc<StorageQueryBuilder>,
        assets: Arc<dyn AssetCatalog>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            chain_id: chain_id.into(),
            queries,
            assets,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Target assets the account has provided liquidity for against `base`.
    pub async fn account_targets(
        &self,
        account: &AccountId,
        base: &AssetId,
    ) -> SyncResult<Vec<AssetId>> {
        let targets: Option<Vec<[u8; 32]>> = self
            .queries
            .fetch_one(
                &self.chain_id,
                &ACCOUNT_POOLS,
                vec![KeyPart::from(account), KeyPart::from(base)],
            )
            .await?;
        Ok(targets
            .unwrap_or_default()
            .into_iter()
            .map(H256::from)
            .collect())
    }

    /// Reserve account of the pool; `ReservesIdNotFound` when the pool does not exist.
    pub async fn pool_reserves_id(&self, base: &AssetId, target: &AssetId) -> SyncResult<AccountId> {
        let properties: Option<PoolProperties> = self
            .queries
            .fetch_one(
                &self.chain_id,
                &POOL_PROPERTIES,
                vec![KeyPart::from(base), KeyPart::from(target)],
            )
            .await?;
        properties
            .map(|(reserves_account, _)| H256::from(reserves_account))
            .ok_or(SyncError::ReservesIdNotFound {
                base: *base,
                target: *target,
            })
    }

    async fn provider_balance_raw(
        &self,
        reserves_id: &AccountId,
        account: &AccountId,
    ) -> SyncResult<u128> {
        let balance: Option<u128> = self
            .queries
            .fetch_one(
                &self.chain_id,
                &POOL_PROVIDERS,
                vec![KeyPart::from(reserves_id), KeyPart::from(account)],
            )
            .await?;
        Ok(balance.unwrap_or_default())
    }

    async fn total_issuance_raw(&self, reserves_id: &AccountId) -> SyncResult<u128> {
        let total: Option<u128> = self
            .queries
            .fetch_one(
                &self.chain_id,
                &TOTAL_ISSUANCES,
                vec![KeyPart::from(reserves_id)],
            )
            .await?;
        Ok(total.unwrap_or_default())
    }

    pub async fn pool_provider_balance(
        &self,
        reserves_id: &AccountId,
        account: &AccountId,
    ) -> SyncResult<Decimal> {
        let raw = self.provider_balance_raw(reserves_id, account).await?;
        raw_to_decimal(U256::from(raw), POOL_TOKEN_PRECISION)
            .map_err(|e| SyncError::decode("provider balance", e))
    }

    pub async fn pool_total_issuance(&self, reserves_id: &AccountId) -> SyncResult<Decimal> {
        let raw = self.total_issuance_raw(reserves_id).await?;
        raw_to_decimal(U256::from(raw), POOL_TOKEN_PRECISION)
            .map_err(|e| SyncError::decode("total issuance", e))
    }

    /// Raw reserves; an absent entry reads as empty reserves.
    pub async fn pool_reserves(
        &self,
        base: &AssetId,
        target: &AssetId,
    ) -> SyncResult<ReserveSnapshot> {
        let value: Option<PoolReservesValue> = self
            .queries
            .fetch_one(
                &self.chain_id,
                &POOL_RESERVES,
                vec![KeyPart::from(base), KeyPart::from(target)],
            )
            .await?;
        Ok(value
            .map(|(reserves, fees)| ReserveSnapshot { reserves, fees })
            .unwrap_or_default())
    }

    /// Resolves the reserve account, then reads balance, issuance and reserves concurrently.
    #[instrument(skip(self), fields(chain = %self.chain_id))]
    pub async fn pool_details(
        &self,
        account: &AccountId,
        base: &AssetId,
        target: &AssetId,
    ) -> SyncResult<AccountPool> {
        let reserves_id = self.pool_reserves_id(base, target).await?;
        let (provider, total, reserves) = tokio::try_join!(
            self.provider_balance_raw(&reserves_id, account),
            self.total_issuance_raw(&reserves_id),
            self.pool_reserves(base, target),
        )?;

        let position = derive_position(
            provider,
            total,
            reserves,
            self.assets.precision(base)?,
            self.assets.precision(target)?,
        )?;

        let identity = PoolIdentity::new(*base, *target, *account);
        Ok(AccountPool {
            pool_id: identity.pool_id(),
            account_id: *account,
            chain_id: self.chain_id.clone(),
            base_asset_id: *base,
            target_asset_id: *target,
            base_asset_pooled: position.base_asset_pooled,
            target_asset_pooled: position.target_asset_pooled,
            account_pool_share: position.account_pool_share,
            reserves_id,
        })
    }

    /// Every pair of every base asset, with reserves attached.
    pub async fn get_all_pairs(&self) -> SyncResult<Vec<LiquidityPair>> {
        let bases = self.list_base_assets().await?;
        let results: Vec<SyncResult<Vec<LiquidityPair>>> = stream::iter(bases)
            .map(|base| async move { self.all_pairs_for_base_asset(&base).await })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        let mut pairs = Vec::new();
        for result in results {
            pairs.extend(result?);
        }
        pairs.sort_by(|a, b| a.pair_id.cmp(&b.pair_id));
        Ok(pairs)
    }

    fn build_pair(
        &self,
        base: &AssetId,
        target: AssetId,
        reserves_id: AccountId,
        raw: PoolReservesValue,
    ) -> SyncResult<LiquidityPair> {
        let base_precision = self.assets.precision(base)?;
        let target_precision = self.assets.precision(&target)?;
        let reserves = raw_to_decimal(U256::from(raw.0), base_precision)
            .map_err(|e| SyncError::decode("pool reserves", e))?;
        let fees = raw_to_decimal(U256::from(raw.1), target_precision)
            .map_err(|e| SyncError::decode("pool reserves", e))?;

        Ok(LiquidityPair {
            pair_id: LiquidityPair::pair_id_for(base, &target),
            chain_id: self.chain_id.clone(),
            base_asset_id: *base,
            target_asset_id: target,
            reserves_id: Some(reserves_id),
            reserves: Some(reserves),
            fees: Some(fees),
        })
    }
}

fn second_key_part<T>(entry: &StorageEntry<T>) -> SyncResult<AssetId> {
    entry
        .map_key
        .get(1)
        .ok_or_else(|| SyncError::decode("storage key", "missing target part"))
        .and_then(KeyPart::as_h256)
}

#[async_trait]
impl PoolDataSource for ChainAggregator {
    fn chain_id(&self) -> &ChainId {
        &self.chain_id
    }

    async fn list_base_assets(&self) -> SyncResult<Vec<AssetId>> {
        let dexes = self
            .queries
            .query_by_prefix_lossy::<DexInfo>(&self.chain_id, &DEX_INFOS, &[])
            .await?;
        let bases: IndexSet<AssetId> = dexes
            .into_iter()
            .filter_map(|e| e.value)
            .map(|info| H256::from(info.base_asset_id))
            .collect();
        Ok(bases.into_iter().collect())
    }

    #[instrument(skip(self), fields(chain = %self.chain_id))]
    async fn account_pools(
        &self,
        account: &AccountId,
        base: &AssetId,
    ) -> SyncResult<Vec<AccountPool>> {
        let targets = self.account_targets(account, base).await?;
        let results: Vec<SyncResult<AccountPool>> = stream::iter(targets)
            .map(|target| async move { self.pool_details(account, base, &target).await })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        let mut pools = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(pool) => pools.push(pool),
                Err(e) if e.is_item_local() => warn!(error = %e, "dropping account pool"),
                Err(e) => return Err(e),
            }
        }
        pools.sort_by(|a, b| a.target_asset_id.cmp(&b.target_asset_id));
        Ok(pools)
    }

    /// Inner join of reserve entries with resolvable reserve accounts.
    #[instrument(skip(self), fields(chain = %self.chain_id))]
    async fn all_pairs_for_base_asset(&self, base: &AssetId) -> SyncResult<Vec<LiquidityPair>> {
        let prefix = [KeyPart::from(base)];
        let (properties, reserves) = tokio::try_join!(
            self.queries.query_by_prefix_lossy::<PoolProperties>(
                &self.chain_id,
                &POOL_PROPERTIES,
                &prefix
            ),
            self.queries.query_by_prefix_lossy::<PoolReservesValue>(
                &self.chain_id,
                &POOL_RESERVES,
                &prefix
            ),
        )?;

        let mut reserve_accounts: IndexMap<AssetId, AccountId> = IndexMap::new();
        for entry in &properties {
            if let (Ok(target), Some((reserves_account, _))) = (second_key_part(entry), entry.value)
            {
                reserve_accounts.insert(target, H256::from(reserves_account));
            }
        }

        let mut pairs = Vec::with_capacity(reserves.len());
        for entry in &reserves {
            let (Ok(target), Some(raw)) = (second_key_part(entry), entry.value) else {
                continue;
            };
            let Some(reserves_id) = reserve_accounts.get(&target) else {
                debug!(target = ?target, "pair without reserves account dropped");
                continue;
            };
            match self.build_pair(base, target, *reserves_id, raw) {
                Ok(pair) => pairs.push(pair),
                Err(e) if e.is_item_local() => warn!(error = %e, "dropping pair"),
                Err(e) => return Err(e),
            }
        }
        Ok(pairs)
    }

    async fn is_pair_enabled(&self, base: &AssetId, target: &AssetId) -> SyncResult<bool> {
        let sources: Option<Vec<u8>> = self
            .queries
            .fetch_one(
                &self.chain_id,
                &ENABLED_SOURCES,
                vec![KeyPart::from(base), KeyPart::from(target)],
            )
            .await?;
        Ok(sources.map_or(false, |s| s.contains(&XYK_SOURCE)))
    }

    async fn is_pair_presented_in_network(
        &self,
        base: &AssetId,
        target: &AssetId,
    ) -> SyncResult<bool> {
        match self.pool_reserves_id(base, target).await {
            Ok(_) => Ok(true),
            Err(SyncError::ReservesIdNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl PoolChangeFeed for ChainAggregator {
    async fn watch_account_pools(
        &self,
        account: &AccountId,
        base: &AssetId,
    ) -> SyncResult<ChangeStream<Vec<AssetId>>> {
        let subscription = self
            .queries
            .subscribe::<Vec<[u8; 32]>>(
                &self.chain_id,
                &ACCOUNT_POOLS,
                &[vec![KeyPart::from(account), KeyPart::from(base)]],
            )
            .await?;
        let id = subscription.id.clone();

        let events = stream::unfold(subscription, |mut sub| async move {
            sub.next().await.map(|item| (item, sub))
        })
        .filter_map(|item| async move {
            match item {
                Ok(entries) => entries.into_iter().last().map(|entry| {
                    Ok(entry
                        .value
                        .unwrap_or_default()
                        .into_iter()
                        .map(H256::from)
                        .collect::<Vec<AssetId>>())
                }),
                Err(e) => Some(Err(e)),
            }
        })
        .boxed();

        Ok(ChangeStream { id, events })
    }

    async fn watch_pool_reserves(
        &self,
        base: &AssetId,
        target: &AssetId,
    ) -> SyncResult<ChangeStream<()>> {
        let subscription = self
            .queries
            .subscribe::<PoolReservesValue>(
                &self.chain_id,
                &POOL_RESERVES,
                &[vec![KeyPart::from(base), KeyPart::from(target)]],
            )
            .await?;
        let id = subscription.id.clone();

        let events = stream::unfold(subscription, |mut sub| async move {
            sub.next().await.map(|item| (item, sub))
        })
        .map(|item| item.map(|_| ()))
        .boxed();

        Ok(ChangeStream { id, events })
    }

    async fn unwatch(&self, id: &SubscriptionId) -> SyncResult<()> {
        self.queries.unsubscribe(&self.chain_id, id).await
    }
}
