//! Domain records and raw-to-decimal conversion helpers.

pub mod conversions;
pub mod pool;

pub use pool::{
    AccountId, AccountPool, ApyEntry, AssetId, ChainId, LiquidityPair, PoolId, PoolIdentity,
    PoolInfo, ReserveSnapshot,
};
