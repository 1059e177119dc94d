//! # Pool Sync SDK
//!
//! Keeps a client-side view of one account's DEX liquidity pools consistent with on-chain
//! storage, under concurrent updates, partial failures and a push-based change feed.
//!
//! ## Overview
//!
//! - **Query**: typed storage queries (prefix scans, exact keys, subscriptions) with
//!   Borsh-decoded values
//! - **Aggregation**: concurrent per-asset fan-out, inner joins of result sets and
//!   fixed-precision position math
//! - **Reconciliation**: subscription-triggered refresh, diff-based persistence that keeps
//!   the favorites/order overlay, and observer fan-out
//! - **Yield**: single-flight cache over the remote APY table
//!
//! ## Architecture
//!
//! ### Chain Layer
//! A [`connection::ChainConnection`] (JSON-RPC over WebSocket in production) and a
//! [`metadata::ChainMetadataProvider`] feed the [`storage_query::StorageQueryBuilder`].
//!
//! ### Aggregation Layer
//! [`aggregator::ChainAggregator`] builds account pools and liquidity pairs from storage and
//! exposes them through the [`aggregator::PoolDataSource`] and
//! [`aggregator::PoolChangeFeed`] seams.
//!
//! ### Sync Layer
//! [`coordinator::PoolSyncCoordinator`] owns the reconciled snapshot, persists it through a
//! [`repository::PoolRepository`] and an [`order_store::OrderStore`], and notifies
//! [`coordinator::PoolObserver`]s.

// Core Types
/// Domain records and decimal conversion
pub mod types;
/// Error taxonomy
pub mod error;

// Chain Layer
/// Connection seam and request timeout/retry policy
pub mod connection;
/// JSON-RPC over WebSocket connection
pub mod ws_connection;
/// Runtime storage schema and its provider
pub mod metadata;
/// Storage key construction and key-part recovery
pub mod storage_key;
/// Typed storage queries
pub mod storage_query;
/// Asset precision and symbol lookup
pub mod assets;

// Aggregation Layer
/// Concurrent pool aggregation and position math
pub mod aggregator;
/// Single-flight APY cache
pub mod apy_cache;

// Sync Layer
/// Per-pair primed/debounced trigger gate
pub mod debounce;
/// Pool snapshot reconciliation and subscriptions
pub mod coordinator;
/// Pool row persistence contract
pub mod repository;
/// PostgreSQL pool repository
pub mod database;
/// Persisted explicit pool order
pub mod order_store;

// Infrastructure
/// Configuration
pub mod settings;
/// Metrics helpers (no-ops without the `observability` feature)
pub mod metrics;

pub use aggregator::{ChainAggregator, PoolChangeFeed, PoolDataSource};
pub use apy_cache::ApyCache;
pub use coordinator::{PoolObserver, PoolSyncCoordinator};
pub use error::{SyncError, SyncResult};
pub use settings::Settings;
pub use storage_query::StorageQueryBuilder;
