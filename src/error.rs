//! Error taxonomy shared by every layer of the sync engine.
//!
//! Errors fall into three groups:
//!
//! - **Connectivity** (`ConnectionUnavailable`, `MetadataUnavailable`, `Timeout`, `Rpc`):
//!   the whole pass is aborted and persisted state is left untouched.
//! - **Data integrity** (`Decode`, `ReservesIdNotFound`, `UnknownAsset`): scoped to a
//!   single item. Fan-out operations drop the item and keep going.
//! - **Application** (`Repository`, `Apy`, `Unexpected`): the operation fails and the
//!   error is logged by the caller.

use crate::types::{AssetId, ChainId};
use thiserror::Error;

/// Result alias used across the crate.
pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("no live connection for chain {chain_id}")]
    ConnectionUnavailable { chain_id: ChainId },

    #[error("runtime metadata for chain {chain_id} is not available")]
    MetadataUnavailable { chain_id: ChainId },

    #[error("failed to decode {what}: {reason}")]
    Decode { what: String, reason: String },

    #[error("reserves account not found for pool {base:?}/{target:?}")]
    ReservesIdNotFound { base: AssetId, target: AssetId },

    #[error("asset {0:?} is missing from the asset catalog")]
    UnknownAsset(AssetId),

    #[error("{method} timed out after {timeout_ms} ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("{method} returned rpc error {code}: {message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },

    #[error("repository error: {0}")]
    Repository(String),

    #[error("yield table fetch failed: {0}")]
    Apy(String),

    #[error("unexpected: {0}")]
    Unexpected(String),
}

impl SyncError {
    pub fn decode(what: impl Into<String>, reason: impl ToString) -> Self {
        SyncError::Decode {
            what: what.into(),
            reason: reason.to_string(),
        }
    }

    /// Connectivity failures. A pass that hits one of these aborts without writing.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionUnavailable { .. }
                | SyncError::MetadataUnavailable { .. }
                | SyncError::Timeout { .. }
                | SyncError::Rpc { .. }
        )
    }

    /// Failures that only concern one record inside a batch.
    pub fn is_item_local(&self) -> bool {
        matches!(
            self,
            SyncError::Decode { .. }
                | SyncError::ReservesIdNotFound { .. }
                | SyncError::UnknownAsset(_)
        )
    }

    /// Errors worth retrying with backoff before giving up on a request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Timeout { .. } | SyncError::ConnectionUnavailable { .. }
        )
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(e: sqlx::Error) -> Self {
        SyncError::Repository(e.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Apy(e.to_string())
    }
}
