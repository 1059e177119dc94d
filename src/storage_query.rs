//! # Storage Query Builder
//!
//! Builds typed storage queries against a chain and decodes their Borsh-encoded values.
//!
//! Three query shapes are supported:
//!
//! - **Prefix scan** ([`StorageQueryBuilder::query_by_prefix`]): every entry under a partial
//!   map key, paged through `state_getKeysPaged`.
//! - **Exact** ([`StorageQueryBuilder::query_exact`]): point lookups for N full map keys.
//!   Duplicate keys are coalesced and the rest are fetched in chunks concurrently.
//! - **Subscription** ([`StorageQueryBuilder::subscribe`]): a decoded change stream for a
//!   set of full keys.
//!
//! Failures come back as [`SyncError`] values: `ConnectionUnavailable` when the chain
//! has no live connection, `MetadataUnavailable` before its schema is known, and
//! `Decode` when bytes do not match the expected type.

use borsh::BorshDeserialize;
use futures::future::try_join_all;
use indexmap::IndexMap;
use serde_json::{json, Value};
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::connection::{
    ChainConnection, ChainConnectionProvider, RequestPolicy, SubscriptionEvent, SubscriptionId,
};
use crate::error::{SyncError, SyncResult};
use crate::metadata::{ChainMetadataProvider, StorageEntrySchema, StoragePath};
use crate::settings::Storage;
use crate::storage_key::{KeyPart, StorageKey};
use crate::types::ChainId;

pub const GET_KEYS_PAGED: &str = "state_getKeysPaged";
pub const QUERY_STORAGE_AT: &str = "state_queryStorageAt";
pub const SUBSCRIBE_STORAGE: &str = "state_subscribeStorage";
pub const UNSUBSCRIBE_STORAGE: &str = "state_unsubscribeStorage";

/// One decoded storage entry. `value` is `None` when the key holds no value.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageEntry<T> {
    pub key: StorageKey,
    /// Raw map key parts recovered from `key`.
    pub map_key: Vec<KeyPart>,
    pub value: Option<T>,
}

/// Raw `(key, value)` pairs as returned by the node.
type RawChanges = Vec<(StorageKey, Option<Vec<u8>>)>;

pub fn decode_value<T: BorshDeserialize>(what: &str, bytes: &[u8]) -> SyncResult<T> {
    T::try_from_slice(bytes).map_err(|e| SyncError::decode(what, e))
}

fn decode_hex(what: &str, s: &str) -> SyncResult<Vec<u8>> {
    hex::decode(s.strip_prefix("0x").unwrap_or(s)).map_err(|e| SyncError::decode(what, e))
}

/// Parses `{ "changes": [[key, value|null], ...] }` (one change set).
fn parse_change_set(set: &Value, out: &mut RawChanges) -> SyncResult<()> {
    let changes = set
        .get("changes")
        .and_then(Value::as_array)
        .ok_or_else(|| SyncError::decode("storage change set", "missing `changes` array"))?;

    for change in changes {
        let pair = change
            .as_array()
            .filter(|p| p.len() == 2)
            .ok_or_else(|| SyncError::decode("storage change", "expected [key, value]"))?;
        let key = pair[0]
            .as_str()
            .ok_or_else(|| SyncError::decode("storage change", "key is not a string"))
            .and_then(StorageKey::from_hex)?;
        let value = match &pair[1] {
            Value::Null => None,
            Value::String(s) => Some(decode_hex("storage value", s)?),
            other => {
                return Err(SyncError::decode(
                    "storage value",
                    format!("unexpected json {other}"),
                ))
            }
        };
        out.push((key, value));
    }
    Ok(())
}

fn decode_entry<T: BorshDeserialize>(
    path: &StoragePath,
    schema: &StorageEntrySchema,
    key: StorageKey,
    raw: Option<Vec<u8>>,
) -> SyncResult<StorageEntry<T>> {
    let what = format!("{}.{}", path.pallet, path.item);
    let map_key = key.map_key_parts(schema)?;
    let value = raw
        .map(|bytes| decode_value::<T>(&what, &bytes))
        .transpose()?;
    Ok(StorageEntry {
        key,
        map_key,
        value,
    })
}

pub struct StorageQueryBuilder {
    connections: Arc<dyn ChainConnectionProvider>,
    metadata: Arc<dyn ChainMetadataProvider>,
    policy: RequestPolicy,
    page_size: u32,
    batch_size: usize,
}

impl StorageQueryBuilder {
    pub fn new(
        connections: Arc<dyn ChainConnectionProvider>,
        metadata: Arc<dyn ChainMetadataProvider>,
        policy: RequestPolicy,
        storage: &Storage,
    ) -> Self {
        Self {
            connections,
            metadata,
            policy,
            page_size: storage.keys_page_size.max(1),
            batch_size: storage.query_batch_size.max(1),
        }
    }

    async fn resolve(
        &self,
        chain: &ChainId,
        path: &StoragePath,
    ) -> SyncResult<(Arc<dyn ChainConnection>, StorageEntrySchema)> {
        let connection = self.connections.require(chain)?;
        let schema = self.metadata.schema(chain).await?;
        let entry = schema.entry(path)?.clone();
        Ok((connection, entry))
    }

    /// Every entry under `prefix`. Any undecodable entry fails the whole query.
    #[instrument(skip_all, fields(chain = %chain, item = path.item))]
    pub async fn query_by_prefix<T: BorshDeserialize>(
        &self,
        chain: &ChainId,
        path: &StoragePath,
        prefix: &[KeyPart],
    ) -> SyncResult<Vec<StorageEntry<T>>> {
        let (connection, schema) = self.resolve(chain, path).await?;
        let raw = self.scan(connection.as_ref(), path, &schema, prefix).await?;
        raw.into_iter()
            .map(|(key, value)| decode_entry(path, &schema, key, value))
            .collect()
    }

    /// Same as [`Self::query_by_prefix`] but undecodable entries are logged and dropped.
    #[instrument(skip_all, fields(chain = %chain, item = path.item))]
    pub async fn query_by_prefix_lossy<T: BorshDeserialize>(
        &self,
        chain: &ChainId,
        path: &StoragePath,
        prefix: &[KeyPart],
    ) -> SyncResult<Vec<StorageEntry<T>>> {
        let (connection, schema) = self.resolve(chain, path).await?;
        let raw = self.scan(connection.as_ref(), path, &schema, prefix).await?;

        let mut entries = Vec::with_capacity(raw.len());
        for (key, value) in raw {
            match decode_entry(path, &schema, key.clone(), value) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(key = %key.to_hex(), error = %e, "dropping undecodable entry"),
            }
        }
        Ok(entries)
    }

    /// Point lookups. Returns one entry per requested key, in request order.
    #[instrument(skip_all, fields(chain = %chain, item = path.item, keys = keys.len()))]
    pub async fn query_exact<T: BorshDeserialize>(
        &self,
        chain: &ChainId,
        path: &StoragePath,
        keys: &[Vec<KeyPart>],
    ) -> SyncResult<Vec<StorageEntry<T>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let (connection, schema) = self.resolve(chain, path).await?;

        let mut unique: IndexMap<StorageKey, Option<Vec<u8>>> = IndexMap::new();
        let mut requested = Vec::with_capacity(keys.len());
        for parts in keys {
            if parts.len() != schema.keys.len() {
                return Err(SyncError::Unexpected(format!(
                    "exact query on {}.{} needs {} key parts, got {}",
                    path.pallet,
                    path.item,
                    schema.keys.len(),
                    parts.len()
                )));
            }
            let key = StorageKey::build(path, &schema, parts)?;
            unique.entry(key.clone()).or_insert(None);
            requested.push((key, parts.clone()));
        }
        if unique.len() < keys.len() {
            debug!(
                requested = keys.len(),
                unique = unique.len(),
                "coalesced duplicate storage keys"
            );
        }

        let all_keys: Vec<StorageKey> = unique.keys().cloned().collect();
        for (key, value) in self.fetch_values(connection.as_ref(), &all_keys).await? {
            if let Some(slot) = unique.get_mut(&key) {
                *slot = value;
            }
        }

        let what = format!("{}.{}", path.pallet, path.item);
        requested
            .into_iter()
            .map(|(key, map_key)| {
                let value = unique
                    .get(&key)
                    .cloned()
                    .flatten()
                    .map(|bytes| decode_value::<T>(&what, &bytes))
                    .transpose()?;
                Ok(StorageEntry {
                    key,
                    map_key,
                    value,
                })
            })
            .collect()
    }

    /// Value under a single full key.
    pub async fn fetch_one<T: BorshDeserialize>(
        &self,
        chain: &ChainId,
        path: &StoragePath,
        parts: Vec<KeyPart>,
    ) -> SyncResult<Option<T>> {
        let mut entries = self.query_exact::<T>(chain, path, &[parts]).await?;
        Ok(entries.pop().and_then(|e| e.value))
    }

    /// Subscribes to changes of the given full keys. The first event the node pushes
    /// carries the current values.
    #[instrument(skip_all, fields(chain = %chain, item = path.item, keys = keys.len()))]
    pub async fn subscribe<T: BorshDeserialize>(
        &self,
        chain: &ChainId,
        path: &StoragePath,
        keys: &[Vec<KeyPart>],
    ) -> SyncResult<StorageSubscription<T>> {
        let (connection, schema) = self.resolve(chain, path).await?;
        let hex_keys = keys
            .iter()
            .map(|parts| StorageKey::build(path, &schema, parts).map(|k| k.to_hex()))
            .collect::<SyncResult<Vec<_>>>()?;

        let subscription = self
            .policy
            .subscribe(
                connection.as_ref(),
                SUBSCRIBE_STORAGE,
                json!([hex_keys]),
                UNSUBSCRIBE_STORAGE,
            )
            .await?;

        Ok(StorageSubscription {
            id: subscription.id,
            chain_id: chain.clone(),
            path: *path,
            schema,
            events: subscription.events,
            _marker: PhantomData,
        })
    }

    pub async fn unsubscribe(&self, chain: &ChainId, id: &SubscriptionId) -> SyncResult<()> {
        let connection = self.connections.require(chain)?;
        connection.cancel(id).await
    }

    async fn scan(
        &self,
        connection: &dyn ChainConnection,
        path: &StoragePath,
        schema: &StorageEntrySchema,
        prefix: &[KeyPart],
    ) -> SyncResult<RawChanges> {
        let prefix_key = StorageKey::build(path, schema, prefix)?;
        let keys = self.keys_paged(connection, &prefix_key).await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.fetch_values(connection, &keys).await
    }

    async fn keys_paged(
        &self,
        connection: &dyn ChainConnection,
        prefix: &StorageKey,
    ) -> SyncResult<Vec<StorageKey>> {
        let prefix_hex = prefix.to_hex();
        let mut keys = Vec::new();
        let mut start: Option<String> = None;

        loop {
            let params = json!([prefix_hex, self.page_size, start]);
            let page = self.policy.call(connection, GET_KEYS_PAGED, params).await?;
            let page = page
                .as_array()
                .ok_or_else(|| SyncError::decode("key page", "expected an array"))?;

            for raw in page {
                let key = raw
                    .as_str()
                    .ok_or_else(|| SyncError::decode("key page", "key is not a string"))
                    .and_then(StorageKey::from_hex)?;
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }

            if page.len() < self.page_size as usize {
                break;
            }
            start = page.last().and_then(Value::as_str).map(str::to_string);
        }
        Ok(keys)
    }

    async fn fetch_values(
        &self,
        connection: &dyn ChainConnection,
        keys: &[StorageKey],
    ) -> SyncResult<RawChanges> {
        let chunks = keys.chunks(self.batch_size).map(|chunk| {
            let hex_keys: Vec<String> = chunk.iter().map(StorageKey::to_hex).collect();
            async move {
                let response = self
                    .policy
                    .call(connection, QUERY_STORAGE_AT, json!([hex_keys]))
                    .await?;
                let sets = response
                    .as_array()
                    .ok_or_else(|| SyncError::decode("storage query", "expected an array"))?;
                let mut out = Vec::with_capacity(chunk.len());
                for set in sets {
                    parse_change_set(set, &mut out)?;
                }
                Ok::<_, SyncError>(out)
            }
        });

        let results = try_join_all(chunks).await?;
        Ok(results.into_iter().flatten().collect())
    }
}

/// Decoded change stream over one storage subscription.
pub struct StorageSubscription<T> {
    pub id: SubscriptionId,
    chain_id: ChainId,
    path: StoragePath,
    schema: StorageEntrySchema,
    events: mpsc::UnboundedReceiver<SubscriptionEvent>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: BorshDeserialize> StorageSubscription<T> {
    /// Next decoded change set. `None` once the subscription is gone; a lost connection
    /// yields one `ConnectionUnavailable` first.
    pub async fn next(&mut self) -> Option<SyncResult<Vec<StorageEntry<T>>>> {
        match self.events.recv().await? {
            SubscriptionEvent::Update(set) => Some(self.decode(&set)),
            SubscriptionEvent::Failure(reason) => {
                warn!(id = %self.id, %reason, "storage subscription failed");
                self.events.close();
                Some(Err(SyncError::ConnectionUnavailable {
                    chain_id: self.chain_id.clone(),
                }))
            }
        }
    }

    fn decode(&self, set: &Value) -> SyncResult<Vec<StorageEntry<T>>> {
        let mut raw = Vec::new();
        parse_change_set(set, &mut raw)?;
        raw.into_iter()
            .map(|(key, value)| decode_entry(&self.path, &self.schema, key, value))
            .collect()
    }
}
