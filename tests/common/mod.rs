//! Shared fixtures: an in-memory chain node speaking the storage RPC subset the SDK uses,
//! and builders wiring it into an aggregator and a coordinator.

#![allow(dead_code)]

use async_trait::async_trait;
use borsh::BorshSerialize;
use ethers::types::H256;
use pool_sync_sdk::aggregator::{ChainAggregator, DexInfo};
use pool_sync_sdk::assets::StaticAssetCatalog;
use pool_sync_sdk::connection::{
    ChainConnection, RequestPolicy, StaticConnectionProvider, Subscription, SubscriptionEvent,
    SubscriptionId,
};
use pool_sync_sdk::coordinator::{CoordinatorConfig, PoolObserver, PoolSyncCoordinator};
use pool_sync_sdk::metadata::{
    RuntimeSchema, StaticMetadataProvider, StoragePath, ACCOUNT_POOLS, DEX_INFOS,
    ENABLED_SOURCES, POOL_PROPERTIES, POOL_PROVIDERS, POOL_RESERVES, TOTAL_ISSUANCES,
};
use pool_sync_sdk::order_store::InMemoryOrderStore;
use pool_sync_sdk::repository::InMemoryPoolRepository;
use pool_sync_sdk::settings::Storage;
use pool_sync_sdk::storage_key::{KeyPart, StorageKey};
use pool_sync_sdk::storage_query::{
    StorageQueryBuilder, GET_KEYS_PAGED, QUERY_STORAGE_AT, SUBSCRIBE_STORAGE,
};
use pool_sync_sdk::types::{AccountId, AssetId, PoolIdentity, PoolInfo};
use pool_sync_sdk::{SyncError, SyncResult};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const CHAIN: &str = "sora";
pub const DOMAIN: &str = "pools";

pub fn id(byte: u8) -> H256 {
    H256::repeat_byte(byte)
}

pub fn account() -> AccountId {
    id(0xaa)
}

/// Base asset (XOR-like, 18 decimals).
pub fn xor() -> AssetId {
    id(0x02)
}

/// Reserve account of the pool `xor()/target`.
pub fn reserves_account(target: &AssetId) -> AccountId {
    let mut bytes = target.0;
    bytes[0] = 0xee;
    H256::from(bytes)
}

fn to_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

fn from_hex(value: &Value) -> Vec<u8> {
    let s = value.as_str().expect("hex string param");
    hex::decode(s.trim_start_matches("0x")).expect("valid hex param")
}

struct Watcher {
    keys: HashSet<Vec<u8>>,
    tx: mpsc::UnboundedSender<SubscriptionEvent>,
}

/// Storage node double. Every `put` pushes the changed key to the subscriptions
/// watching it, the same way a node reports a new block.
pub struct MockChain {
    schema: RuntimeSchema,
    state: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    watchers: Mutex<HashMap<SubscriptionId, Watcher>>,
    next_subscription: AtomicU64,
    calls: Mutex<HashMap<String, usize>>,
    offline: AtomicBool,
}

impl MockChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            schema: RuntimeSchema::pool_xyk(),
            state: Mutex::new(BTreeMap::new()),
            watchers: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            calls: Mutex::new(HashMap::new()),
            offline: AtomicBool::new(false),
        })
    }

    fn key(&self, path: &StoragePath, parts: &[KeyPart]) -> Vec<u8> {
        let schema = self.schema.entry(path).expect("path in schema");
        StorageKey::build(path, schema, parts).expect("valid key").0
    }

    fn change_set(&self, keys: &[Vec<u8>]) -> Value {
        let state = self.state.lock().unwrap();
        let changes: Vec<Value> = keys
            .iter()
            .map(|k| match state.get(k) {
                Some(v) => json!([to_hex(k), to_hex(v)]),
                None => json!([to_hex(k), Value::Null]),
            })
            .collect();
        json!({ "block": "0x00", "changes": changes })
    }

    fn notify(&self, key: &[u8]) {
        let set = self.change_set(&[key.to_vec()]);
        let watchers = self.watchers.lock().unwrap();
        for watcher in watchers.values() {
            if watcher.keys.contains(key) {
                let _ = watcher.tx.send(SubscriptionEvent::Update(set.clone()));
            }
        }
    }

    pub fn put_raw(&self, path: &StoragePath, parts: &[KeyPart], bytes: Vec<u8>) {
        let key = self.key(path, parts);
        self.state.lock().unwrap().insert(key.clone(), bytes);
        self.notify(&key);
    }

    pub fn put<V: BorshSerialize>(&self, path: &StoragePath, parts: &[KeyPart], value: &V) {
        self.put_raw(path, parts, borsh::to_vec(value).expect("borsh encode"));
    }

    pub fn remove(&self, path: &StoragePath, parts: &[KeyPart]) {
        let key = self.key(path, parts);
        self.state.lock().unwrap().remove(&key);
        self.notify(&key);
    }

    pub fn add_dex(&self, index: u32, base: AssetId) {
        self.put(
            &DEX_INFOS,
            &[KeyPart::from(index)],
            &DexInfo {
                base_asset_id: base.0,
                is_public: true,
            },
        );
    }

    pub fn set_properties(&self, base: AssetId, target: AssetId, reserves_id: AccountId) {
        let fees_account = id(0xfe);
        self.put(
            &POOL_PROPERTIES,
            &[base.into(), target.into()],
            &(reserves_id.0, fees_account.0),
        );
    }

    pub fn set_reserves(&self, base: AssetId, target: AssetId, base_reserves: u128, target_reserves: u128) {
        self.put(
            &POOL_RESERVES,
            &[base.into(), target.into()],
            &(base_reserves, target_reserves),
        );
    }

    pub fn set_total_issuance(&self, reserves_id: AccountId, total: u128) {
        self.put(&TOTAL_ISSUANCES, &[reserves_id.into()], &total);
    }

    pub fn set_provider_balance(&self, reserves_id: AccountId, account: AccountId, balance: u128) {
        self.put(
            &POOL_PROVIDERS,
            &[reserves_id.into(), account.into()],
            &balance,
        );
    }

    pub fn set_account_pools(&self, account: AccountId, base: AssetId, targets: &[AssetId]) {
        let raw: Vec<[u8; 32]> = targets.iter().map(|t| t.0).collect();
        self.put(&ACCOUNT_POOLS, &[account.into(), base.into()], &raw);
    }

    pub fn set_enabled_sources(&self, base: AssetId, target: AssetId, sources: &[u8]) {
        self.put(
            &ENABLED_SOURCES,
            &[base.into(), target.into()],
            &sources.to_vec(),
        );
    }

    /// Complete pool `xor()/target` where `account()` holds `provided` of `total` LP tokens.
    pub fn seed_pool(&self, target: AssetId, reserves: (u128, u128), total: u128, provided: u128) {
        let reserves_id = reserves_account(&target);
        self.set_properties(xor(), target, reserves_id);
        self.set_reserves(xor(), target, reserves.0, reserves.1);
        self.set_total_issuance(reserves_id, total);
        self.set_provider_balance(reserves_id, account(), provided);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self, method: &str) -> usize {
        self.calls.lock().unwrap().get(method).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.watchers.lock().unwrap().len()
    }

    /// Kills every live subscription as a dropped socket would.
    pub fn drop_subscriptions(&self) {
        let mut watchers = self.watchers.lock().unwrap();
        for (_, watcher) in watchers.drain() {
            let _ = watcher
                .tx
                .send(SubscriptionEvent::Failure("socket closed".into()));
        }
    }

    fn record(&self, method: &str) -> SyncResult<()> {
        *self.calls.lock().unwrap().entry(method.to_string()).or_default() += 1;
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::Rpc {
                method: method.to_string(),
                code: -32000,
                message: "node offline".into(),
            });
        }
        Ok(())
    }

    fn keys_paged(&self, params: &Value) -> Value {
        let prefix = from_hex(&params[0]);
        let page_size = params[1].as_u64().unwrap_or(1000) as usize;
        let start = if params[2].is_null() {
            None
        } else {
            Some(from_hex(&params[2]))
        };

        let state = self.state.lock().unwrap();
        let keys: Vec<Value> = state
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .filter(|k| start.as_ref().map_or(true, |s| *k > s))
            .take(page_size)
            .map(|k| json!(to_hex(k)))
            .collect();
        Value::Array(keys)
    }

    fn requested_keys(params: &Value) -> Vec<Vec<u8>> {
        params[0]
            .as_array()
            .expect("key list")
            .iter()
            .map(from_hex)
            .collect()
    }
}

#[async_trait]
impl ChainConnection for MockChain {
    async fn request(&self, method: &str, params: Value) -> SyncResult<Value> {
        self.record(method)?;
        match method {
            GET_KEYS_PAGED => Ok(self.keys_paged(&params)),
            QUERY_STORAGE_AT => {
                let keys = Self::requested_keys(&params);
                Ok(json!([self.change_set(&keys)]))
            }
            other => Err(SyncError::Rpc {
                method: other.to_string(),
                code: -32601,
                message: "method not found".into(),
            }),
        }
    }

    async fn subscribe(
        &self,
        method: &str,
        params: Value,
        _unsubscribe_method: &str,
    ) -> SyncResult<Subscription> {
        self.record(method)?;
        assert_eq!(method, SUBSCRIBE_STORAGE);
        let keys = Self::requested_keys(&params);
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(SubscriptionEvent::Update(self.change_set(&keys)));

        let id = format!(
            "sub-{}",
            self.next_subscription.fetch_add(1, Ordering::SeqCst)
        );
        self.watchers.lock().unwrap().insert(
            id.clone(),
            Watcher {
                keys: keys.into_iter().collect(),
                tx,
            },
        );
        Ok(Subscription { id, events: rx })
    }

    async fn cancel(&self, id: &SubscriptionId) -> SyncResult<()> {
        self.watchers.lock().unwrap().remove(id);
        Ok(())
    }
}

pub fn catalog(extra: &[(AssetId, &str, u32)]) -> Arc<StaticAssetCatalog> {
    let mut catalog = StaticAssetCatalog::new().with_asset(xor(), "XOR", 18);
    for (asset, symbol, precision) in extra {
        catalog = catalog.with_asset(*asset, *symbol, *precision);
    }
    Arc::new(catalog)
}

pub fn queries(chain: &Arc<MockChain>) -> Arc<StorageQueryBuilder> {
    let connections = Arc::new(StaticConnectionProvider::new());
    connections.insert(CHAIN, chain.clone());
    let metadata = Arc::new(StaticMetadataProvider::with_schema(
        CHAIN,
        RuntimeSchema::pool_xyk(),
    ));
    let policy = RequestPolicy {
        timeout: Duration::from_secs(5),
        max_retries: 0,
        ..RequestPolicy::default()
    };
    // Small pages and batches so scans exercise paging and chunking.
    let storage = Storage {
        keys_page_size: 2,
        query_batch_size: 3,
    };
    Arc::new(StorageQueryBuilder::new(connections, metadata, policy, &storage))
}

pub fn aggregator(chain: &Arc<MockChain>, assets: Arc<StaticAssetCatalog>) -> Arc<ChainAggregator> {
    Arc::new(ChainAggregator::new(CHAIN, queries(chain), assets, 4))
}

pub fn config(debounce: Duration) -> CoordinatorConfig {
    CoordinatorConfig {
        chain_id: CHAIN.to_string(),
        account_id: account(),
        domain: DOMAIN.to_string(),
        debounce,
    }
}

/// A row as it would sit in the repository for pool `xor()/target`.
pub fn local_row(target: AssetId, favorite: bool, order: Option<u32>) -> PoolInfo {
    let identity = PoolIdentity::new(xor(), target, account());
    PoolInfo {
        pool_id: identity.pool_id(),
        chain_id: CHAIN.to_string(),
        account_id: account(),
        base_asset_id: xor(),
        target_asset_id: target,
        reserves_id: Some(reserves_account(&target)),
        base_asset_pooled: Decimal::ONE,
        target_asset_pooled: Decimal::ONE,
        account_pool_share: Decimal::ONE,
        base_asset_reserves: None,
        target_asset_reserves: None,
        is_favorite: favorite,
        order_index: order,
        farms: Vec::new(),
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    updates: Mutex<Vec<Vec<PoolInfo>>>,
}

impl RecordingObserver {
    pub fn updates(&self) -> Vec<Vec<PoolInfo>> {
        self.updates.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.updates.lock().unwrap().len()
    }
}

impl PoolObserver for RecordingObserver {
    fn pools_updated(&self, pools: &[PoolInfo]) {
        self.updates.lock().unwrap().push(pools.to_vec());
    }
}

/// Coordinator over a [`MockChain`] with in-memory persistence.
pub struct Harness {
    pub chain: Arc<MockChain>,
    pub aggregator: Arc<ChainAggregator>,
    pub repository: Arc<InMemoryPoolRepository>,
    pub order_store: Arc<InMemoryOrderStore>,
    pub observer: Arc<RecordingObserver>,
    pub coordinator: Arc<PoolSyncCoordinator>,
}

impl Harness {
    pub fn new(chain: Arc<MockChain>, assets: Arc<StaticAssetCatalog>, debounce: Duration) -> Self {
        let aggregator = aggregator(&chain, assets);
        let repository = Arc::new(InMemoryPoolRepository::new());
        let order_store = Arc::new(InMemoryOrderStore::new());
        let coordinator = PoolSyncCoordinator::new(
            config(debounce),
            aggregator.clone(),
            aggregator.clone(),
            repository.clone(),
            order_store.clone(),
        );
        let observer = Arc::new(RecordingObserver::default());
        coordinator.append_observer(observer.clone());
        Self {
            chain,
            aggregator,
            repository,
            order_store,
            observer,
            coordinator,
        }
    }
}

/// Lets spawned tasks run until the runtime is idle.
pub async fn settle() {
    for _ in 0..100 {
        tokio::task::yield_now().await;
    }
}
