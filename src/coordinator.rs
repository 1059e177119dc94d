//! # Pool Sync Coordinator
//!
//! Owns the reconciled pool set of one account, keeps it consistent with chain storage and
//! pushes every successfully reconciled list to registered observers.
//!
//! ## Flow
//!
//! 1. Each tracked base asset moves `Unsubscribed -> Subscribing -> Subscribed`. While
//!    subscribed, the account's membership key for the base and the reserves key of every
//!    member pool are watched. New members grow the reserve subscriptions; departed members
//!    shrink them. A watch that ends or fails moves the base to `Lost` until it is
//!    subscribed again.
//! 2. Notifications pass through a per-pair [`TriggerGate`]: the initial snapshot of each
//!    subscription is discarded and bursts are coalesced into one pass. A change that lands
//!    while the pass is reading the chain earns one follow-up pass.
//! 3. A pass fetches the remote snapshot, merges the local overlay (favorite flag, order
//!    position, farms), diffs against persisted rows, saves the diff atomically, swaps the
//!    in-memory snapshot and notifies observers.
//!
//! ## Concurrency
//!
//! - Remote fetches run without holding any lock.
//! - All persisted writes go through one async mutex. A pass whose remote snapshot is older
//!   than the last applied one is discarded.
//! - Snapshot reads are lock-free (`ArcSwap`) and never wait on an in-flight pass.
//! - Observers are called after the write lock is released.

use anyhow::Context;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use futures::future::try_join_all;
use futures::StreamExt;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::aggregator::{ChangeStream, PoolChangeFeed, PoolDataSource};
use crate::connection::SubscriptionId;
use crate::debounce::{PairKey, TriggerDecision, TriggerGate};
use crate::error::SyncResult;
use crate::metrics;
use crate::order_store::OrderStore;
use crate::repository::PoolRepository;
use crate::settings::SyncSettings;
use crate::types::conversions::string_to_h256;
use crate::types::{AccountId, AssetId, ChainId, LiquidityPair, PoolId, PoolIdentity, PoolInfo};

pub type ObserverId = Uuid;

/// Receives the full reconciled, ordered pool list after every successful pass.
pub trait PoolObserver: Send + Sync {
    fn pools_updated(&self, pools: &[PoolInfo]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Subscribed,
    /// A watch of the base ended or failed; no further changes arrive until the base is
    /// subscribed again (see [`PoolSyncCoordinator::resubscribe_all`]).
    Lost,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub upserted: usize,
    pub removed: usize,
    /// Pools in the snapshot after the pass.
    pub total: usize,
    /// A newer pass was applied first; this one wrote nothing.
    pub superseded: bool,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub chain_id: ChainId,
    pub account_id: AccountId,
    pub domain: String,
    pub debounce: Duration,
}

impl CoordinatorConfig {
    pub fn from_settings(sync: &SyncSettings) -> anyhow::Result<Self> {
        Ok(Self {
            chain_id: sync.chain_id.clone(),
            account_id: string_to_h256(&sync.account_id).context("sync.account_id")?,
            domain: sync.repository_domain.clone(),
            debounce: Duration::from_millis(sync.debounce_ms),
        })
    }
}

struct Watch {
    id: SubscriptionId,
    task: JoinHandle<()>,
}

struct BaseTracking {
    state: SubscriptionState,
    generation: u64,
    membership: Option<Watch>,
    reserves: HashMap<AssetId, Watch>,
}

impl BaseTracking {
    fn new() -> Self {
        Self {
            state: SubscriptionState::Unsubscribed,
            generation: 0,
            membership: None,
            reserves: HashMap::new(),
        }
    }

    fn watches(&mut self) -> Vec<Watch> {
        let mut all: Vec<Watch> = self.reserves.drain().map(|(_, w)| w).collect();
        all.extend(self.membership.take());
        all
    }
}

/// Sort order: favorites first, then explicit order position, then pool id.
fn sort_pools(pools: &mut [PoolInfo]) {
    pools.sort_by_key(|p| (!p.is_favorite, p.order_index.unwrap_or(u32::MAX), p.pool_id));
}

fn order_positions(order: &[PoolId]) -> HashMap<PoolId, u32> {
    let mut positions = HashMap::with_capacity(order.len());
    for (i, id) in order.iter().enumerate() {
        positions.entry(*id).or_insert(i as u32);
    }
    positions
}

/// Carries the local overlay onto fresh remote rows. New identities keep the
/// defaults from [`PoolInfo::from_remote`].
fn merge_overlay(
    remote: Vec<PoolInfo>,
    local: &HashMap<PoolId, PoolInfo>,
    positions: &HashMap<PoolId, u32>,
) -> Vec<PoolInfo> {
    remote
        .into_iter()
        .map(|mut row| {
            if let Some(known) = local.get(&row.pool_id) {
                row.is_favorite = known.is_favorite;
                row.farms = known.farms.clone();
            }
            row.order_index = positions.get(&row.pool_id).copied();
            row
        })
        .collect()
}

/// `(upserts, deletes)`: rows that differ from the persisted copy, and persisted ids
/// absent from `merged`.
fn diff(merged: &[PoolInfo], local: &HashMap<PoolId, PoolInfo>) -> (Vec<PoolInfo>, Vec<PoolId>) {
    let upserts = merged
        .iter()
        .filter(|row| local.get(&row.pool_id) != Some(*row))
        .cloned()
        .collect();
    let remote_ids: HashSet<PoolId> = merged.iter().map(|r| r.pool_id).collect();
    let mut deletes: Vec<PoolId> = local
        .keys()
        .filter(|id| !remote_ids.contains(id))
        .copied()
        .collect();
    deletes.sort();
    (upserts, deletes)
}

pub struct PoolSyncCoordinator {
    config: CoordinatorConfig,
    source: Arc<dyn PoolDataSource>,
    feed: Arc<dyn PoolChangeFeed>,
    repository: Arc<dyn PoolRepository>,
    order_store: Arc<dyn OrderStore>,
    snapshot: ArcSwap<Vec<PoolInfo>>,
    /// Sequence number of the last applied remote snapshot.
    write_gate: Mutex<u64>,
    pass_seq: AtomicU64,
    observers: DashMap<ObserverId, Arc<dyn PoolObserver>>,
    bases: Mutex<HashMap<AssetId, BaseTracking>>,
    generation: AtomicU64,
    gate: TriggerGate,
}

impl PoolSyncCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        source: Arc<dyn PoolDataSource>,
        feed: Arc<dyn PoolChangeFeed>,
        repository: Arc<dyn PoolRepository>,
        order_store: Arc<dyn OrderStore>,
    ) -> Arc<Self> {
        let gate = TriggerGate::new(config.debounce);
        Arc::new(Self {
            config,
            source,
            feed,
            repository,
            order_store,
            snapshot: ArcSwap::from_pointee(Vec::new()),
            write_gate: Mutex::new(0),
            pass_seq: AtomicU64::new(0),
            observers: DashMap::new(),
            bases: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            gate,
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    // ---- snapshot reads -------------------------------------------------------------

    /// Latest successfully reconciled list, in display order.
    pub fn get_account_pools(&self) -> Vec<PoolInfo> {
        (**self.snapshot.load()).clone()
    }

    pub fn get_pool(&self, identity: &PoolIdentity) -> Option<PoolInfo> {
        let id = identity.pool_id();
        self.snapshot.load().iter().find(|p| p.pool_id == id).cloned()
    }

    pub fn load_target_pools(&self, base: &AssetId) -> Vec<PoolInfo> {
        self.snapshot
            .load()
            .iter()
            .filter(|p| p.base_asset_id == *base)
            .cloned()
            .collect()
    }

    // ---- observers -----------------------------------------------------------------

    pub fn append_observer(&self, observer: Arc<dyn PoolObserver>) -> ObserverId {
        let id = Uuid::new_v4();
        self.observers.insert(id, observer);
        id
    }

    pub fn remove_observer(&self, id: &ObserverId) -> bool {
        self.observers.remove(id).is_some()
    }

    fn notify(&self, pools: &[PoolInfo]) {
        let observers: Vec<Arc<dyn PoolObserver>> =
            self.observers.iter().map(|o| o.value().clone()).collect();
        for observer in observers {
            observer.pools_updated(pools);
        }
    }

    fn publish(&self, mut pools: Vec<PoolInfo>) -> Arc<Vec<PoolInfo>> {
        sort_pools(&mut pools);
        metrics::set_pool_count(pools.len());
        let pools = Arc::new(pools);
        self.snapshot.store(pools.clone());
        pools
    }

    // ---- reconciliation --------------------------------------------------------------

    /// Fire-and-forget refresh: reconciles, then subscribes every base asset.
    pub fn load_account_pools(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.reconcile().await {
                warn!(error = %e, "initial reconciliation failed");
            }
            match this.source.list_base_assets().await {
                Ok(bases) => {
                    for base in bases {
                        if let Err(e) = this.subscribe_base(base).await {
                            warn!(base = ?base, error = %e, "subscribing base asset failed");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "listing base assets failed"),
            }
        })
    }

    /// Loads persisted rows into the snapshot without touching the chain.
    pub async fn warm_start(&self) -> SyncResult<usize> {
        let published = {
            let _guard = self.write_gate.lock().await;
            let local = self.repository.fetch_all(&self.config.domain).await?;
            let positions = order_positions(&self.order_store.load(&self.config.domain).await?);
            let rows = local
                .into_iter()
                .map(|mut row| {
                    row.order_index = positions.get(&row.pool_id).copied();
                    row
                })
                .collect();
            self.publish(rows)
        };
        info!(pools = published.len(), "snapshot restored from repository");
        self.notify(&published);
        Ok(published.len())
    }

    async fn remote_rows_for_base(
        &self,
        account: &AccountId,
        base: &AssetId,
    ) -> SyncResult<Vec<PoolInfo>> {
        let pools = self.source.account_pools(account, base).await?;
        if pools.is_empty() {
            return Ok(Vec::new());
        }
        let pairs: HashMap<AssetId, LiquidityPair> = self
            .source
            .all_pairs_for_base_asset(base)
            .await?
            .into_iter()
            .map(|p| (p.target_asset_id, p))
            .collect();
        Ok(pools
            .iter()
            .map(|pool| PoolInfo::from_remote(pool, pairs.get(&pool.target_asset_id)))
            .collect())
    }

    async fn fetch_remote(&self) -> SyncResult<Vec<PoolInfo>> {
        let account = self.config.account_id;
        let bases = self.source.list_base_assets().await?;
        let per_base = try_join_all(
            bases
                .iter()
                .map(|base| self.remote_rows_for_base(&account, base)),
        )
        .await?;

        let mut unique: IndexMap<PoolId, PoolInfo> = IndexMap::new();
        for row in per_base.into_iter().flatten() {
            unique.insert(row.pool_id, row);
        }
        Ok(unique.into_values().collect())
    }

    /// One full pass. A failed remote fetch or save leaves persisted rows, the snapshot and
    /// observers untouched.
    #[instrument(skip(self), fields(chain = %self.config.chain_id, domain = %self.config.domain))]
    pub async fn reconcile(&self) -> SyncResult<ReconcileReport> {
        let started = Instant::now();
        let result = self.reconcile_pass().await;
        match &result {
            Ok(report) => {
                metrics::record_reconcile_pass("ok", started.elapsed());
                metrics::record_reconcile_rows(report.upserted, report.removed);
                info!(
                    upserted = report.upserted,
                    removed = report.removed,
                    total = report.total,
                    superseded = report.superseded,
                    "reconciliation pass finished"
                );
            }
            Err(e) => {
                metrics::record_reconcile_pass("failed", started.elapsed());
                warn!(error = %e, "reconciliation pass failed");
            }
        }
        result
    }

    async fn reconcile_pass(&self) -> SyncResult<ReconcileReport> {
        let seq = self.pass_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let remote = self.fetch_remote().await?;

        let (report, published) = {
            let mut applied = self.write_gate.lock().await;
            if seq < *applied {
                debug!(seq, applied = *applied, "discarding superseded remote snapshot");
                return Ok(ReconcileReport {
                    total: self.snapshot.load().len(),
                    superseded: true,
                    ..ReconcileReport::default()
                });
            }

            let local: HashMap<PoolId, PoolInfo> = self
                .repository
                .fetch_all(&self.config.domain)
                .await?
                .into_iter()
                .map(|r| (r.pool_id, r))
                .collect();
            let positions = order_positions(&self.order_store.load(&self.config.domain).await?);

            let merged = merge_overlay(remote, &local, &positions);
            let (upserts, deletes) = diff(&merged, &local);
            if !upserts.is_empty() || !deletes.is_empty() {
                self.repository
                    .save(&self.config.domain, &upserts, &deletes)
                    .await?;
            }
            *applied = seq;

            let published = self.publish(merged);
            (
                ReconcileReport {
                    upserted: upserts.len(),
                    removed: deletes.len(),
                    total: published.len(),
                    superseded: false,
                },
                published,
            )
        };

        self.notify(&published);
        Ok(report)
    }

    /// Persists a new favorite/order overlay taken from `new_order` (in display order) and
    /// republishes the snapshot. No remote fetch. Rows are saved before the order list; on
    /// any failure neither store nor the snapshot keeps a partial overlay.
    pub async fn update_pools(&self, new_order: &[PoolInfo]) -> SyncResult<()> {
        let published = {
            let _guard = self.write_gate.lock().await;

            let order: Vec<PoolId> = new_order.iter().map(|p| p.pool_id).collect();
            let favorites: HashMap<PoolId, bool> =
                new_order.iter().map(|p| (p.pool_id, p.is_favorite)).collect();
            let positions = order_positions(&order);

            let local = self.repository.fetch_all(&self.config.domain).await?;
            let mut changed = Vec::new();
            let mut previous = Vec::new();
            let rows: Vec<PoolInfo> = local
                .into_iter()
                .map(|row| {
                    let mut updated = row.clone();
                    updated.order_index = positions.get(&row.pool_id).copied();
                    if let Some(favorite) = favorites.get(&row.pool_id) {
                        updated.is_favorite = *favorite;
                    }
                    if updated != row {
                        changed.push(updated.clone());
                        previous.push(row);
                    }
                    updated
                })
                .collect();

            if !changed.is_empty() {
                self.repository
                    .save(&self.config.domain, &changed, &[])
                    .await?;
            }
            if let Err(e) = self.order_store.store(&self.config.domain, &order).await {
                if !previous.is_empty() {
                    if let Err(rollback) = self
                        .repository
                        .save(&self.config.domain, &previous, &[])
                        .await
                    {
                        error!(error = %rollback, "restoring overlay after order store failure failed");
                    }
                }
                return Err(e);
            }
            debug!(changed = changed.len(), "pool overlay updated");
            self.publish(rows)
        };

        self.notify(&published);
        Ok(())
    }

    // ---- point checks ----------------------------------------------------------------

    fn known(&self, base: &AssetId, target: &AssetId, account: &AccountId) -> bool {
        self.get_pool(&PoolIdentity::new(*base, *target, *account))
            .is_some()
    }

    pub async fn is_pair_enabled(
        &self,
        base: &AssetId,
        target: &AssetId,
        account: &AccountId,
    ) -> SyncResult<bool> {
        if self.known(base, target, account) {
            return Ok(true);
        }
        self.source.is_pair_enabled(base, target).await
    }

    pub async fn is_pair_presented_in_network(
        &self,
        base: &AssetId,
        target: &AssetId,
        account: &AccountId,
    ) -> SyncResult<bool> {
        if self.known(base, target, account) {
            return Ok(true);
        }
        self.source.is_pair_presented_in_network(base, target).await
    }

    // ---- subscriptions ---------------------------------------------------------------

    pub async fn subscription_state(&self, base: &AssetId) -> SubscriptionState {
        self.bases
            .lock()
            .await
            .get(base)
            .map_or(SubscriptionState::Unsubscribed, |t| t.state)
    }

    async fn generation_of(&self, base: &AssetId) -> Option<u64> {
        self.bases
            .lock()
            .await
            .get(base)
            .filter(|t| t.state != SubscriptionState::Unsubscribed)
            .map(|t| t.generation)
    }

    /// Watches the account's membership key for `base`. No-op when already tracked.
    /// The tracking lock is not held while the feed subscribes; an unsubscribe that lands
    /// in between wins and the fresh watch is cancelled.
    pub async fn subscribe_base(self: &Arc<Self>, base: AssetId) -> SyncResult<()> {
        let (generation, leftovers) = {
            let mut bases = self.bases.lock().await;
            let tracking = bases.entry(base).or_insert_with(BaseTracking::new);
            let leftovers = match tracking.state {
                SubscriptionState::Unsubscribed => Vec::new(),
                SubscriptionState::Lost => {
                    self.gate.remove_base(&base);
                    tracking.watches()
                }
                SubscriptionState::Subscribing | SubscriptionState::Subscribed => return Ok(()),
            };
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            tracking.state = SubscriptionState::Subscribing;
            tracking.generation = generation;
            (generation, leftovers)
        };
        self.release_watches(leftovers).await;

        let result = self
            .feed
            .watch_account_pools(&self.config.account_id, &base)
            .await;

        let mut bases = self.bases.lock().await;
        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                if let Some(tracking) = bases.get_mut(&base).filter(|t| t.generation == generation) {
                    tracking.state = SubscriptionState::Unsubscribed;
                }
                return Err(e);
            }
        };

        let Some(tracking) = bases.get_mut(&base).filter(|t| t.generation == generation) else {
            drop(bases);
            debug!(base = ?base, "base released while subscribing, dropping watch");
            self.release_id(&stream.id).await;
            return Ok(());
        };

        let id = stream.id.clone();
        let task = tokio::spawn(run_membership_listener(
            Arc::downgrade(self),
            base,
            generation,
            stream,
        ));
        tracking.membership = Some(Watch { id, task });
        tracking.state = SubscriptionState::Subscribed;
        info!(base = ?base, generation, "base asset subscribed");
        Ok(())
    }

    /// Cancels every subscription of `base` and its pending triggers. Passes already
    /// running finish, but their completion is ignored.
    pub async fn unsubscribe(&self, base: &AssetId) {
        let tracking = self.bases.lock().await.remove(base);
        self.gate.remove_base(base);

        let Some(mut tracking) = tracking else {
            return;
        };
        self.release_watches(tracking.watches()).await;
        info!(base = ?base, "base asset unsubscribed");
    }

    async fn release_watches(&self, watches: Vec<Watch>) {
        for watch in watches {
            watch.task.abort();
            self.release_id(&watch.id).await;
        }
    }

    async fn release_id(&self, id: &SubscriptionId) {
        if let Err(e) = self.feed.unwatch(id).await {
            debug!(id = %id, error = %e, "unwatch failed");
        }
    }

    /// Flags `base` as lost after one of its watches of `generation` ended.
    async fn mark_lost(&self, base: &AssetId, generation: u64) {
        let mut bases = self.bases.lock().await;
        if let Some(tracking) = bases
            .get_mut(base)
            .filter(|t| t.generation == generation && t.state == SubscriptionState::Subscribed)
        {
            tracking.state = SubscriptionState::Lost;
            warn!(base = ?base, generation, "base asset subscription lost");
        }
    }

    /// Tears down and re-establishes every tracked subscription, then reconciles.
    /// Re-established keys discard their first notification again.
    pub async fn resubscribe_all(self: &Arc<Self>) -> SyncResult<()> {
        let tracked: Vec<AssetId> = self.bases.lock().await.keys().copied().collect();
        for base in &tracked {
            self.unsubscribe(base).await;
            self.subscribe_base(*base).await?;
        }
        self.reconcile().await.map(|_| ())
    }

    /// Brings the reserve subscriptions of `base` in line with `targets`. The tracking lock
    /// is only held to read and install watches, never across feed calls.
    async fn sync_reserve_watches(
        self: &Arc<Self>,
        base: AssetId,
        generation: u64,
        targets: &[AssetId],
    ) -> SyncResult<()> {
        let (stale, missing) = {
            let mut bases = self.bases.lock().await;
            let Some(tracking) = bases.get_mut(&base).filter(|t| t.generation == generation) else {
                return Ok(());
            };

            let wanted: HashSet<AssetId> = targets.iter().copied().collect();
            let gone: Vec<AssetId> = tracking
                .reserves
                .keys()
                .filter(|t| !wanted.contains(t))
                .copied()
                .collect();
            let mut stale = Vec::with_capacity(gone.len());
            for target in gone {
                self.gate.remove(&PairKey::pair(base, target));
                stale.extend(tracking.reserves.remove(&target));
            }

            let mut seen = HashSet::new();
            let missing: Vec<AssetId> = targets
                .iter()
                .filter(|t| !tracking.reserves.contains_key(*t) && seen.insert(**t))
                .copied()
                .collect();
            (stale, missing)
        };
        self.release_watches(stale).await;

        let mut opened = Vec::with_capacity(missing.len());
        let mut failure = None;
        for target in missing {
            match self.feed.watch_pool_reserves(&base, &target).await {
                Ok(stream) => opened.push((target, stream)),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let mut orphaned = Vec::new();
        {
            let mut bases = self.bases.lock().await;
            match bases.get_mut(&base).filter(|t| t.generation == generation) {
                Some(tracking) => {
                    for (target, stream) in opened {
                        if tracking.reserves.contains_key(&target) {
                            orphaned.push(stream.id);
                            continue;
                        }
                        let id = stream.id.clone();
                        let task = tokio::spawn(run_reserve_listener(
                            Arc::downgrade(self),
                            PairKey::pair(base, target),
                            generation,
                            stream,
                        ));
                        tracking.reserves.insert(target, Watch { id, task });
                    }
                }
                None => {
                    debug!(base = ?base, "base released while watching reserves, dropping watches");
                    orphaned.extend(opened.into_iter().map(|(_, stream)| stream.id));
                }
            }

            let active: usize = bases
                .values()
                .map(|t| t.reserves.len() + usize::from(t.membership.is_some()))
                .sum();
            metrics::set_active_subscriptions(active);
        }
        for id in orphaned {
            self.release_id(&id).await;
        }

        failure.map_or(Ok(()), Err)
    }

    fn on_signal(self: &Arc<Self>, key: PairKey, generation: u64) {
        match self.gate.signal(key) {
            TriggerDecision::Discarded => debug!(key = ?key, "initial snapshot discarded"),
            TriggerDecision::Coalesced => debug!(key = ?key, "trigger coalesced"),
            TriggerDecision::Fire => {
                let this = self.clone();
                tokio::spawn(async move { this.triggered_pass(key, generation).await });
            }
        }
    }

    /// Runs the fired pass for `key`, plus one follow-up for every change that arrived
    /// while a pass was reading the chain.
    async fn triggered_pass(&self, key: PairKey, generation: u64) {
        loop {
            if self.generation_of(&key.base).await != Some(generation) {
                debug!(key = ?key, "trigger of released subscription skipped");
                return;
            }
            self.gate.begin(key);
            if let Err(e) = self.reconcile().await {
                error!(key = ?key, error = %e, "triggered reconciliation failed");
            }
            if self.generation_of(&key.base).await != Some(generation) {
                debug!(key = ?key, "completion of stale trigger ignored");
                return;
            }
            if !self.gate.complete(key) {
                return;
            }
            debug!(key = ?key, "change arrived during the pass, reconciling again");
        }
    }
}

async fn run_membership_listener(
    coordinator: Weak<PoolSyncCoordinator>,
    base: AssetId,
    generation: u64,
    mut stream: ChangeStream<Vec<AssetId>>,
) {
    while let Some(item) = stream.events.next().await {
        let Some(this) = coordinator.upgrade() else {
            break;
        };
        match item {
            Ok(targets) => {
                if let Err(e) = this.sync_reserve_watches(base, generation, &targets).await {
                    warn!(base = ?base, error = %e, "updating reserve subscriptions failed");
                }
                this.on_signal(PairKey::membership(base), generation);
            }
            Err(e) if e.is_item_local() => warn!(base = ?base, error = %e, "bad membership update"),
            Err(e) => {
                warn!(base = ?base, error = %e, "membership subscription lost");
                break;
            }
        }
    }
    if let Some(this) = coordinator.upgrade() {
        this.mark_lost(&base, generation).await;
    }
}

async fn run_reserve_listener(
    coordinator: Weak<PoolSyncCoordinator>,
    key: PairKey,
    generation: u64,
    mut stream: ChangeStream<()>,
) {
    while let Some(item) = stream.events.next().await {
        let Some(this) = coordinator.upgrade() else {
            break;
        };
        match item {
            Ok(()) => this.on_signal(key, generation),
            Err(e) if e.is_item_local() => warn!(key = ?key, error = %e, "bad reserves update"),
            Err(e) => {
                warn!(key = ?key, error = %e, "reserves subscription lost");
                break;
            }
        }
    }
    if let Some(this) = coordinator.upgrade() {
        this.mark_lost(&key.base, generation).await;
    }
}
