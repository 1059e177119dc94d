//! # Pool Sync Service
//!
//! Long-running service that keeps one account's pool positions in sync with the chain.
//!
//! ## Overview
//!
//! This service:
//! - Restores the last persisted snapshot, then reconciles against the chain
//! - Subscribes to membership and reserve changes of every base asset
//! - Logs each reconciled list, with yields when `apy.endpoint` is configured
//! - Reconnects and re-subscribes when the node connection drops
//! - Handles graceful shutdown on Ctrl+C
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin pool_sync_service -- --config Config.toml
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use pool_sync_sdk::{
    aggregator::ChainAggregator,
    apy_cache::{ApyCache, SubqueryApyFetcher},
    assets::{AssetCatalog, StaticAssetCatalog},
    connection::{RequestPolicy, StaticConnectionProvider},
    coordinator::{CoordinatorConfig, PoolObserver, PoolSyncCoordinator},
    database::PgPoolRepository,
    metadata::{RuntimeSchema, StaticMetadataProvider},
    metrics,
    order_store::{FileOrderStore, InMemoryOrderStore, OrderStore},
    repository::{InMemoryPoolRepository, PoolRepository},
    settings::Settings,
    storage_query::StorageQueryBuilder,
    types::PoolInfo,
    ws_connection::WsConnection,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "pool_sync_service", about = "Keeps DEX pool positions in sync with the chain")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "Config.toml")]
    config: String,

    /// Prometheus listen address (observability builds only)
    #[arg(long, default_value = "0.0.0.0:9000")]
    metrics_addr: SocketAddr,

    /// Skip restoring the persisted snapshot before the first reconciliation
    #[arg(long)]
    cold_start: bool,
}

/// Forwards every reconciled list to the reporting task.
struct ChannelObserver {
    tx: mpsc::UnboundedSender<Vec<PoolInfo>>,
}

impl PoolObserver for ChannelObserver {
    fn pools_updated(&self, pools: &[PoolInfo]) {
        let _ = self.tx.send(pools.to_vec());
    }
}

fn init_logging() {
    #[cfg(feature = "observability")]
    {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().json())
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "pool_sync_sdk=info,pool_sync_service=info".into()),
            )
            .init();
    }
    #[cfg(not(feature = "observability"))]
    env_logger::init();
}

#[cfg(feature = "observability")]
fn init_metrics(addr: SocketAddr) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("installing prometheus exporter")?;
    metrics::describe_metrics();
    info!(%addr, "prometheus exporter listening");
    Ok(())
}

#[cfg(not(feature = "observability"))]
fn init_metrics(_addr: SocketAddr) -> Result<()> {
    metrics::describe_metrics();
    Ok(())
}

async fn report_pools(
    mut rx: mpsc::UnboundedReceiver<Vec<PoolInfo>>,
    assets: Arc<StaticAssetCatalog>,
    apy: Option<Arc<ApyCache>>,
) {
    while let Some(pools) = rx.recv().await {
        info!(pools = pools.len(), "pool list updated");
        for pool in &pools {
            let base = assets
                .symbol(&pool.base_asset_id)
                .unwrap_or_else(|| "?".to_string());
            let target = assets
                .symbol(&pool.target_asset_id)
                .unwrap_or_else(|| "?".to_string());
            let apy_value = match (&apy, pool.reserves_id) {
                (Some(cache), Some(reserves_id)) => match cache.get_apy(&reserves_id).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "yield lookup failed");
                        None
                    }
                },
                _ => None,
            };
            info!(
                pair = %format!("{base}/{target}"),
                share = %pool.account_pool_share,
                base_pooled = %pool.base_asset_pooled,
                target_pooled = %pool.target_asset_pooled,
                favorite = pool.is_favorite,
                apy = ?apy_value,
                "pool"
            );
        }
    }
}

async fn connect_with_backoff(settings: &Settings) -> Arc<WsConnection> {
    let mut delay = Duration::from_secs(1);
    loop {
        match WsConnection::connect(
            &settings.rpc.ws_url,
            settings.sync.chain_id.clone(),
            settings.rpc.qps_limit,
        )
        .await
        {
            Ok(ws) => return ws,
            Err(e) => {
                warn!(error = %e, ?delay, "chain connection failed, retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(60));
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_logging();

    let settings = Settings::from_path(&cli.config)
        .with_context(|| format!("loading settings from {}", cli.config))?;
    init_metrics(cli.metrics_addr)?;
    info!(chain = %settings.sync.chain_id, "settings loaded");

    // Chain layer
    let connections = Arc::new(StaticConnectionProvider::new());
    let ws = WsConnection::connect(
        &settings.rpc.ws_url,
        settings.sync.chain_id.clone(),
        settings.rpc.qps_limit,
    )
    .await
    .context("connecting to chain node")?;
    connections.insert(settings.sync.chain_id.clone(), ws.clone());

    let metadata = Arc::new(StaticMetadataProvider::with_schema(
        settings.sync.chain_id.clone(),
        RuntimeSchema::pool_xyk(),
    ));
    let assets = Arc::new(StaticAssetCatalog::from_settings(&settings.assets)?);
    info!(assets = assets.len(), "asset catalog loaded");

    let queries = Arc::new(StorageQueryBuilder::new(
        connections.clone(),
        metadata,
        RequestPolicy::from_settings(&settings.rpc),
        &settings.storage,
    ));
    let aggregator = Arc::new(ChainAggregator::new(
        settings.sync.chain_id.clone(),
        queries,
        assets.clone(),
        settings.sync.max_concurrency,
    ));

    // Persistence
    let repository: Arc<dyn PoolRepository> = match &settings.database.url {
        Some(url) => Arc::new(PgPoolRepository::connect(url).await?),
        None => {
            warn!("database.url not set, pool rows are kept in memory only");
            Arc::new(InMemoryPoolRepository::new())
        }
    };
    let order_store: Arc<dyn OrderStore> = match &settings.order_store.path {
        Some(path) => Arc::new(FileOrderStore::new(path)),
        None => Arc::new(InMemoryOrderStore::new()),
    };

    let apy = match &settings.apy.endpoint {
        Some(endpoint) => {
            let fetcher = SubqueryApyFetcher::new(
                endpoint.clone(),
                Duration::from_millis(settings.rpc.request_timeout_ms),
            )?;
            Some(Arc::new(ApyCache::new(
                Arc::new(fetcher),
                settings.apy.ttl_seconds.map(Duration::from_secs),
            )))
        }
        None => None,
    };

    // Sync layer
    let coordinator = PoolSyncCoordinator::new(
        CoordinatorConfig::from_settings(&settings.sync)?,
        aggregator.clone(),
        aggregator,
        repository,
        order_store,
    );

    let (tx, rx) = mpsc::unbounded_channel();
    let observer_id = coordinator.append_observer(Arc::new(ChannelObserver { tx }));
    let report_handle = tokio::spawn(report_pools(rx, assets, apy));

    if !cli.cold_start {
        match coordinator.warm_start().await {
            Ok(n) => info!(pools = n, "warm start complete"),
            Err(e) => warn!(error = %e, "warm start failed"),
        }
    }
    coordinator.load_account_pools();

    // Reconnect supervisor
    let supervisor = {
        let coordinator = coordinator.clone();
        let connections = connections.clone();
        let settings = settings.clone();
        let mut ws = ws;
        tokio::spawn(async move {
            let mut check = tokio::time::interval(Duration::from_secs(5));
            loop {
                check.tick().await;
                if !ws.is_closed() {
                    continue;
                }
                warn!("chain connection closed, reconnecting");
                connections.remove(&settings.sync.chain_id);
                ws = connect_with_backoff(&settings).await;
                connections.insert(settings.sync.chain_id.clone(), ws.clone());
                info!("chain connection restored");
                if let Err(e) = coordinator.resubscribe_all().await {
                    warn!(error = %e, "resubscribe after reconnect failed");
                }
            }
        })
    };

    signal::ctrl_c().await?;
    info!("shutdown signal received, stopping tasks");

    supervisor.abort();
    coordinator.remove_observer(&observer_id);
    report_handle.abort();
    Ok(())
}
