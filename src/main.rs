//! Pool Node Coordinator - Main Application
//!
//! Watches the node for chain changes and prefetches the work template of
//! every new height through the shared template store.

use pool_node_coordinator::{
    client::{BitcoinRpcClient, NodeRpc},
    config::Config,
    coordinator::TemplateCoordinator,
    logging::init_logging,
    notifier::ChainChangeNotifier,
    state::MiningStateCache,
    store::{MemoryTemplateStore, SqliteTemplateStore, TemplateStore},
    submission::SubmissionGateway,
    ChainHealth, Result, APP_NAME, APP_VERSION,
};

use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Wires the node, the cache and the template coordinator together
struct PoolNode {
    config: Config,
    node: Arc<BitcoinRpcClient>,
    cache: Arc<MiningStateCache>,
    coordinator: Arc<TemplateCoordinator>,
}

impl PoolNode {
    /// Build all components from configuration
    fn new(config: Config) -> Result<Self> {
        let node = Arc::new(BitcoinRpcClient::new(config.rpc_endpoint()?)?);

        let store: Arc<dyn TemplateStore> = match &config.store_path {
            Some(path) => {
                info!("Using shared template store at {}", path.display());
                Arc::new(SqliteTemplateStore::open(path)?)
            }
            None => {
                info!("Using in-memory template store");
                Arc::new(MemoryTemplateStore::new())
            }
        };

        let cache = Arc::new(MiningStateCache::new(node.clone(), config.refresh_policy()));
        let coordinator = Arc::new(TemplateCoordinator::new(
            node.clone(),
            store,
            config.identity()?,
            config.coordinator_config()?,
        ));

        Ok(Self {
            config,
            node,
            cache,
            coordinator,
        })
    }

    /// Check that the node answers; failures are only logged
    async fn check_node(&self) {
        match self.node.rpc_info().await {
            Ok(_) => info!("Connected to node RPC at {}", self.node.endpoint()),
            Err(e) => warn!("Could not reach RPC host {}: {}", self.node.endpoint(), e),
        }
    }

    /// Run until `shutdown` is cancelled
    async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.check_node().await;

        match self.coordinator.identity() {
            Some(identity) => info!("Sharing templates as instance {}", identity),
            None => info!("Running as a single instance"),
        }

        let notifier = ChainChangeNotifier::new(self.cache.clone(), self.config.notifier_mode());
        let notifier_handle = tokio::spawn(notifier.run());
        let health_handle = tokio::spawn(watch_health(self.cache.clone()));

        let mut states = self.cache.subscribe().into_stream().boxed();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }
                state = states.next() => {
                    let Some(state) = state else {
                        warn!("Mining state broadcast closed");
                        break;
                    };

                    info!("New chain tip at height {}", state.height);
                    let coordinator = self.coordinator.clone();
                    tokio::spawn(async move {
                        if let Err(e) = coordinator.get_template(state.height).await {
                            error!("Template prefetch for height {} failed: {}", state.height, e);
                        }
                        if let Err(e) = coordinator.prune(state.height).await {
                            warn!("Template pruning below height {} failed: {}", state.height, e);
                        }
                    });
                }
            }
        }

        notifier_handle.abort();
        health_handle.abort();
        Ok(())
    }
}

/// Report which height pool work is based on while the node is unreachable
async fn watch_health(cache: Arc<MiningStateCache>) {
    let mut health = cache.health();

    while health.changed().await.is_ok() {
        let current = *health.borrow_and_update();
        if let ChainHealth::Stale { .. } = current {
            warn!(
                "Work stays on height {} until the node is reachable again",
                cache.height()
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load and validate configuration
    let config = Config::load().await?;
    let _log_guard = init_logging(config.log_level, config.log_format, config.log_file.as_deref())?;

    if config.print_config {
        print_configuration(&config)?;
        return Ok(());
    }

    info!("Starting {} v{}", APP_NAME, APP_VERSION);

    if let Some(block_hex) = &config.submit_block {
        let node = Arc::new(BitcoinRpcClient::new(config.rpc_endpoint()?)?);
        let outcome = SubmissionGateway::new(node).submit(block_hex).await;
        println!("{}", outcome);
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_token.cancel();
        }
    });

    let pool_node = PoolNode::new(config)?;
    pool_node.run(shutdown).await
}

/// Print the effective configuration
fn print_configuration(config: &Config) -> Result<()> {
    let config_yaml = serde_yaml::to_string(config)?;
    println!("{}", config_yaml);
    Ok(())
}
