use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::DispatchConfig;
use crate::error::Result;
use crate::fleet::Fleet;
use crate::proxy::{ProxyFactory, ProxySource};
use crate::scheduler::{
    BehaviourRegistry, CandidateSelector, Dispatcher, FleetScanner, QueueSelector,
};
use crate::transfer::{FileStager, TransferPool};

/// Wires the fleet store, proxies, transfer pool, cleaner and dispatcher
/// into one scanner. Everything is constructed here and passed down
/// explicitly; nothing is process-global.
pub struct Node {
    pub config: DispatchConfig,
    pub fleet: Arc<RwLock<Fleet>>,
    pub proxies: Arc<dyn ProxySource>,
    pub stager: FileStager,
    pub scanner: FleetScanner,
}

impl Node {
    pub fn new(config: DispatchConfig, fleet: Fleet, behaviours: BehaviourRegistry) -> Result<Self> {
        let proxies: Arc<dyn ProxySource> = Arc::new(ProxyFactory::new(config.clone()));
        Self::with_proxies(config, fleet, behaviours, proxies)
    }

    /// Assemble a node around an existing proxy source.
    pub fn with_proxies(
        config: DispatchConfig,
        fleet: Fleet,
        behaviours: BehaviourRegistry,
        proxies: Arc<dyn ProxySource>,
    ) -> Result<Self> {
        config.validate()?;

        let fleet = Arc::new(RwLock::new(fleet));
        let behaviours = Arc::new(behaviours);
        let stager = FileStager::new(Arc::new(TransferPool::new(config.transfer_pool_size)));
        let selector: Arc<dyn CandidateSelector> = Arc::new(QueueSelector::new(fleet.clone()));
        let dispatcher = Dispatcher::new(
            fleet.clone(),
            selector,
            behaviours.clone(),
            stager.clone(),
        );
        let scanner = FleetScanner::new(
            fleet.clone(),
            proxies.clone(),
            dispatcher,
            behaviours,
            stager.clone(),
            &config,
        );

        Ok(Self {
            config,
            fleet,
            proxies,
            stager,
            scanner,
        })
    }

    /// Scan the fleet until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let workers = self.fleet.read().await.worker_names().len();
        tracing::info!(
            workers,
            call_timeout = ?self.config.call_timeout,
            connection_timeout = ?self.config.connection_timeout,
            transfer_pool_size = self.config.transfer_pool_size,
            results_dir = %self.config.results_dir.display(),
            "Starting fleet dispatcher"
        );
        self.scanner.run(shutdown).await;
    }
}
