use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::DispatchConfig;
use crate::error::Result;
use crate::fleet::{ResetProtocol, Vitals};
use crate::lifecycle::HostController;
use crate::proxy::{GrpcWorkerProxy, WorkerProxy};

/// Hands out the proxy for a worker.
#[async_trait]
pub trait ProxySource: Send + Sync {
    async fn proxy_for(&self, vitals: &Vitals) -> Result<Arc<dyn WorkerProxy>>;
}

/// Everything a cached proxy captured from the worker record. The proxy
/// dials `url` and resumes through `vm_host`, so a change to any of these
/// must build a new one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ProxyKey {
    name: String,
    url: String,
    virtualized: bool,
    vm_host: Option<String>,
    reset_protocol: ResetProtocol,
}

impl From<&Vitals> for ProxyKey {
    fn from(vitals: &Vitals) -> Self {
        Self {
            name: vitals.name.clone(),
            url: vitals.url.clone(),
            virtualized: vitals.virtualized,
            vm_host: vitals.vm_host.clone(),
            reset_protocol: vitals.reset_protocol,
        }
    }
}

/// Caches one gRPC proxy per worker. A worker whose address or host
/// identity changes gets a fresh proxy and the old one is dropped.
pub struct ProxyFactory {
    config: DispatchConfig,
    host: Arc<HostController>,
    proxies: Mutex<HashMap<ProxyKey, Arc<dyn WorkerProxy>>>,
}

impl ProxyFactory {
    pub fn new(config: DispatchConfig) -> Self {
        let host = Arc::new(HostController::new(
            config.resume.clone(),
            config.call_timeout,
        ));
        Self {
            config,
            host,
            proxies: Mutex::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.proxies.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.proxies.lock().await.is_empty()
    }
}

#[async_trait]
impl ProxySource for ProxyFactory {
    async fn proxy_for(&self, vitals: &Vitals) -> Result<Arc<dyn WorkerProxy>> {
        let key = ProxyKey::from(vitals);
        let mut proxies = self.proxies.lock().await;
        if let Some(proxy) = proxies.get(&key) {
            return Ok(proxy.clone());
        }
        let proxy: Arc<dyn WorkerProxy> = Arc::new(GrpcWorkerProxy::new(
            vitals.clone(),
            &self.config,
            self.host.clone(),
        )?);
        proxies.retain(|cached, _| cached.name != vitals.name);
        tracing::debug!(worker = %vitals.name, url = %vitals.url, vm_host = ?vitals.vm_host, "Created worker proxy");
        proxies.insert(key, proxy.clone());
        Ok(proxy)
    }
}
