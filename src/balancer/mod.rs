pub mod health;
pub mod stats;
pub mod virtual_server;

pub use virtual_server::{Status, VirtualServer};

use crate::config::VirtualServerConfig;
use crate::error::BalancerError;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::info;

/// Registry of virtual servers, keyed by name. Names and listen addresses
/// are both unique across the registry; the checks run under the write lock.
pub struct Balancer {
    vservers: RwLock<HashMap<String, Arc<VirtualServer>>>,
}

impl Balancer {
    pub fn empty() -> Self {
        Self {
            vservers: RwLock::new(HashMap::new()),
        }
    }

    pub fn new(configs: &[VirtualServerConfig]) -> Result<Self, BalancerError> {
        let balancer = Self::empty();
        for cfg in configs {
            balancer.add_virtual_server(cfg)?;
        }
        Ok(balancer)
    }

    /// Register a virtual server from its config. The new virtual server
    /// starts in stopped state.
    pub fn add_virtual_server(
        &self,
        cfg: &VirtualServerConfig,
    ) -> Result<Arc<VirtualServer>, BalancerError> {
        let vs = Arc::new(VirtualServer::new(cfg)?);

        let mut map = self.vservers.write().unwrap();
        if map.contains_key(vs.name()) {
            return Err(BalancerError::NameExists(vs.name().to_string()));
        }
        if map.values().any(|v| v.address() == vs.address()) {
            return Err(BalancerError::AddressExists(vs.address().to_string()));
        }
        map.insert(vs.name().to_string(), vs.clone());

        info!(
            "balancer: virtual server registered, vs={}, addr={}, method={}",
            vs.name(),
            vs.address(),
            vs.lb_method().as_str(),
        );
        Ok(vs)
    }

    pub fn find_virtual_server(&self, name: &str) -> Result<Arc<VirtualServer>, BalancerError> {
        self.vservers
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| BalancerError::VirtualServerNotFound(name.to_string()))
    }

    /// Snapshot of all virtual servers, sorted by name for deterministic
    /// iteration.
    pub fn list(&self) -> Vec<Arc<VirtualServer>> {
        let mut all: Vec<Arc<VirtualServer>> =
            self.vservers.read().unwrap().values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    pub fn len(&self) -> usize {
        self.vservers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.vservers.read().unwrap().is_empty()
    }

    /// Start every registered virtual server.
    pub async fn run(&self) -> Result<(), BalancerError> {
        for vs in self.list() {
            vs.run().await?;
        }
        Ok(())
    }

    /// Gracefully stop every running virtual server. Stopping continues past
    /// failures; the first error is surfaced.
    pub async fn stop(&self) -> Result<(), BalancerError> {
        let mut first_err = None;
        for vs in self.list() {
            if vs.status().await == Status::Running {
                if let Err(e) = vs.stop().await {
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
