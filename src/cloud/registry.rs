use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::{Capability, CloudAdapter};
use crate::server::{Cloud, ServerError, ServerResult};

/// Adapters keyed by cloud. Every entry point dispatches through here
/// instead of matching on the cloud itself.
#[derive(Default)]
pub struct CloudRegistry {
    adapters: DashMap<Cloud, Arc<dyn CloudAdapter>>,
}

impl CloudRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one for the same cloud.
    pub fn register(&self, adapter: Arc<dyn CloudAdapter>) {
        let cloud = adapter.cloud();
        debug!(cloud = %cloud, "Registering cloud adapter");
        self.adapters.insert(cloud, adapter);
    }

    pub fn with(self, adapter: Arc<dyn CloudAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn adapter(&self, cloud: Cloud) -> ServerResult<Arc<dyn CloudAdapter>> {
        self.adapters
            .get(&cloud)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(ServerError::NoAdapter(cloud))
    }

    pub fn has_capability(&self, cloud: Cloud, capability: Capability) -> bool {
        self.adapters
            .get(&cloud)
            .map(|entry| entry.value().supports(capability))
            .unwrap_or(false)
    }

    /// The adapter for `cloud`, failing if it lacks `capability`.
    pub fn require(
        &self,
        cloud: Cloud,
        capability: Capability,
    ) -> ServerResult<Arc<dyn CloudAdapter>> {
        let adapter = self.adapter(cloud)?;
        if !adapter.supports(capability) {
            return Err(ServerError::Unsupported {
                cloud,
                capability: capability.to_string(),
            });
        }
        Ok(adapter)
    }

    pub fn clouds(&self) -> Vec<Cloud> {
        let mut clouds: Vec<Cloud> = self.adapters.iter().map(|e| *e.key()).collect();
        clouds.sort_by_key(|c| c.as_str());
        clouds
    }
}
