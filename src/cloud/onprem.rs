use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;

use super::{Backoff, Capability, CloudAdapter};
use crate::server::{Cloud, ComputeServer, Configuration, State};

/// A machine the user runs themselves. There is no provider API: lifecycle
/// calls record intent, which the node's agent picks up. Nothing is billed.
pub struct OnpremCloud {
    intents: DashMap<i64, State>,
    api_server: String,
}

impl OnpremCloud {
    pub fn new(api_server: &str) -> Self {
        Self {
            intents: DashMap::new(),
            api_server: api_server.to_string(),
        }
    }
}

#[async_trait]
impl CloudAdapter for OnpremCloud {
    fn cloud(&self) -> Cloud {
        Cloud::Onprem
    }

    fn supports(&self, capability: Capability) -> bool {
        capability == Capability::Deprovision
    }

    fn backoff(&self) -> Backoff {
        Backoff {
            start: Duration::from_secs(1),
            max: Duration::from_secs(5),
            factor: 1.3,
        }
    }

    async fn start(&self, server: &ComputeServer) -> Result<()> {
        self.intents.insert(server.id, State::Running);
        Ok(())
    }

    async fn stop(&self, server: &ComputeServer) -> Result<()> {
        self.intents.insert(server.id, State::Off);
        Ok(())
    }

    async fn reboot(&self, server: &ComputeServer) -> Result<()> {
        self.intents.insert(server.id, State::Running);
        Ok(())
    }

    async fn deprovision(&self, server: &ComputeServer) -> Result<()> {
        self.intents.insert(server.id, State::Deprovisioned);
        Ok(())
    }

    async fn state(&self, server: &ComputeServer) -> Result<State> {
        let state = self
            .intents
            .get(&server.id)
            .map(|s| *s)
            .unwrap_or_else(|| match server.state.stable_target() {
                State::Unknown => State::Off,
                other => other,
            });
        Ok(state)
    }

    async fn cost(&self, _server: &ComputeServer, _state: State) -> Result<f64> {
        Ok(0.0)
    }

    async fn get_startup_params(&self, server: &ComputeServer) -> Result<serde_json::Value> {
        let (arch, gpu) = match &server.configuration {
            Configuration::Onprem(c) => (c.arch.clone().unwrap_or_else(|| "x86_64".into()), c.gpu),
            _ => ("x86_64".to_string(), false),
        };
        Ok(serde_json::json!({
            "apiServer": self.api_server,
            "projectId": server.project_id,
            "computeServerId": server.id,
            "arch": arch,
            "gpu": gpu,
        }))
    }
}
