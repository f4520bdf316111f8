pub mod onprem;
pub mod registry;

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::server::{Cloud, ComputeServer, Configuration, ServerError, State};

pub use registry::CloudRegistry;

/// Optional pieces of the adapter surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Deprovision,
    Suspend,
    Resume,
    NetworkUsage,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Deprovision => write!(f, "deprovision"),
            Capability::Suspend => write!(f, "suspend"),
            Capability::Resume => write!(f, "resume"),
            Capability::NetworkUsage => write!(f, "network usage"),
        }
    }
}

/// Error an adapter returns for a capability it does not implement.
pub fn unsupported(cloud: Cloud, capability: Capability) -> anyhow::Error {
    anyhow::Error::new(ServerError::Unsupported {
        cloud,
        capability: capability.to_string(),
    })
}

/// Polling schedule used while waiting for a stable state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub start: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            start: Duration::from_secs(5),
            max: Duration::from_secs(10),
            factor: 1.3,
        }
    }
}

impl Backoff {
    /// The interval after `current`, capped at `max`. Growth that does not
    /// fit a `Duration` lands on `max`.
    pub fn next(&self, current: Duration) -> Duration {
        Duration::try_from_secs_f64(current.as_secs_f64() * self.factor)
            .map_or(self.max, |next| next.min(self.max))
    }
}

/// Network egress over a time window.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NetworkUsage {
    /// GiB transferred.
    pub amount: f64,
    /// USD.
    pub cost: f64,
}

/// A proposed configuration change as seen by a cloud adapter.
#[derive(Debug)]
pub struct ConfigurationChange<'a> {
    pub id: i64,
    pub state: State,
    pub current: &'a Configuration,
    pub new: &'a Configuration,
    /// Changed top-level keys left for the cloud to judge.
    pub changed: &'a BTreeSet<String>,
}

/// Uniform lifecycle, cost and configuration surface of one backend.
#[async_trait]
pub trait CloudAdapter: Send + Sync {
    fn cloud(&self) -> Cloud;

    /// Deprovision, suspend, resume and network usage are opt-in.
    fn supports(&self, capability: Capability) -> bool {
        let _ = capability;
        false
    }

    /// Polling schedule for this backend.
    fn backoff(&self) -> Backoff {
        Backoff::default()
    }

    async fn start(&self, server: &ComputeServer) -> Result<()>;

    async fn stop(&self, server: &ComputeServer) -> Result<()>;

    async fn reboot(&self, server: &ComputeServer) -> Result<()>;

    async fn deprovision(&self, _server: &ComputeServer) -> Result<()> {
        Err(unsupported(self.cloud(), Capability::Deprovision))
    }

    async fn suspend(&self, _server: &ComputeServer) -> Result<()> {
        Err(unsupported(self.cloud(), Capability::Suspend))
    }

    async fn resume(&self, _server: &ComputeServer) -> Result<()> {
        Err(unsupported(self.cloud(), Capability::Resume))
    }

    /// Live state as reported by the backend.
    async fn state(&self, server: &ComputeServer) -> Result<State>;

    /// USD per hour while in `state`. Only ever called with stable states
    /// (or `Unknown`).
    async fn cost(&self, server: &ComputeServer, state: State) -> Result<f64>;

    /// Reject changes the backend cannot take in the current state. By
    /// default any cloud-specific key may only change while the server is
    /// off or deprovisioned.
    async fn validate_configuration_change(&self, change: &ConfigurationChange<'_>) -> Result<()> {
        if change.changed.is_empty() {
            return Ok(());
        }
        if !matches!(change.state, State::Off | State::Deprovisioned) {
            bail!(
                "{} can only be changed while the server is off or deprovisioned (it is {})",
                change
                    .changed
                    .iter()
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join(", "),
                change.state
            );
        }
        Ok(())
    }

    /// Apply an accepted change to live infrastructure. The default has
    /// nothing to do: the new configuration takes effect on the next start.
    async fn make_configuration_change(&self, _change: &ConfigurationChange<'_>) -> Result<()> {
        Ok(())
    }

    async fn get_network_usage(
        &self,
        _server: &ComputeServer,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<NetworkUsage> {
        Err(unsupported(self.cloud(), Capability::NetworkUsage))
    }

    /// Platform-specific boot parameters for the node's startup script.
    async fn get_startup_params(&self, server: &ComputeServer) -> Result<serde_json::Value>;
}
