use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::cloud::Backoff;
use crate::server::Cloud;

// ─── Runtime Settings ───────────────────────────────────────────────────────

/// Settings the orchestrator runs with, resolved from the settings file.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Upper bound on one stabilization wait.
    pub wait_timeout: Duration,
    /// Extra stabilization attempts after the first one fails.
    pub stable_retries: u32,
    /// Pause before the first retry; doubles on each further retry.
    pub settle_delay: Duration,
    /// Per-cloud polling overrides. Clouds not listed use the adapter's own.
    pub backoff: HashMap<Cloud, Backoff>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(300),
            stable_retries: 2,
            settle_delay: Duration::from_secs(1),
            backoff: HashMap::new(),
        }
    }
}

impl OrchestratorSettings {
    pub fn backoff_for(&self, cloud: Cloud, adapter_default: Backoff) -> Backoff {
        self.backoff.get(&cloud).copied().unwrap_or(adapter_default)
    }
}

// ─── Settings File (stratus.yaml) ───────────────────────────────────────────

/// Root of `stratus.yaml`. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub orchestrator: YamlOrchestrator,
    #[serde(default)]
    pub dns: YamlDns,
    #[serde(default)]
    pub clouds: YamlClouds,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YamlOrchestrator {
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,
    #[serde(default = "default_stable_retries")]
    pub stable_retries: u32,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default)]
    pub backoff: HashMap<Cloud, YamlBackoff>,
}

impl Default for YamlOrchestrator {
    fn default() -> Self {
        Self {
            wait_timeout_secs: default_wait_timeout_secs(),
            stable_retries: default_stable_retries(),
            settle_delay_ms: default_settle_delay_ms(),
            backoff: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YamlBackoff {
    pub start_ms: u64,
    pub max_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YamlDns {
    /// Publish `dns` hostnames through the local DNS table.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for YamlDns {
    fn default() -> Self {
        Self {
            enabled: default_true(),
        }
    }
}

/// Settings for the built-in adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YamlClouds {
    /// State polls a simulated transition stays transitional for.
    #[serde(default = "default_boot_polls")]
    pub test_boot_polls: u32,
    /// Address on-prem nodes call back to.
    #[serde(default = "default_api_server")]
    pub onprem_api_server: String,
}

impl Default for YamlClouds {
    fn default() -> Self {
        Self {
            test_boot_polls: default_boot_polls(),
            onprem_api_server: default_api_server(),
        }
    }
}

fn default_wait_timeout_secs() -> u64 {
    300
}

fn default_stable_retries() -> u32 {
    2
}

fn default_settle_delay_ms() -> u64 {
    1000
}

fn default_backoff_factor() -> f64 {
    1.3
}

fn default_true() -> bool {
    true
}

fn default_boot_polls() -> u32 {
    1
}

fn default_api_server() -> String {
    "http://localhost:5000".to_string()
}
