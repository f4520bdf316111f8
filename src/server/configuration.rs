use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

use super::models::Cloud;

/// Fields every cloud's configuration carries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonConfiguration {
    /// Hostname published through the DNS provider while running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<String>,
    /// Token the node's proxy requires; fixed while the node is up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Path segments the file-sync agent skips.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_from_sync: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestConfiguration {
    #[serde(flatten)]
    pub common: CommonConfiguration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_per_hour: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleCloudConfiguration {
    #[serde(flatten)]
    pub common: CommonConfiguration,
    pub region: String,
    pub zone: String,
    pub machine_type: String,
    #[serde(default)]
    pub spot: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_size_gb: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerator_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerator_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LambdaCloudConfiguration {
    #[serde(flatten)]
    pub common: CommonConfiguration,
    pub instance_type_name: String,
    pub region_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FluidStackConfiguration {
    #[serde(flatten)]
    pub common: CommonConfiguration,
    pub plan: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreWeaveConfiguration {
    #[serde(flatten)]
    pub common: CommonConfiguration,
    pub gpu_type: String,
    #[serde(default = "one")]
    pub gpu_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_gb: Option<u32>,
}

fn one() -> u32 {
    1
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnpremConfiguration {
    #[serde(flatten)]
    pub common: CommonConfiguration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(default)]
    pub gpu: bool,
}

/// Backend-specific configuration, tagged by `cloud` so the tag always
/// matches the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cloud", rename_all = "kebab-case")]
pub enum Configuration {
    Test(TestConfiguration),
    GoogleCloud(GoogleCloudConfiguration),
    LambdaCloud(LambdaCloudConfiguration),
    FluidStack(FluidStackConfiguration),
    CoreWeave(CoreWeaveConfiguration),
    Onprem(OnpremConfiguration),
}

impl Configuration {
    pub fn cloud(&self) -> Cloud {
        match self {
            Configuration::Test(_) => Cloud::Test,
            Configuration::GoogleCloud(_) => Cloud::GoogleCloud,
            Configuration::LambdaCloud(_) => Cloud::LambdaCloud,
            Configuration::FluidStack(_) => Cloud::FluidStack,
            Configuration::CoreWeave(_) => Cloud::CoreWeave,
            Configuration::Onprem(_) => Cloud::Onprem,
        }
    }

    pub fn common(&self) -> &CommonConfiguration {
        match self {
            Configuration::Test(c) => &c.common,
            Configuration::GoogleCloud(c) => &c.common,
            Configuration::LambdaCloud(c) => &c.common,
            Configuration::FluidStack(c) => &c.common,
            Configuration::CoreWeave(c) => &c.common,
            Configuration::Onprem(c) => &c.common,
        }
    }

    pub fn dns(&self) -> Option<&str> {
        self.common().dns.as_deref().filter(|d| !d.is_empty())
    }

    /// The configuration as a JSON object, including the `cloud` tag.
    pub fn to_map(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => bail!("Configuration serialized to a non-object: {}", other),
        }
    }

    pub fn from_map(map: Map<String, Value>) -> Result<Self> {
        serde_json::from_value(Value::Object(map)).context("Invalid configuration")
    }

    /// Parse a JSON document, filling in the `cloud` tag when it is omitted.
    pub fn parse(json: &str, cloud: Cloud) -> Result<Self> {
        let mut map: Map<String, Value> =
            serde_json::from_str(json).context("Configuration must be a JSON object")?;
        map.entry("cloud")
            .or_insert_with(|| Value::String(cloud.to_string()));
        Self::from_map(map)
    }
}

/// Shallow merge: keys in `changes` replace keys in `current`; a `null`
/// value removes the key.
pub fn merge(current: &Map<String, Value>, changes: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = current.clone();
    for (key, value) in changes {
        if value.is_null() {
            merged.remove(key);
        } else {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Top-level keys whose values differ between two configurations, including
/// keys present in only one of them.
pub fn changed_keys(a: &Map<String, Value>, b: &Map<String, Value>) -> BTreeSet<String> {
    a.keys()
        .chain(b.keys())
        .filter(|key| a.get(*key) != b.get(*key))
        .cloned()
        .collect()
}
