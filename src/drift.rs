use anyhow::Result;
use serde_json::Value;

use crate::server::configuration::changed_keys;
use crate::server::ComputeServer;

/// A configuration key that no longer matches what the server was last
/// started with.
#[derive(Debug, Clone, PartialEq)]
pub struct DriftResult {
    pub key: String,
    pub drift_type: DriftType,
    pub provisioned: Option<Value>,
    pub current: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftType {
    /// Set now, absent when provisioned.
    Added,
    /// Present when provisioned, since removed.
    Removed,
    Changed,
}

impl DriftType {
    pub fn symbol(&self) -> &'static str {
        match self {
            DriftType::Added => "+",
            DriftType::Removed => "-",
            DriftType::Changed => "~",
        }
    }
}

/// Compare the provisioned snapshot against the requested configuration.
/// A server that never reached `running` has nothing to drift from.
pub fn detect_drift(server: &ComputeServer) -> Result<Vec<DriftResult>> {
    let provisioned = match &server.provisioned_configuration {
        Some(provisioned) => provisioned.to_map()?,
        None => return Ok(Vec::new()),
    };
    let current = server.configuration.to_map()?;

    let drifts = changed_keys(&provisioned, &current)
        .into_iter()
        .map(|key| {
            let before = provisioned.get(&key).cloned();
            let after = current.get(&key).cloned();
            let drift_type = match (&before, &after) {
                (None, Some(_)) => DriftType::Added,
                (Some(_), None) => DriftType::Removed,
                _ => DriftType::Changed,
            };
            DriftResult {
                key,
                drift_type,
                provisioned: before,
                current: after,
            }
        })
        .collect();
    Ok(drifts)
}
