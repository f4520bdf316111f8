use std::collections::BTreeSet;

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::cloud::ConfigurationChange;
use crate::dns::{validate_dns_name, DnsChange};
use crate::orchestrator::Orchestrator;
use crate::server::configuration::{changed_keys, merge};
use crate::server::{ComputeServer, Configuration, ServerError, ServerResult, State};

/// Keys that are fixed while the node is up (or frozen in memory).
const STATE_GATED_KEYS: [&str; 2] = ["authToken", "excludeFromSync"];

/// An accepted configuration change.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigurationPlan {
    pub current: Configuration,
    pub new: Configuration,
    /// The `dns` hostname was set, changed or cleared.
    pub dns_changed: bool,
    /// Changed keys left for the cloud adapter to judge and apply.
    pub cloud_keys: BTreeSet<String>,
}

impl ConfigurationPlan {
    fn change<'a>(&'a self, server: &ComputeServer) -> ConfigurationChange<'a> {
        ConfigurationChange {
            id: server.id,
            state: server.state,
            current: &self.current,
            new: &self.new,
            changed: &self.cloud_keys,
        }
    }
}

/// Merge `changes` into the server's configuration and run every check that
/// needs no backend. `None` means the change is a no-op.
///
/// A `null` value removes a key. Cloud-specific keys are only collected
/// here; the adapter validates them.
pub fn plan_change(
    server: &ComputeServer,
    changes: &Map<String, Value>,
) -> ServerResult<Option<ConfigurationPlan>> {
    let current_map = server.configuration.to_map().map_err(internal)?;
    let merged = merge(&current_map, changes);

    match merged.get("cloud").and_then(Value::as_str) {
        Some(cloud) if cloud == server.cloud.as_str() => {}
        Some(cloud) => {
            return Err(ServerError::Validation(format!(
                "cloud is fixed to '{}' and cannot become '{}'",
                server.cloud, cloud
            )))
        }
        None => {
            return Err(ServerError::Validation(format!(
                "cloud is fixed to '{}' and cannot be removed",
                server.cloud
            )))
        }
    }

    let new = Configuration::from_map(merged).map_err(ServerError::validation)?;
    let new_map = new.to_map().map_err(internal)?;
    if let Some(unknown) = changes
        .iter()
        .find(|(key, value)| !value.is_null() && !new_map.contains_key(*key))
        .map(|(key, _)| key)
    {
        return Err(ServerError::Validation(format!(
            "'{}' is not a {} configuration field",
            unknown, server.cloud
        )));
    }

    let mut changed = changed_keys(&current_map, &new_map);
    if changed.is_empty() {
        return Ok(None);
    }

    // DNS may change in any state.
    let dns_changed = changed.remove("dns");
    if dns_changed {
        if let Some(name) = new.dns() {
            validate_dns_name(name).map_err(ServerError::validation)?;
        }
    }

    let gated: Vec<&str> = STATE_GATED_KEYS
        .iter()
        .copied()
        .filter(|key| changed.contains(*key))
        .collect();
    if !gated.is_empty()
        && matches!(
            server.state,
            State::Running | State::Suspended | State::Suspending
        )
    {
        return Err(ServerError::Validation(format!(
            "{} cannot be changed while the server is {}",
            gated.join(", "),
            server.state
        )));
    }
    if changed.contains("excludeFromSync") {
        if let Some(paths) = &new.common().exclude_from_sync {
            validate_exclude_from_sync(paths)?;
        }
    }
    for key in STATE_GATED_KEYS {
        changed.remove(key);
    }

    Ok(Some(ConfigurationPlan {
        current: server.configuration.clone(),
        new,
        dns_changed,
        cloud_keys: changed,
    }))
}

/// Sync exclusions are single path segments.
pub fn validate_exclude_from_sync(paths: &[String]) -> ServerResult<()> {
    for path in paths {
        if path.is_empty() {
            return Err(ServerError::Validation(
                "excludeFromSync entries must not be empty".to_string(),
            ));
        }
        if path.contains('/') || path.contains('|') {
            return Err(ServerError::Validation(format!(
                "excludeFromSync entry '{}' must not contain '/' or '|'",
                path
            )));
        }
    }
    Ok(())
}

fn internal(err: anyhow::Error) -> ServerError {
    ServerError::Internal(format!("{:#}", err))
}

impl Orchestrator {
    /// Check a change without persisting anything.
    pub async fn validate_configuration_change(
        &self,
        account_id: &str,
        id: i64,
        changes: &Map<String, Value>,
    ) -> ServerResult<()> {
        let server = self.owned(account_id, id).await?;
        self.validate_plan(&server, changes).await?;
        Ok(())
    }

    /// Validate, apply and persist a configuration change. Runs under the
    /// server's lock, so it never interleaves with a lifecycle operation.
    ///
    /// Nothing is applied to a deprovisioned server: the new configuration
    /// takes effect when it is next started.
    pub async fn set_configuration(
        &self,
        account_id: &str,
        id: i64,
        changes: &Map<String, Value>,
    ) -> ServerResult<ComputeServer> {
        self.owned(account_id, id).await?;
        let _guard = self.inflight.lock(id).await;

        let server = self.load(id).await?;
        let Some(plan) = self.validate_plan(&server, changes).await? else {
            debug!(id, "Configuration unchanged");
            return Ok(server);
        };

        if server.state != State::Deprovisioned {
            self.apply_plan(&server, &plan).await?;
        }
        self.store
            .set_configuration(id, &plan.new)
            .await
            .map_err(ServerError::store)?;
        info!(
            id,
            dns = plan.dns_changed,
            keys = ?plan.cloud_keys,
            "Configuration changed"
        );
        self.load(id).await
    }

    async fn validate_plan(
        &self,
        server: &ComputeServer,
        changes: &Map<String, Value>,
    ) -> ServerResult<Option<ConfigurationPlan>> {
        let Some(plan) = plan_change(server, changes)? else {
            return Ok(None);
        };
        if !plan.cloud_keys.is_empty() {
            let adapter = self.clouds.adapter(server.cloud)?;
            adapter
                .validate_configuration_change(&plan.change(server))
                .await
                .map_err(ServerError::validation)?;
        }
        Ok(Some(plan))
    }

    async fn apply_plan(&self, server: &ComputeServer, plan: &ConfigurationPlan) -> ServerResult<()> {
        if plan.dns_changed {
            match self.dns.as_ref().filter(|dns| dns.has_dns()) {
                Some(dns) => {
                    let previous_name = plan.current.dns();
                    // Only a running server is published.
                    let name = plan.new.dns().filter(|_| server.state == State::Running);
                    if previous_name.is_some() || name.is_some() {
                        let change = DnsChange {
                            id: server.id,
                            previous_name: previous_name.map(str::to_string),
                            name: name.map(str::to_string),
                            cloud: server.cloud,
                        };
                        dns.make_dns_change(&change)
                            .await
                            .map_err(ServerError::backend)?;
                    }
                }
                None => debug!(id = server.id, "No DNS integration, skipping DNS update"),
            }
        }

        if !plan.cloud_keys.is_empty() {
            let adapter = self.clouds.adapter(server.cloud)?;
            adapter
                .make_configuration_change(&plan.change(server))
                .await
                .map_err(ServerError::backend)?;
        }
        Ok(())
    }
}
