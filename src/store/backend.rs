use anyhow::Result;
use async_trait::async_trait;

use crate::server::{ComputeServer, Configuration, NewComputeServer, State};

/// Persistence for compute-server records. Pure data access.
///
/// Errors that callers must tell apart (`NotFound`, `Unauthorized`) are
/// raised as `ServerError` values inside the `anyhow::Error`.
#[async_trait]
pub trait ServerStore: Send + Sync {
    // ─── Initialization ─────────────────────────────────────────────────────

    /// Create tables if needed.
    async fn initialize(&self) -> Result<()>;

    // ─── Records ────────────────────────────────────────────────────────────

    /// Insert a new record in the `deprovisioned` state. Returns its id.
    async fn create(&self, server: &NewComputeServer) -> Result<i64>;

    /// Load a record the account owns or collaborates on.
    async fn get(&self, account_id: &str, id: i64) -> Result<ComputeServer>;

    /// Load a record without an authorization check.
    async fn get_unchecked(&self, id: i64) -> Result<ComputeServer>;

    /// Records the account owns or collaborates on, ordered by id.
    async fn list(&self, account_id: &str) -> Result<Vec<ComputeServer>>;

    /// Grant an account collaborator access to a project's servers.
    async fn add_collaborator(&self, project_id: &str, account_id: &str) -> Result<()>;

    // ─── Field updates ──────────────────────────────────────────────────────

    /// Persist a new state. Returns the state it replaced.
    async fn set_state(&self, id: i64, state: State) -> Result<State>;

    /// Set or clear (`None`) the last error.
    async fn set_error(&self, id: i64, error: Option<&str>) -> Result<()>;

    async fn set_cost_per_hour(&self, id: i64, cost_per_hour: f64) -> Result<()>;

    async fn set_configuration(&self, id: i64, configuration: &Configuration) -> Result<()>;

    async fn set_provisioned_configuration(
        &self,
        id: i64,
        configuration: &Configuration,
    ) -> Result<()>;
}
