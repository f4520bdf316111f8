use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::cloud::CloudRegistry;
use crate::server::{ComputeServer, State};
use crate::store::backend::ServerStore;

/// Billing ledger. Updates are best-effort: a failure is logged by the
/// caller and never fails a lifecycle operation, so lifecycle state and
/// billing state may briefly disagree until the next transition.
#[async_trait]
pub trait PurchaseLedger: Send + Sync {
    /// `server.cost_per_hour` holds the freshly computed rate for `new_state`.
    async fn update_purchase(&self, server: &ComputeServer, new_state: State) -> Result<()>;
}

/// Recomputes hourly cost on every observed state and keeps the ledger in
/// step with transitions.
pub struct CostAccountant {
    clouds: Arc<CloudRegistry>,
    store: Arc<dyn ServerStore>,
    ledger: Arc<dyn PurchaseLedger>,
}

impl CostAccountant {
    pub fn new(
        clouds: Arc<CloudRegistry>,
        store: Arc<dyn ServerStore>,
        ledger: Arc<dyn PurchaseLedger>,
    ) -> Self {
        Self {
            clouds,
            store,
            ledger,
        }
    }

    /// Hourly cost of `server` in `state`. Deprovisioned servers cost
    /// nothing; transitional states are priced as their stable target so the
    /// result does not depend on how long a transition takes.
    pub async fn compute_cost(&self, server: &ComputeServer, state: State) -> Result<f64> {
        if state == State::Deprovisioned {
            return Ok(0.0);
        }
        let adapter = self.clouds.adapter(server.cloud)?;
        adapter.cost(server, state.stable_target()).await
    }

    /// Recompute and persist the hourly rate for an observation of `state`.
    /// Keeps the last known rate if the lookup fails.
    pub async fn refresh_rate(&self, server: &ComputeServer, state: State) -> f64 {
        let cost = match self.compute_cost(server, state).await {
            Ok(cost) => cost,
            Err(e) => {
                warn!(id = server.id, state = %state, error = %e, "Cost lookup failed");
                server.cost_per_hour
            }
        };

        if let Err(e) = self.store.set_cost_per_hour(server.id, cost).await {
            warn!(id = server.id, error = %e, "Failed to persist hourly cost");
        }
        cost
    }

    /// Record an observation of `state` (previously persisted: `previous`).
    /// The ledger only hears about transitions. Never fails.
    pub async fn observe(&self, server: &ComputeServer, previous: State, state: State) {
        let cost = self.refresh_rate(server, state).await;
        if previous == state {
            return;
        }

        let mut snapshot = server.clone();
        snapshot.state = state;
        snapshot.cost_per_hour = cost;
        debug!(id = server.id, state = %state, cost_per_hour = cost, "Updating purchase");
        if let Err(e) = self.ledger.update_purchase(&snapshot, state).await {
            warn!(
                id = server.id,
                state = %state,
                error = %e,
                "Purchase update failed; billing catches up on the next transition"
            );
        }
    }
}
