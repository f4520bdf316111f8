pub mod inflight;
pub mod reconcile;
pub mod retry;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::billing::{CostAccountant, PurchaseLedger};
use crate::cloud::{Capability, CloudRegistry, NetworkUsage};
use crate::config::OrchestratorSettings;
use crate::dns::{validate_dns_name, DnsChange, DnsProvider};
use crate::drift::{detect_drift, DriftResult};
use crate::project::{ApiKeyIssuer, DetailedState, DetailedStateReporter};
use crate::server::{
    ComputeServer, Configuration, NewComputeServer, Operation, Precondition, ServerError,
    ServerResult, State,
};
use crate::store::backend::ServerStore;
use crate::store::sqlite::SqliteBackend;

pub use inflight::{InFlight, ServerGuard};

/// How long the "booting" marker stays visible after a start.
const BOOT_MARKER_TIMEOUT: Duration = Duration::from_secs(60);

/// Lifecycle entry points for compute servers.
///
/// Every operation authorizes the caller, checks capabilities, then joins or
/// starts the server's in-flight execution. Executions write the
/// transitional state before calling the backend and always finish by
/// re-reading the live state from the backend, on success and on failure.
#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) store: Arc<dyn ServerStore>,
    pub(crate) clouds: Arc<CloudRegistry>,
    pub(crate) accountant: Arc<CostAccountant>,
    pub(crate) dns: Option<Arc<dyn DnsProvider>>,
    pub(crate) settings: Arc<OrchestratorSettings>,
    pub(crate) inflight: Arc<InFlight>,
    keys: Arc<dyn ApiKeyIssuer>,
    reporter: Arc<dyn DetailedStateReporter>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ServerStore>,
        clouds: Arc<CloudRegistry>,
        ledger: Arc<dyn PurchaseLedger>,
        keys: Arc<dyn ApiKeyIssuer>,
        reporter: Arc<dyn DetailedStateReporter>,
        settings: OrchestratorSettings,
    ) -> Self {
        let accountant = CostAccountant::new(Arc::clone(&clouds), Arc::clone(&store), ledger);
        Self {
            store,
            clouds,
            accountant: Arc::new(accountant),
            dns: None,
            settings: Arc::new(settings),
            inflight: Arc::new(InFlight::new()),
            keys,
            reporter,
        }
    }

    /// Single-node setup: the SQLite database backs the store and every
    /// collaborator.
    pub fn sqlite(
        backend: Arc<SqliteBackend>,
        clouds: Arc<CloudRegistry>,
        settings: OrchestratorSettings,
        dns_enabled: bool,
    ) -> Self {
        let orchestrator = Self::new(
            backend.clone(),
            clouds,
            backend.clone(),
            backend.clone(),
            backend.clone(),
            settings,
        );
        if dns_enabled {
            orchestrator.with_dns(backend)
        } else {
            orchestrator
        }
    }

    pub fn with_dns(mut self, dns: Arc<dyn DnsProvider>) -> Self {
        self.dns = Some(dns);
        self
    }

    pub fn clouds(&self) -> &CloudRegistry {
        &self.clouds
    }

    pub fn accountant(&self) -> &CostAccountant {
        &self.accountant
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    // ─── Lifecycle operations ───────────────────────────────────────────────

    pub async fn start(&self, account_id: &str, id: i64) -> ServerResult<State> {
        self.submit(Operation::Start, account_id, id).await
    }

    pub async fn stop(&self, account_id: &str, id: i64) -> ServerResult<State> {
        self.submit(Operation::Stop, account_id, id).await
    }

    pub async fn deprovision(&self, account_id: &str, id: i64) -> ServerResult<State> {
        self.submit(Operation::Deprovision, account_id, id).await
    }

    pub async fn suspend(&self, account_id: &str, id: i64) -> ServerResult<State> {
        self.submit(Operation::Suspend, account_id, id).await
    }

    pub async fn resume(&self, account_id: &str, id: i64) -> ServerResult<State> {
        self.submit(Operation::Resume, account_id, id).await
    }

    /// Returns as soon as the backend accepted the reboot; the state is then
    /// typically still `starting`.
    pub async fn reboot(&self, account_id: &str, id: i64) -> ServerResult<State> {
        self.submit(Operation::Reboot, account_id, id).await
    }

    /// Query the live state, persist it and bill it. Collaborators may call
    /// this.
    ///
    /// While a mutation of the server is in progress the live state is only
    /// reported: the record keeps its transitional marker and nothing is
    /// billed.
    pub async fn state(&self, account_id: &str, id: i64) -> ServerResult<State> {
        self.submit(Operation::State, account_id, id).await
    }

    async fn submit(&self, operation: Operation, account_id: &str, id: i64) -> ServerResult<State> {
        let server = match operation {
            Operation::State => self.readable(account_id, id).await?,
            _ => self.owned(account_id, id).await?,
        };
        match required_capability(operation) {
            Some(capability) => {
                self.clouds.require(server.cloud, capability)?;
            }
            None => {
                self.clouds.adapter(server.cloud)?;
            }
        }

        let this = self.clone();
        self.inflight
            .run(id, operation, move || {
                async move { this.execute(operation, id).await }.boxed()
            })
            .await
    }

    async fn execute(&self, operation: Operation, id: i64) -> ServerResult<State> {
        if operation == Operation::State {
            let guard = self.inflight.try_lock(id);
            let server = self.load(id).await?;
            return match guard {
                Some(_) => self.refresh_state(&server).await,
                None => self.peek_state(&server).await,
            };
        }

        let server = self.load(id).await?;

        match operation.precondition(server.state) {
            Precondition::Reject => {
                return Err(ServerError::InvalidState {
                    id,
                    operation,
                    state: server.state,
                })
            }
            Precondition::AlreadyDone => {
                debug!(id, operation = %operation, state = %server.state, "Nothing to do");
                return self.refresh_state(&server).await;
            }
            Precondition::Proceed => {}
        }

        self.store
            .set_error(id, None)
            .await
            .map_err(ServerError::store)?;
        info!(id, cloud = %server.cloud, operation = %operation, state = %server.state, "Running operation");

        let outcome = AssertUnwindSafe(self.dispatch(operation, &server))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(ServerError::Internal(format!(
                    "{} panicked: {}",
                    operation,
                    panic_message(&*panic)
                )))
            });
        if let Err(e) = &outcome {
            error!(id, operation = %operation, error = %e, "Operation failed");
            self.record_error(id, e).await;
        }

        // The backend may have changed even if the call failed.
        let refreshed = self.refresh_state(&server).await;
        match (outcome, refreshed) {
            (Ok(()), Ok(state)) => Ok(state),
            (Ok(()), Err(e)) => {
                self.record_error(id, &e).await;
                Err(e)
            }
            (Err(e), Ok(_)) => Err(e),
            (Err(e), Err(refresh_error)) => {
                warn!(id, error = %refresh_error, "State refresh after failure also failed");
                Err(e)
            }
        }
    }

    async fn dispatch(&self, operation: Operation, server: &ComputeServer) -> ServerResult<()> {
        match operation {
            Operation::Start => self.run_start(server).await,
            Operation::Stop | Operation::Deprovision => self.run_shutdown(operation, server).await,
            Operation::Suspend => self.run_suspend(server).await,
            Operation::Resume => self.run_resume(server).await,
            Operation::Reboot => self.run_reboot(server).await,
            Operation::State => Ok(()),
        }
    }

    async fn run_start(&self, server: &ComputeServer) -> ServerResult<()> {
        let adapter = self.clouds.adapter(server.cloud)?;
        self.keys
            .set_project_api_key(&server.account_id, server)
            .await
            .map_err(ServerError::backend)?;
        self.mark(server.id, State::Starting).await?;
        adapter.start(server).await.map_err(ServerError::backend)?;

        let state = self.stabilize(server).await?;
        if state == State::Running {
            self.store
                .set_provisioned_configuration(server.id, &server.configuration)
                .await
                .map_err(ServerError::store)?;
            self.report(server, "vm", "booting", Some(10)).await;
            if let Some(name) = server.configuration.dns() {
                self.publish_dns(server, None, Some(name)).await;
            }
        }
        Ok(())
    }

    /// Stop and deprovision: the node loses its project access before the
    /// backend is touched.
    async fn run_shutdown(&self, operation: Operation, server: &ComputeServer) -> ServerResult<()> {
        let adapter = self.clouds.adapter(server.cloud)?;
        self.mark(server.id, State::Stopping).await?;
        self.revoke_api_key(server).await;
        let dispatched = match operation {
            Operation::Deprovision => adapter.deprovision(server).await,
            _ => adapter.stop(server).await,
        };
        dispatched.map_err(ServerError::backend)?;

        self.stabilize(server).await?;
        if let Some(name) = server.configuration.dns() {
            self.publish_dns(server, Some(name), None).await;
        }
        Ok(())
    }

    async fn run_suspend(&self, server: &ComputeServer) -> ServerResult<()> {
        let adapter = self.clouds.require(server.cloud, Capability::Suspend)?;
        self.mark(server.id, State::Suspending).await?;
        adapter.suspend(server).await.map_err(ServerError::backend)?;
        self.stabilize(server).await?;
        Ok(())
    }

    async fn run_resume(&self, server: &ComputeServer) -> ServerResult<()> {
        let adapter = self.clouds.require(server.cloud, Capability::Resume)?;
        self.mark(server.id, State::Starting).await?;
        adapter.resume(server).await.map_err(ServerError::backend)?;
        self.stabilize(server).await?;
        Ok(())
    }

    async fn run_reboot(&self, server: &ComputeServer) -> ServerResult<()> {
        let adapter = self.clouds.adapter(server.cloud)?;
        self.mark(server.id, State::Stopping).await?;
        adapter.reboot(server).await.map_err(ServerError::backend)?;
        self.mark(server.id, State::Starting).await
    }

    /// Read the live state from the backend without touching the record.
    async fn peek_state(&self, server: &ComputeServer) -> ServerResult<State> {
        let adapter = self.clouds.adapter(server.cloud)?;
        let state = adapter.state(server).await.map_err(ServerError::backend)?;
        debug!(id = server.id, state = %state, marker = %server.state, "Operation in progress, state not persisted");
        Ok(state)
    }

    /// Read the live state from the backend, persist it and bill it. A
    /// deprovisioned server also loses any API key it still holds.
    pub(crate) async fn refresh_state(&self, server: &ComputeServer) -> ServerResult<State> {
        let adapter = self.clouds.adapter(server.cloud)?;
        let state = adapter.state(server).await.map_err(ServerError::backend)?;
        let previous = self
            .store
            .set_state(server.id, state)
            .await
            .map_err(ServerError::store)?;
        self.accountant.observe(server, previous, state).await;
        if state == State::Deprovisioned {
            self.revoke_api_key(server).await;
        }
        debug!(id = server.id, previous = %previous, state = %state, "Refreshed state");
        Ok(state)
    }

    // ─── Queries ────────────────────────────────────────────────────────────

    /// Create a record in the `deprovisioned` state.
    pub async fn create(
        &self,
        account_id: &str,
        project_id: &str,
        title: &str,
        configuration: Configuration,
    ) -> ServerResult<ComputeServer> {
        if let Some(name) = configuration.dns() {
            validate_dns_name(name).map_err(ServerError::validation)?;
        }
        let id = self
            .store
            .create(&NewComputeServer {
                account_id: account_id.to_string(),
                project_id: project_id.to_string(),
                title: title.to_string(),
                configuration,
            })
            .await
            .map_err(ServerError::store)?;
        info!(id, account = account_id, project = project_id, "Created compute server");
        self.load(id).await
    }

    pub async fn get(&self, account_id: &str, id: i64) -> ServerResult<ComputeServer> {
        self.readable(account_id, id).await
    }

    pub async fn list(&self, account_id: &str) -> ServerResult<Vec<ComputeServer>> {
        self.store
            .list(account_id)
            .await
            .map_err(ServerError::store)
    }

    /// Hourly cost of the server in its persisted state.
    pub async fn cost(&self, account_id: &str, id: i64) -> ServerResult<f64> {
        let server = self.readable(account_id, id).await?;
        self.accountant
            .compute_cost(&server, server.state)
            .await
            .map_err(ServerError::backend)
    }

    pub async fn network_usage(
        &self,
        account_id: &str,
        id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> ServerResult<NetworkUsage> {
        if end < start {
            return Err(ServerError::Validation(format!(
                "network usage window ends ({}) before it starts ({})",
                end, start
            )));
        }
        let server = self.readable(account_id, id).await?;
        let adapter = self
            .clouds
            .require(server.cloud, Capability::NetworkUsage)?;
        adapter
            .get_network_usage(&server, start, end)
            .await
            .map_err(ServerError::backend)
    }

    /// Boot parameters for the node's startup script. Privileged: no
    /// account check.
    pub async fn startup_params(&self, id: i64) -> ServerResult<serde_json::Value> {
        let server = self.load(id).await?;
        let adapter = self.clouds.adapter(server.cloud)?;
        adapter
            .get_startup_params(&server)
            .await
            .map_err(ServerError::backend)
    }

    pub async fn drift(&self, account_id: &str, id: i64) -> ServerResult<Vec<DriftResult>> {
        let server = self.readable(account_id, id).await?;
        detect_drift(&server).map_err(|e| ServerError::Internal(format!("{:#}", e)))
    }

    pub fn has_capability(&self, server: &ComputeServer, capability: Capability) -> bool {
        self.clouds.has_capability(server.cloud, capability)
    }

    // ─── Helpers ────────────────────────────────────────────────────────────

    pub(crate) async fn load(&self, id: i64) -> ServerResult<ComputeServer> {
        self.store
            .get_unchecked(id)
            .await
            .map_err(ServerError::store)
    }

    /// The record, if the account owns it or collaborates on its project.
    pub(crate) async fn readable(&self, account_id: &str, id: i64) -> ServerResult<ComputeServer> {
        self.store
            .get(account_id, id)
            .await
            .map_err(ServerError::store)
    }

    /// The record, if the account owns it.
    pub(crate) async fn owned(&self, account_id: &str, id: i64) -> ServerResult<ComputeServer> {
        let server = self.readable(account_id, id).await?;
        if server.account_id != account_id {
            return Err(ServerError::Unauthorized {
                account_id: account_id.to_string(),
                id,
                action: "modify",
            });
        }
        Ok(server)
    }

    /// Persist a transitional marker. Not billed: only states observed from
    /// the backend reach the ledger.
    async fn mark(&self, id: i64, state: State) -> ServerResult<()> {
        debug!(id, state = %state, "Marking state");
        self.store
            .set_state(id, state)
            .await
            .map_err(ServerError::store)?;
        Ok(())
    }

    async fn record_error(&self, id: i64, err: &ServerError) {
        if let Err(e) = self.store.set_error(id, Some(&err.to_string())).await {
            warn!(id, error = %e, "Failed to record error");
        }
    }

    async fn revoke_api_key(&self, server: &ComputeServer) {
        if let Err(e) = self
            .keys
            .delete_project_api_key(&server.account_id, server)
            .await
        {
            warn!(id = server.id, error = %e, "Failed to revoke project API key");
        }
    }

    async fn report(&self, server: &ComputeServer, name: &str, state: &str, progress: Option<u8>) {
        let detail = DetailedState {
            project_id: server.project_id.clone(),
            id: server.id,
            name: name.to_string(),
            state: state.to_string(),
            timeout: Some(BOOT_MARKER_TIMEOUT),
            progress,
        };
        if let Err(e) = self.reporter.set_detailed_state(&detail).await {
            warn!(id = server.id, name, error = %e, "Failed to report detailed state");
        }
    }

    /// DNS side effect of a lifecycle transition. Logged, never fatal.
    async fn publish_dns(
        &self,
        server: &ComputeServer,
        previous_name: Option<&str>,
        name: Option<&str>,
    ) {
        let Some(dns) = self.dns.as_ref().filter(|dns| dns.has_dns()) else {
            return;
        };
        let change = DnsChange {
            id: server.id,
            previous_name: previous_name.map(str::to_string),
            name: name.map(str::to_string),
            cloud: server.cloud,
        };
        if let Err(e) = dns.make_dns_change(&change).await {
            warn!(id = server.id, error = %e, "DNS update failed");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

fn required_capability(operation: Operation) -> Option<Capability> {
    match operation {
        Operation::Deprovision => Some(Capability::Deprovision),
        Operation::Suspend => Some(Capability::Suspend),
        Operation::Resume => Some(Capability::Resume),
        _ => None,
    }
}
