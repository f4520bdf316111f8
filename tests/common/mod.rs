#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};

use stratus::billing::PurchaseLedger;
use stratus::cloud::onprem::OnpremCloud;
use stratus::cloud::{Backoff, Capability, CloudAdapter, CloudRegistry, ConfigurationChange};
use stratus::config::OrchestratorSettings;
use stratus::dns::{DnsChange, DnsProvider};
use stratus::project::{ApiKeyIssuer, DetailedState, DetailedStateReporter};
use stratus::server::configuration::TestConfiguration;
use stratus::server::{Cloud, ComputeServer, Configuration, NewComputeServer, State};
use stratus::store::backend::ServerStore;
use stratus::store::sqlite::SqliteBackend;
use stratus::Orchestrator;

pub const OWNER: &str = "alice";
pub const PROJECT: &str = "project-1";

/// Ordered log of every collaborator call, shared by all fakes.
#[derive(Clone, Default)]
pub struct Events(Arc<Mutex<Vec<String>>>);

impl Events {
    pub fn push(&self, event: &str) {
        self.0.lock().unwrap().push(event.to_string());
    }

    pub fn all(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.all().iter().filter(|e| *e == event).count()
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.all().iter().position(|e| e == event)
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

// ─── Scripted cloud adapter ─────────────────────────────────────────────────

/// A `test`-cloud adapter whose state answers are scripted. Once the script
/// runs out, the last answer repeats.
pub struct ScriptedCloud {
    events: Events,
    script: Mutex<VecDeque<State>>,
    last: Mutex<State>,
    failures: Mutex<Vec<(String, String)>>,
    panics: Mutex<Vec<String>>,
    capabilities: HashSet<Capability>,
    action_delay: Duration,
    state_delay: Duration,
}

impl ScriptedCloud {
    pub fn new(events: Events, initial: State) -> Self {
        Self {
            events,
            script: Mutex::new(VecDeque::new()),
            last: Mutex::new(initial),
            failures: Mutex::new(Vec::new()),
            panics: Mutex::new(Vec::new()),
            capabilities: [
                Capability::Deprovision,
                Capability::Suspend,
                Capability::Resume,
                Capability::NetworkUsage,
            ]
            .into_iter()
            .collect(),
            action_delay: Duration::ZERO,
            state_delay: Duration::ZERO,
        }
    }

    pub fn without(mut self, capability: Capability) -> Self {
        self.capabilities.remove(&capability);
        self
    }

    /// Make lifecycle calls take a while.
    pub fn with_action_delay(mut self, delay: Duration) -> Self {
        self.action_delay = delay;
        self
    }

    /// Make every state query hang for `delay`.
    pub fn with_state_delay(mut self, delay: Duration) -> Self {
        self.state_delay = delay;
        self
    }

    /// Answers for the next state queries, in order.
    pub fn script(&self, states: &[State]) {
        self.script.lock().unwrap().extend(states.iter().copied());
    }

    pub fn fail_next(&self, operation: &str, message: &str) {
        self.failures
            .lock()
            .unwrap()
            .push((operation.to_string(), message.to_string()));
    }

    /// Make the next call to `operation` panic, like a buggy plugin.
    pub fn panic_next(&self, operation: &str) {
        self.panics.lock().unwrap().push(operation.to_string());
    }

    fn call(&self, operation: &str) -> Result<()> {
        self.events.push(&format!("cloud:{}", operation));
        let armed = {
            let mut panics = self.panics.lock().unwrap();
            panics
                .iter()
                .position(|op| op == operation)
                .map(|pos| panics.remove(pos))
        };
        if let Some(operation) = armed {
            panic!("{} blew up", operation);
        }
        let mut failures = self.failures.lock().unwrap();
        if let Some(pos) = failures.iter().position(|(op, _)| op == operation) {
            let (_, message) = failures.remove(pos);
            bail!("{}", message);
        }
        Ok(())
    }

    async fn act(&self, operation: &str) -> Result<()> {
        if !self.action_delay.is_zero() {
            tokio::time::sleep(self.action_delay).await;
        }
        self.call(operation)
    }
}

#[async_trait]
impl CloudAdapter for ScriptedCloud {
    fn cloud(&self) -> Cloud {
        Cloud::Test
    }

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    fn backoff(&self) -> Backoff {
        Backoff {
            start: Duration::from_millis(5),
            max: Duration::from_millis(20),
            factor: 1.5,
        }
    }

    async fn start(&self, _server: &ComputeServer) -> Result<()> {
        self.act("start").await
    }

    async fn stop(&self, _server: &ComputeServer) -> Result<()> {
        self.act("stop").await
    }

    async fn reboot(&self, _server: &ComputeServer) -> Result<()> {
        self.act("reboot").await
    }

    async fn deprovision(&self, _server: &ComputeServer) -> Result<()> {
        self.act("deprovision").await
    }

    async fn suspend(&self, _server: &ComputeServer) -> Result<()> {
        self.act("suspend").await
    }

    async fn resume(&self, _server: &ComputeServer) -> Result<()> {
        self.act("resume").await
    }

    async fn state(&self, _server: &ComputeServer) -> Result<State> {
        if !self.state_delay.is_zero() {
            tokio::time::sleep(self.state_delay).await;
        }
        self.call("state")?;
        let next = self.script.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(state) = next {
            *last = state;
        }
        Ok(*last)
    }

    async fn cost(&self, _server: &ComputeServer, state: State) -> Result<f64> {
        Ok(match state {
            State::Running => 1.0,
            State::Off => 0.1,
            State::Suspended => 0.2,
            _ => 0.0,
        })
    }

    async fn validate_configuration_change(&self, change: &ConfigurationChange<'_>) -> Result<()> {
        self.call("validate")?;
        if change.changed.contains("costPerHour") && change.state == State::Running {
            bail!("costPerHour is fixed while running");
        }
        Ok(())
    }

    async fn make_configuration_change(&self, _change: &ConfigurationChange<'_>) -> Result<()> {
        self.call("configure")
    }

    async fn get_startup_params(&self, server: &ComputeServer) -> Result<Value> {
        Ok(serde_json::json!({ "id": server.id }))
    }
}

// ─── Recording collaborators ────────────────────────────────────────────────

pub struct RecordingLedger {
    events: Events,
    pub updates: Mutex<Vec<(i64, State, f64)>>,
    pub fail: Mutex<bool>,
}

#[async_trait]
impl PurchaseLedger for RecordingLedger {
    async fn update_purchase(&self, server: &ComputeServer, new_state: State) -> Result<()> {
        self.events.push(&format!("ledger:{}", new_state));
        if *self.fail.lock().unwrap() {
            bail!("ledger unavailable");
        }
        self.updates
            .lock()
            .unwrap()
            .push((server.id, new_state, server.cost_per_hour));
        Ok(())
    }
}

impl RecordingLedger {
    pub fn states(&self) -> Vec<State> {
        self.updates.lock().unwrap().iter().map(|u| u.1).collect()
    }
}

pub struct RecordingKeys {
    events: Events,
}

#[async_trait]
impl ApiKeyIssuer for RecordingKeys {
    async fn set_project_api_key(&self, _account_id: &str, _server: &ComputeServer) -> Result<()> {
        self.events.push("keys:set");
        Ok(())
    }

    async fn delete_project_api_key(
        &self,
        _account_id: &str,
        _server: &ComputeServer,
    ) -> Result<()> {
        self.events.push("keys:delete");
        Ok(())
    }
}

pub struct RecordingDns {
    events: Events,
    pub changes: Mutex<Vec<DnsChange>>,
}

#[async_trait]
impl DnsProvider for RecordingDns {
    async fn make_dns_change(&self, change: &DnsChange) -> Result<()> {
        self.events.push("dns:change");
        self.changes.lock().unwrap().push(change.clone());
        Ok(())
    }
}

pub struct RecordingReporter {
    pub details: Mutex<Vec<DetailedState>>,
}

#[async_trait]
impl DetailedStateReporter for RecordingReporter {
    async fn set_detailed_state(&self, detail: &DetailedState) -> Result<()> {
        self.details.lock().unwrap().push(detail.clone());
        Ok(())
    }
}

// ─── Harness ────────────────────────────────────────────────────────────────

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub store: Arc<SqliteBackend>,
    pub cloud: Arc<ScriptedCloud>,
    pub ledger: Arc<RecordingLedger>,
    pub dns: Arc<RecordingDns>,
    pub reporter: Arc<RecordingReporter>,
    pub events: Events,
}

pub fn test_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        wait_timeout: Duration::from_secs(2),
        stable_retries: 1,
        settle_delay: Duration::from_millis(10),
        ..Default::default()
    }
}

/// Orchestrator over an in-memory database, a scripted `test` cloud, the
/// built-in on-prem adapter and recording collaborators.
pub async fn harness(initial: State) -> Harness {
    harness_with(initial, |cloud| cloud, true).await
}

pub async fn harness_with(
    initial: State,
    customize: impl FnOnce(ScriptedCloud) -> ScriptedCloud,
    with_dns: bool,
) -> Harness {
    let events = Events::default();
    let store = Arc::new(SqliteBackend::open_memory().unwrap());
    store.initialize().await.unwrap();

    let cloud = Arc::new(customize(ScriptedCloud::new(events.clone(), initial)));
    let clouds = CloudRegistry::new()
        .with(cloud.clone())
        .with(Arc::new(OnpremCloud::new("http://localhost:5000")));

    let ledger = Arc::new(RecordingLedger {
        events: events.clone(),
        updates: Mutex::new(Vec::new()),
        fail: Mutex::new(false),
    });
    let keys = Arc::new(RecordingKeys {
        events: events.clone(),
    });
    let dns = Arc::new(RecordingDns {
        events: events.clone(),
        changes: Mutex::new(Vec::new()),
    });
    let reporter = Arc::new(RecordingReporter {
        details: Mutex::new(Vec::new()),
    });

    let mut orchestrator = Orchestrator::new(
        store.clone(),
        Arc::new(clouds),
        ledger.clone(),
        keys,
        reporter.clone(),
        test_settings(),
    );
    if with_dns {
        orchestrator = orchestrator.with_dns(dns.clone());
    }

    Harness {
        orchestrator,
        store,
        cloud,
        ledger,
        dns,
        reporter,
        events,
    }
}

impl Harness {
    /// Insert a server owned by `OWNER` and force its persisted state.
    pub async fn server(&self, state: State, configuration: Configuration) -> i64 {
        let id = self
            .store
            .create(&NewComputeServer {
                account_id: OWNER.to_string(),
                project_id: PROJECT.to_string(),
                title: "gpu box".to_string(),
                configuration,
            })
            .await
            .unwrap();
        self.store.set_state(id, state).await.unwrap();
        id
    }

    pub async fn test_server(&self, state: State) -> i64 {
        self.server(state, test_configuration(None)).await
    }

    pub async fn record(&self, id: i64) -> ComputeServer {
        self.store.get_unchecked(id).await.unwrap()
    }
}

pub fn test_configuration(dns: Option<&str>) -> Configuration {
    let mut configuration = TestConfiguration::default();
    configuration.common.dns = dns.map(str::to_string);
    Configuration::Test(configuration)
}

pub fn changes(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("changes must be an object, got {}", other),
    }
}
