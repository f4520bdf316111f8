use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::configuration::Configuration;

// ─── Cloud ──────────────────────────────────────────────────────────────────

/// Backend a compute server lives on. Immutable once the record exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Cloud {
    Test,
    GoogleCloud,
    LambdaCloud,
    FluidStack,
    CoreWeave,
    Onprem,
}

impl Cloud {
    pub const ALL: [Cloud; 6] = [
        Cloud::Test,
        Cloud::GoogleCloud,
        Cloud::LambdaCloud,
        Cloud::FluidStack,
        Cloud::CoreWeave,
        Cloud::Onprem,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Cloud::Test => "test",
            Cloud::GoogleCloud => "google-cloud",
            Cloud::LambdaCloud => "lambda-cloud",
            Cloud::FluidStack => "fluid-stack",
            Cloud::CoreWeave => "core-weave",
            Cloud::Onprem => "onprem",
        }
    }
}

impl fmt::Display for Cloud {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cloud {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Cloud::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown cloud '{}'", s))
    }
}

// ─── Lifecycle State ────────────────────────────────────────────────────────

/// Lifecycle state of a compute server.
///
/// `Running`, `Off`, `Suspended` and `Deprovisioned` are stable: a backend
/// stays there until a new operation is issued. The rest are transitional and
/// are billed as the stable state they converge to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Off,
    Starting,
    Running,
    Stopping,
    Suspending,
    Suspended,
    Deprovisioned,
    Unknown,
}

impl State {
    pub const ALL: [State; 8] = [
        State::Off,
        State::Starting,
        State::Running,
        State::Stopping,
        State::Suspending,
        State::Suspended,
        State::Deprovisioned,
        State::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            State::Off => "off",
            State::Starting => "starting",
            State::Running => "running",
            State::Stopping => "stopping",
            State::Suspending => "suspending",
            State::Suspended => "suspended",
            State::Deprovisioned => "deprovisioned",
            State::Unknown => "unknown",
        }
    }

    pub fn is_stable(&self) -> bool {
        matches!(
            self,
            State::Running | State::Off | State::Suspended | State::Deprovisioned
        )
    }

    /// The stable state this state converges to. Stable states map to
    /// themselves; `Unknown` has no target and maps to itself.
    pub fn stable_target(&self) -> State {
        match self {
            State::Starting => State::Running,
            State::Stopping => State::Off,
            State::Suspending => State::Suspended,
            other => *other,
        }
    }

    /// True while a backend is still converging.
    pub fn is_transitional(&self) -> bool {
        !self.is_stable()
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        State::ALL
            .iter()
            .copied()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown compute server state '{}'", s))
    }
}

// ─── Operations ─────────────────────────────────────────────────────────────

/// Orchestrator entry points. Also the key (together with the server id)
/// under which concurrent identical calls are coalesced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Start,
    Stop,
    Deprovision,
    Suspend,
    Resume,
    Reboot,
    State,
}

/// What an operation should do given the persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    Proceed,
    /// Already in the operation's end state; only refresh.
    AlreadyDone,
    Reject,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Deprovision => "deprovision",
            Operation::Suspend => "suspend",
            Operation::Resume => "resume",
            Operation::Reboot => "reboot",
            Operation::State => "state",
        }
    }

    /// Check whether this operation may run from `state`.
    pub fn precondition(&self, state: State) -> Precondition {
        use Precondition::*;
        match (self, state) {
            (Operation::State, _) => Proceed,

            (Operation::Start, State::Running) => AlreadyDone,
            (
                Operation::Start,
                State::Off | State::Deprovisioned | State::Suspended | State::Unknown,
            ) => Proceed,
            (Operation::Start, _) => Reject,

            (Operation::Stop, State::Off | State::Deprovisioned) => AlreadyDone,
            (Operation::Stop, _) => Proceed,

            (Operation::Deprovision, State::Deprovisioned) => AlreadyDone,
            (Operation::Deprovision, _) => Proceed,

            (Operation::Suspend, State::Suspended) => AlreadyDone,
            (Operation::Suspend, State::Running) => Proceed,
            (Operation::Suspend, _) => Reject,

            (Operation::Resume, State::Running) => AlreadyDone,
            (Operation::Resume, State::Suspended) => Proceed,
            (Operation::Resume, _) => Reject,

            (Operation::Reboot, State::Running) => Proceed,
            (Operation::Reboot, _) => Reject,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Compute Server Record ──────────────────────────────────────────────────

/// One row per compute node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeServer {
    pub id: i64,
    pub account_id: String,
    pub project_id: String,
    pub title: String,
    pub cloud: Cloud,
    pub configuration: Configuration,
    pub provisioned_configuration: Option<Configuration>,
    pub state: State,
    pub error: Option<String>,
    pub cost_per_hour: f64,
    pub created_at: String,
    pub updated_at: String,
}

/// Input for creating a new record. The cloud is taken from the configuration.
#[derive(Debug, Clone)]
pub struct NewComputeServer {
    pub account_id: String,
    pub project_id: String,
    pub title: String,
    pub configuration: Configuration,
}
