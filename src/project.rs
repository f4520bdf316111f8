use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::server::ComputeServer;

/// Grants and revokes the project-scoped credential a node uses to call
/// back into its home project. Both calls are idempotent.
#[async_trait]
pub trait ApiKeyIssuer: Send + Sync {
    async fn set_project_api_key(&self, account_id: &str, server: &ComputeServer) -> Result<()>;

    async fn delete_project_api_key(&self, account_id: &str, server: &ComputeServer)
        -> Result<()>;
}

/// Sub-resource progress marker shown next to a server, e.g. "vm: booting, 10%".
#[derive(Debug, Clone, PartialEq)]
pub struct DetailedState {
    pub project_id: String,
    pub id: i64,
    pub name: String,
    pub state: String,
    pub timeout: Option<Duration>,
    pub progress: Option<u8>,
}

/// Observational only; nothing reads these back into the state machine.
#[async_trait]
pub trait DetailedStateReporter: Send + Sync {
    async fn set_detailed_state(&self, detail: &DetailedState) -> Result<()>;
}
