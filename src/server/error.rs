use std::time::Duration;

use super::models::{Cloud, Operation, State};

/// Errors surfaced by the orchestrator.
///
/// Authorization, unsupported-operation, state and validation errors are
/// raised before anything is mutated. Backend and timeout errors are also
/// written to the record's `error` column before being returned.
///
/// The type is `Clone` so one in-flight result can be handed to every caller
/// that joined it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServerError {
    #[error("compute server {0} not found")]
    NotFound(i64),

    #[error("account '{account_id}' may not {action} compute server {id}")]
    Unauthorized {
        account_id: String,
        id: i64,
        action: &'static str,
    },

    #[error("no cloud adapter registered for '{0}'")]
    NoAdapter(Cloud),

    #[error("cloud '{cloud}' does not support {capability}")]
    Unsupported { cloud: Cloud, capability: String },

    #[error("cannot {operation} compute server {id} while it is {state}")]
    InvalidState {
        id: i64,
        operation: Operation,
        state: State,
    },

    #[error("invalid configuration change: {0}")]
    Validation(String),

    #[error("{0}")]
    Backend(String),

    #[error("compute server {id} did not reach a stable state within {waited:?} (last state: {last})")]
    Timeout {
        id: i64,
        waited: Duration,
        last: State,
    },

    #[error("state store error: {0}")]
    Store(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ServerResult<T> = std::result::Result<T, ServerError>;

impl ServerError {
    /// Convert an adapter failure, keeping typed errors the adapter raised
    /// itself (e.g. unsupported capabilities).
    pub fn backend(err: anyhow::Error) -> Self {
        match err.downcast::<ServerError>() {
            Ok(typed) => typed,
            Err(err) => ServerError::Backend(format!("{:#}", err)),
        }
    }

    pub fn store(err: anyhow::Error) -> Self {
        match err.downcast::<ServerError>() {
            Ok(typed) => typed,
            Err(err) => ServerError::Store(format!("{:#}", err)),
        }
    }

    /// Adapter validation failures become validation errors.
    pub fn validation(err: anyhow::Error) -> Self {
        match err.downcast::<ServerError>() {
            Ok(typed) => typed,
            Err(err) => ServerError::Validation(format!("{:#}", err)),
        }
    }
}
