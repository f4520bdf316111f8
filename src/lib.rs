pub mod billing;
pub mod cloud;
pub mod config;
pub mod configure;
pub mod dns;
pub mod drift;
pub mod orchestrator;
pub mod output;
pub mod project;
pub mod server;
pub mod store;

pub use orchestrator::Orchestrator;
pub use server::{Cloud, ComputeServer, Configuration, Operation, ServerError, State};
