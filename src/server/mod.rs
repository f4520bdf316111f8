pub mod configuration;
pub mod error;
pub mod models;

pub use configuration::Configuration;
pub use error::{ServerError, ServerResult};
pub use models::{Cloud, ComputeServer, NewComputeServer, Operation, Precondition, State};
