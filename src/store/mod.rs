pub mod backend;
pub mod schema;
pub mod services;
pub mod sqlite;
