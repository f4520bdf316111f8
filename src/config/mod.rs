pub mod loader;
pub mod types;

pub use loader::{load_settings, parse_settings, DEFAULT_SETTINGS_FILE};
pub use types::{OrchestratorSettings, SettingsFile};
