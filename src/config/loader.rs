use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;
use std::time::Duration;

use super::types::{OrchestratorSettings, SettingsFile};
use crate::cloud::Backoff;

/// Default settings file name, looked up in the current directory.
pub const DEFAULT_SETTINGS_FILE: &str = "stratus.yaml";

const MAX_BACKOFF_FACTOR: f64 = 10.0;

/// Load the settings file at `path`.
///
/// A missing file yields the defaults, except when the caller named the
/// file explicitly (`required`).
pub fn load_settings(path: &Path, required: bool) -> Result<SettingsFile> {
    if !path.exists() {
        if required {
            bail!("Settings file not found: {}", path.display());
        }
        tracing::debug!(path = %path.display(), "No settings file, using defaults");
        return Ok(SettingsFile::default());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
    parse_settings(&content)
}

pub fn parse_settings(content: &str) -> Result<SettingsFile> {
    if content.trim().is_empty() {
        return Ok(SettingsFile::default());
    }
    let settings: SettingsFile =
        serde_yaml::from_str(content).context("Failed to parse settings YAML")?;
    Ok(settings)
}

impl SettingsFile {
    /// Resolve the orchestrator section, rejecting nonsensical backoff values.
    pub fn orchestrator_settings(&self) -> Result<OrchestratorSettings> {
        let section = &self.orchestrator;
        if section.wait_timeout_secs == 0 {
            bail!("orchestrator.wait_timeout_secs must be greater than 0");
        }

        let mut settings = OrchestratorSettings {
            wait_timeout: Duration::from_secs(section.wait_timeout_secs),
            stable_retries: section.stable_retries,
            settle_delay: Duration::from_millis(section.settle_delay_ms),
            ..Default::default()
        };

        for (cloud, backoff) in &section.backoff {
            if backoff.start_ms == 0 || backoff.start_ms > backoff.max_ms {
                bail!(
                    "Backoff for '{}' needs 0 < start_ms <= max_ms (got {} / {})",
                    cloud,
                    backoff.start_ms,
                    backoff.max_ms
                );
            }
            if !(1.0..=MAX_BACKOFF_FACTOR).contains(&backoff.factor) {
                bail!(
                    "Backoff factor for '{}' must be between 1.0 and {} (got {})",
                    cloud,
                    MAX_BACKOFF_FACTOR,
                    backoff.factor
                );
            }
            settings.backoff.insert(
                *cloud,
                Backoff {
                    start: Duration::from_millis(backoff.start_ms),
                    max: Duration::from_millis(backoff.max_ms),
                    factor: backoff.factor,
                },
            );
        }
        Ok(settings)
    }
}
