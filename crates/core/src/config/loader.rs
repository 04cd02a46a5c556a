//! Configuration file loader.

use crate::config::error::{ConfigError, ConfigResult};
use crate::config::models::OrchestratorConfig;
use std::path::Path;

/// Load the orchestrator configuration from a TOML file.
///
/// A missing file is not an error: defaults are returned, matching how the
/// rest of the configuration layer treats absent pieces.
///
/// # Errors
///
/// Returns `ConfigError` when the file exists but cannot be read or parsed.
pub fn load_config(path: &Path) -> ConfigResult<OrchestratorConfig> {
    if !path.exists() {
        return Ok(OrchestratorConfig::default());
    }

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;

    toml::from_str(&content).map_err(|source| ConfigError::TomlParse {
        path: path.to_path_buf(),
        source,
    })
}
