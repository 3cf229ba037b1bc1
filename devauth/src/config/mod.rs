//! Configuration management for devauth.

pub mod paths;
pub mod settings;

pub use paths::config_file;
pub use settings::{DevauthConfig, StorageBackend};

use std::path::Path;

use crate::error::{DevauthError, Result};

/// Load configuration from the default config file.
///
/// If the config file doesn't exist, returns default configuration.
pub fn load_config() -> Result<DevauthConfig> {
    let path = config_file()?;
    load_config_from(&path)
}

/// Load configuration from a specific path.
///
/// If the file doesn't exist, returns default configuration.
pub fn load_config_from(path: &Path) -> Result<DevauthConfig> {
    if !path.exists() {
        return Ok(DevauthConfig::default().with_env_overrides());
    }

    let contents = std::fs::read_to_string(path)?;
    let config: DevauthConfig =
        toml::from_str(&contents).map_err(|e| DevauthError::ConfigRead(e.to_string()))?;

    Ok(config.with_env_overrides())
}
