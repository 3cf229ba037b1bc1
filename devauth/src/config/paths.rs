//! Platform-specific path utilities for devauth.

use std::path::PathBuf;

use crate::error::{DevauthError, Result};

/// Get the configuration directory for devauth.
///
/// - Linux: `~/.config/devauth`
/// - macOS: `~/Library/Application Support/devauth`
/// - Windows: `%APPDATA%\devauth`
pub fn config_dir() -> Result<PathBuf> {
    let base = dirs::config_dir()
        .ok_or_else(|| DevauthError::Config("Cannot determine config directory".to_string()))?;
    Ok(base.join("devauth"))
}

/// Get the data directory for devauth.
///
/// - Linux: `~/.local/share/devauth`
/// - macOS: `~/Library/Application Support/devauth`
/// - Windows: `%APPDATA%\devauth`
pub fn data_dir() -> Result<PathBuf> {
    let base = dirs::data_dir()
        .ok_or_else(|| DevauthError::Config("Cannot determine data directory".to_string()))?;
    Ok(base.join("devauth"))
}

/// Get the main configuration file path.
pub fn config_file() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// Get the default credential record path for the file backend.
pub fn credentials_file() -> Result<PathBuf> {
    Ok(data_dir()?.join("credentials.json"))
}
