//! Path resolution utilities.

use crate::error::ConfigError;
use std::path::PathBuf;

/// Get the FleetLink base directory (~/.fleetlink).
pub fn base_dir() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
    Ok(home.join(".fleetlink"))
}

/// Get the main config file path (~/.fleetlink/fleetlink.json5).
pub fn config_file() -> Result<PathBuf, ConfigError> {
    Ok(base_dir()?.join("fleetlink.json5"))
}
