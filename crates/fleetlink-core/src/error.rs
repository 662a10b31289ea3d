//! Configuration errors.

use std::path::PathBuf;
use thiserror::Error;

/// Failure to locate, read, write or validate the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Could not determine the home directory")]
    NoHomeDir,

    #[error("Invalid JSON5 in configuration: {0}")]
    Json5(String),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Every validation problem, joined with `; `.
    #[error("Invalid configuration: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
