//! # fleetlink-core
//!
//! Core types, configuration, and utilities for FleetLink.
//!
//! This crate provides shared functionality used across all FleetLink crates:
//!
//! - **Configuration**: Loading, validation, and management of config files
//! - **Types**: Robot, operator, token and connection identifiers plus the
//!   teleoperation command and mode types shared by the gateway and CLI
//! - **Utilities**: Path resolution

pub mod config;
pub mod error;
pub mod paths;
pub mod types;

// Re-exports for convenience
pub use config::Config;
pub use error::ConfigError;
pub use types::*;
