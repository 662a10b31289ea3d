//! Configuration loading and persistence.

use super::Config;
use crate::error::ConfigError;
use crate::paths;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = paths::config_file()?;
        Self::load(&path)
    }

    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        json5::from_str(content).map_err(|e| ConfigError::Json5(e.to_string()))
    }

    /// Save configuration to a file path.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = self.to_json5()?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write atomically
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &content)?;
        fs::rename(&temp_path, path)?;

        Ok(())
    }

    /// Serialize to JSON5 string.
    pub fn to_json5(&self) -> Result<String, ConfigError> {
        // json5 doesn't have a serializer, so we use serde_json with pretty print
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Validate the configuration, collecting all errors before returning.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        // 1. Listener ports
        if self.gateway.port == 0 {
            errors.push("Gateway port cannot be 0".to_string());
        }
        if self.gateway.realtime_port == 0 {
            errors.push("Gateway realtime_port cannot be 0".to_string());
        }
        if self.gateway.port != 0 && self.gateway.port == self.gateway.realtime_port {
            errors.push(format!(
                "Gateway port and realtime_port must differ, both are {}",
                self.gateway.port
            ));
        }

        // 2. Session timing
        if self.control.idle_timeout_secs == 0 {
            errors.push("Control idle_timeout_secs must be greater than 0".to_string());
        }
        if self.control.reap_interval_secs == 0 {
            errors.push("Control reap_interval_secs must be greater than 0".to_string());
        }
        if self.control.rpc_timeout_ms == 0 {
            errors.push("Control rpc_timeout_ms must be greater than 0".to_string());
        }
        if self.control.command_tick_ms == 0 {
            errors.push("Control command_tick_ms must be greater than 0".to_string());
        }

        // 3. Stream retry policy
        let retry = &self.control.stream_retry;
        if !(retry.multiplier >= 1.0) {
            errors.push(format!(
                "Stream retry multiplier must be at least 1.0, got {}",
                retry.multiplier
            ));
        }
        if retry.initial_backoff_ms > retry.max_backoff_ms {
            errors.push(format!(
                "Stream retry initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
                retry.initial_backoff_ms, retry.max_backoff_ms
            ));
        }

        // 4. Shutdown deadline
        if self.shutdown.deadline_secs == 0 {
            errors.push("Shutdown deadline_secs must be greater than 0".to_string());
        }

        // 5. Robots: unique non-empty ids and WebSocket endpoints
        let mut seen = HashSet::new();
        for (i, robot) in self.robots.iter().enumerate() {
            if robot.id.trim().is_empty() {
                errors.push(format!("Robot [{}]: id must not be empty", i));
            } else if !seen.insert(robot.id.as_str()) {
                errors.push(format!("Robot [{}]: duplicate id '{}'", i, robot.id));
            }

            match url::Url::parse(&robot.endpoint) {
                Ok(url) if url.scheme() == "ws" || url.scheme() == "wss" => {}
                Ok(url) => errors.push(format!(
                    "Robot '{}': endpoint scheme must be ws or wss, got '{}'",
                    robot.id,
                    url.scheme()
                )),
                Err(e) => errors.push(format!(
                    "Robot '{}': invalid endpoint '{}': {}",
                    robot.id, robot.endpoint, e
                )),
            }
        }

        // Return collected errors
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors.join("; ")))
        }
    }

    /// Load configuration from the default path, falling back to defaults if no file exists.
    pub fn load_or_default() -> Self {
        match Self::load_default() {
            Ok(config) => config,
            Err(ConfigError::NotFound(_)) => Self::default(),
            Err(e) => {
                tracing::warn!("Failed to load config, using defaults: {}", e);
                Self::default()
            }
        }
    }

    /// Load from an explicit path when given, otherwise the default location.
    ///
    /// A missing file yields the default configuration; a file that exists but
    /// does not parse is an error.
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        let result = match path {
            Some(path) => Self::load(path),
            None => Self::load_default(),
        };

        match result {
            Ok(config) => Ok(config),
            Err(ConfigError::NotFound(_)) => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }
}
