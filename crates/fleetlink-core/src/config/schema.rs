//! Configuration schema definitions.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main FleetLink configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Gateway listener settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Direct-control session settings.
    #[serde(default)]
    pub control: ControlConfig,

    /// Shutdown behavior.
    #[serde(default)]
    pub shutdown: ShutdownConfig,

    /// Robots registered at start-up.
    #[serde(default)]
    pub robots: Vec<RobotConfig>,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Gateway listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Bind mode.
    #[serde(default)]
    pub bind: BindMode,

    /// HTTP API port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Realtime (WebSocket) listener port.
    #[serde(default = "default_realtime_port")]
    pub realtime_port: u16,

    /// Enable CORS on the HTTP API.
    #[serde(default = "default_true")]
    pub cors: bool,

    /// Bearer token required on API and realtime requests, if set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: BindMode::default(),
            port: default_port(),
            realtime_port: default_realtime_port(),
            cors: true,
            auth_token: None,
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_realtime_port() -> u16 {
    8081
}

/// Bind mode for the gateway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    /// Bind to loopback only (127.0.0.1).
    #[default]
    Loopback,

    /// Bind to LAN interfaces.
    Lan,

    /// Auto-detect.
    Auto,
}

impl BindMode {
    /// Parse a bind mode name as given on the command line.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "loopback" => Some(Self::Loopback),
            "lan" => Some(Self::Lan),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }

    /// IP address to bind for this mode.
    pub fn ip(&self) -> [u8; 4] {
        match self {
            Self::Loopback => [127, 0, 0, 1],
            Self::Lan | Self::Auto => [0, 0, 0, 0],
        }
    }
}

/// Direct-control session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Sessions idle longer than this are ended by the reaper.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Period of the idle reaper.
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,

    /// Timeout for robot-side request/response calls.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    /// Command stream flush period; writes between flushes are coalesced.
    #[serde(default = "default_command_tick_ms")]
    pub command_tick_ms: u64,

    /// Recovery policy for broken command streams.
    #[serde(default)]
    pub stream_retry: StreamRetryConfig,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            reap_interval_secs: default_reap_interval_secs(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            command_tick_ms: default_command_tick_ms(),
            stream_retry: StreamRetryConfig::default(),
        }
    }
}

impl ControlConfig {
    /// Idle timeout as a duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Reaper period as a duration.
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    /// RPC timeout as a duration.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Command flush period as a duration.
    pub fn command_tick(&self) -> Duration {
        Duration::from_millis(self.command_tick_ms)
    }
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_reap_interval_secs() -> u64 {
    30
}

fn default_rpc_timeout_ms() -> u64 {
    5000
}

fn default_command_tick_ms() -> u64 {
    50
}

/// Bounded exponential backoff for command stream recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRetryConfig {
    /// Reconnect attempts before giving up (0 disables recovery).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first attempt.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound for any single delay.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Growth factor between attempts.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for StreamRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    2000
}

fn default_multiplier() -> f64 {
    2.0
}

/// Shutdown configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Hard deadline for graceful shutdown.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            deadline_secs: default_deadline_secs(),
        }
    }
}

impl ShutdownConfig {
    /// Deadline as a duration.
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

fn default_deadline_secs() -> u64 {
    10
}

/// A robot registered with the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RobotConfig {
    /// Robot identifier.
    pub id: String,

    /// Base WebSocket URL of the robot's services.
    pub endpoint: String,

    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default)]
    pub level: LogLevel,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

/// Log level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Directive string understood by `EnvFilter`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,

    /// One JSON object per line.
    Json,
}

fn default_true() -> bool {
    true
}
