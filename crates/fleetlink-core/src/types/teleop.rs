//! Teleoperation domain types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Control mode of a robot as far as the gateway has told it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    /// Robot runs its own behaviors.
    #[default]
    Auto,

    /// Robot follows operator commands from the command stream.
    Teleop,
}

impl ControlMode {
    /// Wire name of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Teleop => "teleop",
        }
    }
}

impl fmt::Display for ControlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote service exposed by a robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    /// Exclusive direct control (teleoperation).
    DirectControl,

    /// Behavior control (rally, patrol, waypoint, ...).
    Behavior,

    /// Payload actuation.
    Payload,

    /// Telemetry streaming.
    Telemetry,
}

impl ServiceKind {
    /// All service kinds.
    pub fn all() -> &'static [ServiceKind] {
        &[
            Self::DirectControl,
            Self::Behavior,
            Self::Payload,
            Self::Telemetry,
        ]
    }

    /// URL path segment of the service.
    pub fn path(&self) -> &'static str {
        match self {
            Self::DirectControl => "direct-control",
            Self::Behavior => "behavior",
            Self::Payload => "payload",
            Self::Telemetry => "telemetry",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// One two-axis operator command.
///
/// Both axes are normalized to `[-1.0, 1.0]`; `0.0` is neutral.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AxisCommand {
    /// Forward/backward axis.
    pub throttle: f64,

    /// Left/right axis.
    pub steering: f64,
}

impl AxisCommand {
    /// The neutral command (robot holds still).
    pub const NEUTRAL: AxisCommand = AxisCommand {
        throttle: 0.0,
        steering: 0.0,
    };

    /// Create a command, clamping both axes into range.
    pub fn new(throttle: f64, steering: f64) -> Self {
        Self {
            throttle: clamp_axis(throttle),
            steering: clamp_axis(steering),
        }
    }

    /// Axes as `[throttle, steering]`.
    pub fn as_array(&self) -> [f64; 2] {
        [self.throttle, self.steering]
    }
}

fn clamp_axis(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}
