//! Gateway error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use fleetlink_core::{ConfigError, RobotId};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Robot identifier unknown to the channel directory.
    #[error("Robot not registered: {0}")]
    NotRegistered(RobotId),

    /// Robot-side call failed or timed out.
    #[error("Robot RPC failed: {0}")]
    Rpc(#[from] RpcError),

    /// Command stream failed.
    #[error("Command stream failure: {0}")]
    Stream(String),

    /// Missing or malformed request fields.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Not found error.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A newer start request for the same robot won the race.
    #[error("Start for robot {0} was superseded by a newer request")]
    Superseded(RobotId),

    /// Authentication error.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GatewayError {
    /// HTTP status code for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotRegistered(_) | Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation(_) | Self::Json(_) => StatusCode::BAD_REQUEST,
            Self::Superseded(_) => StatusCode::CONFLICT,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Rpc(_)
            | Self::Stream(_)
            | Self::Config(_)
            | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short human-readable summary used as the response `message`.
    fn summary(&self) -> &'static str {
        match self {
            Self::NotRegistered(_) => "Robot not found",
            Self::Rpc(_) => "Robot request failed",
            Self::Stream(_) => "Command stream failed",
            Self::Validation(_) | Self::Json(_) => "Invalid request",
            Self::NotFound(_) => "Not found",
            Self::Superseded(_) => "Superseded by a newer start request",
            Self::Auth(_) => "Unauthorized",
            Self::Config(_) | Self::Io(_) => "Internal error",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "success": false,
            "message": self.summary(),
            "error": self.to_string(),
        });
        (self.status(), Json(body)).into_response()
    }
}

/// Failures of robot-side calls and streams.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RpcError {
    /// No response within the configured timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Connection-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The robot answered with an error.
    #[error("robot returned error {code}: {message}")]
    Remote { code: i32, message: String },

    /// The channel was closed before the call completed.
    #[error("channel closed")]
    Closed,

    /// The robot's answer could not be interpreted.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The channel does not offer the requested operation.
    #[error("operation not supported by {0} channel")]
    Unsupported(String),
}

/// Failure of a single command write. Never fatal to the session.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum WriteError {
    /// Outbound buffer is full; the command was dropped.
    #[error("command stream buffer full")]
    BufferFull,

    /// The stream is no longer writable.
    #[error("command stream closed")]
    Closed,
}

/// Why an inbound operator command could not be delivered.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// No session exists for the robot or token.
    #[error("no active direct control session for robot {0}")]
    NoSession(RobotId),

    /// The session exists but its stream is being recovered or torn down.
    #[error("command stream for robot {0} is unavailable")]
    StreamUnavailable(RobotId),

    /// The write itself failed.
    #[error("failed to write command for robot {robot}: {source}")]
    Write {
        robot: RobotId,
        #[source]
        source: WriteError,
    },
}
