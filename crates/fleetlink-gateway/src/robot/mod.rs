//! Robot service channels.
//!
//! A [`RobotConnector`] opens one [`RobotChannel`] per robot and service kind.
//! Channels carry request/response calls and, for the direct-control service,
//! open the long-lived [`CommandStream`] that operator input is written to.

pub mod ws;

use crate::error::{RpcError, WriteError};
use async_trait::async_trait;
use fleetlink_core::{AxisCommand, ControlToken, RobotId, ServiceKind};
use std::sync::Arc;
use tokio::sync::mpsc;

pub use ws::WsConnector;

/// Out-of-band events reported by a command stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The stream broke; recovery may be attempted.
    Error(String),

    /// The robot closed the stream.
    End,
}

/// Writable half of a command stream.
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Queue a command without waiting. Failures are per-write and non-fatal;
    /// persistent failure is reported through the stream's events.
    fn write(&self, command: AxisCommand) -> Result<(), WriteError>;

    /// Gracefully end the stream.
    async fn close(&self) -> Result<(), RpcError>;
}

/// An open command stream: the sink plus its event feed.
///
/// Dropping the sink without calling `close` also ends the stream.
pub struct CommandStream {
    /// Writable half.
    pub sink: Box<dyn CommandSink>,

    /// Error/end notifications. Closed once the stream is finished.
    pub events: mpsc::Receiver<StreamEvent>,
}

/// A connected channel to one service of one robot.
#[async_trait]
pub trait RobotChannel: Send + Sync {
    /// Service this channel talks to.
    fn kind(&self) -> ServiceKind;

    /// Issue a request and wait for its response.
    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, RpcError>;

    /// Open the bidirectional command stream keyed by `token`.
    async fn open_stream(&self, _token: &ControlToken) -> Result<CommandStream, RpcError> {
        Err(RpcError::Unsupported(self.kind().to_string()))
    }

    /// Whether the channel can no longer carry calls, either because it was
    /// closed locally or because the robot hung up.
    fn is_closed(&self) -> bool;

    /// Close the channel.
    async fn close(&self) -> Result<(), RpcError>;
}

/// Opens channels to robots.
#[async_trait]
pub trait RobotConnector: Send + Sync {
    /// Connect to `kind` on the robot reachable at `endpoint`.
    async fn connect(
        &self,
        robot: &RobotId,
        endpoint: &str,
        kind: ServiceKind,
    ) -> Result<Arc<dyn RobotChannel>, RpcError>;
}
