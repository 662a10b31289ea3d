//! Direct-control gateway for FleetLink.
//!
//! This crate provides:
//! - The command channel directory and the JSON-RPC over WebSocket robot link
//! - The session registry and direct-control start/stop protocol
//! - Command fan-in from realtime connections, with per-tick coalescing
//! - Idle reaping and coordinated shutdown
//! - Telemetry publish/subscribe
//! - The HTTP API and realtime WebSocket servers

pub mod connection;
pub mod control;
pub mod directory;
pub mod error;
pub mod handlers;
pub mod mux;
pub mod reaper;
pub mod robot;
pub mod rpc;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod telemetry;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use connection::{ConnectionHandle, ConnectionTracker, ServerFrame};
pub use control::{ControlService, RetryPolicy, StartRequest, StartedSession, StopOutcome};
pub use directory::{ChannelDirectory, DirectControlChannel, RobotEntry};
pub use error::{DeliveryError, GatewayError, RpcError, WriteError};
pub use mux::{normalize_axes, CommandMux};
pub use reaper::{IdleReaper, ReapStats};
pub use robot::{CommandSink, CommandStream, RobotChannel, RobotConnector, StreamEvent, WsConnector};
pub use rpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
pub use server::{Gateway, GatewayState};
pub use session::{SessionRegistry, SessionSnapshot, SessionState};
pub use shutdown::{ShutdownCoordinator, ShutdownOutcome, ShutdownSignals};
pub use telemetry::{Subscription, TelemetryEvent, TelemetryHub, TelemetryTable};

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
