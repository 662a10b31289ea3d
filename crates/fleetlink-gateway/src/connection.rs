//! Realtime (WebSocket) connections from dashboards.
//!
//! The socket itself is owned by its connection task; everything else holds a
//! [`ConnectionHandle`], which can queue frames and request a close but does
//! not keep the socket alive.

use fleetlink_core::{ConnectionId, RobotId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// Endpoint going away (server shutdown).
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Frame sent to a realtime client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    /// Command delivered to the robot's stream.
    Ack {
        #[serde(rename = "robotId")]
        robot_id: RobotId,
    },

    /// Any failure handling an inbound message.
    Error { message: String },

    /// Diagnostic echo reply.
    Echo { message: serde_json::Value },

    /// Telemetry subscription confirmed.
    Subscribed { tables: Vec<String> },

    /// Telemetry event for a subscribed table.
    Telemetry {
        table: String,
        #[serde(rename = "robotId", skip_serializing_if = "Option::is_none")]
        robot_id: Option<RobotId>,
        payload: serde_json::Value,
    },
}

impl ServerFrame {
    /// Build an error frame.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Work queued for a connection's writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// A typed frame.
    Frame(ServerFrame),

    /// Text sent back verbatim.
    Raw(String),

    /// Close the socket with a code and reason.
    Close { code: u16, reason: String },
}

/// Handle to one realtime connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    remote_addr: Option<SocketAddr>,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    /// Create a handle and the receiver its writer task drains.
    pub fn new(remote_addr: Option<SocketAddr>) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            id: ConnectionId::generate(),
            remote_addr,
            tx,
        };
        (handle, rx)
    }

    /// Connection ID.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Remote address, if known.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Whether the socket's writer is still running.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue a frame. Returns false if the connection is gone.
    pub fn send(&self, frame: ServerFrame) -> bool {
        self.tx.send(Outbound::Frame(frame)).is_ok()
    }

    /// Queue raw text. Returns false if the connection is gone.
    pub fn send_raw(&self, text: impl Into<String>) -> bool {
        self.tx.send(Outbound::Raw(text.into())).is_ok()
    }

    /// Ask the writer to close the socket.
    pub fn close(&self, code: u16, reason: &str) -> Result<(), ConnectionGone> {
        self.tx
            .send(Outbound::Close {
                code,
                reason: reason.to_string(),
            })
            .map_err(|_| ConnectionGone(self.id.clone()))
    }
}

/// The connection's writer has already stopped.
#[derive(Debug, Clone, thiserror::Error)]
#[error("connection {0} is already closed")]
pub struct ConnectionGone(pub ConnectionId);

/// Information about a connected client.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// Handle for sending and closing.
    pub handle: ConnectionHandle,

    /// Connection time.
    pub connected_at: chrono::DateTime<chrono::Utc>,
}

/// Every open realtime connection, whether or not it is attached to a session.
#[derive(Default)]
pub struct ConnectionTracker {
    clients: RwLock<HashMap<ConnectionId, ClientInfo>>,
}

impl ConnectionTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new connection.
    pub async fn register(&self, handle: ConnectionHandle) {
        let mut clients = self.clients.write().await;
        clients.insert(
            handle.id().clone(),
            ClientInfo {
                handle,
                connected_at: chrono::Utc::now(),
            },
        );
    }

    /// Stop tracking a connection.
    pub async fn unregister(&self, id: &ConnectionId) -> bool {
        self.clients.write().await.remove(id).is_some()
    }

    /// Number of tracked connections.
    pub async fn count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Close every tracked connection that is still open.
    pub async fn close_all(&self, code: u16, reason: &str) -> usize {
        let clients = self.clients.read().await;
        let mut closed = 0;
        for info in clients.values().filter(|info| info.handle.is_open()) {
            match info.handle.close(code, reason) {
                Ok(()) => closed += 1,
                Err(e) => debug!("Skipping close: {}", e),
            }
        }
        if closed > 0 {
            warn!("Closed {} realtime connection(s): {}", closed, reason);
        }
        closed
    }
}
