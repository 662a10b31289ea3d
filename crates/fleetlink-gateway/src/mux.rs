//! Command fan-in multiplexer.
//!
//! Routes operator commands arriving on any realtime connection to the one
//! live session for the target robot.

use crate::connection::{ConnectionHandle, ServerFrame};
use crate::error::DeliveryError;
use crate::session::SessionRegistry;
use fleetlink_core::{AxisCommand, ControlToken, RobotId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Routes inbound commands to sessions.
pub struct CommandMux {
    registry: Arc<SessionRegistry>,
    routes: RwLock<HashMap<RobotId, ControlToken>>,
}

impl CommandMux {
    /// Create a multiplexer over `registry`.
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// Point `robot` at `token`.
    pub async fn bind(&self, robot: &RobotId, token: &ControlToken) {
        self.routes.write().await.insert(robot.clone(), token.clone());
    }

    /// Shortcut currently held for `robot`, without checking it is live.
    pub async fn route_for(&self, robot: &RobotId) -> Option<ControlToken> {
        self.routes.read().await.get(robot).cloned()
    }

    /// Resolve the live session token for `robot`, repairing a stale shortcut.
    pub async fn resolve(&self, robot: &RobotId) -> Option<ControlToken> {
        if let Some(token) = self.route_for(robot).await {
            if self.registry.find_by_robot(robot).await.iter().any(|s| s.token == token) {
                return Some(token);
            }
        }

        match self.registry.find_by_robot(robot).await.into_iter().next() {
            Some(session) => {
                self.bind(robot, &session.token).await;
                Some(session.token)
            }
            None => {
                self.routes.write().await.remove(robot);
                None
            }
        }
    }

    /// Deliver one command from `conn`, returning the frame to send back.
    pub async fn deliver(
        &self,
        conn: &ConnectionHandle,
        robot: &RobotId,
        axes: &serde_json::Value,
    ) -> ServerFrame {
        match self.try_deliver(conn, robot, axes).await {
            Ok(()) => ServerFrame::Ack {
                robot_id: robot.clone(),
            },
            Err(e) => {
                match &e {
                    DeliveryError::NoSession(_) => debug!("Dropping command: {}", e),
                    _ => warn!(robot = %robot, "Dropping command: {}", e),
                }
                ServerFrame::error(e.to_string())
            }
        }
    }

    async fn try_deliver(
        &self,
        conn: &ConnectionHandle,
        robot: &RobotId,
        axes: &serde_json::Value,
    ) -> Result<(), DeliveryError> {
        let token = self
            .resolve(robot)
            .await
            .ok_or_else(|| DeliveryError::NoSession(robot.clone()))?;

        if !self.registry.attach_connection(&token, conn).await {
            return Err(DeliveryError::NoSession(robot.clone()));
        }

        self.registry
            .write_command(robot, &token, normalize_axes(axes))
            .await
    }

    /// Drop every shortcut whose session is gone or ending. Returns the number
    /// dropped.
    pub async fn reconcile(&self) -> usize {
        let routes: Vec<(RobotId, ControlToken)> = self
            .routes
            .read()
            .await
            .iter()
            .map(|(robot, token)| (robot.clone(), token.clone()))
            .collect();

        let mut stale = Vec::new();
        for (robot, token) in routes {
            if !self.registry.has_live(&token).await {
                stale.push((robot, token));
            }
        }

        let mut routes = self.routes.write().await;
        let mut dropped = 0;
        for (robot, token) in stale {
            // Only drop if nobody re-bound the robot meanwhile.
            if routes.get(&robot) == Some(&token) {
                routes.remove(&robot);
                dropped += 1;
            }
        }
        dropped
    }
}

/// Normalize an inbound axes value to a clamped two-axis command.
///
/// Anything other than an array of at least two numbers yields neutral.
/// Extra entries are ignored.
pub fn normalize_axes(axes: &serde_json::Value) -> AxisCommand {
    let Some(values) = axes.as_array() else {
        return AxisCommand::NEUTRAL;
    };
    if values.len() < 2 {
        return AxisCommand::NEUTRAL;
    }
    match (values[0].as_f64(), values[1].as_f64()) {
        (Some(throttle), Some(steering)) => AxisCommand::new(throttle, steering),
        _ => AxisCommand::NEUTRAL,
    }
}
