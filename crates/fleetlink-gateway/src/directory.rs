//! Command channel directory.
//!
//! Resolves a robot identifier to cached service channels. One channel is kept
//! per (robot, service kind); a cache hit returns the same instance.

use crate::error::{GatewayError, RpcError};
use crate::robot::{CommandStream, RobotChannel, RobotConnector};
use crate::rpc::methods;
use fleetlink_core::config::RobotConfig;
use fleetlink_core::{ControlMode, ControlToken, OperatorId, RobotId, ServiceKind};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// A robot known to the directory.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RobotEntry {
    /// Robot ID.
    pub id: RobotId,

    /// Base endpoint of the robot's services.
    pub endpoint: String,

    /// Display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Registration time.
    pub registered_at: chrono::DateTime<chrono::Utc>,
}

type ChannelKey = (RobotId, ServiceKind);

/// Directory of robots and their open service channels.
pub struct ChannelDirectory {
    connector: Arc<dyn RobotConnector>,
    robots: RwLock<HashMap<RobotId, RobotEntry>>,
    channels: RwLock<HashMap<ChannelKey, Arc<dyn RobotChannel>>>,
}

impl ChannelDirectory {
    /// Create an empty directory.
    pub fn new(connector: Arc<dyn RobotConnector>) -> Self {
        Self {
            connector,
            robots: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or re-register) a robot.
    pub async fn register_robot(
        &self,
        id: RobotId,
        endpoint: impl Into<String>,
        name: Option<String>,
    ) -> RobotEntry {
        let entry = RobotEntry {
            id: id.clone(),
            endpoint: endpoint.into(),
            name,
            registered_at: chrono::Utc::now(),
        };
        let previous = self.robots.write().await.insert(id.clone(), entry.clone());
        if let Some(previous) = previous {
            if previous.endpoint != entry.endpoint {
                // Cached channels point at the old endpoint.
                self.close_robot_channels(&id).await;
            }
        }
        info!("Registered robot {} at {}", entry.id, entry.endpoint);
        entry
    }

    /// Register every robot from configuration.
    pub async fn register_all(&self, robots: &[RobotConfig]) {
        for robot in robots {
            self.register_robot(
                RobotId::new(robot.id.clone()),
                robot.endpoint.clone(),
                robot.name.clone(),
            )
            .await;
        }
    }

    /// Registered robots, sorted by ID.
    pub async fn robots(&self) -> Vec<RobotEntry> {
        let robots = self.robots.read().await;
        let mut entries: Vec<_> = robots.values().cloned().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    /// Whether the robot is registered.
    pub async fn is_registered(&self, robot: &RobotId) -> bool {
        self.robots.read().await.contains_key(robot)
    }

    /// Get the channel for a robot service, connecting on first use.
    ///
    /// A cached channel the robot has hung up on is evicted and replaced by a
    /// fresh connection.
    pub async fn channel(
        &self,
        robot: &RobotId,
        kind: ServiceKind,
    ) -> Result<Arc<dyn RobotChannel>, GatewayError> {
        let key = (robot.clone(), kind);
        let stale = match self.channels.read().await.get(&key) {
            Some(channel) if !channel.is_closed() => return Ok(channel.clone()),
            Some(_) => true,
            None => false,
        };
        if stale {
            self.evict_if_closed(&key).await;
        }

        let endpoint = {
            let robots = self.robots.read().await;
            robots
                .get(robot)
                .map(|entry| entry.endpoint.clone())
                .ok_or_else(|| GatewayError::NotRegistered(robot.clone()))?
        };

        // Connect without holding the cache lock.
        let connected = self.connector.connect(robot, &endpoint, kind).await?;

        let mut channels = self.channels.write().await;
        match channels.get(&key) {
            Some(existing) if !existing.is_closed() => {
                let existing = existing.clone();
                drop(channels);
                debug!("Lost connect race for {} of robot {}", kind, robot);
                if let Err(e) = connected.close().await {
                    debug!("Closing duplicate channel failed: {}", e);
                }
                Ok(existing)
            }
            _ => {
                if let Some(dead) = channels.insert(key, connected.clone()) {
                    drop(channels);
                    if let Err(e) = dead.close().await {
                        debug!("Closing dead {} channel of robot {} failed: {}", kind, robot, e);
                    }
                }
                Ok(connected)
            }
        }
    }

    /// Evict the cached channel for `key` if it is still the closed one.
    async fn evict_if_closed(&self, key: &ChannelKey) {
        let evicted = {
            let mut channels = self.channels.write().await;
            match channels.get(key) {
                Some(channel) if channel.is_closed() => channels.remove(key),
                _ => None,
            }
        };
        if let Some(channel) = evicted {
            let (robot, kind) = key;
            info!("Dropping dead {} channel of robot {}", kind, robot);
            if let Err(e) = channel.close().await {
                debug!("Closing dead {} channel of robot {} failed: {}", kind, robot, e);
            }
        }
    }

    /// Direct-control channel for a robot.
    pub async fn direct_control(&self, robot: &RobotId) -> Result<DirectControlChannel, GatewayError> {
        let channel = self.channel(robot, ServiceKind::DirectControl).await?;
        Ok(DirectControlChannel {
            robot: robot.clone(),
            channel,
        })
    }

    /// Behavior service channel for a robot.
    pub async fn behavior_channel(
        &self,
        robot: &RobotId,
    ) -> Result<Arc<dyn RobotChannel>, GatewayError> {
        self.channel(robot, ServiceKind::Behavior).await
    }

    /// Payload service channel for a robot.
    pub async fn payload_channel(
        &self,
        robot: &RobotId,
    ) -> Result<Arc<dyn RobotChannel>, GatewayError> {
        self.channel(robot, ServiceKind::Payload).await
    }

    /// Telemetry service channel for a robot.
    pub async fn telemetry_channel(
        &self,
        robot: &RobotId,
    ) -> Result<Arc<dyn RobotChannel>, GatewayError> {
        self.channel(robot, ServiceKind::Telemetry).await
    }

    /// Close and evict one cached channel. Returns whether one was cached.
    pub async fn close_channel(&self, robot: &RobotId, kind: ServiceKind) -> bool {
        let removed = self.channels.write().await.remove(&(robot.clone(), kind));
        match removed {
            Some(channel) => {
                if let Err(e) = channel.close().await {
                    warn!("Failed to close {} channel of robot {}: {}", kind, robot, e);
                }
                true
            }
            None => false,
        }
    }

    /// Unregister a robot and close its channels. Returns the number closed.
    pub async fn remove_robot(&self, robot: &RobotId) -> usize {
        self.robots.write().await.remove(robot);
        let closed = self.close_robot_channels(robot).await;
        info!("Removed robot {} ({} channel(s) closed)", robot, closed);
        closed
    }

    /// Close every cached channel.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<_> = self.channels.write().await.drain().collect();
        let count = drained.len();
        for ((robot, kind), channel) in drained {
            if let Err(e) = channel.close().await {
                warn!("Failed to close {} channel of robot {}: {}", kind, robot, e);
            }
        }
        count
    }

    async fn close_robot_channels(&self, robot: &RobotId) -> usize {
        let evicted: Vec<_> = {
            let mut channels = self.channels.write().await;
            let keys: Vec<ChannelKey> = channels
                .keys()
                .filter(|(id, _)| id == robot)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| channels.remove(&key).map(|channel| (key.1, channel)))
                .collect()
        };
        let count = evicted.len();
        for (kind, channel) in evicted {
            if let Err(e) = channel.close().await {
                warn!("Failed to close {} channel of robot {}: {}", kind, robot, e);
            }
        }
        count
    }
}

/// Typed view over a robot's direct-control channel.
#[derive(Clone)]
pub struct DirectControlChannel {
    robot: RobotId,
    channel: Arc<dyn RobotChannel>,
}

impl DirectControlChannel {
    /// Robot this channel belongs to.
    pub fn robot(&self) -> &RobotId {
        &self.robot
    }

    /// Ask the robot to begin direct control; returns the issued token.
    pub async fn start(
        &self,
        operator: &OperatorId,
        operator_address: &str,
    ) -> Result<ControlToken, RpcError> {
        let result = self
            .channel
            .call(
                methods::START_DIRECT_CONTROL,
                serde_json::json!({
                    "controllingDeviceId": operator.as_str(),
                    "controllingDeviceIp": operator_address,
                }),
            )
            .await?;

        match result.get("directControlToken").and_then(|v| v.as_str()) {
            Some(token) if !token.is_empty() => Ok(ControlToken::new(token)),
            _ => Err(RpcError::InvalidResponse(
                "missing directControlToken".to_string(),
            )),
        }
    }

    /// Ask the robot to end direct control. Returns the robot's payload.
    pub async fn stop(&self, token: &ControlToken) -> Result<serde_json::Value, RpcError> {
        self.channel
            .call(
                methods::STOP_DIRECT_CONTROL,
                serde_json::json!({ "directControlToken": token.as_str() }),
            )
            .await
    }

    /// Switch the robot between autonomous and teleoperated mode.
    pub async fn set_mode(&self, mode: ControlMode) -> Result<(), RpcError> {
        self.channel
            .call(
                methods::SET_CONTROL_MODE,
                serde_json::json!({ "mode": mode.as_str() }),
            )
            .await
            .map(|_| ())
    }

    /// Open the command stream for `token`.
    pub async fn open_command_stream(&self, token: &ControlToken) -> Result<CommandStream, RpcError> {
        self.channel.open_stream(token).await
    }
}
