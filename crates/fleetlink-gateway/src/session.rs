//! Direct-control session registry.
//!
//! The registry is the authoritative table of control sessions, keyed by the
//! robot-issued [`ControlToken`]. Every read-then-write on the table (create,
//! end, attach, detach, install) happens under one lock, so two tasks can never
//! both observe "not yet ended" for the same token.
//!
//! Teardown is split in two. The *claim* runs under the lock: it marks the
//! session [`SessionState::Terminating`] and takes its stream and connections.
//! The *finish* runs outside the lock and performs the best-effort robot-side
//! cleanup before removing the record. A second claim on a terminating session
//! fails, which is what makes [`SessionRegistry::end`] idempotent.

use crate::connection::{ConnectionHandle, CLOSE_NORMAL};
use crate::directory::ChannelDirectory;
use crate::error::{DeliveryError, GatewayError};
use crate::robot::CommandSink;
use crate::telemetry::{TelemetryEvent, TelemetryHub, TelemetryTable};
use fleetlink_core::{AxisCommand, ConnectionId, ControlMode, ControlToken, OperatorId, RobotId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle state of a registered session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Stream open; commands are delivered.
    Active,

    /// Stream broke; a reconnect is in progress.
    Recovering,

    /// Recovery gave up; teardown follows.
    Failed,

    /// Teardown in progress.
    Terminating,
}

/// Data needed to register a session.
pub struct NewSession {
    pub robot_id: RobotId,
    pub operator_id: OperatorId,
    pub stream: Box<dyn CommandSink>,
    pub mode: ControlMode,
}

struct ControlSession {
    token: ControlToken,
    robot_id: RobotId,
    operator_id: OperatorId,
    stream: Option<Box<dyn CommandSink>>,
    started_at: chrono::DateTime<chrono::Utc>,
    last_activity: chrono::DateTime<chrono::Utc>,
    connections: HashMap<ConnectionId, ConnectionHandle>,
    mode: ControlMode,
    state: SessionState,
    ended: CancellationToken,
}

impl ControlSession {
    fn new(token: ControlToken, data: NewSession) -> Self {
        let now = chrono::Utc::now();
        Self {
            token,
            robot_id: data.robot_id,
            operator_id: data.operator_id,
            stream: Some(data.stream),
            started_at: now,
            last_activity: now,
            connections: HashMap::new(),
            mode: data.mode,
            state: SessionState::Active,
            ended: CancellationToken::new(),
        }
    }

    fn is_live(&self) -> bool {
        self.state != SessionState::Terminating
    }

    fn touch(&mut self) {
        self.last_activity = chrono::Utc::now();
    }

    fn idle_for(&self, now: chrono::DateTime<chrono::Utc>) -> Duration {
        (now - self.last_activity).to_std().unwrap_or_default()
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            token: self.token.clone(),
            robot_id: self.robot_id.clone(),
            operator_id: self.operator_id.clone(),
            started_at: self.started_at,
            last_activity: self.last_activity,
            connections: self.connections.len(),
            mode: self.mode,
            state: self.state,
        }
    }

    /// Mark terminating and take everything teardown needs.
    fn claim(&mut self) -> Option<Claimed> {
        if !self.is_live() {
            return None;
        }
        self.state = SessionState::Terminating;
        Some(Claimed {
            token: self.token.clone(),
            robot_id: self.robot_id.clone(),
            stream: self.stream.take(),
            connections: self.connections.drain().map(|(_, conn)| conn).collect(),
            mode: self.mode,
            ended: self.ended.clone(),
        })
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub token: ControlToken,
    pub robot_id: RobotId,
    pub operator_id: OperatorId,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub last_activity: chrono::DateTime<chrono::Utc>,
    /// Number of attached realtime connections.
    pub connections: usize,
    pub mode: ControlMode,
    pub state: SessionState,
}

/// Ticket taken at the start of a start request. Only the newest ticket for a
/// robot may install a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartTicket {
    pub robot: RobotId,
    pub generation: u64,
}

/// What a teardown did.
#[derive(Debug)]
pub struct TeardownReport {
    /// Attached connections that were still open and got closed.
    pub connections_closed: usize,

    /// Outcome of the robot-side stop call.
    pub stop_response: Result<serde_json::Value, GatewayError>,
}

struct Claimed {
    token: ControlToken,
    robot_id: RobotId,
    stream: Option<Box<dyn CommandSink>>,
    connections: Vec<ConnectionHandle>,
    mode: ControlMode,
    ended: CancellationToken,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<ControlToken, ControlSession>,
    generations: HashMap<RobotId, u64>,
}

/// Registry of direct-control sessions.
pub struct SessionRegistry {
    inner: RwLock<Inner>,
    directory: Arc<ChannelDirectory>,
    rpc_timeout: Duration,
    telemetry: Option<Arc<TelemetryHub>>,
}

impl SessionRegistry {
    /// Create an empty registry. Robot-side cleanup calls go through
    /// `directory` and are bounded by `rpc_timeout`.
    pub fn new(directory: Arc<ChannelDirectory>, rpc_timeout: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            directory,
            rpc_timeout,
            telemetry: None,
        }
    }

    /// Publish session lifecycle events to `hub`.
    pub fn with_telemetry(mut self, hub: Arc<TelemetryHub>) -> Self {
        self.telemetry = Some(hub);
        self
    }

    /// Channel directory used for robot-side calls.
    pub fn directory(&self) -> &Arc<ChannelDirectory> {
        &self.directory
    }

    /// Register a session. If one already exists for `token` it is returned
    /// unchanged and `data` is discarded.
    pub async fn create(&self, token: ControlToken, data: NewSession) -> SessionSnapshot {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.sessions.get(&token) {
            debug!("Session {} already registered", token.redacted());
            return existing.snapshot();
        }
        let session = ControlSession::new(token.clone(), data);
        let snapshot = session.snapshot();
        inner.sessions.insert(token, session);
        snapshot
    }

    /// Get a session.
    pub async fn get(&self, token: &ControlToken) -> Option<SessionSnapshot> {
        let inner = self.inner.read().await;
        inner.sessions.get(token).map(ControlSession::snapshot)
    }

    /// Check whether a session exists, including one still tearing down.
    pub async fn has(&self, token: &ControlToken) -> bool {
        self.inner.read().await.sessions.contains_key(token)
    }

    /// Check whether a session exists and is not being torn down.
    pub async fn has_live(&self, token: &ControlToken) -> bool {
        let inner = self.inner.read().await;
        inner.sessions.get(token).is_some_and(ControlSession::is_live)
    }

    /// Live sessions for a robot, newest first.
    pub async fn find_by_robot(&self, robot: &RobotId) -> Vec<SessionSnapshot> {
        let inner = self.inner.read().await;
        let mut found: Vec<_> = inner
            .sessions
            .values()
            .filter(|s| s.is_live() && &s.robot_id == robot)
            .map(ControlSession::snapshot)
            .collect();
        found.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        found
    }

    /// Live sessions controlled by an operator.
    pub async fn find_by_operator(&self, operator: &OperatorId) -> Vec<SessionSnapshot> {
        let inner = self.inner.read().await;
        inner
            .sessions
            .values()
            .filter(|s| s.is_live() && &s.operator_id == operator)
            .map(ControlSession::snapshot)
            .collect()
    }

    /// Refresh a session's activity timestamp.
    pub async fn touch(&self, token: &ControlToken) -> bool {
        let mut inner = self.inner.write().await;
        match inner.sessions.get_mut(token) {
            Some(session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    /// Attach a realtime connection. Attaching twice is a no-op.
    pub async fn attach_connection(&self, token: &ControlToken, conn: &ConnectionHandle) -> bool {
        let mut inner = self.inner.write().await;
        match inner.sessions.get_mut(token) {
            Some(session) if session.is_live() => {
                session
                    .connections
                    .entry(conn.id().clone())
                    .or_insert_with(|| conn.clone());
                true
            }
            _ => false,
        }
    }

    /// Detach a realtime connection from one session.
    pub async fn detach_connection(&self, token: &ControlToken, conn: &ConnectionId) -> bool {
        let mut inner = self.inner.write().await;
        inner
            .sessions
            .get_mut(token)
            .map(|session| session.connections.remove(conn).is_some())
            .unwrap_or(false)
    }

    /// Detach a realtime connection from every session it is attached to.
    pub async fn detach_everywhere(&self, conn: &ConnectionId) -> usize {
        let mut inner = self.inner.write().await;
        inner
            .sessions
            .values_mut()
            .map(|session| session.connections.remove(conn).is_some())
            .filter(|removed| *removed)
            .count()
    }

    /// Close every attached connection that is still open and clear the set.
    /// Returns the number actually closed.
    pub async fn close_all_connections(&self, token: &ControlToken, code: u16, reason: &str) -> usize {
        let (robot, connections) = {
            let mut inner = self.inner.write().await;
            match inner.sessions.get_mut(token) {
                Some(session) => (
                    session.robot_id.clone(),
                    session.connections.drain().map(|(_, c)| c).collect::<Vec<_>>(),
                ),
                None => return 0,
            }
        };
        close_connections(&robot, &connections, code, reason)
    }

    /// Tear down a session. Returns false if the token is unknown or another
    /// teardown already claimed it.
    pub async fn end(&self, token: &ControlToken, close_stream: bool) -> bool {
        self.end_with_report(token, close_stream).await.is_some()
    }

    /// Tear down a session and report what happened.
    pub async fn end_with_report(
        &self,
        token: &ControlToken,
        close_stream: bool,
    ) -> Option<TeardownReport> {
        let claimed = {
            let mut inner = self.inner.write().await;
            inner.sessions.get_mut(token).and_then(ControlSession::claim)
        };
        match claimed {
            Some(claimed) => Some(self.finish(claimed, close_stream).await),
            None => {
                debug!("Session {} already gone", token.redacted());
                None
            }
        }
    }

    async fn finish(&self, claimed: Claimed, close_stream: bool) -> TeardownReport {
        let Claimed {
            token,
            robot_id,
            stream,
            connections,
            mode,
            ended,
        } = claimed;

        let connections_closed =
            close_connections(&robot_id, &connections, CLOSE_NORMAL, "direct control ended");

        if let Some(stream) = stream {
            if close_stream {
                if let Err(e) = stream.close().await {
                    warn!(robot = %robot_id, token = %token.redacted(), "Failed to close command stream: {}", e);
                }
            }
        }

        let stop_response = self.stop_robot_side(&robot_id, &token).await;
        if let Err(e) = &stop_response {
            warn!(robot = %robot_id, token = %token.redacted(), "Stop direct control failed: {}", e);
        }

        if mode == ControlMode::Teleop && !self.has_other_live_session(&robot_id, &token).await {
            self.revert_mode(&robot_id).await;
        }

        self.inner.write().await.sessions.remove(&token);
        ended.cancel();
        info!(
            robot = %robot_id,
            token = %token.redacted(),
            connections_closed,
            "Direct control session ended"
        );
        self.publish(
            &robot_id,
            serde_json::json!({ "event": "ended", "token": token.redacted() }),
        );

        TeardownReport {
            connections_closed,
            stop_response,
        }
    }

    async fn stop_robot_side(
        &self,
        robot: &RobotId,
        token: &ControlToken,
    ) -> Result<serde_json::Value, GatewayError> {
        let channel = self.directory.direct_control(robot).await?;
        match tokio::time::timeout(self.rpc_timeout, channel.stop(token)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(crate::error::RpcError::Timeout(self.rpc_timeout).into()),
        }
    }

    async fn revert_mode(&self, robot: &RobotId) {
        let result = match self.directory.direct_control(robot).await {
            Ok(channel) => {
                match tokio::time::timeout(self.rpc_timeout, channel.set_mode(ControlMode::Auto)).await {
                    Ok(result) => result.map_err(GatewayError::from),
                    Err(_) => Err(crate::error::RpcError::Timeout(self.rpc_timeout).into()),
                }
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(robot = %robot, "Failed to revert robot to auto mode: {}", e);
        }
    }

    async fn has_other_live_session(&self, robot: &RobotId, token: &ControlToken) -> bool {
        let inner = self.inner.read().await;
        inner
            .sessions
            .values()
            .any(|s| s.is_live() && &s.robot_id == robot && &s.token != token)
    }

    /// End every session idle for longer than `max_idle`. Returns the number
    /// ended.
    pub async fn sweep_idle(&self, max_idle: Duration) -> usize {
        let now = chrono::Utc::now();
        let stale: Vec<ControlToken> = {
            let inner = self.inner.read().await;
            inner
                .sessions
                .values()
                .filter(|s| s.is_live() && s.idle_for(now) > max_idle)
                .map(|s| s.token.clone())
                .collect()
        };

        let mut ended = 0;
        for token in stale {
            debug!("Session {} idle beyond {:?}", token.redacted(), max_idle);
            if self.end(&token, true).await {
                ended += 1;
            }
        }
        ended
    }

    /// Number of live sessions.
    pub async fn count(&self) -> usize {
        let inner = self.inner.read().await;
        inner.sessions.values().filter(|s| s.is_live()).count()
    }

    /// Every registered token, terminating sessions included.
    pub async fn all_tokens(&self) -> Vec<ControlToken> {
        self.inner.read().await.sessions.keys().cloned().collect()
    }

    /// Snapshot of every live session, oldest first.
    pub async fn all(&self) -> Vec<SessionSnapshot> {
        let inner = self.inner.read().await;
        let mut sessions: Vec<_> = inner
            .sessions
            .values()
            .filter(|s| s.is_live())
            .map(ControlSession::snapshot)
            .collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        sessions
    }

    /// Take a start ticket for `robot`. Any older ticket becomes stale.
    pub async fn begin_start(&self, robot: &RobotId) -> StartTicket {
        let mut inner = self.inner.write().await;
        let generation = inner.generations.entry(robot.clone()).or_insert(0);
        *generation += 1;
        StartTicket {
            robot: robot.clone(),
            generation: *generation,
        }
    }

    /// Register the session a start request produced.
    ///
    /// Fails with [`GatewayError::Superseded`] if a newer start for the robot
    /// has taken a ticket; the supplied stream is then closed. Otherwise every
    /// other live session for the robot is torn down before this returns.
    pub async fn install(
        &self,
        ticket: &StartTicket,
        token: ControlToken,
        data: NewSession,
    ) -> Result<SessionSnapshot, GatewayError> {
        let outcome = {
            let mut inner = self.inner.write().await;
            let latest = inner.generations.get(&ticket.robot).copied().unwrap_or(0);
            if latest != ticket.generation {
                Err(data.stream)
            } else {
                let session = ControlSession::new(token.clone(), data);
                let snapshot = session.snapshot();
                inner.sessions.insert(token.clone(), session);

                let displaced: Vec<Claimed> = inner
                    .sessions
                    .values_mut()
                    .filter(|s| s.robot_id == ticket.robot && s.token != token)
                    .filter_map(ControlSession::claim)
                    .collect();
                Ok((snapshot, displaced))
            }
        };

        match outcome {
            Err(stream) => {
                if let Err(e) = stream.close().await {
                    debug!("Closing superseded stream failed: {}", e);
                }
                Err(GatewayError::Superseded(ticket.robot.clone()))
            }
            Ok((snapshot, displaced)) => {
                for claimed in displaced {
                    warn!(
                        robot = %claimed.robot_id,
                        token = %claimed.token.redacted(),
                        "Overtake: ending displaced session"
                    );
                    self.finish(claimed, true).await;
                }
                self.publish(
                    &snapshot.robot_id,
                    serde_json::json!({
                        "event": "started",
                        "token": snapshot.token.redacted(),
                        "operatorId": snapshot.operator_id,
                    }),
                );
                Ok(snapshot)
            }
        }
    }

    /// Deliver a command to the session's stream, touching the session first.
    pub async fn write_command(
        &self,
        robot: &RobotId,
        token: &ControlToken,
        command: AxisCommand,
    ) -> Result<(), DeliveryError> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(token)
            .filter(|s| s.is_live() && &s.robot_id == robot)
            .ok_or_else(|| DeliveryError::NoSession(robot.clone()))?;

        session.touch();
        match (&session.state, &session.stream) {
            (SessionState::Active, Some(stream)) => {
                stream.write(command).map_err(|source| DeliveryError::Write {
                    robot: robot.clone(),
                    source,
                })
            }
            _ => Err(DeliveryError::StreamUnavailable(robot.clone())),
        }
    }

    /// Signal cancelled once the session has been removed.
    pub async fn ended_signal(&self, token: &ControlToken) -> Option<CancellationToken> {
        let inner = self.inner.read().await;
        inner.sessions.get(token).map(|s| s.ended.clone())
    }

    /// Current state of a session.
    pub async fn state(&self, token: &ControlToken) -> Option<SessionState> {
        self.inner.read().await.sessions.get(token).map(|s| s.state)
    }

    /// Move an active session into recovery, dropping its broken stream.
    pub async fn mark_recovering(&self, token: &ControlToken) -> bool {
        let mut inner = self.inner.write().await;
        match inner.sessions.get_mut(token) {
            Some(session) if session.state == SessionState::Active => {
                session.state = SessionState::Recovering;
                session.stream = None;
                true
            }
            _ => false,
        }
    }

    /// Install a reopened stream on a recovering session. Hands the stream
    /// back if the session is gone or no longer recovering.
    pub async fn replace_stream(
        &self,
        token: &ControlToken,
        stream: Box<dyn CommandSink>,
    ) -> Result<(), Box<dyn CommandSink>> {
        let mut inner = self.inner.write().await;
        match inner.sessions.get_mut(token) {
            Some(session) if session.state == SessionState::Recovering => {
                session.stream = Some(stream);
                session.state = SessionState::Active;
                Ok(())
            }
            _ => Err(stream),
        }
    }

    /// Mark a recovering session as failed.
    pub async fn mark_failed(&self, token: &ControlToken) -> bool {
        let mut inner = self.inner.write().await;
        match inner.sessions.get_mut(token) {
            Some(session) if session.state == SessionState::Recovering => {
                session.state = SessionState::Failed;
                true
            }
            _ => false,
        }
    }

    fn publish(&self, robot: &RobotId, payload: serde_json::Value) {
        if let Some(hub) = &self.telemetry {
            hub.publish(TelemetryEvent::new(
                TelemetryTable::Sessions,
                Some(robot.clone()),
                payload,
            ));
        }
    }

    #[cfg(test)]
    async fn backdate(&self, token: &ControlToken, by: Duration) {
        let mut inner = self.inner.write().await;
        if let Some(session) = inner.sessions.get_mut(token) {
            session.last_activity = session.last_activity
                - chrono::Duration::from_std(by).expect("duration in range");
        }
    }
}

fn close_connections(
    robot: &RobotId,
    connections: &[ConnectionHandle],
    code: u16,
    reason: &str,
) -> usize {
    let mut closed = 0;
    for conn in connections.iter().filter(|c| c.is_open()) {
        match conn.close(code, reason) {
            Ok(()) => closed += 1,
            Err(e) => warn!(robot = %robot, "Failed to close realtime connection: {}", e),
        }
    }
    closed
}
