//! Direct-control start/stop protocol and command stream supervision.

use crate::directory::DirectControlChannel;
use crate::error::{GatewayError, RpcError};
use crate::mux::CommandMux;
use crate::robot::{CommandStream, StreamEvent};
use crate::session::{NewSession, SessionRegistry, SessionState};
use fleetlink_core::config::StreamRetryConfig;
use fleetlink_core::{ControlMode, ControlToken, OperatorId, RobotId};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Bounded exponential backoff for reopening a broken command stream.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

impl From<&StreamRetryConfig> for RetryPolicy {
    fn from(config: &StreamRetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&StreamRetryConfig::default())
    }
}

/// Parameters of a start request.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub robot_id: RobotId,
    pub operator_id: OperatorId,
    pub operator_address: String,
}

/// A session that was started.
#[derive(Debug, Clone)]
pub struct StartedSession {
    pub token: ControlToken,
    pub robot_id: RobotId,
    pub operator_id: OperatorId,
    /// Sessions for the same robot ended by this start.
    pub overtaken: usize,
}

/// Result of a stop request.
#[derive(Debug, Clone)]
pub struct StopOutcome {
    /// Token that was stopped; empty when nothing was running.
    pub token: ControlToken,

    /// Whether a session was found and torn down by this request.
    pub stopped: bool,

    /// Robot's answer to the stop call.
    pub response: Option<serde_json::Value>,
}

impl StopOutcome {
    fn nothing() -> Self {
        Self {
            token: ControlToken::new(""),
            stopped: false,
            response: None,
        }
    }
}

/// Starts and stops direct-control sessions.
pub struct ControlService {
    registry: Arc<SessionRegistry>,
    mux: Arc<CommandMux>,
    retry: RetryPolicy,
    rpc_timeout: Duration,
}

impl ControlService {
    /// Create a control service.
    pub fn new(
        registry: Arc<SessionRegistry>,
        mux: Arc<CommandMux>,
        retry: RetryPolicy,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            mux,
            retry,
            rpc_timeout,
        }
    }

    /// Session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Start direct control of a robot, taking over from any existing session.
    pub async fn start(&self, request: StartRequest) -> Result<StartedSession, GatewayError> {
        let StartRequest {
            robot_id,
            operator_id,
            operator_address,
        } = request;

        let ticket = self.registry.begin_start(&robot_id).await;

        // The previous stream must be closed before a new one is opened.
        let mut overtaken = 0;
        for existing in self.registry.find_by_robot(&robot_id).await {
            warn!(
                robot = %robot_id,
                token = %existing.token.redacted(),
                previous_operator = %existing.operator_id,
                operator = %operator_id,
                "Overtake: ending existing direct control session"
            );
            if self.registry.end(&existing.token, true).await {
                overtaken += 1;
            }
        }

        let channel = self.registry.directory().direct_control(&robot_id).await?;
        let token = self
            .bounded(channel.start(&operator_id, &operator_address))
            .await?;
        debug!("Robot {} issued token {}", robot_id, token.redacted());

        let CommandStream { sink, events } = match self.bounded(channel.open_command_stream(&token)).await {
            Ok(stream) => stream,
            Err(e) => {
                self.abandon(&channel, &token).await;
                return Err(GatewayError::Stream(e.to_string()));
            }
        };

        if let Err(e) = self.bounded(channel.set_mode(ControlMode::Teleop)).await {
            if let Err(close_err) = sink.close().await {
                debug!("Closing abandoned stream failed: {}", close_err);
            }
            self.abandon(&channel, &token).await;
            return Err(e.into());
        }

        let session = NewSession {
            robot_id: robot_id.clone(),
            operator_id: operator_id.clone(),
            stream: sink,
            mode: ControlMode::Teleop,
        };
        if let Err(e) = self.registry.install(&ticket, token.clone(), session).await {
            // The newer start owns the robot's mode now; only release our token.
            self.abandon(&channel, &token).await;
            return Err(e);
        }

        self.mux.bind(&robot_id, &token).await;

        if let Some(ended) = self.registry.ended_signal(&token).await {
            tokio::spawn(supervise_stream(
                self.registry.clone(),
                token.clone(),
                robot_id.clone(),
                events,
                ended,
                self.retry.clone(),
                self.rpc_timeout,
            ));
        }

        info!(
            robot = %robot_id,
            operator = %operator_id,
            token = %token.redacted(),
            "Direct control session started"
        );

        Ok(StartedSession {
            token,
            robot_id,
            operator_id,
            overtaken,
        })
    }

    /// Stop the session controlling `robot`, if any.
    pub async fn stop(
        &self,
        robot: &RobotId,
        operator: Option<&OperatorId>,
    ) -> Result<StopOutcome, GatewayError> {
        let Some(session) = self.registry.find_by_robot(robot).await.into_iter().next() else {
            debug!("Stop for robot {} with no active session", robot);
            return Ok(StopOutcome::nothing());
        };

        if let Some(operator) = operator {
            if operator != &session.operator_id {
                warn!(
                    robot = %robot,
                    operator = %operator,
                    controlling_operator = %session.operator_id,
                    "Stop requested by a device that is not controlling the robot"
                );
            }
        }

        let report = self.registry.end_with_report(&session.token, true).await;
        self.mux.reconcile().await;

        match report {
            Some(report) => Ok(StopOutcome {
                token: session.token,
                stopped: true,
                response: Some(report.stop_response?),
            }),
            None => Ok(StopOutcome {
                token: session.token,
                stopped: false,
                response: None,
            }),
        }
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, RpcError>
    where
        F: Future<Output = Result<T, RpcError>>,
    {
        tokio::time::timeout(self.rpc_timeout, call)
            .await
            .unwrap_or(Err(RpcError::Timeout(self.rpc_timeout)))
    }

    async fn abandon(&self, channel: &DirectControlChannel, token: &ControlToken) {
        if let Err(e) = self.bounded(channel.stop(token)).await {
            warn!(
                robot = %channel.robot(),
                token = %token.redacted(),
                "Failed to release token after aborted start: {}",
                e
            );
        }
    }
}

/// Watch a session's command stream until the session ends.
///
/// A clean end from the robot tears the session down right away. An error
/// moves it to recovery and the stream is reopened under the same token; when
/// the retry budget runs out the session fails and is torn down.
async fn supervise_stream(
    registry: Arc<SessionRegistry>,
    token: ControlToken,
    robot: RobotId,
    mut events: mpsc::Receiver<StreamEvent>,
    ended: tokio_util::sync::CancellationToken,
    retry: RetryPolicy,
    rpc_timeout: Duration,
) {
    loop {
        let event = tokio::select! {
            _ = ended.cancelled() => return,
            event = events.recv() => event,
        };

        match event {
            Some(StreamEvent::Error(message)) => {
                warn!(
                    robot = %robot,
                    token = %token.redacted(),
                    "Command stream error: {}",
                    message
                );
                if !registry.mark_recovering(&token).await {
                    return;
                }
                match reopen_stream(&registry, &robot, &token, &ended, &retry, rpc_timeout).await {
                    Some(next) => events = next,
                    None => {
                        if registry.mark_failed(&token).await {
                            warn!(
                                robot = %robot,
                                token = %token.redacted(),
                                "Command stream recovery gave up after {} attempt(s)",
                                retry.max_attempts
                            );
                        }
                        registry.end(&token, false).await;
                        return;
                    }
                }
            }
            Some(StreamEvent::End) | None => {
                if registry.end(&token, false).await {
                    info!(robot = %robot, token = %token.redacted(), "Command stream closed by robot");
                }
                return;
            }
        }
    }
}

async fn reopen_stream(
    registry: &SessionRegistry,
    robot: &RobotId,
    token: &ControlToken,
    ended: &tokio_util::sync::CancellationToken,
    retry: &RetryPolicy,
    rpc_timeout: Duration,
) -> Option<mpsc::Receiver<StreamEvent>> {
    for attempt in 0..retry.max_attempts {
        tokio::select! {
            _ = ended.cancelled() => return None,
            _ = tokio::time::sleep(retry.delay_for(attempt)) => {}
        }
        if registry.state(token).await != Some(SessionState::Recovering) {
            return None;
        }

        // Resolved per attempt so a channel the robot hung up on is replaced.
        let opened = match registry.directory().direct_control(robot).await {
            Ok(channel) => tokio::time::timeout(rpc_timeout, channel.open_command_stream(token))
                .await
                .unwrap_or(Err(RpcError::Timeout(rpc_timeout)))
                .map_err(GatewayError::from),
            Err(e) => Err(e),
        };
        match opened {
            Ok(CommandStream { sink, events }) => {
                return match registry.replace_stream(token, sink).await {
                    Ok(()) => {
                        info!(
                            robot = %robot,
                            token = %token.redacted(),
                            attempt = attempt + 1,
                            "Command stream recovered"
                        );
                        Some(events)
                    }
                    Err(sink) => {
                        if let Err(e) = sink.close().await {
                            debug!("Closing stream reopened for ended session failed: {}", e);
                        }
                        None
                    }
                };
            }
            Err(e) => debug!(
                "Reopening stream for robot {} failed (attempt {}): {}",
                robot,
                attempt + 1,
                e
            ),
        }
    }
    None
}
