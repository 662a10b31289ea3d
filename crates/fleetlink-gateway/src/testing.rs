//! In-process mock robot fleet for tests.
//!
//! [`MockFleet`] hands out a [`RobotConnector`] whose channels answer the
//! direct-control methods locally, issue `tok-N` tokens, record every call and
//! expose each opened command stream through a [`MockStreamHandle`] so tests
//! can inspect written commands and inject stream errors.

use crate::error::{RpcError, WriteError};
use crate::robot::{CommandSink, CommandStream, RobotChannel, RobotConnector, StreamEvent};
use crate::rpc::methods;
use async_trait::async_trait;
use fleetlink_core::{AxisCommand, ControlToken, RobotId, ServiceKind};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// A call received by a mock channel.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub robot: RobotId,
    pub kind: ServiceKind,
    pub method: String,
    pub params: serde_json::Value,
}

#[derive(Default)]
struct FleetState {
    next_token: AtomicU64,
    connects: AtomicUsize,
    fail_start: AtomicBool,
    fail_set_mode: AtomicBool,
    stream_open_failures: AtomicU32,
    stop_delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<RecordedCall>>,
    streams: Mutex<Vec<MockStreamHandle>>,
    channels: Mutex<Vec<Arc<AtomicBool>>>,
}

/// Shared controls for a mock fleet.
#[derive(Clone, Default)]
pub struct MockFleet {
    state: Arc<FleetState>,
}

impl MockFleet {
    /// Create a fleet where every call succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every open channel as if each robot had hung up.
    pub fn hang_up_all(&self) {
        for closed in self.state.channels.lock().iter() {
            closed.store(true, Ordering::SeqCst);
        }
    }

    /// Connector backed by this fleet.
    pub fn connector(&self) -> Arc<dyn RobotConnector> {
        Arc::new(MockConnector {
            state: self.state.clone(),
        })
    }

    /// Make `startDirectControl` fail with a remote error.
    pub fn fail_start(&self, fail: bool) {
        self.state.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Make `setControlMode` fail with a remote error.
    pub fn fail_set_mode(&self, fail: bool) {
        self.state.fail_set_mode.store(fail, Ordering::SeqCst);
    }

    /// Refuse the next `n` stream opens.
    pub fn fail_next_stream_opens(&self, n: u32) {
        self.state.stream_open_failures.store(n, Ordering::SeqCst);
    }

    /// Delay every `stopDirectControl` answer.
    pub fn set_stop_delay(&self, delay: Option<Duration>) {
        *self.state.stop_delay.lock() = delay;
    }

    /// Number of channels opened.
    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Every call received so far.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.calls.lock().clone()
    }

    /// Number of calls of `method` received for `robot`.
    pub fn calls_for(&self, robot: &RobotId, method: &str) -> usize {
        self.state
            .calls
            .lock()
            .iter()
            .filter(|c| &c.robot == robot && c.method == method)
            .count()
    }

    /// Modes requested through `setControlMode` for `robot`, in order.
    pub fn modes_for(&self, robot: &RobotId) -> Vec<String> {
        self.state
            .calls
            .lock()
            .iter()
            .filter(|c| &c.robot == robot && c.method == methods::SET_CONTROL_MODE)
            .filter_map(|c| c.params["mode"].as_str().map(str::to_string))
            .collect()
    }

    /// Tokens passed to `stopDirectControl` for `robot`.
    pub fn stopped_tokens(&self, robot: &RobotId) -> Vec<String> {
        self.state
            .calls
            .lock()
            .iter()
            .filter(|c| &c.robot == robot && c.method == methods::STOP_DIRECT_CONTROL)
            .filter_map(|c| c.params["directControlToken"].as_str().map(str::to_string))
            .collect()
    }

    /// Every stream opened for `robot`, oldest first.
    pub fn streams_for(&self, robot: &RobotId) -> Vec<MockStreamHandle> {
        self.state
            .streams
            .lock()
            .iter()
            .filter(|s| &s.robot == robot)
            .cloned()
            .collect()
    }

    /// Most recent stream opened for `robot`.
    pub fn last_stream(&self, robot: &RobotId) -> Option<MockStreamHandle> {
        self.streams_for(robot).pop()
    }
}

/// Test-side view of one opened command stream.
#[derive(Clone)]
pub struct MockStreamHandle {
    pub robot: RobotId,
    pub token: ControlToken,
    commands: Arc<Mutex<Vec<AxisCommand>>>,
    closed: Arc<AtomicBool>,
    events: mpsc::Sender<StreamEvent>,
}

impl MockStreamHandle {
    /// Commands written so far.
    pub fn commands(&self) -> Vec<AxisCommand> {
        self.commands.lock().clone()
    }

    /// Whether the gateway closed the stream.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Report a stream error to the gateway.
    pub async fn fail(&self, message: &str) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.events.send(StreamEvent::Error(message.to_string())).await;
    }

    /// Report that the robot ended the stream.
    pub async fn end(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.events.send(StreamEvent::End).await;
    }
}

struct MockConnector {
    state: Arc<FleetState>,
}

#[async_trait]
impl RobotConnector for MockConnector {
    async fn connect(
        &self,
        robot: &RobotId,
        _endpoint: &str,
        kind: ServiceKind,
    ) -> Result<Arc<dyn RobotChannel>, RpcError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let closed = Arc::new(AtomicBool::new(false));
        self.state.channels.lock().push(closed.clone());
        Ok(Arc::new(MockChannel {
            robot: robot.clone(),
            kind,
            state: self.state.clone(),
            closed,
        }))
    }
}

struct MockChannel {
    robot: RobotId,
    kind: ServiceKind,
    state: Arc<FleetState>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl RobotChannel for MockChannel {
    fn kind(&self) -> ServiceKind {
        self.kind
    }

    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, RpcError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Closed);
        }
        self.state.calls.lock().push(RecordedCall {
            robot: self.robot.clone(),
            kind: self.kind,
            method: method.to_string(),
            params: params.clone(),
        });

        match method {
            methods::START_DIRECT_CONTROL => {
                if self.state.fail_start.load(Ordering::SeqCst) {
                    return Err(RpcError::Remote {
                        code: -32000,
                        message: "robot refused direct control".to_string(),
                    });
                }
                let n = self.state.next_token.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(serde_json::json!({ "directControlToken": format!("tok-{}", n) }))
            }
            methods::STOP_DIRECT_CONTROL => {
                let delay = *self.state.stop_delay.lock();
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(serde_json::json!({
                    "stopped": true,
                    "directControlToken": params["directControlToken"],
                }))
            }
            methods::SET_CONTROL_MODE => {
                if self.state.fail_set_mode.load(Ordering::SeqCst) {
                    return Err(RpcError::Remote {
                        code: -32001,
                        message: "mode change rejected".to_string(),
                    });
                }
                Ok(serde_json::json!({ "mode": params["mode"] }))
            }
            other => Err(RpcError::Remote {
                code: -32601,
                message: format!("Method not found: {}", other),
            }),
        }
    }

    async fn open_stream(&self, token: &ControlToken) -> Result<CommandStream, RpcError> {
        if self.kind != ServiceKind::DirectControl {
            return Err(RpcError::Unsupported(self.kind.to_string()));
        }
        let refused = self
            .state
            .stream_open_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(RpcError::Transport("stream refused".to_string()));
        }

        let (events_tx, events) = mpsc::channel(4);
        let handle = MockStreamHandle {
            robot: self.robot.clone(),
            token: token.clone(),
            commands: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
            events: events_tx,
        };
        self.state.streams.lock().push(handle.clone());

        Ok(CommandStream {
            sink: Box::new(MockSink {
                commands: handle.commands.clone(),
                closed: handle.closed.clone(),
            }),
            events,
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), RpcError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MockSink {
    commands: Arc<Mutex<Vec<AxisCommand>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl CommandSink for MockSink {
    fn write(&self, command: AxisCommand) -> Result<(), WriteError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WriteError::Closed);
        }
        self.commands.lock().push(command);
        Ok(())
    }

    async fn close(&self) -> Result<(), RpcError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
