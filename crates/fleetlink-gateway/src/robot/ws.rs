//! JSON-RPC over WebSocket robot link.
//!
//! Each service channel is one WebSocket to `{endpoint}/{service}` carrying
//! JSON-RPC 2.0 frames. The direct-control command stream is a separate
//! WebSocket to `{endpoint}/direct-control/stream?token=...` that receives
//! `{"throttle": f64, "steering": f64}` text frames, at most one per tick.

use super::{CommandSink, CommandStream, RobotChannel, RobotConnector, StreamEvent};
use crate::error::{RpcError, WriteError};
use crate::rpc::{JsonRpcRequest, JsonRpcResponse};
use async_trait::async_trait;
use fleetlink_core::{AxisCommand, ControlToken, RobotId, ServiceKind};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

type RobotSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connector that reaches robots over WebSocket.
#[derive(Debug, Clone)]
pub struct WsConnector {
    rpc_timeout: Duration,
    command_tick: Duration,
}

impl WsConnector {
    /// Create a connector.
    pub fn new(rpc_timeout: Duration, command_tick: Duration) -> Self {
        Self {
            rpc_timeout,
            command_tick,
        }
    }
}

#[async_trait]
impl RobotConnector for WsConnector {
    async fn connect(
        &self,
        robot: &RobotId,
        endpoint: &str,
        kind: ServiceKind,
    ) -> Result<Arc<dyn RobotChannel>, RpcError> {
        let channel = WsRobotChannel::connect(
            robot.clone(),
            endpoint,
            kind,
            self.rpc_timeout,
            self.command_tick,
        )
        .await?;
        Ok(Arc::new(channel))
    }
}

/// Build `{endpoint}/{segments...}`.
fn service_url(endpoint: &str, segments: &[&str]) -> Result<Url, RpcError> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| RpcError::Transport(format!("invalid endpoint '{}': {}", endpoint, e)))?;
    url.path_segments_mut()
        .map_err(|_| RpcError::Transport(format!("endpoint '{}' cannot be a base", endpoint)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

async fn open_socket(url: &Url, timeout: Duration) -> Result<RobotSocket, RpcError> {
    match tokio::time::timeout(timeout, connect_async(url.as_str())).await {
        Ok(Ok((socket, _response))) => Ok(socket),
        Ok(Err(e)) => Err(RpcError::Transport(e.to_string())),
        Err(_) => Err(RpcError::Timeout(timeout)),
    }
}

fn normal_close(reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: reason.into(),
    }))
}

type PendingCalls = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// One robot service reached over WebSocket.
pub struct WsRobotChannel {
    robot: RobotId,
    kind: ServiceKind,
    endpoint: String,
    outbound: mpsc::UnboundedSender<Message>,
    pending: PendingCalls,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    rpc_timeout: Duration,
    command_tick: Duration,
}

impl WsRobotChannel {
    /// Connect to `kind` on the robot at `endpoint`.
    pub async fn connect(
        robot: RobotId,
        endpoint: &str,
        kind: ServiceKind,
        rpc_timeout: Duration,
        command_tick: Duration,
    ) -> Result<Self, RpcError> {
        let url = service_url(endpoint, &[kind.path()])?;
        let socket = open_socket(&url, rpc_timeout).await?;
        debug!("Connected to {} service of robot {} at {}", kind, robot, url);

        let (mut write, mut read) = socket.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if write.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        let reader_pending = pending.clone();
        let reader_closed = closed.clone();
        let reader_robot = robot.clone();
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<JsonRpcResponse>(&text) {
                        Ok(response) => {
                            let waiter = response.id.and_then(|id| reader_pending.lock().remove(&id));
                            match waiter {
                                Some(tx) => {
                                    let _ = tx.send(response);
                                }
                                None => debug!("Unsolicited frame from robot {}", reader_robot),
                            }
                        }
                        Err(e) => warn!("Malformed frame from robot {}: {}", reader_robot, e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("{} channel to robot {} failed: {}", kind, reader_robot, e);
                        break;
                    }
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
            // Dropping the senders fails every outstanding call with Closed.
            reader_pending.lock().clear();
        });

        Ok(Self {
            robot,
            kind,
            endpoint: endpoint.to_string(),
            outbound,
            pending,
            next_id: AtomicU64::new(1),
            closed,
            rpc_timeout,
            command_tick,
        })
    }
}

#[async_trait]
impl RobotChannel for WsRobotChannel {
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

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::call(id, method, params);
        let text = serde_json::to_string(&request)
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if self.outbound.send(Message::Text(text)).is_err() {
            self.pending.lock().remove(&id);
            return Err(RpcError::Closed);
        }

        debug!("Calling {} on robot {} (id {})", method, self.robot, id);
        match tokio::time::timeout(self.rpc_timeout, rx).await {
            Ok(Ok(response)) => response.into_result(),
            Ok(Err(_)) => Err(RpcError::Closed),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(RpcError::Timeout(self.rpc_timeout))
            }
        }
    }

    async fn open_stream(&self, token: &ControlToken) -> Result<CommandStream, RpcError> {
        if self.kind != ServiceKind::DirectControl {
            return Err(RpcError::Unsupported(self.kind.to_string()));
        }

        let mut url = service_url(&self.endpoint, &[self.kind.path(), "stream"])?;
        url.query_pairs_mut().append_pair("token", token.as_str());
        let socket = open_socket(&url, self.rpc_timeout).await?;

        let (commands, commands_rx) = watch::channel(None);
        let (events_tx, events) = mpsc::channel(4);
        let shutdown = CancellationToken::new();

        tokio::spawn(pump_commands(
            socket,
            commands_rx,
            events_tx,
            shutdown.clone(),
            self.command_tick,
        ));

        debug!("Command stream open to robot {}", self.robot);
        Ok(CommandStream {
            sink: Box::new(WsCommandSink { commands, shutdown }),
            events,
        })
    }

    fn is_closed(&self) -> bool {
        // The writer task exits as soon as a send fails.
        self.closed.load(Ordering::SeqCst) || self.outbound.is_closed()
    }

    async fn close(&self) -> Result<(), RpcError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // The writer may already be gone if the robot hung up first.
        let _ = self.outbound.send(normal_close("gateway closing channel"));
        Ok(())
    }
}

/// Writable half of a WebSocket command stream. Writes replace the pending
/// command; the pump flushes the latest one each tick.
struct WsCommandSink {
    commands: watch::Sender<Option<AxisCommand>>,
    shutdown: CancellationToken,
}

#[async_trait]
impl CommandSink for WsCommandSink {
    fn write(&self, command: AxisCommand) -> Result<(), WriteError> {
        if self.shutdown.is_cancelled() || self.commands.is_closed() {
            return Err(WriteError::Closed);
        }
        self.commands.send_replace(Some(command));
        Ok(())
    }

    async fn close(&self) -> Result<(), RpcError> {
        self.shutdown.cancel();
        Ok(())
    }
}

async fn pump_commands(
    socket: RobotSocket,
    mut commands: watch::Receiver<Option<AxisCommand>>,
    events: mpsc::Sender<StreamEvent>,
    shutdown: CancellationToken,
    tick: Duration,
) {
    let (mut write, mut read) = socket.split();
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = write.send(normal_close("direct control ended")).await;
                break;
            }
            _ = ticker.tick() => {
                match commands.has_changed() {
                    Ok(true) => {
                        let latest = *commands.borrow_and_update();
                        if let Some(command) = latest {
                            let frame = serde_json::json!({
                                "throttle": command.throttle,
                                "steering": command.steering,
                            });
                            if let Err(e) = write.send(Message::Text(frame.to_string())).await {
                                let _ = events.send(StreamEvent::Error(e.to_string())).await;
                                break;
                            }
                        }
                    }
                    Ok(false) => {}
                    Err(_) => {
                        // Sink dropped without an explicit close.
                        let _ = write.send(normal_close("direct control ended")).await;
                        break;
                    }
                }
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Close(_))) | None => {
                    let _ = events.send(StreamEvent::End).await;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = events.send(StreamEvent::Error(e.to_string())).await;
                    break;
                }
            },
        }
    }
}
