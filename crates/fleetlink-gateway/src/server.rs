//! HTTP API and realtime WebSocket servers.
//!
//! The gateway listens on two ports: the HTTP API (direct-control start/stop,
//! session status, robot listing, health) and the realtime listener where
//! dashboards send operator input.

use crate::connection::{ConnectionHandle, ConnectionTracker, Outbound};
use crate::control::{ControlService, RetryPolicy};
use crate::directory::ChannelDirectory;
use crate::error::GatewayError;
use crate::handlers::{self, realtime::handle_client_message};
use crate::mux::CommandMux;
use crate::reaper::IdleReaper;
use crate::robot::{RobotConnector, WsConnector};
use crate::session::SessionRegistry;
use crate::shutdown::{ShutdownCoordinator, ShutdownOutcome, ShutdownSignals};
use crate::telemetry::TelemetryHub;
use crate::Result;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        ConnectInfo, Query, Request, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, HeaderValue, Method},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use fleetlink_core::config::BindMode;
use fleetlink_core::Config;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Origins allowed by CORS on loopback binds.
const LOOPBACK_ORIGINS: &[&str] = &[
    "http://localhost",
    "http://127.0.0.1",
    "https://localhost",
    "https://127.0.0.1",
];

/// How long to wait for the listeners to wind down after shutdown.
const LISTENER_GRACE: Duration = Duration::from_secs(2);

/// Shared state behind every handler.
pub struct GatewayState {
    /// Loaded configuration.
    pub config: Config,

    /// Robot channel directory.
    pub directory: Arc<ChannelDirectory>,

    /// Session registry.
    pub registry: Arc<SessionRegistry>,

    /// Command multiplexer.
    pub mux: Arc<CommandMux>,

    /// Start/stop protocol.
    pub control: Arc<ControlService>,

    /// Telemetry hub.
    pub telemetry: Arc<TelemetryHub>,

    /// Open realtime connections.
    pub connections: Arc<ConnectionTracker>,

    started_at: Instant,
}

impl GatewayState {
    /// Time since the gateway was built.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Check the bearer token, if one is configured. The realtime listener
    /// also accepts it as a `token` query parameter.
    fn authenticate(&self, headers: &HeaderMap, query_token: Option<&str>) -> Result<()> {
        let Some(expected) = self.config.gateway.auth_token.as_deref() else {
            return Ok(());
        };

        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .or(query_token);

        match presented {
            Some(token) if token == expected => Ok(()),
            Some(_) => Err(GatewayError::Auth("Invalid authentication token".to_string())),
            None => Err(GatewayError::Auth("Authentication required".to_string())),
        }
    }
}

/// The FleetLink gateway.
pub struct Gateway {
    state: Arc<GatewayState>,
}

impl Gateway {
    /// Build a gateway that reaches robots through `connector`. Robots listed
    /// in the configuration are registered right away.
    pub async fn new(config: Config, connector: Arc<dyn RobotConnector>) -> Self {
        let directory = Arc::new(ChannelDirectory::new(connector));
        directory.register_all(&config.robots).await;

        let telemetry = Arc::new(TelemetryHub::new());
        let registry = Arc::new(
            SessionRegistry::new(directory.clone(), config.control.rpc_timeout())
                .with_telemetry(telemetry.clone()),
        );
        let mux = Arc::new(CommandMux::new(registry.clone()));
        let control = Arc::new(ControlService::new(
            registry.clone(),
            mux.clone(),
            RetryPolicy::from(&config.control.stream_retry),
            config.control.rpc_timeout(),
        ));

        let state = Arc::new(GatewayState {
            config,
            directory,
            registry,
            mux,
            control,
            telemetry,
            connections: Arc::new(ConnectionTracker::new()),
            started_at: Instant::now(),
        });

        Self { state }
    }

    /// Build a gateway that reaches robots over WebSocket.
    pub async fn from_config(config: Config) -> Self {
        let connector = Arc::new(WsConnector::new(
            config.control.rpc_timeout(),
            config.control.command_tick(),
        ));
        Self::new(config, connector).await
    }

    /// Shared state.
    pub fn state(&self) -> &Arc<GatewayState> {
        &self.state
    }

    /// HTTP API address from configuration.
    pub fn api_address(&self) -> SocketAddr {
        let gateway = &self.state.config.gateway;
        SocketAddr::from((gateway.bind.ip(), gateway.port))
    }

    /// Realtime listener address from configuration.
    pub fn realtime_address(&self) -> SocketAddr {
        let gateway = &self.state.config.gateway;
        SocketAddr::from((gateway.bind.ip(), gateway.realtime_port))
    }

    /// Bind both listeners and serve until `signal` resolves, then shut down.
    pub async fn run<F>(&self, signal: F) -> Result<ShutdownOutcome>
    where
        F: Future<Output = ()> + Send,
    {
        let api_addr = self.api_address();
        let realtime_addr = self.realtime_address();

        if self.state.config.gateway.bind != BindMode::Loopback
            && self.state.config.gateway.auth_token.is_none()
        {
            warn!("Gateway is reachable from the network without an auth token");
            warn!("Set --auth-token or FLEETLINK_AUTH_TOKEN to require one");
        }

        let api = TcpListener::bind(api_addr).await.map_err(GatewayError::Io)?;
        let realtime = TcpListener::bind(realtime_addr)
            .await
            .map_err(GatewayError::Io)?;

        self.serve(api, realtime, signal).await
    }

    /// Serve on already-bound listeners until `signal` resolves, then run the
    /// shutdown sequence.
    pub async fn serve<F>(
        &self,
        api: TcpListener,
        realtime: TcpListener,
        signal: F,
    ) -> Result<ShutdownOutcome>
    where
        F: Future<Output = ()> + Send,
    {
        let signals = ShutdownSignals::default();
        let control = &self.state.config.control;

        let reaper = IdleReaper::new(
            self.state.registry.clone(),
            self.state.mux.clone(),
            control.idle_timeout(),
            control.reap_interval(),
        )
        .spawn(signals.reaper.clone());

        info!("HTTP API listening on {}", api.local_addr()?);
        info!("Realtime listener on {}", realtime.local_addr()?);

        let api_cancel = signals.api.clone();
        let api_app = self.api_router();
        let api_task = tokio::spawn(async move {
            let result = axum::serve(api, api_app.into_make_service())
                .with_graceful_shutdown(async move { api_cancel.cancelled().await })
                .await;
            if let Err(e) = result {
                error!("HTTP API server failed: {}", e);
            }
        });

        let realtime_cancel = signals.realtime.clone();
        let realtime_app = self.realtime_router();
        let realtime_task = tokio::spawn(async move {
            let result = axum::serve(
                realtime,
                realtime_app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { realtime_cancel.cancelled().await })
            .await;
            if let Err(e) = result {
                error!("Realtime server failed: {}", e);
            }
        });

        signal.await;
        info!("Shutdown signal received");

        let outcome = ShutdownCoordinator::new(
            self.state.registry.clone(),
            self.state.connections.clone(),
            signals,
            self.state.config.shutdown.deadline(),
        )
        .run()
        .await;

        let wind_down = async {
            let _ = reaper.await;
            let _ = realtime_task.await;
            let _ = api_task.await;
        };
        if tokio::time::timeout(LISTENER_GRACE, wind_down).await.is_err() {
            warn!("Listeners did not stop within {:?}", LISTENER_GRACE);
        }

        let closed = self.state.directory.close_all().await;
        debug!("Closed {} robot channel(s)", closed);

        Ok(outcome)
    }

    /// Router for the HTTP API.
    pub fn api_router(&self) -> Router {
        let state = self.state.clone();

        let api = Router::new()
            .route("/api/robots", get(handlers::health::robots))
            .route("/api/direct-control/start", post(handlers::direct_control::start))
            .route("/api/direct-control/stop", post(handlers::direct_control::stop))
            .route(
                "/api/direct-control/session/:token",
                get(handlers::direct_control::session),
            )
            .route(
                "/api/direct-control/sessions",
                get(handlers::direct_control::sessions),
            )
            .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

        let mut router = Router::new()
            .route("/health", get(handlers::health::health))
            .merge(api)
            .with_state(state)
            .layer(TraceLayer::new_for_http());

        if self.state.config.gateway.cors {
            router = router.layer(Self::create_cors_layer(self.state.config.gateway.bind));
        }

        router
    }

    /// Router for the realtime listener.
    pub fn realtime_router(&self) -> Router {
        Router::new()
            .route("/", get(ws_handler))
            .route("/ws", get(ws_handler))
            .with_state(self.state.clone())
    }

    fn create_cors_layer(bind: BindMode) -> CorsLayer {
        let layer = CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
            .max_age(Duration::from_secs(3600));

        if bind == BindMode::Loopback {
            let origins: Vec<HeaderValue> = LOOPBACK_ORIGINS
                .iter()
                .filter_map(|o| HeaderValue::from_str(o).ok())
                .collect();
            layer.allow_origin(AllowOrigin::list(origins))
        } else {
            layer.allow_origin(Any)
        }
    }
}

/// Reject API requests without the configured bearer token.
async fn require_auth(
    State(state): State<Arc<GatewayState>>,
    request: Request,
    next: Next,
) -> Response {
    match state.authenticate(request.headers(), None) {
        Ok(()) => next.run(request).await,
        Err(e) => {
            warn!("Rejected {} {}: {}", request.method(), request.uri().path(), e);
            e.into_response()
        }
    }
}

/// Realtime upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<Arc<GatewayState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr);

    if let Err(e) = state.authenticate(&headers, query.get("token").map(String::as_str)) {
        warn!("Realtime authentication failed from {:?}: {}", remote_addr, e);
        return e.into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

/// Serve one realtime connection until either side closes it.
async fn handle_socket(socket: WebSocket, state: Arc<GatewayState>, remote_addr: Option<SocketAddr>) {
    let (handle, mut outbound) = ConnectionHandle::new(remote_addr);
    let conn_id = handle.id().clone();
    state.connections.register(handle.clone()).await;
    info!("Realtime client connected: {} from {:?}", conn_id, remote_addr);

    let (mut sender, mut receiver) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(item) = outbound.recv().await {
            let message = match item {
                Outbound::Frame(frame) => match serde_json::to_string(&frame) {
                    Ok(text) => Message::Text(text),
                    Err(e) => {
                        error!("Failed to encode frame: {}", e);
                        continue;
                    }
                },
                Outbound::Raw(text) => Message::Text(text),
                Outbound::Close { code, reason } => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            };
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let mut subscriptions = Vec::new();
    let reader = async {
        while let Some(message) = receiver.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    handle_client_message(&state, &handle, &text, &mut subscriptions).await;
                }
                Ok(Message::Close(_)) => {
                    debug!("Client {} closed connection", conn_id);
                    break;
                }
                Err(e) => {
                    warn!("Realtime socket error on {}: {}", conn_id, e);
                    break;
                }
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = reader => {}
        _ = &mut writer => {}
    }
    writer.abort();
    drop(subscriptions);

    let detached = state.registry.detach_everywhere(&conn_id).await;
    state.connections.unregister(&conn_id).await;
    info!(
        "Realtime client disconnected: {} (detached from {} session(s))",
        conn_id, detached
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockFleet;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use tower::ServiceExt;

    async fn gateway(auth_token: Option<&str>) -> Gateway {
        let mut config = Config::default();
        config.gateway.auth_token = auth_token.map(str::to_string);
        Gateway::new(config, MockFleet::new().connector()).await
    }

    #[tokio::test]
    async fn test_health_is_open() {
        let gateway = gateway(Some("secret")).await;
        let response = gateway
            .api_router()
            .oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_requires_configured_token() {
        let gateway = gateway(Some("secret")).await;
        let app = gateway.api_router();

        let response = app
            .clone()
            .oneshot(HttpRequest::get("/api/robots").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(
                HttpRequest::get("/api/robots")
                    .header("authorization", "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                HttpRequest::get("/api/robots")
                    .header("authorization", "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_open_without_token() {
        let gateway = gateway(None).await;
        let response = gateway
            .api_router()
            .oneshot(
                HttpRequest::get("/api/direct-control/sessions")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_bind_addresses() {
        let gateway = gateway(None).await;
        assert_eq!(gateway.api_address(), "127.0.0.1:8080".parse().unwrap());
        assert_eq!(gateway.realtime_address(), "127.0.0.1:8081".parse().unwrap());
    }
}
