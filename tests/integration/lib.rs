//! Shared harness for the FleetLink integration tests.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use fleetlink_core::config::RobotConfig;
use fleetlink_core::{Config, RobotId};
use fleetlink_gateway::testing::MockFleet;
use fleetlink_gateway::{Gateway, GatewayState, ShutdownOutcome};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower::ServiceExt;

/// Configuration with two registered robots and fast retry timings.
pub fn fleet_config() -> Config {
    let mut config = Config::default();
    for id in ["r1", "r2"] {
        config.robots.push(RobotConfig {
            id: id.to_string(),
            endpoint: format!("ws://{}.fleet.local:7000", id),
            name: None,
        });
    }
    config.control.rpc_timeout_ms = 1000;
    config.control.stream_retry.initial_backoff_ms = 10;
    config.control.stream_retry.max_backoff_ms = 20;
    config.shutdown.deadline_secs = 5;
    config
}

pub fn robot(id: &str) -> RobotId {
    RobotId::new(id)
}

/// A gateway serving on ephemeral loopback ports against a mock fleet.
pub struct TestGateway {
    pub fleet: MockFleet,
    pub state: Arc<GatewayState>,
    pub api: Router,
    pub realtime_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<fleetlink_gateway::Result<ShutdownOutcome>>,
}

impl TestGateway {
    pub async fn spawn(config: Config) -> Self {
        let fleet = MockFleet::new();
        let gateway = Gateway::new(config, fleet.connector()).await;
        let state = gateway.state().clone();
        let api = gateway.api_router();

        let api_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let realtime_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let realtime_addr = realtime_listener.local_addr().unwrap();

        let (shutdown, signal) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            gateway
                .serve(api_listener, realtime_listener, async move {
                    let _ = signal.await;
                })
                .await
        });

        Self {
            fleet,
            state,
            api,
            realtime_addr,
            shutdown: Some(shutdown),
            task,
        }
    }

    /// Realtime URL, optionally carrying a `?token=` query.
    pub fn realtime_url(&self, token: Option<&str>) -> String {
        match token {
            Some(token) => format!("ws://{}/ws?token={}", self.realtime_addr, token),
            None => format!("ws://{}/ws", self.realtime_addr),
        }
    }

    /// Trigger shutdown and wait for the serve loop to return.
    pub async fn shutdown(mut self) -> ShutdownOutcome {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .expect("gateway stopped in time")
            .expect("serve task joined")
            .expect("serve returned an outcome")
    }
}

/// Issue one JSON request against an API router.
pub async fn call_api(
    app: &Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(json) => Body::from(json.to_string()),
            None => Body::empty(),
        })
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

/// `POST /api/direct-control/start`, returning the issued token.
pub async fn start_control(app: &Router, robot: &str, operator: &str) -> String {
    let (status, body) = call_api(
        app,
        "POST",
        "/api/direct-control/start",
        Some(serde_json::json!({
            "robotId": robot,
            "controllingDeviceId": operator,
            "controllingDeviceIp": "10.0.0.20",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "start failed: {}", body);
    body["data"]["directControlToken"]
        .as_str()
        .expect("token in start response")
        .to_string()
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
