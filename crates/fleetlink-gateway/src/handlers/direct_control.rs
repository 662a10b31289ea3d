//! Direct-control HTTP endpoints.

use super::{json_body, required, ApiResponse};
use crate::control::StartRequest;
use crate::error::GatewayError;
use crate::server::GatewayState;
use crate::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::Json;
use fleetlink_core::{ControlToken, OperatorId, RobotId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Body of `POST /api/direct-control/start`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartBody {
    pub robot_id: Option<String>,
    pub controlling_device_id: Option<String>,
    pub controlling_device_ip: Option<String>,
}

/// Body of `POST /api/direct-control/stop`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopBody {
    pub robot_id: Option<String>,
    pub controlling_device_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartData {
    pub direct_control_token: ControlToken,
    pub robot_id: RobotId,
    pub controlling_device_id: OperatorId,
    pub overtaken: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopData {
    pub direct_control_token: ControlToken,
    pub robot_id: RobotId,
    pub stopped: bool,
    pub response: Option<serde_json::Value>,
}

/// Start direct control of a robot.
pub async fn start(
    State(state): State<Arc<GatewayState>>,
    body: std::result::Result<Json<StartBody>, JsonRejection>,
) -> Result<Json<ApiResponse<StartData>>> {
    let body = json_body(body)?;
    let robot_id = required(body.robot_id, "robotId")?;
    let operator_id = required(body.controlling_device_id, "controllingDeviceId")?;
    let operator_address = required(body.controlling_device_ip, "controllingDeviceIp")?;

    let started = state
        .control
        .start(StartRequest {
            robot_id: RobotId::new(robot_id),
            operator_id: OperatorId::new(operator_id),
            operator_address,
        })
        .await?;

    Ok(ApiResponse::ok(
        "Direct control started",
        StartData {
            direct_control_token: started.token,
            robot_id: started.robot_id,
            controlling_device_id: started.operator_id,
            overtaken: started.overtaken,
        },
    ))
}

/// Stop direct control of a robot.
pub async fn stop(
    State(state): State<Arc<GatewayState>>,
    body: std::result::Result<Json<StopBody>, JsonRejection>,
) -> Result<Json<ApiResponse<StopData>>> {
    let body = json_body(body)?;
    let robot_id = RobotId::new(required(body.robot_id, "robotId")?);
    let operator = body
        .controlling_device_id
        .filter(|id| !id.trim().is_empty())
        .map(OperatorId::new);

    let outcome = state.control.stop(&robot_id, operator.as_ref()).await?;
    let message = if outcome.stopped {
        "Direct control stopped"
    } else {
        "No active direct control session"
    };

    Ok(ApiResponse::ok(
        message,
        StopData {
            direct_control_token: outcome.token,
            robot_id,
            stopped: outcome.stopped,
            response: outcome.response,
        },
    ))
}

/// Status of one session.
pub async fn session(
    State(state): State<Arc<GatewayState>>,
    Path(token): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let token = ControlToken::new(token);
    let snapshot = state
        .registry
        .get(&token)
        .await
        .ok_or_else(|| GatewayError::NotFound(format!("session {}", token.redacted())))?;

    Ok(Json(serde_json::json!({
        "success": true,
        "session": snapshot,
    })))
}

/// Every session.
pub async fn sessions(State(state): State<Arc<GatewayState>>) -> Json<serde_json::Value> {
    let sessions = state.registry.all().await;
    Json(serde_json::json!({
        "success": true,
        "count": sessions.len(),
        "sessions": sessions,
    }))
}

#[cfg(test)]
mod tests {
    use crate::server::Gateway;
    use crate::testing::MockFleet;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use fleetlink_core::config::RobotConfig;
    use fleetlink_core::Config;
    use tower::ServiceExt;

    async fn app() -> (MockFleet, Router) {
        let fleet = MockFleet::new();
        let mut config = Config::default();
        config.robots.push(RobotConfig {
            id: "r1".into(),
            endpoint: "ws://r1.local:9000".into(),
            name: None,
        });
        let gateway = Gateway::new(config, fleet.connector()).await;
        (fleet, gateway.api_router())
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
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
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_start_missing_field_is_400() {
        let (_fleet, app) = app().await;
        let (status, body) = call(
            &app,
            "POST",
            "/api/direct-control/start",
            Some(serde_json::json!({"robotId": "r1", "controllingDeviceId": "web"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("controllingDeviceIp"));
    }

    #[tokio::test]
    async fn test_start_malformed_json_is_400() {
        let (_fleet, app) = app().await;
        let request = Request::builder()
            .method("POST")
            .uri("/api/direct-control/start")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_start_unknown_robot_is_404() {
        let (_fleet, app) = app().await;
        let (status, _) = call(
            &app,
            "POST",
            "/api/direct-control/start",
            Some(serde_json::json!({
                "robotId": "ghost",
                "controllingDeviceId": "web",
                "controllingDeviceIp": "10.0.0.2"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_start_rpc_failure_is_500() {
        let (fleet, app) = app().await;
        fleet.fail_start(true);
        let (status, body) = call(
            &app,
            "POST",
            "/api/direct-control/start",
            Some(serde_json::json!({
                "robotId": "r1",
                "controllingDeviceId": "web",
                "controllingDeviceIp": "10.0.0.2"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("refused"));

        let (_, sessions) = call(&app, "GET", "/api/direct-control/sessions", None).await;
        assert_eq!(sessions["count"], 0);
    }

    #[tokio::test]
    async fn test_start_then_session_lookup() {
        let (_fleet, app) = app().await;
        let (status, body) = call(
            &app,
            "POST",
            "/api/direct-control/start",
            Some(serde_json::json!({
                "robotId": "r1",
                "controllingDeviceId": "web",
                "controllingDeviceIp": "10.0.0.2"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let token = body["data"]["directControlToken"].as_str().unwrap().to_string();

        let (status, body) = call(&app, "GET", &format!("/api/direct-control/session/{}", token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["session"]["robotId"], "r1");
        assert_eq!(body["session"]["operatorId"], "web");
        assert_eq!(body["session"]["connections"], 0);

        let (status, _) = call(&app, "GET", "/api/direct-control/session/unknown", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stop_requires_robot_id() {
        let (_fleet, app) = app().await;
        let (status, _) = call(
            &app,
            "POST",
            "/api/direct-control/stop",
            Some(serde_json::json!({"controllingDeviceId": "web"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stop_without_session_is_ok() {
        let (_fleet, app) = app().await;
        let (status, body) = call(
            &app,
            "POST",
            "/api/direct-control/stop",
            Some(serde_json::json!({"robotId": "r1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["directControlToken"], "");
        assert_eq!(body["data"]["stopped"], false);
    }
}
