//! Health and robot listing endpoints.

use crate::server::GatewayState;
use axum::extract::State;
use axum::Json;
use fleetlink_core::RobotId;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

/// Health check response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Overall status.
    pub status: &'static str,

    /// Gateway version.
    pub version: &'static str,

    /// Uptime in seconds.
    pub uptime_seconds: u64,

    /// Registered sessions.
    pub sessions: usize,

    /// Open realtime connections.
    pub connections: usize,

    /// Registered robots.
    pub robots: usize,
}

/// `GET /health`.
pub async fn health(State(state): State<Arc<GatewayState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.uptime().as_secs(),
        sessions: state.registry.count().await,
        connections: state.connections.count().await,
        robots: state.directory.robots().await.len(),
    })
}

/// A robot as listed by `GET /api/robots`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RobotSummary {
    pub id: RobotId,
    pub name: Option<String>,
    pub endpoint: String,
    pub under_control: bool,
}

/// `GET /api/robots`.
pub async fn robots(State(state): State<Arc<GatewayState>>) -> Json<serde_json::Value> {
    let controlled: HashSet<RobotId> = state
        .registry
        .all()
        .await
        .into_iter()
        .map(|s| s.robot_id)
        .collect();

    let robots: Vec<RobotSummary> = state
        .directory
        .robots()
        .await
        .into_iter()
        .map(|entry| RobotSummary {
            under_control: controlled.contains(&entry.id),
            id: entry.id,
            name: entry.name,
            endpoint: entry.endpoint,
        })
        .collect();

    Json(serde_json::json!({
        "success": true,
        "count": robots.len(),
        "robots": robots,
    }))
}
