//! Direct-control lifecycle through the HTTP API and the command multiplexer.

use axum::http::StatusCode;
use fleetlink_core::{AxisCommand, ControlToken, OperatorId};
use fleetlink_gateway::connection::{Outbound, CLOSE_NORMAL};
use fleetlink_gateway::testing::MockFleet;
use fleetlink_gateway::{ConnectionHandle, Gateway, ServerFrame, StartRequest};
use fleetlink_integration_tests::{call_api, fleet_config, robot, start_control};

#[tokio::test]
async fn test_overtake_closes_previous_operator() {
    let fleet = MockFleet::new();
    let gateway = Gateway::new(fleet_config(), fleet.connector()).await;
    let state = gateway.state().clone();
    let app = gateway.api_router();
    let r1 = robot("r1");

    let first = start_control(&app, "r1", "tablet-a").await;
    let (conn, mut rx) = ConnectionHandle::new(None);
    let frame = state
        .mux
        .deliver(&conn, &r1, &serde_json::json!([0.5, 0.0]))
        .await;
    assert_eq!(frame, ServerFrame::Ack { robot_id: r1.clone() });

    let (status, body) = call_api(
        &app,
        "POST",
        "/api/direct-control/start",
        Some(serde_json::json!({
            "robotId": "r1",
            "controllingDeviceId": "tablet-b",
            "controllingDeviceIp": "10.0.0.21",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["overtaken"], 1);
    let second = body["data"]["directControlToken"].as_str().unwrap().to_string();
    assert_ne!(first, second);

    // The first operator's realtime connection was told the session ended.
    assert_eq!(
        rx.try_recv().unwrap(),
        Outbound::Close {
            code: CLOSE_NORMAL,
            reason: "direct control ended".to_string(),
        }
    );

    assert!(!state.registry.has(&ControlToken::new(first.clone())).await);
    assert_eq!(fleet.stopped_tokens(&r1), vec![first.clone()]);

    let streams = fleet.streams_for(&r1);
    assert_eq!(streams.len(), 2);
    assert!(streams[0].is_closed());
    assert!(!streams[1].is_closed());

    // Only the successor session controls the robot.
    let live = state.registry.find_by_robot(&r1).await;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].token.as_str(), second);
    assert_eq!(live[0].operator_id, OperatorId::new("tablet-b"));

    // The previous session released the robot before the new one took it.
    assert_eq!(fleet.modes_for(&r1), vec!["teleop", "auto", "teleop"]);

    let (conn_b, _rx_b) = ConnectionHandle::new(None);
    state
        .mux
        .deliver(&conn_b, &r1, &serde_json::json!([0.0, -0.5]))
        .await;
    assert_eq!(streams[1].commands(), vec![AxisCommand::new(0.0, -0.5)]);
    assert_eq!(streams[0].commands(), vec![AxisCommand::new(0.5, 0.0)]);
}

#[tokio::test]
async fn test_concurrent_starts_leave_one_session() {
    let fleet = MockFleet::new();
    let gateway = Gateway::new(fleet_config(), fleet.connector()).await;
    let state = gateway.state().clone();

    let request = |operator: &str| StartRequest {
        robot_id: robot("r1"),
        operator_id: OperatorId::new(operator),
        operator_address: "10.0.0.30".to_string(),
    };
    let (a, b) = tokio::join!(
        state.control.start(request("tablet-a")),
        state.control.start(request("tablet-b")),
    );
    assert!(a.is_ok() || b.is_ok());

    let live = state.registry.find_by_robot(&robot("r1")).await;
    assert_eq!(live.len(), 1);
    assert_eq!(state.registry.count().await, 1);

    // Every stream except the live session's is closed.
    let open: Vec<_> = fleet
        .streams_for(&robot("r1"))
        .into_iter()
        .filter(|s| !s.is_closed())
        .collect();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].token, live[0].token);
}

#[tokio::test]
async fn test_stop_then_lookup_is_not_found() {
    let fleet = MockFleet::new();
    let gateway = Gateway::new(fleet_config(), fleet.connector()).await;
    let app = gateway.api_router();

    let token = start_control(&app, "r1", "tablet-a").await;
    let (status, body) = call_api(
        &app,
        "POST",
        "/api/direct-control/stop",
        Some(serde_json::json!({"robotId": "r1", "controllingDeviceId": "tablet-a"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["stopped"], true);
    assert_eq!(body["data"]["directControlToken"], token.as_str());
    assert_eq!(body["data"]["response"]["stopped"], true);

    let (status, _) = call_api(
        &app,
        "GET",
        &format!("/api/direct-control/session/{}", token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Stop sets the robot back to autonomous operation.
    assert_eq!(fleet.modes_for(&robot("r1")), vec!["teleop", "auto"]);

    // A second stop finds nothing and does not call the robot again.
    let (status, body) = call_api(
        &app,
        "POST",
        "/api/direct-control/stop",
        Some(serde_json::json!({"robotId": "r1"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["stopped"], false);
    assert_eq!(fleet.stopped_tokens(&robot("r1")).len(), 1);
}

#[tokio::test]
async fn test_end_is_idempotent() {
    let fleet = MockFleet::new();
    let gateway = Gateway::new(fleet_config(), fleet.connector()).await;
    let state = gateway.state().clone();
    let token = ControlToken::new(start_control(&gateway.api_router(), "r2", "tablet-a").await);

    let (first, second) = tokio::join!(
        state.registry.end(&token, true),
        state.registry.end(&token, true),
    );
    assert!(first ^ second);
    assert!(!state.registry.end(&token, true).await);
    assert_eq!(fleet.stopped_tokens(&robot("r2")).len(), 1);
}

#[tokio::test]
async fn test_command_without_session_is_rejected() {
    let fleet = MockFleet::new();
    let gateway = Gateway::new(fleet_config(), fleet.connector()).await;
    let state = gateway.state().clone();

    let (conn, _rx) = ConnectionHandle::new(None);
    let frame = state
        .mux
        .deliver(&conn, &robot("r1"), &serde_json::json!([1.0, 1.0]))
        .await;
    assert!(matches!(frame, ServerFrame::Error { .. }));
    assert!(fleet.streams_for(&robot("r1")).is_empty());
}

#[tokio::test]
async fn test_robot_listing_marks_controlled_robots() {
    let fleet = MockFleet::new();
    let gateway = Gateway::new(fleet_config(), fleet.connector()).await;
    let app = gateway.api_router();
    start_control(&app, "r2", "tablet-a").await;

    let (status, body) = call_api(&app, "GET", "/api/robots", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);
    assert_eq!(body["robots"][0]["id"], "r1");
    assert_eq!(body["robots"][0]["underControl"], false);
    assert_eq!(body["robots"][1]["underControl"], true);
}
