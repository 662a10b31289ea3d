//! Realtime WebSocket listener end to end.

use axum::http::StatusCode;
use fleetlink_core::AxisCommand;
use fleetlink_gateway::ShutdownOutcome;
use fleetlink_integration_tests::{call_api, eventually, fleet_config, robot, start_control, TestGateway};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn next_message(ws: &mut Client) -> Message {
    tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("message in time")
        .expect("stream open")
        .expect("valid frame")
}

async fn next_json(ws: &mut Client) -> serde_json::Value {
    match next_message(ws).await {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected text frame, got {:?}", other),
    }
}

async fn send_json(ws: &mut Client, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

#[tokio::test]
async fn test_teleop_ack_then_stop_closes_socket() {
    let gw = TestGateway::spawn(fleet_config()).await;
    let token = start_control(&gw.api, "r1", "tablet-a").await;

    let (mut ws, _) = connect_async(gw.realtime_url(None)).await.unwrap();
    send_json(
        &mut ws,
        serde_json::json!({"type": "teleop", "robotId": "r1", "axes": [0.4, -2.0]}),
    )
    .await;
    let ack = next_json(&mut ws).await;
    assert_eq!(ack["type"], "ack");
    assert_eq!(ack["robotId"], "r1");

    let stream = gw.fleet.last_stream(&robot("r1")).unwrap();
    assert_eq!(stream.commands(), vec![AxisCommand::new(0.4, -1.0)]);

    let (status, _) = call_api(
        &gw.api,
        "POST",
        "/api/direct-control/stop",
        Some(serde_json::json!({"robotId": "r1", "controllingDeviceId": "tablet-a"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    match next_message(&mut ws).await {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::Normal);
            assert_eq!(frame.reason, "direct control ended");
        }
        other => panic!("expected close frame, got {:?}", other),
    }

    let (status, _) = call_api(
        &gw.api,
        "GET",
        &format!("/api/direct-control/session/{}", token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    assert!(matches!(gw.shutdown().await, ShutdownOutcome::Completed { .. }));
}

#[tokio::test]
async fn test_teleop_without_session_gets_error_frame() {
    let gw = TestGateway::spawn(fleet_config()).await;

    let (mut ws, _) = connect_async(gw.realtime_url(None)).await.unwrap();
    send_json(
        &mut ws,
        serde_json::json!({"type": "teleop", "robotId": "r2", "axes": [0.1, 0.1]}),
    )
    .await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "error");

    // The connection stays usable after an error.
    send_json(&mut ws, serde_json::json!({"type": "echo", "message": "still here"})).await;
    let echo = next_json(&mut ws).await;
    assert_eq!(echo["type"], "echo");
    assert_eq!(echo["message"], "still here");

    gw.shutdown().await;
}

#[tokio::test]
async fn test_subscribed_client_sees_session_events() {
    let gw = TestGateway::spawn(fleet_config()).await;

    let (mut ws, _) = connect_async(gw.realtime_url(None)).await.unwrap();
    send_json(&mut ws, serde_json::json!({"type": "subscribe", "tables": ["sessions"]})).await;
    let subscribed = next_json(&mut ws).await;
    assert_eq!(subscribed["type"], "subscribed");
    assert_eq!(subscribed["tables"], serde_json::json!(["sessions"]));

    start_control(&gw.api, "r2", "tablet-a").await;
    let event = next_json(&mut ws).await;
    assert_eq!(event["type"], "telemetry");
    assert_eq!(event["table"], "sessions");
    assert_eq!(event["robotId"], "r2");
    assert_eq!(event["payload"]["event"], "started");

    gw.shutdown().await;
}

#[tokio::test]
async fn test_realtime_requires_token_when_configured() {
    let mut config = fleet_config();
    config.gateway.auth_token = Some("fleet-secret".to_string());
    let gw = TestGateway::spawn(config).await;

    assert!(connect_async(gw.realtime_url(None)).await.is_err());
    assert!(connect_async(gw.realtime_url(Some("wrong"))).await.is_err());

    let (mut ws, _) = connect_async(gw.realtime_url(Some("fleet-secret")))
        .await
        .unwrap();
    send_json(&mut ws, serde_json::json!({"type": "echo", "message": 1})).await;
    assert_eq!(next_json(&mut ws).await["message"], 1);

    gw.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_ends_sessions_and_closes_clients() {
    let gw = TestGateway::spawn(fleet_config()).await;
    start_control(&gw.api, "r1", "tablet-a").await;
    start_control(&gw.api, "r2", "tablet-b").await;

    let (mut idle_client, _) = connect_async(gw.realtime_url(None)).await.unwrap();
    let state = gw.state.clone();
    assert!(eventually(|| async { state.connections.count().await == 1 }).await);

    let fleet = gw.fleet.clone();
    let outcome = gw.shutdown().await;
    assert_eq!(outcome, ShutdownOutcome::Completed { sessions_ended: 2 });
    assert_eq!(state.registry.count().await, 0);
    assert_eq!(fleet.stopped_tokens(&robot("r1")).len(), 1);
    assert_eq!(fleet.stopped_tokens(&robot("r2")).len(), 1);

    match next_message(&mut idle_client).await {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Away),
        other => panic!("expected close frame, got {:?}", other),
    }
}
