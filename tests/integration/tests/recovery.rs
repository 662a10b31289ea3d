//! Command stream failures, recovery and reaping.

use fleetlink_core::{AxisCommand, Config, ControlToken};
use fleetlink_gateway::testing::MockFleet;
use fleetlink_gateway::{ConnectionHandle, Gateway, IdleReaper, ServerFrame, SessionState};
use fleetlink_integration_tests::{eventually, fleet_config, robot, start_control};
use std::time::Duration;

/// A stream error on a gateway configured with `max_attempts = 0` ends the
/// session without any operator Stop, and one reaper tick drops the route.
/// With the default retry budget the same holds once every reopen is refused;
/// see `test_default_retry_budget_exhaustion_ends_session`.
#[tokio::test]
async fn test_stream_error_without_retries_ends_session() {
    let mut config = fleet_config();
    config.control.stream_retry.max_attempts = 0;
    let fleet = MockFleet::new();
    let gateway = Gateway::new(config, fleet.connector()).await;
    let state = gateway.state().clone();
    let r1 = robot("r1");

    let token = ControlToken::new(start_control(&gateway.api_router(), "r1", "tablet-a").await);
    assert_eq!(state.mux.route_for(&r1).await, Some(token.clone()));

    fleet.last_stream(&r1).unwrap().fail("link dropped").await;
    let registry = state.registry.clone();
    assert!(eventually(|| async { !registry.has(&token).await }).await);

    // The robot was released even though the stream was lost.
    assert_eq!(fleet.stopped_tokens(&r1), vec![token.as_str().to_string()]);

    // The shortcut outlives the session until the reaper reconciles it.
    assert_eq!(state.mux.route_for(&r1).await, Some(token));
    let reaper = IdleReaper::new(
        state.registry.clone(),
        state.mux.clone(),
        Duration::from_secs(300),
        Duration::from_secs(30),
    );
    let stats = reaper.tick().await;
    assert_eq!(stats.ended, 0);
    assert_eq!(stats.routes_dropped, 1);
    assert_eq!(state.mux.route_for(&r1).await, None);

    let (conn, _rx) = ConnectionHandle::new(None);
    let frame = state
        .mux
        .deliver(&conn, &r1, &serde_json::json!([0.2, 0.2]))
        .await;
    assert!(matches!(frame, ServerFrame::Error { .. }));
}

#[tokio::test]
async fn test_stream_error_recovers_onto_new_stream() {
    let fleet = MockFleet::new();
    let gateway = Gateway::new(fleet_config(), fleet.connector()).await;
    let state = gateway.state().clone();
    let r1 = robot("r1");

    let token = ControlToken::new(start_control(&gateway.api_router(), "r1", "tablet-a").await);
    fleet.fail_next_stream_opens(1);
    fleet.last_stream(&r1).unwrap().fail("link dropped").await;

    let registry = state.registry.clone();
    let watched_fleet = fleet.clone();
    let watched_robot = r1.clone();
    let watched_token = token.clone();
    assert!(
        eventually(|| {
            let registry = registry.clone();
            let fleet = watched_fleet.clone();
            let robot = watched_robot.clone();
            let token = watched_token.clone();
            async move {
                fleet.streams_for(&robot).len() == 2
                    && registry.state(&token).await == Some(SessionState::Active)
            }
        })
        .await
    );

    // Same session, same token, commands now land on the reopened stream.
    let (conn, _rx) = ConnectionHandle::new(None);
    let frame = state
        .mux
        .deliver(&conn, &r1, &serde_json::json!([0.3, 0.0]))
        .await;
    assert_eq!(frame, ServerFrame::Ack { robot_id: r1.clone() });
    let streams = fleet.streams_for(&r1);
    assert_eq!(streams[1].token, token);
    assert_eq!(streams[1].commands(), vec![AxisCommand::new(0.3, 0.0)]);
    assert!(fleet.stopped_tokens(&r1).is_empty());
}

#[tokio::test]
async fn test_default_retry_budget_exhaustion_ends_session() {
    let config = fleet_config();
    let budget = Config::default().control.stream_retry.max_attempts;
    assert_eq!(config.control.stream_retry.max_attempts, budget);

    let fleet = MockFleet::new();
    let gateway = Gateway::new(config, fleet.connector()).await;
    let state = gateway.state().clone();
    let r1 = robot("r1");

    let token = ControlToken::new(start_control(&gateway.api_router(), "r1", "tablet-a").await);
    fleet.fail_next_stream_opens(budget);
    fleet.last_stream(&r1).unwrap().fail("link dropped").await;

    let registry = state.registry.clone();
    assert!(eventually(|| async { !registry.has(&token).await }).await);
    assert_eq!(fleet.streams_for(&r1).len(), 1);
    assert_eq!(fleet.stopped_tokens(&r1), vec![token.as_str().to_string()]);

    let reaper = IdleReaper::new(
        state.registry.clone(),
        state.mux.clone(),
        Duration::from_secs(300),
        Duration::from_secs(30),
    );
    assert_eq!(reaper.tick().await.routes_dropped, 1);
    assert_eq!(state.mux.route_for(&r1).await, None);
}

#[tokio::test]
async fn test_robot_ending_stream_ends_session() {
    let fleet = MockFleet::new();
    let gateway = Gateway::new(fleet_config(), fleet.connector()).await;
    let state = gateway.state().clone();
    let r2 = robot("r2");

    let token = ControlToken::new(start_control(&gateway.api_router(), "r2", "tablet-a").await);
    let (conn, mut rx) = ConnectionHandle::new(None);
    state
        .mux
        .deliver(&conn, &r2, &serde_json::json!([0.0, 0.0]))
        .await;

    fleet.last_stream(&r2).unwrap().end().await;
    let registry = state.registry.clone();
    assert!(eventually(|| async { !registry.has(&token).await }).await);
    assert!(matches!(
        rx.try_recv(),
        Ok(fleetlink_gateway::connection::Outbound::Close { code: 1000, .. })
    ));
}

#[tokio::test]
async fn test_reaper_ends_idle_sessions() {
    let fleet = MockFleet::new();
    let gateway = Gateway::new(fleet_config(), fleet.connector()).await;
    let state = gateway.state().clone();
    start_control(&gateway.api_router(), "r1", "tablet-a").await;

    let reaper = IdleReaper::new(
        state.registry.clone(),
        state.mux.clone(),
        Duration::from_millis(20),
        Duration::from_secs(30),
    );
    assert_eq!(reaper.tick().await.ended, 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let stats = reaper.tick().await;
    assert_eq!(stats.ended, 1);
    assert_eq!(stats.routes_dropped, 1);
    assert_eq!(state.registry.count().await, 0);
    assert_eq!(fleet.stopped_tokens(&robot("r1")).len(), 1);
}
