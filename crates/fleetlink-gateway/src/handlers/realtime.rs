//! Realtime client messages.
//!
//! Inbound frames are JSON objects with a `type` field:
//!
//! - `teleop`: `{robotId, axes: [throttle, steering]}`, routed through the
//!   command multiplexer and answered with `ack` or `error`.
//! - `echo`: `{message}`, answered with an `echo` frame.
//! - `subscribe`: `{tables: [...]}`, starts forwarding telemetry frames.
//!
//! Any other type is echoed back verbatim.

use crate::connection::{ConnectionHandle, ServerFrame};
use crate::server::GatewayState;
use crate::telemetry::{Subscription, TelemetryTable};
use fleetlink_core::RobotId;
use tracing::debug;

/// Handle one text frame from a realtime client.
pub async fn handle_client_message(
    state: &GatewayState,
    conn: &ConnectionHandle,
    text: &str,
    subscriptions: &mut Vec<Subscription>,
) {
    let message: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            debug!("Unparsable message on {}: {}", conn.id(), e);
            conn.send(ServerFrame::error("Invalid JSON message"));
            return;
        }
    };

    match message.get("type").and_then(|t| t.as_str()) {
        Some("teleop") => {
            let Some(robot) = message.get("robotId").and_then(|r| r.as_str()) else {
                conn.send(ServerFrame::error("teleop message requires robotId"));
                return;
            };
            let axes = message.get("axes").cloned().unwrap_or_default();
            let frame = state.mux.deliver(conn, &RobotId::new(robot), &axes).await;
            conn.send(frame);
        }
        Some("echo") => {
            conn.send(ServerFrame::Echo {
                message: message.get("message").cloned().unwrap_or_default(),
            });
        }
        Some("subscribe") => subscribe(state, conn, &message, subscriptions),
        _ => {
            conn.send_raw(text);
        }
    }
}

fn subscribe(
    state: &GatewayState,
    conn: &ConnectionHandle,
    message: &serde_json::Value,
    subscriptions: &mut Vec<Subscription>,
) {
    let names: Vec<&str> = message
        .get("tables")
        .and_then(|t| t.as_array())
        .map(|tables| tables.iter().filter_map(|t| t.as_str()).collect())
        .unwrap_or_default();
    if names.is_empty() {
        conn.send(ServerFrame::error("subscribe message requires tables"));
        return;
    }

    let mut tables = Vec::with_capacity(names.len());
    for name in names {
        match TelemetryTable::parse(name) {
            Some(table) => tables.push(table),
            None => {
                conn.send(ServerFrame::error(format!("Unknown telemetry table: {}", name)));
                return;
            }
        }
    }

    for table in &tables {
        if subscriptions.iter().any(|s| s.table() == *table) {
            continue;
        }
        let target = conn.clone();
        subscriptions.push(state.telemetry.subscribe(*table, move |event| {
            target.send(ServerFrame::Telemetry {
                table: event.table.to_string(),
                robot_id: event.robot_id.clone(),
                payload: event.payload.clone(),
            });
        }));
    }

    conn.send(ServerFrame::Subscribed {
        tables: tables.iter().map(|t| t.to_string()).collect(),
    });
}
