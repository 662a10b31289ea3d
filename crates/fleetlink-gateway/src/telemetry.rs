//! Telemetry publish/subscribe hub.
//!
//! One channel per [`TelemetryTable`]. Subscribers register a callback and get
//! a [`Subscription`] back; dropping it (or calling `unsubscribe`) removes the
//! callback.

use fleetlink_core::RobotId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// Telemetry table category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryTable {
    Status,
    Pose,
    Battery,
    Payload,
    /// Direct-control session lifecycle.
    Sessions,
}

impl TelemetryTable {
    /// Table name on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Pose => "pose",
            Self::Battery => "battery",
            Self::Payload => "payload",
            Self::Sessions => "sessions",
        }
    }

    /// Parse a table name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "status" => Some(Self::Status),
            "pose" => Some(Self::Pose),
            "battery" => Some(Self::Battery),
            "payload" => Some(Self::Payload),
            "sessions" => Some(Self::Sessions),
            _ => None,
        }
    }
}

impl fmt::Display for TelemetryTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single telemetry event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    pub table: TelemetryTable,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub robot_id: Option<RobotId>,
    pub payload: serde_json::Value,
    pub at: chrono::DateTime<chrono::Utc>,
}

impl TelemetryEvent {
    /// Create an event stamped with the current time.
    pub fn new(table: TelemetryTable, robot_id: Option<RobotId>, payload: serde_json::Value) -> Self {
        Self {
            table,
            robot_id,
            payload,
            at: chrono::Utc::now(),
        }
    }
}

type Callback = Arc<dyn Fn(&TelemetryEvent) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    tables: HashMap<TelemetryTable, Vec<(u64, Callback)>>,
}

/// Publish/subscribe hub for telemetry tables.
#[derive(Default)]
pub struct TelemetryHub {
    inner: Arc<Mutex<Subscribers>>,
}

impl TelemetryHub {
    /// Create a hub with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for events on `table`.
    pub fn subscribe<F>(&self, table: TelemetryTable, callback: F) -> Subscription
    where
        F: Fn(&TelemetryEvent) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner
            .tables
            .entry(table)
            .or_default()
            .push((id, Arc::new(callback)));

        Subscription {
            id,
            table,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver an event to every subscriber of its table. Returns the number
    /// of callbacks invoked.
    pub fn publish(&self, event: TelemetryEvent) -> usize {
        // Callbacks run outside the lock so they may subscribe or unsubscribe.
        let callbacks: Vec<Callback> = {
            let inner = self.inner.lock();
            inner
                .tables
                .get(&event.table)
                .map(|subs| subs.iter().map(|(_, cb)| cb.clone()).collect())
                .unwrap_or_default()
        };
        for callback in &callbacks {
            callback(&event);
        }
        callbacks.len()
    }

    /// Number of subscribers on a table.
    pub fn subscriber_count(&self, table: TelemetryTable) -> usize {
        self.inner
            .lock()
            .tables
            .get(&table)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

/// Handle to a registered callback.
pub struct Subscription {
    id: u64,
    table: TelemetryTable,
    hub: Weak<Mutex<Subscribers>>,
}

impl Subscription {
    /// Table this subscription listens to.
    pub fn table(&self) -> TelemetryTable {
        self.table
    }

    /// Remove the callback.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            let mut inner = hub.lock();
            if let Some(subs) = inner.tables.get_mut(&self.table) {
                subs.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("table", &self.table)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_publish_reaches_only_matching_table() {
        let hub = TelemetryHub::new();
        let pose_hits = Arc::new(AtomicUsize::new(0));
        let hits = pose_hits.clone();
        let _sub = hub.subscribe(TelemetryTable::Pose, move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        });

        let event = TelemetryEvent::new(TelemetryTable::Battery, None, serde_json::json!(0.8));
        assert_eq!(hub.publish(event), 0);

        let event = TelemetryEvent::new(
            TelemetryTable::Pose,
            Some(RobotId::new("r1")),
            serde_json::json!({"x": 1.0}),
        );
        assert_eq!(hub.publish(event), 1);
        assert_eq!(pose_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_and_drop_remove_callback() {
        let hub = TelemetryHub::new();
        let a = hub.subscribe(TelemetryTable::Status, |_| {});
        let b = hub.subscribe(TelemetryTable::Status, |_| {});
        assert_eq!(hub.subscriber_count(TelemetryTable::Status), 2);

        a.unsubscribe();
        assert_eq!(hub.subscriber_count(TelemetryTable::Status), 1);

        drop(b);
        assert_eq!(hub.subscriber_count(TelemetryTable::Status), 0);
    }

    #[test]
    fn test_subscription_outliving_hub_is_harmless() {
        let hub = TelemetryHub::new();
        let sub = hub.subscribe(TelemetryTable::Sessions, |_| {});
        drop(hub);
        drop(sub);
    }

    #[test]
    fn test_table_names() {
        assert_eq!(TelemetryTable::parse("sessions"), Some(TelemetryTable::Sessions));
        assert_eq!(TelemetryTable::parse("weather"), None);
        assert_eq!(TelemetryTable::Battery.to_string(), "battery");
    }
}
