//! Idle session reaper.

use crate::mux::CommandMux;
use crate::session::SessionRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Counts from one reaper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapStats {
    /// Sessions ended for inactivity.
    pub ended: usize,

    /// Robot shortcuts dropped because their session is gone.
    pub routes_dropped: usize,
}

/// Periodically ends idle sessions and reconciles multiplexer routes.
pub struct IdleReaper {
    registry: Arc<SessionRegistry>,
    mux: Arc<CommandMux>,
    max_idle: Duration,
    interval: Duration,
}

impl IdleReaper {
    /// Create a reaper.
    pub fn new(
        registry: Arc<SessionRegistry>,
        mux: Arc<CommandMux>,
        max_idle: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            mux,
            max_idle,
            interval,
        }
    }

    /// Run one pass.
    pub async fn tick(&self) -> ReapStats {
        let ended = self.registry.sweep_idle(self.max_idle).await;
        if ended > 0 {
            info!("Ended {} idle direct control session(s)", ended);
        }
        let routes_dropped = self.mux.reconcile().await;
        if routes_dropped > 0 {
            debug!("Dropped {} stale robot route(s)", routes_dropped);
        }
        ReapStats {
            ended,
            routes_dropped,
        }
    }

    /// Run passes every interval until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Idle reaper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                }
            }
        })
    }
}
