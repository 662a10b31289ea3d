//! Shutdown coordination.

use crate::connection::{ConnectionTracker, CLOSE_GOING_AWAY};
use crate::session::SessionRegistry;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// How shutdown went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every step finished before the deadline.
    Completed { sessions_ended: usize },

    /// The deadline passed with cleanup still outstanding.
    DeadlineExceeded,
}

/// Cancellation handles for the gateway's background parts.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignals {
    /// Stops the idle reaper.
    pub reaper: CancellationToken,

    /// Stops the realtime listener.
    pub realtime: CancellationToken,

    /// Stops the HTTP API listener.
    pub api: CancellationToken,
}

/// Ends every session, then closes the listeners, within a hard deadline.
pub struct ShutdownCoordinator {
    registry: Arc<SessionRegistry>,
    connections: Arc<ConnectionTracker>,
    signals: ShutdownSignals,
    deadline: Duration,
}

impl ShutdownCoordinator {
    /// Create a coordinator.
    pub fn new(
        registry: Arc<SessionRegistry>,
        connections: Arc<ConnectionTracker>,
        signals: ShutdownSignals,
        deadline: Duration,
    ) -> Self {
        Self {
            registry,
            connections,
            signals,
            deadline,
        }
    }

    /// Run the shutdown sequence.
    pub async fn run(&self) -> ShutdownOutcome {
        info!("Shutting down gateway (deadline {:?})", self.deadline);
        match tokio::time::timeout(self.deadline, self.drain()).await {
            Ok(sessions_ended) => {
                info!("Shutdown complete, {} session(s) ended", sessions_ended);
                ShutdownOutcome::Completed { sessions_ended }
            }
            Err(_) => {
                error!("Shutdown deadline of {:?} exceeded", self.deadline);
                self.release_listeners();
                ShutdownOutcome::DeadlineExceeded
            }
        }
    }

    async fn drain(&self) -> usize {
        self.signals.reaper.cancel();

        let tokens = self.registry.all_tokens().await;
        let ended = join_all(tokens.iter().map(|token| self.registry.end(token, true)))
            .await
            .into_iter()
            .filter(|ended| *ended)
            .count();

        self.signals.realtime.cancel();
        self.connections
            .close_all(CLOSE_GOING_AWAY, "server shutting down")
            .await;
        self.signals.api.cancel();
        ended
    }

    fn release_listeners(&self) {
        self.signals.reaper.cancel();
        self.signals.realtime.cancel();
        self.signals.api.cancel();
    }
}
