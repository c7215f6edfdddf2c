//! Liveness sweep over registered agent connections.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{ConnectionRegistry, DisconnectReason};
use crate::protocol::Envelope;

/// Periodically pings every connection and drops the ones that went silent.
#[derive(Clone)]
pub struct HeartbeatMonitor {
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    silence_limit: Duration,
}

/// Result of one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub pinged: usize,
    pub dropped: usize,
    pub expired_requests: usize,
}

impl HeartbeatMonitor {
    pub const fn new(
        registry: Arc<ConnectionRegistry>,
        interval: Duration,
        silence_limit: Duration,
    ) -> Self {
        Self {
            registry,
            interval,
            silence_limit,
        }
    }

    /// Run a single sweep.
    ///
    /// Connections silent for longer than the limit are removed with
    /// [`DisconnectReason::HeartbeatTimeout`]. The rest get a `heartbeat`
    /// frame and have their overdue pending requests expired.
    pub async fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let mut report = SweepReport::default();

        for conn in self.registry.connections().await {
            let silent = conn.silent_for(now).await;
            if silent > self.silence_limit {
                warn!(
                    user_id = %conn.user_id,
                    connection_id = %conn.connection_id,
                    silent_secs = silent.as_secs(),
                    "Agent connection missed heartbeats, dropping"
                );
                if self
                    .registry
                    .remove_connection(
                        &conn.user_id,
                        &conn.connection_id,
                        DisconnectReason::HeartbeatTimeout,
                    )
                    .await
                {
                    report.dropped += 1;
                }
                continue;
            }

            report.expired_requests += conn.expire_overdue(now).await;
            if conn.try_send(Envelope::heartbeat()) {
                report.pinged += 1;
            } else {
                debug!(
                    connection_id = %conn.connection_id,
                    "Outbound queue full, skipped heartbeat"
                );
            }
        }

        report
    }

    /// Spawn the sweep loop; it exits when `shutdown` changes.
    pub fn spawn(
        self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(self.interval);
            timer.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let report = self.sweep().await;
                        if report.dropped > 0 || report.expired_requests > 0 {
                            info!(
                                dropped = report.dropped,
                                expired_requests = report.expired_requests,
                                "Heartbeat sweep"
                            );
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("Heartbeat monitor shutting down");
                        return;
                    }
                }
            }
        })
    }
}
