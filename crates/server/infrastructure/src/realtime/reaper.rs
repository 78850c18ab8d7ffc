//! Idle session reaper.
//!
//! Sweeps the hub on a fixed tick and disconnects sessions that have been
//! silent past the inactivity threshold. The reaper works on a snapshot and
//! routes every close through the hub's unregister channel; it never touches
//! the indexes directly.

use crate::realtime::hub::Hub;
use courier_shared::ReaperConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct IdleReaperConfig {
    pub interval: Duration,
    pub inactivity_threshold: Duration,
}

impl Default for IdleReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            inactivity_threshold: Duration::from_secs(60),
        }
    }
}

impl From<&ReaperConfig> for IdleReaperConfig {
    fn from(config: &ReaperConfig) -> Self {
        Self {
            interval: config.interval,
            inactivity_threshold: config.inactivity_threshold,
        }
    }
}

/// Periodic sweep of inactive sessions.
pub struct IdleReaper {
    hub: Arc<Hub>,
    config: IdleReaperConfig,
}

impl IdleReaper {
    pub fn new(hub: Arc<Hub>, config: IdleReaperConfig) -> Self {
        Self { hub, config }
    }

    /// Runs until the shutdown signal flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(
            interval_secs = self.config.interval.as_secs(),
            threshold_secs = self.config.inactivity_threshold.as_secs(),
            "idle reaper started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("idle reaper stopped");
                        return;
                    }
                }
            }
        }
    }

    /// One pass over the current session snapshot.
    pub async fn sweep(&self) -> usize {
        let mut reaped = 0usize;
        for session in self.hub.snapshot() {
            if session.idle_for() >= self.config.inactivity_threshold {
                debug!(
                    session_id = %session.id(),
                    device_id = %session.device_id(),
                    idle_secs = session.idle_for().as_secs(),
                    "closing inactive session"
                );
                self.hub.unregister(session.id()).await;
                self.hub.metrics().record_session_reaped();
                reaped += 1;
            }
        }
        if reaped > 0 {
            info!(count = reaped, "reaped inactive sessions");
        }
        reaped
    }
}
