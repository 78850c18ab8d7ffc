//! Notification expiry sweep.
//!
//! Submissions with a past `expires_at` are accepted; this sweep is what
//! moves their outstanding delivery rows to EXPIRED. DELIVERED rows are
//! untouched (absorbing).

use chrono::Utc;
use courier_server_domain::deliveries::DeliveryRepository;
use courier_server_domain::notifications::NotificationRepository;
use courier_server_domain::shared_kernel::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

const SWEEP_BATCH: i64 = 256;

/// Periodically expires delivery rows of expired notifications.
pub struct ExpirySweep {
    notifications: Arc<dyn NotificationRepository>,
    deliveries: Arc<dyn DeliveryRepository>,
    interval: Duration,
}

impl ExpirySweep {
    pub fn new(
        notifications: Arc<dyn NotificationRepository>,
        deliveries: Arc<dyn DeliveryRepository>,
        interval: Duration,
    ) -> Self {
        Self {
            notifications,
            deliveries,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval_secs = self.interval.as_secs(), "expiry sweep started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep_once().await {
                        warn!(error = %err, "expiry sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("expiry sweep stopped");
                        return;
                    }
                }
            }
        }
    }

    /// One pass; returns how many rows were expired.
    pub async fn sweep_once(&self) -> Result<u64> {
        let expired = self
            .notifications
            .find_expired(Utc::now(), SWEEP_BATCH)
            .await?;

        let mut total = 0u64;
        for notification in expired {
            total += self
                .deliveries
                .expire_for_notification(&notification.id)
                .await?;
        }

        if total > 0 {
            info!(rows = total, "expired outstanding delivery rows");
        }
        Ok(total)
    }
}
