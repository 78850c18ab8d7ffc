//! The retry scheduler.
//!
//! Polls for failed deliveries still inside their retry budget, re-runs the
//! channel send with capped exponential backoff, and moves exhausted rows
//! to the dead letter store. One retry task per row is in flight at a time;
//! errors drain into tracking rows and the DLQ, never upward.

use crate::delivery::dlq::DeadLetterQueue;
use crate::delivery::orchestrator::DeliveryOrchestrator;
use chrono::Utc;
use courier_server_domain::deliveries::{DeliveryAttempt, DeliveryRepository};
use courier_server_domain::queue::{QueueItem, QueueRepository};
use courier_server_domain::retry::RetryPolicy;
use courier_server_domain::shared_kernel::{DeliveryId, DomainError};
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Finished queue rows older than this are pruned.
const QUEUE_RETENTION_HOURS: i64 = 24;

#[derive(Debug, Clone)]
pub struct RetrySchedulerConfig {
    pub policy: RetryPolicy,
    /// How often the repository is polled for eligible rows.
    pub poll_interval: Duration,
    /// Maximum rows picked up per poll.
    pub batch_limit: i64,
}

impl Default for RetrySchedulerConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
            poll_interval: Duration::from_secs(60),
            batch_limit: 256,
        }
    }
}

struct SchedulerInner {
    orchestrator: Arc<DeliveryOrchestrator>,
    deliveries: Arc<dyn DeliveryRepository>,
    /// Persisted mirror of the retry backlog; survives restarts.
    queue: Arc<dyn QueueRepository>,
    dlq: Arc<DeadLetterQueue>,
    config: RetrySchedulerConfig,
    /// Rows with a live retry task; deduplicates poll pickups.
    in_flight: DashMap<DeliveryId, ()>,
    shutdown: watch::Receiver<bool>,
}

/// Background worker retrying failed deliveries.
#[derive(Clone)]
pub struct RetryScheduler {
    inner: Arc<SchedulerInner>,
}

impl RetryScheduler {
    pub fn new(
        orchestrator: Arc<DeliveryOrchestrator>,
        deliveries: Arc<dyn DeliveryRepository>,
        queue: Arc<dyn QueueRepository>,
        dlq: Arc<DeadLetterQueue>,
        config: RetrySchedulerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                orchestrator,
                deliveries,
                queue,
                dlq,
                config,
                in_flight: DashMap::new(),
                shutdown,
            }),
        }
    }

    /// Runs until shutdown. Dropped work stays in the store and is picked
    /// up again on the next start.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.inner.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut shutdown = self.inner.shutdown.clone();
        info!(
            poll_secs = self.inner.config.poll_interval.as_secs(),
            max_retries = self.inner.config.policy.max_retries,
            "retry scheduler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;
                    self.inner.dlq.sweep_expired();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("retry scheduler stopped");
                        return;
                    }
                }
            }
        }
    }

    /// One poll of the repository; returns how many retry tasks started.
    pub async fn poll_once(&self) -> usize {
        self.reconcile_queue().await;

        let eligible = match self
            .inner
            .deliveries
            .find_retryable(
                self.inner.config.policy.max_retries,
                self.inner.config.batch_limit,
            )
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "failed to poll retryable deliveries");
                return 0;
            }
        };

        let mut started = 0usize;
        for attempt in eligible {
            if self.inner.in_flight.contains_key(&attempt.id) {
                continue;
            }
            self.inner.in_flight.insert(attempt.id, ());
            started += 1;

            let item = self.persist_work_item(&attempt).await;
            let inner = self.inner.clone();
            tokio::spawn(async move {
                run_task(inner, attempt, item).await;
            });
        }

        if started > 0 {
            debug!(count = started, "started retry tasks");
        }
        started
    }

    /// Writes the persisted mirror of a retry task.
    async fn persist_work_item(&self, attempt: &DeliveryAttempt) -> Option<QueueItem> {
        let delay = self
            .inner
            .config
            .policy
            .raw_delay(attempt.retry_count.max(0) as u32);
        let item = QueueItem::new(
            attempt.id,
            json!({
                "notification_id": attempt.notification_id.to_string(),
                "device_id": attempt.device_id.to_string(),
                "channel": attempt.channel.as_str(),
            }),
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
        );
        match self.inner.queue.enqueue(&item).await {
            Ok(()) => Some(item),
            Err(err) => {
                warn!(delivery_id = %attempt.id, error = %err, "failed to persist retry item");
                None
            }
        }
    }

    /// Clears queue rows left over from a previous process life whose
    /// delivery moved on (acked, expired, exhausted) in the meantime, and
    /// prunes finished rows.
    async fn reconcile_queue(&self) {
        let due = match self
            .inner
            .queue
            .due(Utc::now(), self.inner.config.batch_limit)
            .await
        {
            Ok(items) => items,
            Err(err) => {
                warn!(error = %err, "failed to read due retry items");
                return;
            }
        };

        for mut item in due {
            if self.inner.in_flight.contains_key(&item.delivery_id) {
                continue;
            }
            let still_retryable = match self.inner.deliveries.find_by_id(&item.delivery_id).await {
                Ok(Some(row)) => row.should_retry(self.inner.config.policy.max_retries),
                Ok(None) => false,
                Err(_) => continue,
            };
            if !still_retryable {
                item.mark_done();
                if let Err(err) = self.inner.queue.update(&item).await {
                    warn!(delivery_id = %item.delivery_id, error = %err, "failed to settle stale retry item");
                }
            }
            // Rows that are still retryable are re-picked by the eligible
            // scan below; their fresh task writes a new work item.
        }

        let cutoff = Utc::now() - chrono::Duration::hours(QUEUE_RETENTION_HOURS);
        if let Err(err) = self.inner.queue.prune(cutoff).await {
            warn!(error = %err, "failed to prune retry queue");
        }
    }

    /// Number of rows with a live retry task; the shutdown path drains
    /// this within the grace window.
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.len()
    }
}

/// Drives one row through backoff until it sends, exhausts its budget, or
/// the scheduler shuts down.
async fn run_task(inner: Arc<SchedulerInner>, mut attempt: DeliveryAttempt, item: Option<QueueItem>) {
    let policy = inner.config.policy;
    let mut shutdown = inner.shutdown.clone();
    let mut item = item;

    loop {
        let delay = policy.delay_for(attempt.retry_count.max(0) as u32);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    // Aborted by shutdown: does not count as an attempt and
                    // the persisted item stays pending for the next start.
                    inner.in_flight.remove(&attempt.id);
                    return;
                }
            }
        }

        match inner.orchestrator.retry_attempt(&attempt).await {
            Ok(()) => {
                debug!(delivery_id = %attempt.id, "retry succeeded");
                settle_item(&inner, &mut item, false).await;
                inner.in_flight.remove(&attempt.id);
                return;
            }
            Err(DomainError::InvalidStateTransition { from, .. }) => {
                // A concurrent ack (or sweep) moved the row to an absorbing
                // state; nothing left to do.
                debug!(delivery_id = %attempt.id, %from, "retry dropped, row moved on");
                settle_item(&inner, &mut item, false).await;
                inner.in_flight.remove(&attempt.id);
                return;
            }
            Err(err) => {
                // Reload for the incremented retry_count.
                match inner.deliveries.find_by_id(&attempt.id).await {
                    Ok(Some(current)) => attempt = current,
                    Ok(None) => {
                        inner.in_flight.remove(&attempt.id);
                        return;
                    }
                    Err(load_err) => {
                        warn!(delivery_id = %attempt.id, error = %load_err, "failed to reload delivery");
                        inner.in_flight.remove(&attempt.id);
                        return;
                    }
                }

                if !attempt.should_retry(policy.max_retries) {
                    warn!(
                        delivery_id = %attempt.id,
                        retries = attempt.retry_count,
                        "retry budget exhausted, dead-lettering"
                    );
                    inner.dlq.add(attempt.clone(), err.to_string());
                    settle_item(&inner, &mut item, true).await;
                    inner.in_flight.remove(&attempt.id);
                    return;
                }

                reschedule_item(&inner, &mut item, policy.raw_delay(attempt.retry_count.max(0) as u32))
                    .await;
            }
        }
    }
}

/// Marks the persisted work item finished (done or dead).
async fn settle_item(inner: &SchedulerInner, item: &mut Option<QueueItem>, dead: bool) {
    if let Some(item) = item {
        if dead {
            item.mark_dead();
        } else {
            item.mark_done();
        }
        if let Err(err) = inner.queue.update(item).await {
            warn!(delivery_id = %item.delivery_id, error = %err, "failed to settle retry item");
        }
    }
}

/// Pushes the persisted work item's next attempt out by the backoff delay.
async fn reschedule_item(inner: &SchedulerInner, item: &mut Option<QueueItem>, delay: Duration) {
    if let Some(item) = item {
        item.reschedule(
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
        );
        if let Err(err) = inner.queue.update(item).await {
            warn!(delivery_id = %item.delivery_id, error = %err, "failed to reschedule retry item");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::orchestrator::{DeliveryOrchestrator, SubmitNotification};
    use async_trait::async_trait;
    use courier_server_domain::deliveries::{LivePush, PushAdapter, PushReceipt};
    use courier_server_domain::notifications::Notification;
    use courier_server_domain::shared_kernel::{
        ChannelKind, DeliveryStatus, DeviceId, Result, UserId,
    };
    use courier_server_domain::tokens::{ChannelToken, ChannelTokenRepository};
    use courier_server_domain::devices::{Device, DeviceRepository};
    use courier_server_infrastructure::persistence::in_memory::{
        InMemoryChannelTokenRepository, InMemoryDeliveryRepository, InMemoryDeviceRepository,
        InMemoryNotificationRepository, InMemoryQueueRepository,
    };
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Hub stand-in with no live sessions.
    struct OfflineHub;

    #[async_trait]
    impl LivePush for OfflineHub {
        fn is_device_connected(&self, _device_id: &DeviceId) -> bool {
            false
        }
        fn is_user_connected(&self, _user_id: &UserId) -> bool {
            false
        }
        async fn send_to_device(&self, _device_id: &DeviceId, _frame: String) -> bool {
            false
        }
    }

    /// Push adapter that fails a configurable number of times.
    struct FlakyAdapter {
        kind: ChannelKind,
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    impl FlakyAdapter {
        fn failing(kind: ChannelKind, failures: u32) -> Self {
            Self {
                kind,
                failures_left: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl PushAdapter for FlakyAdapter {
        fn kind(&self) -> ChannelKind {
            self.kind
        }

        async fn send(&self, _token: &str, _n: &Notification) -> Result<PushReceipt> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(DomainError::TransientChannelFailure {
                    channel: self.kind,
                    message: "upstream 503".to_string(),
                });
            }
            Ok(PushReceipt {
                message_id: "m-ok".to_string(),
                canonical_token: None,
            })
        }
    }

    struct Fixture {
        orchestrator: Arc<DeliveryOrchestrator>,
        deliveries: Arc<InMemoryDeliveryRepository>,
        device_id: DeviceId,
    }

    async fn fixture(adapter: Arc<FlakyAdapter>) -> Fixture {
        let notifications = Arc::new(InMemoryNotificationRepository::new());
        let deliveries = Arc::new(InMemoryDeliveryRepository::new());
        let devices = Arc::new(InMemoryDeviceRepository::new());
        let tokens = Arc::new(InMemoryChannelTokenRepository::new());

        let mut device = Device::new("hw-retry", None, None);
        device.link_to_user(UserId::from("77")).unwrap();
        devices.save(&device).await.unwrap();
        tokens
            .upsert(&ChannelToken::new(device.id, "tkB", ChannelKind::Fcm))
            .await
            .unwrap();

        let orchestrator = Arc::new(DeliveryOrchestrator::new(
            notifications,
            deliveries.clone(),
            devices,
            tokens,
            Arc::new(OfflineHub),
            vec![adapter],
        ));

        Fixture {
            orchestrator,
            deliveries,
            device_id: device.id,
        }
    }

    /// A submission restricted to the FCM channel, so exactly one
    /// tracking row enters the retry pool.
    fn fcm_submit() -> SubmitNotification {
        let mut request = SubmitNotification::to_user("77", "Hi", "there");
        request.channels = Some(vec![ChannelKind::Fcm]);
        request
    }

    fn fast_config(max_retries: u32) -> RetrySchedulerConfig {
        RetrySchedulerConfig {
            policy: RetryPolicy {
                max_retries,
                base_interval: Duration::from_millis(5),
                multiplier: 2.0,
                max_interval: Duration::from_millis(50),
                jitter: 0.0,
            },
            poll_interval: Duration::from_secs(60),
            batch_limit: 16,
        }
    }

    #[tokio::test]
    async fn test_retry_eventually_succeeds() {
        // First submission fails (adapter failure #1), then the retry
        // succeeds on its first re-attempt.
        let adapter = Arc::new(FlakyAdapter::failing(ChannelKind::Fcm, 1));
        let f = fixture(adapter.clone()).await;

        let err = f
            .orchestrator
            .submit(fcm_submit())
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::DeliveryFailedAllChannels { .. }));

        let (_, shutdown) = watch::channel(false);
        let scheduler = RetryScheduler::new(
            f.orchestrator.clone(),
            f.deliveries.clone(),
            Arc::new(InMemoryQueueRepository::new()),
            Arc::new(DeadLetterQueue::new(16, None)),
            fast_config(5),
            shutdown,
        );

        assert_eq!(scheduler.poll_once().await, 1);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let rows = f.deliveries.find_by_device(&f.device_id).await.unwrap();
        let fcm_row = rows.iter().find(|r| r.channel == ChannelKind::Fcm).unwrap();
        assert_eq!(fcm_row.status, DeliveryStatus::Sent);
        assert_eq!(fcm_row.provider_message_id.as_deref(), Some("m-ok"));
        assert_eq!(scheduler.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_exhaustion_moves_to_dlq() {
        let adapter = Arc::new(FlakyAdapter::failing(ChannelKind::Fcm, u32::MAX));
        let f = fixture(adapter).await;

        let _ = f
            .orchestrator
            .submit(fcm_submit())
            .await;

        let dlq = Arc::new(DeadLetterQueue::new(16, None));
        let (_, shutdown) = watch::channel(false);
        let scheduler = RetryScheduler::new(
            f.orchestrator.clone(),
            f.deliveries.clone(),
            Arc::new(InMemoryQueueRepository::new()),
            dlq.clone(),
            fast_config(2),
            shutdown,
        );

        assert_eq!(scheduler.poll_once().await, 1);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let rows = f.deliveries.find_by_device(&f.device_id).await.unwrap();
        let fcm_row = rows.iter().find(|r| r.channel == ChannelKind::Fcm).unwrap();
        // Two retries ran and failed; the third failure leaves the pool.
        assert_eq!(fcm_row.status, DeliveryStatus::Failed);
        assert_eq!(fcm_row.retry_count, 2);
        assert_eq!(dlq.len(), 1);
        assert_eq!(scheduler.in_flight_count(), 0);

        // Exhausted rows leave the retry pool.
        assert_eq!(scheduler.poll_once().await, 0);
    }

    #[tokio::test]
    async fn test_in_flight_dedup() {
        let adapter = Arc::new(FlakyAdapter::failing(ChannelKind::Fcm, u32::MAX));
        let f = fixture(adapter).await;
        let _ = f
            .orchestrator
            .submit(fcm_submit())
            .await;

        let (_, shutdown) = watch::channel(false);
        let scheduler = RetryScheduler::new(
            f.orchestrator.clone(),
            f.deliveries.clone(),
            Arc::new(InMemoryQueueRepository::new()),
            Arc::new(DeadLetterQueue::new(16, None)),
            RetrySchedulerConfig {
                policy: RetryPolicy {
                    max_retries: 5,
                    base_interval: Duration::from_secs(30),
                    multiplier: 2.0,
                    max_interval: Duration::from_secs(60),
                    jitter: 0.0,
                },
                ..fast_config(5)
            },
            shutdown,
        );

        assert_eq!(scheduler.poll_once().await, 1);
        // The row is still backing off; a second poll must not double it.
        assert_eq!(scheduler.poll_once().await, 0);
        assert_eq!(scheduler.in_flight_count(), 1);
    }

    #[tokio::test]
    async fn test_retry_backlog_is_persisted() {
        let adapter = Arc::new(FlakyAdapter::failing(ChannelKind::Fcm, u32::MAX));
        let f = fixture(adapter).await;
        let _ = f
            .orchestrator
            .submit(fcm_submit())
            .await;

        let queue = Arc::new(InMemoryQueueRepository::new());
        let (_, shutdown) = watch::channel(false);
        let scheduler = RetryScheduler::new(
            f.orchestrator.clone(),
            f.deliveries.clone(),
            queue.clone(),
            Arc::new(DeadLetterQueue::new(16, None)),
            RetrySchedulerConfig {
                policy: RetryPolicy {
                    max_retries: 5,
                    base_interval: Duration::from_secs(30),
                    multiplier: 2.0,
                    max_interval: Duration::from_secs(60),
                    jitter: 0.0,
                },
                ..fast_config(5)
            },
            shutdown,
        );

        assert_eq!(scheduler.poll_once().await, 1);

        // The backlog is mirrored into the persisted queue while the task
        // backs off in memory.
        let failed_row = f
            .deliveries
            .find_by_device(&f.device_id)
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.channel == ChannelKind::Fcm)
            .unwrap();
        let pending = queue
            .due(Utc::now() + chrono::Duration::days(1), 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].delivery_id, failed_row.id);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_without_counting() {
        let adapter = Arc::new(FlakyAdapter::failing(ChannelKind::Fcm, u32::MAX));
        let f = fixture(adapter.clone()).await;
        let _ = f
            .orchestrator
            .submit(fcm_submit())
            .await;
        let calls_after_submit = adapter.calls.load(Ordering::SeqCst);

        let (tx, shutdown) = watch::channel(false);
        let scheduler = RetryScheduler::new(
            f.orchestrator.clone(),
            f.deliveries.clone(),
            Arc::new(InMemoryQueueRepository::new()),
            Arc::new(DeadLetterQueue::new(16, None)),
            RetrySchedulerConfig {
                policy: RetryPolicy {
                    max_retries: 5,
                    base_interval: Duration::from_secs(30),
                    multiplier: 2.0,
                    max_interval: Duration::from_secs(60),
                    jitter: 0.0,
                },
                ..fast_config(5)
            },
            shutdown,
        );

        scheduler.poll_once().await;
        tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The in-flight task aborted while sleeping; no extra attempt ran.
        assert_eq!(adapter.calls.load(Ordering::SeqCst), calls_after_submit);
        assert_eq!(scheduler.in_flight_count(), 0);
    }
}
