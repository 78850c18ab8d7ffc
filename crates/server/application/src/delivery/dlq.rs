//! Dead letter store.
//!
//! A bounded in-process map of retry tasks that exhausted their budget.
//! When capacity is reached the oldest entry (by insertion time) is
//! evicted; an optional retention TTL drops stale entries on a sweep.
//! Held tasks can be replayed one at a time or wholesale through the
//! orchestrator's delivery path.

use crate::delivery::orchestrator::DeliveryOrchestrator;
use chrono::{DateTime, Utc};
use courier_server_domain::deliveries::DeliveryAttempt;
use courier_server_domain::shared_kernel::{DeliveryId, DomainError, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};

/// A delivery that ran out of retries, frozen for inspection or manual
/// replay.
#[derive(Debug, Clone)]
pub struct DeadLetterTask {
    pub attempt: DeliveryAttempt,
    pub last_error: String,
    pub dead_since: DateTime<Utc>,
}

/// Bounded map of dead letter tasks keyed by delivery id.
pub struct DeadLetterQueue {
    inner: Mutex<HashMap<DeliveryId, DeadLetterTask>>,
    capacity: usize,
    retention: Option<Duration>,
}

impl DeadLetterQueue {
    pub fn new(capacity: usize, retention: Option<Duration>) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            capacity,
            retention: retention.filter(|d| !d.is_zero()),
        }
    }

    pub fn add(&self, attempt: DeliveryAttempt, last_error: impl Into<String>) {
        let mut tasks = self.inner.lock().unwrap();

        if self.capacity > 0 && tasks.len() >= self.capacity {
            if let Some(oldest) = tasks
                .values()
                .min_by_key(|t| t.dead_since)
                .map(|t| t.attempt.id)
            {
                tasks.remove(&oldest);
                warn!(delivery_id = %oldest, "dead letter queue full, evicting oldest entry");
            }
        }

        let id = attempt.id;
        tasks.insert(
            id,
            DeadLetterTask {
                attempt,
                last_error: last_error.into(),
                dead_since: Utc::now(),
            },
        );
        warn!(delivery_id = %id, "delivery moved to dead letter queue");
    }

    pub fn get(&self, id: &DeliveryId) -> Option<DeadLetterTask> {
        self.inner.lock().unwrap().get(id).cloned()
    }

    pub fn list(&self) -> Vec<DeadLetterTask> {
        let mut tasks: Vec<DeadLetterTask> = self.inner.lock().unwrap().values().cloned().collect();
        tasks.sort_by_key(|t| t.dead_since);
        tasks
    }

    pub fn remove(&self, id: &DeliveryId) -> Option<DeadLetterTask> {
        self.inner.lock().unwrap().remove(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Re-drives one dead-lettered delivery through its channel.
    ///
    /// The task is removed on success, and also when the row has since
    /// moved to an absorbing state (a late ack or the expiry sweep); a
    /// failed replay keeps it in the store for another attempt.
    pub async fn retry_one(
        &self,
        id: &DeliveryId,
        orchestrator: &DeliveryOrchestrator,
    ) -> Result<()> {
        let task = self
            .get(id)
            .ok_or(DomainError::DeliveryNotFound { delivery_id: *id })?;

        match orchestrator.retry_attempt(&task.attempt).await {
            Ok(()) => {
                self.remove(id);
                info!(delivery_id = %id, "dead letter replayed");
                Ok(())
            }
            Err(DomainError::InvalidStateTransition { from, .. }) => {
                self.remove(id);
                info!(delivery_id = %id, %from, "dead letter settled elsewhere, dropping");
                Ok(())
            }
            Err(err) => {
                warn!(delivery_id = %id, error = %err, "dead letter replay failed");
                Err(err)
            }
        }
    }

    /// Replays every held task, oldest first. Returns how many replays
    /// succeeded and how many failed (and stayed in the store).
    pub async fn retry_all(&self, orchestrator: &DeliveryOrchestrator) -> (usize, usize) {
        let mut succeeded = 0usize;
        let mut failed = 0usize;

        for task in self.list() {
            match self.retry_one(&task.attempt.id, orchestrator).await {
                Ok(()) => succeeded += 1,
                Err(_) => failed += 1,
            }
        }

        if succeeded + failed > 0 {
            info!(succeeded, failed, "dead letter replay pass finished");
        }
        (succeeded, failed)
    }

    /// Drops entries older than the retention TTL. No-op without one.
    pub fn sweep_expired(&self) -> usize {
        let Some(retention) = self.retention else {
            return 0;
        };
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::zero());

        let mut tasks = self.inner.lock().unwrap();
        let before = tasks.len();
        tasks.retain(|_, t| t.dead_since >= cutoff);
        let removed = before - tasks.len();
        if removed > 0 {
            info!(count = removed, "swept expired dead letter entries");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::orchestrator::SubmitNotification;
    use async_trait::async_trait;
    use courier_server_domain::deliveries::{
        DeliveryRepository, LivePush, PushAdapter, PushReceipt,
    };
    use courier_server_domain::devices::{Device, DeviceRepository};
    use courier_server_domain::notifications::Notification;
    use courier_server_domain::tokens::{ChannelToken, ChannelTokenRepository};
    use courier_server_infrastructure::persistence::in_memory::{
        InMemoryChannelTokenRepository, InMemoryDeliveryRepository, InMemoryDeviceRepository,
        InMemoryNotificationRepository,
    };
    use courier_shared::{ChannelKind, DeliveryStatus, DeviceId, NotificationId, UserId};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn attempt() -> DeliveryAttempt {
        DeliveryAttempt::new(NotificationId::new(), DeviceId::new(), ChannelKind::Fcm)
    }

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
        failures_left: AtomicU32,
    }

    impl FlakyAdapter {
        fn failing(failures: u32) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
            }
        }
    }

    #[async_trait]
    impl PushAdapter for FlakyAdapter {
        fn kind(&self) -> ChannelKind {
            ChannelKind::Fcm
        }

        async fn send(
            &self,
            _token: &str,
            _n: &Notification,
        ) -> courier_server_domain::shared_kernel::Result<PushReceipt> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(DomainError::TransientChannelFailure {
                    channel: ChannelKind::Fcm,
                    message: "upstream 503".to_string(),
                });
            }
            Ok(PushReceipt {
                message_id: "m-replay".to_string(),
                canonical_token: None,
            })
        }
    }

    struct Fixture {
        orchestrator: DeliveryOrchestrator,
        deliveries: Arc<InMemoryDeliveryRepository>,
        device_id: DeviceId,
    }

    /// Wiring with one FCM-only device; the adapter fails the first
    /// `failures` sends.
    async fn fixture(failures: u32) -> Fixture {
        let notifications = Arc::new(InMemoryNotificationRepository::new());
        let deliveries = Arc::new(InMemoryDeliveryRepository::new());
        let devices = Arc::new(InMemoryDeviceRepository::new());
        let tokens = Arc::new(InMemoryChannelTokenRepository::new());

        let mut device = Device::new("hw-dlq", None, None);
        device.link_to_user(UserId::from("77")).unwrap();
        devices.save(&device).await.unwrap();
        tokens
            .upsert(&ChannelToken::new(device.id, "tkB", ChannelKind::Fcm))
            .await
            .unwrap();

        let orchestrator = DeliveryOrchestrator::new(
            notifications,
            deliveries.clone(),
            devices,
            tokens,
            Arc::new(OfflineHub),
            vec![Arc::new(FlakyAdapter::failing(failures))],
        );

        Fixture {
            orchestrator,
            deliveries,
            device_id: device.id,
        }
    }

    /// Submits over FCM only and returns the failed tracking row.
    async fn failed_row(f: &Fixture) -> DeliveryAttempt {
        let mut request = SubmitNotification::to_user("77", "Hi", "there");
        request.channels = Some(vec![ChannelKind::Fcm]);
        let _ = f.orchestrator.submit(request).await;

        f.deliveries
            .find_by_device(&f.device_id)
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.channel == ChannelKind::Fcm && r.status == DeliveryStatus::Failed)
            .expect("failed fcm row")
    }

    #[test]
    fn test_add_get_remove() {
        let dlq = DeadLetterQueue::new(16, None);
        let a = attempt();
        let id = a.id;

        dlq.add(a, "provider unavailable");
        assert_eq!(dlq.len(), 1);

        let task = dlq.get(&id).unwrap();
        assert_eq!(task.last_error, "provider unavailable");

        assert!(dlq.remove(&id).is_some());
        assert!(dlq.is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let dlq = DeadLetterQueue::new(2, None);
        let first = attempt();
        let first_id = first.id;

        dlq.add(first, "e1");
        std::thread::sleep(std::time::Duration::from_millis(2));
        dlq.add(attempt(), "e2");
        std::thread::sleep(std::time::Duration::from_millis(2));
        dlq.add(attempt(), "e3");

        assert_eq!(dlq.len(), 2);
        assert!(dlq.get(&first_id).is_none(), "oldest entry must be evicted");
    }

    #[test]
    fn test_list_is_oldest_first() {
        let dlq = DeadLetterQueue::new(8, None);
        let first = attempt();
        let first_id = first.id;
        dlq.add(first, "e1");
        std::thread::sleep(std::time::Duration::from_millis(2));
        dlq.add(attempt(), "e2");

        let list = dlq.list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].attempt.id, first_id);
    }

    #[test]
    fn test_retention_sweep() {
        let dlq = DeadLetterQueue::new(8, Some(Duration::from_millis(10)));
        dlq.add(attempt(), "e1");
        std::thread::sleep(std::time::Duration::from_millis(25));
        dlq.add(attempt(), "e2");

        assert_eq!(dlq.sweep_expired(), 1);
        assert_eq!(dlq.len(), 1);
    }

    #[test]
    fn test_zero_retention_disables_sweep() {
        let dlq = DeadLetterQueue::new(8, Some(Duration::ZERO));
        dlq.add(attempt(), "e1");
        assert_eq!(dlq.sweep_expired(), 0);
        assert_eq!(dlq.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_one_replays_and_removes() {
        // The adapter fails once (the submission) and then recovers, so
        // the replay goes through.
        let f = fixture(1).await;
        let row = failed_row(&f).await;

        let dlq = DeadLetterQueue::new(8, None);
        dlq.add(row.clone(), "retry budget exhausted");

        dlq.retry_one(&row.id, &f.orchestrator).await.unwrap();

        assert!(dlq.is_empty());
        let replayed = f.deliveries.find_by_id(&row.id).await.unwrap().unwrap();
        assert_eq!(replayed.status, DeliveryStatus::Sent);
        assert_eq!(replayed.provider_message_id.as_deref(), Some("m-replay"));
    }

    #[tokio::test]
    async fn test_retry_one_failure_keeps_task() {
        let f = fixture(u32::MAX).await;
        let row = failed_row(&f).await;

        let dlq = DeadLetterQueue::new(8, None);
        dlq.add(row.clone(), "retry budget exhausted");

        let err = dlq.retry_one(&row.id, &f.orchestrator).await.unwrap_err();
        assert!(matches!(err, DomainError::TransientChannelFailure { .. }));

        // The task stays in the store and the row is failed again.
        assert_eq!(dlq.len(), 1);
        let current = f.deliveries.find_by_id(&row.id).await.unwrap().unwrap();
        assert_eq!(current.status, DeliveryStatus::Failed);
    }

    #[tokio::test]
    async fn test_retry_one_drops_settled_row() {
        // A late ack moved the row to DELIVERED; the replay is moot and
        // the task is dropped without error.
        let f = fixture(u32::MAX).await;
        let row = failed_row(&f).await;

        let dlq = DeadLetterQueue::new(8, None);
        dlq.add(row.clone(), "retry budget exhausted");

        f.orchestrator
            .acknowledge(row.notification_id, row.device_id)
            .await
            .unwrap();

        dlq.retry_one(&row.id, &f.orchestrator).await.unwrap();
        assert!(dlq.is_empty());
        let current = f.deliveries.find_by_id(&row.id).await.unwrap().unwrap();
        assert_eq!(current.status, DeliveryStatus::Delivered);
    }

    #[tokio::test]
    async fn test_retry_one_unknown_id() {
        let f = fixture(0).await;
        let err = DeadLetterQueue::new(8, None)
            .retry_one(&DeliveryId::new(), &f.orchestrator)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::DeliveryNotFound { .. }));
    }

    #[tokio::test]
    async fn test_retry_all_reports_counts() {
        // Two dead letters; the adapter fails exactly one more send, so
        // the oldest replay fails and the second succeeds.
        let f = fixture(3).await;
        let first = failed_row(&f).await;
        let second = failed_row(&f).await;

        let dlq = DeadLetterQueue::new(8, None);
        dlq.add(first.clone(), "retry budget exhausted");
        dlq.add(second.clone(), "retry budget exhausted");

        let (succeeded, failed) = dlq.retry_all(&f.orchestrator).await;
        assert_eq!((succeeded, failed), (1, 1));
        assert_eq!(dlq.len(), 1);
        assert!(dlq.get(&first.id).is_some(), "failed replay stays queued");

        let replayed = f.deliveries.find_by_id(&second.id).await.unwrap().unwrap();
        assert_eq!(replayed.status, DeliveryStatus::Sent);
    }
}
