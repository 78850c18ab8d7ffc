//! Delivery attempts: the durable record of one delivery on one channel for
//! one (notification, device) pair, plus the ports the delivery engine
//! speaks through.

use crate::notifications::Notification;
use crate::shared_kernel::{
    ChannelKind, DeliveryId, DeliveryStatus, DeviceId, DomainError, NotificationId, Result, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One delivery attempt, tracked from creation to a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: DeliveryId,
    pub notification_id: NotificationId,
    pub device_id: DeviceId,
    pub channel: ChannelKind,
    pub status: DeliveryStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub error_message: Option<String>,
    /// Provider-assigned message id, when the channel returns one.
    pub provider_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryAttempt {
    pub fn new(notification_id: NotificationId, device_id: DeviceId, channel: ChannelKind) -> Self {
        let now = Utc::now();
        Self {
            id: DeliveryId::new(),
            notification_id,
            device_id,
            channel,
            status: DeliveryStatus::Pending,
            sent_at: None,
            delivered_at: None,
            failed_at: None,
            retry_count: 0,
            error_message: None,
            provider_message_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn transition(&mut self, to: DeliveryStatus) -> Result<()> {
        if !self.status.can_transition_to(&to) {
            return Err(DomainError::InvalidStateTransition {
                delivery_id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_sent(&mut self, provider_message_id: Option<String>) -> Result<()> {
        self.transition(DeliveryStatus::Sent)?;
        self.sent_at = Some(self.updated_at);
        if provider_message_id.is_some() {
            self.provider_message_id = provider_message_id;
        }
        Ok(())
    }

    pub fn mark_delivered(&mut self) -> Result<()> {
        self.transition(DeliveryStatus::Delivered)?;
        self.delivered_at = Some(self.updated_at);
        Ok(())
    }

    /// Records a failure. The retry budget is charged by [`begin_retry`],
    /// not here, so `retry_count` counts retries rather than failures.
    ///
    /// [`begin_retry`]: DeliveryAttempt::begin_retry
    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(DeliveryStatus::Failed)?;
        self.failed_at = Some(self.updated_at);
        self.error_message = Some(error.into());
        Ok(())
    }

    pub fn mark_expired(&mut self) -> Result<()> {
        self.transition(DeliveryStatus::Expired)
    }

    /// Puts a failed attempt back into the pool for another try and counts
    /// the retry.
    pub fn begin_retry(&mut self) -> Result<()> {
        self.transition(DeliveryStatus::Pending)?;
        self.retry_count += 1;
        Ok(())
    }

    pub fn should_retry(&self, max_retries: u32) -> bool {
        self.status == DeliveryStatus::Failed && (self.retry_count as u32) < max_retries
    }
}

/// Persistence port for delivery attempts.
///
/// Every mutating operation is a single conditional statement so that state
/// transitions stay linearizable at the row level.
#[async_trait]
pub trait DeliveryRepository: Send + Sync {
    async fn create(&self, attempt: &DeliveryAttempt) -> Result<()>;

    async fn find_by_id(&self, id: &DeliveryId) -> Result<Option<DeliveryAttempt>>;

    async fn find_by_notification(
        &self,
        notification_id: &NotificationId,
    ) -> Result<Vec<DeliveryAttempt>>;

    async fn find_by_device(&self, device_id: &DeviceId) -> Result<Vec<DeliveryAttempt>>;

    /// Most recent attempt for (notification, device), any channel. The ack
    /// path resolves its target through this.
    async fn find_for_ack(
        &self,
        notification_id: &NotificationId,
        device_id: &DeviceId,
    ) -> Result<Option<DeliveryAttempt>>;

    /// Failed attempts still inside their retry budget.
    async fn find_retryable(&self, max_retries: u32, limit: i64) -> Result<Vec<DeliveryAttempt>>;

    /// Pending → Sent. Fails if the row is not Pending.
    async fn mark_sent(&self, id: &DeliveryId, provider_message_id: Option<&str>) -> Result<()>;

    /// Sent → Delivered. Fails if the row is not Sent.
    async fn mark_delivered(&self, id: &DeliveryId) -> Result<()>;

    /// Pending|Sent → Failed; does not change retry_count.
    async fn mark_failed(&self, id: &DeliveryId, error: &str) -> Result<()>;

    /// Failed → Pending, the retry edge; increments retry_count.
    async fn mark_retrying(&self, id: &DeliveryId) -> Result<()>;

    /// Creates a row already in Delivered state; used when an ack arrives
    /// before the tracking row is visible locally.
    async fn create_delivered(&self, attempt: &DeliveryAttempt) -> Result<()>;

    /// Non-terminal rows of the notification → Expired; returns how many
    /// rows moved.
    async fn expire_for_notification(&self, notification_id: &NotificationId) -> Result<u64>;
}

/// Narrow capability the orchestrator uses to reach live sessions.
///
/// Implemented by the session hub; injecting the capability instead of the
/// hub keeps the hub↔orchestrator reference cycle out of the type graph.
#[async_trait]
pub trait LivePush: Send + Sync {
    fn is_device_connected(&self, device_id: &DeviceId) -> bool;

    fn is_user_connected(&self, user_id: &UserId) -> bool;

    /// Best-effort push of a serialized frame to every session of the
    /// device; true when at least one session accepted it.
    async fn send_to_device(&self, device_id: &DeviceId, frame: String) -> bool;
}

/// Narrow capability a session uses to confirm a delivery.
///
/// Implemented by the orchestrator; sessions never see the orchestrator
/// itself.
#[async_trait]
pub trait AckSink: Send + Sync {
    async fn ack(&self, notification_id: NotificationId, device_id: DeviceId) -> Result<()>;
}

/// What a push provider returned for a successful send.
#[derive(Debug, Clone, PartialEq)]
pub struct PushReceipt {
    /// Provider-assigned message id.
    pub message_id: String,
    /// Replacement channel token, when the provider reports the device
    /// moved to a new registration id. The caller must rotate the stored
    /// token.
    pub canonical_token: Option<String>,
}

/// Uniform send contract for the mobile push channels.
///
/// Adapters are stateless with respect to notifications; every call carries
/// its own timeout and is safe to retry.
#[async_trait]
pub trait PushAdapter: Send + Sync {
    fn kind(&self) -> ChannelKind;

    async fn send(&self, token: &str, notification: &Notification) -> Result<PushReceipt>;
}
