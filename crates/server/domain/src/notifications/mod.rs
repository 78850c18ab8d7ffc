//! Notifications: the immutable payload of a submission.

use crate::shared_kernel::{DomainError, NotificationId, NotificationKind, Result, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One logical notification addressed to a user.
///
/// Immutable after creation; delivery state lives in the per-device
/// [`crate::deliveries::DeliveryAttempt`] rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub user_id: UserId,
    pub title: String,
    pub message: String,
    /// Arbitrary structured payload forwarded verbatim to the channels.
    pub data: Value,
    pub kind: NotificationKind,
    pub sender_id: Option<String>,
    /// 0 = normal, 1 = high.
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn new(
        user_id: UserId,
        title: impl Into<String>,
        message: impl Into<String>,
        data: Value,
        kind: NotificationKind,
    ) -> Result<Self> {
        let title = title.into();
        let message = message.into();

        if user_id.is_empty() {
            return Err(DomainError::InvalidInput {
                field: "user_id".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if title.is_empty() {
            return Err(DomainError::InvalidInput {
                field: "title".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if message.is_empty() {
            return Err(DomainError::InvalidInput {
                field: "body".to_string(),
                reason: "must not be empty".to_string(),
            });
        }

        Ok(Self {
            id: NotificationId::new(),
            user_id,
            title,
            message,
            data,
            kind,
            sender_id: None,
            priority: 0,
            created_at: Utc::now(),
            expires_at: None,
        })
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_sender(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = Some(sender_id.into());
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(at) => Utc::now() > at,
            None => false,
        }
    }

    /// The payload map sent to the channels; always an object.
    pub fn data_map(&self) -> Value {
        if self.data.is_object() {
            self.data.clone()
        } else {
            Value::Object(Default::default())
        }
    }
}

/// Persistence port for notifications.
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn save(&self, notification: &Notification) -> Result<()>;

    async fn find_by_id(&self, id: &NotificationId) -> Result<Option<Notification>>;

    async fn find_by_user(
        &self,
        user_id: &UserId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Notification>>;

    /// Notifications whose expiry has passed; used by the expiry sweep.
    async fn find_expired(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Notification>>;
}
