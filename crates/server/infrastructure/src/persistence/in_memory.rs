//! In-Memory Repositories - TEST ONLY
//!
//! These implementations are for testing purposes only.
//! Do NOT use in production code.
//!
//! They mirror the conditional-update semantics of the PostgreSQL
//! repositories without requiring a database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_server_domain::deliveries::{DeliveryAttempt, DeliveryRepository};
use courier_server_domain::devices::{Device, DeviceRepository};
use courier_server_domain::notifications::{Notification, NotificationRepository};
use courier_server_domain::queue::{QueueItem, QueueItemStatus, QueueRepository};
use courier_server_domain::shared_kernel::{
    ChannelKind, ChannelTokenId, DeliveryId, DeliveryStatus, DeviceId, DomainError, NotificationId,
    Result, UserId,
};
use courier_server_domain::tokens::{ChannelToken, ChannelTokenRepository};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// In-memory device repository for tests.
#[derive(Clone, Default)]
pub struct InMemoryDeviceRepository {
    devices: Arc<RwLock<HashMap<DeviceId, Device>>>,
}

impl InMemoryDeviceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceRepository for InMemoryDeviceRepository {
    async fn save(&self, device: &Device) -> Result<()> {
        self.devices.write().await.insert(device.id, device.clone());
        Ok(())
    }

    async fn update(&self, device: &Device) -> Result<()> {
        self.devices.write().await.insert(device.id, device.clone());
        Ok(())
    }

    async fn find_by_id(&self, device_id: &DeviceId) -> Result<Option<Device>> {
        Ok(self.devices.read().await.get(device_id).cloned())
    }

    async fn find_by_identifier(&self, device_identifier: &str) -> Result<Option<Device>> {
        Ok(self
            .devices
            .read()
            .await
            .values()
            .find(|d| d.device_identifier == device_identifier && d.is_active())
            .cloned())
    }

    async fn find_by_user(&self, user_id: &UserId) -> Result<Vec<Device>> {
        Ok(self
            .devices
            .read()
            .await
            .values()
            .filter(|d| d.user_id.as_ref() == Some(user_id) && d.is_active())
            .cloned()
            .collect())
    }

    async fn update_last_access(&self, device_id: &DeviceId) -> Result<()> {
        if let Some(device) = self.devices.write().await.get_mut(device_id) {
            device.touch();
        }
        Ok(())
    }

    async fn soft_delete(&self, device_id: &DeviceId) -> Result<()> {
        if let Some(device) = self.devices.write().await.get_mut(device_id) {
            device.mark_deleted();
        }
        Ok(())
    }

    async fn find_inactive(&self, threshold: DateTime<Utc>) -> Result<Vec<Device>> {
        Ok(self
            .devices
            .read()
            .await
            .values()
            .filter(|d| d.is_active() && d.last_access < threshold)
            .cloned()
            .collect())
    }
}

/// In-memory channel token repository for tests.
#[derive(Clone, Default)]
pub struct InMemoryChannelTokenRepository {
    tokens: Arc<RwLock<HashMap<ChannelTokenId, ChannelToken>>>,
}

impl InMemoryChannelTokenRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChannelTokenRepository for InMemoryChannelTokenRepository {
    async fn upsert(&self, token: &ChannelToken) -> Result<()> {
        let mut tokens = self.tokens.write().await;
        // One row per (device, kind); the upsert replaces prior entries.
        tokens.retain(|_, t| !(t.device_id == token.device_id && t.kind == token.kind));
        tokens.insert(token.id, token.clone());
        Ok(())
    }

    async fn find_active(
        &self,
        device_id: &DeviceId,
        kind: ChannelKind,
    ) -> Result<Option<ChannelToken>> {
        Ok(self
            .tokens
            .read()
            .await
            .values()
            .find(|t| t.device_id == *device_id && t.kind == kind && t.is_valid())
            .cloned())
    }

    async fn all_for_device(&self, device_id: &DeviceId) -> Result<Vec<ChannelToken>> {
        Ok(self
            .tokens
            .read()
            .await
            .values()
            .filter(|t| t.device_id == *device_id && t.is_valid())
            .cloned()
            .collect())
    }

    async fn revoke(&self, token_id: &ChannelTokenId) -> Result<()> {
        if let Some(token) = self.tokens.write().await.get_mut(token_id) {
            token.revoke();
        }
        Ok(())
    }

    async fn revoke_all_for_device(&self, device_id: &DeviceId) -> Result<()> {
        for token in self.tokens.write().await.values_mut() {
            if token.device_id == *device_id {
                token.revoke();
            }
        }
        Ok(())
    }

    async fn delete_expired(&self) -> Result<u64> {
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        let now = Utc::now();
        tokens.retain(|_, t| t.expires_at > now);
        Ok((before - tokens.len()) as u64)
    }
}

/// In-memory notification repository for tests.
#[derive(Clone, Default)]
pub struct InMemoryNotificationRepository {
    notifications: Arc<RwLock<HashMap<NotificationId, Notification>>>,
}

impl InMemoryNotificationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NotificationRepository for InMemoryNotificationRepository {
    async fn save(&self, notification: &Notification) -> Result<()> {
        self.notifications
            .write()
            .await
            .insert(notification.id, notification.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &NotificationId) -> Result<Option<Notification>> {
        Ok(self.notifications.read().await.get(id).cloned())
    }

    async fn find_by_user(
        &self,
        user_id: &UserId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Notification>> {
        let mut list: Vec<Notification> = self
            .notifications
            .read()
            .await
            .values()
            .filter(|n| n.user_id == *user_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn find_expired(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Notification>> {
        let mut list: Vec<Notification> = self
            .notifications
            .read()
            .await
            .values()
            .filter(|n| n.expires_at.map(|at| at < now).unwrap_or(false))
            .cloned()
            .collect();
        list.sort_by_key(|n| n.expires_at);
        list.truncate(limit.max(0) as usize);
        Ok(list)
    }
}

/// In-memory delivery repository for tests.
#[derive(Clone, Default)]
pub struct InMemoryDeliveryRepository {
    attempts: Arc<RwLock<HashMap<DeliveryId, DeliveryAttempt>>>,
}

impl InMemoryDeliveryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    async fn guarded_update<F>(&self, id: &DeliveryId, to: DeliveryStatus, apply: F) -> Result<()>
    where
        F: FnOnce(&mut DeliveryAttempt) -> Result<()>,
    {
        let mut attempts = self.attempts.write().await;
        let attempt = attempts
            .get_mut(id)
            .ok_or(DomainError::DeliveryNotFound { delivery_id: *id })?;
        if !attempt.status.can_transition_to(&to) {
            return Err(DomainError::InvalidStateTransition {
                delivery_id: *id,
                from: attempt.status,
                to,
            });
        }
        apply(attempt)
    }
}

#[async_trait]
impl DeliveryRepository for InMemoryDeliveryRepository {
    async fn create(&self, attempt: &DeliveryAttempt) -> Result<()> {
        self.attempts
            .write()
            .await
            .insert(attempt.id, attempt.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &DeliveryId) -> Result<Option<DeliveryAttempt>> {
        Ok(self.attempts.read().await.get(id).cloned())
    }

    async fn find_by_notification(
        &self,
        notification_id: &NotificationId,
    ) -> Result<Vec<DeliveryAttempt>> {
        let mut list: Vec<DeliveryAttempt> = self
            .attempts
            .read()
            .await
            .values()
            .filter(|a| a.notification_id == *notification_id)
            .cloned()
            .collect();
        list.sort_by_key(|a| a.created_at);
        Ok(list)
    }

    async fn find_by_device(&self, device_id: &DeviceId) -> Result<Vec<DeliveryAttempt>> {
        let mut list: Vec<DeliveryAttempt> = self
            .attempts
            .read()
            .await
            .values()
            .filter(|a| a.device_id == *device_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }

    async fn find_for_ack(
        &self,
        notification_id: &NotificationId,
        device_id: &DeviceId,
    ) -> Result<Option<DeliveryAttempt>> {
        let mut list: Vec<DeliveryAttempt> = self
            .attempts
            .read()
            .await
            .values()
            .filter(|a| a.notification_id == *notification_id && a.device_id == *device_id)
            .cloned()
            .collect();
        list.sort_by_key(|a| a.created_at);
        Ok(list.pop())
    }

    async fn find_retryable(&self, max_retries: u32, limit: i64) -> Result<Vec<DeliveryAttempt>> {
        let mut list: Vec<DeliveryAttempt> = self
            .attempts
            .read()
            .await
            .values()
            .filter(|a| a.should_retry(max_retries))
            .cloned()
            .collect();
        list.sort_by_key(|a| a.updated_at);
        list.truncate(limit.max(0) as usize);
        Ok(list)
    }

    async fn mark_sent(&self, id: &DeliveryId, provider_message_id: Option<&str>) -> Result<()> {
        let provider_message_id = provider_message_id.map(str::to_string);
        self.guarded_update(id, DeliveryStatus::Sent, move |attempt| {
            attempt.mark_sent(provider_message_id)
        })
        .await
    }

    async fn mark_delivered(&self, id: &DeliveryId) -> Result<()> {
        self.guarded_update(id, DeliveryStatus::Delivered, |attempt| {
            attempt.mark_delivered()
        })
        .await
    }

    async fn mark_failed(&self, id: &DeliveryId, error: &str) -> Result<()> {
        let error = error.to_string();
        self.guarded_update(id, DeliveryStatus::Failed, move |attempt| {
            attempt.mark_failed(error)
        })
        .await
    }

    async fn mark_retrying(&self, id: &DeliveryId) -> Result<()> {
        self.guarded_update(id, DeliveryStatus::Pending, |attempt| attempt.begin_retry())
            .await
    }

    async fn create_delivered(&self, attempt: &DeliveryAttempt) -> Result<()> {
        self.attempts
            .write()
            .await
            .insert(attempt.id, attempt.clone());
        Ok(())
    }

    async fn expire_for_notification(&self, notification_id: &NotificationId) -> Result<u64> {
        let mut expired = 0u64;
        for attempt in self.attempts.write().await.values_mut() {
            if attempt.notification_id == *notification_id
                && attempt.status.can_transition_to(&DeliveryStatus::Expired)
                && attempt.mark_expired().is_ok()
            {
                expired += 1;
            }
        }
        Ok(expired)
    }
}

/// In-memory retry queue repository for tests.
#[derive(Clone, Default)]
pub struct InMemoryQueueRepository {
    items: Arc<RwLock<HashMap<Uuid, QueueItem>>>,
}

impl InMemoryQueueRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueRepository for InMemoryQueueRepository {
    async fn enqueue(&self, item: &QueueItem) -> Result<()> {
        self.items.write().await.insert(item.id, item.clone());
        Ok(())
    }

    async fn due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<QueueItem>> {
        let mut list: Vec<QueueItem> = self
            .items
            .read()
            .await
            .values()
            .filter(|i| i.status == QueueItemStatus::Pending && i.next_attempt_at <= now)
            .cloned()
            .collect();
        list.sort_by_key(|i| i.next_attempt_at);
        list.truncate(limit.max(0) as usize);
        Ok(list)
    }

    async fn update(&self, item: &QueueItem) -> Result<()> {
        self.items.write().await.insert(item.id, item.clone());
        Ok(())
    }

    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut items = self.items.write().await;
        let before = items.len();
        items.retain(|_, i| i.status == QueueItemStatus::Pending || i.updated_at >= cutoff);
        Ok((before - items.len()) as u64)
    }
}
