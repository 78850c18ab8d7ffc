//! Devices: the targets of every delivery.
//!
//! A device is created on first registration, optionally linked to a user
//! later, and soft-deleted via a tombstone timestamp. It is the aggregate
//! root for its channel tokens.

use crate::shared_kernel::{DeviceId, DomainError, Result, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A device that can receive notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    /// Client-supplied identifier, unique per physical device among
    /// non-deleted rows.
    pub device_identifier: String,
    pub user_id: Option<UserId>,
    pub model: Option<String>,
    pub verified: bool,
    pub last_access: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Tombstone; a deleted device never receives deliveries.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Device {
    pub fn new(device_identifier: impl Into<String>, user_id: Option<UserId>, model: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: DeviceId::new(),
            device_identifier: device_identifier.into(),
            user_id,
            model,
            verified: false,
            last_access: now,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Binds the device to a user. The binding happens exactly once; a
    /// rebind to a different user is a contract violation.
    pub fn link_to_user(&mut self, user_id: UserId) -> Result<()> {
        match &self.user_id {
            Some(existing) if *existing != user_id => Err(DomainError::InvalidInput {
                field: "user_id".to_string(),
                reason: format!("device already linked to user {}", existing),
            }),
            _ => {
                self.user_id = Some(user_id);
                self.updated_at = Utc::now();
                Ok(())
            }
        }
    }

    pub fn touch(&mut self) {
        self.last_access = Utc::now();
        self.updated_at = self.last_access;
    }

    pub fn mark_verified(&mut self) {
        self.verified = true;
        self.updated_at = Utc::now();
    }

    pub fn mark_deleted(&mut self) {
        let now = Utc::now();
        self.deleted_at = Some(now);
        self.updated_at = now;
    }

    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// Persistence port for devices.
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    async fn save(&self, device: &Device) -> Result<()>;

    async fn update(&self, device: &Device) -> Result<()>;

    async fn find_by_id(&self, device_id: &DeviceId) -> Result<Option<Device>>;

    /// Looks a device up by its client-supplied identifier, skipping
    /// tombstoned rows.
    async fn find_by_identifier(&self, device_identifier: &str) -> Result<Option<Device>>;

    /// All non-deleted devices owned by the user.
    async fn find_by_user(&self, user_id: &UserId) -> Result<Vec<Device>>;

    async fn update_last_access(&self, device_id: &DeviceId) -> Result<()>;

    async fn soft_delete(&self, device_id: &DeviceId) -> Result<()>;

    /// Non-deleted devices whose last access is older than the threshold.
    async fn find_inactive(&self, threshold: DateTime<Utc>) -> Result<Vec<Device>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_device_is_active_and_unverified() {
        let device = Device::new("hw-001", None, Some("X".to_string()));
        assert!(device.is_active());
        assert!(!device.verified);
        assert!(device.user_id.is_none());
        assert!(device.deleted_at.is_none());
    }

    #[test]
    fn test_link_to_user_is_once() {
        let mut device = Device::new("hw-001", None, None);
        device.link_to_user(UserId::from("7")).unwrap();
        assert_eq!(device.user_id, Some(UserId::from("7")));

        // Relinking to the same user is idempotent.
        device.link_to_user(UserId::from("7")).unwrap();

        let err = device.link_to_user(UserId::from("8")).unwrap_err();
        assert!(matches!(err, DomainError::InvalidInput { .. }));
        assert_eq!(device.user_id, Some(UserId::from("7")));
    }

    #[test]
    fn test_tombstone_deactivates() {
        let mut device = Device::new("hw-001", None, None);
        device.mark_deleted();
        assert!(!device.is_active());
        assert!(device.deleted_at.is_some());
    }
}
