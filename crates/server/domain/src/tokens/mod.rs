//! Channel tokens: per-device addresses for the push channels.
//!
//! Not to be confused with session credentials (see [`crate::iam`]). A
//! channel token is what a mobile push provider needs to reach a device.

use crate::shared_kernel::{ChannelKind, ChannelTokenId, DeviceId, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Default channel token lifetime. Providers rotate tokens well within this.
const DEFAULT_TOKEN_LIFETIME_DAYS: i64 = 30;

/// The address one push channel uses for one device.
///
/// Invariant: at most one active, non-revoked, non-expired token per
/// (device, kind). The repository upsert enforces it by replacing any prior
/// row for the pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelToken {
    pub id: ChannelTokenId,
    pub device_id: DeviceId,
    pub value: String,
    pub kind: ChannelKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
    pub revoked: bool,
}

impl ChannelToken {
    pub fn new(device_id: DeviceId, value: impl Into<String>, kind: ChannelKind) -> Self {
        let now = Utc::now();
        Self {
            id: ChannelTokenId::new(),
            device_id,
            value: value.into(),
            kind,
            created_at: now,
            updated_at: now,
            expires_at: now + Duration::days(DEFAULT_TOKEN_LIFETIME_DAYS),
            active: true,
            revoked: false,
        }
    }

    /// Replaces the token value, e.g. when FCM reports a canonical
    /// registration id. Reactivates and extends the token.
    pub fn rotate(&mut self, new_value: impl Into<String>) {
        let now = Utc::now();
        self.value = new_value.into();
        self.updated_at = now;
        self.expires_at = now + Duration::days(DEFAULT_TOKEN_LIFETIME_DAYS);
        self.active = true;
        self.revoked = false;
    }

    pub fn revoke(&mut self) {
        self.revoked = true;
        self.active = false;
        self.updated_at = Utc::now();
    }

    pub fn is_valid(&self) -> bool {
        self.active && !self.revoked && Utc::now() < self.expires_at
    }
}

/// Persistence port for channel tokens.
#[async_trait]
pub trait ChannelTokenRepository: Send + Sync {
    /// Inserts the token, replacing any existing token for the same
    /// (device, kind) pair.
    async fn upsert(&self, token: &ChannelToken) -> Result<()>;

    /// The single valid token for (device, kind), if any.
    async fn find_active(&self, device_id: &DeviceId, kind: ChannelKind)
        -> Result<Option<ChannelToken>>;

    /// Every valid token for the device, any kind.
    async fn all_for_device(&self, device_id: &DeviceId) -> Result<Vec<ChannelToken>>;

    async fn revoke(&self, token_id: &ChannelTokenId) -> Result<()>;

    async fn revoke_all_for_device(&self, device_id: &DeviceId) -> Result<()>;

    /// Drops expired rows; returns how many were removed.
    async fn delete_expired(&self) -> Result<u64>;
}
