//! Device registration, linking and credential flows.

use chrono::Utc;
use courier_server_domain::devices::{Device, DeviceRepository};
use courier_server_domain::iam::{CredentialAuthority, CredentialKind};
use courier_server_domain::shared_kernel::{
    ChannelKind, DeviceId, DomainError, Result, UserId,
};
use courier_server_domain::tokens::{ChannelToken, ChannelTokenRepository};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Result of a device registration: the device plus its session credential.
#[derive(Debug, Clone)]
pub struct RegisteredDevice {
    pub device: Device,
    pub credential: String,
    pub credential_kind: CredentialKind,
}

/// Result of a credential renewal.
#[derive(Debug, Clone)]
pub struct RenewedCredential {
    pub credential: String,
    pub credential_kind: CredentialKind,
}

/// Device lifecycle use cases.
pub struct DeviceService {
    devices: Arc<dyn DeviceRepository>,
    tokens: Arc<dyn ChannelTokenRepository>,
    authority: Arc<CredentialAuthority>,
}

impl DeviceService {
    pub fn new(
        devices: Arc<dyn DeviceRepository>,
        tokens: Arc<dyn ChannelTokenRepository>,
        authority: Arc<CredentialAuthority>,
    ) -> Self {
        Self {
            devices,
            tokens,
            authority,
        }
    }

    /// Registers a device, idempotently by `device_identifier`.
    ///
    /// Re-registration refreshes last access and model. The returned
    /// credential is temporary when no user is bound, permanent otherwise.
    pub async fn register(
        &self,
        device_identifier: &str,
        user_id: Option<UserId>,
        model: Option<String>,
    ) -> Result<RegisteredDevice> {
        if device_identifier.is_empty() {
            return Err(DomainError::InvalidInput {
                field: "device_identifier".to_string(),
                reason: "must not be empty".to_string(),
            });
        }

        let device = match self.devices.find_by_identifier(device_identifier).await? {
            Some(mut existing) => {
                existing.touch();
                if let Some(user_id) = user_id.clone() {
                    existing.link_to_user(user_id)?;
                }
                if model.is_some() {
                    existing.model = model;
                }
                self.devices.update(&existing).await?;
                existing
            }
            None => {
                let device = Device::new(device_identifier, user_id.clone(), model);
                self.devices.save(&device).await?;
                info!(device_id = %device.id, "device registered");
                device
            }
        };

        let (credential, credential_kind) = match &device.user_id {
            Some(user_id) => (
                self.authority
                    .issue_permanent(user_id, &device.id, &device.device_identifier)?,
                CredentialKind::Permanent,
            ),
            None => (
                self.authority.issue_temporary(&device.device_identifier)?,
                CredentialKind::Temporary,
            ),
        };

        Ok(RegisteredDevice {
            device,
            credential,
            credential_kind,
        })
    }

    /// Upgrades a pre-link device to a user-bound one.
    ///
    /// The presented credential must be a valid temporary credential for
    /// exactly this device; a fresh permanent credential is returned.
    pub async fn link(
        &self,
        device_id: DeviceId,
        user_id: UserId,
        temporary_credential: &str,
    ) -> Result<String> {
        let mut device = self
            .devices
            .find_by_id(&device_id)
            .await?
            .ok_or(DomainError::DeviceNotFound { device_id })?;

        if !self
            .authority
            .is_valid_temporary_for(temporary_credential, &device.device_identifier)
        {
            return Err(DomainError::CredentialInvalid {
                message: "not a valid temporary credential for this device".to_string(),
            });
        }

        device.link_to_user(user_id.clone())?;
        device.mark_verified();
        self.devices.update(&device).await?;
        info!(%device_id, %user_id, "device linked to user");

        self.authority
            .issue_permanent(&user_id, &device.id, &device.device_identifier)
    }

    /// Upserts the channel token (push address) for a device.
    pub async fn update_channel_token(
        &self,
        device_id: DeviceId,
        value: &str,
        kind: ChannelKind,
    ) -> Result<()> {
        if value.is_empty() {
            return Err(DomainError::InvalidInput {
                field: "token".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.devices.find_by_id(&device_id).await?.is_none() {
            return Err(DomainError::DeviceNotFound { device_id });
        }

        self.tokens
            .upsert(&ChannelToken::new(device_id, value, kind))
            .await
    }

    /// Renews a session credential.
    ///
    /// A still-valid credential is returned unchanged. An expired one is
    /// renewed through the recovery path: the device identifier is read
    /// from the unverified claims (or resolved via the device repository)
    /// and a credential of the appropriate shape is issued.
    pub async fn renew_credential(
        &self,
        credential: &str,
        force_temporary: bool,
    ) -> Result<RenewedCredential> {
        match self.authority.verify(credential) {
            Ok(claims) => Ok(RenewedCredential {
                credential: credential.to_string(),
                credential_kind: if claims.temporary {
                    CredentialKind::Temporary
                } else {
                    CredentialKind::Permanent
                },
            }),
            // Only expiry is recoverable; a bad signature or shape stays
            // fatal no matter what the claims say.
            Err(err) if err != courier_server_domain::iam::CredentialError::Expired => {
                Err(DomainError::from(err))
            }
            Err(err) => {
                let device_identifier = self
                    .authority
                    .recover_device_identifier(credential, self.devices.as_ref())
                    .await
                    .map_err(|_| DomainError::from(err))?;

                let claims = self
                    .authority
                    .decode_unverified(credential)
                    .map_err(DomainError::from)?;

                match claims.user_id() {
                    Some(user_id) if !force_temporary => {
                        let device = self
                            .devices
                            .find_by_identifier(&device_identifier)
                            .await?
                            .ok_or_else(|| DomainError::CredentialInvalid {
                                message: "credential names an unknown device".to_string(),
                            })?;

                        Ok(RenewedCredential {
                            credential: self.authority.issue_permanent(
                                &user_id,
                                &device.id,
                                &device.device_identifier,
                            )?,
                            credential_kind: CredentialKind::Permanent,
                        })
                    }
                    _ => Ok(RenewedCredential {
                        credential: self.authority.issue_temporary(&device_identifier)?,
                        credential_kind: CredentialKind::Temporary,
                    }),
                }
            }
        }
    }

    pub async fn get(&self, device_id: DeviceId) -> Result<Device> {
        self.devices
            .find_by_id(&device_id)
            .await?
            .ok_or(DomainError::DeviceNotFound { device_id })
    }

    /// Lookup by the client-supplied identifier; used at socket admission
    /// where a temporary credential carries no device id.
    pub async fn by_identifier(&self, device_identifier: &str) -> Result<Option<Device>> {
        self.devices.find_by_identifier(device_identifier).await
    }

    /// Records device activity, e.g. when a socket session opens.
    pub async fn touch(&self, device_id: DeviceId) -> Result<()> {
        self.devices.update_last_access(&device_id).await
    }

    pub async fn user_devices(&self, user_id: &UserId) -> Result<Vec<Device>> {
        self.devices.find_by_user(user_id).await
    }

    /// Tombstones devices silent past the threshold, revoking their channel
    /// tokens first. Returns how many devices were removed.
    pub async fn cleanup_inactive(&self, inactivity: Duration) -> Result<usize> {
        let threshold = Utc::now()
            - chrono::Duration::from_std(inactivity).unwrap_or_else(|_| chrono::Duration::zero());
        let stale = self.devices.find_inactive(threshold).await?;
        let mut removed = 0usize;

        for device in stale {
            if let Err(err) = self.tokens.revoke_all_for_device(&device.id).await {
                warn!(device_id = %device.id, error = %err, "failed to revoke tokens, skipping");
                continue;
            }
            if let Err(err) = self.devices.soft_delete(&device.id).await {
                warn!(device_id = %device.id, error = %err, "failed to delete device");
                continue;
            }
            removed += 1;
        }

        if removed > 0 {
            info!(count = removed, "cleaned up inactive devices");
        }
        Ok(removed)
    }
}
