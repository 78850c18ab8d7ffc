//! The credential authority.
//!
//! Issues, verifies and recovers the two session credential shapes:
//!
//! - *temporary*: carries only the device identifier; enough to open a
//!   socket and complete user linking (~30 min).
//! - *permanent*: carries device id and user id (~24 h).
//!
//! Credentials are HS256 JWTs. The signing key is captured at construction
//! and never reassigned.

use crate::devices::DeviceRepository;
use crate::shared_kernel::{DeviceId, DomainError, Result, UserId};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Claims carried by a session credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// True for pre-link credentials.
    #[serde(default, rename = "temp", skip_serializing_if = "std::ops::Not::not")]
    pub temporary: bool,
    /// Expiration, Unix seconds.
    pub exp: i64,
    /// Issued at, Unix seconds.
    pub iat: i64,
}

impl SessionClaims {
    pub fn device_id(&self) -> Option<DeviceId> {
        self.device_id.as_deref().and_then(DeviceId::from_string)
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(UserId::from)
    }
}

/// Which credential shape a token carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialKind {
    Temporary,
    Permanent,
}

/// Verification failure kinds. `Expired` is recoverable through
/// [`CredentialAuthority::recover_device_identifier`]; the others are not.
#[derive(Debug, Error, PartialEq)]
pub enum CredentialError {
    #[error("credential has expired")]
    Expired,

    #[error("invalid credential signature")]
    InvalidSignature,

    #[error("malformed credential: {0}")]
    Malformed(String),
}

impl From<CredentialError> for DomainError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Expired => DomainError::CredentialExpired,
            CredentialError::InvalidSignature => DomainError::CredentialInvalid {
                message: "invalid signature".to_string(),
            },
            CredentialError::Malformed(message) => DomainError::CredentialInvalid { message },
        }
    }
}

/// Issues and verifies session credentials.
pub struct CredentialAuthority {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    permanent_ttl: Duration,
    temporary_ttl: Duration,
}

impl CredentialAuthority {
    pub fn new(secret: &[u8], permanent_ttl: Duration, temporary_ttl: Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            permanent_ttl,
            temporary_ttl,
        }
    }

    /// Issues a pre-link credential bound to the device identifier only.
    pub fn issue_temporary(&self, device_identifier: &str) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = SessionClaims {
            device_id: None,
            device_identifier: Some(device_identifier.to_string()),
            user_id: None,
            temporary: true,
            exp: now + self.temporary_ttl.as_secs() as i64,
            iat: now,
        };
        self.sign(&claims)
    }

    /// Issues a post-link credential carrying both device and user identity.
    pub fn issue_permanent(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        device_identifier: &str,
    ) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = SessionClaims {
            device_id: Some(device_id.to_string()),
            device_identifier: Some(device_identifier.to_string()),
            user_id: Some(user_id.to_string()),
            temporary: false,
            exp: now + self.permanent_ttl.as_secs() as i64,
            iat: now,
        };
        self.sign(&claims)
    }

    fn sign(&self, claims: &SessionClaims) -> Result<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key).map_err(|e| {
            DomainError::InfrastructureError {
                message: format!("failed to sign credential: {}", e),
            }
        })
    }

    /// Validates signature and expiry, returning the claims.
    pub fn verify(&self, token: &str) -> std::result::Result<SessionClaims, CredentialError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp"]);
        // No leeway: a just-expired credential must go through the recovery
        // path, not slide through verification.
        validation.leeway = 0;

        decode::<SessionClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    debug!("credential expired");
                    CredentialError::Expired
                }
                jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                    warn!("credential with invalid signature");
                    CredentialError::InvalidSignature
                }
                _ => CredentialError::Malformed(e.to_string()),
            })
    }

    /// Extracts the claims segment WITHOUT verifying the signature.
    ///
    /// Only safe for identity recovery: nothing decoded this way may be
    /// trusted beyond selecting which device to re-issue a credential for,
    /// and the caller must still hold the full (possession-proving) token.
    pub fn decode_unverified(&self, token: &str) -> std::result::Result<SessionClaims, CredentialError> {
        let mut parts = token.split('.');
        let (_, claims_segment) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(header), Some(claims), Some(_sig), None) => (header, claims),
            _ => {
                return Err(CredentialError::Malformed(
                    "expected three dot-separated segments".to_string(),
                ));
            }
        };

        let raw = URL_SAFE_NO_PAD
            .decode(claims_segment)
            .map_err(|e| CredentialError::Malformed(format!("claims segment: {}", e)))?;

        serde_json::from_slice(&raw)
            .map_err(|e| CredentialError::Malformed(format!("claims json: {}", e)))
    }

    /// Recovers the device identifier from an expired credential.
    ///
    /// Prefers the `device_identifier` claim; falls back to resolving the
    /// `device_id` claim through the device repository.
    pub async fn recover_device_identifier(
        &self,
        token: &str,
        devices: &dyn DeviceRepository,
    ) -> Result<String> {
        let claims = self.decode_unverified(token).map_err(DomainError::from)?;

        if let Some(identifier) = claims.device_identifier.filter(|s| !s.is_empty()) {
            return Ok(identifier);
        }

        let device_id = claims
            .device_id
            .as_deref()
            .and_then(DeviceId::from_string)
            .ok_or_else(|| DomainError::CredentialInvalid {
                message: "no device identity in claims".to_string(),
            })?;

        let device = devices
            .find_by_id(&device_id)
            .await?
            .ok_or(DomainError::DeviceNotFound { device_id })?;

        Ok(device.device_identifier)
    }

    /// True when the token parses, is genuinely temporary, still valid, and
    /// names the given device identifier. Gate for the link operation.
    pub fn is_valid_temporary_for(&self, token: &str, device_identifier: &str) -> bool {
        match self.verify(token) {
            Ok(claims) => {
                claims.temporary && claims.device_identifier.as_deref() == Some(device_identifier)
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::Device;
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn authority() -> CredentialAuthority {
        CredentialAuthority::new(
            b"test-secret",
            Duration::from_secs(24 * 60 * 60),
            Duration::from_secs(30 * 60),
        )
    }

    /// Minimal device store for the recovery fallback path.
    struct FixedDevices {
        devices: Mutex<HashMap<DeviceId, Device>>,
    }

    impl FixedDevices {
        fn with(device: Device) -> Self {
            let mut devices = HashMap::new();
            devices.insert(device.id, device);
            Self {
                devices: Mutex::new(devices),
            }
        }
    }

    #[async_trait]
    impl DeviceRepository for FixedDevices {
        async fn save(&self, device: &Device) -> Result<()> {
            self.devices
                .lock()
                .unwrap()
                .insert(device.id, device.clone());
            Ok(())
        }

        async fn update(&self, device: &Device) -> Result<()> {
            self.save(device).await
        }

        async fn find_by_id(&self, device_id: &DeviceId) -> Result<Option<Device>> {
            Ok(self.devices.lock().unwrap().get(device_id).cloned())
        }

        async fn find_by_identifier(&self, _device_identifier: &str) -> Result<Option<Device>> {
            Ok(None)
        }

        async fn find_by_user(&self, _user_id: &UserId) -> Result<Vec<Device>> {
            Ok(vec![])
        }

        async fn update_last_access(&self, _device_id: &DeviceId) -> Result<()> {
            Ok(())
        }

        async fn soft_delete(&self, _device_id: &DeviceId) -> Result<()> {
            Ok(())
        }

        async fn find_inactive(&self, _threshold: DateTime<Utc>) -> Result<Vec<Device>> {
            Ok(vec![])
        }
    }

    #[test]
    fn test_permanent_roundtrip() {
        let authority = authority();
        let device_id = DeviceId::new();
        let token = authority
            .issue_permanent(&UserId::from("42"), &device_id, "hw-001")
            .unwrap();

        let claims = authority.verify(&token).unwrap();
        assert!(!claims.temporary);
        assert_eq!(claims.user_id(), Some(UserId::from("42")));
        assert_eq!(claims.device_id(), Some(device_id));
        assert_eq!(claims.device_identifier.as_deref(), Some("hw-001"));
    }

    #[test]
    fn test_temporary_roundtrip() {
        let authority = authority();
        let token = authority.issue_temporary("hw-002").unwrap();

        let claims = authority.verify(&token).unwrap();
        assert!(claims.temporary);
        assert!(claims.user_id().is_none());
        assert!(claims.device_id().is_none());
        assert_eq!(claims.device_identifier.as_deref(), Some("hw-002"));
    }

    #[test]
    fn test_wrong_secret_is_invalid_signature() {
        let token = authority().issue_temporary("hw-003").unwrap();
        let other = CredentialAuthority::new(
            b"other-secret",
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        assert_eq!(other.verify(&token), Err(CredentialError::InvalidSignature));
    }

    #[test]
    fn test_garbage_is_malformed() {
        let result = authority().verify("definitely.not.a-jwt");
        assert!(matches!(result, Err(CredentialError::Malformed(_))));
    }

    fn expired_token(authority: &CredentialAuthority, claims: &SessionClaims) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &authority.encoding_key,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_recovery_prefers_device_identifier_claim() {
        let authority = authority();
        let now = Utc::now().timestamp();
        let token = expired_token(
            &authority,
            &SessionClaims {
                device_id: None,
                device_identifier: Some("hw-004".to_string()),
                user_id: None,
                temporary: true,
                exp: now - 3600,
                iat: now - 7200,
            },
        );

        // Verification refuses the token...
        assert_eq!(authority.verify(&token), Err(CredentialError::Expired));

        // ...but recovery still reads the identity.
        let store = FixedDevices::with(Device::new("unused", None, None));
        let identifier = authority
            .recover_device_identifier(&token, &store)
            .await
            .unwrap();
        assert_eq!(identifier, "hw-004");
    }

    #[tokio::test]
    async fn test_recovery_falls_back_to_device_id_lookup() {
        let authority = authority();
        let device = Device::new("hw-005", Some(UserId::from("9")), None);
        let device_id = device.id;
        let store = FixedDevices::with(device);

        let now = Utc::now().timestamp();
        let token = expired_token(
            &authority,
            &SessionClaims {
                device_id: Some(device_id.to_string()),
                device_identifier: None,
                user_id: Some("9".to_string()),
                temporary: false,
                exp: now - 10,
                iat: now - 100,
            },
        );

        let identifier = authority
            .recover_device_identifier(&token, &store)
            .await
            .unwrap();
        assert_eq!(identifier, "hw-005");
    }

    #[tokio::test]
    async fn test_recovery_rejects_identity_free_claims() {
        let authority = authority();
        let now = Utc::now().timestamp();
        let token = expired_token(
            &authority,
            &SessionClaims {
                device_id: None,
                device_identifier: None,
                user_id: Some("9".to_string()),
                temporary: false,
                exp: now - 10,
                iat: now - 100,
            },
        );

        let store = FixedDevices::with(Device::new("hw", None, None));
        let err = authority
            .recover_device_identifier(&token, &store)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::CredentialInvalid { .. }));
    }

    #[test]
    fn test_temporary_gate_for_linking() {
        let authority = authority();
        let token = authority.issue_temporary("hw-006").unwrap();

        assert!(authority.is_valid_temporary_for(&token, "hw-006"));
        // Wrong device.
        assert!(!authority.is_valid_temporary_for(&token, "hw-007"));

        // A permanent credential never passes the temporary gate.
        let permanent = authority
            .issue_permanent(&UserId::from("1"), &DeviceId::new(), "hw-006")
            .unwrap();
        assert!(!authority.is_valid_temporary_for(&permanent, "hw-006"));
    }
}
