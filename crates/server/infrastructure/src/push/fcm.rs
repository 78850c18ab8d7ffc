//! FCM adapter (provider B).
//!
//! Success requires a non-zero success count in the response; a canonical
//! registration id signals that the device token rotated and is surfaced to
//! the caller through the receipt so the stored token can be replaced.

use crate::push::{http_client, transport_error};
use async_trait::async_trait;
use chrono::Utc;
use courier_server_domain::deliveries::{PushAdapter, PushReceipt};
use courier_server_domain::notifications::Notification;
use courier_server_domain::shared_kernel::{ChannelKind, DomainError, Result};
use courier_shared::FcmConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

/// FCM errors that mean the registration token is dead.
const INVALID_TOKEN_ERRORS: [&str; 3] = ["InvalidRegistration", "NotRegistered", "MissingRegistration"];

#[derive(Debug, Serialize)]
struct FcmPayload {
    to: String,
    notification: FcmNotification,
    #[serde(skip_serializing_if = "Value::is_null")]
    data: Value,
    priority: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    time_to_live: Option<i64>,
}

#[derive(Debug, Serialize)]
struct FcmNotification {
    title: String,
    body: String,
    sound: String,
}

#[derive(Debug, Deserialize)]
struct FcmResponse {
    #[serde(default)]
    success: i64,
    #[serde(default)]
    results: Vec<FcmResult>,
}

#[derive(Debug, Default, Deserialize)]
struct FcmResult {
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    registration_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Adapter for Firebase Cloud Messaging.
pub struct FcmAdapter {
    client: reqwest::Client,
    config: FcmConfig,
}

impl FcmAdapter {
    pub fn new(config: FcmConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            config,
        })
    }

    fn payload(token: &str, notification: &Notification) -> FcmPayload {
        let mut data = notification.data_map();
        if let Some(map) = data.as_object_mut() {
            map.insert(
                "notification_id".to_string(),
                Value::String(notification.id.to_string()),
            );
        }

        let time_to_live = notification.expires_at.and_then(|at| {
            let ttl = (at - Utc::now()).num_seconds();
            (ttl > 0).then_some(ttl)
        });

        FcmPayload {
            to: token.to_string(),
            notification: FcmNotification {
                title: notification.title.clone(),
                body: notification.message.clone(),
                sound: "default".to_string(),
            },
            data,
            priority: if notification.priority > 0 {
                "high"
            } else {
                "normal"
            },
            time_to_live,
        }
    }
}

#[async_trait]
impl PushAdapter for FcmAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Fcm
    }

    async fn send(&self, token: &str, notification: &Notification) -> Result<PushReceipt> {
        let response = self
            .client
            .post(&self.config.endpoint)
            .header("Authorization", format!("key={}", self.config.api_key))
            .json(&Self::payload(token, notification))
            .send()
            .await
            .map_err(|e| transport_error(ChannelKind::Fcm, e))?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = %status, "fcm returned an error status");
            return Err(DomainError::TransientChannelFailure {
                channel: ChannelKind::Fcm,
                message: format!("status {}", status),
            });
        }

        let body: FcmResponse =
            response
                .json()
                .await
                .map_err(|e| DomainError::TransientChannelFailure {
                    channel: ChannelKind::Fcm,
                    message: format!("undecodable response: {}", e),
                })?;

        let result = body.results.into_iter().next().unwrap_or_default();

        if body.success == 0 {
            let error = result.error.unwrap_or_else(|| "unspecified".to_string());
            warn!(error = %error, "fcm delivery failed");
            if INVALID_TOKEN_ERRORS.contains(&error.as_str()) {
                return Err(DomainError::InvalidToken { reason: error });
            }
            return Err(DomainError::TransientChannelFailure {
                channel: ChannelKind::Fcm,
                message: error,
            });
        }

        if let Some(new_token) = &result.registration_id {
            info!(%new_token, "fcm reported a canonical registration id");
        }

        let message_id = result
            .message_id
            .unwrap_or_else(|| notification.id.to_string());
        debug!(%message_id, "fcm notification accepted");

        Ok(PushReceipt {
            message_id,
            canonical_token: result.registration_id,
        })
    }
}
