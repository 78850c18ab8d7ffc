//! APNS adapter (provider A).
//!
//! Posts the notification payload to the per-token endpoint. High priority
//! maps to `apns-priority: 10`, system notifications are sent
//! content-available, and the notification expiry travels in the
//! `apns-expiration` header.

use crate::push::{http_client, transport_error};
use async_trait::async_trait;
use courier_server_domain::deliveries::{PushAdapter, PushReceipt};
use courier_server_domain::notifications::Notification;
use courier_server_domain::shared_kernel::{ChannelKind, DomainError, NotificationKind, Result};
use courier_shared::ApnsConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// 4xx reasons that mean the device token is dead and must be revoked.
const INVALID_TOKEN_REASONS: [&str; 2] = ["BadDeviceToken", "Unregistered"];

#[derive(Debug, Serialize)]
struct ApnsPayload {
    aps: Aps,
    #[serde(skip_serializing_if = "Value::is_null")]
    custom: Value,
}

#[derive(Debug, Serialize)]
struct Aps {
    alert: ApsAlert,
    badge: i32,
    sound: String,
    #[serde(rename = "content-available", skip_serializing_if = "Option::is_none")]
    content_available: Option<i32>,
}

#[derive(Debug, Serialize)]
struct ApsAlert {
    title: String,
    body: String,
}

#[derive(Debug, Deserialize)]
struct ApnsErrorBody {
    #[serde(default)]
    reason: String,
}

/// Adapter for the Apple push service.
pub struct ApnsAdapter {
    client: reqwest::Client,
    config: ApnsConfig,
}

impl ApnsAdapter {
    pub fn new(config: ApnsConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            config,
        })
    }

    fn payload(notification: &Notification) -> ApnsPayload {
        let mut custom = notification.data_map();
        if let Some(map) = custom.as_object_mut() {
            map.insert(
                "notification_id".to_string(),
                Value::String(notification.id.to_string()),
            );
        }

        ApnsPayload {
            aps: Aps {
                alert: ApsAlert {
                    title: notification.title.clone(),
                    body: notification.message.clone(),
                },
                badge: 1,
                sound: "default".to_string(),
                content_available: (notification.kind == NotificationKind::System).then_some(1),
            },
            custom,
        }
    }
}

#[async_trait]
impl PushAdapter for ApnsAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Apns
    }

    async fn send(&self, token: &str, notification: &Notification) -> Result<PushReceipt> {
        let url = format!("{}/{}", self.config.endpoint.trim_end_matches('/'), token);
        let apns_id = notification.id.to_string();
        let priority = if notification.priority > 0 { "10" } else { "5" };

        let mut request = self
            .client
            .post(&url)
            .bearer_auth(&self.config.auth_token)
            .header("apns-topic", &self.config.topic)
            .header("apns-id", &apns_id)
            .header("apns-priority", priority)
            .json(&Self::payload(notification));

        if let Some(expires_at) = notification.expires_at {
            request = request.header("apns-expiration", expires_at.timestamp().to_string());
        }

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(ChannelKind::Apns, e))?;

        let status = response.status();
        if status.is_success() {
            let message_id = response
                .headers()
                .get("apns-id")
                .and_then(|v| v.to_str().ok())
                .unwrap_or(&apns_id)
                .to_string();
            debug!(%message_id, "apns notification accepted");
            return Ok(PushReceipt {
                message_id,
                canonical_token: None,
            });
        }

        let body: ApnsErrorBody = response.json().await.unwrap_or(ApnsErrorBody {
            reason: String::new(),
        });
        warn!(status = %status, reason = %body.reason, "apns rejected notification");

        if status.is_client_error() && INVALID_TOKEN_REASONS.contains(&body.reason.as_str()) {
            return Err(DomainError::InvalidToken {
                reason: body.reason,
            });
        }

        Err(DomainError::TransientChannelFailure {
            channel: ChannelKind::Apns,
            message: if body.reason.is_empty() {
                format!("status {}", status)
            } else {
                body.reason
            },
        })
    }
}
