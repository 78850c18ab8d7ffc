//! Submission, status and acknowledgement handlers.

use crate::error::ApiError;
use crate::http::AppState;
use axum::Json;
use axum::extract::{Path, State};
use chrono::{DateTime, Utc};
use courier_server_application::delivery::SubmitNotification;
use courier_server_domain::shared_kernel::{
    ChannelKind, DeliveryStatus, DeviceId, DomainError, NotificationId, NotificationKind, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub user_id: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub device_ids: Option<Vec<String>>,
    #[serde(default)]
    pub channels: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub notification_id: String,
    pub status: &'static str,
}

fn invalid(field: &str, reason: impl Into<String>) -> ApiError {
    ApiError(DomainError::InvalidInput {
        field: field.to_string(),
        reason: reason.into(),
    })
}

impl SubmitRequest {
    fn into_command(self) -> Result<SubmitNotification, ApiError> {
        let kind = match self.kind.as_deref() {
            None | Some("") => NotificationKind::Normal,
            Some(raw) => {
                NotificationKind::from_str(raw).map_err(|e| invalid("type", e))?
            }
        };

        let device_ids = self
            .device_ids
            .map(|ids| {
                ids.iter()
                    .map(|raw| {
                        DeviceId::from_string(raw)
                            .ok_or_else(|| invalid("device_ids", format!("bad id: {}", raw)))
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;

        let channels = self
            .channels
            .map(|list| {
                list.iter()
                    .map(|raw| ChannelKind::from_str(raw).map_err(|e| invalid("channels", e)))
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;

        Ok(SubmitNotification {
            user_id: UserId::from(self.user_id),
            title: self.title,
            message: self.body,
            data: self.data.unwrap_or_else(|| Value::Object(Default::default())),
            kind,
            priority: self.priority.unwrap_or(0),
            sender_id: self.sender_id,
            expires_at: self.expires_at,
            device_ids,
            channels,
        })
    }
}

/// POST /notifications
pub async fn submit(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let command = request.into_command()?;

    match state.orchestrator.submit(command).await {
        Ok(outcome) => Ok(Json(SubmitResponse {
            notification_id: outcome.notification_id.to_string(),
            status: "success",
        })),
        // The notification exists even when no channel reached SENT; the
        // caller gets its id with a failed status instead of an opaque 5xx.
        Err(DomainError::DeliveryFailedAllChannels { notification_id }) => {
            warn!(%notification_id, "submission failed on every channel");
            Ok(Json(SubmitResponse {
                notification_id: notification_id.to_string(),
                status: "failed",
            }))
        }
        Err(err) => Err(err.into()),
    }
}

#[derive(Debug, Serialize)]
pub struct DeliveryRow {
    pub device_id: String,
    pub channel: ChannelKind,
    pub status: DeliveryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub notification_id: String,
    pub user_id: String,
    pub title: String,
    pub body: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub deliveries: Vec<DeliveryRow>,
}

/// GET /notifications/:id
pub async fn status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let notification_id = NotificationId::from_string(&id)
        .ok_or_else(|| invalid("id", "not a uuid"))?;

    let (notification, attempts) = state.orchestrator.delivery_status(notification_id).await?;

    Ok(Json(StatusResponse {
        notification_id: notification.id.to_string(),
        user_id: notification.user_id.to_string(),
        title: notification.title,
        body: notification.message,
        kind: notification.kind,
        priority: notification.priority,
        created_at: notification.created_at,
        expires_at: notification.expires_at,
        deliveries: attempts
            .into_iter()
            .map(|a| DeliveryRow {
                device_id: a.device_id.to_string(),
                channel: a.channel,
                status: a.status,
                sent_at: a.sent_at,
                delivered_at: a.delivered_at,
                failed_at: a.failed_at,
                retry_count: a.retry_count,
                error_message: a.error_message,
            })
            .collect(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct AckRequest {
    pub notification_id: String,
    pub device_id: String,
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub status: &'static str,
}

/// POST /notifications/ack
pub async fn acknowledge(
    State(state): State<AppState>,
    Json(request): Json<AckRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    let notification_id = NotificationId::from_string(&request.notification_id)
        .ok_or_else(|| invalid("notification_id", "not a uuid"))?;
    let device_id = DeviceId::from_string(&request.device_id)
        .ok_or_else(|| invalid("device_id", "not a uuid"))?;

    state.acks.ack(notification_id, device_id).await?;
    Ok(Json(AckResponse { status: "success" }))
}
