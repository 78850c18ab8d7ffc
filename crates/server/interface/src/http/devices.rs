//! Device lifecycle handlers: register, link, channel token upsert and
//! credential renewal.

use crate::error::ApiError;
use crate::http::AppState;
use axum::Json;
use axum::extract::State;
use courier_server_domain::iam::CredentialKind;
use courier_server_domain::shared_kernel::{ChannelKind, DeviceId, DomainError, UserId};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

fn invalid(field: &str, reason: impl Into<String>) -> ApiError {
    ApiError(DomainError::InvalidInput {
        field: field.to_string(),
        reason: reason.into(),
    })
}

fn kind_label(kind: CredentialKind) -> &'static str {
    match kind {
        CredentialKind::Temporary => "temporary",
        CredentialKind::Permanent => "permanent",
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub device_identifier: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub device_id: String,
    pub token: String,
    pub is_verified: bool,
}

/// POST /devices/register
pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let user_id = request
        .user_id
        .filter(|u| !u.is_empty())
        .map(UserId::from);

    let registered = state
        .device_service
        .register(&request.device_identifier, user_id, request.model)
        .await?;

    Ok(Json(RegisterResponse {
        device_id: registered.device.id.to_string(),
        token: registered.credential,
        is_verified: registered.device.verified,
    }))
}

#[derive(Debug, Deserialize)]
pub struct LinkRequest {
    pub device_id: String,
    pub user_id: String,
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct LinkResponse {
    pub token: String,
}

/// POST /devices/link
pub async fn link(
    State(state): State<AppState>,
    Json(request): Json<LinkRequest>,
) -> Result<Json<LinkResponse>, ApiError> {
    let device_id = DeviceId::from_string(&request.device_id)
        .ok_or_else(|| invalid("device_id", "not a uuid"))?;
    if request.user_id.is_empty() {
        return Err(invalid("user_id", "must not be empty"));
    }

    let token = state
        .device_service
        .link(device_id, UserId::from(request.user_id), &request.token)
        .await?;

    Ok(Json(LinkResponse { token }))
}

#[derive(Debug, Deserialize)]
pub struct UpdateTokenRequest {
    pub device_id: String,
    pub token: String,
    pub token_type: String,
}

#[derive(Debug, Serialize)]
pub struct UpdateTokenResponse {
    pub status: &'static str,
}

/// POST /devices/token
pub async fn update_token(
    State(state): State<AppState>,
    Json(request): Json<UpdateTokenRequest>,
) -> Result<Json<UpdateTokenResponse>, ApiError> {
    let device_id = DeviceId::from_string(&request.device_id)
        .ok_or_else(|| invalid("device_id", "not a uuid"))?;
    let kind = ChannelKind::from_str(&request.token_type)
        .map_err(|e| invalid("token_type", e))?;

    state
        .device_service
        .update_channel_token(device_id, &request.token, kind)
        .await?;

    Ok(Json(UpdateTokenResponse { status: "success" }))
}

#[derive(Debug, Deserialize)]
pub struct RenewRequest {
    pub token: String,
    #[serde(default)]
    pub force_temporary: bool,
}

#[derive(Debug, Serialize)]
pub struct RenewResponse {
    pub token: String,
    pub token_type: &'static str,
}

/// POST /tokens/renew
pub async fn renew(
    State(state): State<AppState>,
    Json(request): Json<RenewRequest>,
) -> Result<Json<RenewResponse>, ApiError> {
    if request.token.is_empty() {
        return Err(invalid("token", "must not be empty"));
    }

    let renewed = state
        .device_service
        .renew_credential(&request.token, request.force_temporary)
        .await?;

    Ok(Json(RenewResponse {
        token: renewed.credential,
        token_type: kind_label(renewed.credential_kind),
    }))
}
