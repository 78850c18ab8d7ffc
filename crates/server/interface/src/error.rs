//! HTTP error mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use courier_server_domain::shared_kernel::DomainError;
use serde::Serialize;

/// Wire shape of an error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

/// Wraps a domain error for axum.
#[derive(Debug)]
pub struct ApiError(pub DomainError);

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn kind(&self) -> &'static str {
        match &self.0 {
            DomainError::InvalidInput { .. } => "invalid_input",
            DomainError::Unauthenticated => "unauthenticated",
            DomainError::CredentialExpired => "credential_expired",
            DomainError::CredentialInvalid { .. } => "credential_invalid",
            DomainError::DeviceNotFound { .. } => "device_not_found",
            DomainError::NotificationNotFound { .. } => "notification_not_found",
            DomainError::DeliveryNotFound { .. } => "delivery_not_found",
            DomainError::NoTargets { .. } => "no_targets",
            DomainError::DeliveryFailedAllChannels { .. } => "delivery_failed_all_channels",
            DomainError::InvalidToken { .. } => "invalid_token",
            DomainError::TransientChannelFailure { .. } => "transient_channel_failure",
            DomainError::RateLimited { .. } => "rate_limited",
            DomainError::InvalidStateTransition { .. } => "invalid_state_transition",
            DomainError::Shutdown => "shutdown",
            DomainError::InfrastructureError { .. } => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match &self.0 {
            DomainError::InvalidInput { .. } => StatusCode::BAD_REQUEST,
            DomainError::Unauthenticated
            | DomainError::CredentialExpired
            | DomainError::CredentialInvalid { .. } => StatusCode::UNAUTHORIZED,
            DomainError::DeviceNotFound { .. }
            | DomainError::NotificationNotFound { .. }
            | DomainError::DeliveryNotFound { .. }
            | DomainError::NoTargets { .. } => StatusCode::NOT_FOUND,
            DomainError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            DomainError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
            DomainError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
            DomainError::DeliveryFailedAllChannels { .. }
            | DomainError::InvalidToken { .. }
            | DomainError::TransientChannelFailure { .. } => StatusCode::BAD_GATEWAY,
            DomainError::InfrastructureError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.kind(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
