pub use courier_shared::*;

/// Domain errors
#[derive(thiserror::Error, Debug)]
pub enum DomainError {
    #[error("Invalid input for {field}: {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("Missing or unusable credential")]
    Unauthenticated,

    #[error("Credential has expired")]
    CredentialExpired,

    #[error("Invalid credential: {message}")]
    CredentialInvalid { message: String },

    #[error("Device not found: {device_id}")]
    DeviceNotFound { device_id: DeviceId },

    #[error("Notification not found: {notification_id}")]
    NotificationNotFound { notification_id: NotificationId },

    #[error("Delivery record not found: {delivery_id}")]
    DeliveryNotFound { delivery_id: DeliveryId },

    #[error("User {user_id} has no registered devices")]
    NoTargets { user_id: UserId },

    #[error("Every channel attempt failed for notification {notification_id}")]
    DeliveryFailedAllChannels { notification_id: NotificationId },

    #[error("Push provider rejected the channel token: {reason}")]
    InvalidToken { reason: String },

    #[error("Transient failure on {channel}: {message}")]
    TransientChannelFailure {
        channel: ChannelKind,
        message: String,
    },

    #[error("Rate limited: {key}")]
    RateLimited { key: String },

    #[error("Invalid delivery state transition from {from} to {to} for {delivery_id}")]
    InvalidStateTransition {
        delivery_id: DeliveryId,
        from: DeliveryStatus,
        to: DeliveryStatus,
    },

    #[error("Service is shutting down")]
    Shutdown,

    #[error("Infrastructure error: {message}")]
    InfrastructureError { message: String },
}

impl DomainError {
    /// Transient errors are eligible for the retry scheduler; everything
    /// else is permanent from the delivery engine's point of view.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DomainError::TransientChannelFailure { .. } | DomainError::InfrastructureError { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, DomainError>;
