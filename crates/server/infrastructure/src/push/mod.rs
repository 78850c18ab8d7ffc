//! Mobile push channel adapters.
//!
//! Both providers implement the domain's `PushAdapter` contract: stateless
//! per notification, a ~10 s timeout per call, safe to retry. Invalid-token
//! responses are distinguished from transient failures so the caller can
//! revoke the stored channel token.

pub mod apns;
pub mod fcm;

pub use apns::ApnsAdapter;
pub use fcm::FcmAdapter;

use courier_server_domain::shared_kernel::{ChannelKind, DomainError};
use std::time::Duration;

/// Shared reqwest client builder for the providers.
pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, DomainError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| DomainError::InfrastructureError {
            message: format!("failed to build push http client: {}", e),
        })
}

/// Maps a transport-level reqwest failure onto the retryable error kind.
pub(crate) fn transport_error(channel: ChannelKind, err: reqwest::Error) -> DomainError {
    DomainError::TransientChannelFailure {
        channel,
        message: err.to_string(),
    }
}
