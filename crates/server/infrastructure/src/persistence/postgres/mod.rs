//! PostgreSQL repositories.
//!
//! Every operation is a single statement; state transitions are enforced
//! with conditional updates so they stay linearizable at the row level.

pub mod delivery_repository;
pub mod device_repository;
pub mod migrations;
pub mod notification_repository;
pub mod pool;
pub mod queue_repository;
pub mod token_repository;

pub use delivery_repository::PostgresDeliveryRepository;
pub use device_repository::PostgresDeviceRepository;
pub use notification_repository::PostgresNotificationRepository;
pub use pool::connect_pool;
pub use queue_repository::PostgresQueueRepository;
pub use token_repository::PostgresChannelTokenRepository;

use courier_server_domain::shared_kernel::DomainError;

/// Uniform mapping of driver failures onto the domain error type.
pub(crate) fn db_error(context: &str, err: sqlx::Error) -> DomainError {
    DomainError::InfrastructureError {
        message: format!("{}: {}", context, err),
    }
}
