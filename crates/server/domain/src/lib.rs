//! Courier domain layer.
//!
//! Entities, repository ports and the credential authority. Nothing here
//! touches a socket, a database or an HTTP client; infrastructure adapters
//! implement the ports defined in these modules.

pub mod deliveries;
pub mod devices;
pub mod iam;
pub mod notifications;
pub mod queue;
pub mod retry;
pub mod shared_kernel;
pub mod tokens;
