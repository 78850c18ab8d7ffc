//! Courier infrastructure layer.
//!
//! Adapters for the ports defined in the domain crate: the realtime session
//! hub, the mobile push providers, and PostgreSQL persistence (plus
//! in-memory repositories for tests).

pub mod persistence;
pub mod push;
pub mod realtime;
