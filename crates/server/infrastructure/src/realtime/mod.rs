//! Realtime session management.
//!
//! The hub owns every live socket session and is the only mutator of the
//! session indexes; sessions are process-local and die with the process.

pub mod hub;
pub mod metrics;
pub mod reaper;
pub mod session;

pub use hub::{Hub, HubCommand};
pub use metrics::RealtimeMetrics;
pub use reaper::{IdleReaper, IdleReaperConfig};
pub use session::{Session, SessionError, SessionId};
