//! Courier application layer.
//!
//! Use cases wired over the domain ports: the delivery orchestrator, the
//! retry scheduler with its dead letter store, the expiry sweep, device and
//! credential flows, and submission throttling.

pub mod delivery;
pub mod devices;
pub mod throttle;
