//! Shared types for the realtime socket protocol.
//!
//! Both the server and clients speak the frame types defined here.

pub mod frames;

pub use frames::*;
