//! Courier interface layer.
//!
//! The HTTP ingress (submissions, status, device lifecycle) and the
//! websocket endpoint that carries live sessions.

pub mod error;
pub mod http;
pub mod websocket;

pub use http::{AppState, router};
