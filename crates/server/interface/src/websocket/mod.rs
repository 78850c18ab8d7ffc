//! The websocket endpoint carrying live sessions.

pub mod handler;

pub use handler::websocket_handler;
