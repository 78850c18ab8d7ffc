//! Socket frame types.
//!
//! Every frame is a JSON object with a `type` discriminator. Client frames
//! carry their fields inside a `payload` object; server frames are flat.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Application-level keepalive; answered with [`ServerFrame::Pong`].
    Ping,

    /// Confirms receipt of a notification on the sending device.
    Ack { notification_id: String },

    /// Asks the server to re-issue the session credential.
    TokenRefresh { token: String },
}

/// Frames pushed from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Reply to a client ping; `timestamp` is RFC 3339.
    Pong { timestamp: String },

    /// Reply to a token refresh request.
    TokenRefreshResponse { token: String, success: bool },

    /// A pushed notification; `timestamp` is Unix seconds.
    Notification {
        notification_id: String,
        title: String,
        message: String,
        data: Value,
        timestamp: i64,
    },
}

impl ServerFrame {
    pub fn to_json(&self) -> String {
        // The frame enums only contain JSON-representable fields.
        serde_json::to_string(self).expect("server frame serializes")
    }
}
