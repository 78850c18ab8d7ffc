use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Delivery channels a notification can travel over.
///
/// The cascade order is WebSocket first (a live session beats a push
/// provider), then the mobile providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    WebSocket,
    Apns,
    Fcm,
}

impl ChannelKind {
    /// Default cascade order for a submission that does not restrict channels.
    pub fn cascade() -> [ChannelKind; 3] {
        [ChannelKind::WebSocket, ChannelKind::Apns, ChannelKind::Fcm]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::WebSocket => "websocket",
            ChannelKind::Apns => "apns",
            ChannelKind::Fcm => "fcm",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "websocket" => Ok(ChannelKind::WebSocket),
            "apns" => Ok(ChannelKind::Apns),
            "fcm" => Ok(ChannelKind::Fcm),
            other => Err(format!("unknown channel kind: {}", other)),
        }
    }
}

/// Lifecycle of one delivery attempt.
///
/// The status is a strict state machine:
///
/// ```text
/// Pending ──► Sent ──► Delivered            (absorbing)
///    │          │
///    │          └──► Failed ── retry ──► Pending
///    └──► Failed
/// Pending | Sent | Failed ──► Expired       (absorbing, expiry sweep)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
    Expired,
}

impl DeliveryStatus {
    /// Validates a transition against the delivery state machine.
    ///
    /// Delivered and Expired are absorbing; Failed may only go back to
    /// Pending (a retry). A same-state "transition" is not a transition.
    pub fn can_transition_to(&self, new_status: &DeliveryStatus) -> bool {
        match (self, new_status) {
            (s, n) if s == n => false,

            (DeliveryStatus::Pending, DeliveryStatus::Sent) => true,
            (DeliveryStatus::Pending, DeliveryStatus::Failed) => true,
            (DeliveryStatus::Pending, DeliveryStatus::Expired) => true,

            (DeliveryStatus::Sent, DeliveryStatus::Delivered) => true,
            (DeliveryStatus::Sent, DeliveryStatus::Failed) => true,
            (DeliveryStatus::Sent, DeliveryStatus::Expired) => true,

            (DeliveryStatus::Failed, DeliveryStatus::Pending) => true,
            (DeliveryStatus::Failed, DeliveryStatus::Expired) => true,

            _ => false,
        }
    }

    /// Returns true if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Expired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "sent" => Ok(DeliveryStatus::Sent),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "failed" => Ok(DeliveryStatus::Failed),
            "expired" => Ok(DeliveryStatus::Expired),
            other => Err(format!("unknown delivery status: {}", other)),
        }
    }
}

/// Notification categories understood by the channels.
///
/// `System` notifications are delivered silently on the mobile providers
/// (content-available), everything else renders an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Normal,
    Urgent,
    System,
    Message,
}

impl Default for NotificationKind {
    fn default() -> Self {
        NotificationKind::Normal
    }
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Normal => "normal",
            NotificationKind::Urgent => "urgent",
            NotificationKind::System => "system",
            NotificationKind::Message => "message",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(NotificationKind::Normal),
            "urgent" => Ok(NotificationKind::Urgent),
            "system" => Ok(NotificationKind::System),
            "message" => Ok(NotificationKind::Message),
            other => Err(format!("unknown notification kind: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_transitions() {
        let s = DeliveryStatus::Pending;
        assert!(s.can_transition_to(&DeliveryStatus::Sent));
        assert!(s.can_transition_to(&DeliveryStatus::Failed));
        assert!(s.can_transition_to(&DeliveryStatus::Expired));
        assert!(!s.can_transition_to(&DeliveryStatus::Delivered));
        assert!(!s.can_transition_to(&DeliveryStatus::Pending));
    }

    #[test]
    fn test_sent_transitions() {
        let s = DeliveryStatus::Sent;
        assert!(s.can_transition_to(&DeliveryStatus::Delivered));
        assert!(s.can_transition_to(&DeliveryStatus::Failed));
        assert!(s.can_transition_to(&DeliveryStatus::Expired));
        assert!(!s.can_transition_to(&DeliveryStatus::Pending));
    }

    #[test]
    fn test_failed_retries_or_expires() {
        let s = DeliveryStatus::Failed;
        assert!(s.can_transition_to(&DeliveryStatus::Pending));
        assert!(s.can_transition_to(&DeliveryStatus::Expired));
        assert!(!s.can_transition_to(&DeliveryStatus::Sent));
        assert!(!s.can_transition_to(&DeliveryStatus::Delivered));
    }

    #[test]
    fn test_absorbing_states() {
        for s in [DeliveryStatus::Delivered, DeliveryStatus::Expired] {
            assert!(s.is_terminal());
            for n in [
                DeliveryStatus::Pending,
                DeliveryStatus::Sent,
                DeliveryStatus::Delivered,
                DeliveryStatus::Failed,
                DeliveryStatus::Expired,
            ] {
                assert!(!s.can_transition_to(&n), "{} -> {} must be rejected", s, n);
            }
        }
    }

    #[test]
    fn test_status_string_roundtrip() {
        for s in [
            DeliveryStatus::Pending,
            DeliveryStatus::Sent,
            DeliveryStatus::Delivered,
            DeliveryStatus::Failed,
            DeliveryStatus::Expired,
        ] {
            assert_eq!(s.as_str().parse::<DeliveryStatus>().unwrap(), s);
        }
    }

    #[test]
    fn test_channel_kind_roundtrip() {
        for c in ChannelKind::cascade() {
            assert_eq!(c.as_str().parse::<ChannelKind>().unwrap(), c);
        }
        assert!("smtp".parse::<ChannelKind>().is_err());
    }

    #[test]
    fn test_cascade_order_prefers_live_socket() {
        assert_eq!(ChannelKind::cascade()[0], ChannelKind::WebSocket);
    }
}
