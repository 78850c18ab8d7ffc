//! One socket session.
//!
//! A session is the process-local state behind one bidirectional socket:
//! identity, the originating credential, a bounded outbound frame channel
//! and the activity clock. The read loop is the only writer of the clock;
//! the idle reaper reads it.

use crate::realtime::metrics::RealtimeMetrics;
use courier_shared::{DeviceId, UserId};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use uuid::Uuid;

pub type SessionId = Uuid;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SessionError {
    /// Outbound buffer is full; the hub disconnects instead of blocking.
    #[error("outbound buffer full")]
    Backpressure,

    #[error("session closed")]
    Closed,
}

/// Live state of one connected socket.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    device_id: DeviceId,
    device_identifier: String,
    user_id: Option<UserId>,
    /// Rotates in place on a successful token refresh.
    credential: RwLock<String>,
    outbound: mpsc::Sender<String>,
    /// Unix milliseconds of the last inbound activity.
    last_activity: AtomicI64,
    closed: AtomicBool,
    close_signal: Notify,
    metrics: RealtimeMetrics,
}

impl Session {
    pub fn new(
        device_id: DeviceId,
        device_identifier: impl Into<String>,
        user_id: Option<UserId>,
        credential: impl Into<String>,
        outbound: mpsc::Sender<String>,
        metrics: RealtimeMetrics,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id,
            device_identifier: device_identifier.into(),
            user_id,
            credential: RwLock::new(credential.into()),
            outbound,
            last_activity: AtomicI64::new(Utc::now().timestamp_millis()),
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
            metrics,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn device_identifier(&self) -> &str {
        &self.device_identifier
    }

    pub fn user_id(&self) -> Option<&UserId> {
        self.user_id.as_ref()
    }

    pub fn credential(&self) -> String {
        self.credential.read().unwrap().clone()
    }

    pub fn rotate_credential(&self, new_credential: impl Into<String>) {
        *self.credential.write().unwrap() = new_credential.into();
    }

    /// Non-blocking enqueue onto the outbound channel.
    ///
    /// A frame either lands in the channel (and will be written by the
    /// write loop) or the call fails loudly; nothing is dropped silently.
    pub fn try_send(&self, frame: String) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        match self.outbound.try_send(frame) {
            Ok(()) => {
                self.metrics.record_frame_sent();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.record_backpressure();
                self.metrics.record_frame_dropped();
                Err(SessionError::Backpressure)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.metrics.record_frame_dropped();
                Err(SessionError::Closed)
            }
        }
    }

    /// Records inbound activity. Called from the read loop only.
    pub fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        let millis = self.last_activity.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now)
    }

    pub fn idle_for(&self) -> Duration {
        let elapsed = Utc::now().timestamp_millis() - self.last_activity.load(Ordering::Relaxed);
        Duration::from_millis(elapsed.max(0) as u64)
    }

    /// Tells the socket loops to tear the connection down. Called by the
    /// hub on unregister; further sends fail with [`SessionError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_signal.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once [`Session::close`] has been called.
    pub async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.close_signal.notified().await;
    }
}
