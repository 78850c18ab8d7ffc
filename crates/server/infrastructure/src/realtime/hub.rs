//! The session hub.
//!
//! One hub per process. A single worker services the command channel, so
//! index mutation is serialized without explicit locking; query and send
//! paths read the dashmap indexes concurrently.
//!
//! Outbound pushes never block: a session whose buffer is full is routed
//! through the unregister channel and disconnected.

use crate::realtime::metrics::RealtimeMetrics;
use crate::realtime::session::{Session, SessionError, SessionId};
use async_trait::async_trait;
use courier_server_domain::deliveries::LivePush;
use courier_shared::{DeviceId, UserId};
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const HUB_COMMAND_BUFFER: usize = 1024;

/// Commands serviced by the hub's single owner loop.
#[derive(Debug)]
pub enum HubCommand {
    Register(Arc<Session>),
    Unregister(SessionId),
    Broadcast(String),
    Shutdown,
}

/// Registry of every live session, indexed by session, device and user.
#[derive(Debug)]
pub struct Hub {
    sessions: DashMap<SessionId, Arc<Session>>,
    device_index: DashMap<DeviceId, DashSet<SessionId>>,
    user_index: DashMap<UserId, DashSet<SessionId>>,
    commands: mpsc::Sender<HubCommand>,
    metrics: RealtimeMetrics,
}

impl Hub {
    /// Creates the hub and the command receiver its owner loop consumes.
    pub fn new(metrics: RealtimeMetrics) -> (Arc<Self>, mpsc::Receiver<HubCommand>) {
        let (commands, rx) = mpsc::channel(HUB_COMMAND_BUFFER);
        let hub = Arc::new(Self {
            sessions: DashMap::new(),
            device_index: DashMap::new(),
            user_index: DashMap::new(),
            commands,
            metrics,
        });
        (hub, rx)
    }

    /// The single-owner loop. Exactly one task runs this; it is the only
    /// place the indexes are mutated.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<HubCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                HubCommand::Register(session) => self.apply_register(session),
                HubCommand::Unregister(session_id) => self.apply_unregister(&session_id),
                HubCommand::Broadcast(frame) => self.apply_broadcast(frame),
                HubCommand::Shutdown => {
                    self.apply_shutdown();
                    break;
                }
            }
        }
        info!("session hub stopped");
    }

    fn apply_register(&self, session: Arc<Session>) {
        let session_id = session.id();
        if self.sessions.insert(session_id, session.clone()).is_some() {
            // Idempotent: re-registering the same id only refreshes indexes.
            debug!(%session_id, "session re-registered");
        } else {
            self.metrics.session_opened();
        }

        self.device_index
            .entry(session.device_id())
            .or_default()
            .insert(session_id);

        if let Some(user_id) = session.user_id() {
            self.user_index
                .entry(user_id.clone())
                .or_default()
                .insert(session_id);
        }

        debug!(%session_id, device_id = %session.device_id(), "session registered");
    }

    fn apply_unregister(&self, session_id: &SessionId) {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return;
        };

        if let Some(entry) = self.device_index.get_mut(&session.device_id()) {
            entry.remove(session_id);
            let empty = entry.is_empty();
            drop(entry);
            if empty {
                self.device_index
                    .remove_if(&session.device_id(), |_, set| set.is_empty());
            }
        }

        if let Some(user_id) = session.user_id() {
            if let Some(entry) = self.user_index.get_mut(user_id) {
                entry.remove(session_id);
                let empty = entry.is_empty();
                drop(entry);
                if empty {
                    self.user_index.remove_if(user_id, |_, set| set.is_empty());
                }
            }
        }

        session.close();
        self.metrics.session_closed();
        debug!(%session_id, device_id = %session.device_id(), "session unregistered");
    }

    fn apply_broadcast(&self, frame: String) {
        for entry in self.sessions.iter() {
            if let Err(SessionError::Backpressure) = entry.value().try_send(frame.clone()) {
                self.request_unregister(entry.value().id());
            }
        }
    }

    fn apply_shutdown(&self) {
        let count = self.sessions.len();
        for entry in self.sessions.iter() {
            entry.value().close();
            self.metrics.session_closed();
        }
        self.sessions.clear();
        self.device_index.clear();
        self.user_index.clear();
        info!(closed = count, "session hub shut down");
    }

    /// Queues a disconnect without mutating indexes on the caller's task.
    fn request_unregister(&self, session_id: SessionId) {
        if self
            .commands
            .try_send(HubCommand::Unregister(session_id))
            .is_err()
        {
            warn!(%session_id, "hub command channel saturated, dropping unregister");
        }
    }

    pub async fn register(&self, session: Arc<Session>) {
        let _ = self.commands.send(HubCommand::Register(session)).await;
    }

    pub async fn unregister(&self, session_id: SessionId) {
        let _ = self.commands.send(HubCommand::Unregister(session_id)).await;
    }

    pub async fn broadcast(&self, frame: String) {
        let _ = self.commands.send(HubCommand::Broadcast(frame)).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(HubCommand::Shutdown).await;
    }

    /// Best-effort push to every session of the device. True when at least
    /// one session accepted the frame.
    pub fn push_to_device(&self, device_id: &DeviceId, frame: &str) -> bool {
        let Some(session_ids) = self
            .device_index
            .get(device_id)
            .map(|set| set.iter().map(|id| *id).collect::<Vec<_>>())
        else {
            return false;
        };

        self.push_to_sessions(&session_ids, frame)
    }

    /// Best-effort push to every session of the user.
    pub fn push_to_user(&self, user_id: &UserId, frame: &str) -> bool {
        let Some(session_ids) = self
            .user_index
            .get(user_id)
            .map(|set| set.iter().map(|id| *id).collect::<Vec<_>>())
        else {
            return false;
        };

        self.push_to_sessions(&session_ids, frame)
    }

    fn push_to_sessions(&self, session_ids: &[SessionId], frame: &str) -> bool {
        let mut sent_any = false;
        for session_id in session_ids {
            let Some(session) = self.sessions.get(session_id).map(|s| s.clone()) else {
                continue;
            };
            match session.try_send(frame.to_string()) {
                Ok(()) => sent_any = true,
                Err(SessionError::Backpressure) => {
                    warn!(%session_id, "session buffer full, disconnecting");
                    self.request_unregister(*session_id);
                }
                Err(SessionError::Closed) => {
                    self.request_unregister(*session_id);
                }
            }
        }
        sent_any
    }

    pub fn device_connected(&self, device_id: &DeviceId) -> bool {
        self.device_index
            .get(device_id)
            .map(|set| !set.is_empty())
            .unwrap_or(false)
    }

    pub fn user_connected(&self, user_id: &UserId) -> bool {
        self.user_index
            .get(user_id)
            .map(|set| !set.is_empty())
            .unwrap_or(false)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// A point-in-time copy of the session set; the idle reaper walks this
    /// instead of holding any map guard.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn metrics(&self) -> &RealtimeMetrics {
        &self.metrics
    }
}

#[async_trait]
impl LivePush for Hub {
    fn is_device_connected(&self, device_id: &DeviceId) -> bool {
        self.device_connected(device_id)
    }

    fn is_user_connected(&self, user_id: &UserId) -> bool {
        self.user_connected(user_id)
    }

    async fn send_to_device(&self, device_id: &DeviceId, frame: String) -> bool {
        self.push_to_device(device_id, &frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn spawn_hub() -> Arc<Hub> {
        let (hub, rx) = Hub::new(RealtimeMetrics::new());
        tokio::spawn(hub.clone().run(rx));
        hub
    }

    fn session(
        device_id: DeviceId,
        user_id: Option<UserId>,
        capacity: usize,
    ) -> (Arc<Session>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        let session = Arc::new(Session::new(
            device_id,
            "hw",
            user_id,
            "credential",
            tx,
            RealtimeMetrics::new(),
        ));
        (session, rx)
    }

    async fn settle() {
        // Let the hub's owner loop drain its command channel.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_register_indexes_by_device_and_user() {
        let hub = spawn_hub();
        let device_id = DeviceId::new();
        let (session, _rx) = session(device_id, Some(UserId::from("7")), 8);

        hub.register(session).await;
        settle().await;

        assert!(hub.device_connected(&device_id));
        assert!(hub.user_connected(&UserId::from("7")));
        assert_eq!(hub.session_count(), 1);
    }

    #[tokio::test]
    async fn test_unregister_clears_indexes_and_closes() {
        let hub = spawn_hub();
        let device_id = DeviceId::new();
        let (session, _rx) = session(device_id, Some(UserId::from("7")), 8);
        let session_id = session.id();

        hub.register(session.clone()).await;
        settle().await;
        hub.unregister(session_id).await;
        settle().await;

        assert!(!hub.device_connected(&device_id));
        assert!(!hub.user_connected(&UserId::from("7")));
        assert!(session.is_closed());
        assert_eq!(hub.session_count(), 0);
    }

    #[tokio::test]
    async fn test_send_to_device_reaches_every_session() {
        let hub = spawn_hub();
        let device_id = DeviceId::new();
        let (first, mut rx1) = session(device_id, None, 8);
        let (second, mut rx2) = session(device_id, None, 8);

        hub.register(first).await;
        hub.register(second).await;
        settle().await;

        assert!(hub.push_to_device(&device_id, "frame"));
        assert_eq!(rx1.recv().await.unwrap(), "frame");
        assert_eq!(rx2.recv().await.unwrap(), "frame");
    }

    #[tokio::test]
    async fn test_send_to_user_reaches_all_user_sessions() {
        let hub = spawn_hub();
        let user = UserId::from("7");
        let (first, mut rx1) = session(DeviceId::new(), Some(user.clone()), 8);
        let (second, mut rx2) = session(DeviceId::new(), Some(user.clone()), 8);
        let (other, mut rx3) = session(DeviceId::new(), Some(UserId::from("8")), 8);

        hub.register(first).await;
        hub.register(second).await;
        hub.register(other).await;
        settle().await;

        assert!(hub.push_to_user(&user, "frame"));
        assert_eq!(rx1.recv().await.unwrap(), "frame");
        assert_eq!(rx2.recv().await.unwrap(), "frame");
        assert!(rx3.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_unknown_device_is_false() {
        let hub = spawn_hub();
        assert!(!hub.push_to_device(&DeviceId::new(), "frame"));
    }

    #[tokio::test]
    async fn test_full_buffer_disconnects_session() {
        let hub = spawn_hub();
        let device_id = DeviceId::new();
        let (session, _rx) = session(device_id, None, 1);

        hub.register(session).await;
        settle().await;

        // First frame fills the buffer; the second trips backpressure and
        // the hub disconnects the session rather than blocking.
        assert!(hub.push_to_device(&device_id, "one"));
        assert!(!hub.push_to_device(&device_id, "two"));
        settle().await;

        assert!(!hub.device_connected(&device_id));
        assert_eq!(hub.session_count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_fans_out() {
        let hub = spawn_hub();
        let (first, mut rx1) = session(DeviceId::new(), None, 8);
        let (second, mut rx2) = session(DeviceId::new(), None, 8);

        hub.register(first).await;
        hub.register(second).await;
        settle().await;

        hub.broadcast("hello".to_string()).await;

        let one = timeout(Duration::from_secs(1), rx1.recv()).await.unwrap();
        let two = timeout(Duration::from_secs(1), rx2.recv()).await.unwrap();
        assert_eq!(one.unwrap(), "hello");
        assert_eq!(two.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let hub = spawn_hub();
        let (session, _rx) = session(DeviceId::new(), None, 8);
        hub.register(session.clone()).await;
        settle().await;

        hub.shutdown().await;
        settle().await;

        assert!(session.is_closed());
        assert_eq!(hub.session_count(), 0);
    }

    #[tokio::test]
    async fn test_multiple_sessions_per_device_counted_once() {
        let hub = spawn_hub();
        let device_id = DeviceId::new();
        let (first, _rx1) = session(device_id, None, 8);
        let (second, _rx2) = session(device_id, None, 8);
        let first_id = first.id();

        hub.register(first).await;
        hub.register(second).await;
        settle().await;
        assert!(hub.device_connected(&device_id));

        hub.unregister(first_id).await;
        settle().await;
        // The second session keeps the device reachable.
        assert!(hub.device_connected(&device_id));
    }
}
