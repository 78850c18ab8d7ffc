//! The delivery orchestrator.
//!
//! Turns one submission into per-device delivery attempts, walking the
//! channel cascade for each target: a live socket beats the mobile
//! providers, and the first channel that reaches SENT stops the cascade
//! for that device. Per-device failures never abort the submission; the
//! aggregate outcome reports whether anything went out.

use crate::throttle::SubmissionThrottle;
use chrono::{DateTime, Utc};
use courier_server_domain::deliveries::{
    AckSink, DeliveryAttempt, DeliveryRepository, LivePush, PushAdapter,
};
use courier_server_domain::devices::DeviceRepository;
use courier_server_domain::notifications::{Notification, NotificationRepository};
use courier_server_domain::shared_kernel::{
    ChannelKind, DeliveryStatus, DeviceId, DomainError, NotificationId, NotificationKind, Result,
    UserId,
};
use courier_server_domain::tokens::{ChannelToken, ChannelTokenRepository};
use courier_shared::realtime::ServerFrame;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const NO_LIVE_SESSION: &str = "device not connected";

/// One submission from an upstream caller.
#[derive(Debug, Clone)]
pub struct SubmitNotification {
    pub user_id: UserId,
    pub title: String,
    pub message: String,
    pub data: Value,
    pub kind: NotificationKind,
    pub priority: i32,
    pub sender_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Explicit targets; skips the user→devices lookup when present.
    pub device_ids: Option<Vec<DeviceId>>,
    /// Channel subset to attempt; the full cascade when absent.
    pub channels: Option<Vec<ChannelKind>>,
}

impl SubmitNotification {
    pub fn to_user(
        user_id: impl Into<UserId>,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            title: title.into(),
            message: message.into(),
            data: Value::Object(Default::default()),
            kind: NotificationKind::Normal,
            priority: 0,
            sender_id: None,
            expires_at: None,
            device_ids: None,
            channels: None,
        }
    }
}

/// Aggregate result of a submission.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionOutcome {
    pub notification_id: NotificationId,
    /// True when at least one channel reached SENT for any device.
    pub delivered: bool,
}

/// Orchestrates submissions, acknowledgements and retries.
pub struct DeliveryOrchestrator {
    notifications: Arc<dyn NotificationRepository>,
    deliveries: Arc<dyn DeliveryRepository>,
    devices: Arc<dyn DeviceRepository>,
    tokens: Arc<dyn ChannelTokenRepository>,
    live: Arc<dyn LivePush>,
    adapters: HashMap<ChannelKind, Arc<dyn PushAdapter>>,
    throttle: Option<Arc<SubmissionThrottle>>,
}

impl DeliveryOrchestrator {
    pub fn new(
        notifications: Arc<dyn NotificationRepository>,
        deliveries: Arc<dyn DeliveryRepository>,
        devices: Arc<dyn DeviceRepository>,
        tokens: Arc<dyn ChannelTokenRepository>,
        live: Arc<dyn LivePush>,
        push_adapters: Vec<Arc<dyn PushAdapter>>,
    ) -> Self {
        let adapters = push_adapters
            .into_iter()
            .map(|adapter| (adapter.kind(), adapter))
            .collect();
        Self {
            notifications,
            deliveries,
            devices,
            tokens,
            live,
            adapters,
            throttle: None,
        }
    }

    pub fn with_throttle(mut self, throttle: Arc<SubmissionThrottle>) -> Self {
        self.throttle = Some(throttle);
        self
    }

    /// Fans one submission out to every target device.
    pub async fn submit(&self, request: SubmitNotification) -> Result<SubmissionOutcome> {
        if let Some(throttle) = &self.throttle {
            if !throttle.allow_user(request.user_id.as_str()) {
                return Err(DomainError::RateLimited {
                    key: request.user_id.to_string(),
                });
            }
        }

        let mut notification = Notification::new(
            request.user_id.clone(),
            request.title,
            request.message,
            request.data,
            request.kind,
        )?
        .with_priority(request.priority);
        if let Some(sender_id) = request.sender_id {
            notification = notification.with_sender(sender_id);
        }
        if let Some(expires_at) = request.expires_at {
            // An already-expired submission is still accepted; the expiry
            // sweep moves its rows to EXPIRED on the next pass.
            notification = notification.with_expiry(expires_at);
        }

        // Persisting the notification is the only fatal step.
        self.notifications.save(&notification).await?;

        let targets = match request.device_ids {
            Some(device_ids) => self.resolve_explicit_targets(device_ids).await,
            None => {
                let devices = self.devices.find_by_user(&request.user_id).await?;
                if devices.is_empty() {
                    return Err(DomainError::NoTargets {
                        user_id: request.user_id,
                    });
                }
                devices.into_iter().map(|d| d.id).collect()
            }
        };

        let cascade = cascade_for(request.channels.as_deref());

        let mut delivered = false;
        for device_id in targets {
            if self
                .deliver_to_device(&notification, device_id, &cascade)
                .await
            {
                delivered = true;
            }
        }

        if !delivered {
            return Err(DomainError::DeliveryFailedAllChannels {
                notification_id: notification.id,
            });
        }

        info!(notification_id = %notification.id, "notification submitted");
        Ok(SubmissionOutcome {
            notification_id: notification.id,
            delivered,
        })
    }

    async fn resolve_explicit_targets(&self, device_ids: Vec<DeviceId>) -> Vec<DeviceId> {
        let mut targets = Vec::with_capacity(device_ids.len());
        for device_id in device_ids {
            match self.devices.find_by_id(&device_id).await {
                Ok(Some(device)) if device.is_active() => targets.push(device_id),
                Ok(_) => warn!(%device_id, "skipping unknown or deleted device"),
                Err(err) => warn!(%device_id, error = %err, "device lookup failed"),
            }
        }
        targets
    }

    /// Walks the cascade for one device; true when one channel reached SENT.
    async fn deliver_to_device(
        &self,
        notification: &Notification,
        device_id: DeviceId,
        cascade: &[ChannelKind],
    ) -> bool {
        for channel in cascade {
            match channel {
                ChannelKind::WebSocket => {
                    match self.attempt_live_socket(notification, device_id).await {
                        Ok(true) => return true,
                        Ok(false) => {}
                        Err(err) => {
                            warn!(%device_id, error = %err, "live socket attempt failed");
                        }
                    }
                }
                kind => match self.attempt_push(notification, device_id, *kind).await {
                    Ok(true) => return true,
                    Ok(false) => {}
                    Err(err) => {
                        warn!(%device_id, channel = %kind, error = %err, "push attempt failed");
                    }
                },
            }
        }
        false
    }

    /// Live socket leg of the cascade. A tracking row is always written so
    /// the cascade decision is auditable.
    async fn attempt_live_socket(
        &self,
        notification: &Notification,
        device_id: DeviceId,
    ) -> Result<bool> {
        let attempt = DeliveryAttempt::new(notification.id, device_id, ChannelKind::WebSocket);
        self.deliveries.create(&attempt).await?;

        if !self.live.is_device_connected(&device_id) {
            self.deliveries.mark_failed(&attempt.id, NO_LIVE_SESSION).await?;
            return Ok(false);
        }

        let frame = notification_frame(notification).to_json();
        if self.live.send_to_device(&device_id, frame).await {
            self.deliveries.mark_sent(&attempt.id, None).await?;
            debug!(%device_id, notification_id = %notification.id, "pushed over live socket");
            Ok(true)
        } else {
            self.deliveries.mark_failed(&attempt.id, NO_LIVE_SESSION).await?;
            Ok(false)
        }
    }

    /// Mobile provider leg. No channel token means the channel is skipped
    /// without a tracking row.
    async fn attempt_push(
        &self,
        notification: &Notification,
        device_id: DeviceId,
        kind: ChannelKind,
    ) -> Result<bool> {
        let Some(adapter) = self.adapters.get(&kind) else {
            return Ok(false);
        };
        let Some(token) = self.tokens.find_active(&device_id, kind).await? else {
            return Ok(false);
        };

        let attempt = DeliveryAttempt::new(notification.id, device_id, kind);
        self.deliveries.create(&attempt).await?;

        match adapter.send(&token.value, notification).await {
            Ok(receipt) => {
                self.deliveries
                    .mark_sent(&attempt.id, Some(&receipt.message_id))
                    .await?;
                if let Some(canonical) = receipt.canonical_token {
                    self.rotate_token(&token, canonical).await;
                }
                debug!(%device_id, channel = %kind, "pushed via provider");
                Ok(true)
            }
            Err(err) => {
                self.deliveries
                    .mark_failed(&attempt.id, &err.to_string())
                    .await?;
                if let DomainError::InvalidToken { reason } = &err {
                    warn!(%device_id, channel = %kind, %reason, "revoking rejected channel token");
                    if let Err(revoke_err) = self.tokens.revoke(&token.id).await {
                        warn!(error = %revoke_err, "failed to revoke channel token");
                    }
                }
                Ok(false)
            }
        }
    }

    async fn rotate_token(&self, token: &ChannelToken, canonical: String) {
        let mut rotated = token.clone();
        rotated.rotate(canonical);
        if let Err(err) = self.tokens.upsert(&rotated).await {
            warn!(device_id = %token.device_id, error = %err, "failed to rotate channel token");
        }
    }

    /// Confirms receipt of a notification on a device.
    ///
    /// Idempotent: a second ack for the same pair is a no-op, and an ack
    /// that outruns the tracking row creates the row pre-marked DELIVERED.
    pub async fn acknowledge(
        &self,
        notification_id: NotificationId,
        device_id: DeviceId,
    ) -> Result<()> {
        match self
            .deliveries
            .find_for_ack(&notification_id, &device_id)
            .await?
        {
            Some(attempt) => match attempt.status {
                DeliveryStatus::Sent => self.deliveries.mark_delivered(&attempt.id).await,
                DeliveryStatus::Delivered => Ok(()),
                DeliveryStatus::Pending => {
                    // The ack outran the orchestrator's own SENT update;
                    // the frame evidently arrived.
                    self.deliveries.mark_sent(&attempt.id, None).await?;
                    self.deliveries.mark_delivered(&attempt.id).await
                }
                DeliveryStatus::Failed => {
                    // The device confirms receipt despite the recorded
                    // failure; walk the retry edge straight to delivered.
                    self.deliveries.mark_retrying(&attempt.id).await?;
                    self.deliveries.mark_sent(&attempt.id, None).await?;
                    self.deliveries.mark_delivered(&attempt.id).await
                }
                DeliveryStatus::Expired => {
                    warn!(
                        %notification_id, %device_id,
                        "ack for an expired delivery, ignoring"
                    );
                    Ok(())
                }
            },
            None => {
                let mut attempt =
                    DeliveryAttempt::new(notification_id, device_id, ChannelKind::WebSocket);
                attempt.mark_sent(None)?;
                attempt.mark_delivered()?;
                self.deliveries.create_delivered(&attempt).await
            }
        }
    }

    /// Notification plus its per-device delivery rows, for the status API.
    pub async fn delivery_status(
        &self,
        notification_id: NotificationId,
    ) -> Result<(Notification, Vec<DeliveryAttempt>)> {
        let notification = self
            .notifications
            .find_by_id(&notification_id)
            .await?
            .ok_or(DomainError::NotificationNotFound { notification_id })?;
        let attempts = self.deliveries.find_by_notification(&notification_id).await?;
        Ok((notification, attempts))
    }

    /// Re-runs the channel send for a failed attempt. Called by the retry
    /// scheduler; a row that moved to DELIVERED in the meantime is left
    /// alone (DELIVERED is absorbing).
    pub async fn retry_attempt(&self, attempt: &DeliveryAttempt) -> Result<()> {
        let notification = self
            .notifications
            .find_by_id(&attempt.notification_id)
            .await?
            .ok_or(DomainError::NotificationNotFound {
                notification_id: attempt.notification_id,
            })?;

        if notification.is_expired() {
            self.deliveries
                .expire_for_notification(&notification.id)
                .await?;
            return Ok(());
        }

        // Failed → Pending; refuses if a concurrent ack already delivered.
        self.deliveries.mark_retrying(&attempt.id).await?;

        match attempt.channel {
            ChannelKind::WebSocket => {
                let frame = notification_frame(&notification).to_json();
                if self.live.is_device_connected(&attempt.device_id)
                    && self.live.send_to_device(&attempt.device_id, frame).await
                {
                    self.deliveries.mark_sent(&attempt.id, None).await
                } else {
                    self.deliveries
                        .mark_failed(&attempt.id, NO_LIVE_SESSION)
                        .await?;
                    Err(DomainError::TransientChannelFailure {
                        channel: ChannelKind::WebSocket,
                        message: NO_LIVE_SESSION.to_string(),
                    })
                }
            }
            kind => {
                let Some(adapter) = self.adapters.get(&kind) else {
                    let message = format!("no adapter configured for {}", kind);
                    self.deliveries.mark_failed(&attempt.id, &message).await?;
                    return Err(DomainError::TransientChannelFailure {
                        channel: kind,
                        message,
                    });
                };
                let Some(token) = self.tokens.find_active(&attempt.device_id, kind).await? else {
                    let message = format!("no active {} token", kind);
                    self.deliveries.mark_failed(&attempt.id, &message).await?;
                    return Err(DomainError::TransientChannelFailure {
                        channel: kind,
                        message,
                    });
                };

                match adapter.send(&token.value, &notification).await {
                    Ok(receipt) => {
                        self.deliveries
                            .mark_sent(&attempt.id, Some(&receipt.message_id))
                            .await?;
                        if let Some(canonical) = receipt.canonical_token {
                            self.rotate_token(&token, canonical).await;
                        }
                        Ok(())
                    }
                    Err(err) => {
                        self.deliveries
                            .mark_failed(&attempt.id, &err.to_string())
                            .await?;
                        Err(err)
                    }
                }
            }
        }
    }
}

#[async_trait]
impl AckSink for DeliveryOrchestrator {
    async fn ack(&self, notification_id: NotificationId, device_id: DeviceId) -> Result<()> {
        self.acknowledge(notification_id, device_id).await
    }
}

/// The ordered channel list for one submission. An explicit subset keeps
/// its given order; the default is the full cascade.
fn cascade_for(channels: Option<&[ChannelKind]>) -> Vec<ChannelKind> {
    match channels {
        Some(subset) if !subset.is_empty() => {
            let mut seen = Vec::new();
            for channel in subset {
                if !seen.contains(channel) {
                    seen.push(*channel);
                }
            }
            seen
        }
        _ => ChannelKind::cascade().to_vec(),
    }
}

/// The socket frame for a notification push.
pub fn notification_frame(notification: &Notification) -> ServerFrame {
    ServerFrame::Notification {
        notification_id: notification.id.to_string(),
        title: notification.title.clone(),
        message: notification.message.clone(),
        data: notification.data_map(),
        timestamp: notification.created_at.timestamp(),
    }
}
