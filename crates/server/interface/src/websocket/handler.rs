//! Socket admission and the per-session read/write loops.
//!
//! Admission: the session credential arrives in the `token` query
//! parameter. A valid credential upgrades the connection; an expired but
//! recoverable one is answered with 401 plus a fresh credential in the
//! `X-New-Token` header so the client can reconnect.
//!
//! Each session runs two loops. The read loop enforces the frame size cap
//! and a read deadline refreshed by inbound traffic, and dispatches client
//! frames. The write loop drains the outbound channel, emits keepalive
//! pings and applies a per-frame write deadline. Any read error tears the
//! session down.

use crate::http::AppState;
use axum::Json;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use courier_server_domain::devices::Device;
use courier_server_domain::iam::CredentialError;
use courier_server_domain::shared_kernel::NotificationId;
use courier_server_infrastructure::realtime::Session;
use courier_shared::realtime::{ClientFrame, ServerFrame};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub token: Option<String>,
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "unauthenticated", "message": message })),
    )
        .into_response()
}

/// Outcome of socket admission.
pub(crate) enum Admission {
    Accept {
        device: Device,
        user_id: Option<courier_shared::UserId>,
        token: String,
    },
    Deny(Response),
}

/// Validates the session credential and resolves the connecting device.
///
/// An expired credential is answered with 401 plus a fresh credential in
/// `X-New-Token` (and the body), so the client can reconnect without a new
/// registration round.
pub(crate) async fn admit(state: &AppState, token: Option<String>) -> Admission {
    let Some(token) = token.filter(|t| !t.is_empty()) else {
        return Admission::Deny(unauthorized("missing token"));
    };

    match state.authority.verify(&token) {
        Ok(claims) => {
            let Some(device) = resolve_device(state, &claims).await else {
                return Admission::Deny(unauthorized("unknown device"));
            };
            Admission::Accept {
                device,
                user_id: claims.user_id(),
                token,
            }
        }
        Err(CredentialError::Expired) => {
            // Self-service renewal: recover the device identity from the
            // expired claims and hand back a fresh credential.
            match state.device_service.renew_credential(&token, false).await {
                Ok(renewed) => {
                    let mut headers = HeaderMap::new();
                    if let Ok(value) = HeaderValue::from_str(&renewed.credential) {
                        headers.insert("X-New-Token", value);
                    }
                    headers.insert(
                        header::ACCESS_CONTROL_EXPOSE_HEADERS,
                        HeaderValue::from_static("X-New-Token"),
                    );
                    Admission::Deny(
                        (
                            StatusCode::UNAUTHORIZED,
                            headers,
                            Json(json!({
                                "error": "token_expired",
                                "message": "Please reconnect with the new token",
                                "new_token": renewed.credential,
                            })),
                        )
                            .into_response(),
                    )
                }
                Err(_) => Admission::Deny(unauthorized("invalid token")),
            }
        }
        Err(_) => Admission::Deny(unauthorized("invalid token")),
    }
}

/// GET /ws
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    match admit(&state, query.token).await {
        Admission::Accept {
            device,
            user_id,
            token,
        } => ws
            .max_message_size(state.socket.max_frame_size)
            .on_upgrade(move |socket| run_session(socket, state, device, user_id, token)),
        Admission::Deny(response) => response,
    }
}

async fn resolve_device(
    state: &AppState,
    claims: &courier_server_domain::iam::SessionClaims,
) -> Option<Device> {
    if let Some(device_id) = claims.device_id() {
        return state.device_service.get(device_id).await.ok();
    }
    let identifier = claims.device_identifier.as_deref()?;
    state
        .device_service
        .by_identifier(identifier)
        .await
        .ok()
        .flatten()
}

async fn run_session(
    socket: WebSocket,
    state: AppState,
    device: Device,
    user_id: Option<courier_shared::UserId>,
    credential: String,
) {
    let (outbound_tx, mut outbound_rx) = mpsc::channel(state.socket.outbound_buffer);
    let session = Arc::new(Session::new(
        device.id,
        &device.device_identifier,
        user_id,
        credential,
        outbound_tx,
        state.metrics.clone(),
    ));

    state.hub.register(session.clone()).await;
    info!(session_id = %session.id(), device_id = %device.id, "socket session opened");

    // Activity bookkeeping on the device row is best effort.
    {
        let device_service = state.device_service.clone();
        let device_id = device.id;
        tokio::spawn(async move {
            let _ = device_service.touch(device_id).await;
        });
    }

    let (mut sink, mut stream) = socket.split();

    // Write loop: outbound frames, keepalive pings, forced close.
    let write_session = session.clone();
    let write_wait = state.socket.write_wait;
    let keepalive_interval = state.socket.keepalive_interval;
    let write_task = tokio::spawn(async move {
        let mut keepalive = tokio::time::interval(keepalive_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it.
        keepalive.tick().await;

        loop {
            tokio::select! {
                frame = outbound_rx.recv() => {
                    let Some(frame) = frame else { break };
                    match tokio::time::timeout(write_wait, sink.send(Message::Text(frame))).await {
                        Ok(Ok(())) => {}
                        _ => break,
                    }
                }
                _ = keepalive.tick() => {
                    match tokio::time::timeout(write_wait, sink.send(Message::Ping(Vec::new()))).await {
                        Ok(Ok(())) => {}
                        _ => break,
                    }
                }
                _ = write_session.closed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    // Read loop: deadline refreshed by any inbound traffic.
    let pong_wait = state.socket.pong_wait;
    loop {
        match tokio::time::timeout(pong_wait, stream.next()).await {
            Err(_) => {
                debug!(session_id = %session.id(), "read deadline exceeded");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                debug!(session_id = %session.id(), error = %err, "socket read error");
                break;
            }
            Ok(Some(Ok(message))) => match message {
                Message::Pong(_) | Message::Ping(_) => session.touch(),
                Message::Text(text) => {
                    session.touch();
                    handle_frame(&state, &session, &text).await;
                }
                Message::Binary(_) => {
                    warn!(session_id = %session.id(), "binary frame ignored");
                }
                Message::Close(_) => break,
            },
        }
    }

    state.hub.unregister(session.id()).await;
    write_task.abort();
    info!(session_id = %session.id(), device_id = %device.id, "socket session closed");
}

/// Dispatches one inbound frame. Per-frame errors are logged and the frame
/// dropped; only socket errors kill the session.
pub(crate) async fn handle_frame(state: &AppState, session: &Arc<Session>, text: &str) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(session_id = %session.id(), error = %err, "undecodable frame dropped");
            return;
        }
    };

    match frame {
        ClientFrame::Ping => {
            let pong = ServerFrame::Pong {
                timestamp: Utc::now().to_rfc3339(),
            };
            if session.try_send(pong.to_json()).is_err() {
                debug!(session_id = %session.id(), "failed to enqueue pong");
            }
        }
        ClientFrame::Ack { notification_id } => {
            let Some(notification_id) = NotificationId::from_string(&notification_id) else {
                debug!(session_id = %session.id(), "ack with malformed notification id");
                return;
            };
            if let Err(err) = state.acks.ack(notification_id, session.device_id()).await {
                warn!(
                    session_id = %session.id(),
                    %notification_id,
                    error = %err,
                    "failed to confirm delivery"
                );
            }
        }
        ClientFrame::TokenRefresh { token } => {
            refresh_session_credential(state, session, &token).await;
        }
    }
}

/// Re-issues the session credential from an in-band refresh request. The
/// presented credential must name this session's device; anything else is
/// dropped.
async fn refresh_session_credential(state: &AppState, session: &Arc<Session>, token: &str) {
    let names_this_device = state
        .authority
        .decode_unverified(token)
        .ok()
        .and_then(|claims| claims.device_identifier)
        .map(|identifier| identifier == session.device_identifier())
        .unwrap_or(false);
    if !names_this_device {
        warn!(session_id = %session.id(), "token refresh for a different device dropped");
        return;
    }

    match state.device_service.renew_credential(token, false).await {
        Ok(renewed) => {
            session.rotate_credential(renewed.credential.clone());
            let response = ServerFrame::TokenRefreshResponse {
                token: renewed.credential,
                success: true,
            };
            if session.try_send(response.to_json()).is_err() {
                debug!(session_id = %session.id(), "failed to enqueue refresh response");
            }
        }
        Err(err) => {
            warn!(session_id = %session.id(), error = %err, "credential refresh refused");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_server_application::delivery::DeliveryOrchestrator;
    use courier_server_application::devices::DeviceService;
    use courier_server_domain::deliveries::DeliveryRepository;
    use courier_server_domain::devices::DeviceRepository;
    use courier_server_domain::iam::CredentialAuthority;
    use courier_server_domain::shared_kernel::{DeliveryStatus, UserId};
    use courier_server_infrastructure::persistence::in_memory::{
        InMemoryChannelTokenRepository, InMemoryDeliveryRepository, InMemoryDeviceRepository,
        InMemoryNotificationRepository,
    };
    use courier_server_infrastructure::realtime::{Hub, RealtimeMetrics};
    use courier_shared::{DeviceId, SocketConfig};
    use serde_json::Value;
    use std::time::Duration;

    struct Fixture {
        state: AppState,
        deliveries: Arc<InMemoryDeliveryRepository>,
        devices: Arc<InMemoryDeviceRepository>,
    }

    fn fixture() -> Fixture {
        let notifications = Arc::new(InMemoryNotificationRepository::new());
        let deliveries = Arc::new(InMemoryDeliveryRepository::new());
        let devices = Arc::new(InMemoryDeviceRepository::new());
        let tokens = Arc::new(InMemoryChannelTokenRepository::new());
        let authority = Arc::new(CredentialAuthority::new(
            b"ws-test-secret",
            Duration::from_secs(3600),
            Duration::from_secs(600),
        ));
        let metrics = RealtimeMetrics::new();
        let (hub, hub_rx) = Hub::new(metrics.clone());
        tokio::spawn(hub.clone().run(hub_rx));

        let orchestrator = Arc::new(DeliveryOrchestrator::new(
            notifications,
            deliveries.clone(),
            devices.clone(),
            tokens.clone(),
            hub.clone(),
            vec![],
        ));
        let device_service = Arc::new(DeviceService::new(
            devices.clone(),
            tokens,
            authority.clone(),
        ));

        let state = AppState::new(
            orchestrator,
            device_service,
            authority,
            hub,
            metrics,
            SocketConfig::default(),
        );

        Fixture {
            state,
            deliveries,
            devices,
        }
    }

    fn session(state: &AppState, device_id: DeviceId) -> (Arc<Session>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(16);
        let session = Arc::new(Session::new(
            device_id,
            "hw-ws",
            Some(UserId::from("42")),
            "credential",
            tx,
            state.metrics.clone(),
        ));
        (session, rx)
    }

    #[tokio::test]
    async fn test_ping_frame_answers_pong() {
        let f = fixture();
        let (session, mut rx) = session(&f.state, DeviceId::new());

        handle_frame(&f.state, &session, r#"{"type":"ping"}"#).await;

        let reply: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply["type"], "pong");
        assert!(reply["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_ack_frame_marks_delivered() {
        let f = fixture();
        let device_id = DeviceId::new();
        let (session, _rx) = session(&f.state, device_id);
        let notification_id = courier_shared::NotificationId::new();

        let frame = format!(
            r#"{{"type":"ack","payload":{{"notification_id":"{}"}}}}"#,
            notification_id
        );
        handle_frame(&f.state, &session, &frame).await;

        let row = f
            .deliveries
            .find_for_ack(&notification_id, &device_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, DeliveryStatus::Delivered);
    }

    #[tokio::test]
    async fn test_garbage_frame_is_dropped() {
        let f = fixture();
        let (session, mut rx) = session(&f.state, DeviceId::new());

        handle_frame(&f.state, &session, "not json at all").await;
        handle_frame(&f.state, &session, r#"{"type":"unknown"}"#).await;

        assert!(rx.try_recv().is_err(), "no reply expected for bad frames");
    }

    #[tokio::test]
    async fn test_token_refresh_rotates_credential() {
        let f = fixture();
        let device = Device::new("hw-refresh", None, None);
        f.devices.save(&device).await.unwrap();

        let expired_token = {
            // Minted with the same secret but an exp two minutes in the
            // past: the claims parse, verification reports expiry.
            let claims = courier_server_domain::iam::SessionClaims {
                device_id: None,
                device_identifier: Some("hw-refresh".to_string()),
                user_id: None,
                temporary: true,
                exp: Utc::now().timestamp() - 120,
                iat: Utc::now().timestamp() - 720,
            };
            jsonwebtoken::encode(
                &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
                &claims,
                &jsonwebtoken::EncodingKey::from_secret(b"ws-test-secret"),
            )
            .unwrap()
        };

        let (tx, mut rx) = mpsc::channel(16);
        let session = Arc::new(Session::new(
            device.id,
            "hw-refresh",
            None,
            expired_token.clone(),
            tx,
            f.state.metrics.clone(),
        ));

        let frame = format!(
            r#"{{"type":"token_refresh","payload":{{"token":"{}"}}}}"#,
            expired_token
        );
        handle_frame(&f.state, &session, &frame).await;

        let reply: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply["type"], "token_refresh_response");
        assert_eq!(reply["success"], true);

        let new_token = reply["token"].as_str().unwrap();
        assert_ne!(new_token, expired_token);
        assert_eq!(session.credential(), new_token);
        // The fresh credential verifies and still names the device.
        let claims = f.state.authority.verify(new_token).unwrap();
        assert_eq!(claims.device_identifier.as_deref(), Some("hw-refresh"));
    }

    async fn deny_response(admission: Admission) -> axum::response::Response {
        match admission {
            Admission::Deny(response) => response,
            Admission::Accept { .. } => panic!("expected denial"),
        }
    }

    #[tokio::test]
    async fn test_admission_accepts_valid_credential() {
        let f = fixture();
        let device = Device::new("hw-admit", None, None);
        f.devices.save(&device).await.unwrap();
        let token = f.state.authority.issue_temporary("hw-admit").unwrap();

        match admit(&f.state, Some(token)).await {
            Admission::Accept {
                device: admitted,
                user_id,
                ..
            } => {
                assert_eq!(admitted.id, device.id);
                assert!(user_id.is_none());
            }
            Admission::Deny(_) => panic!("valid credential must be admitted"),
        }
    }

    #[tokio::test]
    async fn test_admission_renews_expired_credential() {
        // An expired credential is denied with 401 and a fresh credential
        // in X-New-Token whose claims name the same device.
        let f = fixture();
        let device = Device::new("hw-exp", Some(UserId::from("9")), None);
        f.devices.save(&device).await.unwrap();

        let expired = {
            let claims = courier_server_domain::iam::SessionClaims {
                device_id: Some(device.id.to_string()),
                device_identifier: Some("hw-exp".to_string()),
                user_id: Some("9".to_string()),
                temporary: false,
                exp: Utc::now().timestamp() - 60,
                iat: Utc::now().timestamp() - 3_660,
            };
            jsonwebtoken::encode(
                &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
                &claims,
                &jsonwebtoken::EncodingKey::from_secret(b"ws-test-secret"),
            )
            .unwrap()
        };

        let response = deny_response(admit(&f.state, Some(expired)).await).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let new_token = response
            .headers()
            .get("X-New-Token")
            .expect("renewed credential header")
            .to_str()
            .unwrap()
            .to_string();

        let claims = f.state.authority.verify(&new_token).unwrap();
        assert_eq!(claims.device_identifier.as_deref(), Some("hw-exp"));
        assert_eq!(claims.user_id(), Some(UserId::from("9")));

        // Reconnecting with the fresh credential succeeds.
        match admit(&f.state, Some(new_token)).await {
            Admission::Accept { device: admitted, .. } => assert_eq!(admitted.id, device.id),
            Admission::Deny(_) => panic!("renewed credential must be admitted"),
        }
    }

    #[tokio::test]
    async fn test_admission_rejects_bad_signature_without_renewal() {
        let f = fixture();
        let forged = CredentialAuthority::new(
            b"some-other-secret",
            Duration::from_secs(3600),
            Duration::from_secs(600),
        )
        .issue_temporary("hw-forged")
        .unwrap();

        let response = deny_response(admit(&f.state, Some(forged)).await).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().get("X-New-Token").is_none());
    }

    #[tokio::test]
    async fn test_admission_requires_token() {
        let f = fixture();
        let response = deny_response(admit(&f.state, None).await).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_token_refresh_for_other_device_is_dropped() {
        let f = fixture();
        let other = f.state.authority.issue_temporary("hw-other").unwrap();
        let (session, mut rx) = session(&f.state, DeviceId::new());

        let frame = format!(
            r#"{{"type":"token_refresh","payload":{{"token":"{}"}}}}"#,
            other
        );
        handle_frame(&f.state, &session, &frame).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(session.credential(), "credential");
    }
}
