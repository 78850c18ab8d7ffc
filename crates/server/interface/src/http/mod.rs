//! HTTP ingress.

pub mod devices;
pub mod health;
pub mod notifications;

use crate::websocket;
use axum::Router;
use axum::routing::{get, post};
use courier_server_application::delivery::DeliveryOrchestrator;
use courier_server_application::devices::DeviceService;
use courier_server_domain::deliveries::AckSink;
use courier_server_domain::iam::CredentialAuthority;
use courier_server_infrastructure::realtime::{Hub, RealtimeMetrics};
use courier_shared::SocketConfig;
use std::sync::Arc;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<DeliveryOrchestrator>,
    pub device_service: Arc<DeviceService>,
    pub authority: Arc<CredentialAuthority>,
    pub hub: Arc<Hub>,
    /// The narrow capability sessions use to confirm deliveries.
    pub acks: Arc<dyn AckSink>,
    pub metrics: RealtimeMetrics,
    pub socket: SocketConfig,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<DeliveryOrchestrator>,
        device_service: Arc<DeviceService>,
        authority: Arc<CredentialAuthority>,
        hub: Arc<Hub>,
        metrics: RealtimeMetrics,
        socket: SocketConfig,
    ) -> Self {
        let acks: Arc<dyn AckSink> = orchestrator.clone();
        Self {
            orchestrator,
            device_service,
            authority,
            hub,
            acks,
            metrics,
            socket,
        }
    }
}

/// Builds the ingress router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/metrics", get(health::metrics))
        .route("/ws", get(websocket::websocket_handler))
        .route("/notifications", post(notifications::submit))
        .route("/notifications/:id", get(notifications::status))
        .route("/notifications/ack", post(notifications::acknowledge))
        .route("/devices/register", post(devices::register))
        .route("/devices/link", post(devices::link))
        .route("/devices/token", post(devices::update_token))
        .route("/tokens/renew", post(devices::renew))
        .with_state(state)
}
