//! End-to-end tests of the HTTP ingress over in-memory wiring.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use courier_server_application::delivery::DeliveryOrchestrator;
use courier_server_application::devices::DeviceService;
use courier_server_domain::iam::CredentialAuthority;
use courier_server_infrastructure::persistence::in_memory::{
    InMemoryChannelTokenRepository, InMemoryDeliveryRepository, InMemoryDeviceRepository,
    InMemoryNotificationRepository,
};
use courier_server_infrastructure::realtime::{Hub, RealtimeMetrics};
use courier_server_interface::{AppState, router};
use courier_shared::SocketConfig;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt;

const SECRET: &[u8] = b"http-api-test-secret";

fn app() -> Router {
    let notifications = Arc::new(InMemoryNotificationRepository::new());
    let deliveries = Arc::new(InMemoryDeliveryRepository::new());
    let devices = Arc::new(InMemoryDeviceRepository::new());
    let tokens = Arc::new(InMemoryChannelTokenRepository::new());
    let authority = Arc::new(CredentialAuthority::new(
        SECRET,
        Duration::from_secs(24 * 60 * 60),
        Duration::from_secs(30 * 60),
    ));
    let metrics = RealtimeMetrics::new();
    let (hub, hub_rx) = Hub::new(metrics.clone());
    tokio::spawn(hub.clone().run(hub_rx));

    let orchestrator = Arc::new(DeliveryOrchestrator::new(
        notifications,
        deliveries,
        devices.clone(),
        tokens.clone(),
        hub.clone(),
        vec![],
    ));
    let device_service = Arc::new(DeviceService::new(devices, tokens, authority.clone()));

    router(AppState::new(
        orchestrator,
        device_service,
        authority,
        hub,
        metrics,
        SocketConfig::default(),
    ))
}

async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn post(path: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_register_without_user_returns_temporary_credential() {
    let app = app();

    let (status, body) = call(
        &app,
        post(
            "/devices/register",
            json!({"device_identifier": "hw-a", "model": "X"}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(body["device_id"].is_string());
    assert_eq!(body["is_verified"], false);

    // The issued credential is temporary.
    let (status, renewed) = call(
        &app,
        post("/tokens/renew", json!({"token": body["token"]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(renewed["token_type"], "temporary");
}

#[tokio::test]
async fn test_temporary_to_permanent_link_flow() {
    // S5: register without user, link with the temporary credential, and
    // the old credential stops working for a second link.
    let app = app();

    let (_, registered) = call(
        &app,
        post("/devices/register", json!({"device_identifier": "hw-d2"})),
    )
    .await;
    let device_id = registered["device_id"].as_str().unwrap().to_string();
    let temporary = registered["token"].as_str().unwrap().to_string();

    let (status, linked) = call(
        &app,
        post(
            "/devices/link",
            json!({"device_id": device_id, "user_id": "7", "token": temporary}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let permanent = linked["token"].as_str().unwrap().to_string();
    assert_ne!(permanent, temporary);

    // The new credential is permanent and carries the user.
    let (_, renewed) = call(&app, post("/tokens/renew", json!({"token": permanent}))).await;
    assert_eq!(renewed["token_type"], "permanent");

    // Registering again for the same device now yields a permanent
    // credential (the device is user-bound).
    let (_, reregistered) = call(
        &app,
        post("/devices/register", json!({"device_identifier": "hw-d2"})),
    )
    .await;
    let (_, renewed) = call(
        &app,
        post("/tokens/renew", json!({"token": reregistered["token"]})),
    )
    .await;
    assert_eq!(renewed["token_type"], "permanent");
}

#[tokio::test]
async fn test_submit_status_ack_round_trip() {
    let app = app();

    // A registered device with no live session and no push tokens: the
    // submission is accepted but reports failed delivery.
    let (_, registered) = call(
        &app,
        post(
            "/devices/register",
            json!({"device_identifier": "hw-s", "user_id": "42"}),
        ),
    )
    .await;
    let device_id = registered["device_id"].as_str().unwrap().to_string();

    let (status, submitted) = call(
        &app,
        post(
            "/notifications",
            json!({"user_id": "42", "title": "Hi", "body": "there"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(submitted["status"], "failed");
    let notification_id = submitted["notification_id"].as_str().unwrap().to_string();

    // The tracking row is visible through the status endpoint.
    let (status, fetched) = call(&app, get(&format!("/notifications/{}", notification_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["title"], "Hi");
    let deliveries = fetched["deliveries"].as_array().unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0]["channel"], "websocket");
    assert_eq!(deliveries[0]["status"], "failed");

    // Acking is idempotent and lands the pair on DELIVERED.
    for _ in 0..2 {
        let (status, acked) = call(
            &app,
            post(
                "/notifications/ack",
                json!({"notification_id": notification_id, "device_id": device_id}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(acked["status"], "success");
    }

    let (_, fetched) = call(&app, get(&format!("/notifications/{}", notification_id))).await;
    let deliveries = fetched["deliveries"].as_array().unwrap();
    assert!(
        deliveries
            .iter()
            .any(|d| d["status"] == "delivered" && d["device_id"] == device_id.as_str())
    );
}

#[tokio::test]
async fn test_submit_validation_errors() {
    let app = app();

    let (status, body) = call(
        &app,
        post("/notifications", json!({"user_id": "42", "title": "", "body": "x"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_input");

    let (status, body) = call(
        &app,
        post(
            "/notifications",
            json!({"user_id": "42", "title": "t", "body": "b", "channels": ["smtp"]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_input");
}

#[tokio::test]
async fn test_submit_to_unknown_user_is_no_targets() {
    let app = app();
    let (status, body) = call(
        &app,
        post(
            "/notifications",
            json!({"user_id": "ghost", "title": "t", "body": "b"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "no_targets");
}

#[tokio::test]
async fn test_unknown_notification_is_404() {
    let app = app();
    let (status, body) = call(
        &app,
        get("/notifications/3fa85f64-5717-4562-b3fc-2c963f66afa6"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "notification_not_found");
}

#[tokio::test]
async fn test_health_and_metrics() {
    let app = app();

    let (status, body) = call(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let response = app.clone().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
