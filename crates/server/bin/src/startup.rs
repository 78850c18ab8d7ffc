//! Service wiring and lifecycle.
//!
//! Builds the repositories, the hub, the orchestrator and the background
//! workers, serves the ingress, and coordinates graceful shutdown: stop
//! accepting sessions, close the hub, drain in-flight retries within the
//! grace window, exit. Dropped retries stay in the store and are re-picked
//! on the next start.

use axum::http::HeaderName;
use courier_server_application::delivery::{
    DeadLetterQueue, DeliveryOrchestrator, ExpirySweep, RetryScheduler, RetrySchedulerConfig,
};
use courier_server_application::devices::DeviceService;
use courier_server_domain::deliveries::{DeliveryRepository, PushAdapter};
use courier_server_domain::devices::DeviceRepository;
use courier_server_domain::iam::CredentialAuthority;
use courier_server_domain::notifications::NotificationRepository;
use courier_server_domain::queue::QueueRepository;
use courier_server_domain::retry::RetryPolicy;
use courier_server_domain::tokens::ChannelTokenRepository;
use courier_server_infrastructure::persistence::postgres::{
    PostgresChannelTokenRepository, PostgresDeliveryRepository, PostgresDeviceRepository,
    PostgresNotificationRepository, PostgresQueueRepository, connect_pool, migrations,
};
use courier_server_infrastructure::push::{ApnsAdapter, FcmAdapter};
use courier_server_infrastructure::realtime::{
    Hub, IdleReaper, IdleReaperConfig, RealtimeMetrics,
};
use courier_server_interface::{AppState, router};
use courier_shared::ServerConfig;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let pool = connect_pool(&config.database).await?;
    migrations::run_migrations(&pool, &config.database.schema).await?;

    let metrics = RealtimeMetrics::new();
    let (hub, hub_commands) = Hub::new(metrics.clone());
    tokio::spawn(hub.clone().run(hub_commands));

    let authority = Arc::new(CredentialAuthority::new(
        config.credentials.signing_secret.as_bytes(),
        config.credentials.permanent_ttl,
        config.credentials.temporary_ttl,
    ));

    let devices: Arc<dyn DeviceRepository> =
        Arc::new(PostgresDeviceRepository::new(pool.clone()));
    let tokens: Arc<dyn ChannelTokenRepository> =
        Arc::new(PostgresChannelTokenRepository::new(pool.clone()));
    let notifications: Arc<dyn NotificationRepository> =
        Arc::new(PostgresNotificationRepository::new(pool.clone()));
    let deliveries: Arc<dyn DeliveryRepository> =
        Arc::new(PostgresDeliveryRepository::new(pool.clone()));
    let queue: Arc<dyn QueueRepository> = Arc::new(PostgresQueueRepository::new(pool.clone()));

    let mut adapters: Vec<Arc<dyn PushAdapter>> = Vec::new();
    if config.push.apns.enabled {
        adapters.push(Arc::new(ApnsAdapter::new(
            config.push.apns.clone(),
            config.push.request_timeout,
        )?));
        info!("apns channel enabled");
    }
    if config.push.fcm.enabled {
        adapters.push(Arc::new(FcmAdapter::new(
            config.push.fcm.clone(),
            config.push.request_timeout,
        )?));
        info!("fcm channel enabled");
    }

    let orchestrator = Arc::new(DeliveryOrchestrator::new(
        notifications.clone(),
        deliveries.clone(),
        devices.clone(),
        tokens.clone(),
        hub.clone(),
        adapters,
    ));
    let device_service = Arc::new(DeviceService::new(
        devices.clone(),
        tokens.clone(),
        authority.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dlq = Arc::new(DeadLetterQueue::new(
        config.retry.dlq_capacity,
        Some(config.retry.dlq_retention),
    ));
    let scheduler = RetryScheduler::new(
        orchestrator.clone(),
        deliveries.clone(),
        queue,
        dlq,
        RetrySchedulerConfig {
            policy: RetryPolicy::from(&config.retry),
            poll_interval: config.retry.poll_interval,
            batch_limit: 256,
        },
        shutdown_rx.clone(),
    );
    tokio::spawn(scheduler.clone().run());

    let sweep = ExpirySweep::new(
        notifications.clone(),
        deliveries.clone(),
        config.retry.poll_interval,
    );
    tokio::spawn(sweep.run(shutdown_rx.clone()));

    let reaper = IdleReaper::new(hub.clone(), IdleReaperConfig::from(&config.reaper));
    tokio::spawn(reaper.run(shutdown_rx.clone()));

    let state = AppState::new(
        orchestrator,
        device_service,
        authority,
        hub.clone(),
        metrics,
        config.socket.clone(),
    );
    let app = router(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
                .expose_headers([HeaderName::from_static("x-new-token")]),
        )
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http.port)).await?;
    info!(port = config.http.port, "ingress listening");

    // On the shutdown signal the hub closes every session, which lets the
    // websocket connections (and with them graceful serve) finish.
    let graceful = {
        let hub = hub.clone();
        async move {
            shutdown_signal().await;
            info!("shutdown signal received, closing sessions");
            hub.shutdown().await;
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(graceful)
        .await?;

    // Grace window for in-flight retries; whatever does not finish stays
    // persisted and is re-picked on the next start.
    let deadline = Instant::now() + config.http.shutdown_grace;
    while scheduler.in_flight_count() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(Duration::from_millis(100)).await;

    info!("courier server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
