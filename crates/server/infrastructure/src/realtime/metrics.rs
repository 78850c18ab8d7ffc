//! Prometheus metrics for the realtime layer.

use prometheus::{Gauge, IntCounter, Registry};
use std::sync::Arc;

/// Metrics shared by the hub, the sessions and the idle reaper.
#[derive(Debug, Clone)]
pub struct RealtimeMetrics {
    inner: Arc<RealtimeMetricsInner>,
}

#[derive(Debug)]
struct RealtimeMetricsInner {
    registry: Registry,
    sessions_active: Gauge,
    sessions_total: IntCounter,
    frames_sent_total: IntCounter,
    frames_dropped_total: IntCounter,
    backpressure_total: IntCounter,
    sessions_reaped_total: IntCounter,
}

impl Default for RealtimeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RealtimeMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let sessions_active =
            Gauge::new("courier_sessions_active", "Live socket sessions").unwrap();
        let sessions_total =
            IntCounter::new("courier_sessions_total", "Sessions accepted since start").unwrap();
        let frames_sent_total =
            IntCounter::new("courier_frames_sent_total", "Frames enqueued to sessions").unwrap();
        let frames_dropped_total = IntCounter::new(
            "courier_frames_dropped_total",
            "Frames lost to closed or saturated sessions",
        )
        .unwrap();
        let backpressure_total = IntCounter::new(
            "courier_backpressure_total",
            "Sessions disconnected for a full outbound buffer",
        )
        .unwrap();
        let sessions_reaped_total = IntCounter::new(
            "courier_sessions_reaped_total",
            "Sessions closed by the idle reaper",
        )
        .unwrap();

        registry.register(Box::new(sessions_active.clone())).unwrap();
        registry.register(Box::new(sessions_total.clone())).unwrap();
        registry
            .register(Box::new(frames_sent_total.clone()))
            .unwrap();
        registry
            .register(Box::new(frames_dropped_total.clone()))
            .unwrap();
        registry
            .register(Box::new(backpressure_total.clone()))
            .unwrap();
        registry
            .register(Box::new(sessions_reaped_total.clone()))
            .unwrap();

        Self {
            inner: Arc::new(RealtimeMetricsInner {
                registry,
                sessions_active,
                sessions_total,
                frames_sent_total,
                frames_dropped_total,
                backpressure_total,
                sessions_reaped_total,
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn session_opened(&self) {
        self.inner.sessions_active.inc();
        self.inner.sessions_total.inc();
    }

    pub fn session_closed(&self) {
        self.inner.sessions_active.dec();
    }

    pub fn record_frame_sent(&self) {
        self.inner.frames_sent_total.inc();
    }

    pub fn record_frame_dropped(&self) {
        self.inner.frames_dropped_total.inc();
    }

    pub fn record_backpressure(&self) {
        self.inner.backpressure_total.inc();
    }

    pub fn record_session_reaped(&self) {
        self.inner.sessions_reaped_total.inc();
    }

    pub fn active_sessions(&self) -> f64 {
        self.inner.sessions_active.get()
    }
}
