//! Prometheus metrics, liveness and readiness endpoints.

use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const STARTING: u8 = 0;
const READY: u8 = 1;
const DRAINING: u8 = 2;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    ready: bool,
}

/// Lifecycle phase shared between the server and the readiness endpoint.
#[derive(Clone, Default)]
pub struct HealthState {
    phase: Arc<AtomicU8>,
}

impl HealthState {
    /// Creates a state in the starting phase.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The listener is bound and accepting.
    pub fn mark_ready(&self) {
        self.phase.store(READY, Ordering::Relaxed);
    }

    /// Shutdown began; no new connections are admitted.
    pub fn mark_draining(&self) {
        self.phase.store(DRAINING, Ordering::Relaxed);
    }

    /// Returns `true` while accepting connections.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.phase.load(Ordering::Relaxed) == READY
    }

    fn label(&self) -> &'static str {
        match self.phase.load(Ordering::Relaxed) {
            STARTING => "starting",
            READY => "ready",
            _ => "draining",
        }
    }
}

/// Serves `/metrics`, `/health` and `/ready` on `addr`.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed or binding fails.
pub async fn start_metrics_server(
    addr: SocketAddr,
    health_state: HealthState,
) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let app = Router::new()
        .route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
        .route("/health", get(health_handler))
        .route("/ready", get(move || ready_handler(health_state.clone())));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse { status: "healthy" }))
}

async fn ready_handler(state: HealthState) -> (StatusCode, Json<ReadyResponse>) {
    let ready = state.is_ready();
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(ReadyResponse {
            status: state.label(),
            ready,
        }),
    )
}

/// Connection count gauges.
pub mod gauges {
    /// Increment the active connections gauge.
    pub fn inc_connections_active() {
        metrics::gauge!("mrp_connections_active").increment(1.0);
    }

    /// Decrement the active connections gauge.
    pub fn dec_connections_active() {
        metrics::gauge!("mrp_connections_active").decrement(1.0);
    }
}

/// Event counters.
pub mod counters {
    /// Record an admission attempt with the given outcome label.
    pub fn admissions_total(outcome: &'static str) {
        metrics::counter!("mrp_admissions_total", "outcome" => outcome).increment(1);
    }

    /// Increment the relayed-messages counter.
    pub fn messages_relayed_total() {
        metrics::counter!("mrp_messages_relayed_total").increment(1);
    }

    /// Increment the dropped-messages counter with the given reason label.
    pub fn messages_dropped_total(reason: &'static str) {
        metrics::counter!("mrp_messages_dropped_total", "reason" => reason).increment(1);
    }

    /// Record one dispatched request with its operation label.
    pub fn dispatch_total(operation: &'static str) {
        metrics::counter!("mrp_dispatch_total", "operation" => operation).increment(1);
    }
}

/// Latency histograms.
pub mod histograms {
    /// Record the time from frame arrival to replies being queued, in seconds.
    pub fn frame_latency_seconds(value: f64) {
        metrics::histogram!("mrp_frame_latency_seconds").record(value);
    }
}
