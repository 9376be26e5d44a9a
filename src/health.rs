use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tracing::info;

/// Pipeline counters owned by the runner and shared with the health
/// endpoints by reference.
#[derive(Debug, Default)]
pub struct Counters {
    pub events_consumed: AtomicU64,
    pub events_processed: AtomicU64,
    pub notifications_produced: AtomicU64,
    pub duplicates_skipped: AtomicU64,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub events_consumed: u64,
    pub events_processed: u64,
    pub notifications_produced: u64,
    pub duplicates_skipped: u64,
}

impl Counters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            events_consumed: self.events_consumed.load(Ordering::Relaxed),
            events_processed: self.events_processed.load(Ordering::Relaxed),
            notifications_produced: self.notifications_produced.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
        }
    }
}

/// State behind the health endpoints: the runner's liveness flag and its
/// counters.
#[derive(Clone)]
pub struct HealthState {
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    started_at: Instant,
}

impl HealthState {
    pub fn new(running: Arc<AtomicBool>, counters: Arc<Counters>) -> Self {
        Self {
            running,
            counters,
            started_at: Instant::now(),
        }
    }
}

#[derive(Serialize)]
struct Metrics {
    #[serde(flatten)]
    counters: CounterSnapshot,
    uptime_seconds: u64,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// `{"status":"UP"}` with 200 while the runner is live, `DOWN` with 503
/// once shutdown begins.
async fn health(State(state): State<HealthState>) -> Response {
    if state.running.load(Ordering::Relaxed) {
        (StatusCode::OK, Json(serde_json::json!({ "status": "UP" }))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "DOWN" })),
        )
            .into_response()
    }
}

async fn metrics(State(state): State<HealthState>) -> Json<Metrics> {
    Json(Metrics {
        counters: state.counters.snapshot(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

/// Serves the health router on the given port until the process exits.
pub async fn serve(router: Router, port: u16) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Health server started on port {}", listener.local_addr()?.port());
    axum::serve(listener, router).await
}
