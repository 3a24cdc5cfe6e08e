//! HTTP health endpoint reporting pool and usage state.

use crate::pool::{ConnectionPool, PoolStats};
use crate::usage::{InMemoryUsageTracker, UsageRecord};
use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// State shared by health requests.
pub struct HealthState {
    pool: Arc<ConnectionPool>,
    usage: Option<Arc<InMemoryUsageTracker>>,
}

impl HealthState {
    pub fn new(pool: Arc<ConnectionPool>, usage: Option<Arc<InMemoryUsageTracker>>) -> Self {
        Self { pool, usage }
    }
}

/// Health response body.
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub ok: bool,
    pub service: &'static str,
    pub pool: PoolStats,
    pub usage: BTreeMap<String, UsageRecord>,
}

/// Create the health router serving `GET path`.
pub fn create_router(path: &str, state: Arc<HealthState>) -> Router {
    Router::new()
        .route(path, get(handle_health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn handle_health(State(state): State<Arc<HealthState>>) -> (StatusCode, Json<HealthReport>) {
    let report = report(&state);
    let status = if report.ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

fn report(state: &HealthState) -> HealthReport {
    let pool = state.pool.stats();
    HealthReport {
        ok: !pool.closed,
        service: "pgtenant",
        pool,
        usage: state
            .usage
            .as_ref()
            .map(|usage| usage.snapshot())
            .unwrap_or_default(),
    }
}

/// Serve the health router until `shutdown` completes.
pub async fn serve_health(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(address) = listener.local_addr() {
        tracing::info!(address = %address, "Health endpoint listening");
    }
    axum::serve(listener, router).with_graceful_shutdown(shutdown).await
}
