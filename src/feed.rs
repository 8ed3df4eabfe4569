use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::sink::{AnomalyFilter, MemorySink};
use crate::types::{Anomaly, AnomalyKind};

/// Shared state for the feed handlers.
#[derive(Clone)]
pub struct AppState {
    pub sink: Arc<MemorySink>,
}

/// Build the feed router over the in-memory sink.
pub fn create_router(sink: Arc<MemorySink>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/anomalies", get(get_anomalies))
        .route("/api/anomalies/stats", get(get_stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(AppState { sink })
}

/// Serve the router until the shutdown channel flips.
pub async fn serve(
    router: Router,
    bind_addr: &str,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind feed server to {bind_addr}"))?;
    info!("Feed listening on {bind_addr}");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .context("feed server error")
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Debug, Default, Deserialize)]
struct AnomaliesQuery {
    /// Filter by kind ("sharp_drop", "value_bet", …).
    kind: Option<AnomalyKind>,
    /// Recency window in hours (default 24).
    hours: Option<u32>,
    /// Live entities only (`true`) or prematch only (`false`).
    live: Option<bool>,
    /// Maximum results (default 50, capped at 500).
    limit: Option<usize>,
}

#[derive(Serialize)]
struct AnomaliesResponse {
    count: usize,
    anomalies: Vec<Anomaly>,
}

async fn get_anomalies(
    State(state): State<AppState>,
    Query(params): Query<AnomaliesQuery>,
) -> Json<AnomaliesResponse> {
    let filter = AnomalyFilter {
        kind: params.kind,
        hours: Some(params.hours.unwrap_or(24)),
        live: params.live,
        limit: params.limit.unwrap_or(50).min(500),
    };
    let anomalies = state.sink.query(&filter, Utc::now());
    Json(AnomaliesResponse {
        count: anomalies.len(),
        anomalies,
    })
}

#[derive(Debug, Default, Deserialize)]
struct StatsQuery {
    /// Recency window in hours (default 24).
    hours: Option<u32>,
}

#[derive(Serialize)]
struct StatsResponse {
    total: usize,
    by_kind: BTreeMap<AnomalyKind, usize>,
}

async fn get_stats(
    State(state): State<AppState>,
    Query(params): Query<StatsQuery>,
) -> Json<StatsResponse> {
    let by_kind = state
        .sink
        .counts_by_kind(Some(params.hours.unwrap_or(24)), Utc::now());
    let total = by_kind.values().sum();
    Json(StatsResponse { total, by_kind })
}
