//! Health check endpoint

use crate::enrichment::BreakerSnapshot;
use crate::AppState;
use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok", or "degraded" while any breaker is not closed
    pub status: String,
    pub module: String,
    pub version: String,
    pub uptime_seconds: u64,
    /// Sessions currently streaming or computing
    pub active_sessions: usize,
    /// Live (domain, tier) computations
    pub inflight_computations: usize,
    pub breakers: Vec<BreakerSnapshot>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);
    let uptime_seconds = uptime.num_seconds().max(0) as u64;

    let breakers = state.orchestrator.breaker_snapshot();
    let status = if breakers
        .iter()
        .all(|b| b.state == crate::enrichment::BreakerStatus::Closed)
    {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        module: "corpmap-enrich".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds,
        active_sessions: state.orchestrator.active_sessions(),
        inflight_computations: state.orchestrator.inflight_computations(),
        breakers,
    })
}

pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
