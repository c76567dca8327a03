//! corpmap-enrich library interface
//!
//! Progressive company-domain enrichment: tiered adapter fan-out, field
//! aggregation with confidence and provenance, circuit breakers, request
//! deduplication, field-class-aware caching, and an SSE session stream.

pub mod adapters;
pub mod api;
pub mod config;
pub mod db;
pub mod enrichment;
pub mod error;
pub mod types;
pub mod utils;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use enrichment::Orchestrator;
use std::time::Duration;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// SSE heartbeat interval
    pub heartbeat: Duration,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, heartbeat: Duration) -> Self {
        Self {
            orchestrator,
            startup_time: Utc::now(),
            heartbeat,
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::enrich_routes())
        .merge(api::session_routes())
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
