//! HTTP API handlers
//!
//! - `GET /enrich/:domain` - SSE stream of one enrichment session
//! - `GET /session/:session_id` - final (or latest) session snapshot
//! - `GET /health` - liveness and diagnostics

pub mod enrich;
pub mod health;
pub mod session;

pub use enrich::enrich_routes;
pub use health::health_routes;
pub use session::session_routes;
