//! Enrichment event stream
//!
//! `GET /enrich/:domain` starts a session and streams its events:
//! `tier_k_complete` per tier, then one of `complete`, `degraded`, `timeout`
//! or `error`. The session id travels in the `x-session-id` header and in
//! every event payload. Closing the stream stops delivery only.

use crate::enrichment::publisher::sse_stream;
use crate::types::DomainKey;
use crate::{ApiError, ApiResult, AppState};
use axum::{
    extract::{Path, State},
    http::header::{HeaderName, HeaderValue},
    response::{sse::Sse, IntoResponse},
    routing::get,
    Router,
};
use corpmap_common::sse::{heartbeat_keep_alive, streaming_headers};
use tracing::info;

pub const SESSION_ID_HEADER: HeaderName = HeaderName::from_static("x-session-id");

/// GET /enrich/:domain
pub async fn enrich_stream(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let domain = DomainKey::parse(&domain)?;
    let handle = state.orchestrator.start(domain.clone());

    info!(
        session_id = %handle.session_id,
        domain = %domain,
        "New SSE client connected to enrichment stream"
    );

    let session_header = HeaderValue::from_str(&handle.session_id.to_string())
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let sse = Sse::new(sse_stream(handle.events)).keep_alive(heartbeat_keep_alive(state.heartbeat));

    Ok((streaming_headers(), [(SESSION_ID_HEADER, session_header)], sse))
}

pub fn enrich_routes() -> Router<AppState> {
    Router::new().route("/enrich/:domain", get(enrich_stream))
}
