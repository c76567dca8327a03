//! Session snapshot endpoint
//!
//! `GET /session/:session_id` returns the latest stored snapshot as one
//! document, with field names in the external vocabulary.

use crate::enrichment::aggregator::FieldEntry;
use crate::enrichment::publisher::{external_field_name, FIELD_VOCABULARY_VERSION};
use crate::enrichment::session::EnrichmentSession;
use crate::types::TierResult;
use crate::{ApiError, ApiResult, AppState};
use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct SessionDocument {
    pub vocabulary: &'static str,
    pub session_id: Uuid,
    pub domain: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub fields: BTreeMap<String, FieldEntry>,
    pub tier_results: Vec<TierResult>,
    pub total_cost: f64,
    pub total_duration_ms: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<EnrichmentSession> for SessionDocument {
    fn from(session: EnrichmentSession) -> Self {
        let fields = session
            .fields
            .into_values()
            .map(|mut entry| {
                entry.name = external_field_name(&entry.name).to_string();
                (entry.name.clone(), entry)
            })
            .collect();

        Self {
            vocabulary: FIELD_VOCABULARY_VERSION,
            session_id: session.session_id,
            domain: session.domain_key.to_string(),
            status: session.status.to_string(),
            reason: session.reason,
            fields,
            tier_results: session.tier_results,
            total_cost: session.total_cost,
            total_duration_ms: session.total_duration_ms,
            created_at: session.created_at,
            expires_at: session.expires_at,
            completed_at: session.completed_at,
        }
    }
}

/// GET /session/:session_id
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionDocument>> {
    let id = Uuid::parse_str(&session_id)
        .map_err(|_| ApiError::BadRequest(format!("Invalid session id: {}", session_id)))?;

    let session = state
        .orchestrator
        .session(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Session {} not found or expired", id)))?;

    Ok(Json(SessionDocument::from(session)))
}

pub fn session_routes() -> Router<AppState> {
    Router::new().route("/session/:session_id", get(get_session))
}
