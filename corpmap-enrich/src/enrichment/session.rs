//! Enrichment session state machine
//!
//! `pending → tier_1_complete → … → tier_N_complete → complete | degraded`,
//! with orchestration faults going to `error` from any non-terminal state.
//! The session performs no I/O; the orchestrator task that owns it drives
//! every transition.

use super::aggregator::{FieldAggregator, FieldDelta, FieldEntry};
use crate::types::{DomainKey, TierResult};
use chrono::{DateTime, Utc};
use corpmap_common::time::add_duration;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Reason carried by a degraded session whose sources all failed
pub const REASON_ALL_SOURCES_FAILED: &str = "all sources failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum SessionStatus {
    Pending,
    /// Tiers 1..=k finished
    TierComplete(u8),
    Complete,
    Degraded,
    Error,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Degraded | Self::Error)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::TierComplete(k) => write!(f, "tier_{k}_complete"),
            Self::Complete => f.write_str("complete"),
            Self::Degraded => f.write_str("degraded"),
            Self::Error => f.write_str("error"),
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "complete" => Ok(Self::Complete),
            "degraded" => Ok(Self::Degraded),
            "error" => Ok(Self::Error),
            other => other
                .strip_prefix("tier_")
                .and_then(|rest| rest.strip_suffix("_complete"))
                .and_then(|k| k.parse::<u8>().ok())
                .map(Self::TierComplete)
                .ok_or_else(|| format!("unknown session status '{other}'")),
        }
    }
}

impl From<SessionStatus> for String {
    fn from(status: SessionStatus) -> Self {
        status.to_string()
    }
}

impl TryFrom<String> for SessionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// Rejected session transition
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Tier {got} recorded out of order, expected tier {expected}")]
    OutOfOrderTier { expected: u8, got: u8 },
    #[error("Session already finished with status {0}")]
    AlreadyTerminal(SessionStatus),
}

/// Session aggregate: fields, tier history, cost and timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentSession {
    pub session_id: Uuid,
    pub domain_key: DomainKey,
    pub status: SessionStatus,
    pub fields: BTreeMap<String, FieldEntry>,
    pub tier_results: Vec<TierResult>,
    pub total_cost: f64,
    pub total_duration_ms: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Diagnostic for degraded and error sessions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Number of tiers the session will run
    pub planned_tiers: u8,
    #[serde(skip, default)]
    retention: Duration,
}

impl EnrichmentSession {
    pub fn new(domain_key: DomainKey, planned_tiers: u8, now: DateTime<Utc>, retention: Duration) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            domain_key,
            status: SessionStatus::Pending,
            fields: BTreeMap::new(),
            tier_results: Vec::new(),
            total_cost: 0.0,
            total_duration_ms: 0,
            created_at: now,
            expires_at: add_duration(now, retention),
            completed_at: None,
            reason: None,
            planned_tiers,
            retention,
        }
    }

    /// Tier the session expects next
    pub fn next_tier(&self) -> u8 {
        self.tier_results
            .last()
            .map_or(1, |r| r.tier_number.saturating_add(1))
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Current field values, the context later tiers read
    pub fn accumulated_fields(&self) -> BTreeMap<String, Value> {
        self.fields
            .iter()
            .map(|(name, entry)| (name.clone(), entry.value.clone()))
            .collect()
    }

    /// Fold a finished tier into the session and advance to `tier_k_complete`
    pub fn record_tier(
        &mut self,
        result: TierResult,
        aggregator: &FieldAggregator,
    ) -> Result<Vec<FieldDelta>, SessionError> {
        if self.is_terminal() {
            return Err(SessionError::AlreadyTerminal(self.status));
        }
        let expected = self.next_tier();
        if result.tier_number != expected {
            return Err(SessionError::OutOfOrderTier {
                expected,
                got: result.tier_number,
            });
        }

        let deltas = aggregator.fold(&mut self.fields, &result);
        self.total_cost += result.cost();
        self.status = SessionStatus::TierComplete(result.tier_number);
        self.tier_results.push(result);
        Ok(deltas)
    }

    pub fn set_elapsed(&mut self, elapsed: Duration) {
        self.total_duration_ms = corpmap_common::time::duration_to_millis(elapsed);
    }

    /// `complete` when at least one field has provenance, otherwise degraded
    pub fn finalize(&mut self, now: DateTime<Utc>) -> Result<SessionStatus, SessionError> {
        let has_provenance = self
            .fields
            .values()
            .any(|entry| !entry.contributing_sources.is_empty());
        let any_success = self.tier_results.iter().any(|t| t.succeeded_count > 0);

        if has_provenance && any_success {
            self.close(SessionStatus::Complete, None, now)?;
        } else {
            self.close(
                SessionStatus::Degraded,
                Some(REASON_ALL_SOURCES_FAILED.to_string()),
                now,
            )?;
        }
        Ok(self.status)
    }

    /// End degraded with an explicit diagnostic
    pub fn degrade(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<(), SessionError> {
        self.close(SessionStatus::Degraded, Some(reason.into()), now)
    }

    /// End in error after an orchestration fault
    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<(), SessionError> {
        self.close(SessionStatus::Error, Some(reason.into()), now)
    }

    fn close(&mut self, status: SessionStatus, reason: Option<String>, now: DateTime<Utc>) -> Result<(), SessionError> {
        if self.is_terminal() {
            return Err(SessionError::AlreadyTerminal(self.status));
        }
        self.status = status;
        self.reason = reason;
        self.completed_at = Some(now);
        self.expires_at = add_duration(now, self.retention);
        Ok(())
    }
}
