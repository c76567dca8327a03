//! Source adapters
//!
//! Every data provider implements [`SourceAdapter`]. Adapters are stateless
//! beyond their transport configuration, do no caching and never retry on
//! their own: the layer scheduler owns deadlines, retries and breaker gating
//! so the policy is applied uniformly.
//!
//! # Adapters
//! - **website** - homepage `<title>`, meta description, `og:site_name`
//! - **http_json** - configurable JSON provider (URL template + JSON pointers)

pub mod http_json;
pub mod website;

use crate::types::{AdapterError, AdapterErrorKind, DomainKey, FieldSet};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Input handed to an adapter for one invocation
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub domain_key: DomainKey,
    /// Field values established by earlier tiers, keyed by internal name
    pub accumulated_fields: BTreeMap<String, Value>,
    pub tier_number: u8,
}

impl AdapterContext {
    pub fn new(domain_key: DomainKey, tier_number: u8) -> Self {
        Self {
            domain_key,
            accumulated_fields: BTreeMap::new(),
            tier_number,
        }
    }
}

/// Data provider contract
///
/// # Example
/// ```rust,ignore
/// #[async_trait::async_trait]
/// impl SourceAdapter for Registry {
///     fn name(&self) -> &str { "registry" }
///     fn tier(&self) -> u8 { 2 }
///     fn cost_units(&self) -> f64 { 0.05 }
///     fn base_confidence(&self) -> u8 { 80 }
///
///     async fn fetch(&self, ctx: &AdapterContext, deadline: Instant)
///         -> Result<FieldSet, AdapterError>
///     {
///         // one upstream call, bounded by `deadline`
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Unique adapter name, used for breakers and provenance
    fn name(&self) -> &str;

    /// Static tier assignment (1 = fastest/cheapest)
    fn tier(&self) -> u8;

    /// Cost charged per successful call
    fn cost_units(&self) -> f64;

    /// Baseline confidence (0-100) of fields this adapter returns
    fn base_confidence(&self) -> u8;

    /// Adapter-specific timeout; `None` uses the orchestrator default
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Make exactly one upstream request, finishing before `deadline`
    async fn fetch(&self, ctx: &AdapterContext, deadline: Instant)
        -> Result<FieldSet, AdapterError>;
}

/// Rejected adapter set
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("No adapters registered")]
    Empty,
    #[error("Duplicate adapter name: {0}")]
    DuplicateName(String),
    #[error("Adapter '{0}' declares tier 0; tiers start at 1")]
    TierZero(String),
    #[error("Tier {0} has no adapters; tiers must be contiguous from 1")]
    TierGap(u8),
}

/// Adapters grouped by tier plus the per-field priority ranking
pub struct AdapterRegistry {
    tiers: BTreeMap<u8, Vec<Arc<dyn SourceAdapter>>>,
    priorities: BTreeMap<String, Vec<String>>,
}

impl AdapterRegistry {
    /// Validate and index the adapter set
    pub fn new(
        adapters: Vec<Arc<dyn SourceAdapter>>,
        priorities: BTreeMap<String, Vec<String>>,
    ) -> Result<Self, RegistryError> {
        if adapters.is_empty() {
            return Err(RegistryError::Empty);
        }

        let mut names = HashSet::new();
        let mut tiers: BTreeMap<u8, Vec<Arc<dyn SourceAdapter>>> = BTreeMap::new();
        for adapter in adapters {
            if !names.insert(adapter.name().to_string()) {
                return Err(RegistryError::DuplicateName(adapter.name().to_string()));
            }
            if adapter.tier() == 0 {
                return Err(RegistryError::TierZero(adapter.name().to_string()));
            }
            tiers.entry(adapter.tier()).or_default().push(adapter);
        }

        let assigned: BTreeSet<u8> = tiers.keys().copied().collect();
        if let Some(&max) = assigned.iter().next_back() {
            if let Some(gap) = (1..=max).find(|t| !assigned.contains(t)) {
                return Err(RegistryError::TierGap(gap));
            }
        }

        for adapters in tiers.values_mut() {
            adapters.sort_by(|a, b| a.name().cmp(b.name()));
        }

        Ok(Self { tiers, priorities })
    }

    /// Ordered tier numbers, `1..=N`
    pub fn tiers(&self) -> Vec<u8> {
        self.tiers.keys().copied().collect()
    }

    pub fn adapters_for(&self, tier: u8) -> Vec<Arc<dyn SourceAdapter>> {
        self.tiers.get(&tier).cloned().unwrap_or_default()
    }

    /// Rank of `adapter` for `field`, lower wins; unranked adapters share the last rank
    pub fn priority_of(&self, field: &str, adapter: &str) -> usize {
        self.priorities
            .get(field)
            .and_then(|ranking| ranking.iter().position(|name| name == adapter))
            .unwrap_or(usize::MAX)
    }

    pub fn len(&self) -> usize {
        self.tiers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }
}

// ============================================================================
// HTTP error mapping shared by the reqwest-backed adapters
// ============================================================================

/// Map a transport error to an adapter error kind
pub(crate) fn classify_reqwest_error(adapter: &str, err: &reqwest::Error) -> AdapterError {
    let kind = if err.is_timeout() {
        AdapterErrorKind::Timeout
    } else if err.is_decode() || err.is_body() {
        AdapterErrorKind::MalformedResponse
    } else {
        AdapterErrorKind::Unavailable
    };
    AdapterError::new(kind, format!("{adapter} request failed: {err}"))
}

/// Map a non-success HTTP status to an adapter error, `None` for 2xx
pub(crate) fn classify_status(adapter: &str, status: reqwest::StatusCode) -> Option<AdapterError> {
    if status.is_success() {
        return None;
    }
    let kind = match status.as_u16() {
        429 => AdapterErrorKind::RateLimited,
        401 | 403 => AdapterErrorKind::AuthFailure,
        404 | 410 => AdapterErrorKind::NotFound,
        408 | 504 => AdapterErrorKind::Timeout,
        _ => AdapterErrorKind::Unavailable,
    };
    Some(AdapterError::new(
        kind,
        format!("{adapter} returned HTTP {status}"),
    ))
}

/// Time left before `deadline`, or a Timeout error when none remains
pub(crate) fn remaining(adapter: &str, deadline: Instant) -> Result<Duration, AdapterError> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(AdapterError::timeout(format!(
            "{adapter}: deadline passed before request"
        )));
    }
    Ok(left)
}
