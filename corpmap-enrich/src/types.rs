//! Core Types for corpmap-enrich
//!
//! Data contracts shared by every stage of the enrichment pipeline:
//! - **Domain key:** normalized host that keys cache, dedup and sessions
//! - **Field payloads:** tagged union of known field kinds plus an open
//!   extension map, validated when folded into a session
//! - **Outcomes:** one immutable [`SourceOutcome`] per adapter invocation,
//!   grouped into an append-only [`TierResult`]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

// ============================================================================
// Domain Key
// ============================================================================

/// Normalized company domain: lowercase host, no scheme, path, port or `www.`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainKey(String);

/// Rejected domain input
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainKeyError {
    #[error("domain is empty")]
    Empty,
    #[error("domain '{0}' has no top-level label")]
    MissingDot(String),
    #[error("domain '{0}' contains invalid characters")]
    InvalidCharacters(String),
    #[error("domain '{0}' has an invalid label")]
    InvalidLabel(String),
    #[error("domain '{0}' is too long")]
    TooLong(String),
}

impl DomainKey {
    /// Normalize user input such as `https://WWW.Acme.test:443/about?x=1`
    /// into `acme.test`
    pub fn parse(input: &str) -> Result<Self, DomainKeyError> {
        let mut host = input.trim().to_ascii_lowercase();

        if let Some(idx) = host.find("://") {
            host = host[idx + 3..].to_string();
        }
        if let Some(idx) = host.find(['/', '?', '#']) {
            host.truncate(idx);
        }
        if let Some(idx) = host.rfind('@') {
            host = host[idx + 1..].to_string();
        }
        if let Some(idx) = host.rfind(':') {
            if host[idx + 1..].chars().all(|c| c.is_ascii_digit()) {
                host.truncate(idx);
            }
        }
        let host = host.trim_end_matches('.');
        let host = host.strip_prefix("www.").unwrap_or(host);

        if host.is_empty() {
            return Err(DomainKeyError::Empty);
        }
        if host.len() > 253 {
            return Err(DomainKeyError::TooLong(host.to_string()));
        }
        if !host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        {
            return Err(DomainKeyError::InvalidCharacters(host.to_string()));
        }
        if !host.contains('.') {
            return Err(DomainKeyError::MissingDot(host.to_string()));
        }
        let labels_ok = host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
        });
        if !labels_ok {
            return Err(DomainKeyError::InvalidLabel(host.to_string()));
        }

        Ok(Self(host.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DomainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Field Classes
// ============================================================================

/// Lifetime class of a field, governs cache TTL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldClass {
    /// Legal identifiers, founding year: effectively never change
    Immutable,
    /// Headcount band, industry: change over weeks
    Stable,
    /// Ratings, live status: change over hours
    Volatile,
}

impl FieldClass {
    pub const ALL: [FieldClass; 3] = [Self::Immutable, Self::Stable, Self::Volatile];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Immutable => "immutable",
            Self::Stable => "stable",
            Self::Volatile => "volatile",
        }
    }
}

// ============================================================================
// Field Payloads
// ============================================================================

/// Prefix for fields that failed validation or have no known kind
pub const UNKNOWN_FIELD_PREFIX: &str = "unknown.";

/// Known field kinds with typed values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum KnownField {
    LegalName(String),
    RegistrationId(String),
    FoundedYear(u16),
    DisplayName(String),
    Description(String),
    Industry(String),
    EmployeeRange(String),
    Headquarters(String),
    Country(String),
    Phone(String),
    LinkedinUrl(String),
    /// Aggregate review rating, 0.0-5.0
    Rating(f64),
    OperatingStatus(String),
}

/// Names of every known field kind, in declaration order
pub const KNOWN_FIELD_NAMES: [&str; 13] = [
    "legal_name",
    "registration_id",
    "founded_year",
    "display_name",
    "description",
    "industry",
    "employee_range",
    "headquarters",
    "country",
    "phone",
    "linkedin_url",
    "rating",
    "operating_status",
];

impl KnownField {
    /// Internal field identifier
    pub fn name(&self) -> &'static str {
        match self {
            Self::LegalName(_) => "legal_name",
            Self::RegistrationId(_) => "registration_id",
            Self::FoundedYear(_) => "founded_year",
            Self::DisplayName(_) => "display_name",
            Self::Description(_) => "description",
            Self::Industry(_) => "industry",
            Self::EmployeeRange(_) => "employee_range",
            Self::Headquarters(_) => "headquarters",
            Self::Country(_) => "country",
            Self::Phone(_) => "phone",
            Self::LinkedinUrl(_) => "linkedin_url",
            Self::Rating(_) => "rating",
            Self::OperatingStatus(_) => "operating_status",
        }
    }

    pub fn class(&self) -> FieldClass {
        class_of(self.name())
    }

    /// Plain JSON value of the field
    pub fn to_value(&self) -> Value {
        match self {
            Self::FoundedYear(year) => Value::from(*year),
            Self::Rating(rating) => Value::from(*rating),
            Self::LegalName(s)
            | Self::RegistrationId(s)
            | Self::DisplayName(s)
            | Self::Description(s)
            | Self::Industry(s)
            | Self::EmployeeRange(s)
            | Self::Headquarters(s)
            | Self::Country(s)
            | Self::Phone(s)
            | Self::LinkedinUrl(s) => Value::String(s.trim().to_string()),
            Self::OperatingStatus(s) => Value::String(s.trim().to_ascii_lowercase()),
        }
    }

    /// Parse an untyped value into the known kind named `name`
    ///
    /// Returns `None` when `name` is not a known kind, `Some(Err)` when it is
    /// known but the value is malformed.
    pub fn parse(name: &str, value: &Value) -> Option<Result<KnownField, String>> {
        let text = || -> Result<String, String> {
            match value {
                Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
                Value::String(_) => Err(format!("{name}: empty string")),
                other => Err(format!("{name}: expected string, got {other}")),
            }
        };

        let parsed = match name {
            "legal_name" => text().map(Self::LegalName),
            "registration_id" => text().map(Self::RegistrationId),
            "founded_year" => parse_year(value).map(Self::FoundedYear),
            "display_name" => text().map(Self::DisplayName),
            "description" => text().map(Self::Description),
            "industry" => text().map(Self::Industry),
            "employee_range" => text().map(Self::EmployeeRange),
            "headquarters" => text().map(Self::Headquarters),
            "country" => text().map(Self::Country),
            "phone" => text().map(Self::Phone),
            "linkedin_url" => text().map(Self::LinkedinUrl),
            "rating" => parse_rating(value).map(Self::Rating),
            "operating_status" => text().map(Self::OperatingStatus),
            _ => return None,
        };
        Some(parsed.and_then(|field| field.validate().map(|()| field)))
    }

    /// Range checks for typed values
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::FoundedYear(year) if !(1600..=2100).contains(year) => {
                Err(format!("founded_year {year} out of range"))
            }
            Self::Rating(rating) if !(0.0..=5.0).contains(rating) => {
                Err(format!("rating {rating} out of range"))
            }
            Self::Country(code)
                if code.trim().len() != 2 || !code.trim().chars().all(|c| c.is_ascii_alphabetic()) =>
            {
                Err(format!("country '{code}' is not an ISO 3166 alpha-2 code"))
            }
            _ => Ok(()),
        }
    }
}

fn parse_year(value: &Value) -> Result<u16, String> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| u16::try_from(n).ok())
            .ok_or_else(|| format!("founded_year: {n} is not a year")),
        Value::String(s) => s
            .trim()
            .parse::<u16>()
            .map_err(|_| format!("founded_year: '{s}' is not a year")),
        other => Err(format!("founded_year: expected number, got {other}")),
    }
}

fn parse_rating(value: &Value) -> Result<f64, String> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| format!("rating: {n} is not a number")),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("rating: '{s}' is not a number")),
        other => Err(format!("rating: expected number, got {other}")),
    }
}

/// Field class of an internal field name
///
/// Unknown fields are treated as volatile so they are never cached longer
/// than the most conservative policy.
pub fn class_of(name: &str) -> FieldClass {
    match name {
        "legal_name" | "registration_id" | "founded_year" => FieldClass::Immutable,
        "display_name" | "description" | "industry" | "employee_range" | "headquarters"
        | "country" | "phone" | "linkedin_url" => FieldClass::Stable,
        _ => FieldClass::Volatile,
    }
}

/// Fields returned by one adapter invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldSet {
    /// Typed fields
    #[serde(default)]
    pub known: Vec<KnownField>,
    /// Untyped fields keyed by name, validated at aggregation
    #[serde(default)]
    pub extensions: BTreeMap<String, Value>,
}

/// A field after validation, ready for confidence resolution
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedField {
    pub name: String,
    pub value: Value,
    pub class: FieldClass,
}

impl FieldSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: KnownField) -> Self {
        self.known.push(field);
        self
    }

    pub fn with_extension(mut self, name: impl Into<String>, value: Value) -> Self {
        self.extensions.insert(name.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty() && self.extensions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.known.len() + self.extensions.len()
    }

    /// Validate and flatten into named fields
    ///
    /// Extension keys naming a known kind are parsed into it. Keys with no
    /// known kind, and known keys whose value is malformed, are kept under
    /// `unknown.<key>` so they stay visible instead of silently vanishing.
    /// Typed fields that fail their range check are treated the same way.
    pub fn normalize(&self) -> Vec<NormalizedField> {
        let mut out = Vec::with_capacity(self.len());

        for field in &self.known {
            match field.validate() {
                Ok(()) => out.push(NormalizedField {
                    name: field.name().to_string(),
                    value: field.to_value(),
                    class: field.class(),
                }),
                Err(reason) => {
                    tracing::debug!(field = field.name(), reason = %reason, "Typed field failed validation");
                    out.push(unknown_field(field.name(), field.to_value()));
                }
            }
        }

        for (key, value) in &self.extensions {
            let key = key.trim();
            if value.is_null() || key.is_empty() {
                continue;
            }
            match KnownField::parse(key, value) {
                Some(Ok(field)) => out.push(NormalizedField {
                    name: field.name().to_string(),
                    value: field.to_value(),
                    class: field.class(),
                }),
                Some(Err(reason)) => {
                    tracing::debug!(field = key, reason = %reason, "Extension field failed validation");
                    out.push(unknown_field(key, value.clone()));
                }
                None => out.push(unknown_field(key, value.clone())),
            }
        }

        out
    }

    /// Keep only fields whose normalized class is `class`
    pub fn retain_class(&self, class: FieldClass) -> FieldSet {
        let known = self
            .known
            .iter()
            .filter(|f| {
                let resolved = if f.validate().is_ok() {
                    f.class()
                } else {
                    FieldClass::Volatile
                };
                resolved == class
            })
            .cloned()
            .collect();
        let extensions = self
            .extensions
            .iter()
            .filter(|(key, value)| !value.is_null() && !key.trim().is_empty())
            .filter(|(key, value)| {
                let resolved = match KnownField::parse(key.trim(), value) {
                    Some(Ok(field)) => field.class(),
                    _ => FieldClass::Volatile,
                };
                resolved == class
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        FieldSet { known, extensions }
    }
}

fn unknown_field(key: &str, value: Value) -> NormalizedField {
    let name = format!("{UNKNOWN_FIELD_PREFIX}{key}");
    NormalizedField {
        class: class_of(&name),
        name,
        value,
    }
}

// ============================================================================
// Adapter Errors
// ============================================================================

/// Declared adapter error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterErrorKind {
    Timeout,
    RateLimited,
    AuthFailure,
    NotFound,
    MalformedResponse,
    Unavailable,
}

impl AdapterErrorKind {
    /// Whether the uniform retry policy may try again
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::RateLimited | Self::Unavailable)
    }

    /// Whether this outcome counts as a provider health failure
    ///
    /// NotFound is a valid answer from a healthy provider.
    pub fn counts_against_breaker(self) -> bool {
        !matches!(self, Self::NotFound)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::AuthFailure => "auth_failure",
            Self::NotFound => "not_found",
            Self::MalformedResponse => "malformed_response",
            Self::Unavailable => "unavailable",
        }
    }
}

/// Adapter failure, recovered locally into a [`SourceOutcome`]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct AdapterError {
    pub kind: AdapterErrorKind,
    pub message: String,
}

impl AdapterError {
    pub fn new(kind: AdapterErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Timeout, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Unavailable, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::MalformedResponse, message)
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Result of exactly one adapter invocation (or breaker skip)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceOutcome {
    pub adapter_name: String,
    pub tier: u8,
    pub succeeded: bool,
    pub fields: FieldSet,
    pub error_kind: Option<AdapterErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Adapter base confidence at the time of the call (0-100)
    pub base_confidence: u8,
    pub latency_ms: u64,
    /// Charged only for successful upstream calls
    pub cost_units: f64,
    pub retrieved_at: DateTime<Utc>,
    /// Upstream calls made, 0 when the breaker skipped the adapter
    pub attempts: u32,
}

impl SourceOutcome {
    pub fn success(
        adapter_name: &str,
        tier: u8,
        base_confidence: u8,
        cost_units: f64,
        fields: FieldSet,
        latency_ms: u64,
        attempts: u32,
    ) -> Self {
        Self {
            adapter_name: adapter_name.to_string(),
            tier,
            succeeded: true,
            fields,
            error_kind: None,
            error_message: None,
            base_confidence,
            latency_ms,
            cost_units,
            retrieved_at: Utc::now(),
            attempts,
        }
    }

    pub fn failure(
        adapter_name: &str,
        tier: u8,
        base_confidence: u8,
        error: AdapterError,
        latency_ms: u64,
        attempts: u32,
    ) -> Self {
        Self {
            adapter_name: adapter_name.to_string(),
            tier,
            succeeded: false,
            fields: FieldSet::default(),
            error_kind: Some(error.kind),
            error_message: Some(error.message),
            base_confidence,
            latency_ms,
            cost_units: 0.0,
            retrieved_at: Utc::now(),
            attempts,
        }
    }
}

/// All outcomes of one tier, append-only once built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierResult {
    pub tier_number: u8,
    pub outcomes: Vec<SourceOutcome>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub succeeded_count: usize,
    pub attempted_count: usize,
    /// Replayed from cache, no upstream cost
    #[serde(default)]
    pub from_cache: bool,
}

impl TierResult {
    /// Build a tier result; outcomes are ordered by adapter name
    pub fn new(tier_number: u8, mut outcomes: Vec<SourceOutcome>, started_at: DateTime<Utc>) -> Self {
        outcomes.sort_by(|a, b| a.adapter_name.cmp(&b.adapter_name));
        let succeeded_count = outcomes.iter().filter(|o| o.succeeded).count();
        let attempted_count = outcomes.len();
        Self {
            tier_number,
            outcomes,
            started_at,
            completed_at: Utc::now(),
            succeeded_count,
            attempted_count,
            from_cache: false,
        }
    }

    /// Upstream cost of this tier (zero for cache replays)
    pub fn cost(&self) -> f64 {
        if self.from_cache {
            return 0.0;
        }
        self.outcomes
            .iter()
            .filter(|o| o.succeeded)
            .map(|o| o.cost_units)
            .sum()
    }

    pub fn duration_ms(&self) -> u64 {
        (self.completed_at - self.started_at).num_milliseconds().max(0) as u64
    }

    pub fn all_failed(&self) -> bool {
        self.succeeded_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_domain_key_strips_scheme_path_port_and_www() {
        let key = DomainKey::parse("https://WWW.Acme.Test:443/about?x=1#top").unwrap();
        assert_eq!(key.as_str(), "acme.test");
    }

    #[test]
    fn test_domain_key_strips_trailing_dot_and_userinfo() {
        assert_eq!(DomainKey::parse("user@acme.test.").unwrap().as_str(), "acme.test");
    }

    #[test]
    fn test_domain_key_rejects_bad_input() {
        assert_eq!(DomainKey::parse("   "), Err(DomainKeyError::Empty));
        assert!(matches!(DomainKey::parse("localhost"), Err(DomainKeyError::MissingDot(_))));
        assert!(matches!(
            DomainKey::parse("acme corp.test"),
            Err(DomainKeyError::InvalidCharacters(_))
        ));
        assert!(matches!(DomainKey::parse("-acme.test"), Err(DomainKeyError::InvalidLabel(_))));
        assert!(matches!(DomainKey::parse("acme..test"), Err(DomainKeyError::InvalidLabel(_))));
    }

    #[test]
    fn test_known_field_serializes_tagged() {
        let field = KnownField::FoundedYear(1999);
        let encoded = serde_json::to_value(&field).unwrap();
        assert_eq!(encoded, json!({"field": "founded_year", "value": 1999}));
    }

    #[test]
    fn test_known_field_names_match_parse_table() {
        for name in KNOWN_FIELD_NAMES {
            assert!(KnownField::parse(name, &json!("x")).is_some(), "{name} not parseable");
        }
    }

    #[test]
    fn test_extension_with_known_name_is_typed() {
        let set = FieldSet::new().with_extension("founded_year", json!("1987"));
        let fields = set.normalize();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].name, "founded_year");
        assert_eq!(fields[0].value, json!(1987));
        assert_eq!(fields[0].class, FieldClass::Immutable);
    }

    #[test]
    fn test_typo_surfaces_as_unknown_field() {
        let set = FieldSet::new().with_extension("foundedyear", json!(1987));
        let fields = set.normalize();
        assert_eq!(fields[0].name, "unknown.foundedyear");
        assert_eq!(fields[0].class, FieldClass::Volatile);
    }

    #[test]
    fn test_malformed_known_value_surfaces_as_unknown() {
        let set = FieldSet::new()
            .with_extension("rating", json!(9.5))
            .with(KnownField::Country("Germany".to_string()));
        let names: Vec<String> = set.normalize().into_iter().map(|f| f.name).collect();
        assert!(names.contains(&"unknown.rating".to_string()));
        assert!(names.contains(&"unknown.country".to_string()));
    }

    #[test]
    fn test_retain_class_partitions_fields() {
        let set = FieldSet::new()
            .with(KnownField::LegalName("Acme Inc.".to_string()))
            .with(KnownField::Industry("Widgets".to_string()))
            .with_extension("rating", json!(4.2));
        assert_eq!(set.retain_class(FieldClass::Immutable).len(), 1);
        assert_eq!(set.retain_class(FieldClass::Stable).len(), 1);
        assert_eq!(set.retain_class(FieldClass::Volatile).len(), 1);
    }

    #[test]
    fn test_error_kind_policies() {
        assert!(AdapterErrorKind::RateLimited.is_retryable());
        assert!(!AdapterErrorKind::Timeout.is_retryable());
        assert!(!AdapterErrorKind::NotFound.counts_against_breaker());
        assert!(AdapterErrorKind::AuthFailure.counts_against_breaker());
    }

    #[test]
    fn test_tier_result_cost_counts_successes_only() {
        let ok = SourceOutcome::success("a", 1, 60, 0.25, FieldSet::new(), 10, 1);
        let failed = SourceOutcome::failure("b", 1, 60, AdapterError::timeout("slow"), 10, 1);
        let mut result = TierResult::new(1, vec![failed, ok], Utc::now());
        assert_eq!(result.outcomes[0].adapter_name, "a");
        assert_eq!(result.succeeded_count, 1);
        assert_eq!(result.attempted_count, 2);
        assert!((result.cost() - 0.25).abs() < f64::EPSILON);

        result.from_cache = true;
        assert_eq!(result.cost(), 0.0);
    }
}
