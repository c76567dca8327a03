//! Configurable JSON provider adapter
//!
//! One `[[adapters]]` table in the TOML config becomes one adapter: a GET
//! against a URL template, an optional API key header, and a map from field
//! name to JSON pointer into the response body. Values land in the field
//! set's extension map and are typed when folded into the session.

use super::{classify_reqwest_error, classify_status, remaining, AdapterContext, SourceAdapter};
use crate::types::{AdapterError, AdapterErrorKind, FieldSet};
use corpmap_common::config::{get_user_agent, AdapterConfig};
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde_json::Value;
use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::time::Duration;
use tokio::time::Instant;

type DirectLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// JSON-over-HTTP provider
pub struct HttpJsonAdapter {
    client: Client,
    name: String,
    tier: u8,
    cost_units: f64,
    base_confidence: u8,
    timeout: Option<Duration>,
    url_template: String,
    api_key: Option<(String, String)>,
    /// Set when the config names a key variable that is not present
    missing_key_env: Option<String>,
    fields: BTreeMap<String, String>,
    rate_limiter: Option<DirectLimiter>,
}

impl HttpJsonAdapter {
    pub fn from_config(config: &AdapterConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(get_user_agent())
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        let mut api_key = None;
        let mut missing_key_env = None;
        if let Some(var) = &config.api_key_env {
            match std::env::var(var) {
                Ok(key) if !key.trim().is_empty() => {
                    api_key = Some((config.api_key_header.clone(), key));
                }
                _ => {
                    tracing::warn!(
                        adapter = %config.name,
                        env = %var,
                        "API key environment variable not set; calls will fail with auth_failure"
                    );
                    missing_key_env = Some(var.clone());
                }
            }
        }

        let rate_limiter = config
            .requests_per_second
            .and_then(NonZeroU32::new)
            .map(|rps| RateLimiter::direct(Quota::per_second(rps)));

        Ok(Self {
            client,
            name: config.name.clone(),
            tier: config.tier,
            cost_units: config.cost_units,
            base_confidence: config.base_confidence,
            timeout: config.timeout_ms.map(Duration::from_millis),
            url_template: config.url_template.clone(),
            api_key,
            missing_key_env,
            fields: config.fields.clone(),
            rate_limiter,
        })
    }

    /// Substitute `{domain}` and `{field}` placeholders
    ///
    /// A placeholder naming a field no earlier tier produced means this
    /// provider has nothing to look up yet.
    fn render_url(&self, ctx: &AdapterContext) -> Result<String, AdapterError> {
        let mut url = String::with_capacity(self.url_template.len());
        let mut rest = self.url_template.as_str();

        while let Some(start) = rest.find('{') {
            url.push_str(&rest[..start]);
            let Some(len) = rest[start..].find('}') else {
                url.push_str(&rest[start..]);
                rest = "";
                break;
            };
            let key = &rest[start + 1..start + len];
            let value = if key == "domain" {
                ctx.domain_key.as_str().to_string()
            } else {
                match ctx.accumulated_fields.get(key) {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) if !other.is_null() => other.to_string(),
                    _ => {
                        return Err(AdapterError::new(
                            AdapterErrorKind::NotFound,
                            format!("{}: field '{key}' not available for lookup", self.name),
                        ))
                    }
                }
            };
            url.push_str(&percent_encode(&value));
            rest = &rest[start + len + 1..];
        }
        url.push_str(rest);
        Ok(url)
    }

    fn extract(&self, body: &Value) -> FieldSet {
        let mut fields = FieldSet::new();
        for (name, pointer) in &self.fields {
            if let Some(value) = body.pointer(pointer).filter(|v| !v.is_null()) {
                fields = fields.with_extension(name.clone(), value.clone());
            }
        }
        fields
    }
}

#[async_trait::async_trait]
impl SourceAdapter for HttpJsonAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn tier(&self) -> u8 {
        self.tier
    }

    fn cost_units(&self) -> f64 {
        self.cost_units
    }

    fn base_confidence(&self) -> u8 {
        self.base_confidence
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn fetch(&self, ctx: &AdapterContext, deadline: Instant) -> Result<FieldSet, AdapterError> {
        if let Some(var) = &self.missing_key_env {
            return Err(AdapterError::new(
                AdapterErrorKind::AuthFailure,
                format!("{}: API key variable {var} is not set", self.name),
            ));
        }

        let url = self.render_url(ctx)?;

        if let Some(limiter) = &self.rate_limiter {
            tokio::time::timeout_at(deadline, limiter.until_ready())
                .await
                .map_err(|_| {
                    AdapterError::timeout(format!("{}: deadline passed waiting for rate limit", self.name))
                })?;
        }

        let budget = remaining(&self.name, deadline)?;
        tracing::debug!(adapter = %self.name, domain = %ctx.domain_key, "Querying provider");

        let mut request = self.client.get(&url).timeout(budget);
        if let Some((header, key)) = &self.api_key {
            request = request.header(header.as_str(), key.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&self.name, &e))?;

        if let Some(err) = classify_status(&self.name, response.status()) {
            return Err(err);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| classify_reqwest_error(&self.name, &e))?;

        let fields = self.extract(&body);
        if fields.is_empty() {
            return Err(AdapterError::new(
                AdapterErrorKind::NotFound,
                format!("{}: no mapped fields in response for {}", self.name, ctx.domain_key),
            ));
        }
        Ok(fields)
    }
}

/// Percent-encode everything outside the RFC 3986 unreserved set
fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
