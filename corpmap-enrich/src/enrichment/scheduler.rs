//! Layer scheduler: fan-out/fan-in for one tier
//!
//! Every adapter of the tier runs in its own task. Each call is gated by the
//! adapter's circuit breaker, bounded by min(adapter timeout, tier deadline)
//! and retried under one uniform policy. The scheduler always returns a
//! [`TierResult`], even when every adapter failed.

use super::breaker::CircuitBreakerRegistry;
use crate::adapters::{AdapterContext, SourceAdapter};
use crate::types::{AdapterError, AdapterErrorKind, SourceOutcome, TierResult};
use chrono::Utc;
use corpmap_common::time::duration_to_millis;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Time allowed for tasks to report after the tier deadline before they are aborted
const ABORT_GRACE: Duration = Duration::from_millis(50);

/// Uniform retry policy for adapter calls
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Whether attempt number `attempts` may be followed by another
    ///
    /// Only transient kinds are retried, and only while the call deadline
    /// leaves room for the backoff.
    pub fn should_retry(&self, attempts: u32, kind: AdapterErrorKind, call_deadline: Instant) -> bool {
        attempts < self.max_attempts
            && kind.is_retryable()
            && Instant::now() + self.backoff < call_deadline
    }
}

pub struct LayerScheduler {
    breakers: Arc<CircuitBreakerRegistry>,
    retry: RetryPolicy,
    default_timeout: Duration,
}

impl LayerScheduler {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>, retry: RetryPolicy, default_timeout: Duration) -> Self {
        Self {
            breakers,
            retry,
            default_timeout,
        }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Run every adapter of one tier and collect their outcomes
    ///
    /// `cancel` ends outstanding calls early (recorded as Timeout). Tasks
    /// still running after the tier deadline plus a short grace are aborted
    /// and also recorded as Timeout.
    pub async fn run_tier(
        &self,
        tier: u8,
        adapters: &[Arc<dyn SourceAdapter>],
        ctx: AdapterContext,
        tier_deadline: Instant,
        cancel: CancellationToken,
    ) -> TierResult {
        let started_at = Utc::now();
        let ctx = Arc::new(ctx);
        let mut tasks = JoinSet::new();

        info!(
            domain = %ctx.domain_key,
            tier = tier,
            adapters = adapters.len(),
            "Starting tier"
        );

        for adapter in adapters {
            let call = AdapterCall {
                adapter: Arc::clone(adapter),
                ctx: Arc::clone(&ctx),
                breakers: Arc::clone(&self.breakers),
                retry: self.retry,
                default_timeout: self.default_timeout,
                tier_deadline,
                cancel: cancel.clone(),
            };
            tasks.spawn(call.run());
        }

        let mut outcomes = Vec::with_capacity(adapters.len());
        let mut aborted = false;
        let collect_deadline = tier_deadline + ABORT_GRACE;

        loop {
            match tokio::time::timeout_at(collect_deadline, tasks.join_next()).await {
                Ok(Some(Ok(outcome))) => outcomes.push(outcome),
                Ok(Some(Err(e))) => {
                    warn!(domain = %ctx.domain_key, tier = tier, error = %e, "Adapter task failed");
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        domain = %ctx.domain_key,
                        tier = tier,
                        outstanding = tasks.len(),
                        "Tier deadline passed, aborting outstanding adapter calls"
                    );
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    aborted = true;
                    break;
                }
            }
        }

        // Adapters whose task never reported
        let reported: HashSet<String> = outcomes.iter().map(|o| o.adapter_name.clone()).collect();
        for adapter in adapters.iter().filter(|a| !reported.contains(a.name())) {
            let error = if aborted {
                AdapterError::timeout("tier deadline exceeded")
            } else {
                AdapterError::unavailable("adapter task panicked")
            };
            outcomes.push(SourceOutcome::failure(
                adapter.name(),
                tier,
                adapter.base_confidence(),
                error,
                duration_to_millis((Utc::now() - started_at).to_std().unwrap_or_default()),
                1,
            ));
        }

        let result = TierResult::new(tier, outcomes, started_at);
        info!(
            domain = %ctx.domain_key,
            tier = tier,
            succeeded = result.succeeded_count,
            attempted = result.attempted_count,
            duration_ms = result.duration_ms(),
            "Tier finished"
        );
        result
    }
}

/// One adapter invocation including retries
struct AdapterCall {
    adapter: Arc<dyn SourceAdapter>,
    ctx: Arc<AdapterContext>,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: RetryPolicy,
    default_timeout: Duration,
    tier_deadline: Instant,
    cancel: CancellationToken,
}

impl AdapterCall {
    async fn run(self) -> SourceOutcome {
        let name = self.adapter.name().to_string();
        let tier = self.ctx.tier_number;
        let confidence = self.adapter.base_confidence();
        let started = Instant::now();
        let call_deadline = (started + self.adapter.timeout().unwrap_or(self.default_timeout))
            .min(self.tier_deadline);
        let mut attempts = 0u32;
        let mut last_error: Option<AdapterError> = None;

        loop {
            let Some(permit) = self.breakers.can_invoke(&name) else {
                // A retry can find the breaker tripped by its own previous attempt
                let error = last_error.unwrap_or_else(|| {
                    debug!(adapter = %name, tier = tier, "Circuit open, adapter skipped");
                    AdapterError::unavailable("circuit breaker open")
                });
                return SourceOutcome::failure(&name, tier, confidence, error, elapsed_ms(started), attempts);
            };
            attempts += 1;

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(AdapterError::timeout("call cancelled")),
                result = tokio::time::timeout_at(call_deadline, self.adapter.fetch(&self.ctx, call_deadline)) => {
                    result.unwrap_or_else(|_| Err(AdapterError::timeout(format!(
                        "no response within {}ms",
                        duration_to_millis(call_deadline.saturating_duration_since(started))
                    ))))
                }
            };
            permit.record(result.as_ref().err().map(|e| e.kind));

            match result {
                Ok(fields) => {
                    debug!(adapter = %name, tier = tier, fields = fields.len(), attempts = attempts, "Adapter succeeded");
                    return SourceOutcome::success(
                        &name,
                        tier,
                        confidence,
                        self.adapter.cost_units(),
                        fields,
                        elapsed_ms(started),
                        attempts,
                    );
                }
                Err(e) if self.retry.should_retry(attempts, e.kind, call_deadline) => {
                    debug!(adapter = %name, tier = tier, error = %e, "Retrying adapter after backoff");
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => {
                            return SourceOutcome::failure(&name, tier, confidence, e, elapsed_ms(started), attempts);
                        }
                        _ = tokio::time::sleep(self.retry.backoff) => {}
                    }
                    last_error = Some(e);
                }
                Err(e) => {
                    debug!(adapter = %name, tier = tier, error = %e, "Adapter failed");
                    return SourceOutcome::failure(&name, tier, confidence, e, elapsed_ms(started), attempts);
                }
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    duration_to_millis(started.elapsed())
}
