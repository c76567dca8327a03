//! Per-adapter circuit breakers
//!
//! States:
//!   Closed   - calls pass through, consecutive failures are counted
//!   Open     - calls rejected until the cool-down elapses
//!   HalfOpen - one probe call at a time; `success_threshold` consecutive
//!              probe successes close the breaker, any probe failure reopens it
//!
//! Every admitted call holds an [`InvokePermit`]. A permit dropped without
//! being recorded (task aborted at a deadline, adapter panic) counts as a
//! failure, so a half-open probe can never stay in flight forever.

use crate::types::AdapterErrorKind;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Breaker tuning, shared by every adapter
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub cool_down: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cool_down: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    status: BreakerStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            status: BreakerStatus::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }

    fn open(&mut self, now: Instant) {
        self.status = BreakerStatus::Open;
        self.opened_at = Some(now);
        self.consecutive_successes = 0;
        self.probe_in_flight = false;
    }
}

/// Point-in-time view of one breaker, for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub adapter_name: String,
    pub state: BreakerStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub probe_in_flight: bool,
}

type SharedState = Arc<Mutex<BreakerState>>;

fn lock(state: &Mutex<BreakerState>) -> MutexGuard<'_, BreakerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Process-wide breaker registry, one breaker per adapter name
///
/// The registry map lock is held only to find or create a breaker; each
/// breaker has its own lock, so unrelated adapters never contend.
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, SharedState>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn breaker(&self, adapter: &str) -> SharedState {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            breakers
                .entry(adapter.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(BreakerState::new()))),
        )
    }

    /// Create the closed breaker for `adapter` ahead of its first call
    pub fn register(&self, adapter: &str) {
        let _ = self.breaker(adapter);
    }

    /// Ask to call `adapter`; `None` means the breaker rejects the call
    ///
    /// When open and the cool-down has elapsed, the breaker moves to
    /// half-open and admits exactly one probe. Concurrent callers see `None`
    /// until that probe is recorded.
    pub fn can_invoke(&self, adapter: &str) -> Option<InvokePermit> {
        let shared = self.breaker(adapter);
        let probe = {
            let mut state = lock(&shared);
            match state.status {
                BreakerStatus::Closed => false,
                BreakerStatus::Open => {
                    let cooled = state
                        .opened_at
                        .map_or(true, |at| at.elapsed() >= self.config.cool_down);
                    if !cooled {
                        return None;
                    }
                    info!(adapter = adapter, "Circuit breaker half-open, admitting probe");
                    state.status = BreakerStatus::HalfOpen;
                    state.consecutive_successes = 0;
                    state.probe_in_flight = true;
                    true
                }
                BreakerStatus::HalfOpen => {
                    if state.probe_in_flight {
                        return None;
                    }
                    state.probe_in_flight = true;
                    true
                }
            }
        };

        Some(InvokePermit {
            adapter: adapter.to_string(),
            state: shared,
            config: self.config,
            probe,
            recorded: false,
        })
    }

    pub fn status(&self, adapter: &str) -> BreakerStatus {
        lock(&self.breaker(adapter)).status
    }

    /// Snapshot of every known breaker, ordered by adapter name
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<(String, SharedState)> = {
            let map = self
                .breakers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            map.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect()
        };

        let mut out: Vec<BreakerSnapshot> = breakers
            .into_iter()
            .map(|(adapter_name, shared)| {
                let state = lock(&shared);
                BreakerSnapshot {
                    adapter_name,
                    state: state.status,
                    consecutive_failures: state.consecutive_failures,
                    consecutive_successes: state.consecutive_successes,
                    probe_in_flight: state.probe_in_flight,
                }
            })
            .collect();
        out.sort_by(|a, b| a.adapter_name.cmp(&b.adapter_name));
        out
    }
}

/// Admission to make one upstream call
#[must_use = "an unrecorded permit counts as a failure when dropped"]
pub struct InvokePermit {
    adapter: String,
    state: SharedState,
    config: BreakerConfig,
    probe: bool,
    recorded: bool,
}

impl InvokePermit {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Record the call result; `None` is success
    ///
    /// `NotFound` is a valid answer from a healthy provider: it neither
    /// trips nor resets a closed breaker, and a half-open probe answered
    /// with it counts as a successful probe.
    pub fn record(mut self, error: Option<AdapterErrorKind>) {
        self.recorded = true;
        match error {
            Some(kind) if !kind.counts_against_breaker() && !self.probe => {}
            _ => self.apply(error.is_some_and(|kind| kind.counts_against_breaker())),
        }
    }

    fn apply(&self, failed: bool) {
        let mut state = lock(&self.state);
        let now = Instant::now();

        if self.probe {
            // Only the probe that half-open admitted may move the breaker
            if state.status != BreakerStatus::HalfOpen {
                return;
            }
            state.probe_in_flight = false;
            if failed {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                state.open(now);
                warn!(adapter = %self.adapter, "Probe failed, circuit breaker reopened");
            } else {
                state.consecutive_successes += 1;
                if state.consecutive_successes >= self.config.success_threshold {
                    state.status = BreakerStatus::Closed;
                    state.consecutive_failures = 0;
                    state.consecutive_successes = 0;
                    state.opened_at = None;
                    info!(adapter = %self.adapter, "Circuit breaker closed");
                }
            }
            return;
        }

        // Results of calls admitted while closed only count while still closed
        if state.status != BreakerStatus::Closed {
            return;
        }
        if failed {
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            if state.consecutive_failures >= self.config.failure_threshold {
                state.open(now);
                warn!(
                    adapter = %self.adapter,
                    failures = state.consecutive_failures,
                    cool_down_ms = self.config.cool_down.as_millis() as u64,
                    "Circuit breaker tripped"
                );
            }
        } else {
            state.consecutive_failures = 0;
        }
    }
}

impl Drop for InvokePermit {
    fn drop(&mut self) {
        if !self.recorded {
            self.apply(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(failure_threshold: u32, success_threshold: u32) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(BreakerConfig {
            failure_threshold,
            success_threshold,
            cool_down: Duration::from_secs(60),
        })
    }

    fn fail(registry: &CircuitBreakerRegistry, adapter: &str, times: u32) {
        for _ in 0..times {
            registry
                .can_invoke(adapter)
                .unwrap()
                .record(Some(AdapterErrorKind::Unavailable));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_trips_after_threshold_and_admits_one_probe_after_cool_down() {
        let breakers = registry(5, 1);
        fail(&breakers, "geo", 4);
        assert_eq!(breakers.status("geo"), BreakerStatus::Closed);
        fail(&breakers, "geo", 1);
        assert_eq!(breakers.status("geo"), BreakerStatus::Open);

        assert!(breakers.can_invoke("geo").is_none());
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(breakers.can_invoke("geo").is_none());
        tokio::time::advance(Duration::from_secs(1)).await;

        let probe = breakers.can_invoke("geo").unwrap();
        assert!(probe.is_probe());
        assert!(breakers.can_invoke("geo").is_none());
        assert!(breakers.can_invoke("geo").is_none());

        probe.record(None);
        assert_eq!(breakers.status("geo"), BreakerStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_reopens_and_resets_cool_down() {
        let breakers = registry(2, 1);
        fail(&breakers, "geo", 2);
        tokio::time::advance(Duration::from_secs(60)).await;

        breakers
            .can_invoke("geo")
            .unwrap()
            .record(Some(AdapterErrorKind::Timeout));

        assert_eq!(breakers.status("geo"), BreakerStatus::Open);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breakers.can_invoke("geo").is_none());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breakers.can_invoke("geo").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_threshold_requires_consecutive_probes() {
        let breakers = registry(1, 3);
        fail(&breakers, "geo", 1);
        tokio::time::advance(Duration::from_secs(60)).await;

        for _ in 0..2 {
            breakers.can_invoke("geo").unwrap().record(None);
            assert_eq!(breakers.status("geo"), BreakerStatus::HalfOpen);
        }
        breakers.can_invoke("geo").unwrap().record(None);
        assert_eq!(breakers.status("geo"), BreakerStatus::Closed);
    }

    #[test]
    fn test_not_found_does_not_count_as_failure() {
        let breakers = registry(2, 1);
        for _ in 0..10 {
            breakers
                .can_invoke("registry")
                .unwrap()
                .record(Some(AdapterErrorKind::NotFound));
        }
        assert_eq!(breakers.status("registry"), BreakerStatus::Closed);
    }

    #[test]
    fn test_not_found_does_not_reset_failure_count() {
        let breakers = registry(2, 1);
        fail(&breakers, "registry", 1);
        breakers
            .can_invoke("registry")
            .unwrap()
            .record(Some(AdapterErrorKind::NotFound));
        assert_eq!(breakers.snapshot()[0].consecutive_failures, 1);

        fail(&breakers, "registry", 1);
        assert_eq!(breakers.status("registry"), BreakerStatus::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_in_half_open_closes_breaker() {
        let breakers = registry(1, 1);
        fail(&breakers, "registry", 1);
        tokio::time::advance(Duration::from_secs(60)).await;

        breakers
            .can_invoke("registry")
            .unwrap()
            .record(Some(AdapterErrorKind::NotFound));
        assert_eq!(breakers.status("registry"), BreakerStatus::Closed);
    }

    #[test]
    fn test_registered_breakers_appear_before_any_call() {
        let breakers = registry(1, 1);
        breakers.register("website");
        breakers.register("geo");
        breakers.register("geo");

        let snapshot = breakers.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[1].adapter_name, "website");
        assert_eq!(snapshot[1].state, BreakerStatus::Closed);
        assert_eq!(snapshot[1].consecutive_failures, 0);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breakers = registry(3, 1);
        fail(&breakers, "geo", 2);
        breakers.can_invoke("geo").unwrap().record(None);
        fail(&breakers, "geo", 2);
        assert_eq!(breakers.status("geo"), BreakerStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_counts_as_failure() {
        let breakers = registry(1, 1);
        fail(&breakers, "geo", 1);
        tokio::time::advance(Duration::from_secs(60)).await;

        let probe = breakers.can_invoke("geo").unwrap();
        drop(probe);

        assert_eq!(breakers.status("geo"), BreakerStatus::Open);
        assert!(breakers.can_invoke("geo").is_none());
    }

    #[test]
    fn test_breakers_are_independent() {
        let breakers = registry(1, 1);
        fail(&breakers, "geo", 1);
        assert!(breakers.can_invoke("geo").is_none());
        breakers.can_invoke("registry").unwrap().record(None);

        let snapshot = breakers.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].adapter_name, "geo");
        assert_eq!(snapshot[0].state, BreakerStatus::Open);
    }
}
