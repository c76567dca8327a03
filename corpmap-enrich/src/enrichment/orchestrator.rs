//! Progressive enrichment orchestrator
//!
//! One task per session drives tiers 1..=N in order. For every tier:
//! 1. Fresh cached tier data short-circuits the tier
//! 2. Otherwise the session joins the live computation for (domain, tier)
//!    or starts one (scheduler run, then cache write)
//! 3. The tier result is folded into the session and a `tier_k_complete`
//!    event is published
//! 4. A snapshot is queued for the session store
//!
//! The whole loop runs under the session deadline. Tier computations are
//! detached from the session, so a timed-out or disconnected session never
//! cancels work other sessions (or the cache) can still use.

use super::aggregator::FieldAggregator;
use super::breaker::{BreakerConfig, BreakerSnapshot, CircuitBreakerRegistry};
use super::cache::TieredCache;
use super::error::OrchestrationError;
use super::inflight::InFlightRegistry;
use super::publisher::{EventPublisher, EventReceiver, TerminalKind};
use super::scheduler::{LayerScheduler, RetryPolicy};
use super::session::{EnrichmentSession, SessionStatus};
use crate::adapters::{AdapterContext, AdapterRegistry, SourceAdapter};
use crate::db::SessionStore;
use crate::types::{DomainKey, TierResult};
use corpmap_common::config::OrchestratorConfig;
use corpmap_common::time::{millis_to_duration, WallClock};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Longest the terminal event waits for the final snapshot write
const FINAL_SNAPSHOT_WAIT: Duration = Duration::from_secs(1);

/// Runtime tuning derived from the `[orchestrator]` config section
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub adapter_timeout: Duration,
    pub tier_deadline: Duration,
    pub session_deadline: Duration,
    pub session_retention: Duration,
    pub breaker: BreakerConfig,
    pub retry: RetryPolicy,
    pub agreement_bonus: u8,
    pub conflict_penalty: u8,
}

impl From<&OrchestratorConfig> for OrchestratorSettings {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            adapter_timeout: millis_to_duration(config.adapter_timeout_ms),
            tier_deadline: millis_to_duration(config.tier_deadline_ms),
            session_deadline: millis_to_duration(config.session_deadline_ms),
            session_retention: Duration::from_secs(config.session_retention_secs),
            breaker: BreakerConfig {
                failure_threshold: config.failure_threshold,
                success_threshold: config.success_threshold,
                cool_down: millis_to_duration(config.cool_down_ms),
            },
            retry: RetryPolicy {
                max_attempts: config.retry_max_attempts,
                backoff: millis_to_duration(config.retry_backoff_ms),
            },
            agreement_bonus: config.agreement_bonus,
            conflict_penalty: config.conflict_penalty,
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&OrchestratorConfig::default())
    }
}

/// A started session: its id, its event stream and the driving task
pub struct SessionHandle {
    pub session_id: Uuid,
    pub events: EventReceiver,
    /// Resolves to the final session; dropping it detaches the task
    pub task: JoinHandle<EnrichmentSession>,
}

/// Shared orchestrator, cheap to clone
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<AdapterRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    scheduler: LayerScheduler,
    inflight: InFlightRegistry,
    cache: Arc<TieredCache>,
    aggregator: FieldAggregator,
    sessions: Arc<dyn SessionStore>,
    settings: OrchestratorSettings,
    clock: WallClock,
    shutdown: CancellationToken,
    active_sessions: AtomicUsize,
}

/// Counts a session as active until dropped
struct ActiveSession(Arc<Inner>);

impl ActiveSession {
    fn enter(inner: &Arc<Inner>) -> Self {
        inner.active_sessions.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(inner))
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.0.active_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

/// How the tier loop ended
enum LoopEnd {
    Finished,
    Failed(OrchestrationError),
    DeadlineExceeded,
    Shutdown,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<AdapterRegistry>,
        cache: Arc<TieredCache>,
        sessions: Arc<dyn SessionStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        let breakers = Arc::new(CircuitBreakerRegistry::new(settings.breaker));
        for tier in registry.tiers() {
            for adapter in registry.adapters_for(tier) {
                breakers.register(adapter.name());
            }
        }
        let scheduler = LayerScheduler::new(Arc::clone(&breakers), settings.retry, settings.adapter_timeout);
        let aggregator = FieldAggregator::new(
            Arc::clone(&registry),
            settings.agreement_bonus,
            settings.conflict_penalty,
        );

        Self {
            inner: Arc::new(Inner {
                registry,
                breakers,
                scheduler,
                inflight: InFlightRegistry::new(),
                cache,
                aggregator,
                sessions,
                settings,
                clock: WallClock::new(),
                shutdown: CancellationToken::new(),
                active_sessions: AtomicUsize::new(0),
            }),
        }
    }

    /// Create a session for `domain` and start driving it in the background
    pub fn start(&self, domain: DomainKey) -> SessionHandle {
        let inner = &self.inner;
        let session = EnrichmentSession::new(
            domain,
            u8::try_from(inner.registry.tiers().len()).unwrap_or(u8::MAX),
            inner.clock.now(),
            inner.settings.session_retention,
        );
        let session_id = session.session_id;
        let (publisher, events) = EventPublisher::channel(session_id);

        let active = ActiveSession::enter(inner);
        let task = tokio::spawn(drive(Arc::clone(inner), session, publisher, active));

        SessionHandle {
            session_id,
            events,
            task,
        }
    }

    /// Latest stored snapshot of a session
    pub async fn session(&self, session_id: Uuid) -> Result<Option<EnrichmentSession>, OrchestrationError> {
        self.inner
            .sessions
            .get(session_id)
            .await
            .map_err(|e| OrchestrationError::PersistenceUnavailable(e.to_string()))
    }

    /// Sessions currently being driven
    pub fn active_sessions(&self) -> usize {
        self.inner.active_sessions.load(Ordering::SeqCst)
    }

    /// Live (domain, tier) computations
    pub fn inflight_computations(&self) -> usize {
        self.inner.inflight.len()
    }

    pub fn breaker_snapshot(&self) -> Vec<BreakerSnapshot> {
        self.inner.breakers.snapshot()
    }

    pub fn session_store(&self) -> Arc<dyn SessionStore> {
        Arc::clone(&self.inner.sessions)
    }

    /// Token that ends running sessions (in error) and cancels tier work
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }
}

impl Inner {
    /// Result of one tier: from cache, from a live computation, or fresh
    async fn tier_result(
        self: &Arc<Self>,
        domain: &DomainKey,
        tier: u8,
        accumulated_fields: BTreeMap<String, Value>,
    ) -> Result<TierResult, OrchestrationError> {
        if let Some(cached) = self.cache.get_tier(domain, tier).await {
            debug!(domain = %domain, tier = tier, "Tier served from cache");
            return Ok(cached);
        }

        // Bounded by the tier deadline alone: the computation may outlive
        // the session that started it and serve later joiners
        let tier_deadline = Instant::now() + self.settings.tier_deadline;
        let ctx = AdapterContext {
            domain_key: domain.clone(),
            accumulated_fields,
            tier_number: tier,
        };

        let (future, attachment) = self.inflight.get_or_start(domain, tier, || {
            let inner = Arc::clone(self);
            let adapters = self.registry.adapters_for(tier);
            let cancel = self.shutdown.child_token();
            let domain = domain.clone();
            async move {
                // A computation that finished after our lookup above has
                // already written the cache and left the registry
                if let Some(cached) = inner.cache.get_tier(&domain, tier).await {
                    debug!(domain = %domain, tier = tier, "Tier cached while joining, adapters not called");
                    return cached;
                }
                let result = inner
                    .scheduler
                    .run_tier(tier, &adapters, ctx, tier_deadline, cancel)
                    .await;
                inner.cache.put_tier(&domain, &result).await;
                result
            }
        });
        debug!(domain = %domain, tier = tier, attachment = ?attachment, "Awaiting tier computation");

        future
            .await
            .map_err(|e| OrchestrationError::Internal(e.to_string()))
    }
}

/// Queues snapshots for the session store in order, off the session task
struct SnapshotWriter {
    tx: mpsc::UnboundedSender<EnrichmentSession>,
    task: JoinHandle<()>,
}

impl SnapshotWriter {
    fn spawn(store: Arc<dyn SessionStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<EnrichmentSession>();
        let task = tokio::spawn(async move {
            while let Some(snapshot) = rx.recv().await {
                persist(store.as_ref(), &snapshot).await;
            }
        });
        Self { tx, task }
    }

    fn push(&self, session: &EnrichmentSession) {
        let _ = self.tx.send(session.clone());
    }

    /// Wait until every queued snapshot is written
    async fn finish(self) {
        drop(self.tx);
        let _ = self.task.await;
    }
}

async fn persist(store: &dyn SessionStore, session: &EnrichmentSession) {
    if let Err(e) = store.put(session).await {
        let err = OrchestrationError::PersistenceUnavailable(e.to_string());
        warn!(session_id = %session.session_id, error = %err, "Session snapshot not stored");
    }
}

async fn run_tiers(
    inner: &Arc<Inner>,
    session: &mut EnrichmentSession,
    publisher: &mut EventPublisher,
    writer: &SnapshotWriter,
    started: Instant,
) -> Result<(), OrchestrationError> {
    for tier in inner.registry.tiers() {
        let result = inner
            .tier_result(&session.domain_key, tier, session.accumulated_fields())
            .await?;

        let deltas = session
            .record_tier(result, &inner.aggregator)
            .map_err(|e| OrchestrationError::Internal(e.to_string()))?;
        session.set_elapsed(started.elapsed());

        info!(
            session_id = %session.session_id,
            domain = %session.domain_key,
            tier = tier,
            deltas = deltas.len(),
            total_cost = session.total_cost,
            "Tier complete"
        );

        publisher.publish_tier(session, deltas);
        writer.push(session);
    }
    Ok(())
}

async fn drive(
    inner: Arc<Inner>,
    mut session: EnrichmentSession,
    mut publisher: EventPublisher,
    _active: ActiveSession,
) -> EnrichmentSession {
    let started = Instant::now();
    let session_deadline = started + inner.settings.session_deadline;

    info!(
        session_id = %session.session_id,
        domain = %session.domain_key,
        tiers = session.planned_tiers,
        "Enrichment session started"
    );

    let writer = SnapshotWriter::spawn(Arc::clone(&inner.sessions));
    writer.push(&session);

    let end = tokio::select! {
        biased;
        _ = inner.shutdown.cancelled() => LoopEnd::Shutdown,
        run = timeout_at(
            session_deadline,
            run_tiers(&inner, &mut session, &mut publisher, &writer, started),
        ) => match run {
            Ok(Ok(())) => LoopEnd::Finished,
            Ok(Err(e)) => LoopEnd::Failed(e),
            Err(_) => LoopEnd::DeadlineExceeded,
        },
    };

    session.set_elapsed(started.elapsed());
    let now = inner.clock.now();

    let (kind, error_kind) = match end {
        LoopEnd::Finished => match session.finalize(now) {
            Ok(SessionStatus::Complete) => (TerminalKind::Complete, None),
            Ok(_) => (TerminalKind::Degraded, None),
            Err(e) => {
                warn!(session_id = %session.session_id, error = %e, "Finalize rejected");
                (TerminalKind::Error, Some("internal"))
            }
        },
        LoopEnd::DeadlineExceeded => {
            let err = OrchestrationError::DeadlineExceeded {
                deadline_ms: corpmap_common::time::duration_to_millis(inner.settings.session_deadline),
            };
            warn!(session_id = %session.session_id, domain = %session.domain_key, "{}", err);
            let _ = session.degrade(err.to_string(), now);
            (TerminalKind::Timeout, Some(err.kind()))
        }
        LoopEnd::Failed(err) => {
            warn!(session_id = %session.session_id, domain = %session.domain_key, error = %err, "Session failed");
            let _ = session.fail(err.to_string(), now);
            (TerminalKind::Error, Some(err.kind()))
        }
        LoopEnd::Shutdown => {
            let err = OrchestrationError::Internal("service shutting down".to_string());
            let _ = session.fail(err.to_string(), now);
            (TerminalKind::Error, Some(err.kind()))
        }
    };

    // Queued snapshots first so the final one is the last write. A slow
    // store delays the terminal event by at most FINAL_SNAPSHOT_WAIT; the
    // write itself carries on in the background.
    let store = Arc::clone(&inner.sessions);
    let snapshot = session.clone();
    let flush = tokio::spawn(async move {
        writer.finish().await;
        persist(store.as_ref(), &snapshot).await;
    });
    if timeout(FINAL_SNAPSHOT_WAIT, flush).await.is_err() {
        warn!(
            session_id = %session.session_id,
            wait_ms = corpmap_common::time::duration_to_millis(FINAL_SNAPSHOT_WAIT),
            "Final snapshot still being written, ending stream without it"
        );
    }
    publisher.publish_terminal(kind, &session, error_kind);

    info!(
        session_id = %session.session_id,
        domain = %session.domain_key,
        status = %session.status,
        fields = session.fields.len(),
        total_cost = session.total_cost,
        duration_ms = session.total_duration_ms,
        "Enrichment session finished"
    );

    session
}
