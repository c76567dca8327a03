//! Shared test fixtures
//!
//! `MockAdapter` is a scriptable source adapter with an invocation counter;
//! `orchestrator` wires a memory-only orchestrator around a set of them.
//! `SlowCacheStore`, `FailingSessionStore` and `StallingSessionStore` stand
//! in for persistence that is slow or broken.

#![allow(dead_code)]

use async_trait::async_trait;
use corpmap_enrich::adapters::{AdapterContext, AdapterRegistry, SourceAdapter};
use corpmap_enrich::db::{MemorySessionStore, SessionStore};
use corpmap_enrich::enrichment::cache::{CacheEntry, CacheStore};
use corpmap_enrich::enrichment::publisher::{EventReceiver, StreamEvent};
use corpmap_enrich::enrichment::{
    EnrichmentSession, Orchestrator, OrchestratorSettings, TieredCache, TtlPolicy,
};
use corpmap_enrich::types::{AdapterError, AdapterErrorKind, FieldSet, KnownField};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub struct MockAdapter {
    name: String,
    tier: u8,
    cost_units: f64,
    base_confidence: u8,
    delay: Duration,
    response: Mutex<Result<FieldSet, AdapterErrorKind>>,
    calls: AtomicUsize,
}

impl MockAdapter {
    pub fn ok(name: &str, tier: u8, fields: FieldSet) -> Self {
        Self {
            name: name.to_string(),
            tier,
            cost_units: 1.0,
            base_confidence: 50,
            delay: Duration::ZERO,
            response: Mutex::new(Ok(fields)),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(name: &str, tier: u8, kind: AdapterErrorKind) -> Self {
        let adapter = Self::ok(name, tier, FieldSet::new());
        adapter.set_response(Err(kind));
        adapter
    }

    pub fn cost(mut self, cost_units: f64) -> Self {
        self.cost_units = cost_units;
        self
    }

    pub fn confidence(mut self, base_confidence: u8) -> Self {
        self.base_confidence = base_confidence;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_response(&self, response: Result<FieldSet, AdapterErrorKind>) {
        *self.response.lock().unwrap() = response;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceAdapter for MockAdapter {
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

    async fn fetch(
        &self,
        _ctx: &AdapterContext,
        _deadline: tokio::time::Instant,
    ) -> Result<FieldSet, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let response = self.response.lock().unwrap().clone();
        response.map_err(|kind| AdapterError::new(kind, format!("{} scripted failure", self.name)))
    }
}

/// Field set with a single industry value
pub fn industry(value: &str) -> FieldSet {
    FieldSet::new().with(KnownField::Industry(value.to_string()))
}

pub fn registry(adapters: &[Arc<MockAdapter>]) -> Arc<AdapterRegistry> {
    let adapters: Vec<Arc<dyn SourceAdapter>> = adapters
        .iter()
        .map(|a| Arc::clone(a) as Arc<dyn SourceAdapter>)
        .collect();
    Arc::new(AdapterRegistry::new(adapters, BTreeMap::new()).unwrap())
}

pub fn orchestrator_with(adapters: &[Arc<MockAdapter>], settings: OrchestratorSettings) -> Orchestrator {
    Orchestrator::new(
        registry(adapters),
        Arc::new(TieredCache::in_memory(TtlPolicy::default(), 1_000)),
        Arc::new(MemorySessionStore::new()),
        settings,
    )
}

pub fn orchestrator_with_stores(
    adapters: &[Arc<MockAdapter>],
    cache: Arc<TieredCache>,
    sessions: Arc<dyn SessionStore>,
) -> Orchestrator {
    Orchestrator::new(registry(adapters), cache, sessions, OrchestratorSettings::default())
}

pub fn orchestrator(adapters: &[Arc<MockAdapter>]) -> Orchestrator {
    orchestrator_with(adapters, OrchestratorSettings::default())
}

/// Every event until the channel closes
pub async fn drain(mut events: EventReceiver) -> Vec<StreamEvent> {
    let mut all = Vec::new();
    while let Some(event) = events.recv().await {
        all.push(event);
    }
    all
}

/// Persistent cache whose reads take `delay` after looking at the map
pub struct SlowCacheStore {
    delay: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl SlowCacheStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            entries: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl CacheStore for SlowCacheStore {
    async fn load(&self, cache_key: &str) -> corpmap_common::Result<Option<CacheEntry>> {
        let entry = self.entries.lock().unwrap().get(cache_key).cloned();
        tokio::time::sleep(self.delay).await;
        Ok(entry)
    }

    async fn store(&self, entry: &CacheEntry) -> corpmap_common::Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(entry.cache_key.clone(), entry.clone());
        Ok(())
    }
}

/// Session store whose writes always fail
pub struct FailingSessionStore;

#[async_trait]
impl SessionStore for FailingSessionStore {
    async fn put(&self, _session: &EnrichmentSession) -> corpmap_common::Result<()> {
        Err(corpmap_common::Error::Internal("disk full".to_string()))
    }

    async fn get(&self, _session_id: Uuid) -> corpmap_common::Result<Option<EnrichmentSession>> {
        Ok(None)
    }

    async fn purge_expired(&self) -> corpmap_common::Result<u64> {
        Ok(0)
    }
}

/// Session store whose writes hang for `delay` before succeeding
pub struct StallingSessionStore {
    delay: Duration,
    inner: MemorySessionStore,
}

impl StallingSessionStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            inner: MemorySessionStore::new(),
        }
    }
}

#[async_trait]
impl SessionStore for StallingSessionStore {
    async fn put(&self, session: &EnrichmentSession) -> corpmap_common::Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.put(session).await
    }

    async fn get(&self, session_id: Uuid) -> corpmap_common::Result<Option<EnrichmentSession>> {
        self.inner.get(session_id).await
    }

    async fn purge_expired(&self) -> corpmap_common::Result<u64> {
        self.inner.purge_expired().await
    }
}
