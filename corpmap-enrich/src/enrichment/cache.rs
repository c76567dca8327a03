//! Two-level tier cache with field-class lifetimes
//!
//! Lookup order: in-memory map, then the persistent store (hits are promoted
//! into memory). Writes go to both. A class whose TTL is zero is never
//! stored.
//!
//! Tiers are cached as one entry per field class plus a manifest naming the
//! classes written, so stable facts outlive volatile ones. Persistent store
//! faults are logged and bypassed; the cache never fails a session.

use super::error::OrchestrationError;
use crate::types::{DomainKey, FieldClass, FieldSet, SourceOutcome, TierResult};
use chrono::{DateTime, Utc};
use corpmap_common::config::CacheConfig;
use corpmap_common::time::{add_duration, WallClock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

// ============================================================================
// Keys, entries, TTL policy
// ============================================================================

/// Cache key: domain + tier + field class
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub domain: DomainKey,
    pub tier: u8,
    pub class: FieldClass,
}

impl CacheKey {
    pub fn new(domain: &DomainKey, tier: u8, class: FieldClass) -> Self {
        Self {
            domain: domain.clone(),
            tier,
            class,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.domain, self.tier, self.class.as_str())
    }
}

fn manifest_key(domain: &DomainKey, tier: u8) -> String {
    format!("{domain}:{tier}:manifest")
}

/// Stored cache record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub cache_key: String,
    pub payload: Value,
    pub stored_at: DateTime<Utc>,
    pub ttl_secs: u64,
    pub field_class: FieldClass,
}

impl CacheEntry {
    pub fn expires_at(&self) -> DateTime<Utc> {
        add_duration(self.stored_at, Duration::from_secs(self.ttl_secs))
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.ttl_secs > 0 && now < self.expires_at()
    }
}

/// TTL per field class
#[derive(Debug, Clone, Copy)]
pub struct TtlPolicy {
    pub immutable: Duration,
    pub stable: Duration,
    pub volatile: Duration,
}

impl TtlPolicy {
    pub fn ttl(&self, class: FieldClass) -> Duration {
        match class {
            FieldClass::Immutable => self.immutable,
            FieldClass::Stable => self.stable,
            FieldClass::Volatile => self.volatile,
        }
    }
}

impl From<&CacheConfig> for TtlPolicy {
    fn from(config: &CacheConfig) -> Self {
        Self {
            immutable: Duration::from_secs(config.immutable_ttl_secs),
            stable: Duration::from_secs(config.stable_ttl_secs),
            volatile: Duration::from_secs(config.volatile_ttl_secs),
        }
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

/// Persistent cache backend
#[async_trait::async_trait]
pub trait CacheStore: Send + Sync {
    async fn load(&self, cache_key: &str) -> corpmap_common::Result<Option<CacheEntry>>;
    async fn store(&self, entry: &CacheEntry) -> corpmap_common::Result<()>;
}

// ============================================================================
// Ephemeral level
// ============================================================================

/// Bounded in-memory map, evicts the oldest insert when full
struct EphemeralStore {
    capacity: usize,
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
}

impl EphemeralStore {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, key: &str, now: DateTime<Utc>) -> Option<CacheEntry> {
        let fresh = self.entries.get(key).map(|e| e.is_fresh(now))?;
        if !fresh {
            self.entries.remove(key);
            self.order.retain(|k| k != key);
            return None;
        }
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, entry: CacheEntry) {
        if self.capacity == 0 {
            return;
        }
        let key = entry.cache_key.clone();
        if self.entries.insert(key.clone(), entry).is_some() {
            self.order.retain(|k| k != &key);
        }
        self.order.push_back(key);
        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

// ============================================================================
// Tiered cache
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct TierManifest {
    classes: Vec<FieldClass>,
    started_at: DateTime<Utc>,
    /// Every outcome of the tier without its fields, failures included
    outcomes: Vec<SourceOutcome>,
}

pub struct TieredCache {
    ephemeral: Mutex<EphemeralStore>,
    persistent: Option<Arc<dyn CacheStore>>,
    policy: TtlPolicy,
    clock: WallClock,
}

impl TieredCache {
    pub fn new(policy: TtlPolicy, capacity: usize, persistent: Option<Arc<dyn CacheStore>>) -> Self {
        Self {
            ephemeral: Mutex::new(EphemeralStore::new(capacity)),
            persistent,
            policy,
            clock: WallClock::new(),
        }
    }

    /// Memory-only cache
    pub fn in_memory(policy: TtlPolicy, capacity: usize) -> Self {
        Self::new(policy, capacity, None)
    }

    fn ephemeral(&self) -> MutexGuard<'_, EphemeralStore> {
        self.ephemeral
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fresh payload for `key`, if any
    pub async fn get(&self, key: &CacheKey) -> Option<Value> {
        self.lookup(&key.to_string()).await.map(|e| e.payload)
    }

    /// Store `payload` under `key` with the TTL of the key's field class
    pub async fn put(&self, key: &CacheKey, payload: Value) {
        let ttl = self.policy.ttl(key.class);
        self.write(key.to_string(), payload, key.class, ttl).await;
    }

    async fn lookup(&self, cache_key: &str) -> Option<CacheEntry> {
        let now = self.clock.now();
        let hit = self.ephemeral().get(cache_key, now);
        if hit.is_some() {
            return hit;
        }

        let store = self.persistent.as_ref()?;
        match store.load(cache_key).await {
            Ok(Some(entry)) if entry.is_fresh(now) => {
                debug!(cache_key = cache_key, "Promoting persistent cache hit");
                self.ephemeral().insert(entry.clone());
                Some(entry)
            }
            Ok(_) => None,
            Err(e) => {
                let err = OrchestrationError::CacheUnavailable(e.to_string());
                warn!(cache_key = cache_key, error = %err, "Cache read bypassed");
                None
            }
        }
    }

    async fn write(&self, cache_key: String, payload: Value, class: FieldClass, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let entry = CacheEntry {
            cache_key,
            payload,
            stored_at: self.clock.now(),
            ttl_secs: ttl.as_secs().max(1),
            field_class: class,
        };

        self.ephemeral().insert(entry.clone());

        if let Some(store) = &self.persistent {
            if let Err(e) = store.store(&entry).await {
                let err = OrchestrationError::CacheUnavailable(e.to_string());
                warn!(cache_key = %entry.cache_key, error = %err, "Cache write bypassed");
            }
        }
    }

    /// Cache a finished tier, partitioned by field class
    ///
    /// Skipped when the tier had no successful outcome, or when any class it
    /// produced is uncacheable: replaying part of a tier would silently drop
    /// fields that a fresh run returns.
    pub async fn put_tier(&self, domain: &DomainKey, result: &TierResult) {
        if result.all_failed() || result.from_cache {
            return;
        }
        let succeeded: Vec<&SourceOutcome> = result.outcomes.iter().filter(|o| o.succeeded).collect();

        let mut partitions: BTreeMap<FieldClass, Vec<SourceOutcome>> = BTreeMap::new();
        for outcome in &succeeded {
            for class in FieldClass::ALL {
                let fields = outcome.fields.retain_class(class);
                if !fields.is_empty() {
                    let mut part = (*outcome).clone();
                    part.fields = fields;
                    partitions.entry(class).or_default().push(part);
                }
            }
        }

        if partitions.is_empty() {
            return;
        }
        if let Some(class) = partitions
            .keys()
            .find(|class| self.policy.ttl(**class).is_zero())
        {
            debug!(
                domain = %domain,
                tier = result.tier_number,
                class = class.as_str(),
                "Tier carries uncacheable fields, not cached"
            );
            return;
        }

        let mut shortest = Duration::MAX;
        for (class, outcomes) in &partitions {
            let ttl = self.policy.ttl(*class);
            shortest = shortest.min(ttl);
            match serde_json::to_value(outcomes) {
                Ok(payload) => {
                    self.write(CacheKey::new(domain, result.tier_number, *class).to_string(), payload, *class, ttl)
                        .await
                }
                Err(e) => {
                    warn!(domain = %domain, error = %e, "Tier partition not serializable, not cached");
                    return;
                }
            }
        }

        let manifest = TierManifest {
            classes: partitions.keys().copied().collect(),
            started_at: result.started_at,
            outcomes: result
                .outcomes
                .iter()
                .map(|o| SourceOutcome {
                    fields: FieldSet::default(),
                    ..o.clone()
                })
                .collect(),
        };
        if let Ok(payload) = serde_json::to_value(&manifest) {
            // Manifest carries the most volatile class so it expires first
            let class = manifest.classes.iter().copied().max().unwrap_or(FieldClass::Volatile);
            self.write(manifest_key(domain, result.tier_number), payload, class, shortest)
                .await;
        }
    }

    /// Reassemble a cached tier; hit only when every class written is fresh
    pub async fn get_tier(&self, domain: &DomainKey, tier: u8) -> Option<TierResult> {
        let manifest_entry = self.lookup(&manifest_key(domain, tier)).await?;
        let manifest: TierManifest = serde_json::from_value(manifest_entry.payload).ok()?;

        let mut merged: BTreeMap<String, SourceOutcome> = manifest
            .outcomes
            .into_iter()
            .map(|o| (o.adapter_name.clone(), o))
            .collect();
        for class in &manifest.classes {
            let entry = self.get(&CacheKey::new(domain, tier, *class)).await?;
            let outcomes: Vec<SourceOutcome> = serde_json::from_value(entry).ok()?;
            for outcome in outcomes {
                match merged.get_mut(&outcome.adapter_name) {
                    Some(existing) => {
                        existing.fields.known.extend(outcome.fields.known);
                        existing.fields.extensions.extend(outcome.fields.extensions);
                    }
                    None => {
                        merged.insert(outcome.adapter_name.clone(), outcome);
                    }
                }
            }
        }

        let mut result = TierResult::new(tier, merged.into_values().collect(), manifest.started_at);
        result.from_cache = true;
        Some(result)
    }

    /// Entries currently held in memory
    pub fn ephemeral_len(&self) -> usize {
        self.ephemeral().len()
    }
}
