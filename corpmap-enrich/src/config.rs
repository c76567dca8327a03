//! Runtime wiring from the TOML configuration
//!
//! Turns `[website]`, `[[adapters]]`, `[priorities]`, `[cache]` and
//! `[orchestrator]` into a ready [`Orchestrator`].

use crate::adapters::http_json::HttpJsonAdapter;
use crate::adapters::website::WebsiteAdapter;
use crate::adapters::{AdapterRegistry, SourceAdapter};
use crate::db::{MemorySessionStore, SessionStore, SqliteCacheStore, SqliteSessionStore};
use crate::enrichment::cache::{CacheStore, TieredCache, TtlPolicy};
use crate::enrichment::{Orchestrator, OrchestratorSettings};
use corpmap_common::config::TomlConfig;
use corpmap_common::{Error, Result};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

/// Build every configured adapter and group them by tier
pub fn build_registry(config: &TomlConfig) -> Result<AdapterRegistry> {
    let mut adapters: Vec<Arc<dyn SourceAdapter>> = Vec::new();

    if config.website.enabled {
        let website = WebsiteAdapter::new(&config.website)
            .map_err(|e| Error::Config(format!("Website adapter: {}", e)))?;
        adapters.push(Arc::new(website));
    }

    for adapter in &config.adapters {
        let built = HttpJsonAdapter::from_config(adapter)
            .map_err(|e| Error::Config(format!("Adapter '{}': {}", adapter.name, e)))?;
        adapters.push(Arc::new(built));
    }

    let registry = AdapterRegistry::new(adapters, config.priorities.clone())
        .map_err(|e| Error::Config(e.to_string()))?;

    for tier in registry.tiers() {
        let names: Vec<String> = registry
            .adapters_for(tier)
            .iter()
            .map(|a| a.name().to_string())
            .collect();
        info!(tier = tier, adapters = %names.join(", "), "Registered tier");
    }

    Ok(registry)
}

/// Wire the orchestrator; `pool` enables the persistent cache and session store
pub fn build_orchestrator(config: &TomlConfig, pool: Option<SqlitePool>) -> Result<Orchestrator> {
    let registry = Arc::new(build_registry(config)?);

    let (persistent, sessions): (Option<Arc<dyn CacheStore>>, Arc<dyn SessionStore>) = match pool {
        Some(pool) => (
            Some(Arc::new(SqliteCacheStore::new(pool.clone()))),
            Arc::new(SqliteSessionStore::new(pool)),
        ),
        None => (None, Arc::new(MemorySessionStore::new())),
    };

    let cache = Arc::new(TieredCache::new(
        TtlPolicy::from(&config.cache),
        config.cache.ephemeral_capacity,
        persistent,
    ));

    Ok(Orchestrator::new(
        registry,
        cache,
        sessions,
        OrchestratorSettings::from(&config.orchestrator),
    ))
}
