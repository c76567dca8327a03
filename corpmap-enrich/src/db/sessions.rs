//! Session snapshot storage
//!
//! The orchestrator writes a snapshot on start, after every tier and at the
//! end; `GET /session/{id}` reads the latest one. Snapshots stay readable
//! until their `expires_at`, after which `get` ignores them and
//! `purge_expired` deletes them.

use crate::enrichment::session::EnrichmentSession;
use crate::utils::retry_on_lock;
use async_trait::async_trait;
use corpmap_common::time::WallClock;
use corpmap_common::Result;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Default budget for retrying a locked database
pub const DEFAULT_MAX_LOCK_WAIT: Duration = Duration::from_millis(5000);

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert or replace the snapshot for `session.session_id`
    async fn put(&self, session: &EnrichmentSession) -> Result<()>;

    /// Latest unexpired snapshot
    async fn get(&self, session_id: Uuid) -> Result<Option<EnrichmentSession>>;

    /// Delete expired snapshots, returning how many went
    async fn purge_expired(&self) -> Result<u64>;
}

/// SQLite-backed store
pub struct SqliteSessionStore {
    pool: SqlitePool,
    max_lock_wait: Duration,
    clock: WallClock,
}

impl SqliteSessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            max_lock_wait: DEFAULT_MAX_LOCK_WAIT,
            clock: WallClock::new(),
        }
    }

    pub fn with_max_lock_wait(mut self, max_lock_wait: Duration) -> Self {
        self.max_lock_wait = max_lock_wait;
        self
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn put(&self, session: &EnrichmentSession) -> Result<()> {
        // Prepare everything before touching the database
        let session_id = session.session_id.to_string();
        let snapshot = serde_json::to_string(session)?;
        let status = session.status.to_string();
        let created_at = session.created_at.to_rfc3339();
        let expires_at_ms = session.expires_at.timestamp_millis();

        retry_on_lock("session upsert", self.max_lock_wait, || async {
            sqlx::query(
                r#"
                INSERT INTO sessions (
                    session_id, domain_key, status, snapshot, created_at, expires_at_ms
                ) VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(session_id) DO UPDATE SET
                    status = excluded.status,
                    snapshot = excluded.snapshot,
                    expires_at_ms = excluded.expires_at_ms
                "#,
            )
            .bind(&session_id)
            .bind(session.domain_key.as_str())
            .bind(&status)
            .bind(&snapshot)
            .bind(&created_at)
            .bind(expires_at_ms)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get(&self, session_id: Uuid) -> Result<Option<EnrichmentSession>> {
        let row = sqlx::query("SELECT snapshot, expires_at_ms FROM sessions WHERE session_id = ?")
            .bind(session_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let expires_at_ms: i64 = row.get("expires_at_ms");
        if expires_at_ms <= self.clock.now().timestamp_millis() {
            return Ok(None);
        }

        let snapshot: String = row.get("snapshot");
        let session: EnrichmentSession = serde_json::from_str(&snapshot)?;
        Ok(Some(session))
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now_ms = self.clock.now().timestamp_millis();
        let purged = retry_on_lock("session purge", self.max_lock_wait, || async {
            let result = sqlx::query("DELETE FROM sessions WHERE expires_at_ms <= ?")
                .bind(now_ms)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if purged > 0 {
            tracing::info!(purged, "Purged expired sessions");
        }
        Ok(purged)
    }
}

/// In-process store for tests and runs without a database
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<Uuid, EnrichmentSession>>,
    clock: WallClock,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, EnrichmentSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn put(&self, session: &EnrichmentSession) -> Result<()> {
        self.sessions().insert(session.session_id, session.clone());
        Ok(())
    }

    async fn get(&self, session_id: Uuid) -> Result<Option<EnrichmentSession>> {
        let now = self.clock.now();
        Ok(self
            .sessions()
            .get(&session_id)
            .filter(|s| s.expires_at > now)
            .cloned())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = self.clock.now();
        let mut sessions = self.sessions();
        let before = sessions.len();
        sessions.retain(|_, s| s.expires_at > now);
        Ok((before - sessions.len()) as u64)
    }
}

/// Purge expired sessions every `interval` until `shutdown` fires
pub fn spawn_session_janitor(
    store: Arc<dyn SessionStore>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = store.purge_expired().await {
                        tracing::warn!(error = %e, "Session purge failed");
                    }
                }
            }
        }
        tracing::debug!("Session janitor stopped");
    })
}
