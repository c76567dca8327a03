//! Persistent level of the enrichment cache

use crate::enrichment::cache::{CacheEntry, CacheStore};
use crate::types::FieldClass;
use crate::utils::retry_on_lock;
use async_trait::async_trait;
use corpmap_common::{Error, Result};
use sqlx::{Row, SqlitePool};
use std::time::Duration;

pub struct SqliteCacheStore {
    pool: SqlitePool,
    max_lock_wait: Duration,
}

impl SqliteCacheStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            max_lock_wait: super::sessions::DEFAULT_MAX_LOCK_WAIT,
        }
    }
}

fn parse_class(name: &str) -> Result<FieldClass> {
    FieldClass::ALL
        .into_iter()
        .find(|c| c.as_str() == name)
        .ok_or_else(|| Error::Internal(format!("Unknown field class '{}' in cache", name)))
}

#[async_trait]
impl CacheStore for SqliteCacheStore {
    async fn load(&self, cache_key: &str) -> Result<Option<CacheEntry>> {
        let row = sqlx::query(
            "SELECT field_class, payload, stored_at, ttl_seconds FROM cache_entries WHERE cache_key = ?",
        )
        .bind(cache_key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let payload: String = row.get("payload");
        let stored_at: String = row.get("stored_at");
        let stored_at = chrono::DateTime::parse_from_rfc3339(&stored_at)
            .map_err(|e| Error::Internal(format!("Failed to parse stored_at: {}", e)))?
            .with_timezone(&chrono::Utc);
        let ttl_seconds: i64 = row.get("ttl_seconds");
        let field_class: String = row.get("field_class");

        Ok(Some(CacheEntry {
            cache_key: cache_key.to_string(),
            payload: serde_json::from_str(&payload)?,
            stored_at,
            ttl_secs: u64::try_from(ttl_seconds).unwrap_or(0),
            field_class: parse_class(&field_class)?,
        }))
    }

    async fn store(&self, entry: &CacheEntry) -> Result<()> {
        let payload = serde_json::to_string(&entry.payload)?;
        let stored_at = entry.stored_at.to_rfc3339();
        let ttl_seconds = i64::try_from(entry.ttl_secs).unwrap_or(i64::MAX);

        retry_on_lock("cache store", self.max_lock_wait, || async {
            sqlx::query(
                r#"
                INSERT INTO cache_entries (cache_key, field_class, payload, stored_at, ttl_seconds)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(cache_key) DO UPDATE SET
                    field_class = excluded.field_class,
                    payload = excluded.payload,
                    stored_at = excluded.stored_at,
                    ttl_seconds = excluded.ttl_seconds
                "#,
            )
            .bind(&entry.cache_key)
            .bind(entry.field_class.as_str())
            .bind(&payload)
            .bind(&stored_at)
            .bind(ttl_seconds)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }
}
