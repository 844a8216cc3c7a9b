//! Troubleshooting response cache.
//!
//! Entries are keyed by [`query_hash`]: the SHA-256 of a canonical JSON
//! object built from the normalized equipment, error code, symptom and
//! model id, so the same question asked of a different model is cached
//! separately. Entries expire `ttl_days` after they were last saved.

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;

use crate::db::{format_ts_iso, now_ts};
use crate::error::{ServiceError, ServiceResult};

const SECONDS_PER_DAY: i64 = 86_400;

/// The inputs that identify a troubleshooting question.
#[derive(Debug, Clone, Copy)]
pub struct CacheKey<'a> {
    pub manufacturer: &'a str,
    pub model: &'a str,
    pub error_code: Option<&'a str>,
    pub symptom: Option<&'a str>,
    pub model_id: &'a str,
}

pub fn query_hash(key: &CacheKey<'_>) -> String {
    let mut fields = BTreeMap::new();
    fields.insert("manufacturer", key.manufacturer.trim().to_lowercase());
    fields.insert("model", key.model.trim().to_lowercase());
    fields.insert(
        "error_code",
        key.error_code.unwrap_or("").trim().to_uppercase(),
    );
    fields.insert("symptom", key.symptom.unwrap_or("").trim().to_lowercase());
    fields.insert("model_id", key.model_id.trim().to_lowercase());

    // BTreeMap serializes with sorted keys
    let canonical = serde_json::to_string(&fields).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheHit {
    pub cache_id: i64,
    pub response: Value,
    pub cached_at: String,
    pub times_served: i64,
    pub model_id: String,
}

/// Return a live entry for `key`, bumping its serve counters.
pub async fn check(pool: &SqlitePool, key: &CacheKey<'_>) -> Result<Option<CacheHit>> {
    let hash = query_hash(key);
    let now = now_ts();

    let row = sqlx::query(
        "UPDATE troubleshooting_cache
         SET times_served = times_served + 1, last_served = ?
         WHERE query_hash = ? AND expires_at > ?
         RETURNING id, response_json, created_at, times_served, model_id",
    )
    .bind(now)
    .bind(&hash)
    .bind(now)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let response_json: String = row.get("response_json");
    Ok(Some(CacheHit {
        cache_id: row.get("id"),
        response: serde_json::from_str(&response_json)?,
        cached_at: format_ts_iso(row.get("created_at")),
        times_served: row.get("times_served"),
        model_id: row.get("model_id"),
    }))
}

/// A freshly generated response to store.
#[derive(Debug, Clone)]
pub struct NewEntry<'a> {
    pub key: CacheKey<'a>,
    pub response: &'a Value,
    pub manual_ids: &'a [String],
    pub response_time_ms: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cost_usd: f64,
}

/// Insert or refresh the entry for `entry.key`; returns the entry id.
pub async fn save(pool: &SqlitePool, entry: &NewEntry<'_>, ttl_days: i64) -> Result<i64> {
    let hash = query_hash(&entry.key);
    let now = now_ts();
    let expires_at = now + ttl_days * SECONDS_PER_DAY;
    let response_json = serde_json::to_string(entry.response)?;
    let manual_ids = serde_json::to_string(entry.manual_ids)?;

    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO troubleshooting_cache (
            equipment_manufacturer, equipment_model, error_code, symptom, query_hash,
            response_json, source_manual_ids, response_time_ms, model_id,
            prompt_tokens, completion_tokens, cost_usd,
            created_at, expires_at, last_served
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(query_hash) DO UPDATE SET
            response_json = excluded.response_json,
            source_manual_ids = excluded.source_manual_ids,
            response_time_ms = excluded.response_time_ms,
            prompt_tokens = excluded.prompt_tokens,
            completion_tokens = excluded.completion_tokens,
            cost_usd = excluded.cost_usd,
            expires_at = excluded.expires_at,
            last_served = excluded.last_served
        RETURNING id
        "#,
    )
    .bind(entry.key.manufacturer.trim())
    .bind(entry.key.model.trim())
    .bind(entry.key.error_code)
    .bind(entry.key.symptom)
    .bind(&hash)
    .bind(&response_json)
    .bind(&manual_ids)
    .bind(entry.response_time_ms)
    .bind(entry.key.model_id)
    .bind(entry.prompt_tokens)
    .bind(entry.completion_tokens)
    .bind(entry.cost_usd)
    .bind(now)
    .bind(expires_at)
    .bind(now)
    .fetch_one(pool)
    .await?;

    tracing::debug!(cache_id = id, model_id = entry.key.model_id, "cached troubleshooting response");
    Ok(id)
}

/// Record a helpful/unhelpful vote. Notes replace any earlier notes.
pub async fn feedback(
    pool: &SqlitePool,
    cache_id: i64,
    helpful: bool,
    notes: Option<&str>,
) -> ServiceResult<()> {
    let notes = notes.map(str::trim).filter(|n| !n.is_empty());
    let result = sqlx::query(
        "UPDATE troubleshooting_cache
         SET upvotes = upvotes + ?, downvotes = downvotes + ?,
             feedback_notes = COALESCE(?, feedback_notes)
         WHERE id = ?",
    )
    .bind(helpful as i64)
    .bind(!helpful as i64)
    .bind(notes)
    .bind(cache_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(ServiceError::NotFound("Cache entry not found".to_string()));
    }
    Ok(())
}

/// Delete expired entries; returns how many were removed.
pub async fn purge_expired(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query("DELETE FROM troubleshooting_cache WHERE expires_at <= ?")
        .bind(now_ts())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: i64,
    pub total_hits: i64,
}

pub async fn stats(pool: &SqlitePool) -> Result<CacheStats> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS entries, COALESCE(SUM(times_served), 0) AS total_hits
         FROM troubleshooting_cache",
    )
    .fetch_one(pool)
    .await?;

    Ok(CacheStats {
        entries: row.get("entries"),
        total_hits: row.get("total_hits"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::migrate_pool;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate_pool(&pool).await.unwrap();
        pool
    }

    fn key<'a>(symptom: Option<&'a str>) -> CacheKey<'a> {
        CacheKey {
            manufacturer: "Hobart",
            model: "HL600",
            error_code: Some("e12"),
            symptom,
            model_id: "gpt-4o-mini",
        }
    }

    #[test]
    fn hash_normalizes_inputs() {
        let a = query_hash(&key(Some("Won't start")));
        let b = query_hash(&CacheKey {
            manufacturer: "  HOBART ",
            model: "hl600",
            error_code: Some(" E12 "),
            symptom: Some("won't START  "),
            model_id: "GPT-4o-mini",
        });
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        // a different model gets its own entry
        let c = query_hash(&CacheKey {
            model_id: "claude-sonnet-4-5",
            ..key(Some("Won't start"))
        });
        assert_ne!(a, c);

        // None and empty are equivalent
        assert_eq!(query_hash(&key(None)), query_hash(&key(Some(""))));
    }

    #[tokio::test]
    async fn save_then_hit_counts_serves() {
        let pool = test_pool().await;
        let response = serde_json::json!({"severity": "low"});
        let ids = vec!["m1".to_string()];
        let entry = NewEntry {
            key: key(None),
            response: &response,
            manual_ids: &ids,
            response_time_ms: 1200,
            prompt_tokens: 100,
            completion_tokens: 50,
            cost_usd: 0.0001,
        };
        let id = save(&pool, &entry, 30).await.unwrap();

        let hit = check(&pool, &key(None)).await.unwrap().unwrap();
        assert_eq!(hit.cache_id, id);
        assert_eq!(hit.times_served, 2);
        assert_eq!(hit.response["severity"], "low");

        // saving again refreshes the same row
        let again = save(&pool, &entry, 30).await.unwrap();
        assert_eq!(again, id);

        assert!(check(&pool, &key(Some("other"))).await.unwrap().is_none());

        let stats = stats(&pool).await.unwrap();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.total_hits, 2);
    }

    #[tokio::test]
    async fn expired_entries_miss_and_purge() {
        let pool = test_pool().await;
        let response = serde_json::json!({});
        let entry = NewEntry {
            key: key(None),
            response: &response,
            manual_ids: &[],
            response_time_ms: 0,
            prompt_tokens: 0,
            completion_tokens: 0,
            cost_usd: 0.0,
        };
        save(&pool, &entry, 1).await.unwrap();
        sqlx::query("UPDATE troubleshooting_cache SET expires_at = ?")
            .bind(now_ts() - 1)
            .execute(&pool)
            .await
            .unwrap();

        assert!(check(&pool, &key(None)).await.unwrap().is_none());
        assert_eq!(purge_expired(&pool).await.unwrap(), 1);
        assert_eq!(stats(&pool).await.unwrap().entries, 0);
    }

    #[tokio::test]
    async fn feedback_votes_and_missing_entry() {
        let pool = test_pool().await;
        let response = serde_json::json!({});
        let entry = NewEntry {
            key: key(None),
            response: &response,
            manual_ids: &[],
            response_time_ms: 0,
            prompt_tokens: 0,
            completion_tokens: 0,
            cost_usd: 0.0,
        };
        let id = save(&pool, &entry, 30).await.unwrap();

        feedback(&pool, id, true, Some("fixed it")).await.unwrap();
        feedback(&pool, id, false, None).await.unwrap();

        let row = sqlx::query(
            "SELECT upvotes, downvotes, feedback_notes FROM troubleshooting_cache WHERE id = ?",
        )
        .bind(id)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(row.get::<i64, _>("upvotes"), 1);
        assert_eq!(row.get::<i64, _>("downvotes"), 1);
        assert_eq!(row.get::<String, _>("feedback_notes"), "fixed it");

        let err = feedback(&pool, 9999, true, None).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }
}
