//! API usage and cost accounting.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::db::{format_ts_iso, now_ts};
use crate::error::{bad_request, ServiceResult};

/// One AI-backed request, cached or not.
#[derive(Debug, Clone, Default)]
pub struct UsageRecord<'a> {
    pub endpoint: &'a str,
    pub user_id: Option<i64>,
    pub provider: Option<&'a str>,
    pub model_id: Option<&'a str>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cost_usd: f64,
    pub response_time_ms: i64,
    pub cache_hit: bool,
    pub status_code: u16,
    pub error_message: Option<&'a str>,
}

pub async fn log(pool: &SqlitePool, record: &UsageRecord<'_>) -> Result<()> {
    let status = if record.status_code == 0 { 200 } else { record.status_code };
    sqlx::query(
        r#"
        INSERT INTO api_usage_logs (
            endpoint, user_id, ai_provider, model_used, prompt_tokens, completion_tokens,
            total_tokens, cost_usd, response_time_ms, cache_hit, status_code, error_message,
            created_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(record.endpoint)
    .bind(record.user_id)
    .bind(record.provider)
    .bind(record.model_id)
    .bind(record.prompt_tokens)
    .bind(record.completion_tokens)
    .bind(record.prompt_tokens + record.completion_tokens)
    .bind(record.cost_usd)
    .bind(record.response_time_ms)
    .bind(record.cache_hit)
    .bind(status as i64)
    .bind(record.error_message)
    .bind(now_ts())
    .execute(pool)
    .await?;
    Ok(())
}

/// Usage logging never fails the request it describes.
pub async fn log_quietly(pool: &SqlitePool, record: &UsageRecord<'_>) {
    if let Err(e) = log(pool, record).await {
        tracing::warn!(endpoint = record.endpoint, error = %e, "failed to record usage");
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    pub total_requests: i64,
    pub total_tokens: i64,
    pub total_cost_usd: f64,
    pub cache_hits: i64,
    pub period_days: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelUsage {
    pub model_id: Option<String>,
    pub provider: Option<String>,
    pub requests: i64,
    pub tokens: i64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageEntry {
    pub id: i64,
    pub endpoint: String,
    pub provider: Option<String>,
    pub model_id: Option<String>,
    pub total_tokens: i64,
    pub cost_usd: f64,
    pub response_time_ms: i64,
    pub cache_hit: bool,
    pub status_code: i64,
    pub error_message: Option<String>,
    pub created_at: String,
}

fn cutoff(days: i64) -> ServiceResult<i64> {
    if !(1..=365).contains(&days) {
        return Err(bad_request("days must be between 1 and 365"));
    }
    Ok(now_ts() - days * 86_400)
}

pub async fn summary(
    pool: &SqlitePool,
    user_id: Option<i64>,
    days: i64,
) -> ServiceResult<UsageSummary> {
    let since = cutoff(days)?;
    let row = sqlx::query(
        r#"
        SELECT COUNT(*) AS total_requests,
               COALESCE(SUM(total_tokens), 0) AS total_tokens,
               COALESCE(SUM(cost_usd), 0.0) AS total_cost,
               COALESCE(SUM(cache_hit), 0) AS cache_hits
        FROM api_usage_logs
        WHERE created_at >= ? AND (? IS NULL OR user_id = ?)
        "#,
    )
    .bind(since)
    .bind(user_id)
    .bind(user_id)
    .fetch_one(pool)
    .await?;

    Ok(UsageSummary {
        total_requests: row.get("total_requests"),
        total_tokens: row.get("total_tokens"),
        total_cost_usd: row.get("total_cost"),
        cache_hits: row.get("cache_hits"),
        period_days: days,
    })
}

/// Non-cached usage grouped by model and provider, most expensive first.
pub async fn by_model(
    pool: &SqlitePool,
    user_id: Option<i64>,
    days: i64,
) -> ServiceResult<Vec<ModelUsage>> {
    let since = cutoff(days)?;
    let rows = sqlx::query(
        r#"
        SELECT model_used, ai_provider, COUNT(*) AS requests,
               COALESCE(SUM(total_tokens), 0) AS tokens,
               COALESCE(SUM(cost_usd), 0.0) AS cost
        FROM api_usage_logs
        WHERE created_at >= ? AND cache_hit = 0 AND (? IS NULL OR user_id = ?)
        GROUP BY model_used, ai_provider
        ORDER BY cost DESC
        "#,
    )
    .bind(since)
    .bind(user_id)
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| ModelUsage {
            model_id: row.get("model_used"),
            provider: row.get("ai_provider"),
            requests: row.get("requests"),
            tokens: row.get("tokens"),
            cost_usd: row.get("cost"),
        })
        .collect())
}

/// Recent raw log rows, newest first.
pub async fn recent(
    pool: &SqlitePool,
    user_id: Option<i64>,
    days: i64,
    limit: i64,
) -> ServiceResult<Vec<UsageEntry>> {
    let since = cutoff(days)?;
    let rows = sqlx::query(
        r#"
        SELECT id, endpoint, ai_provider, model_used, total_tokens, cost_usd,
               response_time_ms, cache_hit, status_code, error_message, created_at
        FROM api_usage_logs
        WHERE created_at >= ? AND (? IS NULL OR user_id = ?)
        ORDER BY created_at DESC, id DESC
        LIMIT ?
        "#,
    )
    .bind(since)
    .bind(user_id)
    .bind(user_id)
    .bind(limit.clamp(1, 1000))
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| UsageEntry {
            id: row.get("id"),
            endpoint: row.get("endpoint"),
            provider: row.get("ai_provider"),
            model_id: row.get("model_used"),
            total_tokens: row.get("total_tokens"),
            cost_usd: row.get("cost_usd"),
            response_time_ms: row.get("response_time_ms"),
            cache_hit: row.get::<i64, _>("cache_hit") != 0,
            status_code: row.get("status_code"),
            error_message: row.get("error_message"),
            created_at: format_ts_iso(row.get("created_at")),
        })
        .collect())
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

    #[tokio::test]
    async fn summary_and_breakdown() {
        let pool = test_pool().await;
        for (model, cost, hit) in [
            ("gpt-4o-mini", 0.001, false),
            ("gpt-4o-mini", 0.002, false),
            ("gpt-4o-mini", 0.0, true),
            ("claude-sonnet-4-5", 0.01, false),
        ] {
            log(
                &pool,
                &UsageRecord {
                    endpoint: "/troubleshoot",
                    model_id: Some(model),
                    provider: Some("openai"),
                    prompt_tokens: 100,
                    completion_tokens: 20,
                    cost_usd: cost,
                    cache_hit: hit,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        }

        let s = summary(&pool, None, 30).await.unwrap();
        assert_eq!(s.total_requests, 4);
        assert_eq!(s.total_tokens, 480);
        assert_eq!(s.cache_hits, 1);
        assert!((s.total_cost_usd - 0.013).abs() < 1e-9);

        let models = by_model(&pool, None, 30).await.unwrap();
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].model_id.as_deref(), Some("claude-sonnet-4-5"));
        let mini = &models[1];
        assert_eq!(mini.requests, 2);

        let rows = recent(&pool, None, 30, 10).await.unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].status_code, 200);

        // unknown users see nothing
        assert_eq!(summary(&pool, Some(42), 30).await.unwrap().total_requests, 0);
    }

    #[tokio::test]
    async fn days_out_of_range() {
        let pool = test_pool().await;
        assert!(summary(&pool, None, 0).await.is_err());
        assert!(by_model(&pool, None, 366).await.is_err());
    }
}
