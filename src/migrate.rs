use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Safe to run repeatedly.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // Create users table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            full_name TEXT,
            role TEXT NOT NULL DEFAULT 'technician',
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL,
            last_login INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create manuals table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS manuals (
            id TEXT PRIMARY KEY,
            filename TEXT NOT NULL,
            brand TEXT NOT NULL,
            model TEXT NOT NULL,
            equipment_type TEXT,
            manual_type TEXT NOT NULL DEFAULT 'service',
            file_path TEXT NOT NULL,
            file_hash TEXT NOT NULL,
            file_size_bytes INTEGER NOT NULL,
            page_count INTEGER,
            extracted_text TEXT,
            extracted_sections TEXT,
            source TEXT NOT NULL DEFAULT 'user_upload',
            source_url TEXT,
            indexing_status TEXT NOT NULL DEFAULT 'pending',
            indexing_error TEXT,
            indexed_at INTEGER,
            times_accessed INTEGER NOT NULL DEFAULT 0,
            last_accessed INTEGER,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create manual_chunks table; embeddings are little-endian f32 blobs
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS manual_chunks (
            id TEXT PRIMARY KEY,
            manual_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            page_number INTEGER,
            section TEXT,
            chunk_text TEXT NOT NULL,
            text_hash TEXT NOT NULL,
            embedding BLOB NOT NULL,
            embedding_model TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(manual_id, chunk_index),
            FOREIGN KEY (manual_id) REFERENCES manuals(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS equipment_profiles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            manufacturer TEXT NOT NULL,
            model TEXT NOT NULL,
            serial_number TEXT UNIQUE,
            customer_name TEXT,
            customer_location TEXT,
            installation_date TEXT,
            manual_id TEXT,
            equipment_notes TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            last_service_date TEXT,
            next_service_due TEXT,
            warranty_expiration TEXT,
            created_by TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (manual_id) REFERENCES manuals(id) ON DELETE SET NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS troubleshooting_cache (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            equipment_manufacturer TEXT NOT NULL,
            equipment_model TEXT NOT NULL,
            error_code TEXT,
            symptom TEXT,
            query_hash TEXT NOT NULL UNIQUE,
            response_json TEXT NOT NULL,
            source_manual_ids TEXT NOT NULL DEFAULT '[]',
            response_time_ms INTEGER NOT NULL DEFAULT 0,
            model_id TEXT NOT NULL,
            prompt_tokens INTEGER NOT NULL DEFAULT 0,
            completion_tokens INTEGER NOT NULL DEFAULT 0,
            cost_usd REAL NOT NULL DEFAULT 0,
            times_served INTEGER NOT NULL DEFAULT 1,
            upvotes INTEGER NOT NULL DEFAULT 0,
            downvotes INTEGER NOT NULL DEFAULT 0,
            feedback_notes TEXT,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            last_served INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS service_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            profile_id INTEGER NOT NULL,
            troubleshooting_cache_id INTEGER,
            service_date TEXT NOT NULL,
            service_type TEXT,
            reported_issue TEXT NOT NULL,
            error_codes TEXT,
            diagnosis TEXT,
            resolution TEXT,
            parts_replaced TEXT,
            time_on_site_minutes INTEGER,
            troubleshooting_time_minutes INTEGER,
            repair_time_minutes INTEGER,
            issue_resolved INTEGER,
            followup_required INTEGER NOT NULL DEFAULT 0,
            followup_notes TEXT,
            technician_name TEXT,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (profile_id) REFERENCES equipment_profiles(id) ON DELETE CASCADE,
            FOREIGN KEY (troubleshooting_cache_id) REFERENCES troubleshooting_cache(id) ON DELETE SET NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS api_usage_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            endpoint TEXT NOT NULL,
            user_id INTEGER,
            ai_provider TEXT,
            model_used TEXT,
            prompt_tokens INTEGER NOT NULL DEFAULT 0,
            completion_tokens INTEGER NOT NULL DEFAULT 0,
            total_tokens INTEGER NOT NULL DEFAULT 0,
            cost_usd REAL NOT NULL DEFAULT 0,
            response_time_ms INTEGER NOT NULL DEFAULT 0,
            cache_hit INTEGER NOT NULL DEFAULT 0,
            status_code INTEGER NOT NULL DEFAULT 200,
            error_message TEXT,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE SET NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    for stmt in [
        "CREATE INDEX IF NOT EXISTS idx_manuals_brand_model ON manuals(brand, model)",
        "CREATE INDEX IF NOT EXISTS idx_manuals_status ON manuals(indexing_status)",
        "CREATE INDEX IF NOT EXISTS idx_manual_chunks_manual_id ON manual_chunks(manual_id)",
        "CREATE INDEX IF NOT EXISTS idx_equipment_manufacturer ON equipment_profiles(manufacturer)",
        "CREATE INDEX IF NOT EXISTS idx_cache_model ON troubleshooting_cache(equipment_model)",
        "CREATE INDEX IF NOT EXISTS idx_service_history_profile ON service_history(profile_id, service_date DESC)",
        "CREATE INDEX IF NOT EXISTS idx_usage_user_created ON api_usage_logs(user_id, created_at DESC)",
    ] {
        sqlx::query(stmt).execute(pool).await?;
    }

    Ok(())
}
