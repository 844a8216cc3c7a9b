//! Service health and library statistics.

use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::cache::{self, CacheStats};
use crate::equipment;
use crate::error::ServiceResult;
use crate::manuals;

pub const SERVICE_NAME: &str = "Tech Copilot API";

#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub version: &'static str,
    pub service: &'static str,
}

pub fn health() -> Health {
    Health {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        service: SERVICE_NAME,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Total {
    pub total: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrandCount {
    pub manufacturer: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub manuals: Total,
    pub equipment_profiles: Total,
    pub cache: CacheStats,
    pub top_manufacturers: Vec<BrandCount>,
}

pub async fn stats(pool: &SqlitePool) -> ServiceResult<SystemStats> {
    let manual_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM manuals")
        .fetch_one(pool)
        .await?;

    let top = sqlx::query(
        "SELECT brand, COUNT(*) AS n FROM manuals
         GROUP BY brand
         ORDER BY n DESC, brand
         LIMIT 5",
    )
    .fetch_all(pool)
    .await?;

    Ok(SystemStats {
        manuals: Total { total: manual_count },
        equipment_profiles: Total {
            total: equipment::count_profiles(pool).await?,
        },
        cache: cache::stats(pool).await?,
        top_manufacturers: top
            .iter()
            .map(|row| BrandCount {
                manufacturer: row.get("brand"),
                count: row.get("n"),
            })
            .collect(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct Manufacturers {
    pub manufacturers: Vec<String>,
}

pub async fn manufacturers(pool: &SqlitePool) -> ServiceResult<Manufacturers> {
    Ok(Manufacturers {
        manufacturers: manuals::brands(pool).await?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::migrate_pool;
    use sqlx::sqlite::SqlitePoolOptions;

    #[tokio::test]
    async fn empty_library_stats() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate_pool(&pool).await.unwrap();

        let s = stats(&pool).await.unwrap();
        assert_eq!(s.manuals.total, 0);
        assert_eq!(s.equipment_profiles.total, 0);
        assert_eq!(s.cache.entries, 0);
        assert!(s.top_manufacturers.is_empty());
        assert!(manufacturers(&pool).await.unwrap().manufacturers.is_empty());

        assert_eq!(health().status, "healthy");
    }
}
