//! Shared application state.
//!
//! One cloneable [`AppState`] carries everything a request or background job
//! needs: the pool, configuration, token keys, the manual store, and the
//! embedding and language model backends. Handlers receive it through
//! axum's `State` extractor; the CLI builds the same value for one-off jobs.

use anyhow::Result;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::TokenKeys;
use crate::config::Config;
use crate::db;
use crate::embedding::{create_embedder, Embedder};
use crate::llm::LlmGateway;
use crate::migrate::migrate_pool;
use crate::storage::ManualStore;

const DOWNLOAD_TIMEOUT_SECS: u64 = 60;
const DOWNLOAD_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko)";

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub config: Arc<Config>,
    pub keys: TokenKeys,
    pub store: ManualStore,
    pub embedder: Arc<dyn Embedder>,
    pub llm: LlmGateway,
    /// Client for fetching manuals found by web search.
    pub http: reqwest::Client,
}

impl AppState {
    /// Connect, migrate, and resolve providers and secrets from the environment.
    pub async fn from_config(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate_pool(&pool).await?;

        let keys = TokenKeys::from_config(&config.auth)?;
        let embedder = create_embedder(&config.embedding)?;
        let llm = LlmGateway::from_env(&config.llm)?;
        Self::new(config, pool, keys, embedder, llm)
    }

    /// Assemble state from already-built parts; tests use this with fakes.
    pub fn new(
        config: Config,
        pool: SqlitePool,
        keys: TokenKeys,
        embedder: Arc<dyn Embedder>,
        llm: LlmGateway,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
            .user_agent(DOWNLOAD_USER_AGENT)
            .build()?;

        Ok(Self {
            store: ManualStore::new(config.storage.root.clone()),
            pool,
            config: Arc::new(config),
            keys,
            embedder,
            llm,
            http,
        })
    }
}
