//! # Tech Copilot CLI (`copilot`)
//!
//! Administers the service and runs the HTTP API.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `copilot init` | Create the SQLite database and schema |
//! | `copilot serve` | Start the HTTP API server |
//! | `copilot user create` | Create a user with a given role |
//! | `copilot user reset-password` | Set a new password for a user |
//! | `copilot manual index <id>` | Index (or re-index) a stored manual now |
//! | `copilot cache purge` | Delete expired troubleshooting cache entries |
//! | `copilot usage` | Print AI usage and cost for all users |
//!
//! ## Examples
//!
//! ```bash
//! copilot --config ./config/copilot.toml init
//! copilot user create --username alice --email alice@example.com --password secret123 --role admin
//! copilot serve
//! copilot usage --days 7
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use tech_copilot::auth::{self, RegisterRequest, ROLE_TECHNICIAN};
use tech_copilot::config::{self, Config};
use tech_copilot::state::AppState;
use tech_copilot::{cache, db, indexing, migrate, server, usage};

const DEFAULT_LOG_FILTER: &str = "tech_copilot=info,tower_http=info";

/// Tech Copilot: equipment manuals, RAG answers and AI troubleshooting.
#[derive(Parser)]
#[command(name = "copilot", version, about = "Tech Copilot field-service assistant backend")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/copilot.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Start the HTTP API server on `[server] bind`.
    Serve,

    /// Manage user accounts.
    User {
        #[command(subcommand)]
        action: UserAction,
    },

    /// Manage stored manuals.
    Manual {
        #[command(subcommand)]
        action: ManualAction,
    },

    /// Manage the troubleshooting cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Print AI usage and cost across all users.
    Usage {
        /// Look-back window in days (1-365).
        #[arg(long, default_value = "30")]
        days: i64,
    },
}

#[derive(Subcommand)]
enum UserAction {
    /// Create a user account.
    Create {
        #[arg(long)]
        username: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        /// One of `admin`, `technician`, `readonly`.
        #[arg(long, default_value = ROLE_TECHNICIAN)]
        role: String,
        #[arg(long)]
        full_name: Option<String>,
    },
    /// Replace a user's password and reactivate the account.
    ResetPassword {
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
    },
}

#[derive(Subcommand)]
enum ManualAction {
    /// Extract, chunk and embed a stored manual in the foreground.
    Index {
        /// Manual id (UUID).
        id: String,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Delete expired entries.
    Purge,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(cfg).await?;
        }
        Commands::User { action } => run_user(&cfg, action).await?,
        Commands::Manual {
            action: ManualAction::Index { id },
        } => {
            let state = AppState::from_config(cfg).await?;
            let outcome = indexing::index_manual(&state, &id).await?;
            println!(
                "Indexed manual {}: {} pages, {} chunks",
                outcome.manual_id, outcome.pages, outcome.chunks
            );
        }
        Commands::Cache {
            action: CacheAction::Purge,
        } => {
            let pool = open_pool(&cfg).await?;
            let removed = cache::purge_expired(&pool).await?;
            println!("Purged {} expired cache entries.", removed);
        }
        Commands::Usage { days } => print_usage(&cfg, days).await?,
    }

    Ok(())
}

async fn open_pool(cfg: &Config) -> anyhow::Result<sqlx::SqlitePool> {
    let pool = db::connect(cfg).await?;
    migrate::migrate_pool(&pool).await?;
    Ok(pool)
}

async fn run_user(cfg: &Config, action: UserAction) -> anyhow::Result<()> {
    let pool = open_pool(cfg).await?;
    match action {
        UserAction::Create {
            username,
            email,
            password,
            role,
            full_name,
        } => {
            let req = RegisterRequest {
                username,
                email,
                password,
                full_name,
            };
            let user = auth::create_user(&pool, &req, &role).await?;
            println!("Created user {} (id {}, role {})", user.username, user.user_id, user.role);
        }
        UserAction::ResetPassword { username, password } => {
            auth::reset_password(&pool, &username, &password).await?;
            println!("Password reset for {}", username);
        }
    }
    Ok(())
}

async fn print_usage(cfg: &Config, days: i64) -> anyhow::Result<()> {
    let pool = open_pool(cfg).await?;
    let summary = usage::summary(&pool, None, days).await?;
    let models = usage::by_model(&pool, None, days).await?;

    println!("AI usage, last {} days", summary.period_days);
    println!("========================");
    println!("  Requests:    {}", summary.total_requests);
    println!("  Cache hits:  {}", summary.cache_hits);
    println!("  Tokens:      {}", summary.total_tokens);
    println!("  Cost:        ${:.4}", summary.total_cost_usd);

    if !models.is_empty() {
        println!();
        println!("  {:<20} {:<10} {:>8} {:>10} {:>10}", "MODEL", "PROVIDER", "REQUESTS", "TOKENS", "COST");
        for m in &models {
            println!(
                "  {:<20} {:<10} {:>8} {:>10} {:>10.4}",
                m.model_id.as_deref().unwrap_or("-"),
                m.provider.as_deref().unwrap_or("-"),
                m.requests,
                m.tokens,
                m.cost_usd
            );
        }
    }
    Ok(())
}
