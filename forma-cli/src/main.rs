//! forma-cli — operational frontend for the Forma debrief pipeline
//!
//! # Subcommands
//! - `generate --user <id> --session <id>` — generate one debrief
//! - `bulk --user <id> --session <id> [--session <id> ...]` — backfill many
//! - `history --user <id> --session <id>` — list a session's versions
//! - `health` — check database connectivity

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use forma_core::models::DebriefTrigger;
use forma_core::FormaConfig;
use forma_engine::subsystems::store;
use forma_engine::{
    bulk_generate_and_persist_debriefs, create_backend_from_config, generate_and_persist_debrief,
    BulkGenerateOptions, GenerateOptions,
};

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(
    name = "forma-cli",
    version,
    about = "Forma session debriefs — generate, backfill, and inspect"
)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "forma.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Generate (or regenerate) the debrief for one session
    Generate {
        #[arg(long)]
        user: Uuid,

        #[arg(long)]
        session: Uuid,

        /// One of: auto, manual, regenerate
        #[arg(long, default_value = "manual")]
        trigger: String,

        /// Return the existing active debrief instead of generating
        #[arg(long)]
        skip_if_active: bool,

        #[arg(long)]
        locale: Option<String>,

        #[arg(long)]
        timezone: Option<String>,

        #[arg(long)]
        correlation_id: Option<String>,
    },

    /// Generate debriefs for many sessions of one user
    Bulk {
        #[arg(long)]
        user: Uuid,

        /// Session id (repeat the flag for each session)
        #[arg(long = "session", required = true)]
        sessions: Vec<Uuid>,

        /// One of: auto, manual, regenerate
        #[arg(long, default_value = "auto")]
        trigger: String,

        /// Skip sessions that already have an active debrief
        #[arg(long)]
        skip_if_active: bool,

        #[arg(long)]
        locale: Option<String>,

        #[arg(long)]
        timezone: Option<String>,

        #[arg(long)]
        correlation_id: Option<String>,
    },

    /// Show the version history for one session
    History {
        #[arg(long)]
        user: Uuid,

        #[arg(long)]
        session: Uuid,

        /// Maximum number of versions to show
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: i64,
    },

    /// Check database connectivity
    Health,
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present (dev convenience — production uses real env vars)
    dotenvy::dotenv().ok();

    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()))
        .init();

    let cli = Cli::parse();

    let config = match FormaConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("forma-cli: failed to load config from {}: {}", cli.config, e);
            std::process::exit(1);
        }
    };

    let pool = match forma_core::db::create_pool(&config.database).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("forma-cli: failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    match cli.command {
        Commands::Health => {
            match forma_core::db::health_check(&pool).await {
                Ok(v) => println!("PostgreSQL connected: {}", v),
                Err(e) => {
                    eprintln!("forma-cli: PostgreSQL connection failed: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::History {
            user,
            session,
            limit,
        } => {
            let rows = store::list_history(&pool, user, session, limit).await?;
            if rows.is_empty() {
                eprintln!("No debriefs for session {}", session);
                return Ok(());
            }
            for debrief in rows {
                let marker = if debrief.is_active { "*" } else { " " };
                let preview: String = debrief.summary.chars().take(72).collect();
                println!(
                    "{} v{:<3} {}  {}  {}",
                    marker,
                    debrief.version,
                    debrief.id,
                    debrief.created_at.format("%Y-%m-%d %H:%M"),
                    preview
                );
            }
        }

        Commands::Generate {
            user,
            session,
            trigger,
            skip_if_active,
            locale,
            timezone,
            correlation_id,
        } => {
            let trigger: DebriefTrigger = trigger.parse().map_err(anyhow::Error::msg)?;
            let backend = create_backend_from_config(&config)?;

            let outcome = generate_and_persist_debrief(
                &pool,
                backend.as_ref(),
                &config.persistence,
                GenerateOptions {
                    user_id: user,
                    session_id: session,
                    locale,
                    timezone,
                    skip_if_active,
                    trigger,
                    correlation_id,
                },
            )
            .await?;

            if outcome.content.is_none() {
                eprintln!(
                    "Active debrief v{} already exists, nothing generated",
                    outcome.debrief.version
                );
            }
            println!("{}", serde_json::to_string_pretty(&outcome.debrief)?);
        }

        Commands::Bulk {
            user,
            sessions,
            trigger,
            skip_if_active,
            locale,
            timezone,
            correlation_id,
        } => {
            let trigger: DebriefTrigger = trigger.parse().map_err(anyhow::Error::msg)?;
            let backend = create_backend_from_config(&config)?;

            let outcome = bulk_generate_and_persist_debriefs(
                &pool,
                backend.as_ref(),
                &config.persistence,
                BulkGenerateOptions {
                    user_id: user,
                    session_ids: sessions,
                    locale,
                    timezone,
                    skip_if_active,
                    trigger,
                    correlation_id,
                },
            )
            .await?;

            println!(
                "{} written, {} failed",
                outcome.debriefs.len(),
                outcome.errors.len()
            );
            for debrief in &outcome.debriefs {
                println!("  {} v{}", debrief.session_id, debrief.version);
            }
            for failure in &outcome.errors {
                eprintln!("  {} failed: {}", failure.session_id, failure.error);
            }
            if !outcome.errors.is_empty() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
