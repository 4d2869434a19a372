//! # Manual KB CLI (`mkb`)
//!
//! Turns support consultations into reviewed, versioned manuals.
//!
//! ## Usage
//!
//! ```bash
//! mkb --config ./config/mkb.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mkb init` | Create the SQLite database and run schema migrations |
//! | `mkb consultation import <file>` | Load consultations from JSON |
//! | `mkb draft from-consultation <id>` | Generate a draft with the configured model |
//! | `mkb draft new --file <json>` | Create a hand-written draft |
//! | `mkb show <id>` / `mkb list` | Inspect manuals |
//! | `mkb update <id> --file <json>` | Edit a draft |
//! | `mkb approve <id> --by <who>` | Approve a draft as a new version |
//! | `mkb delete <id>` | Delete a draft |
//! | `mkb deprecate <id> --by <who>` | Retire an approved manual |
//! | `mkb check <id>` | Re-run conflict detection for a draft |
//! | `mkb tasks ...` | List, show, approve and reject review tasks |
//! | `mkb search "<query>"` | Semantic search over approved manuals |
//! | `mkb index rebuild` / `mkb index retry` | Vector index maintenance |
//! | `mkb stats` | Database overview |
//!
//! Logs go to stderr; set `RUST_LOG` (default `info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use manual_kb::{config, consultations, index_cmd, manuals, migrate, search, stats, tasks};

/// Manual KB CLI: consultations in, reviewed manuals out.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/mkb.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "mkb",
    about = "Manual KB: turn support consultations into reviewed, versioned manuals",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/mkb.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Manage consultation records.
    Consultation {
        #[command(subcommand)]
        action: ConsultationAction,
    },

    /// Create drafts.
    Draft {
        #[command(subcommand)]
        action: DraftAction,
    },

    /// Print a manual and its version history.
    Show { id: String },

    /// List manuals.
    List {
        /// DRAFT, APPROVED or DEPRECATED.
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        business_type: Option<String>,
        #[arg(long)]
        error_code: Option<String>,
    },

    /// Edit a draft from a JSON patch (`keywords`, `topic`, `background`,
    /// `guideline`; omitted fields are kept).
    Update {
        id: String,
        #[arg(long)]
        file: PathBuf,
    },

    /// Approve a draft, recording a new version.
    Approve {
        id: String,
        #[arg(long)]
        by: String,
    },

    /// Delete a draft and its open review tasks.
    Delete { id: String },

    /// Retire an approved manual.
    Deprecate {
        id: String,
        #[arg(long)]
        by: String,
    },

    /// Re-run conflict detection for a draft.
    Check { id: String },

    /// Review tasks.
    Tasks {
        #[command(subcommand)]
        action: TaskAction,
    },

    /// Semantic search over approved manuals.
    Search {
        query: String,
        #[arg(long)]
        business_type: Option<String>,
        #[arg(long)]
        error_code: Option<String>,
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },

    /// Vector index maintenance.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Show database statistics.
    Stats,
}

#[derive(Subcommand)]
enum ConsultationAction {
    /// Import consultations from a JSON file (object or array).
    Import { file: PathBuf },
}

#[derive(Subcommand)]
enum DraftAction {
    /// Generate a draft from a stored consultation.
    FromConsultation {
        id: String,
        /// Skip the grounding check against the consultation text.
        #[arg(long)]
        no_enforce: bool,
    },
    /// Create a draft from hand-written JSON.
    New {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        no_enforce: bool,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// List review tasks (open ones unless `--status` or `--all`).
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// Print a task with its differences and history.
    Show { id: String },
    /// Approve a task; its draft is approved in the same step.
    Approve {
        id: String,
        #[arg(long)]
        by: String,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Reject a task. The draft stays a draft.
    Reject {
        id: String,
        #[arg(long)]
        by: String,
        #[arg(long)]
        reason: String,
    },
}

#[derive(Subcommand)]
enum IndexAction {
    /// Re-embed every approved manual.
    Rebuild,
    /// Replay index writes that failed earlier.
    Retry {
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Consultation { action } => match action {
            ConsultationAction::Import { file } => {
                consultations::run_import(&cfg, &file).await?;
            }
        },
        Commands::Draft { action } => match action {
            DraftAction::FromConsultation { id, no_enforce } => {
                manuals::run_draft_from_consultation(&cfg, &id, no_enforce).await?;
            }
            DraftAction::New { file, no_enforce } => {
                manuals::run_draft_new(&cfg, &file, no_enforce).await?;
            }
        },
        Commands::Show { id } => manuals::run_show(&cfg, &id).await?,
        Commands::List {
            status,
            business_type,
            error_code,
        } => manuals::run_list(&cfg, status, business_type, error_code).await?,
        Commands::Update { id, file } => manuals::run_update(&cfg, &id, &file).await?,
        Commands::Approve { id, by } => manuals::run_approve(&cfg, &id, &by).await?,
        Commands::Delete { id } => manuals::run_delete(&cfg, &id).await?,
        Commands::Deprecate { id, by } => manuals::run_deprecate(&cfg, &id, &by).await?,
        Commands::Check { id } => manuals::run_check(&cfg, &id).await?,
        Commands::Tasks { action } => match action {
            TaskAction::List { status, all } => tasks::run_list(&cfg, status, all).await?,
            TaskAction::Show { id } => tasks::run_show(&cfg, &id).await?,
            TaskAction::Approve { id, by, notes } => {
                tasks::run_approve(&cfg, &id, &by, notes).await?
            }
            TaskAction::Reject { id, by, reason } => {
                tasks::run_reject(&cfg, &id, &by, &reason).await?
            }
        },
        Commands::Search {
            query,
            business_type,
            error_code,
            limit,
        } => search::run_search(&cfg, &query, business_type, error_code, limit).await?,
        Commands::Index { action } => match action {
            IndexAction::Rebuild => index_cmd::run_rebuild(&cfg).await?,
            IndexAction::Retry { limit } => index_cmd::run_retry(&cfg, limit).await?,
        },
        Commands::Stats => stats::run_stats(&cfg).await?,
    }

    Ok(())
}
