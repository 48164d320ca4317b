//! # Canon CLI (`canon`)
//!
//! ## Usage
//!
//! ```bash
//! canon --config ./config/canon.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `canon init` | Create the SQLite database and run schema migrations |
//! | `canon ingest <file>` | Store and deduplicate chunks from a JSONL file |
//! | `canon similar <chunk-id>` | Canonical-aware similarity search |
//! | `canon duplicates <chunk-id>` | Classified duplicate candidates for a chunk |
//! | `canon canonical ...` | Inspect records, promote or detach variants |
//! | `canon contradictions ...` | List, inspect, and resolve contradictions |
//! | `canon reviews ...` | Work the manual review queue |
//! | `canon reconcile ...` | Start, resume, inspect, and stop batch reconciliation |
//! | `canon stats` | Database statistics |
//! | `canon completions <shell>` | Print shell completions |

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use canon::progress::ProgressMode;
use canon::reconcile::StartArgs;
use canon::{
    canonical, config, contradictions, ingest, migrate, reconcile, reviews, search, stats,
};

/// Canon: semantic memory deduplication for vector-indexed knowledge stores.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/canon.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "canon",
    about = "Canon: semantic memory deduplication for vector-indexed knowledge stores",
    version,
    long_about = "Canon keeps one authoritative chunk per fact. It classifies near-duplicate \
    chunks, merges them into canonical records, links complementary content, flags \
    contradictions for review, and collapses variants at retrieval time."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/canon.toml")]
    config: PathBuf,

    /// Log at debug level (overridden by RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Store chunks from a JSONL file and deduplicate each one.
    ///
    /// Each line needs `content` and `embedding`; `id`, `project`,
    /// `source_document_id`, `source_location`, `metadata` and `created_at`
    /// are optional.
    Ingest {
        /// Path to the JSONL file.
        path: PathBuf,

        /// Chunks processed at the same time.
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
    },

    /// Find chunks similar to an existing chunk.
    Similar {
        chunk_id: String,

        /// Do not collapse variants into their canonical.
        #[arg(long)]
        raw: bool,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        include_archived: bool,
    },

    /// List classified duplicate candidates for a chunk.
    Duplicates {
        chunk_id: String,

        /// Similarity threshold (defaults to `dedup.similarity_threshold`).
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Inspect and adjust canonical records.
    Canonical {
        #[command(subcommand)]
        action: CanonicalAction,
    },

    /// Manage detected contradictions.
    Contradictions {
        #[command(subcommand)]
        action: ContradictionAction,
    },

    /// Work the manual review queue.
    Reviews {
        #[command(subcommand)]
        action: ReviewAction,
    },

    /// Batch reconciliation over the whole store.
    Reconcile {
        #[command(subcommand)]
        action: ReconcileAction,
    },

    /// Show database statistics.
    Stats,

    /// Print shell completions to stdout.
    Completions {
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum CanonicalAction {
    /// Show a canonical record with its variants and links.
    Show {
        /// Record id, or a member chunk id with `--chunk`.
        id: String,

        #[arg(long)]
        chunk: bool,
    },
    /// Make a variant the canonical chunk of its record.
    Promote {
        canonical_id: String,
        chunk_id: String,

        #[arg(long, default_value = "manual promotion")]
        reason: String,
    },
    /// Remove a variant from its record; it becomes standalone.
    Detach { chunk_id: String },
    /// Where the record's chunks came from.
    Provenance { canonical_id: String },
}

#[derive(Subcommand)]
enum ContradictionAction {
    List {
        /// pending, in_review, resolved, or dismissed.
        #[arg(long)]
        status: Option<String>,

        #[arg(long)]
        project: Option<String>,
    },
    Show {
        id: String,
    },
    /// Mark a contradiction as under review.
    Review {
        id: String,
    },
    Resolve {
        id: String,

        /// keep_a, keep_b, keep_both, archive_both, merge, or dismiss.
        #[arg(long)]
        action: String,

        /// Chunk to keep when merging.
        #[arg(long)]
        preferred: Option<String>,

        #[arg(long)]
        notes: Option<String>,
    },
}

#[derive(Subcommand)]
enum ReviewAction {
    List {
        #[arg(long)]
        project: Option<String>,
    },
    /// Apply a decision to a queued chunk.
    Decide {
        review_id: String,

        /// merge, keep_separate, link, flag_contradiction, or delete.
        decision: String,

        /// Candidate chunk the decision applies to.
        #[arg(long)]
        target: Option<String>,

        #[arg(long)]
        description: Option<String>,

        /// low, medium, high, or critical.
        #[arg(long)]
        severity: Option<String>,
    },
}

#[derive(Subcommand)]
enum ReconcileAction {
    /// Create a job and run it in the foreground.
    Start {
        /// Report what would change without writing anything.
        #[arg(long)]
        dry_run: bool,

        #[arg(long)]
        batch_size: Option<usize>,

        #[arg(long)]
        delay_ms: Option<u64>,

        /// Only reconcile chunks of this project.
        #[arg(long)]
        project: Option<String>,

        /// Create the job without running it.
        #[arg(long)]
        detach: bool,

        /// Progress on stderr (default: human when stderr is a TTY).
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,

        /// Print the result as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Continue a pending, paused, cancelled, or failed job.
    Resume {
        job_id: String,

        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,

        #[arg(long)]
        json: bool,
    },
    Status {
        job_id: String,

        #[arg(long)]
        json: bool,
    },
    List {
        #[arg(long)]
        state: Option<String>,

        #[arg(long)]
        limit: Option<usize>,
    },
    Cancel {
        job_id: String,
    },
    Pause {
        job_id: String,
    },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // Commands that don't require config
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "canon", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { path, concurrency } => {
            ingest::run_ingest(&cfg, &path, concurrency).await?;
        }
        Commands::Similar {
            chunk_id,
            raw,
            limit,
            include_archived,
        } => {
            search::run_similar(&cfg, &chunk_id, raw, limit, include_archived).await?;
        }
        Commands::Duplicates {
            chunk_id,
            threshold,
        } => {
            search::run_duplicates(&cfg, &chunk_id, threshold).await?;
        }
        Commands::Canonical { action } => match action {
            CanonicalAction::Show { id, chunk } => {
                canonical::run_show(&cfg, &id, chunk).await?;
            }
            CanonicalAction::Promote {
                canonical_id,
                chunk_id,
                reason,
            } => {
                canonical::run_promote(&cfg, &canonical_id, &chunk_id, &reason).await?;
            }
            CanonicalAction::Detach { chunk_id } => {
                canonical::run_detach(&cfg, &chunk_id).await?;
            }
            CanonicalAction::Provenance { canonical_id } => {
                canonical::run_provenance(&cfg, &canonical_id).await?;
            }
        },
        Commands::Contradictions { action } => match action {
            ContradictionAction::List { status, project } => {
                contradictions::run_list(&cfg, status.as_deref(), project.as_deref()).await?;
            }
            ContradictionAction::Show { id } => {
                contradictions::run_show(&cfg, &id).await?;
            }
            ContradictionAction::Review { id } => {
                contradictions::run_mark_in_review(&cfg, &id).await?;
            }
            ContradictionAction::Resolve {
                id,
                action,
                preferred,
                notes,
            } => {
                contradictions::run_resolve(&cfg, &id, &action, preferred, notes).await?;
            }
        },
        Commands::Reviews { action } => match action {
            ReviewAction::List { project } => {
                reviews::run_list(&cfg, project.as_deref()).await?;
            }
            ReviewAction::Decide {
                review_id,
                decision,
                target,
                description,
                severity,
            } => {
                let decision =
                    reviews::build_decision(&decision, target, description, severity.as_deref())?;
                reviews::run_decide(&cfg, &review_id, &decision).await?;
            }
        },
        Commands::Reconcile { action } => match action {
            ReconcileAction::Start {
                dry_run,
                batch_size,
                delay_ms,
                project,
                detach,
                progress,
                json,
            } => {
                let args = StartArgs {
                    dry_run,
                    batch_size,
                    delay_ms,
                    project,
                    detach,
                };
                let progress = progress.unwrap_or_else(ProgressMode::default_for_tty);
                reconcile::run_start(&cfg, &args, progress, json).await?;
            }
            ReconcileAction::Resume {
                job_id,
                progress,
                json,
            } => {
                let progress = progress.unwrap_or_else(ProgressMode::default_for_tty);
                reconcile::run_resume(&cfg, &job_id, progress, json).await?;
            }
            ReconcileAction::Status { job_id, json } => {
                reconcile::run_status(&cfg, &job_id, json).await?;
            }
            ReconcileAction::List { state, limit } => {
                reconcile::run_list(&cfg, state.as_deref(), limit).await?;
            }
            ReconcileAction::Cancel { job_id } => {
                reconcile::run_cancel(&cfg, &job_id).await?;
            }
            ReconcileAction::Pause { job_id } => {
                reconcile::run_pause(&cfg, &job_id).await?;
            }
        },
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Completions { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}
