//! # kbsync CLI
//!
//! ## Usage
//!
//! ```bash
//! kbsync --app-config ./config/kbsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kbsync update` | Run one incremental update cycle |
//! | `kbsync schedule` | Run timer and file-watch triggers until Ctrl-C |
//! | `kbsync ask "<question>"` | Answer a question from the knowledge base |
//! | `kbsync serve` | Start the HTTP API |
//! | `kbsync status` | Show what the last update committed |
//!
//! ## Examples
//!
//! ```bash
//! # Re-index everything, printing the full result
//! kbsync update --force-rebuild --verbose
//!
//! # Run one scheduler-style cycle and exit (for cron)
//! kbsync schedule --manual
//!
//! # Long-running scheduler with a custom trigger config
//! kbsync schedule --config ./config/scheduler.json --daemon
//!
//! # Ask with the fine-tuned adapter model
//! kbsync ask "What is the refund policy?" --adapter
//! ```

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use kbsync::config::{self, Config, SchedulerConfig};
use kbsync::embedding::create_provider;
use kbsync::logging;
use kbsync::models::{UpdateResult, UpdateStatus};
use kbsync::progress::ProgressMode;
use kbsync::rag::{AskRequest, RagHandler};
use kbsync::scheduler::UpdateScheduler;
use kbsync::server;
use kbsync::status;
use kbsync::updater::{IncrementalUpdater, UpdaterSettings};

/// Incremental knowledge-base sync for retrieval-augmented question answering.
///
/// All commands read the application config given by `--app-config`. See
/// `config/kbsync.example.toml` for a full example. `schedule --config`
/// names the scheduler config instead.
#[derive(Parser)]
#[command(name = "kbsync", version, about)]
struct Cli {
    /// Path to the application config (TOML).
    #[arg(long, global = true, default_value = "./config/kbsync.toml")]
    app_config: PathBuf,

    /// Debug logging; `update` also prints the full result as JSON.
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Update progress on stderr. Defaults to `human` on a TTY, else `off`.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one incremental update cycle.
    ///
    /// Exits with status 1 when the cycle fails; the manifest is then left
    /// as it was, so the next run retries the same changes.
    Update {
        /// Re-index every file, ignoring the manifest.
        #[arg(long)]
        force_rebuild: bool,
    },

    /// Run the update scheduler.
    ///
    /// Starts the interval and daily timers and the file watcher, and runs an
    /// update whenever one fires. Stops on Ctrl-C and prints trigger statistics.
    Schedule {
        /// Scheduler config (JSON). Built-in defaults when omitted.
        #[arg(long, alias = "schedule-config")]
        config: Option<PathBuf>,

        /// Run a single update and exit: 0 on success or no changes, 1 on error.
        #[arg(long)]
        manual: bool,

        /// With `--manual`, re-index every file.
        #[arg(long)]
        force_rebuild: bool,

        /// Run without the startup banner.
        #[arg(long)]
        daemon: bool,
    },

    /// Answer a question from the indexed knowledge base.
    Ask {
        question: String,

        /// Answer with the adapter (fine-tuned) model.
        #[arg(long, conflicts_with = "no_adapter")]
        adapter: bool,

        /// Answer with the base model.
        #[arg(long)]
        no_adapter: bool,
    },

    /// Start the HTTP API (`POST /ask`, `GET /model_info`, `GET /health`).
    Serve,

    /// Show the last committed update and index size.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);

    match cli.command {
        Commands::Update { force_rebuild } => {
            let _guard = logging::init(cli.verbose, None)?;
            let cfg = config::load_config(&cli.app_config)?;
            let updater = build_updater(&cfg, progress)?;

            let result = updater.incremental_update(force_rebuild).await;
            print_result(&result, cli.verbose)?;
            if result.is_error() {
                bail!("update failed");
            }
        }
        Commands::Schedule {
            config: schedule_config,
            manual,
            force_rebuild,
            daemon,
        } => {
            // Logging depends on the scheduler config, so report a bad file after init.
            let loaded = SchedulerConfig::load(schedule_config.as_deref());
            let sched = match &loaded {
                Ok(sched) => sched.clone(),
                Err(_) => SchedulerConfig::default(),
            };
            let log_file = sched
                .logging
                .enabled
                .then_some(sched.logging.log_file.as_path());
            let _guard = logging::init(cli.verbose, log_file)?;
            if let Err(e) = loaded {
                warn!("{:#}; using default scheduler settings", e);
            }
            sched.validate()?;

            let cfg = config::load_config(&cli.app_config)?;
            let updater = Arc::new(build_updater(&cfg, progress)?);
            let scheduler = UpdateScheduler::new(updater, sched.clone());

            if manual {
                let result = scheduler.manual_update(force_rebuild).await;
                print_result(&result, cli.verbose)?;
                if result.is_error() {
                    bail!("update failed");
                }
                return Ok(());
            }

            if !daemon {
                print_banner(&cfg, &sched);
            }
            scheduler
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        warn!("failed to listen for Ctrl-C: {e}");
                        std::future::pending::<()>().await;
                    }
                })
                .await?;
        }
        Commands::Ask {
            question,
            adapter,
            no_adapter,
        } => {
            let _guard = logging::init(cli.verbose, None)?;
            let cfg = config::load_config(&cli.app_config)?;
            let rag = RagHandler::from_config(&cfg)?;
            let use_adapter = match (adapter, no_adapter) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };

            let response = rag
                .answer(&AskRequest {
                    query: question,
                    use_adapter,
                })
                .await?;
            println!("{}", response.answer);
            if !response.source_documents.is_empty() {
                println!();
                println!("Sources ({}):", response.model_info.model);
                for (i, doc) in response.source_documents.iter().enumerate() {
                    println!(
                        "  [{}] {} (chunk {}, score {:.3})",
                        i + 1,
                        doc.metadata.source.file_path,
                        doc.metadata.chunk_index,
                        doc.score
                    );
                }
            }
            if let Some(error) = response.error {
                bail!("answer generation failed: {}", error);
            }
        }
        Commands::Serve => {
            let _guard = logging::init(cli.verbose, None)?;
            let cfg = config::load_config(&cli.app_config)?;
            server::run_server(&cfg).await?;
        }
        Commands::Status => {
            let _guard = logging::init(cli.verbose, None)?;
            let cfg = config::load_config(&cli.app_config)?;
            status::run_status(&cfg).await?;
        }
    }

    Ok(())
}

fn build_updater(cfg: &Config, progress: ProgressMode) -> Result<IncrementalUpdater> {
    let embedder = create_provider(&cfg.embedding)?;
    info!(model = embedder.model_name(), "embedding provider ready");
    Ok(IncrementalUpdater::new(UpdaterSettings::from_config(cfg), embedder)?
        .with_progress(progress.reporter()))
}

fn print_result(result: &UpdateResult, verbose: bool) -> Result<()> {
    if verbose {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    match result.status {
        UpdateStatus::Success => {
            println!(
                "Update complete in {:.2}s: {} added, {} modified, {} deleted",
                result.duration,
                result.changes.added,
                result.changes.modified,
                result.changes.deleted
            );
            println!(
                "  documents: {}  chunks: {}",
                result.total_documents.unwrap_or(0),
                result.total_chunks.unwrap_or(0)
            );
        }
        UpdateStatus::NoChanges => {
            println!("No changes detected ({:.2}s)", result.duration);
        }
        UpdateStatus::Error => {
            println!(
                "Update failed after {:.2}s: {}",
                result.duration,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    Ok(())
}

fn print_banner(cfg: &Config, sched: &SchedulerConfig) {
    println!("kbsync scheduler");
    println!("  knowledge base: {}", cfg.paths.knowledge_base.display());
    println!("  vector store:   {}", cfg.paths.vector_store.display());
    let scheduled = &sched.scheduled_update;
    if scheduled.enabled {
        println!("  interval:       every {} h", scheduled.interval_hours);
        if let Some(time) = scheduled.time.as_deref().filter(|t| !t.trim().is_empty()) {
            println!("  daily at:       {}", time);
        }
    } else {
        println!("  scheduled updates disabled");
    }
    if sched.file_watch.enabled {
        println!(
            "  file watch:     on ({}s debounce)",
            sched.file_watch.debounce_seconds
        );
    } else {
        println!("  file watch:     off");
    }
    println!("Press Ctrl+C to stop.");
}
