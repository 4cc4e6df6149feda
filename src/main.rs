//! # Corpus CLI (`corpus`)
//!
//! Indexes a markdown vault and assembles token-bounded context from it.
//!
//! ## Usage
//!
//! ```bash
//! corpus --config ./config/corpus.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `corpus index` | Scan the vault and embed every stale entity |
//! | `corpus status` | Print kernel state, entity count and queue snapshot as JSON |
//! | `corpus context [QUERY]` | Assemble context and print the result as JSON |
//! | `corpus strategies` | List context strategies |
//!
//! ## Examples
//!
//! ```bash
//! # Embed the vault, JSON progress on stderr
//! corpus index --progress json
//!
//! # Context around a note, at most 2000 tokens, 500 of them for recent notes
//! corpus context "release checklist" --target notes/release.md \
//!     --max-tokens 2000 --budget recent=500
//! ```
//!
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `info`).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use corpus_context::config::{self, Config};
use corpus_context::connector_fs::scan_vault;
use corpus_context::context::{ContextManager, StrategyRegistry};
use corpus_context::embedding::{self, EmbeddingProvider};
use corpus_context::kernel::selectors::legacy_status;
use corpus_context::kernel::Kernel;
use corpus_context::models::ContextParams;
use corpus_context::progress::{self, ProgressMode};
use corpus_context::queue::{JobQueue, QueueOptions};
use corpus_context::runner::{self, EmbedRunner, RunOptions, RunSummary, StopOutcome};
use corpus_context::scheduler::{IngestReport, Scheduler};
use corpus_context::store::{EntityStore, InMemoryEntityStore};

/// Corpus: embed a markdown vault and assemble budgeted context from it.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(name = "corpus", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/corpus.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan the vault and embed every entity whose vector is missing or stale.
    ///
    /// Ctrl-C requests a graceful stop; a run that does not stop within
    /// `run.stop_timeout_ms` is abandoned.
    Index {
        /// Progress output on stderr. Defaults to `human` on a terminal,
        /// `off` otherwise.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,

        /// Scan and report the backlog without calling the provider.
        #[arg(long)]
        dry_run: bool,
    },

    /// Print kernel state and queue snapshot as JSON.
    Status,

    /// Assemble context and print the result as JSON.
    Context {
        /// Free-text query for semantic retrieval.
        query: Option<String>,

        /// Vault path of the note the context is for.
        #[arg(long)]
        target: Option<String>,

        /// Entity key to include verbatim. Repeatable.
        #[arg(long = "manual")]
        manual: Vec<String>,

        /// Total token budget. Defaults to `context.max_tokens`.
        #[arg(long)]
        max_tokens: Option<usize>,

        /// Fixed budget for one strategy, as NAME=TOKENS. Repeatable.
        #[arg(long = "budget", value_parser = parse_budget)]
        budget: Vec<(String, usize)>,
    },

    /// List context strategies with priority and enabled state.
    Strategies,
}

fn parse_budget(s: &str) -> Result<(String, usize), String> {
    let (name, tokens) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=TOKENS, got '{}'", s))?;
    let tokens = tokens
        .trim()
        .parse()
        .map_err(|e| format!("invalid token count in '{}': {}", s, e))?;
    Ok((name.trim().to_string(), tokens))
}

/// Everything a command needs after the vault has been ingested.
struct App {
    kernel: Arc<Kernel>,
    store: Arc<dyn EntityStore>,
    scheduler: Arc<Scheduler>,
    provider: Arc<dyn EmbeddingProvider>,
    ingested: IngestReport,
    sources: usize,
}

impl App {
    async fn open(cfg: &Config) -> Result<Self> {
        let kernel = Arc::new(Kernel::new());
        let store: Arc<dyn EntityStore> = Arc::new(InMemoryEntityStore::new());
        let queue = JobQueue::shared(
            QueueOptions::default()
                .on_has_items(|| tracing::debug!("embed queue has items"))
                .on_empty(|| tracing::debug!("embed queue drained")),
        );
        let scheduler = Arc::new(Scheduler::new(
            queue,
            store.clone(),
            kernel.clone(),
            cfg.embedding.min_embed_chars,
        ));
        let provider = embedding::create_provider(&cfg.embedding)?;

        let mut sources = 0;
        let mut ingested = IngestReport::default();
        let init = async {
            let files = scan_vault(&cfg.vault)?;
            sources = files.len();
            ingested = scheduler.ingest_all(&files).await?;
            Ok::<_, anyhow::Error>(())
        }
        .await;
        runner::boot(&kernel, init).context("Failed to index vault")?;

        Ok(Self {
            kernel,
            store,
            scheduler,
            provider,
            ingested,
            sources,
        })
    }

    fn runner(&self, cfg: &Config) -> Arc<EmbedRunner> {
        Arc::new(EmbedRunner::new(
            self.kernel.clone(),
            self.scheduler.clone(),
            self.store.clone(),
            self.provider.clone(),
            RunOptions::from_config(cfg),
        ))
    }

    /// Load the model and run until the queue is empty or Ctrl-C stops it.
    async fn embed(&self, cfg: &Config) -> Result<RunSummary> {
        runner::switch_model(&self.kernel, self.provider.as_ref()).await?;

        let runner = self.runner(cfg);
        let mut run = tokio::spawn({
            let runner = runner.clone();
            async move { runner.run().await }
        });

        let result = tokio::select! {
            joined = &mut run => joined?,
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("interrupt received, stopping embedding run");
                match runner.request_stop(cfg.run.stop_timeout()).await {
                    StopOutcome::TimedOut => {
                        run.abort();
                        bail!("embedding run did not stop within {}ms", cfg.run.stop_timeout_ms);
                    }
                    _ => run.await?,
                }
            }
        };
        Ok(result?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Index { progress, dry_run } => {
            let app = App::open(&cfg).await?;
            let pending = app.kernel.state().queue.pending_jobs;

            if dry_run {
                println!("index (dry-run)");
                println!("  sources: {}", app.sources);
                println!("  entities: {}", app.ingested.entities);
                println!("  pending embeddings: {}", pending);
                return Ok(());
            }

            if !cfg.embedding.is_enabled() {
                bail!("Embedding provider is disabled. Set [embedding] provider in config.");
            }

            let mode = progress.unwrap_or_else(ProgressMode::default_for_tty);
            let watcher = progress::spawn_watcher(&app.kernel, mode.reporter());
            let outcome = app.embed(&cfg).await;
            watcher.abort();
            let summary = outcome?;

            println!("index");
            println!("  sources: {}", app.sources);
            println!("  entities: {}", app.ingested.entities);
            println!("  embedded: {}", summary.embedded);
            println!("  skipped: {}", summary.skipped);
            println!("  deferred: {}", summary.deferred);
            println!("  remaining: {}", app.kernel.state().queue.pending_jobs);
            if summary.stopped {
                println!("  stopped early (phase: {})", app.kernel.phase());
            }
        }

        Commands::Status => {
            let app = App::open(&cfg).await?;
            let state = app.kernel.state();
            let out = serde_json::json!({
                "status": legacy_status(&state),
                "sources": app.sources,
                "entities": app.store.len().await?,
                "state": &*state,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }

        Commands::Context {
            query,
            target,
            manual,
            max_tokens,
            budget,
        } => {
            let app = App::open(&cfg).await?;

            let provider = if cfg.embedding.is_enabled() {
                if let Err(e) = app.embed(&cfg).await {
                    tracing::warn!(err = %e, "embedding failed; semantic results may be incomplete");
                }
                Some(app.provider.clone())
            } else {
                None
            };

            let mut strategy_budgets = cfg.context.strategy_budgets();
            strategy_budgets.extend(budget);

            let params = ContextParams {
                max_tokens: max_tokens.unwrap_or(cfg.context.max_tokens),
                strategy_budgets,
                manual_selections: manual,
                query,
                target_path: target,
            };

            let registry = StrategyRegistry::with_builtins(app.store.clone(), provider, &cfg.context);
            let manager = ContextManager::from_config(registry, &cfg.context);
            let result = manager.gather(&params).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }

        Commands::Strategies => {
            let store: Arc<dyn EntityStore> = Arc::new(InMemoryEntityStore::new());
            let provider = if cfg.embedding.is_enabled() {
                Some(embedding::create_provider(&cfg.embedding)?)
            } else {
                None
            };
            let registry = StrategyRegistry::with_builtins(store, provider, &cfg.context);
            let manager = ContextManager::from_config(registry, &cfg.context);

            println!("{:<10} {:>8}  ENABLED", "STRATEGY", "PRIORITY");
            for strategy in manager.registry().strategies() {
                println!(
                    "{:<10} {:>8}  {}",
                    strategy.name(),
                    strategy.priority(),
                    manager.is_enabled(strategy.as_ref())
                );
            }
        }
    }

    Ok(())
}
