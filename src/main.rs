//! `codemem`: keep a repository's knowledge graph in sync and query it.
//!
//! Results are printed to stdout as JSON; logs go to stderr and are filtered
//! with `RUST_LOG` (default `codemem=info,codemem_index=info`).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use codemem_config::{find_repo_root, Config};
use codemem_index::{HistorySyncMode, KnowledgeGraphEngine, SyncError};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Capacity of the watcher's event channel.
const WATCH_CHANNEL: usize = 1024;

#[derive(Parser)]
#[command(name = "codemem", version, about = "Code knowledge graph synchronization engine")]
struct Cli {
    /// Repository to operate on. Defaults to the nearest enclosing
    /// repository of the working directory.
    #[arg(long, global = true)]
    repo: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the effective configuration to `.codemem/config.toml`.
    Init,

    /// Run a full synchronization (and history, when enabled).
    Index,

    /// Synchronize, then keep the graph in sync with file changes until Ctrl-C.
    Watch,

    /// Ingest commit history.
    History {
        /// Reconcile against everything reachable from head.
        #[arg(long)]
        full: bool,
    },

    /// Semantic search over code units.
    Search {
        query: String,

        #[arg(long)]
        limit: Option<usize>,

        /// Re-rank with import centrality and recent churn.
        #[arg(long)]
        hybrid: bool,

        /// Churn window in days for --hybrid.
        #[arg(long)]
        window_days: Option<i64>,
    },

    /// Imports of a file and the files importing it.
    Deps { path: String },

    /// Classes, functions and methods defined in a file, with its imports.
    Info { path: String },

    /// Files transitively depending on a file.
    Impact {
        path: String,

        #[arg(long)]
        depth: Option<usize>,
    },

    /// Commits that touched a file, newest first.
    Log {
        path: String,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// A commit with its author and touched files.
    Show { revision: String },

    /// Entity counts and sync checkpoints.
    Status,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("codemem=info,codemem_index=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(cli))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let start = match cli.repo {
        Some(root) => root,
        None => std::env::current_dir()?,
    };
    let root = find_repo_root(&start);
    let config = Config::load(&root)
        .with_context(|| format!("loading configuration for {}", root.display()))?;

    if let Commands::Init = cli.command {
        let path = config.save(&root)?;
        info!("Wrote {}", path.display());
        return Ok(());
    }

    let engine = KnowledgeGraphEngine::builder(&root)
        .with_config(config)
        .build()
        .context("opening the knowledge graph")?;
    let retrieval = engine.config().retrieval.clone();

    match cli.command {
        Commands::Init => {}
        Commands::Index => {
            let report = engine.sync_full().await?;
            print_json(&report)?;
            if engine.config().history.enabled {
                sync_history_after_index(&engine).await?;
            }
        }
        Commands::Watch => watch(Arc::new(engine)).await?,
        Commands::History { full } => {
            let mode = if full {
                HistorySyncMode::Full
            } else {
                HistorySyncMode::Incremental
            };
            print_json(&engine.sync_history(mode).await?)?;
        }
        Commands::Search {
            query,
            limit,
            hybrid,
            window_days,
        } => {
            let hits = engine
                .search(&query, limit.unwrap_or(retrieval.default_limit))
                .await?;
            if hybrid {
                let window = window_days.map(chrono::Duration::days);
                print_json(&engine.hybrid_rank(hits, window).await?)?;
            } else {
                print_json(&hits)?;
            }
        }
        Commands::Deps { path } => match engine.dependencies(&path).await? {
            Some(deps) => print_json(&deps)?,
            None => anyhow::bail!("{} is not in the graph", path),
        },
        Commands::Info { path } => match engine.file_info(&path).await? {
            Some(info) => print_json(&info)?,
            None => anyhow::bail!("{} is not in the graph", path),
        },
        Commands::Impact { path, depth } => {
            let depth = depth.unwrap_or(retrieval.default_max_depth);
            match engine.impact(&path, depth).await? {
                Some(report) => print_json(&report)?,
                None => anyhow::bail!("{} is not in the graph", path),
            }
        }
        Commands::Log { path, limit } => match engine.file_history(&path, limit).await? {
            Some(history) => print_json(&history)?,
            None => anyhow::bail!("{} is not in the graph", path),
        },
        Commands::Show { revision } => match engine.commit_context(&revision).await? {
            Some(context) => print_json(&context)?,
            None => anyhow::bail!("commit {} is not in the graph", revision),
        },
        Commands::Status => print_json(&engine.status().await?)?,
    }
    Ok(())
}

/// Incremental history sync; a divergence is reported, not reconciled.
async fn sync_history_after_index(engine: &KnowledgeGraphEngine) -> Result<()> {
    match engine.sync_history(HistorySyncMode::Incremental).await {
        Ok(report) => print_json(&report),
        Err(SyncError::HistoryDivergence { checkpoint, head }) => {
            warn!(
                "History diverged ({} is not an ancestor of {}); run `codemem history --full`",
                checkpoint, head
            );
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn watch(engine: Arc<KnowledgeGraphEngine>) -> Result<()> {
    let report = engine.sync_full().await?;
    print_json(&report)?;

    let mut watcher = engine.watcher();
    let events = watcher.start(WATCH_CHANNEL)?;
    let cancel = CancellationToken::new();

    let consumer = {
        let synchronizer = engine.synchronizer();
        let cancel = cancel.clone();
        tokio::spawn(async move { synchronizer.run(events, cancel).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    cancel.cancel();
    let undelivered = watcher.dropped_events();
    watcher.stop();
    let stats = consumer.await?;
    info!(
        "Watch stopped: {} events, {} applied, {} failed, {} dropped, {} undelivered",
        stats.received, stats.applied, stats.failed, stats.dropped, undelivered
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_hybrid_search() {
        let cli = Cli::parse_from([
            "codemem",
            "--repo",
            "/tmp/repo",
            "search",
            "parse config",
            "--hybrid",
            "--window-days",
            "30",
        ]);
        assert_eq!(cli.repo, Some(PathBuf::from("/tmp/repo")));
        match cli.command {
            Commands::Search {
                query,
                limit,
                hybrid,
                window_days,
            } => {
                assert_eq!(query, "parse config");
                assert_eq!(limit, None);
                assert!(hybrid);
                assert_eq!(window_days, Some(30));
            }
            _ => panic!("expected search"),
        }
    }

    #[test]
    fn test_parse_info() {
        let cli = Cli::parse_from(["codemem", "info", "src/app.py"]);
        match cli.command {
            Commands::Info { path } => assert_eq!(path, "src/app.py"),
            _ => panic!("expected info"),
        }
    }

    #[test]
    fn test_parse_full_history() {
        let cli = Cli::parse_from(["codemem", "history", "--full"]);
        assert!(matches!(cli.command, Commands::History { full: true }));
    }
}
