//! Loupe CLI, a thin shell over the `loupe-core` engine.
//!
//! Exit codes: 0 on success, 1 on initialization failure. The core itself
//! never exits the process. All logging goes to stderr; stdout carries only
//! command output.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use loupe_core::config::{self, EngineConfig, GlobalConfig};
use loupe_core::{Engine, Priority};

/// Loupe: local code indexing and search.
#[derive(Parser)]
#[command(name = "loupe", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output as JSON instead of human-readable text
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan and index a project tree
    Index {
        /// Project root (default: current directory)
        #[arg(long)]
        root: Option<PathBuf>,

        /// Drop existing state and re-index everything
        #[arg(long)]
        full: bool,
    },
    /// Search indexed content
    Search {
        /// Search query (term, `term*`, `%term%`, or glob with --pattern)
        query: String,

        /// Project root (default: current directory)
        #[arg(long)]
        root: Option<PathBuf>,

        /// Treat the query as a LIKE/glob pattern
        #[arg(long)]
        pattern: bool,

        /// Maximum number of results
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Index, then watch for changes and re-index live
    Watch {
        /// Project root (default: current directory)
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Show engine statistics for a project
    Status {
        /// Project root (default: current directory)
        #[arg(long)]
        root: Option<PathBuf>,
    },
}

fn resolve_root(root: Option<PathBuf>) -> Result<PathBuf> {
    let root = match root {
        Some(r) => r,
        None => std::env::current_dir().context("could not determine current directory")?,
    };
    root.canonicalize().with_context(|| format!("project root not found: {}", root.display()))
}

fn open_engine(root: &PathBuf) -> Result<Engine> {
    let global = config::config_dir().map(|d| d.join("config.toml"));
    let engine_config = EngineConfig::load(global.as_deref(), root)
        .context("failed to load configuration")?;
    let engine = Engine::open(root, engine_config).context("failed to open engine")?;

    // Remember the base path across runs.
    if let Some(dir) = config::config_dir() {
        let path = dir.join(config::CONFIG_JSON);
        let mut global = GlobalConfig::load(&path).unwrap_or_default();
        global.base_path = Some(root.display().to_string());
        let _ = global.save(&path);
    }
    Ok(engine)
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Index { root, full } => {
            let root = resolve_root(root)?;
            let engine = open_engine(&root)?;
            engine.start();

            let report = if full {
                engine.index_full(Priority::Low).await
            } else {
                engine.index_incremental(Priority::Normal).await
            }
            .map_err(|e| anyhow::anyhow!("{e}"))?;

            engine.wait_for_idle(Duration::from_secs(600)).await;
            engine.shutdown().await;

            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({
                        "added": report.changes.added.len(),
                        "modified": report.changes.modified.len(),
                        "deleted": report.changes.deleted.len(),
                        "unchanged": report.changes.unchanged.len(),
                        "scanned_dirs": report.scanned_dirs,
                        "scan_timed_out": report.scan_timed_out,
                    })
                );
            } else {
                println!(
                    "Indexed {} (+{} ~{} -{} ={} unchanged, {} dirs)",
                    root.display(),
                    report.changes.added.len(),
                    report.changes.modified.len(),
                    report.changes.deleted.len(),
                    report.changes.unchanged.len(),
                    report.scanned_dirs
                );
            }
        }
        Commands::Search { query, root, pattern, limit } => {
            let root = resolve_root(root)?;
            let engine = open_engine(&root)?;
            let response = engine.search(&query, pattern, limit).await;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                if response.degraded_status != "full" {
                    eprintln!(
                        "degraded: {} (backend: {})",
                        response.degraded_status, response.backend_used
                    );
                }
                if response.hits.is_empty() {
                    println!("No results for '{query}'");
                } else {
                    for hit in &response.hits {
                        let preview = hit.original.content_preview.replace('\n', " ");
                        let preview: String = preview.chars().take(80).collect();
                        println!("{:.3}  {}  {}", hit.final_score, hit.path, preview.trim());
                    }
                }
            }
        }
        Commands::Watch { root } => {
            let root = resolve_root(root)?;
            let engine = open_engine(&root)?;
            engine.start();
            engine
                .index_incremental(Priority::Normal)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;

            let _watcher = engine.start_watcher().context("failed to start file watcher")?;
            eprintln!("Watching {} (Ctrl-C to stop)", root.display());
            shutdown_signal().await;
            engine.shutdown().await;
        }
        Commands::Status { root } => {
            let root = resolve_root(root)?;
            let engine = open_engine(&root)?;
            let stats = engine.stats();
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Project: {}", root.display());
                println!("  documents:     {}", stats.store.documents);
                println!("  tracked files: {}", stats.tracked_files);
                println!("  queue size:    {}", stats.queue.size);
                println!("  level:         {:?}", engine.current_level());
            }
        }
    }
    Ok(())
}

fn main() {
    // Structured logs on stderr; stdout stays clean for command output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("loupe=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime");

    if let Err(e) = runtime.block_on(run(cli)) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
