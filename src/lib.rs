// src/lib.rs

pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod hub;
pub mod logging;
pub mod scanner;
pub mod sched;
pub mod store;
pub mod workflow;

use anyhow::Result;
use tracing::info;

use crate::cli::CliArgs;
use crate::config::Config;
use crate::engine::Engine;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - the engine (store, hub, pool, scheduler, watcher)
/// - Ctrl-C handling and orderly shutdown
pub async fn run(args: CliArgs) -> Result<()> {
    let cfg = config::load_or_default(&args.config)?;

    if args.dry_run {
        print_dry_run(&cfg);
        return Ok(());
    }

    if args.scan_only {
        return run_scan_only(&cfg).await;
    }

    let engine = Engine::start(&cfg).await?;
    info!("watchflow running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("received Ctrl-C");
    engine.shutdown().await;
    Ok(())
}

/// Run the startup scans for every enabled workflow, then exit.
async fn run_scan_only(cfg: &Config) -> Result<()> {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use crate::scanner::Scanner;
    use crate::store::Store;

    let db_path = std::path::PathBuf::from(&cfg.database_path);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Arc::new(Store::open(&db_path)?);
    let scanner = Scanner::new(
        Arc::clone(&store),
        cfg.max_pending_tasks,
        CancellationToken::new(),
    );

    for wf in store.workflows().list_enabled()? {
        let summary = scanner.scan_workflow(&wf.id).await?;
        println!(
            "{}: scanned={} new={} changed={} skipped={} tasks={}",
            wf.name,
            summary.files_scanned,
            summary.files_new,
            summary.files_changed,
            summary.files_skipped,
            summary.tasks_created,
        );
        for err in &summary.errors {
            eprintln!("  error: {err}");
        }
    }
    Ok(())
}

/// Simple dry-run output: print the effective configuration.
fn print_dry_run(cfg: &Config) {
    println!("watchflow dry-run");
    println!("  database_path = {}", cfg.database_path);
    println!("  log_dir = {}", cfg.log_dir);
    println!("  concurrency = {}", cfg.concurrency);
    println!("  task_timeout_secs = {}", cfg.task_timeout_secs);
    println!("  step_timeout_secs = {}", cfg.step_timeout_secs);
    println!("  scan_interval_secs = {}", cfg.scan_interval_secs);
    println!("  max_pending_tasks = {}", cfg.max_pending_tasks);
}
