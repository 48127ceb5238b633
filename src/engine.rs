// src/engine.rs

//! Process lifecycle: startup reconciliation, component wiring, shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::hub::LogHub;
use crate::scanner::{ScanSummary, Scanner, Watcher};
use crate::sched::{ExecutorPool, ExecutorStatus, PoolStats, Scheduler};
use crate::store::Store;

/// How long shutdown waits for in-flight tasks before giving up.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// The assembled engine: store, hub, pool, scheduler and watcher.
///
/// External surfaces (HTTP CRUD, sockets) hold an `Engine` and call into
/// it; the engine owns startup reconciliation and orderly shutdown.
pub struct Engine {
    store: Arc<Store>,
    hub: Arc<LogHub>,
    pool: Arc<ExecutorPool>,
    scheduler: Arc<Scheduler>,
    watcher: Arc<Watcher>,
    shutdown: CancellationToken,
}

impl Engine {
    /// Open the store, reconcile leftover state, and start every component.
    pub async fn start(config: &Config) -> Result<Self> {
        let db_path = PathBuf::from(&config.database_path);
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {parent:?}"))?;
        }
        let store = Arc::new(Store::open(&db_path).context("opening database")?);

        // Tasks left in `running` by a crashed previous process go back to
        // `pending`; the scheduler will pick them up again.
        let reset = store.tasks().reset_running_tasks()?;
        if reset > 0 {
            info!(count = reset, "reset interrupted running tasks to pending");
        }

        let shutdown = CancellationToken::new();
        let hub = LogHub::new(shutdown.child_token());
        let pool = ExecutorPool::new(
            config.concurrency,
            Arc::clone(&store),
            Arc::clone(&hub),
            PathBuf::from(&config.log_dir),
            config.task_timeout(),
            config.step_timeout(),
        );
        let scheduler = Scheduler::new(Arc::clone(&store), Arc::clone(&pool), config.scan_interval());

        let scanner = Arc::new(Scanner::new(
            Arc::clone(&store),
            config.max_pending_tasks,
            shutdown.child_token(),
        ));
        let watcher = Watcher::new(Arc::clone(&store), scanner, shutdown.child_token())
            .context("creating file watcher")?;

        watcher.start().await.context("starting file watcher")?;
        scheduler.start();

        info!("engine started");
        Ok(Self {
            store,
            hub,
            pool,
            scheduler,
            watcher,
            shutdown,
        })
    }

    /// Orderly shutdown: stop watching, drain running tasks, stop the hub.
    pub async fn shutdown(&self) {
        info!("engine shutting down");
        self.watcher.stop();
        self.scheduler.stop_and_drain(DRAIN_TIMEOUT).await;
        self.shutdown.cancel();
        info!("engine shutdown complete");
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn hub(&self) -> &Arc<LogHub> {
        &self.hub
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn executor_status(&self) -> Vec<ExecutorStatus> {
        self.pool.executor_status()
    }

    /// Best-effort cancellation; see [`Scheduler::cancel_task`].
    pub fn cancel_task(&self, task_id: &str) -> Result<()> {
        self.scheduler.cancel_task(task_id)
    }

    /// User-initiated retry of a `failed` or `cancelled` task.
    pub fn retry_task(&self, task_id: &str) -> Result<()> {
        self.store.tasks().retry(task_id)?;
        Ok(())
    }

    /// Scan one workflow's trigger paths now.
    pub async fn scan_workflow(&self, workflow_id: &str) -> Result<ScanSummary> {
        self.watcher.scan_workflow(workflow_id).await
    }

    /// Enable a workflow: persist the flag, scan, and arm watches.
    pub async fn enable_workflow(&self, workflow_id: &str) -> Result<()> {
        self.store.workflows().set_enabled(workflow_id, true)?;
        self.watcher.enable_workflow(workflow_id).await
    }

    /// Disable a workflow: persist the flag and disarm watches. Task rows
    /// are untouched.
    pub fn disable_workflow(&self, workflow_id: &str) -> Result<()> {
        self.store.workflows().set_enabled(workflow_id, false)?;
        self.watcher.disable_workflow(workflow_id);
        Ok(())
    }

    /// Drop a workflow's file index and task history, then rescan.
    pub async fn clear_index(&self, workflow_id: &str) -> Result<ScanSummary> {
        self.watcher.clear_index(workflow_id).await
    }
}
