// src/sched/scheduler.rs

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::sched::pool::ExecutorPool;
use crate::store::{Store, TaskStatus};

/// Periodically claims pending tasks and hands them to the executor pool.
///
/// The scheduler does not reserve rows: the `pending -> running` transition
/// happens inside the executor, which re-checks the row status before
/// accepting. The registry of per-task cancellation handles lives here.
pub struct Scheduler {
    store: Arc<Store>,
    pool: Arc<ExecutorPool>,
    scan_interval: Duration,
    /// Cancellation handle per in-flight task, strictly paired with
    /// executor acquire/release.
    running: Mutex<HashMap<String, CancellationToken>>,
    /// Stops the tick loop only; in-flight tasks keep their own tokens.
    loop_stop: CancellationToken,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, pool: Arc<ExecutorPool>, scan_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            store,
            pool,
            scan_interval,
            running: Mutex::new(HashMap::new()),
            loop_stop: CancellationToken::new(),
        })
    }

    /// Spawn the tick loop. The first tick fires immediately.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        info!(
            interval_secs = self.scan_interval.as_secs(),
            pool = self.pool.total(),
            "scheduler started"
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.scan_interval);
            loop {
                tokio::select! {
                    _ = scheduler.loop_stop.cancelled() => break,
                    _ = ticker.tick() => scheduler.tick(),
                }
            }
            debug!("scheduler loop ended");
        })
    }

    /// One claim pass: list pending tasks up to the available executor
    /// count and dispatch each on its own task.
    fn tick(self: &Arc<Self>) {
        let available = self.pool.available();
        debug!(
            busy = self.pool.busy(),
            available,
            total = self.pool.total(),
            "scheduler tick"
        );
        if available == 0 {
            return;
        }

        let tasks = match self.store.tasks().list_pending(available) {
            Ok(tasks) => tasks,
            Err(err) => {
                error!(error = %err, "failed to list pending tasks");
                return;
            }
        };
        if tasks.is_empty() {
            return;
        }

        info!(count = tasks.len(), available, "dispatching pending tasks");
        for task in tasks {
            self.dispatch(task.id);
        }
    }

    fn dispatch(self: &Arc<Self>, task_id: String) {
        let token = CancellationToken::new();
        {
            let mut running = self.running.lock();
            if running.contains_key(&task_id) {
                // Already in flight from an earlier tick.
                return;
            }
            running.insert(task_id.clone(), token.clone());
        }

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let executor = match scheduler.pool.acquire(&token).await {
                Ok(executor) => executor,
                Err(err) => {
                    debug!(task = %task_id, error = %err, "executor acquire aborted");
                    scheduler.running.lock().remove(&task_id);
                    return;
                }
            };

            if let Err(err) = executor.execute_task(&task_id, token).await {
                error!(task = %task_id, error = %err, "task execution error");
            }

            scheduler.pool.release(executor);
            scheduler.running.lock().remove(&task_id);
        });
    }

    /// Best-effort, asynchronous task cancellation.
    ///
    /// An in-flight task gets its registered handle signalled; the executor
    /// observes it at the next subprocess-wait boundary. A `pending` task
    /// never involves the pool and is flipped to `cancelled` directly.
    /// Terminal tasks are a no-op.
    pub fn cancel_task(&self, task_id: &str) -> Result<()> {
        if let Some(token) = self.running.lock().get(task_id) {
            info!(task = %task_id, "cancelling running task");
            token.cancel();
            return Ok(());
        }

        let mut task = self.store.tasks().get(task_id)?;
        match task.status {
            TaskStatus::Pending => {
                // A terminal row carries the same guarantees as one the
                // executor produced: started-at set, completed-at after it,
                // and a non-empty collapsed log.
                let now = Utc::now();
                task.status = TaskStatus::Cancelled;
                task.started_at = Some(now);
                task.completed_at = Some(now);
                task.log_text = format!(
                    "[{}] Task cancelled\n",
                    now.to_rfc3339_opts(SecondsFormat::Secs, true)
                );
                task.error_message = "Task cancelled".to_string();
                self.store.tasks().update(&task)?;
                info!(task = %task_id, "pending task cancelled");
            }
            status => {
                debug!(task = %task_id, %status, "cancel is a no-op");
            }
        }
        Ok(())
    }

    pub fn running_count(&self) -> usize {
        self.pool.busy()
    }

    /// Stop ticking, then wait (bounded) for in-flight tasks to finish and
    /// close the pool.
    pub async fn stop_and_drain(&self, drain_timeout: Duration) {
        info!("stopping scheduler");
        self.loop_stop.cancel();

        let deadline = tokio::time::Instant::now() + drain_timeout;
        while self.pool.busy() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(busy = self.pool.busy(), "drain timeout reached with tasks still running");
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        self.pool.close();
        info!("scheduler stopped");
    }
}
