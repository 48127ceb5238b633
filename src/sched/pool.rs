// src/sched/pool.rs

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::hub::LogHub;
use crate::sched::executor::Executor;
use crate::store::Store;

/// A fixed pool of [`Executor`]s with a bounded idle hand-off channel.
///
/// `acquire` is a blocking receive that returns an executor or the supplied
/// cancellation; `release` sends it back. The pool never resizes.
pub struct ExecutorPool {
    executors: Vec<Arc<Executor>>,
    idle_tx: mpsc::Sender<Arc<Executor>>,
    idle_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<Executor>>>,
    available: AtomicUsize,
    closed: AtomicBool,
}

/// Aggregate pool counters for monitoring.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
    pub busy: usize,
}

/// Monitoring view of one executor.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStatus {
    pub id: usize,
    pub busy: bool,
    pub current_task: Option<String>,
}

impl ExecutorPool {
    pub fn new(
        size: usize,
        store: Arc<Store>,
        hub: Arc<LogHub>,
        log_dir: PathBuf,
        task_timeout: Duration,
        step_timeout: Duration,
    ) -> Arc<Self> {
        let size = size.max(1);
        let (idle_tx, idle_rx) = mpsc::channel(size);

        let mut executors = Vec::with_capacity(size);
        for id in 1..=size {
            let executor = Arc::new(Executor::new(
                id,
                Arc::clone(&store),
                Arc::clone(&hub),
                log_dir.clone(),
                task_timeout,
                step_timeout,
            ));
            executors.push(Arc::clone(&executor));
            // Capacity equals pool size, so seeding cannot fail.
            let _ = idle_tx.try_send(executor);
        }

        info!(size, "executor pool created");
        Arc::new(Self {
            executors,
            idle_tx,
            idle_rx: tokio::sync::Mutex::new(idle_rx),
            available: AtomicUsize::new(size),
            closed: AtomicBool::new(false),
        })
    }

    /// Wait for an idle executor, racing the supplied cancellation.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Arc<Executor>> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("executor pool is closed");
        }

        let mut idle_rx = self.idle_rx.lock().await;
        tokio::select! {
            maybe = idle_rx.recv() => match maybe {
                Some(executor) => {
                    self.available.fetch_sub(1, Ordering::SeqCst);
                    debug!(executor = executor.id(), "executor acquired from pool");
                    Ok(executor)
                }
                None => bail!("executor pool is closed"),
            },
            _ = cancel.cancelled() => bail!("cancelled while waiting for an executor"),
        }
    }

    /// Return an executor to the idle channel.
    pub fn release(&self, executor: Arc<Executor>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let id = executor.id();
        if self.idle_tx.try_send(executor).is_ok() {
            self.available.fetch_add(1, Ordering::SeqCst);
            debug!(executor = id, "executor released back to pool");
        }
    }

    pub fn total(&self) -> usize {
        self.executors.len()
    }

    pub fn available(&self) -> usize {
        self.available.load(Ordering::SeqCst)
    }

    pub fn busy(&self) -> usize {
        self.total() - self.available()
    }

    pub fn stats(&self) -> PoolStats {
        let available = self.available();
        PoolStats {
            total: self.total(),
            available,
            busy: self.total() - available,
        }
    }

    pub fn executor_status(&self) -> Vec<ExecutorStatus> {
        self.executors
            .iter()
            .map(|executor| ExecutorStatus {
                id: executor.id(),
                busy: executor.is_busy(),
                current_task: executor.current_task(),
            })
            .collect()
    }

    /// Stop handing out executors. In-flight work is unaffected.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("executor pool closed");
        }
    }
}
