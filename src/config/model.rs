// src/config/model.rs

use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration as read from a YAML file.
///
/// ```yaml
/// database_path: ./data/watchflow.db
/// log_dir: ./data/logs
/// concurrency: 2
/// task_timeout_secs: 3600
/// step_timeout_secs: 1800
/// scan_interval_secs: 2
/// max_pending_tasks: 50
/// ```
///
/// All fields are optional and have reasonable defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Path of the SQLite database file.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Directory for per-task scratch log files.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// Executor pool size: the process-wide ceiling on concurrently
    /// running tasks.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Upper bound on the cumulative execution time of one task.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// Upper bound on a single step's subprocess, unless a plugin step
    /// carries its own override.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,

    /// Interval between scheduler ticks that claim pending tasks.
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,

    /// Per-workflow cap on pending tasks; the scanner blocks until the
    /// count drops below it. `0` disables backpressure.
    #[serde(default = "default_max_pending_tasks")]
    pub max_pending_tasks: usize,
}

fn default_database_path() -> String {
    "./data/watchflow.db".to_string()
}

fn default_log_dir() -> String {
    "./data/logs".to_string()
}

fn default_concurrency() -> usize {
    2
}

fn default_task_timeout_secs() -> u64 {
    3600
}

fn default_step_timeout_secs() -> u64 {
    1800
}

fn default_scan_interval_secs() -> u64 {
    2
}

fn default_max_pending_tasks() -> usize {
    50
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            log_dir: default_log_dir(),
            concurrency: default_concurrency(),
            task_timeout_secs: default_task_timeout_secs(),
            step_timeout_secs: default_step_timeout_secs(),
            scan_interval_secs: default_scan_interval_secs(),
            max_pending_tasks: default_max_pending_tasks(),
        }
    }
}

impl Config {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs.max(1))
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs.max(1))
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs.max(1))
    }
}
