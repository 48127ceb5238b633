// src/store/mod.rs

//! Persistence gateway.
//!
//! A single SQLite connection behind a mutex, fronted by typed
//! repositories for each entity:
//!
//! - [`WorkflowRepo`] — workflow definitions
//! - [`FileRepo`] — the content-addressed file index
//! - [`TaskRepo`] / [`TaskStepRepo`] — execution state
//! - [`PluginRepo`] — plugins and their append-only versions
//!
//! Every operation is atomic; multi-row updates use explicit transactions.
//! All write failures surface as [`StoreError`] and are never swallowed by
//! callers.

pub mod file_repo;
pub mod models;
pub mod plugin_repo;
pub mod task_repo;
pub mod task_step_repo;
pub mod workflow_repo;

use std::path::Path;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use thiserror::Error;

pub use file_repo::FileRepo;
pub use models::{
    FileRecord, Plugin, PluginVersion, StepStatus, Task, TaskStatus, TaskStep, Workflow,
};
pub use plugin_repo::PluginRepo;
pub use task_repo::TaskRepo;
pub use task_step_repo::TaskStepRepo;
pub use workflow_repo::WorkflowRepo;

/// Error kind for all persistence operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{0}")]
    Conflict(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            entity,
            id: id.into(),
        }
    }
}

/// Handle to the underlying database.
///
/// Thread-safe via an internal `Mutex<Connection>`; repositories borrow the
/// store and lock per operation.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and initialise the schema.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (used by tests).
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Lock the connection for use.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    pub fn workflows(&self) -> WorkflowRepo<'_> {
        WorkflowRepo::new(self)
    }

    pub fn files(&self) -> FileRepo<'_> {
        FileRepo::new(self)
    }

    pub fn tasks(&self) -> TaskRepo<'_> {
        TaskRepo::new(self)
    }

    pub fn task_steps(&self) -> TaskStepRepo<'_> {
        TaskStepRepo::new(self)
    }

    pub fn plugins(&self) -> PluginRepo<'_> {
        PluginRepo::new(self)
    }
}

fn init_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS workflows (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL DEFAULT '',
            yaml_source TEXT NOT NULL,
            enabled     INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS files (
            id              TEXT PRIMARY KEY,
            workflow_id     TEXT NOT NULL,
            file_path       TEXT NOT NULL,
            digest          TEXT NOT NULL,
            size_bytes      INTEGER NOT NULL,
            last_scanned_at TEXT NOT NULL,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL,
            UNIQUE (workflow_id, file_path)
        );
        CREATE INDEX IF NOT EXISTS idx_files_workflow ON files (workflow_id);

        CREATE TABLE IF NOT EXISTS tasks (
            id            TEXT PRIMARY KEY,
            workflow_id   TEXT NOT NULL,
            file_id       TEXT NOT NULL,
            input_path    TEXT NOT NULL,
            output_path   TEXT NOT NULL DEFAULT '',
            status        TEXT NOT NULL DEFAULT 'pending',
            log_text      TEXT NOT NULL DEFAULT '',
            error_message TEXT NOT NULL DEFAULT '',
            started_at    TEXT,
            completed_at  TEXT,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_workflow ON tasks (workflow_id);
        CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status);
        CREATE INDEX IF NOT EXISTS idx_tasks_created ON tasks (created_at);

        CREATE TABLE IF NOT EXISTS task_steps (
            id           TEXT PRIMARY KEY,
            task_id      TEXT NOT NULL,
            name         TEXT NOT NULL,
            command      TEXT NOT NULL,
            status       TEXT NOT NULL DEFAULT 'pending',
            exit_code    INTEGER,
            stdout       TEXT NOT NULL DEFAULT '',
            stderr       TEXT NOT NULL DEFAULT '',
            started_at   TEXT,
            completed_at TEXT,
            created_at   TEXT NOT NULL,
            updated_at   TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_task_steps_task ON task_steps (task_id);

        CREATE TABLE IF NOT EXISTS plugins (
            id                TEXT PRIMARY KEY,
            name              TEXT NOT NULL UNIQUE,
            description       TEXT NOT NULL DEFAULT '',
            active_version_id TEXT NOT NULL,
            created_at        TEXT NOT NULL,
            updated_at        TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS plugin_versions (
            id          TEXT PRIMARY KEY,
            plugin_id   TEXT NOT NULL,
            version     TEXT NOT NULL,
            yaml_source TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            UNIQUE (plugin_id, version)
        );
        CREATE INDEX IF NOT EXISTS idx_plugin_versions_plugin ON plugin_versions (plugin_id);
        "#,
    )?;
    Ok(())
}
