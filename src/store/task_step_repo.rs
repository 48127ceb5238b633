// src/store/task_step_repo.rs

use chrono::Utc;
use rusqlite::{params, Row};
use uuid::Uuid;

use crate::store::models::{dt_str, dt_str_opt, parse_dt, parse_dt_opt, StepStatus, TaskStep};
use crate::store::{Store, StoreError, StoreResult};

const COLUMNS: &str = "id, task_id, name, command, status, exit_code, stdout, stderr, \
                       started_at, completed_at, created_at, updated_at";

/// Repository over task step rows.
pub struct TaskStepRepo<'a> {
    store: &'a Store,
}

impl<'a> TaskStepRepo<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Create a step record in `pending`.
    pub fn create(&self, task_id: &str, name: &str, command: &str) -> StoreResult<TaskStep> {
        let now = Utc::now();
        let step = TaskStep {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            name: name.to_string(),
            command: command.to_string(),
            status: StepStatus::Pending,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };

        self.store.conn().execute(
            "INSERT INTO task_steps (id, task_id, name, command, status, exit_code, stdout, stderr, started_at, completed_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                step.id,
                step.task_id,
                step.name,
                step.command,
                step.status,
                step.exit_code,
                step.stdout,
                step.stderr,
                dt_str_opt(&step.started_at),
                dt_str_opt(&step.completed_at),
                dt_str(&step.created_at),
                dt_str(&step.updated_at),
            ],
        )?;

        Ok(step)
    }

    pub fn update(&self, step: &TaskStep) -> StoreResult<()> {
        let updated = self.store.conn().execute(
            "UPDATE task_steps
             SET command = ?1, status = ?2, exit_code = ?3, stdout = ?4, stderr = ?5, started_at = ?6, completed_at = ?7, updated_at = ?8
             WHERE id = ?9",
            params![
                step.command,
                step.status,
                step.exit_code,
                step.stdout,
                step.stderr,
                dt_str_opt(&step.started_at),
                dt_str_opt(&step.completed_at),
                dt_str(&Utc::now()),
                step.id,
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::not_found("task step", &step.id));
        }
        Ok(())
    }

    /// Steps for a task, in creation (= execution) order.
    pub fn list_by_task(&self, task_id: &str) -> StoreResult<Vec<TaskStep>> {
        let conn = self.store.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM task_steps WHERE task_id = ?1 ORDER BY created_at ASC, rowid ASC"
        ))?;
        let rows = stmt.query_map(params![task_id], row_to_step)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn row_to_step(row: &Row<'_>) -> rusqlite::Result<TaskStep> {
    Ok(TaskStep {
        id: row.get(0)?,
        task_id: row.get(1)?,
        name: row.get(2)?,
        command: row.get(3)?,
        status: row.get(4)?,
        exit_code: row.get(5)?,
        stdout: row.get(6)?,
        stderr: row.get(7)?,
        started_at: parse_dt_opt(row.get(8)?),
        completed_at: parse_dt_opt(row.get(9)?),
        created_at: parse_dt(&row.get::<_, String>(10)?),
        updated_at: parse_dt(&row.get::<_, String>(11)?),
    })
}
