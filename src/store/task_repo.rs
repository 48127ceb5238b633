// src/store/task_repo.rs

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::store::models::{dt_str, dt_str_opt, parse_dt, parse_dt_opt, Task, TaskStatus};
use crate::store::{Store, StoreError, StoreResult};

const COLUMNS: &str = "id, workflow_id, file_id, input_path, output_path, status, log_text, \
                       error_message, started_at, completed_at, created_at, updated_at";

/// Repository over task rows.
pub struct TaskRepo<'a> {
    store: &'a Store,
}

impl<'a> TaskRepo<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Create a task in `pending`.
    pub fn create(
        &self,
        workflow_id: &str,
        file_id: &str,
        input_path: &str,
        output_path: &str,
    ) -> StoreResult<Task> {
        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            file_id: file_id.to_string(),
            input_path: input_path.to_string(),
            output_path: output_path.to_string(),
            status: TaskStatus::Pending,
            log_text: String::new(),
            error_message: String::new(),
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };

        self.store.conn().execute(
            "INSERT INTO tasks (id, workflow_id, file_id, input_path, output_path, status, log_text, error_message, started_at, completed_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                task.id,
                task.workflow_id,
                task.file_id,
                task.input_path,
                task.output_path,
                task.status,
                task.log_text,
                task.error_message,
                dt_str_opt(&task.started_at),
                dt_str_opt(&task.completed_at),
                dt_str(&task.created_at),
                dt_str(&task.updated_at),
            ],
        )?;

        Ok(task)
    }

    pub fn get(&self, id: &str) -> StoreResult<Task> {
        self.store
            .conn()
            .query_row(
                &format!("SELECT {COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
                row_to_task,
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("task", id))
    }

    /// Full-row update of the mutable columns.
    pub fn update(&self, task: &Task) -> StoreResult<()> {
        let updated = self.store.conn().execute(
            "UPDATE tasks
             SET status = ?1, log_text = ?2, error_message = ?3, started_at = ?4, completed_at = ?5, updated_at = ?6
             WHERE id = ?7",
            params![
                task.status,
                task.log_text,
                task.error_message,
                dt_str_opt(&task.started_at),
                dt_str_opt(&task.completed_at),
                dt_str(&Utc::now()),
                task.id,
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::not_found("task", &task.id));
        }
        Ok(())
    }

    pub fn update_status(&self, id: &str, status: TaskStatus) -> StoreResult<()> {
        let updated = self.store.conn().execute(
            "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status, dt_str(&Utc::now()), id],
        )?;
        if updated == 0 {
            return Err(StoreError::not_found("task", id));
        }
        Ok(())
    }

    /// List tasks with optional workflow/status filters, newest first.
    pub fn list(
        &self,
        workflow_id: Option<&str>,
        status: Option<TaskStatus>,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<Task>> {
        let mut sql = format!("SELECT {COLUMNS} FROM tasks WHERE 1=1");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(workflow_id) = workflow_id {
            sql.push_str(" AND workflow_id = ?");
            args.push(Box::new(workflow_id.to_string()));
        }
        if let Some(status) = status {
            sql.push_str(" AND status = ?");
            args.push(Box::new(status));
        }
        sql.push_str(" ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?");
        args.push(Box::new(limit as i64));
        args.push(Box::new(offset as i64));

        let conn = self.store.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            row_to_task,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Pending tasks, oldest first, up to `limit`.
    pub fn list_pending(&self, limit: usize) -> StoreResult<Vec<Task>> {
        let conn = self.store.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM tasks WHERE status = ?1 ORDER BY created_at ASC, rowid ASC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![TaskStatus::Pending, limit as i64], row_to_task)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn count(&self, workflow_id: Option<&str>, status: Option<TaskStatus>) -> StoreResult<i64> {
        let mut sql = "SELECT COUNT(*) FROM tasks WHERE 1=1".to_string();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(workflow_id) = workflow_id {
            sql.push_str(" AND workflow_id = ?");
            args.push(Box::new(workflow_id.to_string()));
        }
        if let Some(status) = status {
            sql.push_str(" AND status = ?");
            args.push(Box::new(status));
        }

        Ok(self.store.conn().query_row(
            &sql,
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            |row| row.get(0),
        )?)
    }

    /// One-shot bulk transition `running -> pending`, returning the count.
    ///
    /// Invoked exactly once at startup to reconcile tasks left behind by a
    /// crashed previous process.
    pub fn reset_running_tasks(&self) -> StoreResult<usize> {
        Ok(self.store.conn().execute(
            "UPDATE tasks SET status = ?1, started_at = NULL, updated_at = ?2 WHERE status = ?3",
            params![TaskStatus::Pending, dt_str(&Utc::now()), TaskStatus::Running],
        )?)
    }

    /// Reset a `failed` or `cancelled` task back to `pending` for re-execution.
    ///
    /// Retrying a `completed` task (or any other state) is rejected.
    pub fn retry(&self, id: &str) -> StoreResult<()> {
        let task = self.get(id)?;
        match task.status {
            TaskStatus::Failed | TaskStatus::Cancelled => {}
            other => {
                return Err(StoreError::Conflict(format!(
                    "task {id} cannot be retried from status '{other}'"
                )));
            }
        }

        self.store.conn().execute(
            "UPDATE tasks
             SET status = ?1, log_text = '', error_message = '', started_at = NULL, completed_at = NULL, updated_at = ?2
             WHERE id = ?3",
            params![TaskStatus::Pending, dt_str(&Utc::now()), id],
        )?;
        Ok(())
    }

    /// Delete all tasks (and their steps) for a workflow ("clear index").
    pub fn delete_by_workflow(&self, workflow_id: &str) -> StoreResult<usize> {
        let mut conn = self.store.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM task_steps WHERE task_id IN (SELECT id FROM tasks WHERE workflow_id = ?1)",
            params![workflow_id],
        )?;
        let deleted = tx.execute("DELETE FROM tasks WHERE workflow_id = ?1", params![workflow_id])?;
        tx.commit()?;
        Ok(deleted)
    }
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        workflow_id: row.get(1)?,
        file_id: row.get(2)?,
        input_path: row.get(3)?,
        output_path: row.get(4)?,
        status: row.get(5)?,
        log_text: row.get(6)?,
        error_message: row.get(7)?,
        started_at: parse_dt_opt(row.get(8)?),
        completed_at: parse_dt_opt(row.get(9)?),
        created_at: parse_dt(&row.get::<_, String>(10)?),
        updated_at: parse_dt(&row.get::<_, String>(11)?),
    })
}
