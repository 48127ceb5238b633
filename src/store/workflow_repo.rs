// src/store/workflow_repo.rs

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::store::models::{dt_str, parse_dt, Workflow};
use crate::store::{Store, StoreError, StoreResult, TaskStatus};

const COLUMNS: &str = "id, name, description, yaml_source, enabled, created_at, updated_at";

/// Repository over workflow rows.
pub struct WorkflowRepo<'a> {
    store: &'a Store,
}

impl<'a> WorkflowRepo<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub fn create(
        &self,
        name: &str,
        description: &str,
        yaml_source: &str,
        enabled: bool,
    ) -> StoreResult<Workflow> {
        let now = Utc::now();
        let workflow = Workflow {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.to_string(),
            yaml_source: yaml_source.to_string(),
            enabled,
            created_at: now,
            updated_at: now,
        };

        self.store.conn().execute(
            "INSERT INTO workflows (id, name, description, yaml_source, enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                workflow.id,
                workflow.name,
                workflow.description,
                workflow.yaml_source,
                workflow.enabled as i32,
                dt_str(&workflow.created_at),
                dt_str(&workflow.updated_at),
            ],
        )?;

        Ok(workflow)
    }

    pub fn get(&self, id: &str) -> StoreResult<Workflow> {
        self.store
            .conn()
            .query_row(
                &format!("SELECT {COLUMNS} FROM workflows WHERE id = ?1"),
                params![id],
                row_to_workflow,
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("workflow", id))
    }

    pub fn get_by_name(&self, name: &str) -> StoreResult<Option<Workflow>> {
        Ok(self
            .store
            .conn()
            .query_row(
                &format!("SELECT {COLUMNS} FROM workflows WHERE name = ?1"),
                params![name],
                row_to_workflow,
            )
            .optional()?)
    }

    pub fn list(&self) -> StoreResult<Vec<Workflow>> {
        let conn = self.store.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {COLUMNS} FROM workflows ORDER BY name"))?;
        let rows = stmt.query_map([], row_to_workflow)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn list_enabled(&self) -> StoreResult<Vec<Workflow>> {
        let conn = self.store.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM workflows WHERE enabled = 1 ORDER BY name"
        ))?;
        let rows = stmt.query_map([], row_to_workflow)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn update(&self, workflow: &Workflow) -> StoreResult<()> {
        let updated = self.store.conn().execute(
            "UPDATE workflows
             SET name = ?1, description = ?2, yaml_source = ?3, enabled = ?4, updated_at = ?5
             WHERE id = ?6",
            params![
                workflow.name,
                workflow.description,
                workflow.yaml_source,
                workflow.enabled as i32,
                dt_str(&Utc::now()),
                workflow.id,
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::not_found("workflow", &workflow.id));
        }
        Ok(())
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> StoreResult<()> {
        let updated = self.store.conn().execute(
            "UPDATE workflows SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
            params![enabled as i32, dt_str(&Utc::now()), id],
        )?;
        if updated == 0 {
            return Err(StoreError::not_found("workflow", id));
        }
        Ok(())
    }

    /// Delete a workflow together with its files and tasks.
    ///
    /// Refused while any task of the workflow is still `running`.
    pub fn delete(&self, id: &str) -> StoreResult<()> {
        let mut conn = self.store.conn();
        let tx = conn.transaction()?;

        let running: i64 = tx.query_row(
            "SELECT COUNT(*) FROM tasks WHERE workflow_id = ?1 AND status = ?2",
            params![id, TaskStatus::Running],
            |row| row.get(0),
        )?;
        if running > 0 {
            return Err(StoreError::Conflict(format!(
                "workflow {id} has {running} running task(s)"
            )));
        }

        tx.execute(
            "DELETE FROM task_steps WHERE task_id IN (SELECT id FROM tasks WHERE workflow_id = ?1)",
            params![id],
        )?;
        tx.execute("DELETE FROM tasks WHERE workflow_id = ?1", params![id])?;
        tx.execute("DELETE FROM files WHERE workflow_id = ?1", params![id])?;
        let deleted = tx.execute("DELETE FROM workflows WHERE id = ?1", params![id])?;
        tx.commit()?;

        if deleted == 0 {
            return Err(StoreError::not_found("workflow", id));
        }
        Ok(())
    }
}

fn row_to_workflow(row: &Row<'_>) -> rusqlite::Result<Workflow> {
    Ok(Workflow {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        yaml_source: row.get(3)?,
        enabled: row.get::<_, i32>(4)? != 0,
        created_at: parse_dt(&row.get::<_, String>(5)?),
        updated_at: parse_dt(&row.get::<_, String>(6)?),
    })
}
