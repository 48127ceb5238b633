// src/store/file_repo.rs

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::store::models::{dt_str, parse_dt, FileRecord};
use crate::store::{Store, StoreError, StoreResult};

const COLUMNS: &str =
    "id, workflow_id, file_path, digest, size_bytes, last_scanned_at, created_at, updated_at";

/// Repository over the content-addressed file index.
///
/// `(workflow_id, file_path)` uniquely identifies a row.
pub struct FileRepo<'a> {
    store: &'a Store,
}

impl<'a> FileRepo<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub fn create(
        &self,
        workflow_id: &str,
        file_path: &str,
        digest: &str,
        size_bytes: i64,
    ) -> StoreResult<FileRecord> {
        let now = Utc::now();
        let record = FileRecord {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            file_path: file_path.to_string(),
            digest: digest.to_string(),
            size_bytes,
            last_scanned_at: now,
            created_at: now,
            updated_at: now,
        };

        self.store.conn().execute(
            "INSERT INTO files (id, workflow_id, file_path, digest, size_bytes, last_scanned_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id,
                record.workflow_id,
                record.file_path,
                record.digest,
                record.size_bytes,
                dt_str(&record.last_scanned_at),
                dt_str(&record.created_at),
                dt_str(&record.updated_at),
            ],
        )?;

        Ok(record)
    }

    pub fn get_by_workflow_and_path(
        &self,
        workflow_id: &str,
        file_path: &str,
    ) -> StoreResult<Option<FileRecord>> {
        Ok(self
            .store
            .conn()
            .query_row(
                &format!("SELECT {COLUMNS} FROM files WHERE workflow_id = ?1 AND file_path = ?2"),
                params![workflow_id, file_path],
                row_to_file,
            )
            .optional()?)
    }

    /// Update digest, size and scan timestamp in place.
    pub fn update(&self, record: &FileRecord) -> StoreResult<()> {
        let now = Utc::now();
        let updated = self.store.conn().execute(
            "UPDATE files
             SET digest = ?1, size_bytes = ?2, last_scanned_at = ?3, updated_at = ?4
             WHERE id = ?5",
            params![
                record.digest,
                record.size_bytes,
                dt_str(&record.last_scanned_at),
                dt_str(&now),
                record.id,
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::not_found("file", &record.id));
        }
        Ok(())
    }

    /// Drop the whole index for one workflow ("clear index").
    pub fn delete_by_workflow(&self, workflow_id: &str) -> StoreResult<usize> {
        Ok(self
            .store
            .conn()
            .execute("DELETE FROM files WHERE workflow_id = ?1", params![workflow_id])?)
    }

    pub fn count_by_workflow(&self, workflow_id: &str) -> StoreResult<i64> {
        Ok(self.store.conn().query_row(
            "SELECT COUNT(*) FROM files WHERE workflow_id = ?1",
            params![workflow_id],
            |row| row.get(0),
        )?)
    }
}

fn row_to_file(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        id: row.get(0)?,
        workflow_id: row.get(1)?,
        file_path: row.get(2)?,
        digest: row.get(3)?,
        size_bytes: row.get(4)?,
        last_scanned_at: parse_dt(&row.get::<_, String>(5)?),
        created_at: parse_dt(&row.get::<_, String>(6)?),
        updated_at: parse_dt(&row.get::<_, String>(7)?),
    })
}
