// src/store/plugin_repo.rs

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::store::models::{dt_str, parse_dt, Plugin, PluginVersion};
use crate::store::{Store, StoreError, StoreResult};

const PLUGIN_COLUMNS: &str = "id, name, description, active_version_id, created_at, updated_at";
const VERSION_COLUMNS: &str = "id, plugin_id, version, yaml_source, created_at";

/// Repository over plugins and their append-only versions.
///
/// Invariant maintained here: a plugin's `active_version_id` always
/// references a version row belonging to that plugin.
pub struct PluginRepo<'a> {
    store: &'a Store,
}

impl<'a> PluginRepo<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Create a plugin together with its first version, which becomes the
    /// active version. One transaction.
    pub fn create_plugin(
        &self,
        name: &str,
        description: &str,
        version: &str,
        yaml_source: &str,
    ) -> StoreResult<(Plugin, PluginVersion)> {
        let now = Utc::now();
        let plugin_id = Uuid::new_v4().to_string();
        let version_id = Uuid::new_v4().to_string();

        let mut conn = self.store.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO plugins (id, name, description, active_version_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![plugin_id, name, description, version_id, dt_str(&now), dt_str(&now)],
        )?;
        tx.execute(
            "INSERT INTO plugin_versions (id, plugin_id, version, yaml_source, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![version_id, plugin_id, version, yaml_source, dt_str(&now)],
        )?;
        tx.commit()?;

        Ok((
            Plugin {
                id: plugin_id.clone(),
                name: name.to_string(),
                description: description.to_string(),
                active_version_id: version_id.clone(),
                created_at: now,
                updated_at: now,
            },
            PluginVersion {
                id: version_id,
                plugin_id,
                version: version.to_string(),
                yaml_source: yaml_source.to_string(),
                created_at: now,
            },
        ))
    }

    /// Append a new version and make it the active one. One transaction.
    pub fn add_version(
        &self,
        plugin_id: &str,
        version: &str,
        yaml_source: &str,
    ) -> StoreResult<PluginVersion> {
        let now = Utc::now();
        let version_id = Uuid::new_v4().to_string();

        let mut conn = self.store.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO plugin_versions (id, plugin_id, version, yaml_source, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![version_id, plugin_id, version, yaml_source, dt_str(&now)],
        )?;
        let updated = tx.execute(
            "UPDATE plugins SET active_version_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![version_id, dt_str(&now), plugin_id],
        )?;
        if updated == 0 {
            return Err(StoreError::not_found("plugin", plugin_id));
        }
        tx.commit()?;

        Ok(PluginVersion {
            id: version_id,
            plugin_id: plugin_id.to_string(),
            version: version.to_string(),
            yaml_source: yaml_source.to_string(),
            created_at: now,
        })
    }

    /// Point the active-version pointer at an existing version.
    ///
    /// The version must belong to the plugin.
    pub fn set_active_version(&self, plugin_id: &str, version_id: &str) -> StoreResult<()> {
        let mut conn = self.store.conn();
        let tx = conn.transaction()?;

        let owner: Option<String> = tx
            .query_row(
                "SELECT plugin_id FROM plugin_versions WHERE id = ?1",
                params![version_id],
                |row| row.get(0),
            )
            .optional()?;
        match owner {
            None => return Err(StoreError::not_found("plugin version", version_id)),
            Some(owner) if owner != plugin_id => {
                return Err(StoreError::Conflict(format!(
                    "version {version_id} does not belong to plugin {plugin_id}"
                )));
            }
            Some(_) => {}
        }

        let updated = tx.execute(
            "UPDATE plugins SET active_version_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![version_id, dt_str(&Utc::now()), plugin_id],
        )?;
        if updated == 0 {
            return Err(StoreError::not_found("plugin", plugin_id));
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> StoreResult<Plugin> {
        self.store
            .conn()
            .query_row(
                &format!("SELECT {PLUGIN_COLUMNS} FROM plugins WHERE id = ?1"),
                params![id],
                row_to_plugin,
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("plugin", id))
    }

    pub fn get_by_name(&self, name: &str) -> StoreResult<Option<Plugin>> {
        Ok(self
            .store
            .conn()
            .query_row(
                &format!("SELECT {PLUGIN_COLUMNS} FROM plugins WHERE name = ?1"),
                params![name],
                row_to_plugin,
            )
            .optional()?)
    }

    pub fn list(&self) -> StoreResult<Vec<Plugin>> {
        let conn = self.store.conn();
        let mut stmt = conn.prepare(&format!("SELECT {PLUGIN_COLUMNS} FROM plugins ORDER BY name"))?;
        let rows = stmt.query_map([], row_to_plugin)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// A specific version of a plugin, by plugin name and version string.
    pub fn get_version(&self, plugin_name: &str, version: &str) -> StoreResult<Option<PluginVersion>> {
        Ok(self
            .store
            .conn()
            .query_row(
                &format!(
                    "SELECT v.id, v.plugin_id, v.version, v.yaml_source, v.created_at
                     FROM plugin_versions v
                     JOIN plugins p ON p.id = v.plugin_id
                     WHERE p.name = ?1 AND v.version = ?2"
                ),
                params![plugin_name, version],
                row_to_version,
            )
            .optional()?)
    }

    /// The currently active version of a plugin.
    pub fn get_active_version(&self, plugin_id: &str) -> StoreResult<PluginVersion> {
        self.store
            .conn()
            .query_row(
                &format!(
                    "SELECT {VERSION_COLUMNS} FROM plugin_versions
                     WHERE id = (SELECT active_version_id FROM plugins WHERE id = ?1)"
                ),
                params![plugin_id],
                row_to_version,
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("active plugin version", plugin_id))
    }

    pub fn list_versions(&self, plugin_id: &str) -> StoreResult<Vec<PluginVersion>> {
        let conn = self.store.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {VERSION_COLUMNS} FROM plugin_versions WHERE plugin_id = ?1 ORDER BY created_at ASC, rowid ASC"
        ))?;
        let rows = stmt.query_map(params![plugin_id], row_to_version)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Delete a plugin and all of its versions atomically.
    pub fn delete(&self, plugin_id: &str) -> StoreResult<()> {
        let mut conn = self.store.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM plugin_versions WHERE plugin_id = ?1",
            params![plugin_id],
        )?;
        let deleted = tx.execute("DELETE FROM plugins WHERE id = ?1", params![plugin_id])?;
        tx.commit()?;

        if deleted == 0 {
            return Err(StoreError::not_found("plugin", plugin_id));
        }
        Ok(())
    }
}

fn row_to_plugin(row: &Row<'_>) -> rusqlite::Result<Plugin> {
    Ok(Plugin {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        active_version_id: row.get(3)?,
        created_at: parse_dt(&row.get::<_, String>(4)?),
        updated_at: parse_dt(&row.get::<_, String>(5)?),
    })
}

fn row_to_version(row: &Row<'_>) -> rusqlite::Result<PluginVersion> {
    Ok(PluginVersion {
        id: row.get(0)?,
        plugin_id: row.get(1)?,
        version: row.get(2)?,
        yaml_source: row.get(3)?,
        created_at: parse_dt(&row.get::<_, String>(4)?),
    })
}
