//! SQLite tool catalog implementation.

use crate::{Catalog, Error, ParameterSpec, Result, ToolDefinition};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Listing entry for a stored tool.
#[derive(Debug, Clone)]
pub struct ToolSummary {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub parameter_count: usize,
    pub updated_at: DateTime<Utc>,
}

/// SQLite-backed tool catalog.
pub struct SqliteCatalog {
    conn: Mutex<Connection>,
}

impl SqliteCatalog {
    /// Open or create a catalog at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let catalog = Self {
            conn: Mutex::new(conn),
        };
        catalog.init_schema()?;
        Ok(catalog)
    }

    /// Create an in-memory catalog (useful for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let catalog = Self {
            conn: Mutex::new(conn),
        };
        catalog.init_schema()?;
        Ok(catalog)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // Poisoning leaves the connection usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn init_schema(&self) -> Result<()> {
        self.conn().execute_batch(
            r#"
            PRAGMA foreign_keys = ON;
            CREATE TABLE IF NOT EXISTS tools (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT,
                workflow TEXT NOT NULL,
                end_marker TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS tool_parameters (
                tool_id TEXT NOT NULL REFERENCES tools(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (tool_id, position)
            );
            "#,
        )?;
        Ok(())
    }

    /// Insert a tool, replacing any existing record with the same id.
    pub fn upsert(&self, tool: &ToolDefinition) -> Result<()> {
        tool.check()?;
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO tools (id, name, description, workflow, end_marker, enabled, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                workflow = excluded.workflow,
                end_marker = excluded.end_marker,
                enabled = excluded.enabled,
                updated_at = excluded.updated_at",
            params![
                tool.id,
                tool.name,
                tool.description,
                serde_json::to_string(&tool.workflow_template)?,
                tool.end_marker,
                tool.enabled,
                Utc::now().to_rfc3339(),
            ],
        )?;
        tx.execute(
            "DELETE FROM tool_parameters WHERE tool_id = ?1",
            params![tool.id],
        )?;
        for (position, parameter) in tool.parameters.iter().enumerate() {
            tx.execute(
                "INSERT INTO tool_parameters (tool_id, position, data) VALUES (?1, ?2, ?3)",
                params![tool.id, position as i64, serde_json::to_string(parameter)?],
            )?;
        }
        tx.commit()?;
        debug!(tool = %tool.name, id = %tool.id, parameters = tool.parameters.len(), "tool stored");
        Ok(())
    }

    /// Load a single tool by id.
    pub fn load(&self, id: &str) -> Result<ToolDefinition> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, name, description, workflow, end_marker, enabled
                 FROM tools WHERE id = ?1",
                [id],
                row_to_parts,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        assemble(&conn, row)
    }

    /// Summaries of every stored tool, enabled or not.
    pub fn list(&self) -> Result<Vec<ToolSummary>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT t.id, t.name, t.enabled, t.updated_at,
                    (SELECT COUNT(*) FROM tool_parameters p WHERE p.tool_id = t.id)
             FROM tools t ORDER BY t.name",
        )?;
        let summaries = stmt
            .query_map([], |row| {
                let updated_at: String = row.get(3)?;
                let count: i64 = row.get(4)?;
                Ok(ToolSummary {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    enabled: row.get(2)?,
                    parameter_count: count as usize,
                    updated_at: updated_at.parse().unwrap_or_default(),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(summaries)
    }

    /// Delete a tool and its parameters.
    pub fn remove(&self, id: &str) -> Result<()> {
        let removed = self
            .conn()
            .execute("DELETE FROM tools WHERE id = ?1", [id])?;
        if removed == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        debug!(id, "tool removed");
        Ok(())
    }
}

type ToolRow = (String, String, Option<String>, String, Option<String>, bool);

fn row_to_parts(row: &rusqlite::Row<'_>) -> rusqlite::Result<ToolRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn assemble(conn: &Connection, row: ToolRow) -> Result<ToolDefinition> {
    let (id, name, description, workflow, end_marker, enabled) = row;
    let mut stmt = conn.prepare(
        "SELECT data FROM tool_parameters WHERE tool_id = ?1 ORDER BY position",
    )?;
    let parameters = stmt
        .query_map([&id], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?
        .iter()
        .map(|data| serde_json::from_str::<ParameterSpec>(data))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(ToolDefinition {
        id,
        name,
        description,
        workflow_template: serde_json::from_str(&workflow)?,
        end_marker,
        enabled,
        parameters,
    })
}

impl Catalog for SqliteCatalog {
    fn enabled_tools(&self) -> Result<Vec<ToolDefinition>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, description, workflow, end_marker, enabled
             FROM tools WHERE enabled = 1 ORDER BY name",
        )?;
        let rows = stmt
            .query_map([], row_to_parts)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(|row| assemble(&conn, row)).collect()
    }

    fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let updated = self.conn().execute(
            "UPDATE tools SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
            params![enabled, Utc::now().to_rfc3339(), id],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        debug!(id, enabled, "tool toggled");
        Ok(())
    }
}
