//! Name registry: every live table and view with the kind it returns

use duckdb::{params, Connection, OptionalExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

pub const SYMTABLE: &str = "__symtable";
pub const QUERIES: &str = "__queries";

/// Registry row as reported by `get_view_data`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewInfo {
    pub name: String,
    pub kind: String,
    pub appdata: Option<String>,
}

/// Registry of names backed by the `__symtable` bookkeeping table.
///
/// Every method takes the connection so callers can run it inside the same
/// transaction as the DDL it accompanies.
#[derive(Debug)]
pub struct SchemaRegistry {
    _private: (),
}

impl SchemaRegistry {
    /// Create the bookkeeping tables if needed
    pub fn open(conn: &Connection) -> Result<Self> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {SYMTABLE} (name VARCHAR NOT NULL, kind VARCHAR, appdata VARCHAR);
             CREATE TABLE IF NOT EXISTS {QUERIES} (natural_id VARCHAR NOT NULL, query_id VARCHAR NOT NULL);"
        ))?;
        debug!("schema registry opened");
        Ok(Self { _private: () })
    }

    /// Drop and recreate the bookkeeping tables
    pub fn reset(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "DROP TABLE IF EXISTS {SYMTABLE}; DROP TABLE IF EXISTS {QUERIES};"
        ))?;
        Self::open(conn).map(|_| ())
    }

    /// Record `name` as returning `kind`, keeping existing appdata
    pub fn register(&self, conn: &Connection, name: &str, kind: &str) -> Result<()> {
        let updated = conn.execute(
            &format!("UPDATE {SYMTABLE} SET kind = ? WHERE name = ?"),
            params![kind, name],
        )?;
        if updated == 0 {
            conn.execute(
                &format!("INSERT INTO {SYMTABLE} (name, kind) VALUES (?, ?)"),
                params![name, kind],
            )?;
        }
        Ok(())
    }

    pub fn unregister(&self, conn: &Connection, name: &str) -> Result<()> {
        conn.execute(&format!("DELETE FROM {SYMTABLE} WHERE name = ?"), [name])?;
        Ok(())
    }

    pub fn contains(&self, conn: &Connection, name: &str) -> Result<bool> {
        let found: Option<String> = conn
            .query_row(
                &format!("SELECT name FROM {SYMTABLE} WHERE name = ?"),
                [name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn kind_of(&self, conn: &Connection, name: &str) -> Result<Option<String>> {
        let kind: Option<Option<String>> = conn
            .query_row(
                &format!("SELECT kind FROM {SYMTABLE} WHERE name = ?"),
                [name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(kind.flatten())
    }

    /// Returns false when `name` is not registered
    pub fn set_appdata(&self, conn: &Connection, name: &str, appdata: &str) -> Result<bool> {
        let updated = conn.execute(
            &format!("UPDATE {SYMTABLE} SET appdata = ? WHERE name = ?"),
            params![appdata, name],
        )?;
        Ok(updated > 0)
    }

    pub fn get_appdata(&self, conn: &Connection, name: &str) -> Result<Option<String>> {
        let appdata: Option<Option<String>> = conn
            .query_row(
                &format!("SELECT appdata FROM {SYMTABLE} WHERE name = ?"),
                [name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(appdata.flatten())
    }

    pub fn list_names(&self, conn: &Connection) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(&format!("SELECT name FROM {SYMTABLE} ORDER BY name"))?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut names = Vec::new();
        for name in rows {
            names.push(name?);
        }
        Ok(names)
    }

    pub fn entries(&self, conn: &Connection) -> Result<Vec<ViewInfo>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT name, COALESCE(kind, ''), appdata FROM {SYMTABLE} ORDER BY name"
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok(ViewInfo {
                name: row.get(0)?,
                kind: row.get(1)?,
                appdata: row.get(2)?,
            })
        })?;
        let mut entries = Vec::new();
        for entry in rows {
            entries.push(entry?);
        }
        Ok(entries)
    }
}

/// Tag `natural_id` with `query_id` in the join index
pub fn tag_query(conn: &Connection, natural_id: &str, query_id: &str) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO {QUERIES} (natural_id, query_id) SELECT ?, ? \
             WHERE NOT EXISTS (SELECT 1 FROM {QUERIES} WHERE natural_id = ? AND query_id = ?)"
        ),
        params![natural_id, query_id, natural_id, query_id],
    )?;
    Ok(())
}
