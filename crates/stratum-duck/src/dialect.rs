//! Backend-specific SQL: fragments, view DDL and schema introspection

use duckdb::Connection;
use stratum_ir::{quote_ident, Column, ColumnType, SqlDialect};
use tracing::debug;

use crate::error::Result;

/// Prefix of the engine's own bookkeeping tables
pub const RESERVED_PREFIX: &str = "__";

/// Everything the engine needs to know about one backend.
///
/// `SqlDialect` covers the text fragments used while rendering plans; the
/// methods here run statements against a connection (or the open
/// transaction, which derefs to one).
pub trait DialectAdapter: SqlDialect + Send + Sync {
    /// The fragment side of this dialect, for plan rendering
    fn as_sql_dialect(&self) -> &dyn SqlDialect;

    /// Set union that lines columns up by name
    fn union_sql(&self) -> &'static str {
        "UNION"
    }

    /// SQL type used to store a column
    fn column_type_sql(&self, column_type: ColumnType) -> &'static str;

    fn create_view(&self, conn: &Connection, name: &str, select: &str) -> Result<()>;

    /// The `SELECT` text a view was created from
    fn get_view_definition(&self, conn: &Connection, name: &str) -> Result<Option<String>>;

    fn is_view(&self, conn: &Connection, name: &str) -> Result<bool>;

    fn is_table(&self, conn: &Connection, name: &str) -> Result<bool>;

    /// Every user table and view, bookkeeping excluded
    fn list_tables(&self, conn: &Connection) -> Result<Vec<String>>;

    /// Base tables (not views), bookkeeping excluded
    fn list_kinds(&self, conn: &Connection) -> Result<Vec<String>>;

    /// Columns in declaration order; empty when `name` does not exist
    fn schema_of(&self, conn: &Connection, name: &str) -> Result<Vec<Column>>;

    /// Drop a table or view if present
    fn drop_object(&self, conn: &Connection, name: &str) -> Result<()>;
}

/// DuckDB dialect
#[derive(Debug, Default, Clone, Copy)]
pub struct DuckDialect;

impl DuckDialect {
    fn names(&self, conn: &Connection, sql: &str) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut names = Vec::new();
        for name in rows {
            let name = name?;
            if !name.starts_with(RESERVED_PREFIX) {
                names.push(name);
            }
        }
        Ok(names)
    }

    fn table_type(&self, conn: &Connection, name: &str) -> Result<Option<String>> {
        let mut stmt = conn.prepare(
            "SELECT table_type FROM information_schema.tables \
             WHERE table_schema = 'main' AND table_name = ?",
        )?;
        let mut rows = stmt.query([name])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }
}

impl SqlDialect for DuckDialect {
    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn text_min(&self) -> &str {
        "LEAST"
    }

    fn text_max(&self) -> &str {
        "GREATEST"
    }

    fn ifnull(&self) -> &str {
        "COALESCE"
    }

    fn regex_match(&self, expr: &str, regex: &str) -> String {
        format!("regexp_matches({}, {})", expr, regex)
    }
}

impl DialectAdapter for DuckDialect {
    fn as_sql_dialect(&self) -> &dyn SqlDialect {
        self
    }

    fn union_sql(&self) -> &'static str {
        "UNION BY NAME"
    }

    fn column_type_sql(&self, column_type: ColumnType) -> &'static str {
        match column_type {
            ColumnType::Key => "VARCHAR",
            ColumnType::Integer => "BIGINT",
            ColumnType::Real => "DOUBLE",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Text => "VARCHAR",
        }
    }

    fn create_view(&self, conn: &Connection, name: &str, select: &str) -> Result<()> {
        let sql = format!("CREATE OR REPLACE VIEW {} AS {}", quote_ident(name), select);
        debug!(sql = %sql, "create view");
        conn.execute_batch(&sql)?;
        Ok(())
    }

    fn get_view_definition(&self, conn: &Connection, name: &str) -> Result<Option<String>> {
        let mut stmt = conn.prepare(
            "SELECT sql FROM duckdb_views() WHERE schema_name = 'main' AND view_name = ?",
        )?;
        let mut rows = stmt.query([name])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let ddl: String = row.get(0)?;
        Ok(Some(select_of_ddl(&ddl)))
    }

    fn is_view(&self, conn: &Connection, name: &str) -> Result<bool> {
        Ok(self.table_type(conn, name)?.as_deref() == Some("VIEW"))
    }

    fn is_table(&self, conn: &Connection, name: &str) -> Result<bool> {
        Ok(self.table_type(conn, name)?.as_deref() == Some("BASE TABLE"))
    }

    fn list_tables(&self, conn: &Connection) -> Result<Vec<String>> {
        self.names(
            conn,
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = 'main' ORDER BY table_name",
        )
    }

    fn list_kinds(&self, conn: &Connection) -> Result<Vec<String>> {
        self.names(
            conn,
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = 'main' AND table_type = 'BASE TABLE' ORDER BY table_name",
        )
    }

    fn schema_of(&self, conn: &Connection, name: &str) -> Result<Vec<Column>> {
        let mut stmt = conn.prepare(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE table_schema = 'main' AND table_name = ? ORDER BY ordinal_position",
        )?;
        let rows = stmt.query_map([name], |row| {
            let column: String = row.get(0)?;
            let data_type: String = row.get(1)?;
            Ok((column, data_type))
        })?;

        let mut columns = Vec::new();
        for row in rows {
            let (column, data_type) = row?;
            let column_type = ColumnType::from_sql_type(&column, &data_type);
            columns.push(Column::new(column, column_type));
        }
        Ok(columns)
    }

    fn drop_object(&self, conn: &Connection, name: &str) -> Result<()> {
        let keyword = match self.table_type(conn, name)?.as_deref() {
            Some("VIEW") => "VIEW",
            Some(_) => "TABLE",
            None => return Ok(()),
        };
        let sql = format!("DROP {} {}", keyword, quote_ident(name));
        debug!(sql = %sql, "drop object");
        conn.execute_batch(&sql)?;
        Ok(())
    }
}

/// Strip `CREATE VIEW name AS` and the trailing `;` from stored view DDL
fn select_of_ddl(ddl: &str) -> String {
    let upper = ddl.to_ascii_uppercase();
    let body = match upper.find(" AS ") {
        Some(pos) => &ddl[pos + 4..],
        None => ddl,
    };
    body.trim().trim_end_matches(';').trim_end().to_string()
}
