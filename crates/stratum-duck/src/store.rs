//! Per-kind physical tables: creation, schema evolution, upsert and select

use std::sync::Arc;

use duckdb::types::{Value as DuckValue, ValueRef};
use duckdb::{params_from_iter, Connection};
use stratum_ir::{quote_ident, Column, ColumnType, Expr, QueryPlan, Record, SortKey, Value};
use tracing::debug;

use crate::dialect::DialectAdapter;
use crate::error::{Result, StorageError};
use crate::registry::tag_query;

/// How an upsert treats a row that already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Observation timestamps widen, counts add up, everything else is
    /// overwritten
    #[default]
    Merge,
    /// Every supplied column is overwritten
    Replace,
}

/// What `ensure_columns` did to a kind table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaChange {
    Unchanged,
    Created,
    /// Columns were added to an existing table
    Extended,
}

/// Optional clauses of a `select`
#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    /// `None` selects every column
    pub columns: Option<Vec<String>>,
    pub filter: Option<Expr>,
    pub sort: Vec<SortKey>,
    pub group: Option<Vec<String>>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// One physical table per kind
pub struct TypedTableStore {
    dialect: Arc<dyn DialectAdapter>,
}

impl TypedTableStore {
    pub fn new(dialect: Arc<dyn DialectAdapter>) -> Self {
        Self { dialect }
    }

    /// Create the table for `kind` if it does not exist yet.
    ///
    /// Returns true when the table was created.
    pub fn ensure_table(&self, conn: &Connection, kind: &str, schema: &[Column]) -> Result<bool> {
        if self.dialect.is_table(conn, kind)? {
            return Ok(false);
        }
        if schema.is_empty() {
            return Err(StorageError::InvalidObject(format!(
                "no columns for kind '{}'",
                kind
            )));
        }

        let columns: Vec<String> = schema
            .iter()
            .map(|c| {
                format!(
                    "{} {}",
                    quote_ident(&c.name),
                    self.dialect.column_type_sql(c.column_type)
                )
            })
            .collect();
        let sql = format!("CREATE TABLE {} ({})", quote_ident(kind), columns.join(", "));
        debug!(sql = %sql, "create table");
        conn.execute_batch(&sql)?;
        Ok(true)
    }

    /// Additive schema evolution
    pub fn add_column(
        &self,
        conn: &Connection,
        kind: &str,
        name: &str,
        column_type: ColumnType,
    ) -> Result<()> {
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            quote_ident(kind),
            quote_ident(name),
            self.dialect.column_type_sql(column_type)
        );
        debug!(sql = %sql, "add column");
        conn.execute_batch(&sql)?;
        Ok(())
    }

    /// Make sure `kind` has at least the columns in `schema`
    pub fn ensure_columns(
        &self,
        conn: &Connection,
        kind: &str,
        schema: &[Column],
    ) -> Result<SchemaChange> {
        if self.ensure_table(conn, kind, schema)? {
            return Ok(SchemaChange::Created);
        }
        let existing = self.schema(conn, kind)?;
        let mut change = SchemaChange::Unchanged;
        for column in schema {
            if !existing.iter().any(|c| c.name == column.name) {
                self.add_column(conn, kind, &column.name, column.column_type)?;
                change = SchemaChange::Extended;
            }
        }
        Ok(change)
    }

    pub fn schema(&self, conn: &Connection, kind: &str) -> Result<Vec<Column>> {
        self.dialect.schema_of(conn, kind)
    }

    /// Insert `record` into `kind`, or merge it into the row with the same id.
    ///
    /// Only the record's own columns are written, so fields it lacks keep
    /// their stored values. The table must already have every column.
    pub fn upsert(
        &self,
        conn: &Connection,
        kind: &str,
        record: &Record,
        query_id: Option<&str>,
        mode: WriteMode,
    ) -> Result<()> {
        if record.is_empty() {
            return Err(StorageError::InvalidObject("empty record".to_string()));
        }

        let table = quote_ident(kind);
        let updated = match record.id() {
            Some(id) => self.update_existing(conn, &table, id, record, mode)?,
            None => false,
        };

        if !updated {
            let columns: Vec<String> = record.fields().map(quote_ident).collect();
            let marks = vec!["?"; columns.len()].join(", ");
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table,
                columns.join(", "),
                marks
            );
            let params: Vec<DuckValue> = record.iter().map(|(_, v)| to_duck(v)).collect();
            conn.prepare_cached(&sql)?.execute(params_from_iter(params))?;
        }

        if let (Some(id), Some(query_id)) = (record.id(), query_id) {
            tag_query(conn, id, query_id)?;
        }
        Ok(())
    }

    fn update_existing(
        &self,
        conn: &Connection,
        table: &str,
        id: &str,
        record: &Record,
        mode: WriteMode,
    ) -> Result<bool> {
        let mut assignments = Vec::new();
        let mut params = Vec::new();

        for (field, value) in record.iter().filter(|(f, _)| *f != "id") {
            let col = quote_ident(field);
            let incoming = to_duck(value);
            match (mode, field) {
                (WriteMode::Merge, "first_observed") => {
                    assignments.push(format!(
                        "{col} = {}({}({col}, ?), {col}, ?)",
                        self.dialect.ifnull(),
                        self.dialect.text_min()
                    ));
                    params.push(incoming.clone());
                    params.push(incoming);
                }
                (WriteMode::Merge, "last_observed") => {
                    assignments.push(format!(
                        "{col} = {}({}({col}, ?), {col}, ?)",
                        self.dialect.ifnull(),
                        self.dialect.text_max()
                    ));
                    params.push(incoming.clone());
                    params.push(incoming);
                }
                (WriteMode::Merge, "number_observed") => {
                    let ifnull = self.dialect.ifnull();
                    assignments.push(format!("{col} = {ifnull}({col}, 0) + {ifnull}(?, 0)"));
                    params.push(incoming);
                }
                _ => {
                    assignments.push(format!("{col} = ?"));
                    params.push(incoming);
                }
            }
        }

        if assignments.is_empty() {
            let sql = format!("SELECT COUNT(*) FROM {} WHERE \"id\" = ?", table);
            let count: i64 = conn.prepare_cached(&sql)?.query_row([id], |row| row.get(0))?;
            return Ok(count > 0);
        }

        params.push(DuckValue::Text(id.to_string()));
        let sql = format!(
            "UPDATE {} SET {} WHERE \"id\" = ?",
            table,
            assignments.join(", ")
        );
        let changed = conn.prepare_cached(&sql)?.execute(params_from_iter(params))?;
        Ok(changed > 0)
    }

    /// Read rows of `kind` (or any view) with optional clauses.
    ///
    /// A group without explicit aggregates gets AutoAggregate over every
    /// remaining column.
    pub fn select(&self, conn: &Connection, kind: &str, options: &SelectOptions) -> Result<Vec<Record>> {
        let schema = self.schema(conn, kind)?;
        let known = |name: &str| schema.iter().any(|c| c.name == name);

        let mut referenced: Vec<&str> = Vec::new();
        if let Some(columns) = &options.columns {
            referenced.extend(columns.iter().map(String::as_str));
        }
        if let Some(group) = &options.group {
            referenced.extend(group.iter().map(String::as_str));
        }
        if let Some(filter) = &options.filter {
            referenced.extend(filter.columns());
        }
        referenced.extend(options.sort.iter().map(|k| k.column.as_str()));
        if let Some(bad) = referenced.into_iter().find(|c| !known(c)) {
            return Err(StorageError::InvalidAttr(bad.to_string()));
        }

        let mut plan = QueryPlan::scan(kind);
        if let Some(filter) = &options.filter {
            plan = plan.filter(filter.clone());
        }
        if let Some(group) = &options.group {
            plan = plan.group(group.clone());
            let aggs = stratum_props::auto_aggregates(kind, &schema, group);
            plan = plan.with_aggregates(aggs);
        } else if let Some(columns) = &options.columns {
            plan = plan.project(columns.clone());
        }
        if !options.sort.is_empty() {
            plan = plan.order(options.sort.clone());
        }
        if let Some(limit) = options.limit {
            plan = plan.limit(limit);
        }
        if let Some(offset) = options.offset {
            plan = plan.offset(offset);
        }

        self.run_plan(conn, &plan)
    }

    pub fn run_plan(&self, conn: &Connection, plan: &QueryPlan) -> Result<Vec<Record>> {
        let rendered = plan.render(self.dialect.as_sql_dialect())?;
        query_records(conn, &rendered.sql, &rendered.params)
    }
}

/// Run a query and collect every row as a record; NULL cells are omitted
pub fn query_records(conn: &Connection, sql: &str, params: &[Value]) -> Result<Vec<Record>> {
    debug!(sql = %sql, params = params.len(), "query");
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params_from_iter(params.iter().map(to_duck)))?;
    let names = rows
        .as_ref()
        .map(|s| s.column_names())
        .unwrap_or_default();

    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Record::new();
        for (i, name) in names.iter().enumerate() {
            let value = from_duck(row.get_ref(i)?);
            if !value.is_null() {
                record.insert(name.clone(), value);
            }
        }
        records.push(record);
    }
    Ok(records)
}

/// Run a query and collect the first column of every row, NULLs included
pub fn query_values(conn: &Connection, sql: &str, params: &[Value]) -> Result<Vec<Value>> {
    debug!(sql = %sql, "query values");
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params_from_iter(params.iter().map(to_duck)))?;
    let mut values = Vec::new();
    while let Some(row) = rows.next()? {
        values.push(from_duck(row.get_ref(0)?));
    }
    Ok(values)
}

pub(crate) fn to_duck(value: &Value) -> DuckValue {
    match value {
        Value::Null => DuckValue::Null,
        Value::Bool(b) => DuckValue::Boolean(*b),
        Value::Int(i) => DuckValue::BigInt(*i),
        Value::Float(f) => DuckValue::Double(*f),
        Value::String(s) => DuckValue::Text(s.clone()),
        Value::Array(_) => DuckValue::Text(value.to_json().to_string()),
    }
}

pub(crate) fn from_duck(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Boolean(b) => Value::Bool(b),
        ValueRef::TinyInt(i) => Value::Int(i.into()),
        ValueRef::SmallInt(i) => Value::Int(i.into()),
        ValueRef::Int(i) => Value::Int(i.into()),
        ValueRef::BigInt(i) => Value::Int(i),
        ValueRef::HugeInt(i) => match i64::try_from(i) {
            Ok(i) => Value::Int(i),
            Err(_) => Value::Float(i as f64),
        },
        ValueRef::UTinyInt(i) => Value::Int(i.into()),
        ValueRef::USmallInt(i) => Value::Int(i.into()),
        ValueRef::UInt(i) => Value::Int(i.into()),
        ValueRef::UBigInt(i) => match i64::try_from(i) {
            Ok(i) => Value::Int(i),
            Err(_) => Value::Float(i as f64),
        },
        ValueRef::Float(f) => Value::Float(f.into()),
        ValueRef::Double(f) => Value::Float(f),
        ValueRef::Decimal(d) => d
            .to_string()
            .parse()
            .map(Value::Float)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        other => {
            debug!(value = ?other, "unsupported column value read as NULL");
            Value::Null
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::DuckDialect;
    use crate::registry::SchemaRegistry;

    fn store() -> (Connection, TypedTableStore) {
        let conn = Connection::open_in_memory().unwrap();
        SchemaRegistry::open(&conn).unwrap();
        (conn, TypedTableStore::new(Arc::new(DuckDialect)))
    }

    fn host(id: &str, first: &str, last: &str, n: i64) -> Record {
        let mut r = Record::new();
        r.insert("type", "host");
        r.insert("id", id);
        r.insert("first_observed", first);
        r.insert("last_observed", last);
        r.insert("number_observed", n);
        r
    }

    fn schema() -> Vec<Column> {
        vec![
            Column::new("type", ColumnType::Text),
            Column::new("id", ColumnType::Key),
            Column::new("first_observed", ColumnType::Text),
            Column::new("last_observed", ColumnType::Text),
            Column::new("number_observed", ColumnType::Integer),
        ]
    }

    #[test]
    fn test_ensure_table_is_idempotent() {
        let (conn, store) = store();
        assert!(store.ensure_table(&conn, "host", &schema()).unwrap());
        assert!(!store.ensure_table(&conn, "host", &schema()).unwrap());
        assert_eq!(store.schema(&conn, "host").unwrap(), schema());

        let mut wider = schema();
        wider.push(Column::new("os", ColumnType::Text));
        assert_eq!(
            store.ensure_columns(&conn, "host", &wider).unwrap(),
            SchemaChange::Extended
        );
        assert_eq!(
            store.ensure_columns(&conn, "host", &schema()).unwrap(),
            SchemaChange::Unchanged
        );
        assert_eq!(store.schema(&conn, "host").unwrap(), wider);
    }

    #[test]
    fn test_merge_upsert_widens_and_sums() {
        let (conn, store) = store();
        store.ensure_table(&conn, "host", &schema()).unwrap();

        let t1 = "2024-01-02T00:00:00.000Z";
        let t2 = "2024-01-01T00:00:00.000Z";
        let t3 = "2024-01-03T00:00:00.000Z";
        store
            .upsert(&conn, "host", &host("host--1", t1, t1, 1), Some("q1"), WriteMode::Merge)
            .unwrap();
        store
            .upsert(&conn, "host", &host("host--1", t2, t3, 2), Some("q1"), WriteMode::Merge)
            .unwrap();

        let rows = store.select(&conn, "host", &SelectOptions::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("first_observed"), Some(&Value::from(t2)));
        assert_eq!(rows[0].get("last_observed"), Some(&Value::from(t3)));
        assert_eq!(rows[0].get("number_observed"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_replace_upsert_overwrites() {
        let (conn, store) = store();
        store.ensure_table(&conn, "host", &schema()).unwrap();
        let t1 = "2024-01-02T00:00:00.000Z";
        let t2 = "2024-01-01T00:00:00.000Z";
        store
            .upsert(&conn, "host", &host("host--1", t1, t1, 5), None, WriteMode::Merge)
            .unwrap();
        store
            .upsert(&conn, "host", &host("host--1", t1, t2, 1), None, WriteMode::Replace)
            .unwrap();

        let rows = store.select(&conn, "host", &SelectOptions::default()).unwrap();
        assert_eq!(rows[0].get("last_observed"), Some(&Value::from(t2)));
        assert_eq!(rows[0].get("number_observed"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_missing_fields_keep_stored_values() {
        let (conn, store) = store();
        let mut full = Record::new();
        full.insert("id", "proc--1");
        full.insert("name", "bash");
        full.insert("pid", 42i64);
        store
            .ensure_columns(
                &conn,
                "process",
                &[
                    Column::new("id", ColumnType::Key),
                    Column::new("name", ColumnType::Text),
                    Column::new("pid", ColumnType::Integer),
                ],
            )
            .unwrap();
        store.upsert(&conn, "process", &full, None, WriteMode::Merge).unwrap();

        let mut partial = Record::new();
        partial.insert("id", "proc--1");
        partial.insert("pid", 43i64);
        store.upsert(&conn, "process", &partial, None, WriteMode::Merge).unwrap();

        let rows = store.select(&conn, "process", &SelectOptions::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name"), Some(&Value::from("bash")));
        assert_eq!(rows[0].get("pid"), Some(&Value::Int(43)));
    }

    #[test]
    fn test_lists_stored_as_json_text() {
        let (conn, store) = store();
        let mut r = Record::new();
        r.insert("protocols", Value::Array(vec![Value::from("tcp"), Value::from("http")]));
        let change = store
            .ensure_columns(&conn, "x-flow", &[Column::new("protocols", ColumnType::Text)])
            .unwrap();
        assert_eq!(change, SchemaChange::Created);
        store.upsert(&conn, "x-flow", &r, None, WriteMode::Merge).unwrap();

        let rows = store.select(&conn, "x-flow", &SelectOptions::default()).unwrap();
        assert_eq!(rows[0].get("protocols"), Some(&Value::from("[\"tcp\",\"http\"]")));
    }

    #[test]
    fn test_select_group_and_unknown_column() {
        let (conn, store) = store();
        store.ensure_table(&conn, "host", &schema()).unwrap();
        for (id, n) in [("host--1", 1), ("host--2", 2)] {
            store
                .upsert(
                    &conn,
                    "host",
                    &host(id, "2024-01-01T00:00:00Z", "2024-01-02T00:00:00Z", n),
                    None,
                    WriteMode::Merge,
                )
                .unwrap();
        }

        let grouped = store
            .select(
                &conn,
                "host",
                &SelectOptions {
                    group: Some(vec!["type".to_string()]),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[0].get("number_observed"), Some(&Value::Int(3)));
        assert!(!grouped[0].contains("id"));

        let err = store
            .select(
                &conn,
                "host",
                &SelectOptions {
                    columns: Some(vec!["nope".to_string()]),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidAttr(c) if c == "nope"));
    }
}
