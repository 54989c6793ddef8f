//! DuckDB-backed typed view engine
//!
//! Records are ingested into one table per kind. Named views are composed
//! on top of those tables (extract, filter, join, merge, sort/group) and a
//! registry keeps every live name with the kind it returns.
//!
//! ```no_run
//! use stratum_duck::Storage;
//!
//! let mut storage = Storage::in_memory()?;
//! storage.load("ips", vec![serde_json::json!("10.0.0.1")], Some("ipv4-addr"), None, false)?;
//! let rows = storage.lookup("ips", None, None, None)?;
//! assert_eq!(rows.len(), 1);
//! # Ok::<(), stratum_duck::StorageError>(())
//! ```

pub mod config;
pub mod dialect;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod registry;
pub mod splitter;
pub mod store;
pub mod validate;
pub mod views;

use std::sync::Arc;

use duckdb::Connection;
use stratum_pattern::ObservationPatternCompiler;
use tracing::info;
use uuid::Uuid;

pub use config::{Config, ConfigError, DatabaseConfig, IngestConfig, LoggingConfig};
pub use dialect::{DialectAdapter, DuckDialect};
pub use error::{Result, StorageError};
pub use ingest::{CacheInput, CacheReport, IngestionPipeline};
pub use registry::{SchemaRegistry, ViewInfo};
pub use splitter::{ObservationSplitter, RecordSplitter, SplitError};
pub use store::{SelectOptions, TypedTableStore, WriteMode};
pub use stratum_ir::{
    self, AggFunc, Aggregate, Column, ColumnType, Expr, PatternCompiler, QueryPlan, Record,
    SortKey, Value,
};
pub use views::{AssignOp, Reassignment, ViewManager};

use stratum_ir::quote_ident;
use validate::{parse_path, validate_name};

/// The storage engine: one connection plus the components working on it
pub struct Storage {
    conn: Connection,
    dialect: Arc<dyn DialectAdapter>,
    store: TypedTableStore,
    views: ViewManager,
    ingest: IngestionPipeline,
}

impl Storage {
    /// Open the database described by `config` with the default components
    pub fn open(config: &Config) -> Result<Self> {
        let conn = match &config.database.path {
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };
        info!(path = ?config.database.path, "opening storage");
        Self::with_components(
            conn,
            Arc::new(DuckDialect),
            Arc::new(ObservationPatternCompiler::new()),
            Arc::new(ObservationSplitter::new()),
            &config.ingest,
        )
    }

    /// Fresh in-memory database with default settings
    pub fn in_memory() -> Result<Self> {
        Self::open(&Config::default())
    }

    /// Assemble an engine from explicit collaborators
    pub fn with_components(
        conn: Connection,
        dialect: Arc<dyn DialectAdapter>,
        compiler: Arc<dyn PatternCompiler>,
        splitter: Arc<dyn RecordSplitter>,
        ingest: &IngestConfig,
    ) -> Result<Self> {
        let registry = SchemaRegistry::open(&conn)?;
        Ok(Self {
            store: TypedTableStore::new(Arc::clone(&dialect)),
            views: ViewManager::new(Arc::clone(&dialect), compiler, registry),
            ingest: IngestionPipeline::new(splitter, ingest.batch_size, ingest.load_batch_size),
            dialect,
            conn,
        })
    }

    /// Close the connection, reporting any error from the backend
    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, e)| StorageError::Database(e))
    }

    /// Run `op` in one transaction; any error rolls everything back
    fn transact<T>(
        &mut self,
        op: impl FnOnce(&Connection, &ViewManager, &TypedTableStore) -> Result<T>,
    ) -> Result<T> {
        let tx = self.conn.transaction()?;
        let conn: &Connection = &tx;
        let out = op(conn, &self.views, &self.store)?;
        tx.commit()?;
        Ok(out)
    }

    fn require_registered(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        if self.views.registry().contains(&self.conn, name)? {
            Ok(())
        } else {
            Err(StorageError::NotFound(name.to_string()))
        }
    }

    // ---- ingestion ----

    /// Decompose composite documents and cache their records under `query_id`
    pub fn cache(&mut self, query_id: &str, inputs: Vec<CacheInput>) -> Result<CacheReport> {
        self.ingest
            .cache(&mut self.conn, &self.store, &self.views, query_id, inputs)
    }

    /// Ingest records of one kind and expose exactly them as view `name`
    pub fn load(
        &mut self,
        name: &str,
        records: Vec<serde_json::Value>,
        kind: Option<&str>,
        query_id: Option<&str>,
        preserve_ids: bool,
    ) -> Result<String> {
        self.ingest.load(
            &mut self.conn,
            &self.store,
            &self.views,
            name,
            records,
            kind,
            query_id,
            preserve_ids,
        )
    }

    /// Upsert records into their kind tables without touching any view
    pub fn upsert(
        &mut self,
        records: Vec<Record>,
        default_kind: Option<&str>,
        query_id: Option<&str>,
        mode: WriteMode,
    ) -> Result<usize> {
        self.ingest.write_records(
            &mut self.conn,
            &self.store,
            &self.views,
            records,
            default_kind,
            query_id,
            mode,
        )
    }

    /// Overwrite stored objects with `records`; each needs `type` and `id`
    pub fn update(&mut self, mut records: Vec<Record>) -> Result<usize> {
        records.iter_mut().for_each(Record::normalize_key);
        if let Some(bad) = records.iter().find(|r| r.kind().is_none() || r.id().is_none()) {
            return Err(StorageError::InvalidObject(format!(
                "update needs 'type' and 'id': {:?}",
                bad
            )));
        }
        self.upsert(records, None, None, WriteMode::Replace)
    }

    // ---- views ----

    pub fn create_view(&mut self, name: &str, select: &str, kind: &str, deps: &[&str]) -> Result<()> {
        self.transact(|conn, views, _| views.create_view(conn, name, select, kind, deps))
    }

    pub fn extract(
        &mut self,
        name: &str,
        kind: &str,
        source_kind: &str,
        pattern: Option<&str>,
        query_id: Option<&str>,
    ) -> Result<()> {
        self.transact(|conn, views, _| {
            views.extract(conn, name, kind, source_kind, pattern, query_id)
        })
    }

    pub fn filter(
        &mut self,
        name: &str,
        kind: &str,
        input: &str,
        pattern: Option<&str>,
    ) -> Result<()> {
        self.transact(|conn, views, _| views.filter(conn, name, kind, input, pattern))
    }

    pub fn join(
        &mut self,
        name: &str,
        left: &str,
        left_path: &str,
        right: &str,
        right_path: &str,
    ) -> Result<()> {
        self.transact(|conn, views, _| {
            views.join(conn, name, left, left_path, right, right_path)
        })
    }

    /// Union of views of one kind; fails without side effects otherwise
    pub fn merge(&mut self, name: &str, sources: &[&str]) -> Result<()> {
        self.transact(|conn, views, _| views.merge(conn, name, sources))
    }

    pub fn assign(
        &mut self,
        name: &str,
        source: &str,
        op: AssignOp,
        by: &str,
        ascending: bool,
        limit: Option<u64>,
    ) -> Result<()> {
        self.transact(|conn, views, _| {
            views.assign(conn, name, source, op, by, ascending, limit)
        })
    }

    pub fn assign_query(&mut self, name: &str, plan: QueryPlan) -> Result<()> {
        self.transact(|conn, views, _| views.assign_query(conn, name, plan))
    }

    /// Write records back into view `name`.
    ///
    /// Keyed records are merged into their kind tables and the view keeps
    /// its definition (or becomes an extract of exactly these records).
    /// Records without ids replace `name` with a table holding only them.
    /// Mixing the two fails with `InvalidObject` before anything is written.
    /// An empty list leaves `name` untouched.
    pub fn reassign(&mut self, name: &str, mut records: Vec<Record>) -> Result<()> {
        validate_name(name)?;
        if records.is_empty() {
            return Ok(());
        }
        records.iter_mut().for_each(Record::normalize_key);
        match Reassignment::from_records(records)? {
            Reassignment::Keyed(records) => {
                let registered = self.views.registry().kind_of(&self.conn, name)?;
                let kind = match registered {
                    Some(kind) => kind,
                    None => records
                        .iter()
                        .find_map(|r| r.kind().map(str::to_string))
                        .ok_or_else(|| {
                            StorageError::InvalidObject("records have no type".to_string())
                        })?,
                };
                let query_id = Uuid::new_v4().to_string();
                self.upsert(records, Some(&kind), Some(&query_id), WriteMode::Replace)?;
                self.transact(|conn, views, _| views.refresh_keyed(conn, name, &kind, &query_id))
            }
            Reassignment::Aggregate(rows) => {
                self.transact(|conn, views, store| views.materialize(conn, store, name, &rows))
            }
        }
    }

    pub fn remove_view(&mut self, name: &str) -> Result<()> {
        self.transact(|conn, views, _| views.remove_view(conn, name))
    }

    pub fn rename_view(&mut self, old: &str, new: &str) -> Result<()> {
        self.transact(|conn, views, _| views.rename_view(conn, old, new))
    }

    /// Drop every table and view and start over with empty bookkeeping
    pub fn delete(&mut self) -> Result<()> {
        let dialect = Arc::clone(&self.dialect);
        self.transact(|conn, views, _| {
            // views first, they may read from the tables
            let mut names = Vec::new();
            for name in dialect.list_tables(conn)? {
                let is_view = dialect.is_view(conn, &name)?;
                names.push((name, is_view));
            }
            names.sort_by_key(|(_, is_view)| !is_view);
            for (name, _) in &names {
                dialect.drop_object(conn, name)?;
            }
            views.registry().reset(conn)?;
            info!(dropped = names.len(), "storage cleared");
            Ok(())
        })
    }

    pub fn set_appdata(&mut self, name: &str, appdata: &str) -> Result<()> {
        validate_name(name)?;
        self.transact(|conn, views, _| {
            if views.registry().set_appdata(conn, name, appdata)? {
                Ok(())
            } else {
                Err(StorageError::NotFound(name.to_string()))
            }
        })
    }

    pub fn get_appdata(&self, name: &str) -> Result<Option<String>> {
        self.require_registered(name)?;
        self.views.registry().get_appdata(&self.conn, name)
    }

    // ---- reads ----

    /// Rows of `name`, optionally restricted to `columns`
    pub fn lookup(
        &self,
        name: &str,
        columns: Option<&[&str]>,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<Vec<Record>> {
        self.require_registered(name)?;
        let options = SelectOptions {
            columns: columns.map(|cols| cols.iter().map(|c| c.to_string()).collect()),
            limit,
            offset,
            ..Default::default()
        };
        self.store.select(&self.conn, name, &options)
    }

    pub fn select(&self, name: &str, options: &SelectOptions) -> Result<Vec<Record>> {
        self.require_registered(name)?;
        self.store.select(&self.conn, name, options)
    }

    /// Every value of one column of `name`; `path` may be `kind:column`
    pub fn values(&self, path: &str, name: &str) -> Result<Vec<Value>> {
        self.require_registered(name)?;
        let column = parse_path(path)?.column;
        let schema = self.dialect.schema_of(&self.conn, name)?;
        if !schema.iter().any(|c| c.name == column) {
            return Err(StorageError::InvalidAttr(path.to_string()));
        }
        let sql = format!("SELECT {} FROM {}", quote_ident(&column), quote_ident(name));
        store::query_values(&self.conn, &sql, &[])
    }

    pub fn count(&self, name: &str) -> Result<u64> {
        self.require_registered(name)?;
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(name));
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Run a plan directly; grouping without aggregates gets AutoAggregate
    pub fn run_query(&self, plan: &QueryPlan) -> Result<Vec<Record>> {
        let source = plan.scan_name().ok_or(stratum_ir::PlanError::MissingScan)?;
        self.require_registered(source)?;
        if plan.needs_aggregates() {
            let kind = self.table_type(source)?.unwrap_or_default();
            let schema = self.dialect.schema_of(&self.conn, source)?;
            let group = plan.group_columns().unwrap_or_default().to_vec();
            let aggregates = stratum_props::auto_aggregates(&kind, &schema, &group);
            let plan = plan.clone().with_aggregates(aggregates);
            return self.store.run_plan(&self.conn, &plan);
        }
        self.store.run_plan(&self.conn, plan)
    }

    /// Every user table and view
    pub fn tables(&self) -> Result<Vec<String>> {
        self.dialect.list_tables(&self.conn)
    }

    /// Kinds that have a physical table
    pub fn types(&self) -> Result<Vec<String>> {
        let registry = self.views.registry();
        let mut kinds = Vec::new();
        for table in self.dialect.list_kinds(&self.conn)? {
            if registry.kind_of(&self.conn, &table)?.as_deref() == Some(table.as_str()) {
                kinds.push(table);
            }
        }
        Ok(kinds)
    }

    /// Registered names that are SQL views
    pub fn views(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for name in self.views.registry().list_names(&self.conn)? {
            if self.dialect.is_view(&self.conn, &name)? {
                names.push(name);
            }
        }
        Ok(names)
    }

    pub fn columns(&self, name: &str) -> Result<Vec<String>> {
        Ok(self.schema(name)?.into_iter().map(|c| c.name).collect())
    }

    pub fn schema(&self, name: &str) -> Result<Vec<Column>> {
        self.require_registered(name)?;
        self.dialect.schema_of(&self.conn, name)
    }

    /// Kind returned by `name`
    pub fn table_type(&self, name: &str) -> Result<Option<String>> {
        self.views.registry().kind_of(&self.conn, name)
    }

    /// Registry entries, all of them or just `names`
    pub fn get_view_data(&self, names: Option<&[&str]>) -> Result<Vec<ViewInfo>> {
        let entries = self.views.registry().entries(&self.conn)?;
        Ok(match names {
            Some(names) => entries
                .into_iter()
                .filter(|e| names.contains(&e.name.as_str()))
                .collect(),
            None => entries,
        })
    }
}
