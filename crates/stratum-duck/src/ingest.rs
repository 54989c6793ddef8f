//! Batched ingestion into kind tables

use std::path::PathBuf;
use std::sync::Arc;

use duckdb::Connection;
use serde::Serialize;
use serde_json::Value as Json;
use stratum_ir::{Column, ColumnType, Record, Value};
use tracing::{debug, warn, Level};
use uuid::Uuid;

use crate::error::{Result, StorageError};
use crate::log_event;
use crate::splitter::RecordSplitter;
use crate::store::{SchemaChange, TypedTableStore, WriteMode};
use crate::validate::validate_name;
use crate::views::ViewManager;

/// One composite input to `cache`
#[derive(Debug, Clone)]
pub enum CacheInput {
    /// An already parsed document
    Document(Json),
    /// A JSON file holding one document or a list of them
    File(PathBuf),
}

impl From<Json> for CacheInput {
    fn from(document: Json) -> Self {
        CacheInput::Document(document)
    }
}

impl From<PathBuf> for CacheInput {
    fn from(path: PathBuf) -> Self {
        CacheInput::File(path)
    }
}

/// Outcome of a `cache` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheReport {
    /// Records written by committed batches
    pub records: usize,
    /// Batches committed
    pub batches: usize,
    /// Batches rolled back and skipped
    pub skipped_batches: usize,
    /// Inputs that could not be read or decomposed
    pub skipped_inputs: usize,
}

pub struct IngestionPipeline {
    splitter: Arc<dyn RecordSplitter>,
    batch_size: usize,
    load_batch_size: usize,
}

impl IngestionPipeline {
    pub fn new(splitter: Arc<dyn RecordSplitter>, batch_size: usize, load_batch_size: usize) -> Self {
        Self {
            splitter,
            batch_size: batch_size.max(1),
            load_batch_size: load_batch_size.max(1),
        }
    }

    /// Decompose `inputs` and upsert the pieces in batches tagged with
    /// `query_id`.
    ///
    /// Unreadable inputs and failing batches are logged and skipped; each
    /// batch commits on its own, so re-running after a failure is safe.
    pub fn cache(
        &self,
        conn: &mut Connection,
        store: &TypedTableStore,
        views: &ViewManager,
        query_id: &str,
        inputs: Vec<CacheInput>,
    ) -> Result<CacheReport> {
        let mut report = CacheReport::default();
        let mut pending: Vec<(String, Record)> = Vec::new();

        for input in inputs {
            let documents = match read_input(input) {
                Ok(documents) => documents,
                Err(e) => {
                    warn!(query_id = %query_id, error = %e, "skipping unreadable input");
                    report.skipped_inputs += 1;
                    continue;
                }
            };

            for document in documents {
                match self.splitter.decompose(&document) {
                    Ok(records) => pending.extend(records.into_iter().map(|(kind, mut record)| {
                        record.normalize_key();
                        (kind, record)
                    })),
                    Err(e) => {
                        warn!(query_id = %query_id, error = %e, "skipping malformed input");
                        report.skipped_inputs += 1;
                    }
                }
            }

            while pending.len() >= self.batch_size {
                let batch: Vec<_> = pending.drain(..self.batch_size).collect();
                self.cache_batch(conn, store, views, query_id, &batch, &mut report)?;
            }
        }

        if !pending.is_empty() {
            self.cache_batch(conn, store, views, query_id, &pending, &mut report)?;
        }

        log_event!(
            level: Level::INFO,
            event: "cache_finished",
            query_id: query_id,
            records: report.records,
            batches: report.batches,
            skipped_batches: report.skipped_batches,
            skipped_inputs: report.skipped_inputs,
        );
        Ok(report)
    }

    fn cache_batch(
        &self,
        conn: &mut Connection,
        store: &TypedTableStore,
        views: &ViewManager,
        query_id: &str,
        batch: &[(String, Record)],
        report: &mut CacheReport,
    ) -> Result<()> {
        let tx = conn.transaction()?;
        match write_batch(&tx, store, views, batch, Some(query_id), WriteMode::Merge) {
            Ok(written) => {
                tx.commit()?;
                report.records += written;
                report.batches += 1;
                log_event!(
                    level: Level::DEBUG,
                    event: "batch_cached",
                    query_id: query_id,
                    records: written,
                );
            }
            Err(e) => {
                // dropping the transaction rolls the batch back
                drop(tx);
                warn!(query_id = %query_id, records = batch.len(), error = %e, "skipping failed batch");
                report.skipped_batches += 1;
            }
        }
        Ok(())
    }

    /// Ingest already decomposed records and expose them as view `name`.
    ///
    /// Bare strings become `{type: kind, <primary property>: value}`. Ids
    /// are replaced by fresh ones unless `preserve_ids` is set and the
    /// record has one. Returns the kind.
    #[allow(clippy::too_many_arguments)]
    pub fn load(
        &self,
        conn: &mut Connection,
        store: &TypedTableStore,
        views: &ViewManager,
        name: &str,
        records: Vec<Json>,
        kind: Option<&str>,
        query_id: Option<&str>,
        preserve_ids: bool,
    ) -> Result<String> {
        validate_name(name)?;

        let query_id = match query_id {
            Some(q) => q.to_string(),
            None => records
                .first()
                .and_then(|r| r.get("query_id"))
                .and_then(Json::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
        };

        let kind = match kind {
            Some(kind) => kind.to_string(),
            None => records
                .first()
                .and_then(|r| r.get("type"))
                .and_then(Json::as_str)
                .map(str::to_string)
                .ok_or_else(|| StorageError::InvalidObject("cannot determine kind".to_string()))?,
        };

        let mut prepared = Vec::with_capacity(records.len());
        for record in &records {
            let mut record = to_load_record(record, &kind)?;
            record.remove("query_id");
            if !preserve_ids || record.id().is_none() {
                record.insert("id", format!("{}--{}", kind, Uuid::new_v4()));
            }
            prepared.push((kind.clone(), record));
        }

        for chunk in prepared.chunks(self.load_batch_size) {
            let tx = conn.transaction()?;
            write_batch(&tx, store, views, chunk, Some(&query_id), WriteMode::Merge)?;
            tx.commit()?;
        }

        let tx = conn.transaction()?;
        views.extract(&tx, name, &kind, &kind, None, Some(&query_id))?;
        tx.commit()?;

        log_event!(
            level: Level::INFO,
            event: "load_finished",
            view: name,
            kind: kind,
            query_id: query_id,
            records: prepared.len(),
        );
        Ok(kind)
    }

    /// Write records in `load`-sized chunks, one transaction each.
    ///
    /// Records without a `type` take `default_kind`.
    #[allow(clippy::too_many_arguments)]
    pub fn write_records(
        &self,
        conn: &mut Connection,
        store: &TypedTableStore,
        views: &ViewManager,
        records: Vec<Record>,
        default_kind: Option<&str>,
        query_id: Option<&str>,
        mode: WriteMode,
    ) -> Result<usize> {
        let mut batch = Vec::with_capacity(records.len());
        for mut record in records {
            record.normalize_key();
            let kind = resolve_kind(&record, default_kind)?;
            if record.kind().is_none() {
                record.insert("type", kind.as_str());
            }
            batch.push((kind, record));
        }

        let mut written = 0;
        for chunk in batch.chunks(self.load_batch_size) {
            let tx = conn.transaction()?;
            written += write_batch(&tx, store, views, chunk, query_id, mode)?;
            tx.commit()?;
        }
        Ok(written)
    }
}

/// Kind of a record: its own `type`, else the caller's default
pub fn resolve_kind(record: &Record, default_kind: Option<&str>) -> Result<String> {
    record
        .kind()
        .or(default_kind)
        .map(str::to_string)
        .ok_or_else(|| StorageError::InvalidObject(format!("record has no type: {:?}", record)))
}

/// Evolve every touched kind table to the batch's columns, then upsert
fn write_batch(
    conn: &Connection,
    store: &TypedTableStore,
    views: &ViewManager,
    batch: &[(String, Record)],
    query_id: Option<&str>,
    mode: WriteMode,
) -> Result<usize> {
    let mut kinds: Vec<&str> = Vec::new();
    for (kind, _) in batch {
        if !kinds.contains(&kind.as_str()) {
            kinds.push(kind);
        }
    }
    let schemas: Vec<(&str, Vec<Column>)> = kinds
        .into_iter()
        .map(|kind| {
            let records = batch.iter().filter(|(k, _)| k == kind).map(|(_, r)| r);
            (kind, infer_schema(records))
        })
        .collect();

    for (kind, schema) in &schemas {
        validate_name(kind)?;
        if views.registry().contains(conn, kind)? && !views.is_kind_table(conn, kind)? {
            return Err(StorageError::InvalidName(format!(
                "'{}' is already used by a view",
                kind
            )));
        }
        match store.ensure_columns(conn, kind, schema)? {
            SchemaChange::Created => {
                views.register_kind(conn, kind)?;
                debug!(kind = %kind, columns = schema.len(), "kind table created");
            }
            SchemaChange::Extended => {
                views.rebind_dependents(conn, kind)?;
            }
            SchemaChange::Unchanged => {}
        }
    }

    for (kind, record) in batch {
        store.upsert(conn, kind, record, query_id, mode)?;
    }
    Ok(batch.len())
}

/// Union of the columns of `records`.
///
/// NULLs carry no type, so a column only ever seen as NULL becomes text.
/// Integer and real samples widen to real; any other mix becomes text.
fn infer_schema<'a>(records: impl Iterator<Item = &'a Record>) -> Vec<Column> {
    let mut schema: Vec<Column> = Vec::new();
    let mut untyped: Vec<&str> = Vec::new();

    for record in records {
        for (field, value) in record.iter() {
            if value.is_null() {
                if !untyped.contains(&field) {
                    untyped.push(field);
                }
                continue;
            }
            let inferred = ColumnType::infer(field, value);
            match schema.iter_mut().find(|c| c.name == field) {
                Some(column) if column.column_type == inferred => {}
                Some(column) => {
                    column.column_type = match (column.column_type, inferred) {
                        (ColumnType::Integer, ColumnType::Real)
                        | (ColumnType::Real, ColumnType::Integer) => ColumnType::Real,
                        _ => ColumnType::Text,
                    };
                }
                None => schema.push(Column::new(field, inferred)),
            }
        }
    }

    for field in untyped {
        if !schema.iter().any(|c| c.name == field) {
            schema.push(Column::new(field, ColumnType::infer(field, &Value::Null)));
        }
    }
    schema
}

fn read_input(input: CacheInput) -> Result<Vec<Json>> {
    let document = match input {
        CacheInput::Document(document) => document,
        CacheInput::File(path) => {
            let text = std::fs::read_to_string(&path)?;
            serde_json::from_str(&text)?
        }
    };
    Ok(match document {
        Json::Array(documents) => documents,
        other => vec![other],
    })
}

fn to_load_record(value: &Json, kind: &str) -> Result<Record> {
    let mut record = match value {
        Json::String(text) => {
            let prop = stratum_props::primary_prop(kind).ok_or_else(|| {
                StorageError::InvalidObject(format!("kind '{}' has no primary property", kind))
            })?;
            let mut record = Record::new();
            record.insert(prop, text.as_str());
            record
        }
        Json::Object(_) => Record::from_json(value).unwrap_or_default(),
        other => {
            return Err(StorageError::InvalidObject(format!(
                "cannot load {} as {}",
                other, kind
            )))
        }
    };

    match record.kind() {
        None => {
            record.insert("type", kind);
        }
        Some(own) if own != kind => {
            return Err(StorageError::InvalidObject(format!(
                "record of kind '{}' loaded as '{}'",
                own, kind
            )));
        }
        Some(_) => {}
    }
    Ok(record)
}
