//! Named views over kind tables and other views
//!
//! Views are never changed in place: every operation drops and recreates.
//! All DDL goes through here together with the matching registry update,
//! so callers wrap each call in one transaction.

use std::sync::Arc;

use duckdb::Connection;
use stratum_ir::{
    quote_ident, quote_literal, Column, ColumnType, PatternCompiler, QueryPlan, Record, SortKey,
};
use tracing::{debug, info};

use crate::dialect::{DialectAdapter, RESERVED_PREFIX};
use crate::error::{Result, StorageError};
use crate::registry::{SchemaRegistry, QUERIES};
use crate::store::{TypedTableStore, WriteMode};
use crate::validate::{parse_path, validate_name};

/// Reshaping applied by `assign`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Sort,
    Group,
}

/// Records written back into a named view, split once by whether they
/// carry a natural key
#[derive(Debug, Clone, PartialEq)]
pub enum Reassignment {
    /// Rows with an `id`, merged into their kind tables
    Keyed(Vec<Record>),
    /// Rows without identity, such as grouped output
    Aggregate(Vec<Record>),
}

impl Reassignment {
    /// Keyed if any record has an `id`, in which case all of them must
    pub fn from_records(records: Vec<Record>) -> Result<Self> {
        if !records.iter().any(|r| r.id().is_some()) {
            return Ok(Reassignment::Aggregate(records));
        }
        if let Some(bad) = records.iter().find(|r| r.id().is_none()) {
            return Err(StorageError::InvalidObject(format!(
                "missing 'id' among keyed records: {:?}",
                bad
            )));
        }
        Ok(Reassignment::Keyed(records))
    }
}

pub struct ViewManager {
    dialect: Arc<dyn DialectAdapter>,
    compiler: Arc<dyn PatternCompiler>,
    registry: SchemaRegistry,
}

impl ViewManager {
    pub fn new(
        dialect: Arc<dyn DialectAdapter>,
        compiler: Arc<dyn PatternCompiler>,
        registry: SchemaRegistry,
    ) -> Self {
        Self {
            dialect,
            compiler,
            registry,
        }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// True when `name` is the physical table of a kind
    pub fn is_kind_table(&self, conn: &Connection, name: &str) -> Result<bool> {
        Ok(self.registry.kind_of(conn, name)?.as_deref() == Some(name)
            && self.dialect.is_table(conn, name)?)
    }

    /// Register a freshly created kind table under its own name
    pub fn register_kind(&self, conn: &Connection, kind: &str) -> Result<()> {
        self.registry.register(conn, kind, kind)
    }

    /// Create or replace view `name` from `select`.
    ///
    /// Every dependency must already be registered. A materialized table
    /// of the same name is dropped first; a kind table is never replaced.
    pub fn create_view(
        &self,
        conn: &Connection,
        name: &str,
        select: &str,
        kind: &str,
        deps: &[&str],
    ) -> Result<()> {
        validate_name(name)?;
        for dep in deps {
            if !self.registry.contains(conn, dep)? {
                return Err(StorageError::NotFound((*dep).to_string()));
            }
        }
        if self.is_kind_table(conn, name)? {
            return Err(StorageError::InvalidName(format!(
                "'{}' is a kind table",
                name
            )));
        }
        if self.dialect.is_table(conn, name)? {
            self.dialect.drop_object(conn, name)?;
        }

        self.dialect.create_view(conn, name, select)?;
        self.registry.register(conn, name, kind)?;
        info!(view = %name, kind = %kind, deps = ?deps, "view created");
        Ok(())
    }

    /// View over rows of `source_kind` matching `pattern`, optionally only
    /// those ingested under `query_id`
    pub fn extract(
        &self,
        conn: &Connection,
        name: &str,
        kind: &str,
        source_kind: &str,
        pattern: Option<&str>,
        query_id: Option<&str>,
    ) -> Result<()> {
        validate_name(name)?;
        if !self.dialect.is_table(conn, source_kind)? {
            return Err(StorageError::NotFound(source_kind.to_string()));
        }

        let mut conditions = Vec::new();
        if let Some(query_id) = query_id {
            conditions.push(format!(
                "\"id\" IN (SELECT natural_id FROM {} WHERE query_id = {})",
                QUERIES,
                quote_literal(query_id)
            ));
        }
        if let Some(pattern) = pattern {
            let schema = self.dialect.schema_of(conn, source_kind)?;
            conditions.push(self.predicate(pattern, source_kind, &schema)?);
        }

        let mut select = format!("SELECT * FROM {}", quote_ident(source_kind));
        if !conditions.is_empty() {
            select.push_str(" WHERE ");
            select.push_str(&conditions.join(" AND "));
        }
        self.create_view(conn, name, &select, kind, &[source_kind])
    }

    /// Like `extract`, reading from the definition of an existing view.
    /// Without a pattern the input is wrapped unchanged.
    pub fn filter(
        &self,
        conn: &Connection,
        name: &str,
        kind: &str,
        input: &str,
        pattern: Option<&str>,
    ) -> Result<()> {
        validate_name(name)?;
        let source = self.source_definition(conn, input)?;

        let mut select = format!("SELECT * FROM ({}) AS tmp", source);
        if let Some(pattern) = pattern {
            let schema = self.dialect.schema_of(conn, input)?;
            select.push_str(" WHERE ");
            select.push_str(&self.predicate(pattern, kind, &schema)?);
        }
        self.create_view(conn, name, &select, kind, &[input])
    }

    /// Inner join of `left` and `right`; shared columns prefer the left value
    pub fn join(
        &self,
        conn: &Connection,
        name: &str,
        left: &str,
        left_path: &str,
        right: &str,
        right_path: &str,
    ) -> Result<()> {
        validate_name(name)?;
        let kind = self.kind_of_required(conn, left)?;
        self.kind_of_required(conn, right)?;

        let left_schema = self.dialect.schema_of(conn, left)?;
        let right_schema = self.dialect.schema_of(conn, right)?;
        let left_on = parse_path(left_path)?.column;
        let right_on = parse_path(right_path)?.column;
        require_column(&left_schema, &left_on, left_path)?;
        require_column(&right_schema, &right_on, right_path)?;

        let ifnull = self.dialect.ifnull();
        let mut columns = Vec::new();
        for column in &left_schema {
            let col = quote_ident(&column.name);
            if right_schema.iter().any(|c| c.name == column.name) {
                columns.push(format!("{ifnull}(l.{col}, r.{col}) AS {col}"));
            } else {
                columns.push(format!("l.{col} AS {col}"));
            }
        }
        for column in &right_schema {
            if !left_schema.iter().any(|c| c.name == column.name) {
                let col = quote_ident(&column.name);
                columns.push(format!("r.{col} AS {col}"));
            }
        }

        let select = format!(
            "SELECT {} FROM {} AS l INNER JOIN {} AS r ON l.{} = r.{}",
            columns.join(", "),
            self.source_ref(conn, left, name)?,
            self.source_ref(conn, right, name)?,
            quote_ident(&left_on),
            quote_ident(&right_on)
        );
        self.create_view(conn, name, &select, &kind, &[left, right])
    }

    /// Set union of views that all return the same kind
    pub fn merge(&self, conn: &Connection, name: &str, views: &[&str]) -> Result<()> {
        validate_name(name)?;
        if views.len() < 2 {
            return Err(StorageError::InvalidObject(
                "merge needs at least two views".to_string(),
            ));
        }

        let mut kind: Option<String> = None;
        for view in views {
            let view_kind = self.kind_of_required(conn, view)?;
            match &kind {
                Some(k) if *k != view_kind => {
                    return Err(StorageError::IncompatibleType(format!(
                        "cannot merge '{}' ({}) with kind {}",
                        view, view_kind, k
                    )));
                }
                Some(_) => {}
                None => kind = Some(view_kind),
            }
        }
        let kind = kind.unwrap_or_default();

        let mut parts = Vec::with_capacity(views.len());
        for (i, view) in views.iter().enumerate() {
            let source = self.source_definition(conn, view)?;
            parts.push(format!("SELECT * FROM ({}) AS m{}", source, i));
        }
        let union = format!(" {} ", self.dialect.union_sql());
        let select = parts.join(union.as_str());
        self.create_view(conn, name, &select, &kind, views)
    }

    /// Sort or group `source` into view `name`
    #[allow(clippy::too_many_arguments)]
    pub fn assign(
        &self,
        conn: &Connection,
        name: &str,
        source: &str,
        op: AssignOp,
        by: &str,
        ascending: bool,
        limit: Option<u64>,
    ) -> Result<()> {
        validate_name(name)?;
        let schema = self.dialect.schema_of(conn, source)?;
        let column = parse_path(by)?.column;
        require_column(&schema, &column, by)?;

        let mut plan = QueryPlan::scan(source);
        plan = match op {
            AssignOp::Sort => plan.order(vec![SortKey {
                column,
                ascending,
            }]),
            AssignOp::Group => plan.group([column.clone()]).order(vec![SortKey {
                column,
                ascending,
            }]),
        };
        if let Some(limit) = limit {
            plan = plan.limit(limit);
        }
        self.assign_query(conn, name, plan)
    }

    /// Create view `name` from a query plan, adding AutoAggregate output
    /// when the plan groups without aggregates
    pub fn assign_query(&self, conn: &Connection, name: &str, plan: QueryPlan) -> Result<()> {
        validate_name(name)?;
        let source = plan
            .scan_name()
            .ok_or(stratum_ir::PlanError::MissingScan)?
            .to_string();
        let kind = self.kind_of_required(conn, &source)?;

        let plan = if plan.needs_aggregates() {
            let schema = self.dialect.schema_of(conn, &source)?;
            let group = plan.group_columns().unwrap_or_default().to_vec();
            let aggregates = stratum_props::auto_aggregates(&kind, &schema, &group);
            debug!(plan = %plan.fingerprint(), aggregates = aggregates.len(), "auto aggregates");
            plan.with_aggregates(aggregates)
        } else {
            plan
        };

        let mut select = plan.render_inline(self.dialect.as_sql_dialect())?;
        if source == name {
            // A view cannot read itself; read its current definition instead
            let from = format!("FROM {}", quote_ident(&source));
            let inlined = format!("FROM {}", self.source_ref(conn, &source, name)?);
            select = select.replacen(&from, &inlined, 1);
        }
        self.create_view(conn, name, &select, &kind, &[source.as_str()])
    }

    /// Keep `name` readable after its rows were rewritten: re-create the
    /// view verbatim, or create an extract over `query_id` if it is not a
    /// view yet
    pub fn refresh_keyed(
        &self,
        conn: &Connection,
        name: &str,
        kind: &str,
        query_id: &str,
    ) -> Result<()> {
        match self.dialect.get_view_definition(conn, name)? {
            Some(definition) => {
                let kind = self
                    .registry
                    .kind_of(conn, name)?
                    .unwrap_or_else(|| kind.to_string());
                self.dialect.create_view(conn, name, &definition)?;
                self.registry.register(conn, name, &kind)?;
                info!(view = %name, "view re-created");
                Ok(())
            }
            None => self.extract(conn, name, kind, kind, None, Some(query_id)),
        }
    }

    /// Replace whatever `name` is with a table holding exactly `rows`
    pub fn materialize(
        &self,
        conn: &Connection,
        store: &TypedTableStore,
        name: &str,
        rows: &[Record],
    ) -> Result<()> {
        validate_name(name)?;
        if self.is_kind_table(conn, name)? {
            return Err(StorageError::InvalidName(format!(
                "'{}' is a kind table",
                name
            )));
        }

        let kind = match self.registry.kind_of(conn, name)? {
            Some(kind) => kind,
            None => rows
                .iter()
                .find_map(|r| r.kind().map(str::to_string))
                .unwrap_or_default(),
        };

        let mut schema: Vec<Column> = Vec::new();
        for row in rows {
            for (field, value) in row.iter() {
                if !schema.iter().any(|c| c.name == field) {
                    schema.push(Column::new(field, ColumnType::infer(field, value)));
                }
            }
        }
        if schema.is_empty() {
            return Err(StorageError::InvalidObject(format!(
                "no rows to materialize into '{}'",
                name
            )));
        }

        self.dialect.drop_object(conn, name)?;
        store.ensure_table(conn, name, &schema)?;
        for row in rows {
            store.upsert(conn, name, row, None, WriteMode::Replace)?;
        }
        self.registry.register(conn, name, &kind)?;
        self.rebind_dependents(conn, name)?;
        info!(table = %name, rows = rows.len(), "view materialized");
        Ok(())
    }

    /// Drop a view or materialized table; kind tables are refused.
    ///
    /// Views reading from `name` are left in place and fail when read.
    pub fn remove_view(&self, conn: &Connection, name: &str) -> Result<()> {
        validate_name(name)?;
        if self.is_kind_table(conn, name)? {
            return Err(StorageError::InvalidName(format!(
                "'{}' is a kind table",
                name
            )));
        }
        self.dialect.drop_object(conn, name)?;
        self.registry.unregister(conn, name)?;
        info!(view = %name, "view removed");
        Ok(())
    }

    /// Move `old` to `new`, replacing anything already called `new`
    pub fn rename_view(&self, conn: &Connection, old: &str, new: &str) -> Result<()> {
        validate_name(old)?;
        validate_name(new)?;
        let kind = self
            .registry
            .kind_of(conn, old)?
            .ok_or_else(|| StorageError::NotFound(old.to_string()))?;
        if old == new {
            return Ok(());
        }
        if self.is_kind_table(conn, old)? || self.is_kind_table(conn, new)? {
            return Err(StorageError::InvalidName(format!(
                "cannot rename '{}' to '{}': kind tables keep their names",
                old, new
            )));
        }

        let appdata = self.registry.get_appdata(conn, old)?;
        self.dialect.drop_object(conn, new)?;
        self.registry.unregister(conn, new)?;

        match self.dialect.get_view_definition(conn, old)? {
            Some(definition) => {
                let definition = rename_references(&definition, old, new);
                self.dialect.drop_object(conn, old)?;
                self.dialect.create_view(conn, new, &definition)?;
            }
            None => {
                let sql = format!(
                    "ALTER TABLE {} RENAME TO {}",
                    quote_ident(old),
                    quote_ident(new)
                );
                debug!(sql = %sql, "rename table");
                conn.execute_batch(&sql)?;
            }
        }

        self.registry.register(conn, new, &kind)?;
        if let Some(appdata) = appdata {
            self.registry.set_appdata(conn, new, &appdata)?;
        }
        self.registry.unregister(conn, old)?;
        info!(old = %old, new = %new, "view renamed");
        Ok(())
    }

    /// Re-create every view reading from `name`, directly or through other
    /// views, so it is bound to `name`'s current columns. Returns how many
    /// views were re-created.
    ///
    /// Views reading a name that no longer exists are left dangling.
    pub fn rebind_dependents(&self, conn: &Connection, name: &str) -> Result<usize> {
        let existing = self.dialect.list_tables(conn)?;
        let exists =
            |n: &str| n.starts_with(RESERVED_PREFIX) || existing.iter().any(|e| e == n);

        let mut defined = Vec::new();
        for view in self.registry.list_names(conn)? {
            if let Some(definition) = self.dialect.get_view_definition(conn, &view)? {
                let reads = referenced_names(&definition);
                defined.push(ViewDef {
                    name: view,
                    definition,
                    reads,
                });
            }
        }

        let mut broken: Vec<&str> = Vec::new();
        loop {
            let found = defined.iter().find(|v| {
                !broken.contains(&v.name.as_str())
                    && v.reads.iter().any(|r| !exists(r) || broken.contains(&r.as_str()))
            });
            match found {
                Some(view) => broken.push(&view.name),
                None => break,
            }
        }

        let mut reached: Vec<&str> = vec![name];
        loop {
            let found = defined.iter().find(|v| {
                !reached.contains(&v.name.as_str())
                    && !broken.contains(&v.name.as_str())
                    && v.reads.iter().any(|r| reached.contains(&r.as_str()))
            });
            match found {
                Some(view) => reached.push(&view.name),
                None => break,
            }
        }
        let affected: Vec<&ViewDef> = defined
            .iter()
            .filter(|v| reached[1..].contains(&v.name.as_str()))
            .collect();

        // a view is re-created only after every affected view it reads
        let mut done: Vec<&str> = Vec::new();
        while done.len() < affected.len() {
            let next = affected.iter().find(|v| {
                !done.contains(&v.name.as_str())
                    && v.reads.iter().all(|r| {
                        done.contains(&r.as_str()) || !affected.iter().any(|a| &a.name == r)
                    })
            });
            let Some(view) = next else { break };
            self.dialect.create_view(conn, &view.name, &view.definition)?;
            done.push(&view.name);
        }
        if !done.is_empty() {
            debug!(source = %name, views = ?done, "views rebound");
        }
        Ok(done.len())
    }

    fn kind_of_required(&self, conn: &Connection, name: &str) -> Result<String> {
        self.registry
            .kind_of(conn, name)?
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    /// SELECT text producing the rows of `name`
    fn source_definition(&self, conn: &Connection, name: &str) -> Result<String> {
        self.kind_of_required(conn, name)?;
        Ok(match self.dialect.get_view_definition(conn, name)? {
            Some(definition) => definition,
            None => format!("SELECT * FROM {}", quote_ident(name)),
        })
    }

    /// FROM-clause reference to `source`, inlined when it is the view being
    /// defined
    fn source_ref(&self, conn: &Connection, source: &str, target: &str) -> Result<String> {
        if source == target {
            if let Some(definition) = self.dialect.get_view_definition(conn, source)? {
                return Ok(format!("({})", definition));
            }
        }
        Ok(quote_ident(source))
    }

    fn predicate(&self, pattern: &str, kind: &str, schema: &[Column]) -> Result<String> {
        let expr = self.compiler.compile(pattern, kind)?;
        for column in expr.columns() {
            require_column(schema, column, column)?;
        }
        Ok(expr.to_sql_inline(self.dialect.as_sql_dialect()))
    }
}

fn require_column(schema: &[Column], column: &str, reference: &str) -> Result<()> {
    if schema.iter().any(|c| c.name == column) {
        Ok(())
    } else {
        Err(StorageError::InvalidAttr(reference.to_string()))
    }
}

struct ViewDef {
    name: String,
    definition: String,
    reads: Vec<String>,
}

/// A piece of SQL text as far as name references are concerned
struct Token {
    raw: String,
    /// Unquoted value of a quoted or bare identifier
    ident: Option<String>,
    quoted: bool,
    /// Directly follows FROM or JOIN
    source: bool,
}

fn tokenize(sql: &str) -> Vec<Token> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut last_word = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let source =
            last_word.eq_ignore_ascii_case("FROM") || last_word.eq_ignore_ascii_case("JOIN");
        if c == '\'' || c == '"' {
            let start = i;
            i += 1;
            let mut content = String::new();
            while i < chars.len() {
                if chars[i] == c {
                    if i + 1 < chars.len() && chars[i + 1] == c {
                        content.push(c);
                        i += 2;
                        continue;
                    }
                    break;
                }
                content.push(chars[i]);
                i += 1;
            }
            i = (i + 1).min(chars.len());
            let quoted = c == '"';
            tokens.push(Token {
                raw: chars[start..i].iter().collect(),
                ident: quoted.then_some(content),
                quoted,
                source: quoted && source,
            });
            last_word.clear();
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            tokens.push(Token {
                raw: word.clone(),
                ident: Some(word.clone()),
                quoted: false,
                source,
            });
            last_word = word;
        } else {
            if !c.is_whitespace() {
                last_word.clear();
            }
            tokens.push(Token {
                raw: c.to_string(),
                ident: None,
                quoted: false,
                source: false,
            });
            i += 1;
        }
    }
    tokens
}

/// Replace table references to `old` with `new` in SQL text.
///
/// Quoted identifiers equal to `old` are always replaced; bare ones only
/// directly after `FROM` or `JOIN`. String literals are left untouched.
pub fn rename_references(sql: &str, old: &str, new: &str) -> String {
    tokenize(sql)
        .into_iter()
        .map(|token| match &token.ident {
            Some(name) if name == old && (token.quoted || token.source) => quote_ident(new),
            _ => token.raw,
        })
        .collect()
}

/// Names read by `sql` in its FROM and JOIN clauses
pub fn referenced_names(sql: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for token in tokenize(sql) {
        if let (true, Some(name)) = (token.source, token.ident) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reassignment_split() {
        let mut keyed = Record::new();
        keyed.insert("id", "host--1");
        assert!(matches!(
            Reassignment::from_records(vec![keyed.clone()]),
            Ok(Reassignment::Keyed(_))
        ));

        let mut row = Record::new();
        row.insert("name", "bash");
        assert!(matches!(
            Reassignment::from_records(vec![row.clone()]),
            Ok(Reassignment::Aggregate(_))
        ));
        assert!(matches!(
            Reassignment::from_records(vec![]),
            Ok(Reassignment::Aggregate(_))
        ));

        for mixed in [vec![keyed.clone(), row.clone()], vec![row, keyed]] {
            assert!(matches!(
                Reassignment::from_records(mixed),
                Err(StorageError::InvalidObject(_))
            ));
        }
    }

    #[test]
    fn test_rename_references() {
        assert_eq!(
            rename_references("SELECT * FROM \"a-b\" WHERE x = 'a-b'", "a-b", "c"),
            "SELECT * FROM \"c\" WHERE x = 'a-b'"
        );
        assert_eq!(
            rename_references("SELECT conns.x FROM conns JOIN other ON 1", "conns", "flows"),
            "SELECT conns.x FROM \"flows\" JOIN other ON 1"
        );
        assert_eq!(
            rename_references("SELECT \"it\"\"s\" FROM t", "it\"s", "u"),
            "SELECT \"u\" FROM t"
        );
    }

    #[test]
    fn test_referenced_names() {
        let sql = "SELECT * FROM \"ipv4-addr\" WHERE \"id\" IN \
                   (SELECT natural_id FROM __queries WHERE query_id = 'FROM x') \
                   UNION BY NAME SELECT * FROM (SELECT * FROM conns) AS tmp JOIN \"ipv4-addr\" ON 1";
        assert_eq!(
            referenced_names(sql),
            vec!["ipv4-addr".to_string(), "__queries".to_string(), "conns".to_string()]
        );
    }
}
