//! Stratum Intermediate Representation (IR)
//!
//! Records, typed expressions and query plans shared by every Stratum crate.
//! All plan types are deterministically serializable so a plan can be
//! fingerprinted, logged and replayed.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

mod pattern;
mod render;
mod types;

pub use pattern::{PatternCompiler, PatternError};
pub use render::{inline_literal, quote_ident, quote_literal, PlanError, Rendered, SqlDialect};
pub use types::*;

/// Scalar (or list) value stored in a record field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
}

impl Value {
    /// Convert a JSON value; objects nested inside arrays are kept as JSON text
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(_) => Value::String(value.to_string()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::json!(i),
            Value::Float(f) => serde_json::json!(f),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// A flat record: field name -> value
///
/// Nested JSON objects are flattened into dotted field names when a record
/// is built from JSON, so every field maps to exactly one column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(BTreeMap<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Build a record from a JSON object, flattening nested objects
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        let object = value.as_object()?;
        let mut record = Record::new();
        flatten_into(&mut record, None, object);
        record.normalize_key();
        Some(record)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(field.into(), value.into())
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    /// The `type` discriminator, if present and textual
    pub fn kind(&self) -> Option<&str> {
        self.get("type").and_then(Value::as_str)
    }

    /// The natural key, if present and textual
    pub fn id(&self) -> Option<&str> {
        self.get("id").and_then(Value::as_str)
    }

    /// Store a numeric or boolean `id` as text so it keys like a string id
    pub fn normalize_key(&mut self) {
        let text = match self.get("id") {
            Some(Value::Int(i)) => i.to_string(),
            Some(Value::Float(f)) => f.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => return,
        };
        self.insert("id", text);
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn flatten_into(
    record: &mut Record,
    prefix: Option<&str>,
    object: &serde_json::Map<String, serde_json::Value>,
) {
    for (key, value) in object {
        let name = match prefix {
            Some(p) => format!("{}.{}", p, key),
            None => key.clone(),
        };
        match value {
            serde_json::Value::Object(inner) => flatten_into(record, Some(&name), inner),
            other => {
                record.insert(name, Value::from_json(other));
            }
        }
    }
}

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "<>",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

/// Boolean/scalar expression tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Expr {
    Literal { value: Value },
    Column { name: String },
    Compare { op: CmpOp, left: Box<Expr>, right: Box<Expr> },
    And { exprs: Vec<Expr> },
    Or { exprs: Vec<Expr> },
    Not { expr: Box<Expr> },
    InSet { expr: Box<Expr>, set: Vec<Value> },
    Like { expr: Box<Expr>, pattern: String },
    Matches { expr: Box<Expr>, regex: String },
    IsNull { expr: Box<Expr> },
}

impl Expr {
    pub fn column(name: impl Into<String>) -> Self {
        Expr::Column { name: name.into() }
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        Expr::Literal { value: value.into() }
    }

    pub fn compare(op: CmpOp, left: Expr, right: Expr) -> Self {
        Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// `column = value`
    pub fn equals(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Expr::compare(CmpOp::Eq, Expr::column(column), Expr::literal(value))
    }

    pub fn not(expr: Expr) -> Self {
        Expr::Not { expr: Box::new(expr) }
    }

    /// Column names referenced anywhere in the expression
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Literal { .. } => {}
            Expr::Column { name } => out.push(name),
            Expr::Compare { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            Expr::And { exprs } | Expr::Or { exprs } => {
                for e in exprs {
                    e.collect_columns(out);
                }
            }
            Expr::Not { expr }
            | Expr::InSet { expr, .. }
            | Expr::Like { expr, .. }
            | Expr::Matches { expr, .. }
            | Expr::IsNull { expr } => expr.collect_columns(out),
        }
    }
}

/// Aggregate functions available to Group/Aggregate stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggFunc {
    Min,
    Max,
    Sum,
    Avg,
    Count,
    CountDistinct,
}

/// `func(column) AS alias`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregate {
    pub func: AggFunc,
    pub column: String,
    pub alias: String,
}

impl Aggregate {
    pub fn new(func: AggFunc, column: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            func,
            column: column.into(),
            alias: alias.into(),
        }
    }

    /// Aggregate whose output keeps the input column's name
    pub fn keep_name(func: AggFunc, column: impl Into<String>) -> Self {
        let column = column.into();
        Self {
            func,
            alias: column.clone(),
            column,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub column: String,
    #[serde(default = "default_ascending")]
    pub ascending: bool,
}

fn default_ascending() -> bool {
    true
}

impl SortKey {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: true,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: false,
        }
    }
}

/// One stage of a query plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage")]
pub enum Stage {
    Scan { name: String },
    Filter { condition: Expr },
    Project { columns: Vec<String> },
    Group { columns: Vec<String> },
    Aggregate { aggregates: Vec<Aggregate> },
    Order { keys: Vec<SortKey> },
    Limit { count: u64 },
    Offset { count: u64 },
}

/// Backend-agnostic query: an ordered list of stages starting with a Scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    stages: Vec<Stage>,
}

impl QueryPlan {
    /// Start a plan reading from table or view `name`
    pub fn scan(name: impl Into<String>) -> Self {
        Self {
            stages: vec![Stage::Scan { name: name.into() }],
        }
    }

    /// Build a plan from raw stages (validated at render time)
    pub fn from_stages(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    pub fn filter(self, condition: Expr) -> Self {
        self.append(Stage::Filter { condition })
    }

    pub fn project<S: Into<String>>(self, columns: impl IntoIterator<Item = S>) -> Self {
        self.append(Stage::Project {
            columns: columns.into_iter().map(Into::into).collect(),
        })
    }

    pub fn group<S: Into<String>>(self, columns: impl IntoIterator<Item = S>) -> Self {
        self.append(Stage::Group {
            columns: columns.into_iter().map(Into::into).collect(),
        })
    }

    pub fn aggregate(self, aggregates: Vec<Aggregate>) -> Self {
        self.append(Stage::Aggregate { aggregates })
    }

    pub fn order(self, keys: Vec<SortKey>) -> Self {
        self.append(Stage::Order { keys })
    }

    pub fn limit(self, count: u64) -> Self {
        self.append(Stage::Limit { count })
    }

    pub fn offset(self, count: u64) -> Self {
        self.append(Stage::Offset { count })
    }

    pub fn append(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Name read by the first Scan stage
    pub fn scan_name(&self) -> Option<&str> {
        self.stages.iter().find_map(|s| match s {
            Stage::Scan { name } => Some(name.as_str()),
            _ => None,
        })
    }

    /// Columns of the Group stage, if any
    pub fn group_columns(&self) -> Option<&[String]> {
        self.stages.iter().find_map(|s| match s {
            Stage::Group { columns } => Some(columns.as_slice()),
            _ => None,
        })
    }

    pub fn has_aggregate(&self) -> bool {
        self.stages
            .iter()
            .any(|s| matches!(s, Stage::Aggregate { .. }))
    }

    /// True when a Group stage has no Aggregate stage to go with it
    pub fn needs_aggregates(&self) -> bool {
        self.group_columns().is_some() && !self.has_aggregate()
    }

    /// Insert an Aggregate stage directly after the Group stage
    ///
    /// Without a Group stage the aggregates are appended at the end; an
    /// empty list leaves the plan as it is.
    pub fn with_aggregates(mut self, aggregates: Vec<Aggregate>) -> Self {
        if aggregates.is_empty() {
            return self;
        }
        let stage = Stage::Aggregate { aggregates };
        match self
            .stages
            .iter()
            .position(|s| matches!(s, Stage::Group { .. }))
        {
            Some(pos) => self.stages.insert(pos + 1, stage),
            None => self.stages.push(stage),
        }
        self
    }

    /// Calculate fingerprint (SHA-256) for deterministic caching
    pub fn fingerprint(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}
