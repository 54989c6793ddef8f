//! Lowering of query plans and expressions to SQL text
//!
//! The dialect supplies the backend-specific fragments (placeholders, scalar
//! MIN/MAX, ifnull, regex matching). Everything else is plain SQL.

use thiserror::Error;

use crate::{AggFunc, Aggregate, Expr, QueryPlan, SortKey, Stage, Value};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("Query plan must start with a Scan stage")]
    MissingScan,

    #[error("Query plan has more than one Group stage")]
    MultipleGroups,

    #[error("Unsupported Scan at stage {0}: only one source per plan")]
    UnexpectedScan(usize),

    #[error("Empty column list in {0} stage")]
    EmptyColumns(&'static str),
}

/// Backend-specific SQL fragments
pub trait SqlDialect {
    /// Positional parameter marker; `index` is 1-based
    fn placeholder(&self, index: usize) -> String;

    /// Two-argument scalar minimum (`MIN` on SQLite, `LEAST` elsewhere)
    fn text_min(&self) -> &str;

    /// Two-argument scalar maximum
    fn text_max(&self) -> &str;

    /// Function returning its first non-null argument
    fn ifnull(&self) -> &str;

    /// Boolean regex match of `expr` against `regex` (both already rendered)
    fn regex_match(&self, expr: &str, regex: &str) -> String {
        format!("({} REGEXP {})", expr, regex)
    }
}

/// Rendered SQL with its positional parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Double-quote an identifier
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Single-quote a string literal
pub fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// SQL literal text for a value; arrays are stored as JSON text
pub fn inline_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) if f.is_finite() => format!("{:?}", f),
        Value::Float(f) => quote_literal(&f.to_string()),
        Value::String(s) => quote_literal(s),
        Value::Array(_) => quote_literal(&value.to_json().to_string()),
    }
}

struct SqlWriter<'d> {
    dialect: &'d dyn SqlDialect,
    // None renders literals inline
    params: Option<Vec<Value>>,
}

impl<'d> SqlWriter<'d> {
    fn value(&mut self, value: &Value) -> String {
        match self.params.as_mut() {
            Some(params) => {
                params.push(value.clone());
                self.dialect.placeholder(params.len())
            }
            None => inline_literal(value),
        }
    }

    fn expr(&mut self, expr: &Expr) -> String {
        match expr {
            Expr::Literal { value } => self.value(value),
            Expr::Column { name } => quote_ident(name),
            Expr::Compare { op, left, right } => {
                let l = self.expr(left);
                let r = self.expr(right);
                format!("({} {} {})", l, op.as_sql(), r)
            }
            Expr::And { exprs } => self.junction(exprs, "AND", "TRUE"),
            Expr::Or { exprs } => self.junction(exprs, "OR", "FALSE"),
            Expr::Not { expr } => format!("(NOT {})", self.expr(expr)),
            Expr::InSet { expr, set } => {
                if set.is_empty() {
                    return "FALSE".to_string();
                }
                let lhs = self.expr(expr);
                let items: Vec<String> = set.iter().map(|v| self.value(v)).collect();
                format!("({} IN ({}))", lhs, items.join(", "))
            }
            Expr::Like { expr, pattern } => {
                let lhs = self.expr(expr);
                let rhs = self.value(&Value::from(pattern.as_str()));
                format!("({} LIKE {})", lhs, rhs)
            }
            Expr::Matches { expr, regex } => {
                let lhs = self.expr(expr);
                let rhs = self.value(&Value::from(regex.as_str()));
                self.dialect.regex_match(&lhs, &rhs)
            }
            Expr::IsNull { expr } => format!("({} IS NULL)", self.expr(expr)),
        }
    }

    fn junction(&mut self, exprs: &[Expr], op: &str, empty: &str) -> String {
        match exprs {
            [] => empty.to_string(),
            [single] => self.expr(single),
            many => {
                let parts: Vec<String> = many.iter().map(|e| self.expr(e)).collect();
                let sep = format!(" {} ", op);
                format!("({})", parts.join(sep.as_str()))
            }
        }
    }
}

fn aggregate_sql(agg: &Aggregate) -> String {
    let arg = if agg.column == "*" {
        "*".to_string()
    } else {
        quote_ident(&agg.column)
    };
    let call = match agg.func {
        AggFunc::Min => format!("MIN({})", arg),
        AggFunc::Max => format!("MAX({})", arg),
        AggFunc::Sum => format!("SUM({})", arg),
        AggFunc::Avg => format!("AVG({})", arg),
        AggFunc::Count => format!("COUNT({})", arg),
        AggFunc::CountDistinct => format!("COUNT(DISTINCT {})", arg),
    };
    format!("{} AS {}", call, quote_ident(&agg.alias))
}

// Clause positions within one SELECT; a stage may only fill a clause at or
// after the last one filled, otherwise the SELECT so far becomes a subquery.
const WHERE: u8 = 1;
const SELECT_LIST: u8 = 2;
const ORDER: u8 = 3;
const LIMIT: u8 = 4;
const OFFSET: u8 = 5;

#[derive(Default)]
struct Select {
    from: String,
    filters: Vec<String>,
    projection: Option<Vec<String>>,
    group: Option<Vec<String>>,
    aggregates: Vec<Aggregate>,
    order: Vec<SortKey>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl Select {
    fn position(&self) -> u8 {
        if self.offset.is_some() {
            OFFSET
        } else if self.limit.is_some() {
            LIMIT
        } else if !self.order.is_empty() {
            ORDER
        } else if self.projection.is_some() || self.group.is_some() || !self.aggregates.is_empty() {
            SELECT_LIST
        } else if !self.filters.is_empty() {
            WHERE
        } else {
            0
        }
    }

    fn sql(&self) -> String {
        let columns = if self.group.is_some() || !self.aggregates.is_empty() {
            let mut cols: Vec<String> = self
                .group
                .iter()
                .flatten()
                .map(|c| quote_ident(c))
                .collect();
            cols.extend(self.aggregates.iter().map(aggregate_sql));
            cols.join(", ")
        } else if let Some(projection) = &self.projection {
            projection
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ")
        } else {
            "*".to_string()
        };

        let mut sql = format!("SELECT {} FROM {}", columns, self.from);
        if !self.filters.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.filters.join(" AND "));
        }
        if let Some(group) = &self.group {
            let cols: Vec<String> = group.iter().map(|c| quote_ident(c)).collect();
            sql.push_str(" GROUP BY ");
            sql.push_str(&cols.join(", "));
        }
        if !self.order.is_empty() {
            let keys: Vec<String> = self
                .order
                .iter()
                .map(|k| {
                    format!(
                        "{} {}",
                        quote_ident(&k.column),
                        if k.ascending { "ASC" } else { "DESC" }
                    )
                })
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&keys.join(", "));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        if let Some(offset) = self.offset {
            sql.push_str(&format!(" OFFSET {}", offset));
        }
        sql
    }
}

struct PlanRenderer {
    current: Select,
    depth: usize,
}

impl PlanRenderer {
    fn new(source: &str) -> Self {
        Self {
            current: Select {
                from: quote_ident(source),
                ..Default::default()
            },
            depth: 0,
        }
    }

    /// Turn the SELECT built so far into the FROM of a fresh one
    fn wrap(&mut self) {
        let inner = self.current.sql();
        self.current = Select {
            from: format!("({}) AS s{}", inner, self.depth),
            ..Default::default()
        };
        self.depth += 1;
    }

    fn wrap_if(&mut self, needed: bool) {
        if needed {
            self.wrap();
        }
    }
}

fn validate(plan: &QueryPlan) -> Result<&str, PlanError> {
    let stages = plan.stages();
    let source = match stages.first() {
        Some(Stage::Scan { name }) => name.as_str(),
        _ => return Err(PlanError::MissingScan),
    };

    let mut groups = 0;
    for (idx, stage) in stages.iter().enumerate().skip(1) {
        match stage {
            Stage::Scan { .. } => return Err(PlanError::UnexpectedScan(idx)),
            Stage::Group { columns } => {
                groups += 1;
                if groups > 1 {
                    return Err(PlanError::MultipleGroups);
                }
                if columns.is_empty() {
                    return Err(PlanError::EmptyColumns("Group"));
                }
            }
            Stage::Project { columns } if columns.is_empty() => {
                return Err(PlanError::EmptyColumns("Project"));
            }
            Stage::Aggregate { aggregates } if aggregates.is_empty() => {
                return Err(PlanError::EmptyColumns("Aggregate"));
            }
            Stage::Order { keys } if keys.is_empty() => {
                return Err(PlanError::EmptyColumns("Order"));
            }
            _ => {}
        }
    }
    Ok(source)
}

fn render_plan(plan: &QueryPlan, writer: &mut SqlWriter<'_>) -> Result<String, PlanError> {
    let source = validate(plan)?;
    let mut r = PlanRenderer::new(source);

    for stage in plan.stages().iter().skip(1) {
        match stage {
            Stage::Scan { .. } => {}
            Stage::Filter { condition } => {
                r.wrap_if(r.current.position() > WHERE);
                let cond = writer.expr(condition);
                r.current.filters.push(cond);
            }
            Stage::Project { columns } => {
                r.wrap_if(r.current.position() >= SELECT_LIST);
                r.current.projection = Some(columns.clone());
            }
            Stage::Group { columns } => {
                r.wrap_if(r.current.position() > SELECT_LIST || r.current.projection.is_some());
                r.current.group = Some(columns.clone());
            }
            Stage::Aggregate { aggregates } => {
                r.wrap_if(r.current.position() > SELECT_LIST || r.current.projection.is_some());
                r.current.aggregates.extend(aggregates.iter().cloned());
            }
            Stage::Order { keys } => {
                r.wrap_if(r.current.position() > ORDER);
                r.current.order.extend(keys.iter().cloned());
            }
            Stage::Limit { count } => {
                r.wrap_if(r.current.position() >= LIMIT);
                r.current.limit = Some(*count);
            }
            Stage::Offset { count } => {
                r.wrap_if(r.current.position() >= OFFSET);
                r.current.offset = Some(*count);
            }
        }
    }
    Ok(r.current.sql())
}

impl QueryPlan {
    /// Render to SQL with dialect placeholders and collected parameters
    pub fn render(&self, dialect: &dyn SqlDialect) -> Result<Rendered, PlanError> {
        let mut writer = SqlWriter {
            dialect,
            params: Some(Vec::new()),
        };
        let sql = render_plan(self, &mut writer)?;
        Ok(Rendered {
            sql,
            params: writer.params.unwrap_or_default(),
        })
    }

    /// Render to self-contained SQL (literals inlined), e.g. for view DDL
    pub fn render_inline(&self, dialect: &dyn SqlDialect) -> Result<String, PlanError> {
        let mut writer = SqlWriter {
            dialect,
            params: None,
        };
        render_plan(self, &mut writer)
    }
}

impl Expr {
    /// Render as a self-contained SQL boolean/scalar expression
    pub fn to_sql_inline(&self, dialect: &dyn SqlDialect) -> String {
        SqlWriter {
            dialect,
            params: None,
        }
        .expr(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CmpOp;

    struct Numbered;

    impl SqlDialect for Numbered {
        fn placeholder(&self, index: usize) -> String {
            format!("${}", index)
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
    }

    #[test]
    fn test_scan_only() {
        let rendered = QueryPlan::scan("host").render(&Numbered).unwrap();
        assert_eq!(rendered.sql, "SELECT * FROM \"host\"");
        assert!(rendered.params.is_empty());
    }

    #[test]
    fn test_filter_sort_limit() {
        let plan = QueryPlan::scan("conns")
            .filter(Expr::compare(
                CmpOp::Ge,
                Expr::column("dst_port"),
                Expr::literal(1024i64),
            ))
            .filter(Expr::equals("protocol", "tcp"))
            .order(vec![SortKey::desc("dst_port")])
            .limit(5)
            .offset(10);

        let rendered = plan.render(&Numbered).unwrap();

        assert_eq!(
            rendered.sql,
            "SELECT * FROM \"conns\" WHERE (\"dst_port\" >= $1) AND (\"protocol\" = $2) \
             ORDER BY \"dst_port\" DESC LIMIT 5 OFFSET 10"
        );
        assert_eq!(rendered.params, vec![Value::Int(1024), Value::from("tcp")]);
    }

    #[test]
    fn test_group_with_aggregates() {
        let plan = QueryPlan::scan("host")
            .group(["name"])
            .aggregate(vec![
                Aggregate::keep_name(AggFunc::Min, "type"),
                Aggregate::new(AggFunc::Count, "*", "total"),
            ]);

        let sql = plan.render_inline(&Numbered).unwrap();

        assert_eq!(
            sql,
            "SELECT \"name\", MIN(\"type\") AS \"type\", COUNT(*) AS \"total\" \
             FROM \"host\" GROUP BY \"name\""
        );
    }

    #[test]
    fn test_filter_after_group_nests() {
        let plan = QueryPlan::scan("host")
            .group(["name"])
            .aggregate(vec![Aggregate::keep_name(AggFunc::Sum, "number_observed")])
            .filter(Expr::compare(
                CmpOp::Gt,
                Expr::column("number_observed"),
                Expr::literal(2i64),
            ));

        let sql = plan.render_inline(&Numbered).unwrap();

        assert_eq!(
            sql,
            "SELECT * FROM (SELECT \"name\", SUM(\"number_observed\") AS \"number_observed\" \
             FROM \"host\" GROUP BY \"name\") AS s0 WHERE (\"number_observed\" > 2)"
        );
    }

    #[test]
    fn test_order_after_limit_nests() {
        let plan = QueryPlan::scan("host")
            .limit(3)
            .order(vec![SortKey::asc("name")]);

        let sql = plan.render_inline(&Numbered).unwrap();

        assert_eq!(
            sql,
            "SELECT * FROM (SELECT * FROM \"host\" LIMIT 3) AS s0 ORDER BY \"name\" ASC"
        );
    }

    #[test]
    fn test_plan_errors() {
        let no_scan = QueryPlan::from_stages(vec![Stage::Limit { count: 1 }]);
        assert_eq!(no_scan.render(&Numbered), Err(PlanError::MissingScan));

        let two_groups = QueryPlan::scan("host").group(["a"]).group(["b"]);
        assert_eq!(two_groups.render(&Numbered), Err(PlanError::MultipleGroups));

        let empty = QueryPlan::scan("host").project(Vec::<String>::new());
        assert_eq!(empty.render(&Numbered), Err(PlanError::EmptyColumns("Project")));
    }

    #[test]
    fn test_expr_rendering() {
        let expr = Expr::Or {
            exprs: vec![
                Expr::InSet {
                    expr: Box::new(Expr::column("value")),
                    set: vec![Value::from("a"), Value::from("it's")],
                },
                Expr::not(Expr::Like {
                    expr: Box::new(Expr::column("name")),
                    pattern: "%.exe".to_string(),
                }),
                Expr::Matches {
                    expr: Box::new(Expr::column("name")),
                    regex: "^cmd".to_string(),
                },
            ],
        };

        assert_eq!(
            expr.to_sql_inline(&Numbered),
            "((\"value\" IN ('a', 'it''s')) OR (NOT (\"name\" LIKE '%.exe')) OR (\"name\" REGEXP '^cmd'))"
        );
        assert_eq!(Expr::And { exprs: vec![] }.to_sql_inline(&Numbered), "TRUE");
        assert_eq!(
            Expr::InSet {
                expr: Box::new(Expr::column("x")),
                set: vec![]
            }
            .to_sql_inline(&Numbered),
            "FALSE"
        );
    }

    #[test]
    fn test_inline_literals() {
        assert_eq!(inline_literal(&Value::Null), "NULL");
        assert_eq!(inline_literal(&Value::Float(1.5)), "1.5");
        assert_eq!(
            inline_literal(&Value::Array(vec![Value::from("tcp")])),
            "'[\"tcp\"]'"
        );
        assert_eq!(quote_ident("src_ref.value"), "\"src_ref.value\"");
    }
}
