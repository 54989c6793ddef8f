//! Convert pattern AST into a typed `stratum_ir::Expr` for one kind

use stratum_ir::{CmpOp, Expr, Value};

use crate::ast::*;

/// Compile a parsed pattern into a predicate over rows of `kind`.
///
/// Comparisons naming another kind can never hold for a row of `kind`, so
/// they become `FALSE` and fold away inside AND/OR.
pub fn to_expr(pattern: &PatternExpr, kind: &str) -> Expr {
    match pattern {
        PatternExpr::And(items) => {
            let mut exprs = Vec::with_capacity(items.len());
            for item in items {
                let expr = to_expr(item, kind);
                if is_false(&expr) {
                    return never();
                }
                exprs.push(expr);
            }
            Expr::And { exprs }
        }
        PatternExpr::Or(items) => {
            let exprs: Vec<Expr> = items
                .iter()
                .map(|item| to_expr(item, kind))
                .filter(|expr| !is_false(expr))
                .collect();
            match exprs.len() {
                0 => never(),
                1 => exprs.into_iter().next().unwrap_or_else(never),
                _ => Expr::Or { exprs },
            }
        }
        PatternExpr::Comparison(cmp) => convert_comparison(cmp, kind),
    }
}

fn convert_comparison(cmp: &Comparison, kind: &str) -> Expr {
    if cmp.path.kind != kind {
        return never();
    }

    let column = Box::new(Expr::column(cmp.path.property.clone()));
    let expr = match &cmp.test {
        Test::Compare(op, value) => Expr::Compare {
            op: convert_comparator(*op),
            left: column,
            right: Box::new(Expr::Literal {
                value: convert_literal(value),
            }),
        },
        Test::In(items) => Expr::InSet {
            expr: column,
            set: items.iter().map(convert_literal).collect(),
        },
        Test::Like(pattern) => Expr::Like {
            expr: column,
            pattern: pattern.clone(),
        },
        Test::Matches(regex) => Expr::Matches {
            expr: column,
            regex: regex.clone(),
        },
    };

    if cmp.negated {
        Expr::not(expr)
    } else {
        expr
    }
}

fn convert_comparator(op: Comparator) -> CmpOp {
    match op {
        Comparator::Eq => CmpOp::Eq,
        Comparator::Ne => CmpOp::Ne,
        Comparator::Lt => CmpOp::Lt,
        Comparator::Le => CmpOp::Le,
        Comparator::Gt => CmpOp::Gt,
        Comparator::Ge => CmpOp::Ge,
    }
}

fn convert_literal(lit: &Literal) -> Value {
    match lit {
        Literal::String(s) => Value::String(s.clone()),
        Literal::Int(i) => Value::Int(*i),
        Literal::Float(f) => Value::Float(*f),
        Literal::Bool(b) => Value::Bool(*b),
    }
}

fn never() -> Expr {
    Expr::Literal {
        value: Value::Bool(false),
    }
}

fn is_false(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::Literal {
            value: Value::Bool(false)
        }
    )
}
