//! AST types for observation patterns

/// `kind:property`
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectPath {
    pub kind: String,
    pub property: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Test {
    Compare(Comparator, Literal),
    In(Vec<Literal>),
    Like(String),
    Matches(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub path: ObjectPath,
    pub negated: bool,
    pub test: Test,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PatternExpr {
    And(Vec<PatternExpr>),
    Or(Vec<PatternExpr>),
    Comparison(Comparison),
}

impl PatternExpr {
    /// Every object path referenced by the pattern
    pub fn paths(&self) -> Vec<&ObjectPath> {
        match self {
            PatternExpr::And(items) | PatternExpr::Or(items) => {
                items.iter().flat_map(PatternExpr::paths).collect()
            }
            PatternExpr::Comparison(c) => vec![&c.path],
        }
    }
}
