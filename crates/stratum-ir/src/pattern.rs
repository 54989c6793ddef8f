//! Boundary between the engine and pattern compilers

use thiserror::Error;

use crate::Expr;

/// A filter pattern could not be compiled
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid pattern '{pattern}': {message}")]
pub struct PatternError {
    pub pattern: String,
    pub message: String,
}

impl PatternError {
    pub fn new(pattern: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            message: message.into(),
        }
    }
}

/// Turns a domain filter pattern into a boolean expression over one kind
pub trait PatternCompiler: Send + Sync {
    fn compile(&self, pattern: &str, kind: &str) -> Result<Expr, PatternError>;
}
