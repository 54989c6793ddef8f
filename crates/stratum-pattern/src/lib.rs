//! Observation pattern language
//!
//! Parses bracketed patterns such as
//! `[network-traffic:dst_port > 1024 AND network-traffic:src_ref.value = '10.0.0.1']`
//! and compiles them into `stratum_ir::Expr` predicates over a single kind.

pub mod ast;
pub mod parser;
pub mod to_ir;

use stratum_ir::{Expr, PatternCompiler, PatternError};

pub use parser::{parse, ParseError};
pub use to_ir::to_expr;

/// Default `PatternCompiler` for observation patterns
#[derive(Debug, Default, Clone, Copy)]
pub struct ObservationPatternCompiler;

impl ObservationPatternCompiler {
    pub fn new() -> Self {
        Self
    }
}

impl PatternCompiler for ObservationPatternCompiler {
    fn compile(&self, pattern: &str, kind: &str) -> Result<Expr, PatternError> {
        let ast = parse(pattern).map_err(|e| PatternError::new(pattern, e.to_string()))?;
        Ok(to_expr(&ast, kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_through_trait() {
        let compiler: &dyn PatternCompiler = &ObservationPatternCompiler::new();
        let expr = compiler
            .compile("[url:value LIKE '%.example.com/%']", "url")
            .unwrap();
        assert_eq!(expr.columns(), vec!["value"]);
    }

    #[test]
    fn test_syntax_error_carries_pattern() {
        let err = ObservationPatternCompiler
            .compile("[url:value ~ 'x']", "url")
            .unwrap_err();
        assert_eq!(err.pattern, "[url:value ~ 'x']");
        assert!(err.to_string().starts_with("Invalid pattern"));
    }
}
