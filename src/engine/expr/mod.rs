//! Rule expression language: arithmetic and boolean expressions over the
//! named variables of a [`RuleContext`](crate::domain::RuleContext).
//!
//! Expressions are compiled once into an AST and evaluated against a
//! per-request symbol table. The result is always a real number; rule
//! semantics treat values above 0.5 as triggered.

mod eval;
mod lexer;
mod parser;

pub use eval::{EvalError, SymbolTable, Value};
pub use parser::Expr;

use thiserror::Error;

/// Failure to compile an expression source string.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("compile error at offset {offset}: {message}")]
pub struct CompileError {
    pub offset: usize,
    pub message: String,
}

impl CompileError {
    fn new(offset: usize, message: impl Into<String>) -> Self {
        CompileError {
            offset,
            message: message.into(),
        }
    }
}

/// A compiled rule expression, ready for repeated evaluation.
///
/// Cheap to evaluate, immutable after compilation. Cached per worker by
/// the rule engine; never shared across workers.
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    ast: Expr,
}

impl CompiledExpr {
    /// Compile an expression source string.
    pub fn compile(source: &str) -> Result<Self, CompileError> {
        let tokens = lexer::tokenize(source)?;
        let ast = parser::Parser::parse(tokens)?;
        Ok(CompiledExpr { ast })
    }

    /// Evaluate to a number against the given symbol table.
    ///
    /// A string-valued result is a runtime error; rules must yield a
    /// real number.
    pub fn evaluate(&self, symbols: &SymbolTable<'_>) -> Result<f64, EvalError> {
        match eval::eval(&self.ast, symbols)? {
            Value::Num(n) => Ok(n),
            Value::Str(_) => Err(EvalError::NonNumericResult),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::request::tests::sample_request;
    use crate::domain::RuleContext;

    #[test]
    fn test_compile_and_evaluate() {
        let req = sample_request();
        let ctx = RuleContext::from_request(&req);
        let symbols = SymbolTable::from_context(&ctx);

        let expr = CompiledExpr::compile("amount > 50 && currency == 'USD'").unwrap();
        assert_eq!(expr.evaluate(&symbols).unwrap(), 1.0);

        let expr = CompiledExpr::compile("customer_risk_score / 100").unwrap();
        assert_eq!(expr.evaluate(&symbols).unwrap(), 0.25);
    }

    #[test]
    fn test_compile_error_has_position() {
        let err = CompiledExpr::compile("amount @ 5").unwrap_err();
        assert_eq!(err.offset, 7);
    }

    #[test]
    fn test_string_result_is_error() {
        let req = sample_request();
        let ctx = RuleContext::from_request(&req);
        let symbols = SymbolTable::from_context(&ctx);

        let expr = CompiledExpr::compile("currency").unwrap();
        assert_eq!(expr.evaluate(&symbols), Err(EvalError::NonNumericResult));
    }
}
