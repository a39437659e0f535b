use ahash::AHashMap;
use thiserror::Error;

use crate::domain::RuleContext;

use super::parser::{BinOp, Expr, Func, UnaryOp};

/// Runtime failure while evaluating a compiled expression.
///
/// These are per-rule, per-request: the engine logs them and skips the
/// rule for that request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("unknown variable {0:?}")]
    UnknownVariable(String),

    #[error("type mismatch in {op}: {detail}")]
    TypeMismatch { op: &'static str, detail: String },

    #[error("expression yielded a string, expected a number")]
    NonNumericResult,
}

/// Runtime value: a real number or a borrowed string.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value<'a> {
    Num(f64),
    Str(&'a str),
}

impl Value<'_> {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Num(_) => "number",
            Value::Str(_) => "string",
        }
    }

    fn as_num(&self, op: &'static str) -> Result<f64, EvalError> {
        match self {
            Value::Num(n) => Ok(*n),
            Value::Str(_) => Err(EvalError::TypeMismatch {
                op,
                detail: "expected a number, found a string".to_string(),
            }),
        }
    }

    fn as_str(&self, op: &'static str) -> Result<&str, EvalError> {
        match self {
            Value::Str(s) => Ok(s),
            Value::Num(_) => Err(EvalError::TypeMismatch {
                op,
                detail: "expected a string, found a number".to_string(),
            }),
        }
    }

    #[inline]
    fn truthy(&self, op: &'static str) -> Result<bool, EvalError> {
        Ok(self.as_num(op)? != 0.0)
    }
}

#[inline]
fn bool_value(b: bool) -> Value<'static> {
    Value::Num(if b { 1.0 } else { 0.0 })
}

/// Per-request variable bindings for expression evaluation.
///
/// Built from the [`RuleContext`] immediately before a worker's
/// evaluations; borrows the context's strings, so its lifetime is
/// bounded by that request. Never shared across workers.
pub struct SymbolTable<'a> {
    vars: AHashMap<&'static str, Value<'a>>,
}

impl<'a> SymbolTable<'a> {
    /// Bind the full variable surface from a rule context.
    pub fn from_context(ctx: &'a RuleContext) -> Self {
        let mut vars = AHashMap::with_capacity(18);

        vars.insert("amount", Value::Num(ctx.amount));
        vars.insert("currency", Value::Str(&ctx.currency));
        vars.insert("merchant_id", Value::Str(&ctx.merchant_id));
        vars.insert("merchant_category", Value::Num(ctx.merchant_category));
        vars.insert("pos_entry_mode", Value::Str(&ctx.pos_entry_mode));

        vars.insert("card_token", Value::Str(&ctx.card_token));
        vars.insert("issuer_country", Value::Str(&ctx.issuer_country));
        vars.insert("card_brand", Value::Str(&ctx.card_brand));

        vars.insert("ip_address", Value::Str(&ctx.ip_address));
        vars.insert("device_fingerprint", Value::Str(&ctx.device_fingerprint));
        vars.insert("user_agent", Value::Str(&ctx.user_agent));

        vars.insert("customer_id", Value::Str(&ctx.customer_id));
        vars.insert("customer_risk_score", Value::Num(ctx.customer_risk_score));
        vars.insert("account_age_days", Value::Num(ctx.account_age_days));

        vars.insert("merchant_risk", Value::Num(ctx.merchant_risk));
        vars.insert("hourly_count", Value::Num(ctx.hourly_count));
        vars.insert("amount_sum", Value::Num(ctx.amount_sum));
        vars.insert("ip_blacklist_match", Value::Num(ctx.ip_blacklist_match));

        SymbolTable { vars }
    }

    #[cfg(test)]
    pub(crate) fn empty() -> Self {
        SymbolTable {
            vars: AHashMap::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn bind(&mut self, name: &'static str, value: Value<'a>) {
        self.vars.insert(name, value);
    }

    fn lookup(&self, name: &str) -> Result<Value<'a>, EvalError> {
        self.vars
            .get(name)
            .copied()
            .ok_or_else(|| EvalError::UnknownVariable(name.to_string()))
    }
}

/// Evaluate an expression against a symbol table.
pub fn eval<'a>(expr: &'a Expr, symbols: &SymbolTable<'a>) -> Result<Value<'a>, EvalError> {
    match expr {
        Expr::Number(n) => Ok(Value::Num(*n)),
        Expr::Str(s) => Ok(Value::Str(s.as_str())),
        Expr::Var(name) => symbols.lookup(name),
        Expr::Unary(op, operand) => {
            let value = eval(operand, symbols)?;
            match op {
                UnaryOp::Neg => Ok(Value::Num(-value.as_num("negation")?)),
                UnaryOp::Not => Ok(bool_value(!value.truthy("not")?)),
            }
        }
        Expr::Binary(op, lhs, rhs) => eval_binary(*op, lhs, rhs, symbols),
        Expr::Call(func, args) => eval_call(*func, args, symbols),
    }
}

fn eval_binary<'a>(
    op: BinOp,
    lhs: &'a Expr,
    rhs: &'a Expr,
    symbols: &SymbolTable<'a>,
) -> Result<Value<'a>, EvalError> {
    // Logical operators short-circuit; everything else is strict.
    match op {
        BinOp::And => {
            if !eval(lhs, symbols)?.truthy("and")? {
                return Ok(bool_value(false));
            }
            return Ok(bool_value(eval(rhs, symbols)?.truthy("and")?));
        }
        BinOp::Or => {
            if eval(lhs, symbols)?.truthy("or")? {
                return Ok(bool_value(true));
            }
            return Ok(bool_value(eval(rhs, symbols)?.truthy("or")?));
        }
        _ => {}
    }

    let left = eval(lhs, symbols)?;
    let right = eval(rhs, symbols)?;

    match op {
        BinOp::Add => Ok(Value::Num(left.as_num("+")? + right.as_num("+")?)),
        BinOp::Sub => Ok(Value::Num(left.as_num("-")? - right.as_num("-")?)),
        BinOp::Mul => Ok(Value::Num(left.as_num("*")? * right.as_num("*")?)),
        BinOp::Div => Ok(Value::Num(left.as_num("/")? / right.as_num("/")?)),
        BinOp::Rem => Ok(Value::Num(left.as_num("%")? % right.as_num("%")?)),
        BinOp::Lt => Ok(bool_value(left.as_num("<")? < right.as_num("<")?)),
        BinOp::Le => Ok(bool_value(left.as_num("<=")? <= right.as_num("<=")?)),
        BinOp::Gt => Ok(bool_value(left.as_num(">")? > right.as_num(">")?)),
        BinOp::Ge => Ok(bool_value(left.as_num(">=")? >= right.as_num(">=")?)),
        BinOp::Eq => eval_equality(left, right, false),
        BinOp::Ne => eval_equality(left, right, true),
        BinOp::And | BinOp::Or => unreachable!("handled above"),
    }
}

/// Equality works within a type; comparing a number to a string is a
/// type error rather than silently false.
fn eval_equality<'a>(
    left: Value<'a>,
    right: Value<'a>,
    negate: bool,
) -> Result<Value<'a>, EvalError> {
    let equal = match (left, right) {
        (Value::Num(a), Value::Num(b)) => a == b,
        (Value::Str(a), Value::Str(b)) => a == b,
        (a, b) => {
            return Err(EvalError::TypeMismatch {
                op: "==",
                detail: format!("cannot compare {} with {}", a.type_name(), b.type_name()),
            })
        }
    };
    Ok(bool_value(equal != negate))
}

fn eval_call<'a>(
    func: Func,
    args: &'a [Expr],
    symbols: &SymbolTable<'a>,
) -> Result<Value<'a>, EvalError> {
    match func {
        Func::Contains => {
            let haystack = eval(&args[0], symbols)?;
            let needle = eval(&args[1], symbols)?;
            Ok(bool_value(
                haystack
                    .as_str("contains")?
                    .contains(needle.as_str("contains")?),
            ))
        }
        Func::StartsWith => {
            let haystack = eval(&args[0], symbols)?;
            let prefix = eval(&args[1], symbols)?;
            Ok(bool_value(
                haystack
                    .as_str("starts_with")?
                    .starts_with(prefix.as_str("starts_with")?),
            ))
        }
        Func::EndsWith => {
            let haystack = eval(&args[0], symbols)?;
            let suffix = eval(&args[1], symbols)?;
            Ok(bool_value(
                haystack
                    .as_str("ends_with")?
                    .ends_with(suffix.as_str("ends_with")?),
            ))
        }
        Func::Min => {
            let a = eval(&args[0], symbols)?.as_num("min")?;
            let b = eval(&args[1], symbols)?.as_num("min")?;
            Ok(Value::Num(a.min(b)))
        }
        Func::Max => {
            let a = eval(&args[0], symbols)?.as_num("max")?;
            let b = eval(&args[1], symbols)?.as_num("max")?;
            Ok(Value::Num(a.max(b)))
        }
        Func::Abs => {
            let a = eval(&args[0], symbols)?.as_num("abs")?;
            Ok(Value::Num(a.abs()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::lexer::tokenize;
    use super::super::parser::Parser;
    use super::*;

    fn eval_str<'a>(source: &str, symbols: &SymbolTable<'a>) -> Result<f64, EvalError> {
        let expr = Parser::parse(tokenize(source).unwrap()).unwrap();
        match eval(&expr, symbols) {
            Ok(Value::Num(n)) => Ok(n),
            Ok(Value::Str(_)) => Err(EvalError::NonNumericResult),
            Err(e) => Err(e),
        }
    }

    #[test]
    fn test_arithmetic() {
        let symbols = SymbolTable::empty();
        assert_eq!(eval_str("1 + 2 * 3", &symbols).unwrap(), 7.0);
        assert_eq!(eval_str("(1 + 2) * 3", &symbols).unwrap(), 9.0);
        assert_eq!(eval_str("10 / 4", &symbols).unwrap(), 2.5);
        assert_eq!(eval_str("10 % 3", &symbols).unwrap(), 1.0);
        assert_eq!(eval_str("-5 + 3", &symbols).unwrap(), -2.0);
    }

    #[test]
    fn test_variables() {
        let mut symbols = SymbolTable::empty();
        symbols.bind("amount", Value::Num(1500.0));
        symbols.bind("currency", Value::Str("EUR"));

        assert_eq!(eval_str("amount > 1000", &symbols).unwrap(), 1.0);
        assert_eq!(eval_str("amount > 2000", &symbols).unwrap(), 0.0);
        assert_eq!(eval_str("currency == 'EUR'", &symbols).unwrap(), 1.0);
        assert_eq!(eval_str("currency != 'USD'", &symbols).unwrap(), 1.0);
    }

    #[test]
    fn test_unknown_variable() {
        let symbols = SymbolTable::empty();
        assert_eq!(
            eval_str("nope + 1", &symbols),
            Err(EvalError::UnknownVariable("nope".to_string()))
        );
    }

    #[test]
    fn test_logic_short_circuit() {
        let mut symbols = SymbolTable::empty();
        symbols.bind("a", Value::Num(0.0));

        // rhs references an unknown variable but is never evaluated
        assert_eq!(eval_str("a && missing > 1", &symbols).unwrap(), 0.0);
        symbols.bind("a", Value::Num(1.0));
        assert_eq!(eval_str("a || missing > 1", &symbols).unwrap(), 1.0);
    }

    #[test]
    fn test_string_functions() {
        let mut symbols = SymbolTable::empty();
        symbols.bind("user_agent", Value::Str("curl/8.0 (x86_64)"));

        assert_eq!(
            eval_str("contains(user_agent, 'curl')", &symbols).unwrap(),
            1.0
        );
        assert_eq!(
            eval_str("starts_with(user_agent, 'curl/')", &symbols).unwrap(),
            1.0
        );
        assert_eq!(
            eval_str("ends_with(user_agent, ')')", &symbols).unwrap(),
            1.0
        );
        assert_eq!(
            eval_str("contains(user_agent, 'Mozilla')", &symbols).unwrap(),
            0.0
        );
    }

    #[test]
    fn test_numeric_functions() {
        let symbols = SymbolTable::empty();
        assert_eq!(eval_str("min(3, 7)", &symbols).unwrap(), 3.0);
        assert_eq!(eval_str("max(3, 7)", &symbols).unwrap(), 7.0);
        assert_eq!(eval_str("abs(0 - 4)", &symbols).unwrap(), 4.0);
    }

    #[test]
    fn test_type_mismatch() {
        let mut symbols = SymbolTable::empty();
        symbols.bind("currency", Value::Str("USD"));

        assert!(matches!(
            eval_str("currency + 1", &symbols),
            Err(EvalError::TypeMismatch { .. })
        ));
        assert!(matches!(
            eval_str("currency == 3", &symbols),
            Err(EvalError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_full_context_binding() {
        use crate::domain::request::tests::sample_request;
        use crate::domain::RuleContext;

        let req = sample_request();
        let ctx = RuleContext::from_request(&req);
        let symbols = SymbolTable::from_context(&ctx);

        assert_eq!(eval_str("amount", &symbols).unwrap(), 100.0);
        assert_eq!(eval_str("merchant_category", &symbols).unwrap(), 5411.0);
        assert_eq!(eval_str("customer_risk_score", &symbols).unwrap(), 25.0);
        assert_eq!(eval_str("ip_blacklist_match", &symbols).unwrap(), 0.0);
        assert_eq!(eval_str("currency == 'USD'", &symbols).unwrap(), 1.0);
        assert_eq!(eval_str("issuer_country == 'US'", &symbols).unwrap(), 1.0);
        assert_eq!(
            eval_str("amount_sum == amount && hourly_count == 1", &symbols).unwrap(),
            1.0
        );
    }
}
