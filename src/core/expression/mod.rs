//! Expression evaluator
//!
//! Evaluates `$`-prefixed guard and mapping expressions against a read-only
//! variable snapshot. Expressions cannot call functions, loop or assign, so
//! evaluation is pure and may run on any thread.
//!
//! ```text
//! $item.v > 3
//! $retries < 5 and not $done
//! ${event_payload.code} == 0x10 || $event_name == "abort"
//! $samples[0] * 2.5
//! ```

use crate::core::value::{Value, Variables};
use pest::iterators::{Pair, Pairs};
use pest::pratt_parser::{Assoc, Op, PrattParser};
use pest::Parser;
use pest_derive::Parser as PestParser;
use std::cmp::Ordering;
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(PestParser)]
#[grammar = "core/expression/grammar.pest"]
struct ExpressionParser;

/// Marker that makes a string value an expression
pub const EXPRESSION_MARKER: char = '$';

/// Expression errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    /// Malformed expression text
    #[error("syntax error in `{expression}`: {message}")]
    Syntax {
        /// Offending expression
        expression: String,
        /// Parser diagnostic
        message: String,
    },

    /// Identifier not present in the environment
    #[error("unknown variable: ${0}")]
    UnknownVariable(String),

    /// Operator applied to unsupported operand types
    #[error("type error: {0}")]
    Type(String),

    /// Division or remainder by zero
    #[error("division by zero")]
    DivisionByZero,

    /// Integer arithmetic overflowed
    #[error("integer overflow")]
    Overflow,
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Arithmetic negation
    Neg,
    /// Boolean negation
    Not,
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `or` / `||`
    Or,
    /// `and` / `&&`
    And,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Rem,
}

/// Parsed expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Literal constant
    Literal(Value),
    /// Variable reference by dotted path
    Var(String),
    /// Unary operation
    Unary(UnaryOp, Box<Expr>),
    /// Binary operation
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// Postfix indexing `base[index]`
    Index(Box<Expr>, Box<Expr>),
}

fn pratt() -> &'static PrattParser<Rule> {
    static PRATT: OnceLock<PrattParser<Rule>> = OnceLock::new();
    PRATT.get_or_init(|| {
        PrattParser::new()
            .op(Op::infix(Rule::or_op, Assoc::Left))
            .op(Op::infix(Rule::and_op, Assoc::Left))
            .op(Op::infix(Rule::eq, Assoc::Left) | Op::infix(Rule::ne, Assoc::Left))
            .op(Op::infix(Rule::lt, Assoc::Left)
                | Op::infix(Rule::le, Assoc::Left)
                | Op::infix(Rule::gt, Assoc::Left)
                | Op::infix(Rule::ge, Assoc::Left))
            .op(Op::infix(Rule::add, Assoc::Left) | Op::infix(Rule::sub, Assoc::Left))
            .op(Op::infix(Rule::mul, Assoc::Left)
                | Op::infix(Rule::div, Assoc::Left)
                | Op::infix(Rule::rem, Assoc::Left))
            .op(Op::prefix(Rule::neg) | Op::prefix(Rule::not_op))
            .op(Op::postfix(Rule::index))
    })
}

/// Does this text contain the expression marker?
pub fn is_expression(text: &str) -> bool {
    text.contains(EXPRESSION_MARKER)
}

/// Parse expression text into a tree
pub fn parse(source: &str) -> Result<Expr, ExpressionError> {
    let mut pairs = ExpressionParser::parse(Rule::expression, source).map_err(|e| {
        ExpressionError::Syntax {
            expression: source.to_string(),
            message: e.variant.message().into_owned(),
        }
    })?;
    let expression = pairs.next().ok_or_else(|| ExpressionError::Syntax {
        expression: source.to_string(),
        message: "empty expression".to_string(),
    })?;
    let expr = expression
        .into_inner()
        .find(|p| p.as_rule() == Rule::expr)
        .ok_or_else(|| ExpressionError::Syntax {
            expression: source.to_string(),
            message: "empty expression".to_string(),
        })?;
    build(expr.into_inner())
}

/// Parse and evaluate `source` against `env`
pub fn evaluate(source: &str, env: &Variables) -> Result<Value, ExpressionError> {
    parse(source)?.eval(env)
}

fn placeholder() -> Option<&'static Regex> {
    static PLACEHOLDER: OnceLock<Option<Regex>> = OnceLock::new();
    PLACEHOLDER
        .get_or_init(|| Regex::new(r"\$\{[^}]*\}|\$[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*").ok())
        .as_ref()
}

/// Substitute each `$name` / `${path}` placeholder in free text with its value
pub fn interpolate(template: &str, env: &Variables) -> Result<String, ExpressionError> {
    let Some(re) = placeholder() else {
        return Ok(template.to_string());
    };
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for m in re.find_iter(template) {
        out.push_str(&template[last..m.start()]);
        out.push_str(&evaluate(m.as_str(), env)?.to_string());
        last = m.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

fn build(pairs: Pairs<'_, Rule>) -> Result<Expr, ExpressionError> {
    pratt()
        .map_primary(build_primary)
        .map_prefix(|op, rhs| {
            let op = match op.as_rule() {
                Rule::neg => UnaryOp::Neg,
                _ => UnaryOp::Not,
            };
            Ok(Expr::Unary(op, Box::new(rhs?)))
        })
        .map_postfix(|lhs, op| {
            let index = op
                .into_inner()
                .next()
                .map(|p| build(p.into_inner()))
                .transpose()?
                .unwrap_or(Expr::Literal(Value::Null));
            Ok(Expr::Index(Box::new(lhs?), Box::new(index)))
        })
        .map_infix(|lhs, op, rhs| {
            let op = match op.as_rule() {
                Rule::or_op => BinaryOp::Or,
                Rule::and_op => BinaryOp::And,
                Rule::eq => BinaryOp::Eq,
                Rule::ne => BinaryOp::Ne,
                Rule::lt => BinaryOp::Lt,
                Rule::le => BinaryOp::Le,
                Rule::gt => BinaryOp::Gt,
                Rule::ge => BinaryOp::Ge,
                Rule::add => BinaryOp::Add,
                Rule::sub => BinaryOp::Sub,
                Rule::mul => BinaryOp::Mul,
                Rule::div => BinaryOp::Div,
                _ => BinaryOp::Rem,
            };
            Ok(Expr::Binary(op, Box::new(lhs?), Box::new(rhs?)))
        })
        .parse(pairs)
}

fn build_primary(pair: Pair<'_, Rule>) -> Result<Expr, ExpressionError> {
    let text = pair.as_str();
    let literal = match pair.as_rule() {
        Rule::expr => return build(pair.into_inner()),
        Rule::variable => {
            let path = pair.into_inner().next().map_or("", |p| p.as_str());
            return Ok(Expr::Var(path.to_string()));
        }
        Rule::float => text.parse::<f64>().map(Value::Float).map_err(|e| ExpressionError::Syntax {
            expression: text.to_string(),
            message: e.to_string(),
        })?,
        Rule::hex_int => i64::from_str_radix(&text[2..], 16)
            .map(Value::Int)
            .map_err(|_| ExpressionError::Overflow)?,
        Rule::int => text.parse::<i64>().map(Value::Int).map_err(|_| ExpressionError::Overflow)?,
        Rule::string => {
            let inner = pair.into_inner().next().map_or("", |p| p.as_str());
            Value::Str(unescape(inner))
        }
        Rule::boolean => Value::Bool(text.eq_ignore_ascii_case("true")),
        Rule::null => Value::Null,
        other => {
            return Err(ExpressionError::Syntax {
                expression: text.to_string(),
                message: format!("unexpected {other:?}"),
            })
        }
    };
    Ok(Expr::Literal(literal))
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('0') => out.push('\0'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

impl Expr {
    /// Evaluate against a variable snapshot
    pub fn eval(&self, env: &Variables) -> Result<Value, ExpressionError> {
        match self {
            Self::Literal(v) => Ok(v.clone()),
            Self::Var(path) => lookup(env, path),
            Self::Unary(UnaryOp::Not, inner) => Ok(Value::Bool(!inner.eval(env)?.is_truthy())),
            Self::Unary(UnaryOp::Neg, inner) => match inner.eval(env)? {
                Value::Int(i) => i.checked_neg().map(Value::Int).ok_or(ExpressionError::Overflow),
                Value::Float(f) => Ok(Value::Float(-f)),
                Value::Bool(b) => Ok(Value::Int(-i64::from(b))),
                other => Err(ExpressionError::Type(format!("cannot negate {}", other.type_name()))),
            },
            Self::Binary(BinaryOp::Or, lhs, rhs) => {
                Ok(Value::Bool(lhs.eval(env)?.is_truthy() || rhs.eval(env)?.is_truthy()))
            }
            Self::Binary(BinaryOp::And, lhs, rhs) => {
                Ok(Value::Bool(lhs.eval(env)?.is_truthy() && rhs.eval(env)?.is_truthy()))
            }
            Self::Binary(op, lhs, rhs) => binary(*op, &lhs.eval(env)?, &rhs.eval(env)?),
            Self::Index(base, index) => index_value(&base.eval(env)?, &index.eval(env)?),
        }
    }
}

/// Resolve a dotted path: exact key, then the longest flattened prefix, then
/// walking maps by key and lists by position.
fn lookup(env: &Variables, path: &str) -> Result<Value, ExpressionError> {
    if let Some(v) = env.get(path) {
        return Ok(v.clone());
    }
    let segments: Vec<&str> = path.split('.').collect();
    for split in (1..segments.len()).rev() {
        let head = segments[..split].join(".");
        if let Some(found) = env.get(&head).and_then(|root| walk(root, &segments[split..])) {
            return Ok(found);
        }
    }
    Err(ExpressionError::UnknownVariable(path.to_string()))
}

fn walk(root: &Value, segments: &[&str]) -> Option<Value> {
    let mut current = root;
    for segment in segments {
        current = match current {
            Value::Map(m) => m.get(*segment)?,
            Value::List(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

fn index_value(base: &Value, index: &Value) -> Result<Value, ExpressionError> {
    let position = |len: usize| -> Result<usize, ExpressionError> {
        let i = index
            .as_i64()
            .filter(|_| !matches!(index, Value::Str(_)))
            .ok_or_else(|| ExpressionError::Type(format!("index must be int, got {}", index.type_name())))?;
        let len = i64::try_from(len).map_err(|_| ExpressionError::Overflow)?;
        let resolved = if i < 0 { len + i } else { i };
        usize::try_from(resolved)
            .ok()
            .filter(|&p| (p as i64) < len)
            .ok_or_else(|| ExpressionError::Type(format!("index {i} out of range")))
    };
    match base {
        Value::List(items) => Ok(items[position(items.len())?].clone()),
        Value::Bytes(data) => Ok(Value::from(data[position(data.len())?])),
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            Ok(Value::Str(chars[position(chars.len())?].to_string()))
        }
        Value::Map(m) => {
            let key = index.to_string();
            m.get(&key)
                .cloned()
                .ok_or(ExpressionError::UnknownVariable(key))
        }
        other => Err(ExpressionError::Type(format!("cannot index {}", other.type_name()))),
    }
}

enum Numeric {
    Int(i64),
    Float(f64),
}

fn numeric(v: &Value) -> Option<Numeric> {
    match v {
        Value::Int(i) => Some(Numeric::Int(*i)),
        Value::Bool(b) => Some(Numeric::Int(i64::from(*b))),
        Value::Float(f) => Some(Numeric::Float(*f)),
        _ => None,
    }
}

#[allow(clippy::cast_precision_loss)]
fn as_float(n: &Numeric) -> f64 {
    match n {
        Numeric::Int(i) => *i as f64,
        Numeric::Float(f) => *f,
    }
}

fn type_error(op: BinaryOp, lhs: &Value, rhs: &Value) -> ExpressionError {
    ExpressionError::Type(format!(
        "unsupported operands for {op:?}: {} and {}",
        lhs.type_name(),
        rhs.type_name()
    ))
}

fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (numeric(lhs), numeric(rhs)) {
        (Some(Numeric::Int(a)), Some(Numeric::Int(b))) => a == b,
        (Some(a), Some(b)) => as_float(&a) == as_float(&b),
        _ => lhs == rhs,
    }
}

fn compare(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    match (numeric(lhs), numeric(rhs)) {
        (Some(Numeric::Int(a)), Some(Numeric::Int(b))) => Some(a.cmp(&b)),
        (Some(a), Some(b)) => as_float(&a).partial_cmp(&as_float(&b)),
        _ => match (lhs, rhs) {
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            _ => None,
        },
    }
}

fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, ExpressionError> {
    match op {
        BinaryOp::Eq => return Ok(Value::Bool(values_equal(lhs, rhs))),
        BinaryOp::Ne => return Ok(Value::Bool(!values_equal(lhs, rhs))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ord = compare(lhs, rhs).ok_or_else(|| type_error(op, lhs, rhs))?;
            let result = match op {
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::Le => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            };
            return Ok(Value::Bool(result));
        }
        BinaryOp::Add => match (lhs, rhs) {
            (Value::Str(_), _) | (_, Value::Str(_)) => return Ok(Value::Str(format!("{lhs}{rhs}"))),
            (Value::List(a), Value::List(b)) => {
                return Ok(Value::List(a.iter().chain(b.iter()).cloned().collect()))
            }
            (Value::Bytes(a), Value::Bytes(b)) => {
                return Ok(Value::Bytes(a.iter().chain(b.iter()).copied().collect()))
            }
            _ => {}
        },
        _ => {}
    }

    let (a, b) = match (numeric(lhs), numeric(rhs)) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(type_error(op, lhs, rhs)),
    };

    if op == BinaryOp::Div {
        let divisor = as_float(&b);
        if divisor == 0.0 {
            return Err(ExpressionError::DivisionByZero);
        }
        return Ok(Value::Float(as_float(&a) / divisor));
    }

    match (a, b) {
        (Numeric::Int(x), Numeric::Int(y)) => {
            let result = match op {
                BinaryOp::Add => x.checked_add(y),
                BinaryOp::Sub => x.checked_sub(y),
                BinaryOp::Mul => x.checked_mul(y),
                _ => {
                    if y == 0 {
                        return Err(ExpressionError::DivisionByZero);
                    }
                    x.checked_rem(y).map(|r| if r != 0 && (r < 0) != (y < 0) { r + y } else { r })
                }
            };
            result.map(Value::Int).ok_or(ExpressionError::Overflow)
        }
        (a, b) => {
            let (x, y) = (as_float(&a), as_float(&b));
            let result = match op {
                BinaryOp::Add => x + y,
                BinaryOp::Sub => x - y,
                BinaryOp::Mul => x * y,
                _ => {
                    if y == 0.0 {
                        return Err(ExpressionError::DivisionByZero);
                    }
                    x - y * (x / y).floor()
                }
            };
            Ok(Value::Float(result))
        }
    }
}
