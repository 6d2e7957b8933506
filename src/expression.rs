//! Expression evaluator for conditions and variable mappings.
//!
//! Expressions are a small FEEL-like subset: literals, variable paths,
//! arithmetic, comparison and boolean operators. Text is parsed with `nom`
//! into an [`Expr`] tree and evaluated against a flat variable snapshot.

use crate::error::ExpressionError;
use crate::model::Mapping;
use crate::variables::{VariableScope, Variables};
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{alpha1, alphanumeric1, char, digit1, multispace0, satisfy},
    combinator::{all_consuming, map, map_res, not, opt, recognize, value},
    multi::{many0, many0_count},
    sequence::{delimited, pair, preceded, terminated},
    IResult,
};
use serde_json::{Number, Value};
use std::cmp::Ordering;

static NULL: Value = Value::Null;

// =============================================================================
// AST
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

/// One step of a variable path after its root identifier.
#[derive(Clone, Debug, PartialEq)]
pub enum Segment {
    Field(String),
    Index(usize),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(String, Vec<Segment>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs))
    }
}

// =============================================================================
// ENTRY POINTS
// =============================================================================

/// Strip a leading `=` and surrounding whitespace.
pub fn normalize(expression: &str) -> &str {
    let trimmed = expression.trim();
    trimmed.strip_prefix('=').unwrap_or(trimmed).trim()
}

/// Parse an expression into its syntax tree.
pub fn parse(expression: &str) -> Result<Expr, ExpressionError> {
    let body = normalize(expression);
    all_consuming(ws(or_expr))(body)
        .map(|(_, expr)| expr)
        .map_err(|e| ExpressionError::Syntax {
            expression: expression.to_string(),
            reason: e.to_string(),
        })
}

/// Evaluate `expression` against `vars`.
pub fn evaluate(expression: &str, vars: &Variables) -> Result<Value, ExpressionError> {
    parse(expression)?.eval(vars)
}

/// Evaluate a sequence-flow condition. Only boolean results are accepted.
pub fn evaluate_condition(expression: &str, vars: &Variables) -> Result<bool, ExpressionError> {
    match evaluate(expression, vars)? {
        Value::Bool(b) => Ok(b),
        other => Err(ExpressionError::TypeMismatch(format!(
            "condition evaluated to {}, expected boolean",
            type_name(&other)
        ))),
    }
}

// =============================================================================
// PARSER
// =============================================================================

fn ws<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// A keyword that is not the prefix of a longer identifier (`or` vs `order`).
fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    terminated(tag(kw), not(satisfy(is_ident_char)))
}

fn fold(first: Expr, rest: Vec<(BinaryOp, Expr)>) -> Expr {
    rest.into_iter()
        .fold(first, |acc, (op, rhs)| Expr::binary(op, acc, rhs))
}

fn or_expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = and_expr(input)?;
    let (input, rest) = many0(pair(
        ws(value(BinaryOp::Or, alt((tag("||"), keyword("or"))))),
        and_expr,
    ))(input)?;
    Ok((input, fold(first, rest)))
}

fn and_expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = comparison(input)?;
    let (input, rest) = many0(pair(
        ws(value(BinaryOp::And, alt((tag("&&"), keyword("and"))))),
        comparison,
    ))(input)?;
    Ok((input, fold(first, rest)))
}

fn comparison_op(input: &str) -> IResult<&str, BinaryOp> {
    alt((
        value(BinaryOp::Eq, tag("==")),
        value(BinaryOp::Ne, tag("!=")),
        value(BinaryOp::Le, tag("<=")),
        value(BinaryOp::Ge, tag(">=")),
        value(BinaryOp::Lt, tag("<")),
        value(BinaryOp::Gt, tag(">")),
        value(BinaryOp::Eq, tag("=")),
    ))(input)
}

// Comparisons do not chain: `a < b < c` is a syntax error.
fn comparison(input: &str) -> IResult<&str, Expr> {
    let (input, lhs) = additive(input)?;
    let (input, rhs) = opt(pair(ws(comparison_op), additive))(input)?;
    Ok((
        input,
        match rhs {
            Some((op, rhs)) => Expr::binary(op, lhs, rhs),
            None => lhs,
        },
    ))
}

fn additive(input: &str) -> IResult<&str, Expr> {
    let (input, first) = multiplicative(input)?;
    let (input, rest) = many0(pair(
        ws(alt((
            value(BinaryOp::Add, char('+')),
            value(BinaryOp::Sub, char('-')),
        ))),
        multiplicative,
    ))(input)?;
    Ok((input, fold(first, rest)))
}

fn multiplicative(input: &str) -> IResult<&str, Expr> {
    let (input, first) = unary(input)?;
    let (input, rest) = many0(pair(
        ws(alt((
            value(BinaryOp::Mul, char('*')),
            value(BinaryOp::Div, char('/')),
            value(BinaryOp::Rem, char('%')),
        ))),
        unary,
    ))(input)?;
    Ok((input, fold(first, rest)))
}

fn unary(input: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(ws(alt((keyword("not"), tag("!")))), unary), |e| {
            Expr::Not(Box::new(e))
        }),
        map(preceded(ws(char('-')), unary), |e| Expr::Neg(Box::new(e))),
        primary,
    ))(input)
}

fn primary(input: &str) -> IResult<&str, Expr> {
    ws(alt((
        delimited(char('('), ws(or_expr), char(')')),
        number,
        string,
        value(Expr::Literal(Value::Bool(true)), keyword("true")),
        value(Expr::Literal(Value::Bool(false)), keyword("false")),
        value(Expr::Literal(Value::Null), keyword("null")),
        path,
    )))(input)
}

fn number(input: &str) -> IResult<&str, Expr> {
    map_res(
        recognize(pair(digit1, opt(pair(char('.'), digit1)))),
        |text: &str| -> Result<Expr, String> {
            if text.contains('.') {
                let f: f64 = text.parse().map_err(|e| format!("{e}"))?;
                Number::from_f64(f)
                    .map(|n| Expr::Literal(Value::Number(n)))
                    .ok_or_else(|| format!("non-finite number {text}"))
            } else {
                let i: i64 = text.parse().map_err(|e| format!("{e}"))?;
                Ok(Expr::Literal(Value::from(i)))
            }
        },
    )(input)
}

fn string(input: &str) -> IResult<&str, Expr> {
    map(
        alt((
            delimited(char('"'), take_while(|c| c != '"'), char('"')),
            delimited(char('\''), take_while(|c| c != '\''), char('\'')),
        )),
        |s: &str| Expr::Literal(Value::String(s.to_string())),
    )(input)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0_count(alt((alphanumeric1, tag("_")))),
    ))(input)
}

fn path(input: &str) -> IResult<&str, Expr> {
    let (input, head) = identifier(input)?;
    let (input, segments) = many0(alt((
        map(preceded(char('.'), identifier), |s: &str| {
            Segment::Field(s.to_string())
        }),
        map_res(delimited(char('['), ws(digit1), char(']')), |d: &str| {
            d.parse::<usize>().map(Segment::Index)
        }),
    )))(input)?;
    Ok((input, Expr::Path(head.to_string(), segments)))
}

// =============================================================================
// EVALUATION
// =============================================================================

#[derive(Clone, Copy, Debug)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

impl Expr {
    pub fn eval(&self, vars: &Variables) -> Result<Value, ExpressionError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Path(head, segments) => resolve_path(head, segments, vars).cloned(),
            Expr::Not(inner) => {
                let b = as_bool(&inner.eval(vars)?, "not")?;
                Ok(Value::Bool(!b))
            }
            Expr::Neg(inner) => match as_number(&inner.eval(vars)?, "unary -")? {
                Num::Int(i) => match i.checked_neg() {
                    Some(n) => Ok(Value::from(n)),
                    None => float_value(-(i as f64)),
                },
                Num::Float(f) => float_value(-f),
            },
            Expr::Binary(BinaryOp::And, lhs, rhs) => {
                if !as_bool(&lhs.eval(vars)?, "and")? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(as_bool(&rhs.eval(vars)?, "and")?))
            }
            Expr::Binary(BinaryOp::Or, lhs, rhs) => {
                if as_bool(&lhs.eval(vars)?, "or")? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(as_bool(&rhs.eval(vars)?, "or")?))
            }
            Expr::Binary(op, lhs, rhs) => apply(*op, &lhs.eval(vars)?, &rhs.eval(vars)?),
        }
    }
}

fn resolve_path<'v>(
    head: &str,
    segments: &[Segment],
    vars: &'v Variables,
) -> Result<&'v Value, ExpressionError> {
    let mut current = vars
        .get(head)
        .ok_or_else(|| ExpressionError::UnknownIdentifier(head.to_string()))?;
    for segment in segments {
        current = match (segment, current) {
            (Segment::Field(name), Value::Object(map)) => map.get(name).unwrap_or(&NULL),
            (Segment::Index(i), Value::Array(items)) => items.get(*i).unwrap_or(&NULL),
            (_, Value::Null) => &NULL,
            (Segment::Field(name), other) => {
                return Err(ExpressionError::TypeMismatch(format!(
                    "cannot read field '{name}' of {}",
                    type_name(other)
                )))
            }
            (Segment::Index(i), other) => {
                return Err(ExpressionError::TypeMismatch(format!(
                    "cannot index [{i}] into {}",
                    type_name(other)
                )))
            }
        };
    }
    Ok(current)
}

fn apply(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, ExpressionError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(lhs, rhs))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(lhs, rhs))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ord = compare(lhs, rhs)?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::Le => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            }))
        }
        BinaryOp::Add if lhs.is_string() || rhs.is_string() => {
            Ok(Value::String(format!("{}{}", display(lhs), display(rhs))))
        }
        BinaryOp::And | BinaryOp::Or => {
            let (l, r) = (as_bool(lhs, "and/or")?, as_bool(rhs, "and/or")?);
            Ok(Value::Bool(if op == BinaryOp::And { l && r } else { l || r }))
        }
        _ => {
            let symbol = symbol(op);
            arithmetic(op, as_number(lhs, symbol)?, as_number(rhs, symbol)?)
        }
    }
}

fn arithmetic(op: BinaryOp, lhs: Num, rhs: Num) -> Result<Value, ExpressionError> {
    if let (Num::Int(a), Num::Int(b)) = (lhs, rhs) {
        let exact = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Div | BinaryOp::Rem if b == 0 => {
                return Err(ExpressionError::DivisionByZero)
            }
            BinaryOp::Div if a.checked_rem(b) == Some(0) => a.checked_div(b),
            BinaryOp::Rem => a.checked_rem(b),
            _ => None,
        };
        if let Some(v) = exact {
            return Ok(Value::from(v));
        }
    }
    let (a, b) = (lhs.as_f64(), rhs.as_f64());
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div | BinaryOp::Rem if b == 0.0 => return Err(ExpressionError::DivisionByZero),
        BinaryOp::Div => a / b,
        BinaryOp::Rem => a % b,
        other => {
            return Err(ExpressionError::TypeMismatch(format!(
                "'{}' is not an arithmetic operator",
                symbol(other)
            )))
        }
    };
    float_value(result)
}

fn compare(lhs: &Value, rhs: &Value) -> Result<Ordering, ExpressionError> {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                return Ok(a.cmp(&b));
            }
            let (a, b) = (as_number(lhs, "<")?.as_f64(), as_number(rhs, "<")?.as_f64());
            a.partial_cmp(&b)
                .ok_or_else(|| ExpressionError::TypeMismatch("cannot order NaN".into()))
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(ExpressionError::TypeMismatch(format!(
            "cannot compare {} with {}",
            type_name(lhs),
            type_name(rhs)
        ))),
    }
}

fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(_), Value::Number(_)) => compare(lhs, rhs) == Ok(Ordering::Equal),
        _ => lhs == rhs,
    }
}

fn as_bool(v: &Value, op: &str) -> Result<bool, ExpressionError> {
    v.as_bool().ok_or_else(|| {
        ExpressionError::TypeMismatch(format!("'{op}' expects boolean, got {}", type_name(v)))
    })
}

fn as_number(v: &Value, op: &str) -> Result<Num, ExpressionError> {
    let mismatch =
        || ExpressionError::TypeMismatch(format!("'{op}' expects number, got {}", type_name(v)));
    match v {
        Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(Num::Int(i)),
            None => n.as_f64().map(Num::Float).ok_or_else(mismatch),
        },
        _ => Err(mismatch()),
    }
}

fn float_value(f: f64) -> Result<Value, ExpressionError> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| ExpressionError::TypeMismatch(format!("non-finite result {f}")))
}

fn display(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn symbol(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Or => "or",
        BinaryOp::And => "and",
        BinaryOp::Eq => "=",
        BinaryOp::Ne => "!=",
        BinaryOp::Lt => "<",
        BinaryOp::Le => "<=",
        BinaryOp::Gt => ">",
        BinaryOp::Ge => ">=",
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Rem => "%",
    }
}

pub fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "context",
    }
}

// =============================================================================
// MAPPINGS
// =============================================================================

/// Evaluate each mapping against `scope` and set its target in `scope`.
/// Later mappings see the targets written by earlier ones.
pub fn apply_mappings(
    scope: &mut VariableScope<'_>,
    mappings: &[Mapping],
) -> Result<(), ExpressionError> {
    for mapping in mappings {
        let value = evaluate(&mapping.source, scope.variables())?;
        scope.set(mapping.target.clone(), value);
    }
    Ok(())
}

/// Evaluate output mappings against `scope` and propagate them to its parent.
/// Without mappings every variable of `scope` is propagated.
pub fn propagate_outputs(
    scope: &mut VariableScope<'_>,
    mappings: &[Mapping],
) -> Result<(), ExpressionError> {
    if mappings.is_empty() {
        let all = scope.variables().clone();
        for (name, value) in all {
            scope.propagate(name, value);
        }
        return Ok(());
    }
    let mut outputs = Vec::with_capacity(mappings.len());
    for mapping in mappings {
        outputs.push((
            mapping.target.clone(),
            evaluate(&mapping.source, scope.variables())?,
        ));
    }
    for (target, value) in outputs {
        scope.propagate(target, value);
    }
    Ok(())
}
