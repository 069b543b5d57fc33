//! Resource query language subset used for subscription filters.
//!
//! Grammar:
//!
//! ```text
//! query    := and(query, ...) | or(query, ...) | not(query)
//!           | eq|ne|gt|ge|lt|le(operand, literal)
//!           | like(operand, "glob")
//!           | in(operand, literal, ...)
//!           | exists(operand)
//! operand  := field/path | topic:action | resource:path | entity:id | ...
//! literal  := "string" | number | true | false | null
//! ```
//!
//! Comparisons against a missing field evaluate to false.

use std::cmp::Ordering;
use std::sync::Arc;

use glob::Pattern;
use serde_json::Value;
use thiserror::Error;

use twinbridge_core::predicate::{EvaluationContext, Predicate, PredicateCompiler};

const PLACEHOLDER_PREFIXES: [&str; 4] = ["topic:", "resource:", "entity:", "header:"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RqlError {
    #[error("unexpected end of filter")]
    UnexpectedEnd,
    #[error("expected '{expected}' at position {position}")]
    Expected { expected: char, position: usize },
    #[error("unknown operator '{0}'")]
    UnknownOperator(String),
    #[error("empty operand at position {0}")]
    EmptyOperand(usize),
    #[error("invalid literal '{0}'")]
    InvalidLiteral(String),
    #[error("unterminated string starting at position {0}")]
    UnterminatedString(usize),
    #[error("invalid like() pattern: {0}")]
    InvalidPattern(String),
    #[error("like() needs a string pattern")]
    LikeNeedsString,
    #[error("trailing input at position {0}")]
    TrailingInput(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Field(String),
    Placeholder(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

#[derive(Debug, Clone)]
pub enum RqlExpr {
    And(Vec<RqlExpr>),
    Or(Vec<RqlExpr>),
    Not(Box<RqlExpr>),
    Compare { op: CompareOp, operand: Operand, value: Literal },
    In { operand: Operand, values: Vec<Literal> },
    Like { operand: Operand, pattern: Pattern },
    Exists(Operand),
}

/// Value an operand resolved to.
enum Resolved<'a> {
    Json(&'a Value),
    Text(&'a str),
}

impl Resolved<'_> {
    fn compare(&self, literal: &Literal) -> Option<Ordering> {
        match (self, literal) {
            (Resolved::Json(Value::Null), Literal::Null) => Some(Ordering::Equal),
            (Resolved::Json(Value::Bool(a)), Literal::Bool(b)) => (a == b).then_some(Ordering::Equal),
            (Resolved::Json(Value::Number(n)), Literal::Number(b)) => n.as_f64()?.partial_cmp(b),
            (Resolved::Json(Value::String(s)), Literal::String(b)) => Some(s.as_str().cmp(b.as_str())),
            (Resolved::Text(s), Literal::String(b)) => Some((*s).cmp(b.as_str())),
            (Resolved::Text(s), Literal::Number(b)) => s.parse::<f64>().ok()?.partial_cmp(b),
            _ => None,
        }
    }

    fn as_str(&self) -> Option<&str> {
        match self {
            Resolved::Json(Value::String(s)) => Some(s),
            Resolved::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl RqlExpr {
    pub fn evaluate(&self, ctx: &EvaluationContext<'_>) -> bool {
        match self {
            RqlExpr::And(items) => items.iter().all(|e| e.evaluate(ctx)),
            RqlExpr::Or(items) => items.iter().any(|e| e.evaluate(ctx)),
            RqlExpr::Not(inner) => !inner.evaluate(ctx),
            RqlExpr::Compare { op, operand, value } => {
                let Some(resolved) = resolve(operand, ctx) else {
                    return false;
                };
                let ordering = resolved.compare(value);
                match op {
                    CompareOp::Eq => ordering == Some(Ordering::Equal),
                    CompareOp::Ne => ordering != Some(Ordering::Equal),
                    CompareOp::Gt => ordering == Some(Ordering::Greater),
                    CompareOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
                    CompareOp::Lt => ordering == Some(Ordering::Less),
                    CompareOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
                }
            }
            RqlExpr::In { operand, values } => resolve(operand, ctx)
                .is_some_and(|r| values.iter().any(|v| r.compare(v) == Some(Ordering::Equal))),
            RqlExpr::Like { operand, pattern } => resolve(operand, ctx)
                .and_then(|r| r.as_str().map(|s| pattern.matches(s)))
                .unwrap_or(false),
            RqlExpr::Exists(operand) => resolve(operand, ctx).is_some(),
        }
    }
}

fn resolve<'a>(operand: &'a Operand, ctx: &'a EvaluationContext<'_>) -> Option<Resolved<'a>> {
    match operand {
        Operand::Field(path) => ctx.field(path).map(Resolved::Json),
        Operand::Placeholder(name) => ctx.placeholder(name).map(Resolved::Text),
    }
}

/// `*` matches any run of characters, `?` exactly one. Brackets are literal.
fn like_pattern(raw: &str) -> Result<Pattern, RqlError> {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '[' => escaped.push_str("[[]"),
            ']' => escaped.push_str("[]]"),
            other => escaped.push(other),
        }
    }
    Pattern::new(&escaped).map_err(|e| RqlError::InvalidPattern(e.to_string()))
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.src.len() - trimmed.len();
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_ws();
        self.rest().chars().next()
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += expected.len_utf8();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), RqlError> {
        if self.eat(expected) {
            Ok(())
        } else if self.peek().is_none() {
            Err(RqlError::UnexpectedEnd)
        } else {
            Err(RqlError::Expected {
                expected,
                position: self.pos,
            })
        }
    }

    fn ident(&mut self) -> Result<&'a str, RqlError> {
        self.skip_ws();
        let rest = self.rest();
        let len = rest
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(rest.len());
        if len == 0 {
            return Err(if rest.is_empty() {
                RqlError::UnexpectedEnd
            } else {
                RqlError::Expected {
                    expected: '(',
                    position: self.pos,
                }
            });
        }
        self.pos += len;
        Ok(&rest[..len])
    }

    /// Raw token up to the next `,` or `)`.
    fn token(&mut self) -> &'a str {
        self.skip_ws();
        let rest = self.rest();
        let len = rest.find([',', ')']).unwrap_or(rest.len());
        self.pos += len;
        rest[..len].trim_end()
    }

    fn operand(&mut self) -> Result<Operand, RqlError> {
        let position = self.pos;
        let raw = self.token();
        if raw.is_empty() {
            return Err(RqlError::EmptyOperand(position));
        }
        if PLACEHOLDER_PREFIXES.iter().any(|p| raw.starts_with(p)) {
            Ok(Operand::Placeholder(raw.to_owned()))
        } else {
            Ok(Operand::Field(raw.to_owned()))
        }
    }

    fn literal(&mut self) -> Result<Literal, RqlError> {
        if self.peek() == Some('"') {
            return self.string();
        }
        let raw = self.token();
        match raw {
            "" => Err(RqlError::UnexpectedEnd),
            "true" => Ok(Literal::Bool(true)),
            "false" => Ok(Literal::Bool(false)),
            "null" => Ok(Literal::Null),
            number => number
                .parse::<f64>()
                .map(Literal::Number)
                .map_err(|_| RqlError::InvalidLiteral(number.to_owned())),
        }
    }

    fn string(&mut self) -> Result<Literal, RqlError> {
        let start = self.pos;
        self.pos += 1;
        let mut out = String::new();
        let mut chars = self.rest().char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '"' => {
                    self.pos += i + 1;
                    return Ok(Literal::String(out));
                }
                '\\' => match chars.next() {
                    Some((_, escaped)) => out.push(escaped),
                    None => break,
                },
                other => out.push(other),
            }
        }
        Err(RqlError::UnterminatedString(start))
    }

    fn query(&mut self) -> Result<RqlExpr, RqlError> {
        let name = self.ident()?;
        self.expect('(')?;
        let expr = match name {
            "and" | "or" => {
                let mut items = vec![self.query()?];
                while self.eat(',') {
                    items.push(self.query()?);
                }
                if name == "and" {
                    RqlExpr::And(items)
                } else {
                    RqlExpr::Or(items)
                }
            }
            "not" => RqlExpr::Not(Box::new(self.query()?)),
            "eq" | "ne" | "gt" | "ge" | "lt" | "le" => {
                let op = match name {
                    "eq" => CompareOp::Eq,
                    "ne" => CompareOp::Ne,
                    "gt" => CompareOp::Gt,
                    "ge" => CompareOp::Ge,
                    "lt" => CompareOp::Lt,
                    _ => CompareOp::Le,
                };
                let operand = self.operand()?;
                self.expect(',')?;
                let value = self.literal()?;
                RqlExpr::Compare { op, operand, value }
            }
            "like" => {
                let operand = self.operand()?;
                self.expect(',')?;
                match self.literal()? {
                    Literal::String(glob) => RqlExpr::Like {
                        operand,
                        pattern: like_pattern(&glob)?,
                    },
                    _ => return Err(RqlError::LikeNeedsString),
                }
            }
            "in" => {
                let operand = self.operand()?;
                let mut values = Vec::new();
                while self.eat(',') {
                    values.push(self.literal()?);
                }
                if values.is_empty() {
                    return Err(RqlError::Expected {
                        expected: ',',
                        position: self.pos,
                    });
                }
                RqlExpr::In { operand, values }
            }
            "exists" => RqlExpr::Exists(self.operand()?),
            other => return Err(RqlError::UnknownOperator(other.to_owned())),
        };
        self.expect(')')?;
        Ok(expr)
    }
}

pub fn parse(filter: &str) -> Result<RqlExpr, RqlError> {
    let mut parser = Parser::new(filter);
    let expr = parser.query()?;
    if parser.peek().is_some() {
        return Err(RqlError::TrailingInput(parser.pos));
    }
    Ok(expr)
}

/// A compiled filter, keeping its source for diagnostics.
#[derive(Debug)]
pub struct RqlPredicate {
    source: String,
    expr: RqlExpr,
}

impl RqlPredicate {
    pub fn source(&self) -> &str {
        &self.source
    }
}

impl Predicate for RqlPredicate {
    fn evaluate(&self, context: &EvaluationContext<'_>) -> bool {
        self.expr.evaluate(context)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RqlCompiler;

impl PredicateCompiler for RqlCompiler {
    fn compile(&self, expression: &str) -> Result<Arc<dyn Predicate>, String> {
        let expr = parse(expression).map_err(|e| e.to_string())?;
        Ok(Arc::new(RqlPredicate {
            source: expression.to_owned(),
            expr,
        }))
    }
}
