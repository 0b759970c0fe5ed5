//! Condition Evaluation
//!
//! A small boolean expression language used by step `condition`s and
//! `while` loops:
//!
//! ```text
//! outline.success and not review.skipped
//! score.value >= 0.8 || vars.force == true
//! classify.label == 'urgent'
//! ```
//!
//! Paths are resolved through a [`Resolver`]. A path that cannot be
//! resolved is falsy and makes every comparison it takes part in false, so
//! a missing step or field never causes a step to run and never raises an
//! error. Only malformed expressions are errors.
//!
//! `not` is the exception: it negates truthiness, so `not ghost.ok` is true
//! when `ghost` has no result and the step runs. Guard with the step itself
//! (`ghost.success and not ghost.ok`) when absence should skip.

use std::cmp::Ordering;
use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// Syntax errors in a condition expression.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConditionError {
    #[error("empty condition")]
    Empty,

    #[error("unexpected character '{ch}' at position {pos} in condition '{expr}'")]
    UnexpectedChar { expr: String, ch: char, pos: usize },

    #[error("unterminated string in condition '{0}'")]
    UnterminatedString(String),

    #[error("unexpected token {token} in condition '{expr}'")]
    UnexpectedToken { expr: String, token: String },

    #[error("unexpected end of condition '{0}'")]
    UnexpectedEnd(String),
}

/// Result of resolving a dotted path.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Found(Value),
    /// The first segment names nothing (no such step or variable).
    MissingRoot,
    /// The root exists but the field path does not.
    MissingField,
}

/// Source of values for path expressions.
pub trait Resolver {
    fn resolve(&self, path: &[String]) -> Lookup;
}

/// Plain JSON objects resolve their top-level keys as roots.
impl Resolver for Value {
    fn resolve(&self, path: &[String]) -> Lookup {
        let Some((root, rest)) = path.split_first() else {
            return Lookup::MissingRoot;
        };
        match self.get(root.as_str()) {
            None => Lookup::MissingRoot,
            Some(value) => match lookup_path(value, rest) {
                Some(found) => Lookup::Found(found.clone()),
                None => Lookup::MissingField,
            },
        }
    }
}

/// Walks `path` through nested objects and arrays (numeric segments index
/// into arrays).
pub fn lookup_path<'a, S: AsRef<str>>(value: &'a Value, path: &[S]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, segment| {
        let segment = segment.as_ref();
        match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
    })
}

/// JavaScript-like truthiness: null, false, 0, "" and empty containers are
/// falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Evaluates `expression` against `resolver`.
pub fn evaluate<R: Resolver + ?Sized>(expression: &str, resolver: &R) -> Result<bool, ConditionError> {
    Ok(Condition::parse(expression)?.evaluate(resolver))
}

/// Evaluates `expression` and reports which paths could not be resolved.
pub fn explain<R: Resolver + ?Sized>(
    expression: &str,
    resolver: &R,
) -> Result<ConditionOutcome, ConditionError> {
    Ok(Condition::parse(expression)?.explain(resolver))
}

/// Evaluation result with the unresolved references that contributed to it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConditionOutcome {
    pub result: bool,
    /// Roots (usually step names) that had no value at all.
    pub missing_roots: Vec<String>,
    /// Full paths whose root existed but whose field did not.
    pub missing_fields: Vec<String>,
}

impl ConditionOutcome {
    /// Human-readable reason for skipping a step guarded by `expression`.
    pub fn skip_reason(&self, expression: &str) -> String {
        if self.missing_roots.is_empty() {
            format!("condition '{}' evaluated to false", expression)
        } else {
            format!(
                "condition '{}' references missing results: {}",
                expression,
                self.missing_roots.join(", ")
            )
        }
    }
}

/// A parsed condition, reusable across evaluations (e.g. `while` loops).
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    pub fn parse(expression: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(expression)?;
        if tokens.is_empty() {
            return Err(ConditionError::Empty);
        }
        let mut parser = Parser {
            source: expression,
            tokens,
            pos: 0,
        };
        let expr = parser.parse_or()?;
        if let Some(token) = parser.tokens.get(parser.pos) {
            return Err(ConditionError::UnexpectedToken {
                expr: expression.to_string(),
                token: token.to_string(),
            });
        }
        Ok(Self {
            source: expression.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Root names of every path in the expression, in order of appearance.
    pub fn roots(&self) -> Vec<String> {
        let mut roots = Vec::new();
        self.expr.collect_roots(&mut roots);
        roots.dedup();
        roots
    }

    pub fn evaluate<R: Resolver + ?Sized>(&self, resolver: &R) -> bool {
        self.explain(resolver).result
    }

    pub fn explain<R: Resolver + ?Sized>(&self, resolver: &R) -> ConditionOutcome {
        let mut outcome = ConditionOutcome::default();
        let value = eval(&self.expr, resolver, &mut outcome);
        outcome.result = value.truthy();
        outcome.missing_roots.dedup();
        outcome
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Dot,
    Number(f64),
    Str(String),
    LParen,
    RParen,
    Cmp(CmpOp),
    And,
    Or,
    Not,
    Literal(Value),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "'{}'", s),
            Token::Dot => f.write_str("'.'"),
            Token::Number(n) => write!(f, "'{}'", n),
            Token::Str(s) => write!(f, "\"{}\"", s),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
            Token::Cmp(op) => write!(f, "'{:?}'", op),
            Token::And => f.write_str("'and'"),
            Token::Or => f.write_str("'or'"),
            Token::Not => f.write_str("'not'"),
            Token::Literal(v) => write!(f, "'{}'", v),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
}

impl Expr {
    fn collect_roots(&self, roots: &mut Vec<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Path(path) => {
                if let Some(root) = path.first() {
                    if !roots.contains(root) {
                        roots.push(root.clone());
                    }
                }
            }
            Expr::Not(inner) => inner.collect_roots(roots),
            Expr::And(a, b) | Expr::Or(a, b) | Expr::Compare(a, _, b) => {
                a.collect_roots(roots);
                b.collect_roots(roots);
            }
        }
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

fn tokenize(expr: &str) -> Result<Vec<Token>, ConditionError> {
    let chars: Vec<char> = expr.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        let after_dot = matches!(tokens.last(), Some(Token::Dot));

        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Cmp(CmpOp::Eq));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Cmp(CmpOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' | '>' => {
                let op = match (c, next == Some('=')) {
                    ('<', true) => CmpOp::Le,
                    ('<', false) => CmpOp::Lt,
                    (_, true) => CmpOp::Ge,
                    (_, false) => CmpOp::Gt,
                };
                tokens.push(Token::Cmp(op));
                i += if next == Some('=') { 2 } else { 1 };
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(ConditionError::UnterminatedString(expr.to_string())),
                        Some('\\') if chars.get(i + 1).is_some() => {
                            value.push(chars[i + 1]);
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            value.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            // Path segments after a dot are always identifiers, including
            // array indices and keyword-like field names.
            c if after_dot && is_ident_char(c) => {
                let start = i;
                while i < chars.len() && is_ident_char(chars[i]) {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            c if c.is_ascii_digit()
                || (c == '-' && next.map(|n| n.is_ascii_digit()).unwrap_or(false)) =>
            {
                let start = i;
                i += 1;
                let mut seen_dot = false;
                while i < chars.len() {
                    let d = chars[i];
                    let dot_then_digit = d == '.'
                        && !seen_dot
                        && chars.get(i + 1).map(|n| n.is_ascii_digit()).unwrap_or(false);
                    if d.is_ascii_digit() {
                        i += 1;
                    } else if dot_then_digit {
                        seen_dot = true;
                        i += 1;
                    } else {
                        break;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let number = text.parse::<f64>().map_err(|_| ConditionError::UnexpectedChar {
                    expr: expr.to_string(),
                    ch: c,
                    pos: start,
                })?;
                tokens.push(Token::Number(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && is_ident_char(chars[i]) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let token = match word.to_ascii_lowercase().as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" => Token::Literal(Value::Bool(true)),
                    "false" => Token::Literal(Value::Bool(false)),
                    "null" | "none" => Token::Literal(Value::Null),
                    _ => Token::Ident(word),
                };
                tokens.push(token);
            }
            other => {
                return Err(ConditionError::UnexpectedChar {
                    expr: expr.to_string(),
                    ch: other,
                    pos: i,
                })
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn unexpected(&self, token: Token) -> ConditionError {
        ConditionError::UnexpectedToken {
            expr: self.source.to_string(),
            token: token.to_string(),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_not()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ConditionError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ConditionError> {
        let left = self.parse_primary()?;
        if let Some(Token::Cmp(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.parse_primary()?;
            return Ok(Expr::Compare(Box::new(left), op, Box::new(right)));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, ConditionError> {
        let token = self
            .advance()
            .ok_or_else(|| ConditionError::UnexpectedEnd(self.source.to_string()))?;

        match token {
            Token::LParen => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    Some(other) => Err(self.unexpected(other)),
                    None => Err(ConditionError::UnexpectedEnd(self.source.to_string())),
                }
            }
            Token::Literal(value) => Ok(Expr::Literal(value)),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Number(n) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Token::Ident(root) => {
                let mut path = vec![root];
                while self.peek() == Some(&Token::Dot) {
                    self.pos += 1;
                    match self.advance() {
                        Some(Token::Ident(segment)) => path.push(segment),
                        Some(other) => return Err(self.unexpected(other)),
                        None => return Err(ConditionError::UnexpectedEnd(self.source.to_string())),
                    }
                }
                Ok(Expr::Path(path))
            }
            other => Err(self.unexpected(other)),
        }
    }
}

enum Operand {
    Value(Value),
    Missing,
}

impl Operand {
    fn truthy(&self) -> bool {
        match self {
            Operand::Value(v) => is_truthy(v),
            Operand::Missing => false,
        }
    }
}

fn eval<R: Resolver + ?Sized>(expr: &Expr, resolver: &R, outcome: &mut ConditionOutcome) -> Operand {
    match expr {
        Expr::Literal(v) => Operand::Value(v.clone()),
        Expr::Path(path) => match resolver.resolve(path) {
            Lookup::Found(v) => Operand::Value(v),
            Lookup::MissingRoot => {
                outcome.missing_roots.push(path[0].clone());
                Operand::Missing
            }
            Lookup::MissingField => {
                outcome.missing_fields.push(path.join("."));
                Operand::Missing
            }
        },
        Expr::Not(inner) => Operand::Value(Value::Bool(!eval(inner, resolver, outcome).truthy())),
        Expr::And(a, b) => {
            let result = eval(a, resolver, outcome).truthy() && eval(b, resolver, outcome).truthy();
            Operand::Value(Value::Bool(result))
        }
        Expr::Or(a, b) => {
            let result = eval(a, resolver, outcome).truthy() || eval(b, resolver, outcome).truthy();
            Operand::Value(Value::Bool(result))
        }
        Expr::Compare(a, op, b) => {
            let left = eval(a, resolver, outcome);
            let right = eval(b, resolver, outcome);
            let result = match (left, right) {
                (Operand::Value(x), Operand::Value(y)) => compare(&x, *op, &y),
                _ => false,
            };
            Operand::Value(Value::Bool(result))
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn values_equal(x: &Value, y: &Value) -> bool {
    match (x, y) {
        (Value::Number(_), _) | (_, Value::Number(_)) => match (as_number(x), as_number(y)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        (Value::Bool(b), Value::String(s)) | (Value::String(s), Value::Bool(b)) => {
            s.trim().eq_ignore_ascii_case(if *b { "true" } else { "false" })
        }
        _ => x == y,
    }
}

fn ordering(x: &Value, y: &Value) -> Option<Ordering> {
    match (x, y) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => as_number(x)?.partial_cmp(&as_number(y)?),
    }
}

fn compare(x: &Value, op: CmpOp, y: &Value) -> bool {
    match op {
        CmpOp::Eq => values_equal(x, y),
        CmpOp::Ne => !values_equal(x, y),
        CmpOp::Lt => ordering(x, y) == Some(Ordering::Less),
        CmpOp::Le => matches!(ordering(x, y), Some(Ordering::Less | Ordering::Equal)),
        CmpOp::Gt => ordering(x, y) == Some(Ordering::Greater),
        CmpOp::Ge => matches!(ordering(x, y), Some(Ordering::Greater | Ordering::Equal)),
    }
}
