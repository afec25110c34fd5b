//! Custom metric formulas.
//!
//! A formula mixes reducer calls with arithmetic, e.g.
//! `COUNT(estado=resuelto)/COUNT(*)*100`. Supported calls:
//!
//! | Call                   | Result                                              |
//! |------------------------|-----------------------------------------------------|
//! | `COUNT(*)`             | number of records                                   |
//! | `COUNT(field)`         | records where `field` is present and non-null       |
//! | `COUNT(field=literal)` | records where `field` equals `literal` as text      |
//! | `SUM(field)`           | sum of `field`, non-numeric values count as 0       |
//! | `AVG(field)`           | `SUM(field)` divided by the number of records       |
//!
//! `SUM` and `AVG` also accept `field=literal`, reducing over matching records.
//! Every call sees the full record set. Once calls are replaced by their
//! values, every character outside `+-*/(). 0-9` is dropped and the rest is
//! parsed as plain arithmetic.

use std::borrow::Borrow;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::value::{Record, Value, count_as_f64, round2};

static CALL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(COUNT|SUM|AVG)\s*\(([^()]*)\)").unwrap());

const ARITHMETIC_CHARS: &str = "+-*/(). 0123456789";

/// Maximum nesting of parentheses and unary signs.
const MAX_DEPTH: usize = 64;

/// Formula evaluation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FormulaError {
    #[error("{function}(*) is not supported")]
    WildcardNotSupported { function: String },

    #[error("{function}() requires an argument")]
    EmptyArgument { function: String },

    #[error("empty expression")]
    EmptyExpression,

    #[error("unexpected character {found:?} at position {position}")]
    UnexpectedChar { found: char, position: usize },

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("invalid number {0:?}")]
    InvalidNumber(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("result is not a finite number")]
    NonFinite,

    #[error("expression nested deeper than {limit} levels")]
    TooDeep { limit: usize },
}

/// Evaluates a formula, returning 0 on any failure.
///
/// Failures are logged at `warn` so a broken custom metric never breaks the
/// dashboard rendering it.
pub fn evaluate<R: Borrow<Record>>(records: &[R], template: &str) -> f64 {
    match try_evaluate(records, template) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(formula = %template, error = %err, "formula evaluation failed");
            0.0
        }
    }
}

/// Evaluates a formula, rounded to two decimals.
pub fn try_evaluate<R: Borrow<Record>>(records: &[R], template: &str) -> Result<f64, FormulaError> {
    let expanded = expand_calls(records, template)?;
    let sanitized: String = expanded
        .chars()
        .filter(|c| ARITHMETIC_CHARS.contains(*c))
        .collect();
    let value = Parser::new(&sanitized).parse()?;
    if !value.is_finite() {
        return Err(FormulaError::NonFinite);
    }
    Ok(round2(value))
}

/// Replaces every reducer call with its parenthesized value.
fn expand_calls<R: Borrow<Record>>(records: &[R], template: &str) -> Result<String, FormulaError> {
    let mut expanded = String::with_capacity(template.len());
    let mut last = 0;
    for caps in CALL_RE.captures_iter(template) {
        let (Some(whole), Some(function), Some(arg)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let value = evaluate_call(records, &function.as_str().to_uppercase(), arg.as_str())?;
        expanded.push_str(&template[last..whole.start()]);
        expanded.push_str(&format!("({value})"));
        last = whole.end();
    }
    expanded.push_str(&template[last..]);
    Ok(expanded)
}

enum Argument<'a> {
    All,
    Field(&'a str),
    Equals { field: &'a str, literal: &'a str },
}

fn parse_argument<'a>(function: &str, arg: &'a str) -> Result<Argument<'a>, FormulaError> {
    let arg = arg.trim();
    let empty = || FormulaError::EmptyArgument {
        function: function.to_string(),
    };
    if arg == "*" {
        return Ok(Argument::All);
    }
    match arg.split_once('=') {
        Some((field, literal)) => {
            let field = field.trim();
            if field.is_empty() {
                return Err(empty());
            }
            Ok(Argument::Equals {
                field,
                literal: strip_quotes(literal.trim()),
            })
        }
        None if arg.is_empty() => Err(empty()),
        None => Ok(Argument::Field(arg)),
    }
}

fn strip_quotes(s: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = s.strip_prefix(quote).and_then(|rest| rest.strip_suffix(quote)) {
            return inner.trim();
        }
    }
    s
}

fn field_equals(record: &Record, field: &str, literal: &str) -> bool {
    record
        .get(field)
        .unwrap_or(&Value::Null)
        .to_string()
        .trim()
        == literal
}

fn evaluate_call<R: Borrow<Record>>(records: &[R], function: &str, arg: &str) -> Result<f64, FormulaError> {
    let argument = parse_argument(function, arg)?;
    let records = records.iter().map(Borrow::<Record>::borrow);
    let value = match (function, argument) {
        ("COUNT", Argument::All) => count_as_f64(records.count()),
        ("COUNT", Argument::Field(field)) => count_as_f64(
            records
                .filter(|r| r.get(field).is_some_and(|v| !v.is_null()))
                .count(),
        ),
        ("COUNT", Argument::Equals { field, literal }) => {
            count_as_f64(records.filter(|r| field_equals(r, field, literal)).count())
        }
        (_, Argument::All) => {
            return Err(FormulaError::WildcardNotSupported {
                function: function.to_string(),
            });
        }
        (_, Argument::Field(field)) => reduce(function, records, field),
        (_, Argument::Equals { field, literal }) => reduce(
            function,
            records.filter(|r| field_equals(r, field, literal)),
            field,
        ),
    };
    Ok(value)
}

/// `SUM` or `AVG` of `field`. The average divides by every record, numeric or not.
fn reduce<'a>(function: &str, records: impl Iterator<Item = &'a Record>, field: &str) -> f64 {
    let (sum, count) = records.fold((0.0, 0usize), |(sum, count), record| {
        let value = record.get(field).map_or(0.0, Value::to_number_or_zero);
        (sum + value, count + 1)
    });
    if function == "AVG" {
        if count == 0 { 0.0 } else { sum / count_as_f64(count) }
    } else {
        sum
    }
}

/// Recursive-descent parser for `+ - * /`, unary sign and parentheses.
struct Parser {
    chars: Vec<char>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(input: &str) -> Self {
        Self {
            chars: input.chars().collect(),
            pos: 0,
            depth: 0,
        }
    }

    fn parse(mut self) -> Result<f64, FormulaError> {
        if self.peek().is_none() {
            return Err(FormulaError::EmptyExpression);
        }
        let value = self.expr()?;
        match self.peek() {
            None => Ok(value),
            Some(found) => Err(FormulaError::UnexpectedChar {
                found,
                position: self.pos,
            }),
        }
    }

    /// Skips whitespace and returns the next character.
    fn peek(&mut self) -> Option<char> {
        while self.chars.get(self.pos).is_some_and(|c| c.is_whitespace()) {
            self.pos += 1;
        }
        self.chars.get(self.pos).copied()
    }

    fn expr(&mut self) -> Result<f64, FormulaError> {
        let mut value = self.term()?;
        while let Some(op @ ('+' | '-')) = self.peek() {
            self.pos += 1;
            let rhs = self.term()?;
            if op == '+' {
                value += rhs;
            } else {
                value -= rhs;
            }
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<f64, FormulaError> {
        let mut value = self.factor()?;
        while let Some(op @ ('*' | '/')) = self.peek() {
            self.pos += 1;
            let rhs = self.factor()?;
            if op == '*' {
                value *= rhs;
            } else if rhs == 0.0 {
                return Err(FormulaError::DivisionByZero);
            } else {
                value /= rhs;
            }
        }
        Ok(value)
    }

    fn factor(&mut self) -> Result<f64, FormulaError> {
        if self.depth >= MAX_DEPTH {
            return Err(FormulaError::TooDeep { limit: MAX_DEPTH });
        }
        self.depth += 1;
        let value = self.unary();
        self.depth -= 1;
        value
    }

    fn unary(&mut self) -> Result<f64, FormulaError> {
        match self.peek() {
            Some('-') => {
                self.pos += 1;
                Ok(-self.factor()?)
            }
            Some('+') => {
                self.pos += 1;
                self.factor()
            }
            Some('(') => {
                self.pos += 1;
                let value = self.expr()?;
                match self.peek() {
                    Some(')') => {
                        self.pos += 1;
                        Ok(value)
                    }
                    Some(found) => Err(FormulaError::UnexpectedChar {
                        found,
                        position: self.pos,
                    }),
                    None => Err(FormulaError::UnexpectedEnd),
                }
            }
            Some(c) if c.is_ascii_digit() || c == '.' => self.number(),
            Some(found) => Err(FormulaError::UnexpectedChar {
                found,
                position: self.pos,
            }),
            None => Err(FormulaError::UnexpectedEnd),
        }
    }

    fn number(&mut self) -> Result<f64, FormulaError> {
        let start = self.pos;
        while self
            .chars
            .get(self.pos)
            .is_some_and(|c| c.is_ascii_digit() || *c == '.')
        {
            self.pos += 1;
        }
        let literal: String = self.chars[start..self.pos].iter().collect();
        literal
            .parse()
            .map_err(|_| FormulaError::InvalidNumber(literal))
    }
}
