// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Time expressions for query bounds
//!
//! ```text
//! query   := '(' timeref ',' timeref ')' | timeref
//! timeref := abstime reltime*
//! abstime := NUMBER | STRING | 'now'
//! reltime := NUMBER UNIT
//! ```
//!
//! - `NUMBER` as an absolute time is Unix milliseconds (UTC)
//! - `STRING` is a quoted (or bare) date: `m/d/Y`, `m/d/Y H:M` or
//!   `Y-m-dTH:M:S`, interpreted as UTC
//! - `UNIT` is `d`, `h`, `m`, `s` or the (plural) words, any case
//! - relative parts are signed and add up
//!
//! ```
//! use hdds_historian::timeexpr::{self, TimeBound};
//!
//! let expr = timeexpr::parse("(1/1/2020, now -1d)").unwrap();
//! assert!(matches!(expr.evaluate_now().unwrap(), TimeBound::Range(_, _)));
//! ```

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Absolute time formats tried in order
const TIME_PATTERNS: &[&str] = &["%m/%d/%Y", "%m/%d/%Y %H:%M", "%Y-%m-%dT%H:%M:%S"];

/// Time expression errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TimeExprError {
    #[error("Unexpected character '{ch}' at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },

    #[error("Unterminated string starting at offset {0}")]
    UnterminatedString(usize),

    #[error("Invalid number '{0}'")]
    InvalidNumber(String),

    #[error("Syntax error at offset {offset}: expected {expected}, found {found}")]
    Syntax {
        expected: &'static str,
        found: String,
        offset: usize,
    },

    #[error("Unexpected end of expression, expected {0}")]
    UnexpectedEnd(&'static str),

    #[error("Invalid time unit: {0}")]
    InvalidUnit(String),

    #[error("Invalid time string: {0}")]
    InvalidTimeString(String),

    #[error("Time out of range")]
    OutOfRange,
}

/// Evaluated expression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBound {
    /// A bare time reference
    Instant(DateTime<Utc>),
    /// A parenthesized `(start, end)` pair
    Range(DateTime<Utc>, DateTime<Utc>),
}

impl TimeBound {
    /// The instant, if this is a single bound
    pub fn instant(self) -> Option<DateTime<Utc>> {
        match self {
            Self::Instant(t) => Some(t),
            Self::Range(..) => None,
        }
    }

    /// The pair, if this is a range
    pub fn range(self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        match self {
            Self::Instant(_) => None,
            Self::Range(start, end) => Some((start, end)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AbsTime {
    Now,
    At(DateTime<Utc>),
}

/// Absolute time plus accumulated relative offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRef {
    base: AbsTime,
    offset: Duration,
}

impl TimeRef {
    fn evaluate(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, TimeExprError> {
        let base = match self.base {
            AbsTime::Now => now,
            AbsTime::At(t) => t,
        };
        base.checked_add_signed(self.offset)
            .ok_or(TimeExprError::OutOfRange)
    }
}

/// Parsed, not yet evaluated, time expression
///
/// `now` is resolved on each evaluation, not at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeExpr {
    Single(TimeRef),
    Pair(TimeRef, TimeRef),
}

impl TimeExpr {
    /// Evaluate with an explicit clock reading
    pub fn evaluate(&self, now: DateTime<Utc>) -> Result<TimeBound, TimeExprError> {
        match self {
            Self::Single(t) => Ok(TimeBound::Instant(t.evaluate(now)?)),
            Self::Pair(start, end) => Ok(TimeBound::Range(start.evaluate(now)?, end.evaluate(now)?)),
        }
    }

    /// Evaluate against the current wall clock
    pub fn evaluate_now(&self) -> Result<TimeBound, TimeExprError> {
        self.evaluate(Utc::now())
    }
}

impl FromStr for TimeExpr {
    type Err = TimeExprError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

/// Parse an expression
pub fn parse(input: &str) -> Result<TimeExpr, TimeExprError> {
    let tokens = lex(input)?;
    Parser { tokens, pos: 0 }.query()
}

/// Parse and evaluate an expression against the current time
pub fn parse_time_query(input: &str) -> Result<TimeBound, TimeExprError> {
    parse(input)?.evaluate_now()
}

/// Parse an absolute time string using the supported patterns
pub fn parse_time_string(s: &str) -> Result<DateTime<Utc>, TimeExprError> {
    let s = s.trim();
    for pattern in TIME_PATTERNS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, pattern) {
            return Ok(dt.and_utc());
        }
        // Date-only patterns never parse as a NaiveDateTime
        if let Ok(date) = NaiveDate::parse_from_str(s, pattern) {
            if let Some(dt) = date.and_hms_opt(0, 0, 0) {
                return Ok(dt.and_utc());
            }
        }
    }
    Err(TimeExprError::InvalidTimeString(s.to_string()))
}

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Now,
    Number(f64),
    Literal(String),
    Ident(String),
    LParen,
    RParen,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Now => f.write_str("'now'"),
            Token::Number(n) => write!(f, "number {}", n),
            Token::Literal(s) => write!(f, "string \"{}\"", s),
            Token::Ident(s) => write!(f, "'{}'", s),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
            Token::Comma => f.write_str("','"),
        }
    }
}

fn lex(input: &str) -> Result<Vec<(Token, usize)>, TimeExprError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < chars.len() {
        let c = chars[pos];
        let start = pos;

        match c {
            ' ' | '\t' | '\r' | '\n' => pos += 1,
            '(' => {
                tokens.push((Token::LParen, start));
                pos += 1;
            }
            ')' => {
                tokens.push((Token::RParen, start));
                pos += 1;
            }
            ',' => {
                tokens.push((Token::Comma, start));
                pos += 1;
            }
            '"' | '\'' => {
                let (text, end) = lex_quoted(&chars, pos)?;
                tokens.push((Token::Literal(text), start));
                pos = end;
            }
            c if c.is_ascii_digit() || c == '.' || c == '+' || c == '-' => {
                if let Some(end) = match_date_literal(&chars, pos) {
                    let text: String = chars[start..end].iter().collect();
                    tokens.push((Token::Literal(text), start));
                    pos = end;
                } else {
                    let end = match_number(&chars, pos)
                        .ok_or(TimeExprError::UnexpectedChar { ch: c, offset: start })?;
                    let text: String = chars[start..end].iter().collect();
                    let value = text
                        .parse::<f64>()
                        .map_err(|_| TimeExprError::InvalidNumber(text.clone()))?;
                    tokens.push((Token::Number(value), start));
                    pos = end;
                }
            }
            c if c.is_ascii_alphabetic() || c == '~' || c == '$' || c == '_' => {
                pos += 1;
                while pos < chars.len()
                    && (chars[pos].is_ascii_alphanumeric() || "/%_-".contains(chars[pos]))
                {
                    pos += 1;
                }
                let text: String = chars[start..pos].iter().collect();
                let token = if text == "now" {
                    Token::Now
                } else {
                    Token::Ident(text)
                };
                tokens.push((token, start));
            }
            other => {
                return Err(TimeExprError::UnexpectedChar {
                    ch: other,
                    offset: start,
                })
            }
        }
    }

    Ok(tokens)
}

/// Quoted string; `\<quote>` unescapes, other backslashes are kept
fn lex_quoted(chars: &[char], start: usize) -> Result<(String, usize), TimeExprError> {
    let quote = chars[start];
    let mut text = String::new();
    let mut pos = start + 1;

    while pos < chars.len() {
        match chars[pos] {
            '\\' if pos + 1 < chars.len() => {
                if chars[pos + 1] != quote {
                    text.push('\\');
                }
                text.push(chars[pos + 1]);
                pos += 2;
            }
            c if c == quote => return Ok((text, pos + 1)),
            c => {
                text.push(c);
                pos += 1;
            }
        }
    }

    Err(TimeExprError::UnterminatedString(start))
}

/// `[+-]?([0-9]*\.)?[0-9]+`
fn match_number(chars: &[char], start: usize) -> Option<usize> {
    let mut pos = start;
    if matches!(chars.get(pos), Some('+') | Some('-')) {
        pos += 1;
    }
    let int_end = digits(chars, pos, 0, usize::MAX)?;
    if chars.get(int_end) == Some(&'.') {
        if let Some(end) = digits(chars, int_end + 1, 1, usize::MAX) {
            return Some(end);
        }
    }
    (int_end > pos).then_some(int_end)
}

/// Unquoted `m/d/Y`, `m/d/Y H:M` or `Y-m-dTH:M:S`
fn match_date_literal(chars: &[char], start: usize) -> Option<usize> {
    let slash_date = || {
        let p = digits(chars, start, 1, 2)?;
        let p = literal(chars, p, '/')?;
        let p = digits(chars, p, 1, 2)?;
        let p = literal(chars, p, '/')?;
        let p = digits(chars, p, 4, 4)?;
        // Optional " H:M"
        let mut q = p;
        while matches!(chars.get(q), Some(' ') | Some('\t')) {
            q += 1;
        }
        let time = (q > p)
            .then(|| digits(chars, q, 1, 2))
            .flatten()
            .and_then(|q| literal(chars, q, ':'))
            .and_then(|q| digits(chars, q, 2, 2));
        Some(time.unwrap_or(p))
    };
    let iso = || {
        let p = digits(chars, start, 4, 4)?;
        let p = literal(chars, p, '-')?;
        let p = digits(chars, p, 1, 2)?;
        let p = literal(chars, p, '-')?;
        let p = digits(chars, p, 1, 2)?;
        let p = literal(chars, p, 'T')?;
        let p = digits(chars, p, 1, 2)?;
        let p = literal(chars, p, ':')?;
        let p = digits(chars, p, 2, 2)?;
        let p = literal(chars, p, ':')?;
        digits(chars, p, 2, 2)
    };
    slash_date().or_else(iso)
}

fn digits(chars: &[char], start: usize, min: usize, max: usize) -> Option<usize> {
    let count = chars[start.min(chars.len())..]
        .iter()
        .take(max)
        .take_while(|c| c.is_ascii_digit())
        .count();
    (count >= min).then_some(start + count)
}

fn literal(chars: &[char], pos: usize, expected: char) -> Option<usize> {
    (chars.get(pos) == Some(&expected)).then_some(pos + 1)
}

// ============================================================================
// Parser
// ============================================================================

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn next(&mut self, expected: &'static str) -> Result<(Token, usize), TimeExprError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(TimeExprError::UnexpectedEnd(expected))?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, wanted: Token, expected: &'static str) -> Result<(), TimeExprError> {
        let (token, offset) = self.next(expected)?;
        if token == wanted {
            Ok(())
        } else {
            Err(syntax(expected, &token, offset))
        }
    }

    fn query(mut self) -> Result<TimeExpr, TimeExprError> {
        let expr = if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let start = self.timeref()?;
            self.expect(Token::Comma, "','")?;
            let end = self.timeref()?;
            self.expect(Token::RParen, "')'")?;
            TimeExpr::Pair(start, end)
        } else {
            TimeExpr::Single(self.timeref()?)
        };

        if let Some((token, offset)) = self.tokens.get(self.pos) {
            return Err(syntax("end of expression", token, *offset));
        }
        Ok(expr)
    }

    fn timeref(&mut self) -> Result<TimeRef, TimeExprError> {
        let base = self.abstime()?;
        let mut offset = Duration::zero();

        while let Some(Token::Number(_)) = self.peek() {
            offset = offset
                .checked_add(&self.reltime()?)
                .ok_or(TimeExprError::OutOfRange)?;
        }

        Ok(TimeRef { base, offset })
    }

    fn abstime(&mut self) -> Result<AbsTime, TimeExprError> {
        match self.next("a time")? {
            (Token::Now, _) => Ok(AbsTime::Now),
            (Token::Number(ms), _) => Ok(AbsTime::At(from_millis(ms)?)),
            (Token::Literal(s), _) => Ok(AbsTime::At(parse_time_string(&s)?)),
            (token, offset) => Err(syntax("a time", &token, offset)),
        }
    }

    fn reltime(&mut self) -> Result<Duration, TimeExprError> {
        let quantity = match self.next("a quantity")? {
            (Token::Number(q), _) => q,
            (token, offset) => return Err(syntax("a quantity", &token, offset)),
        };
        let unit_secs = match self.next("a time unit")? {
            (Token::Ident(unit), _) => unit_seconds(&unit)?,
            (token, offset) => return Err(syntax("a time unit", &token, offset)),
        };

        let micros = quantity * unit_secs * 1_000_000.0;
        if !micros.is_finite() || micros.abs() >= i64::MAX as f64 {
            return Err(TimeExprError::OutOfRange);
        }
        Ok(Duration::microseconds(micros.round() as i64))
    }
}

fn syntax(expected: &'static str, found: &Token, offset: usize) -> TimeExprError {
    TimeExprError::Syntax {
        expected,
        found: found.to_string(),
        offset,
    }
}

fn unit_seconds(unit: &str) -> Result<f64, TimeExprError> {
    match unit.to_ascii_lowercase().as_str() {
        "d" | "day" | "days" => Ok(86_400.0),
        "h" | "hour" | "hours" => Ok(3_600.0),
        "m" | "minute" | "minutes" => Ok(60.0),
        "s" | "second" | "seconds" => Ok(1.0),
        _ => Err(TimeExprError::InvalidUnit(unit.to_string())),
    }
}

fn from_millis(ms: f64) -> Result<DateTime<Utc>, TimeExprError> {
    let micros = ms * 1_000.0;
    if !micros.is_finite() || micros.abs() >= i64::MAX as f64 {
        return Err(TimeExprError::OutOfRange);
    }
    DateTime::<Utc>::from_timestamp_micros(micros.round() as i64).ok_or(TimeExprError::OutOfRange)
}
