//! Arithmetic over metric names, used for derived metrics.
//!
//! Grammar:
//!
//! ```text
//! expr   := term (('+' | '-') term)*
//! term   := unary (('*' | '/' | '%') unary)*
//! unary  := ('+' | '-') unary | power
//! power  := atom (('^' | '**') unary)?
//! atom   := number | name | name '(' expr (',' expr)* ')' | '(' expr ')'
//! ```
//!
//! Names resolve against numeric entries of the metrics map. Functions are
//! `abs`, `min`, `max` and `sqrt`.

use std::collections::BTreeMap;

use lab_core::Metrics;
use serde_json::Value;

use crate::AnalysisError;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Op(char),
    Pow,
    LParen,
    RParen,
    Comma,
}

fn err(msg: impl Into<String>) -> AnalysisError {
    AnalysisError::Expression(msg.into())
}

fn tokenize(src: &str) -> Result<Vec<Token>, AnalysisError> {
    let chars: Vec<char> = src.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                let mut j = i + 1;
                if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                    j += 1;
                }
                if j < chars.len() && chars[j].is_ascii_digit() {
                    i = j;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let text: String = chars[start..i].iter().collect();
            let value = text
                .parse::<f64>()
                .map_err(|_| err(format!("bad number literal '{text}'")))?;
            out.push(Token::Num(value));
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                i += 1;
            }
            out.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }
        match c {
            '*' if chars.get(i + 1) == Some(&'*') => {
                out.push(Token::Pow);
                i += 2;
                continue;
            }
            '^' => out.push(Token::Pow),
            '+' | '-' | '*' | '/' | '%' => out.push(Token::Op(c)),
            '(' => out.push(Token::LParen),
            ')' => out.push(Token::RParen),
            ',' => out.push(Token::Comma),
            other => return Err(err(format!("unexpected character '{other}'"))),
        }
        i += 1;
    }
    Ok(out)
}

/// Deepest nesting of parentheses, calls and unary signs accepted.
pub const MAX_EXPRESSION_DEPTH: usize = 64;

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    metrics: &'a Metrics,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expect(&mut self, want: Token) -> Result<(), AnalysisError> {
        match self.next() {
            Some(tok) if tok == want => Ok(()),
            Some(tok) => Err(err(format!("expected {want:?}, found {tok:?}"))),
            None => Err(err(format!("expected {want:?}, found end of input"))),
        }
    }

    fn expr(&mut self) -> Result<f64, AnalysisError> {
        let mut acc = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.term()?;
            acc = if op == '+' { acc + rhs } else { acc - rhs };
        }
        Ok(acc)
    }

    fn term(&mut self) -> Result<f64, AnalysisError> {
        let mut acc = self.unary()?;
        while let Some(Token::Op(op @ ('*' | '/' | '%'))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.unary()?;
            acc = match op {
                '*' => acc * rhs,
                _ if rhs == 0.0 => return Err(err("division by zero")),
                '/' => acc / rhs,
                _ => acc - rhs * (acc / rhs).floor(),
            };
        }
        Ok(acc)
    }

    fn unary(&mut self) -> Result<f64, AnalysisError> {
        if self.depth >= MAX_EXPRESSION_DEPTH {
            return Err(err(format!(
                "expression nested deeper than {MAX_EXPRESSION_DEPTH} levels"
            )));
        }
        self.depth += 1;
        let value = self.signed();
        self.depth -= 1;
        value
    }

    fn signed(&mut self) -> Result<f64, AnalysisError> {
        match self.peek() {
            Some(Token::Op('-')) => {
                self.pos += 1;
                Ok(-self.unary()?)
            }
            Some(Token::Op('+')) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<f64, AnalysisError> {
        let base = self.atom()?;
        if self.peek() == Some(&Token::Pow) {
            self.pos += 1;
            let exp = self.unary()?;
            return Ok(base.powf(exp));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<f64, AnalysisError> {
        match self.next() {
            Some(Token::Num(v)) => Ok(v),
            Some(Token::LParen) => {
                let v = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(v)
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    let mut args = vec![self.expr()?];
                    while self.peek() == Some(&Token::Comma) {
                        self.pos += 1;
                        args.push(self.expr()?);
                    }
                    self.expect(Token::RParen)?;
                    return call(&name, &args);
                }
                self.metrics
                    .get(&name)
                    .and_then(Value::as_f64)
                    .ok_or_else(|| err(format!("unknown or non-numeric metric '{name}'")))
            }
            Some(tok) => Err(err(format!("unexpected token {tok:?}"))),
            None => Err(err("unexpected end of input")),
        }
    }
}

fn call(name: &str, args: &[f64]) -> Result<f64, AnalysisError> {
    match (name, args) {
        ("abs", [x]) => Ok(x.abs()),
        ("sqrt", [x]) => Ok(x.sqrt()),
        ("min", [first, rest @ ..]) => Ok(rest.iter().fold(*first, |a, b| a.min(*b))),
        ("max", [first, rest @ ..]) => Ok(rest.iter().fold(*first, |a, b| a.max(*b))),
        _ => Err(err(format!(
            "unknown function {name} with {} argument(s)",
            args.len()
        ))),
    }
}

/// Evaluates `expr` with metric names bound to their numeric values.
pub fn evaluate_expression(expr: &str, metrics: &Metrics) -> Result<f64, AnalysisError> {
    let tokens = tokenize(expr)?;
    if tokens.is_empty() {
        return Err(err("empty expression"));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
        metrics,
    };
    let value = parser.expr()?;
    if let Some(tok) = parser.peek() {
        return Err(err(format!("trailing input at {tok:?}")));
    }
    if !value.is_finite() {
        return Err(err(format!("'{expr}' is not finite")));
    }
    Ok(value)
}

/// Evaluates every definition against `metrics` alone. Definitions that fail
/// to evaluate are left out of the returned map.
pub fn evaluate_derived(metrics: &Metrics, definitions: &BTreeMap<String, String>) -> Metrics {
    let mut out = Metrics::new();
    for (name, expr) in definitions {
        match evaluate_expression(expr, metrics) {
            Ok(v) => {
                out.insert(name.clone(), Value::from(v));
            }
            Err(e) => {
                tracing::debug!(metric = %name, error = %e, "skipping derived metric");
            }
        }
    }
    out
}
