//! Rule language for generated strategies.
//!
//! A producer returns plain text such as
//!
//! ```text
//! # trend filter with an RSI guard
//! let fast = ema(close, 5)
//! let slow = sma(close, 20)
//! long: fast > slow and rsi(close, 14) < 70
//! short: fast < slow
//! ```
//!
//! The text is compiled into a [`RuleProgram`] and type-checked before it is
//! ever run. Nothing in a program can touch the filesystem, network or
//! process: it can only read the bar columns and call the indicator set below.

use std::collections::HashMap;
use std::fmt;

use crate::error::EngineError;
use crate::indicator::{self, Series};
use crate::ohlc::PriceSeries;

pub const MAX_PERIOD: usize = 500;
const MAX_LINES: usize = 200;
const MAX_BINDINGS: usize = 64;
const SMOKE_BARS: usize = 64;
/// Nesting of parentheses, calls, `not` and unary minus.
pub const MAX_DEPTH: usize = 32;
/// Bounds binary-operator chains, which nest one level per operator.
pub const MAX_LINE_LEN: usize = 400;

const INPUTS: [&str; 5] = ["open", "high", "low", "close", "volume"];
const KEYWORDS: [&str; 6] = ["let", "and", "or", "not", "long", "short"];

#[derive(Debug, Clone, PartialEq)]
pub struct RuleError {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for RuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for RuleError {}

impl From<RuleError> for EngineError {
    fn from(e: RuleError) -> Self {
        EngineError::InvalidGeneratedStrategy(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Sma,
    Ema,
    Rsi,
    Roc,
    Std,
    Lag,
    Highest,
    Lowest,
}

impl Func {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "sma" => Func::Sma,
            "ema" => Func::Ema,
            "rsi" => Func::Rsi,
            "roc" => Func::Roc,
            "std" => Func::Std,
            "lag" => Func::Lag,
            "highest" => Func::Highest,
            "lowest" => Func::Lowest,
            _ => return None,
        })
    }

    fn apply(self, x: &[Option<f64>], n: usize) -> Series {
        match self {
            Func::Sma => indicator::sma(x, n),
            Func::Ema => indicator::ema(x, n),
            Func::Rsi => indicator::rsi(x, n),
            Func::Roc => indicator::roc(x, n),
            Func::Std => indicator::rolling_std(x, n),
            Func::Lag => indicator::lag(x, n),
            Func::Highest => indicator::highest(x, n),
            Func::Lowest => indicator::lowest(x, n),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
    And,
    Or,
}

impl BinOp {
    fn is_arith(self) -> bool {
        matches!(self, BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div)
    }

    fn is_logic(self) -> bool {
        matches!(self, BinOp::And | BinOp::Or)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    Var(String),
    Call {
        func: Func,
        arg: Box<Expr>,
        period: usize,
    },
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Bin {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ty {
    Num,
    Bool,
}

/// A compiled, type-checked rule set.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleProgram {
    bindings: Vec<(String, Expr)>,
    long: Option<Expr>,
    short: Option<Expr>,
}

// ---------------------------------------------------------------- lexer

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Num(f64),
    LParen,
    RParen,
    Comma,
    Colon,
    Assign,
    Op(BinOp),
    Minus,
}

fn lex(line: &str, line_no: usize) -> Result<Vec<Tok>, RuleError> {
    let err = |message: String| RuleError {
        line: line_no,
        message,
    };
    let chars: Vec<char> = line.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' => i += 1,
            '#' => break,
            '(' => {
                out.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                out.push(Tok::RParen);
                i += 1;
            }
            ',' => {
                out.push(Tok::Comma);
                i += 1;
            }
            ':' => {
                out.push(Tok::Colon);
                i += 1;
            }
            '+' => {
                out.push(Tok::Op(BinOp::Add));
                i += 1;
            }
            '-' => {
                out.push(Tok::Minus);
                i += 1;
            }
            '*' => {
                out.push(Tok::Op(BinOp::Mul));
                i += 1;
            }
            '/' => {
                out.push(Tok::Op(BinOp::Div));
                i += 1;
            }
            '>' | '<' | '=' | '!' => {
                let next_eq = chars.get(i + 1) == Some(&'=');
                let tok = match (c, next_eq) {
                    ('>', true) => Tok::Op(BinOp::Ge),
                    ('>', false) => Tok::Op(BinOp::Gt),
                    ('<', true) => Tok::Op(BinOp::Le),
                    ('<', false) => Tok::Op(BinOp::Lt),
                    ('=', true) => Tok::Op(BinOp::Eq),
                    ('=', false) => Tok::Assign,
                    ('!', true) => Tok::Op(BinOp::Ne),
                    _ => return Err(err("unexpected '!'".into())),
                };
                out.push(tok);
                i += if next_eq { 2 } else { 1 };
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let v = text
                    .parse::<f64>()
                    .map_err(|_| err(format!("bad number '{}'", text)))?;
                out.push(Tok::Num(v));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                out.push(Tok::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(err(format!("unexpected character '{}'", other))),
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------- parser

struct Parser<'a> {
    toks: &'a [Tok],
    pos: usize,
    line: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn nest<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, RuleError>) -> Result<T, RuleError> {
        if self.depth >= MAX_DEPTH {
            return self.err(format!("expression nested deeper than {}", MAX_DEPTH));
        }
        self.depth += 1;
        let out = f(self);
        self.depth -= 1;
        out
    }

    fn err<T>(&self, message: impl Into<String>) -> Result<T, RuleError> {
        Err(RuleError {
            line: self.line,
            message: message.into(),
        })
    }

    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn next(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if matches!(self.peek(), Some(Tok::Ident(s)) if s == kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Tok, what: &str) -> Result<(), RuleError> {
        match self.next() {
            Some(t) if t == tok => Ok(()),
            Some(t) => self.err(format!("expected {}, found {:?}", what, t)),
            None => self.err(format!("expected {}, found end of line", what)),
        }
    }

    fn expr(&mut self) -> Result<Expr, RuleError> {
        let mut lhs = self.and()?;
        while self.eat_keyword("or") {
            let rhs = self.and()?;
            lhs = bin(BinOp::Or, lhs, rhs);
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, RuleError> {
        let mut lhs = self.not()?;
        while self.eat_keyword("and") {
            let rhs = self.not()?;
            lhs = bin(BinOp::And, lhs, rhs);
        }
        Ok(lhs)
    }

    fn not(&mut self) -> Result<Expr, RuleError> {
        if self.eat_keyword("not") {
            let inner = self.nest(|p| p.not())?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.cmp()
    }

    fn cmp(&mut self) -> Result<Expr, RuleError> {
        let lhs = self.add()?;
        if let Some(Tok::Op(op)) = self.peek().cloned()
            && !op.is_arith()
            && !op.is_logic()
        {
            self.pos += 1;
            let rhs = self.add()?;
            if let Some(Tok::Op(next)) = self.peek()
                && !next.is_arith()
            {
                return self.err("comparisons cannot be chained; use 'and'");
            }
            return Ok(bin(op, lhs, rhs));
        }
        Ok(lhs)
    }

    fn add(&mut self) -> Result<Expr, RuleError> {
        let mut lhs = self.mul()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Op(BinOp::Add)) => BinOp::Add,
                Some(Tok::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.mul()?;
            lhs = bin(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn mul(&mut self) -> Result<Expr, RuleError> {
        let mut lhs = self.unary()?;
        while let Some(Tok::Op(op @ (BinOp::Mul | BinOp::Div))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = bin(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, RuleError> {
        if self.peek() == Some(&Tok::Minus) {
            self.pos += 1;
            let inner = self.nest(|p| p.unary())?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, RuleError> {
        match self.next() {
            Some(Tok::Num(v)) => Ok(Expr::Num(v)),
            Some(Tok::LParen) => {
                let e = self.nest(|p| p.expr())?;
                self.expect(Tok::RParen, "')'")?;
                Ok(e)
            }
            Some(Tok::Ident(name)) => {
                if self.peek() != Some(&Tok::LParen) {
                    return Ok(Expr::Var(name));
                }
                let Some(func) = Func::parse(&name) else {
                    return self.err(format!("unknown function '{}'", name));
                };
                self.pos += 1;
                let arg = self.nest(|p| p.expr())?;
                self.expect(Tok::Comma, "','")?;
                let period = match self.next() {
                    Some(Tok::Num(v)) if v.fract() == 0.0 && v >= 1.0 && v <= MAX_PERIOD as f64 => {
                        v as usize
                    }
                    Some(Tok::Num(v)) => {
                        return self.err(format!(
                            "period {} of '{}' must be an integer in 1..={}",
                            v, name, MAX_PERIOD
                        ));
                    }
                    _ => return self.err(format!("'{}' expects an integer period", name)),
                };
                self.expect(Tok::RParen, "')'")?;
                Ok(Expr::Call {
                    func,
                    arg: Box::new(arg),
                    period,
                })
            }
            Some(t) => self.err(format!("unexpected {:?}", t)),
            None => self.err("unexpected end of line"),
        }
    }
}

fn bin(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Bin {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

fn type_of(e: &Expr, env: &HashMap<String, Ty>, line: usize) -> Result<Ty, RuleError> {
    let err = |message: String| Err(RuleError { line, message });
    match e {
        Expr::Num(_) => Ok(Ty::Num),
        Expr::Var(name) => match env.get(name) {
            Some(t) => Ok(*t),
            None => err(format!("undefined name '{}'", name)),
        },
        Expr::Call { func, arg, .. } => match type_of(arg, env, line)? {
            Ty::Num => Ok(Ty::Num),
            Ty::Bool => err(format!("{:?} expects a numeric series", func).to_lowercase()),
        },
        Expr::Neg(inner) => match type_of(inner, env, line)? {
            Ty::Num => Ok(Ty::Num),
            Ty::Bool => err("cannot negate a condition; use 'not'".into()),
        },
        Expr::Not(inner) => match type_of(inner, env, line)? {
            Ty::Bool => Ok(Ty::Bool),
            Ty::Num => err("'not' expects a condition".into()),
        },
        Expr::Bin { op, lhs, rhs } => {
            let (l, r) = (type_of(lhs, env, line)?, type_of(rhs, env, line)?);
            if op.is_logic() {
                if l == Ty::Bool && r == Ty::Bool {
                    Ok(Ty::Bool)
                } else {
                    err("'and'/'or' expect conditions on both sides".into())
                }
            } else if l == Ty::Num && r == Ty::Num {
                Ok(if op.is_arith() { Ty::Num } else { Ty::Bool })
            } else {
                err("arithmetic and comparisons expect numbers on both sides".into())
            }
        }
    }
}

/// Strip a markdown code fence if the text is wrapped in one.
pub fn extract_source(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed;
    };
    let after = &trimmed[start + 3..];
    // drop the info string (```rules)
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(after.len());
    let body = &after[body_start..];
    match body.rfind("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

/// Parse and type-check rule text.
pub fn compile(raw: &str) -> Result<RuleProgram, RuleError> {
    let source = extract_source(raw);
    let mut env: HashMap<String, Ty> = INPUTS.iter().map(|n| (n.to_string(), Ty::Num)).collect();
    let mut program = RuleProgram {
        bindings: Vec::new(),
        long: None,
        short: None,
    };

    for (idx, line) in source.lines().enumerate() {
        let line_no = idx + 1;
        if line_no > MAX_LINES {
            return Err(RuleError {
                line: line_no,
                message: format!("more than {} lines", MAX_LINES),
            });
        }
        if line.len() > MAX_LINE_LEN {
            return Err(RuleError {
                line: line_no,
                message: format!("line longer than {} characters", MAX_LINE_LEN),
            });
        }
        let toks = lex(line, line_no)?;
        if toks.is_empty() {
            continue;
        }
        let mut p = Parser {
            toks: &toks,
            pos: 0,
            line: line_no,
            depth: 0,
        };

        if p.eat_keyword("let") {
            let name = match p.next() {
                Some(Tok::Ident(n)) => n,
                _ => return p.err("expected a name after 'let'"),
            };
            if KEYWORDS.contains(&name.as_str()) || Func::parse(&name).is_some() {
                return p.err(format!("'{}' is reserved", name));
            }
            if env.contains_key(&name) {
                return p.err(format!("'{}' is already defined", name));
            }
            p.expect(Tok::Assign, "'='")?;
            let e = p.expr()?;
            if p.pos < toks.len() {
                return p.err("trailing input");
            }
            let ty = type_of(&e, &env, line_no)?;
            if program.bindings.len() >= MAX_BINDINGS {
                return p.err(format!("more than {} bindings", MAX_BINDINGS));
            }
            env.insert(name.clone(), ty);
            program.bindings.push((name, e));
            continue;
        }

        let is_long = p.eat_keyword("long");
        let is_short = !is_long && p.eat_keyword("short");
        if !is_long && !is_short {
            return p.err("expected 'let', 'long:' or 'short:'");
        }
        p.expect(Tok::Colon, "':'")?;
        let e = p.expr()?;
        if p.pos < toks.len() {
            return p.err("trailing input");
        }
        if type_of(&e, &env, line_no)? != Ty::Bool {
            return p.err("a rule must be a condition");
        }
        let slot = if is_long {
            &mut program.long
        } else {
            &mut program.short
        };
        if slot.is_some() {
            return p.err(format!(
                "duplicate '{}' rule",
                if is_long { "long" } else { "short" }
            ));
        }
        *slot = Some(e);
    }

    if program.long.is_none() && program.short.is_none() {
        return Err(RuleError {
            line: 0,
            message: "no 'long:' or 'short:' rule; nothing generates signals".into(),
        });
    }
    Ok(program)
}

// ---------------------------------------------------------------- evaluator

enum Value {
    Num(Series),
    Bool(Vec<Option<bool>>),
}

struct Frame<'a> {
    len: usize,
    vars: HashMap<&'a str, Value>,
}

fn eval_num(e: &Expr, f: &Frame) -> Series {
    match eval(e, f) {
        Value::Num(v) => v,
        Value::Bool(_) => vec![None; f.len],
    }
}

fn eval_bool(e: &Expr, f: &Frame) -> Vec<Option<bool>> {
    match eval(e, f) {
        Value::Bool(v) => v,
        Value::Num(_) => vec![None; f.len],
    }
}

fn eval(e: &Expr, f: &Frame) -> Value {
    match e {
        Expr::Num(v) => Value::Num(vec![Some(*v); f.len]),
        Expr::Var(name) => match f.vars.get(name.as_str()) {
            Some(Value::Num(v)) => Value::Num(v.clone()),
            Some(Value::Bool(v)) => Value::Bool(v.clone()),
            None => Value::Num(vec![None; f.len]),
        },
        Expr::Call { func, arg, period } => Value::Num(func.apply(&eval_num(arg, f), *period)),
        Expr::Neg(inner) => Value::Num(eval_num(inner, f).into_iter().map(|v| v.map(|x| -x)).collect()),
        Expr::Not(inner) => {
            Value::Bool(eval_bool(inner, f).into_iter().map(|v| v.map(|b| !b)).collect())
        }
        Expr::Bin { op, lhs, rhs } if op.is_logic() => {
            let (l, r) = (eval_bool(lhs, f), eval_bool(rhs, f));
            Value::Bool(
                l.into_iter()
                    .zip(r)
                    .map(|(a, b)| match (op, a, b) {
                        (BinOp::And, Some(false), _) | (BinOp::And, _, Some(false)) => Some(false),
                        (BinOp::Or, Some(true), _) | (BinOp::Or, _, Some(true)) => Some(true),
                        (_, Some(a), Some(b)) => Some(if *op == BinOp::And { a && b } else { a || b }),
                        _ => None,
                    })
                    .collect(),
            )
        }
        Expr::Bin { op, lhs, rhs } => {
            let (l, r) = (eval_num(lhs, f), eval_num(rhs, f));
            let pairs = l.into_iter().zip(r);
            if op.is_arith() {
                Value::Num(
                    pairs
                        .map(|(a, b)| {
                            let (a, b) = (a?, b?);
                            let v = match op {
                                BinOp::Add => a + b,
                                BinOp::Sub => a - b,
                                BinOp::Mul => a * b,
                                _ if b == 0.0 => return None,
                                _ => a / b,
                            };
                            v.is_finite().then_some(v)
                        })
                        .collect(),
                )
            } else {
                Value::Bool(
                    pairs
                        .map(|(a, b)| {
                            let (a, b) = (a?, b?);
                            Some(match op {
                                BinOp::Gt => a > b,
                                BinOp::Lt => a < b,
                                BinOp::Ge => a >= b,
                                BinOp::Le => a <= b,
                                BinOp::Eq => a == b,
                                _ => a != b,
                            })
                        })
                        .collect(),
                )
            }
        }
    }
}

impl RuleProgram {
    /// One signal per bar: +1 long, -1 short, 0 when neither or both hold.
    pub fn evaluate(&self, series: &PriceSeries) -> Vec<f64> {
        let len = series.len();
        let mut frame = Frame {
            len,
            vars: HashMap::new(),
        };
        frame.vars.insert("open", Value::Num(indicator::lift(&series.opens())));
        frame.vars.insert("high", Value::Num(indicator::lift(&series.highs())));
        frame.vars.insert("low", Value::Num(indicator::lift(&series.lows())));
        frame.vars.insert("close", Value::Num(indicator::lift(&series.closes())));
        frame.vars.insert("volume", Value::Num(indicator::lift(&series.volumes())));
        for (name, e) in &self.bindings {
            let v = eval(e, &frame);
            frame.vars.insert(name.as_str(), v);
        }

        let holds = |rule: &Option<Expr>| -> Vec<bool> {
            match rule {
                Some(e) => eval_bool(e, &frame)
                    .into_iter()
                    .map(|v| v.unwrap_or(false))
                    .collect(),
                None => vec![false; len],
            }
        };
        let long = holds(&self.long);
        let short = holds(&self.short);
        long.into_iter()
            .zip(short)
            .map(|(l, s)| match (l, s) {
                (true, false) => 1.0,
                (false, true) => -1.0,
                _ => 0.0,
            })
            .collect()
    }

    pub fn has_long(&self) -> bool {
        self.long.is_some()
    }

    pub fn has_short(&self) -> bool {
        self.short.is_some()
    }
}

/// Deterministic series for smoke-testing compiled programs.
pub fn smoke_series() -> Result<PriceSeries, EngineError> {
    let start = chrono::NaiveDate::from_ymd_opt(2020, 1, 1)
        .map(crate::ohlc::date_to_utc)
        .ok_or_else(|| EngineError::MalformedSeries("bad smoke start date".into()))?;
    let bars = (0..SMOKE_BARS)
        .map(|i| {
            let t = i as f64;
            let close = 100.0 + 0.3 * t + 6.0 * (t / 5.0).sin();
            crate::ohlc::Bar {
                timestamp: start + chrono::Duration::days(i as i64),
                open: close - (t / 3.0).cos(),
                high: close + 1.5,
                low: close - 1.5,
                close,
                volume: 1_000.0 + 10.0 * t,
            }
        })
        .collect();
    PriceSeries::new("SMOKE", bars)
}

/// Compile and smoke-test rule text. Any failure is
/// [`EngineError::InvalidGeneratedStrategy`].
pub fn validate(raw: &str) -> Result<RuleProgram, EngineError> {
    let program = compile(raw)?;
    let series = smoke_series()?;
    let signals = program.evaluate(&series);
    if signals.len() != series.len() || signals.iter().any(|s| !s.is_finite()) {
        return Err(EngineError::InvalidGeneratedStrategy(
            "smoke test produced malformed signals".into(),
        ));
    }
    Ok(program)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(closes: &[f64]) -> PriceSeries {
        let start = chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        PriceSeries::from_closes("T", start, closes).unwrap()
    }

    #[test]
    fn compiles_full_example() {
        let p = compile(
            "# demo\nlet fast = ema(close, 5)\nlet slow = sma(close, 20)\n\
             long: fast > slow and rsi(close, 14) < 70\nshort: fast < slow\n",
        )
        .unwrap();
        assert!(p.has_long());
        assert!(p.has_short());
        assert_eq!(p.bindings.len(), 2);
    }

    #[test]
    fn unwraps_markdown_fence() {
        let raw = "Here you go:\n```rules\nlong: close > open\n```\nthanks";
        assert_eq!(extract_source(raw), "long: close > open");
        assert!(compile(raw).is_ok());
    }

    #[test]
    fn requires_a_signal_rule() {
        let err = compile("let x = sma(close, 3)").unwrap_err();
        assert!(err.message.contains("nothing generates signals"));
    }

    #[test]
    fn rejects_unknown_names_and_functions() {
        assert!(compile("long: price > 1").unwrap_err().message.contains("undefined"));
        assert!(compile("long: macd(close, 3) > 1").unwrap_err().message.contains("unknown function"));
        assert!(compile("import os").is_err());
    }

    #[test]
    fn rejects_type_errors() {
        assert!(compile("long: close + 1").is_err());
        assert!(compile("long: (close > 1) + 1 > 0").is_err());
        assert!(compile("long: not close").is_err());
        assert!(compile("long: close > 1 > 0").is_err());
    }

    #[test]
    fn rejects_bad_periods_and_redefinition() {
        assert!(compile("long: sma(close, 0) > 1").is_err());
        assert!(compile("long: sma(close, 2.5) > 1").is_err());
        assert!(compile("long: sma(close, 501) > 1").is_err());
        assert!(compile("let close = 1\nlong: close > 0").is_err());
        assert!(compile("let a = 1\nlet a = 2\nlong: a > 0").is_err());
        assert!(compile("long: close > 1\nlong: close < 1").is_err());
    }

    #[test]
    fn deep_nesting_is_rejected_not_recursed() {
        for n in [3_000, 30_000] {
            let parens = format!("long: {}close > 1{}", "(".repeat(n), ")".repeat(n));
            assert!(matches!(
                validate(&parens),
                Err(EngineError::InvalidGeneratedStrategy(_))
            ));
        }
        let nots = format!("long: {}close > 1", "not ".repeat(5_000));
        assert!(matches!(validate(&nots), Err(EngineError::InvalidGeneratedStrategy(_))));
        let negs = format!("long: {}close > 1", "- ".repeat(5_000));
        assert!(matches!(validate(&negs), Err(EngineError::InvalidGeneratedStrategy(_))));
        let chain = format!("long: close{} > 1", " + 1".repeat(5_000));
        assert!(matches!(validate(&chain), Err(EngineError::InvalidGeneratedStrategy(_))));

        // within the limits still compiles
        let ok = format!("long: {}close > 1{}", "(".repeat(MAX_DEPTH - 1), ")".repeat(MAX_DEPTH - 1));
        assert!(compile(&ok).is_ok());
        let err = compile(&format!("long: {}close > 1{}", "(".repeat(40), ")".repeat(40))).unwrap_err();
        assert!(err.message.contains("nested deeper"), "{}", err);
    }

    #[test]
    fn error_reports_line_number() {
        let err = compile("let a = sma(close, 3)\n\nlong: a >").unwrap_err();
        assert_eq!(err.line, 3);
    }

    #[test]
    fn evaluates_long_short_and_warmup() {
        let s = series(&[1.0, 2.0, 3.0, 2.0, 1.0]);
        let p = compile("long: close > lag(close, 1)\nshort: close < lag(close, 1)").unwrap();
        assert_eq!(p.evaluate(&s), vec![0.0, 1.0, 1.0, -1.0, -1.0]);
    }

    #[test]
    fn both_rules_true_is_flat() {
        let s = series(&[1.0, 2.0, 3.0]);
        let p = compile("long: close > 0\nshort: close > 0").unwrap();
        assert_eq!(p.evaluate(&s), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn arithmetic_and_precedence() {
        let s = series(&[10.0, 10.0, 10.0]);
        let p = compile("long: close - 2 * 3 == 4 and not (close / 0 > 1)").unwrap();
        // division by zero is undefined, so the inner comparison is undefined
        // and the whole condition is false
        assert_eq!(p.evaluate(&s), vec![0.0, 0.0, 0.0]);
        let p = compile("long: close - 2 * 3 == 4 or close / 0 > 1").unwrap();
        assert_eq!(p.evaluate(&s), vec![1.0, 1.0, 1.0]);
        let p = compile("short: -close < -5").unwrap();
        assert_eq!(p.evaluate(&s), vec![-1.0, -1.0, -1.0]);
    }

    #[test]
    fn boolean_bindings() {
        let s = series(&[1.0, 3.0, 2.0]);
        let p = compile("let up = close > lag(close, 1)\nlong: up\nshort: not up").unwrap();
        assert_eq!(p.evaluate(&s), vec![0.0, 1.0, -1.0]);
    }

    #[test]
    fn validate_runs_smoke_test() {
        assert!(validate("long: ema(close, 5) > sma(close, 20)").is_ok());
        assert!(matches!(
            validate("class Strategy: pass"),
            Err(EngineError::InvalidGeneratedStrategy(_))
        ));
    }
}
