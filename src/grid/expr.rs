// src/grid/expr.rs

//! Small expression language for job policy attributes.
//!
//! Supports literals (`12`, `1.5`, `"text"`, `true`, `false`,
//! `undefined`), attribute references (case-insensitive, resolved against
//! the job ad), `CurrentTime` / `time()`, arithmetic, comparisons
//! (`== != < <= > >=`, meta-comparisons `=?= =!=`), and `&& || !`.
//! Undefined propagates through everything except the meta-comparisons and
//! short-circuiting boolean operators.

use std::cmp::Ordering;

use super::ad::{AdValue, JobAd};

/// Result of evaluating an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Undefined,
}

impl Value {
    /// Boolean interpretation; `None` means undefined.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            Value::Float(f) => Some(*f != 0.0),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl From<&AdValue> for Value {
    fn from(v: &AdValue) -> Self {
        match v {
            AdValue::Int(i) => Value::Int(*i),
            AdValue::Float(f) => Value::Float(*f),
            AdValue::Bool(b) => Value::Bool(*b),
            AdValue::Str(s) => Value::Str(s.clone()),
            AdValue::Undefined => Value::Undefined,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
}

const OPERATORS: &[&str] = &[
    "=?=", "=!=", "==", "!=", "<=", ">=", "&&", "||", "<", ">", "+", "-", "*", "/", "%", "!",
];

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    'outer: while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '(' {
            tokens.push(Token::LParen);
            i += 1;
            continue;
        }
        if c == ')' {
            tokens.push(Token::RParen);
            i += 1;
            continue;
        }
        if c == '"' {
            let mut s = String::new();
            i += 1;
            while i < chars.len() {
                match chars[i] {
                    '"' => {
                        tokens.push(Token::Str(s));
                        i += 1;
                        continue 'outer;
                    }
                    '\\' if i + 1 < chars.len() => {
                        s.push(chars[i + 1]);
                        i += 2;
                    }
                    ch => {
                        s.push(ch);
                        i += 1;
                    }
                }
            }
            return Err("unterminated string literal".to_string());
        }
        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            if text.contains('.') {
                let f = text.parse().map_err(|_| format!("bad number '{text}'"))?;
                tokens.push(Token::Float(f));
            } else {
                let n = text.parse().map_err(|_| format!("bad number '{text}'"))?;
                tokens.push(Token::Int(n));
            }
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }
        for op in OPERATORS {
            let len = op.len();
            if i + len <= chars.len() && chars[i..i + len].iter().copied().eq(op.chars()) {
                tokens.push(Token::Op(op));
                i += len;
                continue 'outer;
            }
        }
        return Err(format!("unexpected character '{c}'"));
    }
    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Lit(Value),
    Attr(String),
    Now,
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(&'static str, Box<Expr>, Box<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek_op(&self) -> Option<&'static str> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(op)) => Some(op),
            _ => None,
        }
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn binary_level(
        &mut self,
        ops: &[&str],
        next: fn(&mut Self) -> Result<Expr, String>,
    ) -> Result<Expr, String> {
        let mut lhs = next(self)?;
        while let Some(op) = self.peek_op().filter(|op| ops.contains(op)) {
            self.pos += 1;
            let rhs = next(self)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn or(&mut self) -> Result<Expr, String> {
        self.binary_level(&["||"], Self::and)
    }

    fn and(&mut self) -> Result<Expr, String> {
        self.binary_level(&["&&"], Self::comparison)
    }

    fn comparison(&mut self) -> Result<Expr, String> {
        self.binary_level(
            &["==", "!=", "<", "<=", ">", ">=", "=?=", "=!="],
            Self::additive,
        )
    }

    fn additive(&mut self) -> Result<Expr, String> {
        self.binary_level(&["+", "-"], Self::multiplicative)
    }

    fn multiplicative(&mut self) -> Result<Expr, String> {
        self.binary_level(&["*", "/", "%"], Self::unary)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        match self.peek_op() {
            Some("!") => {
                self.pos += 1;
                Ok(Expr::Not(Box::new(self.unary()?)))
            }
            Some("-") => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Int(i)) => Ok(Expr::Lit(Value::Int(i))),
            Some(Token::Float(f)) => Ok(Expr::Lit(Value::Float(f))),
            Some(Token::Str(s)) => Ok(Expr::Lit(Value::Str(s))),
            Some(Token::LParen) => {
                let inner = self.or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("expected ')'".to_string()),
                }
            }
            Some(Token::Ident(name)) => {
                if self.tokens.get(self.pos) == Some(&Token::LParen) {
                    self.pos += 1;
                    if self.next() != Some(Token::RParen) || !name.eq_ignore_ascii_case("time") {
                        return Err(format!("unsupported function '{name}'"));
                    }
                    return Ok(Expr::Now);
                }
                Ok(match name.to_ascii_lowercase().as_str() {
                    "true" => Expr::Lit(Value::Bool(true)),
                    "false" => Expr::Lit(Value::Bool(false)),
                    "undefined" => Expr::Lit(Value::Undefined),
                    "currenttime" => Expr::Now,
                    _ => Expr::Attr(name),
                })
            }
            Some(other) => Err(format!("unexpected token {other:?}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

/// Parsed policy expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    root: Expr,
}

impl Expression {
    pub fn parse(src: &str) -> Result<Self, String> {
        let tokens = tokenize(src)?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.or()?;
        if parser.pos < parser.tokens.len() {
            return Err(format!("trailing input in '{src}'"));
        }
        Ok(Self { root })
    }

    pub fn eval(&self, ad: &JobAd, now: i64) -> Value {
        eval(&self.root, ad, now)
    }
}

fn eval(expr: &Expr, ad: &JobAd, now: i64) -> Value {
    match expr {
        Expr::Lit(v) => v.clone(),
        Expr::Now => Value::Int(now),
        Expr::Attr(name) => ad.get(name).map(Value::from).unwrap_or(Value::Undefined),
        Expr::Not(inner) => match eval(inner, ad, now).as_bool() {
            Some(b) => Value::Bool(!b),
            None => Value::Undefined,
        },
        Expr::Neg(inner) => match eval(inner, ad, now) {
            Value::Int(i) => i.checked_neg().map(Value::Int).unwrap_or(Value::Undefined),
            Value::Float(f) => Value::Float(-f),
            _ => Value::Undefined,
        },
        Expr::Binary("&&", lhs, rhs) => {
            let l = eval(lhs, ad, now).as_bool();
            if l == Some(false) {
                return Value::Bool(false);
            }
            match (l, eval(rhs, ad, now).as_bool()) {
                (_, Some(false)) => Value::Bool(false),
                (Some(true), Some(true)) => Value::Bool(true),
                _ => Value::Undefined,
            }
        }
        Expr::Binary("||", lhs, rhs) => {
            let l = eval(lhs, ad, now).as_bool();
            if l == Some(true) {
                return Value::Bool(true);
            }
            match (l, eval(rhs, ad, now).as_bool()) {
                (_, Some(true)) => Value::Bool(true),
                (Some(false), Some(false)) => Value::Bool(false),
                _ => Value::Undefined,
            }
        }
        Expr::Binary(op, lhs, rhs) => {
            let l = eval(lhs, ad, now);
            let r = eval(rhs, ad, now);
            match *op {
                "=?=" => Value::Bool(identical(&l, &r)),
                "=!=" => Value::Bool(!identical(&l, &r)),
                "+" | "-" | "*" | "/" | "%" => arithmetic(op, &l, &r),
                _ => compare(op, &l, &r),
            }
        }
    }
}

fn identical(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => *a as f64 == *b,
        _ => l == r,
    }
}

fn arithmetic(op: &str, l: &Value, r: &Value) -> Value {
    if let (Value::Int(a), Value::Int(b)) = (l, r) {
        let out = match op {
            "+" => a.checked_add(*b),
            "-" => a.checked_sub(*b),
            "*" => a.checked_mul(*b),
            "/" => a.checked_div(*b),
            _ => a.checked_rem(*b),
        };
        return out.map(Value::Int).unwrap_or(Value::Undefined);
    }
    let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
        return Value::Undefined;
    };
    match op {
        "+" => Value::Float(a + b),
        "-" => Value::Float(a - b),
        "*" => Value::Float(a * b),
        "/" if b != 0.0 => Value::Float(a / b),
        "%" if b != 0.0 => Value::Float(a % b),
        _ => Value::Undefined,
    }
}

fn compare(op: &str, l: &Value, r: &Value) -> Value {
    let ordering = match (l, r) {
        (Value::Str(a), Value::Str(b)) => Some(a.to_lowercase().cmp(&b.to_lowercase())),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => match (l.as_f64(), r.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
    };
    let Some(ordering) = ordering else {
        return Value::Undefined;
    };
    Value::Bool(match op {
        "==" => ordering == Ordering::Equal,
        "!=" => ordering != Ordering::Equal,
        "<" => ordering == Ordering::Less,
        "<=" => ordering != Ordering::Greater,
        ">" => ordering == Ordering::Greater,
        _ => ordering != Ordering::Less,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ad() -> JobAd {
        let mut ad = JobAd::new();
        ad.set("JobStatus", 2);
        ad.set("EnteredCurrentStatus", 1000);
        ad.set("Owner", "alice");
        ad
    }

    fn eval_str(src: &str) -> Value {
        Expression::parse(src).unwrap().eval(&ad(), 5000)
    }

    #[test]
    fn arithmetic_and_comparison() {
        assert_eq!(
            eval_str("CurrentTime - EnteredCurrentStatus > 3600"),
            Value::Bool(true)
        );
        assert_eq!(eval_str("(1 + 2) * 3 == 9"), Value::Bool(true));
        assert_eq!(eval_str("owner == \"ALICE\""), Value::Bool(true));
        assert_eq!(eval_str("7 / 0"), Value::Undefined);
    }

    #[test]
    fn undefined_propagates_except_where_short_circuited() {
        assert_eq!(eval_str("NoSuchAttr > 3"), Value::Undefined);
        assert_eq!(eval_str("NoSuchAttr > 3 && false"), Value::Bool(false));
        assert_eq!(eval_str("true || NoSuchAttr"), Value::Bool(true));
        assert_eq!(eval_str("NoSuchAttr =?= undefined"), Value::Bool(true));
        assert_eq!(eval_str("!NoSuchAttr"), Value::Undefined);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(Expression::parse("JobStatus ==").is_err());
        assert!(Expression::parse("(1 + 2").is_err());
        assert!(Expression::parse("\"open").is_err());
        assert!(Expression::parse("foo(1)").is_err());
        assert!(Expression::parse("1 2").is_err());
    }
}
