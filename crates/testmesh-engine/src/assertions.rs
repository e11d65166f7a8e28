//! Assertion expression evaluator.
//!
//! Assertions are boolean expressions evaluated against a step's output
//! mapping, e.g. `status == 200`, `body.id == 1`,
//! `contains(body.name, "x") && len(body.items) > 0`.
//!
//! Supported: literals (numbers, quoted strings, `true`/`false`/`null`),
//! dotted field paths into the output, `== != < <= > >=`, `&& || !`,
//! `len(x)`, `contains(a, b)`, `matches(s, pattern)` and parentheses.
//!
//! Referencing an undefined field is an error here (unlike output
//! extraction, where a mismatch yields nil). The first failing assertion
//! short-circuits and reports the observed values it referenced.

use regex::Regex;
use serde_json::{Map, Value};

use testmesh_core::{Error, Result};

/// Evaluate an ordered list of assertions against an output mapping.
/// Stops at the first failure.
pub fn evaluate_all(output: &Map<String, Value>, expressions: &[String]) -> Result<()> {
    for expression in expressions {
        check(output, expression).map_err(Error::Assertion)?;
    }
    Ok(())
}

/// Evaluate a single assertion. `Err` carries the failure detail including
/// the expression and the observed values it referenced.
pub fn check(output: &Map<String, Value>, expression: &str) -> std::result::Result<(), String> {
    let expr = parse(expression).map_err(|e| format!("`{expression}`: {e}"))?;

    match eval(&expr, output) {
        Ok(Value::Bool(true)) => Ok(()),
        Ok(Value::Bool(false)) => Err(format!(
            "`{expression}` is false{}",
            observed_values(&expr, output)
        )),
        Ok(other) => Err(format!(
            "`{expression}` evaluated to {other} instead of a boolean"
        )),
        Err(e) => Err(format!("`{expression}`: {e}")),
    }
}

fn observed_values(expr: &Expr, output: &Map<String, Value>) -> String {
    let mut paths = Vec::new();
    collect_paths(expr, &mut paths);
    let rendered: Vec<String> = paths
        .iter()
        .filter_map(|path| {
            resolve_path(path, output)
                .ok()
                .map(|value| format!("{path} = {value}"))
        })
        .collect();
    if rendered.is_empty() {
        String::new()
    } else {
        format!(" ({})", rendered.join(", "))
    }
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Path(String),
    Not(Box<Expr>),
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        func: Func,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Len,
    Contains,
    Matches,
}

fn collect_paths(expr: &Expr, paths: &mut Vec<String>) {
    match expr {
        Expr::Path(path) => {
            if !paths.contains(path) {
                paths.push(path.clone());
            }
        }
        Expr::Not(inner) => collect_paths(inner, paths),
        Expr::Binary { left, right, .. } => {
            collect_paths(left, paths);
            collect_paths(right, paths);
        }
        Expr::Call { args, .. } => {
            for arg in args {
                collect_paths(arg, paths);
            }
        }
        Expr::Literal(_) => {}
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    LParen,
    RParen,
    Comma,
}

fn lex(input: &str) -> std::result::Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '=' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::Eq);
                } else {
                    return Err("single `=` is not an operator, use `==`".to_string());
                }
            }
            '!' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::Ne);
                } else {
                    tokens.push(Token::Not);
                }
            }
            '<' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::Le);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '&' => {
                chars.next();
                if chars.next_if_eq(&'&').is_some() {
                    tokens.push(Token::And);
                } else {
                    return Err("single `&` is not an operator, use `&&`".to_string());
                }
            }
            '|' => {
                chars.next();
                if chars.next_if_eq(&'|').is_some() {
                    tokens.push(Token::Or);
                } else {
                    return Err("single `|` is not an operator, use `||`".to_string());
                }
            }
            '\'' | '"' => {
                tokens.push(Token::Str(lex_string(&mut chars)?));
            }
            '-' | '0'..='9' => {
                tokens.push(Token::Number(lex_number(&mut chars)?));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                tokens.push(Token::Ident(lex_ident(&mut chars)));
            }
            other => return Err(format!("unexpected character `{other}`")),
        }
    }

    Ok(tokens)
}

fn lex_string(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
) -> std::result::Result<String, String> {
    let quote = chars.next().unwrap();
    let mut value = String::new();
    for c in chars.by_ref() {
        if c == quote {
            return Ok(value);
        }
        value.push(c);
    }
    Err("unterminated string literal".to_string())
}

fn lex_number(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
) -> std::result::Result<f64, String> {
    let mut text = String::new();
    if chars.peek() == Some(&'-') {
        text.push(chars.next().unwrap());
    }
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() || c == '.' {
            text.push(c);
            chars.next();
        } else {
            break;
        }
    }
    text.parse::<f64>()
        .map_err(|_| format!("invalid number literal `{text}`"))
}

fn lex_ident(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut text = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
            text.push(c);
            chars.next();
        } else {
            break;
        }
    }
    text
}

// ---------------------------------------------------------------------------
// Parser (recursive descent: || over && over comparison over unary)
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

fn parse(input: &str) -> std::result::Result<Expr, String> {
    let tokens = lex(input)?;
    if tokens.is_empty() {
        return Err("empty expression".to_string());
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.or_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err("trailing tokens after expression".to_string());
    }
    Ok(expr)
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, token: Token) -> std::result::Result<(), String> {
        match self.advance() {
            Some(t) if t == token => Ok(()),
            other => Err(format!("expected {token:?}, found {other:?}")),
        }
    }

    fn or_expr(&mut self) -> std::result::Result<Expr, String> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.and_expr()?;
            left = Expr::Binary {
                op: BinOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> std::result::Result<Expr, String> {
        let mut left = self.comparison()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.comparison()?;
            left = Expr::Binary {
                op: BinOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn comparison(&mut self) -> std::result::Result<Expr, String> {
        let left = self.unary()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinOp::Eq,
            Some(Token::Ne) => BinOp::Ne,
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Le) => BinOp::Le,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Ge) => BinOp::Ge,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.unary()?;
        Ok(Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn unary(&mut self) -> std::result::Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let inner = self.unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> std::result::Result<Expr, String> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Literal(number_value(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::LParen) => {
                let expr = self.or_expr()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ => {
                    if self.peek() == Some(&Token::LParen) {
                        let func = match name.as_str() {
                            "len" => Func::Len,
                            "contains" => Func::Contains,
                            "matches" => Func::Matches,
                            other => return Err(format!("unknown function `{other}`")),
                        };
                        self.advance();
                        let args = self.arguments()?;
                        Ok(Expr::Call { func, args })
                    } else {
                        Ok(Expr::Path(name))
                    }
                }
            },
            other => Err(format!("unexpected token {other:?}")),
        }
    }

    fn arguments(&mut self) -> std::result::Result<Vec<Expr>, String> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.or_expr()?);
            match self.advance() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                other => return Err(format!("expected `,` or `)`, found {other:?}")),
            }
        }
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Number((n as i64).into())
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn eval(expr: &Expr, output: &Map<String, Value>) -> std::result::Result<Value, String> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(path) => resolve_path(path, output),
        Expr::Not(inner) => match eval(inner, output)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(format!("`!` requires a boolean, got {other}")),
        },
        Expr::Binary { op, left, right } => eval_binary(*op, left, right, output),
        Expr::Call { func, args } => eval_call(*func, args, output),
    }
}

fn eval_binary(
    op: BinOp,
    left: &Expr,
    right: &Expr,
    output: &Map<String, Value>,
) -> std::result::Result<Value, String> {
    // Boolean operators short-circuit.
    if op == BinOp::And || op == BinOp::Or {
        let lhs = as_bool(eval(left, output)?)?;
        return match (op, lhs) {
            (BinOp::And, false) => Ok(Value::Bool(false)),
            (BinOp::Or, true) => Ok(Value::Bool(true)),
            _ => Ok(Value::Bool(as_bool(eval(right, output)?)?)),
        };
    }

    let lhs = eval(left, output)?;
    let rhs = eval(right, output)?;

    match op {
        BinOp::Eq => Ok(Value::Bool(loose_eq(&lhs, &rhs))),
        BinOp::Ne => Ok(Value::Bool(!loose_eq(&lhs, &rhs))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = compare(&lhs, &rhs)?;
            let result = match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::Le => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                BinOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
        BinOp::And | BinOp::Or => unreachable!(),
    }
}

fn eval_call(
    func: Func,
    args: &[Expr],
    output: &Map<String, Value>,
) -> std::result::Result<Value, String> {
    let values: Vec<Value> = args
        .iter()
        .map(|arg| eval(arg, output))
        .collect::<std::result::Result<_, _>>()?;

    match (func, values.as_slice()) {
        (Func::Len, [value]) => {
            let len = match value {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                other => return Err(format!("len() requires a string, array or object, got {other}")),
            };
            Ok(Value::Number((len as u64).into()))
        }
        (Func::Contains, [haystack, needle]) => {
            let found = match (haystack, needle) {
                (Value::String(s), Value::String(sub)) => s.contains(sub.as_str()),
                (Value::Array(items), needle) => items.iter().any(|item| loose_eq(item, needle)),
                (Value::Object(map), Value::String(key)) => map.contains_key(key),
                (h, _) => return Err(format!("contains() cannot search inside {h}")),
            };
            Ok(Value::Bool(found))
        }
        (Func::Matches, [subject, pattern]) => {
            let (Value::String(subject), Value::String(pattern)) = (subject, pattern) else {
                return Err("matches() requires (string, pattern)".to_string());
            };
            let regex =
                Regex::new(pattern).map_err(|e| format!("invalid regex `{pattern}`: {e}"))?;
            Ok(Value::Bool(regex.is_match(subject)))
        }
        (Func::Len, _) => Err("len() takes exactly one argument".to_string()),
        (Func::Contains, _) => Err("contains() takes exactly two arguments".to_string()),
        (Func::Matches, _) => Err("matches() takes exactly two arguments".to_string()),
    }
}

fn resolve_path(path: &str, output: &Map<String, Value>) -> std::result::Result<Value, String> {
    let mut segments = path.split('.');
    let first = segments.next().unwrap();
    let mut current = output
        .get(first)
        .ok_or_else(|| format!("undefined field `{first}`"))?;

    let mut walked = first.to_string();
    for segment in segments {
        walked.push('.');
        walked.push_str(segment);
        current = match current {
            Value::Object(map) => map
                .get(segment)
                .ok_or_else(|| format!("undefined field `{walked}`"))?,
            other => {
                return Err(format!(
                    "cannot access `{segment}` on non-object value {other}"
                ));
            }
        };
    }
    Ok(current.clone())
}

fn as_bool(value: Value) -> std::result::Result<bool, String> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(format!("expected a boolean operand, got {other}")),
    }
}

/// Equality with numeric coercion: `200 == 200.0` holds.
fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> std::result::Result<std::cmp::Ordering, String> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x
            .partial_cmp(&y)
            .ok_or_else(|| "cannot order NaN".to_string());
    }
    if let (Value::String(x), Value::String(y)) = (a, b) {
        return Ok(x.cmp(y));
    }
    Err(format!("cannot order {a} and {b}"))
}
