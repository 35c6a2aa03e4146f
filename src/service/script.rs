//! # Script
//!
//! The small expression language behind `execute` and `evaluate`.
//!
//! ```text
//! program   := stmt ((';' | NEWLINE) stmt)*
//! stmt      := 'del' IDENT | IDENT '=' expr | expr
//! postfix   := primary ('.' IDENT | '(' args? ')')*
//! arg       := IDENT '=' expr | expr
//! primary   := INT | FLOAT | STRING | None | True | False | IDENT | tuple | '(' expr ')'
//! ```
//!
//! Each connection owns one [`Interpreter`]; names never leak between
//! connections. Parse errors are `SyntaxError` execution faults and unknown
//! names are `NameError` execution faults.
//!
//! Hosted code is evaluated against a snapshot of the namespace, never under
//! its lock, so a call that re-enters the same connection cannot deadlock.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::core::value::{Args, ObjectRef, Value};
use crate::error::constants::ERR_NOT_CALLABLE;
use crate::error::{Fault, Phase, Result};

/// Name the hosted root is bound to in every namespace.
pub const LIBRARY_NAME: &str = "library";

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Name(String),
    Tuple(Vec<Expr>),
    Attr(Box<Expr>, String),
    Call(Box<Expr>, Vec<Arg>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Positional(Expr),
    Keyword(String, Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Del(String),
    Assign(String, Expr),
    Expr(Expr),
}

fn syntax_error(position: usize, message: impl std::fmt::Display) -> Fault {
    Fault::raised(
        Phase::Call,
        "SyntaxError",
        format!("{message} (at offset {position})"),
    )
}

fn name_error(name: &str) -> Fault {
    Fault::raised(
        Phase::Call,
        "NameError",
        format!("name '{name}' is not defined"),
    )
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    LParen,
    RParen,
    Comma,
    Dot,
    Equals,
    Minus,
    Separator,
}

fn tokenize(code: &str) -> Result<Vec<(usize, Token)>> {
    let chars: Vec<char> = code.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let start = i;
        let token = match chars[i] {
            ' ' | '\t' | '\r' => {
                i += 1;
                continue;
            }
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '\n' | ';' => {
                i += 1;
                Token::Separator
            }
            '(' => {
                i += 1;
                Token::LParen
            }
            ')' => {
                i += 1;
                Token::RParen
            }
            ',' => {
                i += 1;
                Token::Comma
            }
            '.' => {
                i += 1;
                Token::Dot
            }
            '=' => {
                i += 1;
                Token::Equals
            }
            '-' => {
                i += 1;
                Token::Minus
            }
            quote @ ('\'' | '"') => {
                i += 1;
                let mut text = String::new();
                loop {
                    match chars.get(i) {
                        None | Some('\n') => return Err(syntax_error(start, "unterminated string")),
                        Some(&c) if c == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            let escaped = match chars.get(i + 1) {
                                Some('n') => '\n',
                                Some('t') => '\t',
                                Some('r') => '\r',
                                Some('0') => '\0',
                                Some(&c @ ('\\' | '\'' | '"')) => c,
                                _ => return Err(syntax_error(i, "invalid escape")),
                            };
                            text.push(escaped);
                            i += 2;
                        }
                        Some(&c) => {
                            text.push(c);
                            i += 1;
                        }
                    }
                }
                Token::Str(text)
            }
            c if c.is_ascii_digit() => {
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let mut float = false;
                if chars.get(i) == Some(&'.') && chars.get(i + 1).is_some_and(char::is_ascii_digit) {
                    float = true;
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                if matches!(chars.get(i), Some('e' | 'E')) {
                    let mut j = i + 1;
                    if matches!(chars.get(j), Some('+' | '-')) {
                        j += 1;
                    }
                    if chars.get(j).is_some_and(char::is_ascii_digit) {
                        float = true;
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..i].iter().collect();
                if float {
                    Token::Float(
                        text.parse()
                            .map_err(|_| syntax_error(start, "invalid number"))?,
                    )
                } else {
                    Token::Int(
                        text.parse()
                            .map_err(|_| syntax_error(start, "integer out of range"))?,
                    )
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                Token::Ident(chars[start..i].iter().collect())
            }
            other => return Err(syntax_error(start, format!("unexpected character '{other}'"))),
        };
        tokens.push((start, token));
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn new(code: &str) -> Result<Self> {
        Ok(Self {
            tokens: tokenize(code)?,
            pos: 0,
            end: code.len(),
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset).map(|(_, token)| token)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(offset, _)| *offset)
            .unwrap_or(self.end)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, token)| token.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<()> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(syntax_error(self.offset(), format!("expected {what}")))
        }
    }

    fn ident(&mut self) -> Result<String> {
        match self.peek() {
            Some(Token::Ident(name)) if !is_keyword(name) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(syntax_error(self.offset(), "expected a name")),
        }
    }

    fn program(&mut self) -> Result<Vec<Stmt>> {
        let mut statements = Vec::new();
        loop {
            while self.eat(&Token::Separator) {}
            if self.at_end() {
                return Ok(statements);
            }
            statements.push(self.statement()?);
            if !self.at_end() {
                self.expect(&Token::Separator, "end of statement")?;
            }
        }
    }

    fn statement(&mut self) -> Result<Stmt> {
        match (self.peek(), self.peek_at(1)) {
            (Some(Token::Ident(del)), Some(Token::Ident(_))) if del == "del" => {
                self.pos += 1;
                Ok(Stmt::Del(self.ident()?))
            }
            (Some(Token::Ident(_)), Some(Token::Equals)) => {
                let name = self.ident()?;
                self.pos += 1;
                Ok(Stmt::Assign(name, self.expression()?))
            }
            _ => Ok(Stmt::Expr(self.expression()?)),
        }
    }

    fn expression(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                expr = Expr::Attr(Box::new(expr), self.ident()?);
            } else if self.eat(&Token::LParen) {
                expr = Expr::Call(Box::new(expr), self.arguments()?);
            } else {
                return Ok(expr);
            }
        }
    }

    fn arguments(&mut self) -> Result<Vec<Arg>> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            let arg = match (self.peek(), self.peek_at(1)) {
                (Some(Token::Ident(_)), Some(Token::Equals)) => {
                    let name = self.ident()?;
                    self.pos += 1;
                    Arg::Keyword(name, self.expression()?)
                }
                _ => {
                    if args.iter().any(|a| matches!(a, Arg::Keyword(..))) {
                        return Err(syntax_error(
                            self.offset(),
                            "positional argument follows keyword argument",
                        ));
                    }
                    Arg::Positional(self.expression()?)
                }
            };
            args.push(arg);
            if self.eat(&Token::Comma) {
                if self.eat(&Token::RParen) {
                    return Ok(args);
                }
                continue;
            }
            self.expect(&Token::RParen, "')'")?;
            return Ok(args);
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        let offset = self.offset();
        match self.next() {
            Some(Token::Int(i)) => Ok(Expr::Literal(Value::Int(i))),
            Some(Token::Float(f)) => Ok(Expr::Literal(Value::Float(f))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::Str(s))),
            Some(Token::Minus) => match self.next() {
                Some(Token::Int(i)) => i
                    .checked_neg()
                    .map(|i| Expr::Literal(Value::Int(i)))
                    .ok_or_else(|| syntax_error(offset, "integer out of range")),
                Some(Token::Float(f)) => Ok(Expr::Literal(Value::Float(-f))),
                _ => Err(syntax_error(offset, "'-' must precede a number")),
            },
            Some(Token::Ident(name)) => Ok(match name.as_str() {
                "None" => Expr::Literal(Value::None),
                "True" => Expr::Literal(Value::Bool(true)),
                "False" => Expr::Literal(Value::Bool(false)),
                "del" => return Err(syntax_error(offset, "invalid syntax")),
                _ => Expr::Name(name),
            }),
            Some(Token::LParen) => {
                if self.eat(&Token::RParen) {
                    return Ok(Expr::Tuple(Vec::new()));
                }
                let first = self.expression()?;
                if !self.eat(&Token::Comma) {
                    self.expect(&Token::RParen, "')'")?;
                    return Ok(first);
                }
                let mut items = vec![first];
                loop {
                    if self.eat(&Token::RParen) {
                        return Ok(Expr::Tuple(items));
                    }
                    items.push(self.expression()?);
                    if self.eat(&Token::RParen) {
                        return Ok(Expr::Tuple(items));
                    }
                    self.expect(&Token::Comma, "',' or ')'")?;
                }
            }
            Some(_) => Err(syntax_error(offset, "invalid syntax")),
            None => Err(syntax_error(offset, "unexpected end of input")),
        }
    }
}

fn is_keyword(name: &str) -> bool {
    matches!(name, "None" | "True" | "False" | "del")
}

pub fn parse_program(code: &str) -> Result<Vec<Stmt>> {
    Parser::new(code)?.program()
}

/// One expression, optionally surrounded by blank lines.
pub fn parse_expression(code: &str) -> Result<Expr> {
    let mut parser = Parser::new(code)?;
    while parser.eat(&Token::Separator) {}
    let expr = parser.expression()?;
    while parser.eat(&Token::Separator) {}
    if !parser.at_end() {
        return Err(syntax_error(parser.offset(), "expected end of expression"));
    }
    Ok(expr)
}

/// Names bound by one connection's scripts.
#[derive(Clone, Default)]
pub struct Namespace {
    names: HashMap<String, Value>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_library(library: ObjectRef) -> Self {
        let mut namespace = Self::new();
        namespace.set(LIBRARY_NAME, Value::Object(library));
        namespace
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.names.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.names.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.names.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    pub fn eval(&self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Name(name) => self.get(name).cloned().ok_or_else(|| name_error(name)),
            Expr::Tuple(items) => items
                .iter()
                .map(|item| self.eval(item))
                .collect::<Result<Vec<_>>>()
                .map(Value::Tuple),
            Expr::Attr(base, name) => match self.eval(base)? {
                Value::Object(obj) => obj.get_attr(name),
                other => Err(Fault::attribute(other.type_label(), name.as_str())),
            },
            Expr::Call(callee, args) => match callee.as_ref() {
                // resolve and call in one step so a proxy makes one round trip
                Expr::Attr(base, name) => match self.eval(base)? {
                    Value::Object(obj) => obj.invoke(name, self.eval_args(args)?),
                    other => Err(Fault::attribute(other.type_label(), name.as_str())),
                },
                callee => match self.eval(callee)? {
                    Value::Object(obj) => obj.call(self.eval_args(args)?),
                    other => Err(Fault::raised(
                        Phase::Call,
                        "TypeError",
                        format!("'{}' {ERR_NOT_CALLABLE}", other.type_label()),
                    )),
                },
            },
        }
    }

    fn eval_args(&self, args: &[Arg]) -> Result<Args> {
        let mut positional = Vec::new();
        let mut keyword = Vec::new();
        for arg in args {
            match arg {
                Arg::Positional(expr) => positional.push(self.eval(expr)?),
                Arg::Keyword(name, expr) => keyword.push((name.clone(), self.eval(expr)?)),
            }
        }
        Ok(Args::with_kwargs(positional, keyword))
    }
}

/// A connection-private namespace with its statement runner.
#[derive(Default)]
pub struct Interpreter {
    namespace: Mutex<Namespace>,
}

impl Interpreter {
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace: Mutex::new(namespace),
        }
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.namespace.lock().ok()?.get(name).cloned()
    }

    fn snapshot(&self) -> Result<Namespace> {
        Ok(self.namespace.lock()?.clone())
    }

    /// Run statements in order; stops at the first failing one.
    pub fn execute(&self, code: &str) -> Result<()> {
        for statement in parse_program(code)? {
            match statement {
                Stmt::Del(name) => {
                    let removed = self.namespace.lock()?.remove(&name);
                    if removed.is_none() {
                        return Err(name_error(&name));
                    }
                }
                Stmt::Assign(name, expr) => {
                    let value = self.snapshot()?.eval(&expr)?;
                    self.namespace.lock()?.set(name, value);
                }
                Stmt::Expr(expr) => {
                    self.snapshot()?.eval(&expr)?;
                }
            }
        }
        Ok(())
    }

    pub fn evaluate(&self, code: &str) -> Result<Value> {
        let expr = parse_expression(code)?;
        self.snapshot()?.eval(&expr)
    }
}
