//! Precondition expressions.
//!
//! A precondition is a small boolean expression over three bindings:
//! `F` (the fact), `C` (the knowledge base context) and `M` (working memory).
//! Expressions are compiled once, when the rule is registered.
//!
//! ```text
//! expr    := or
//! or      := and ("or" and)*
//! and     := not ("and" not)*
//! not     := "not" not | compare
//! compare := operand (("==" | "!=" | "<" | "<=" | ">" | ">=" | "in" | "not" "in") operand)?
//! operand := literal | path | "(" expr ")" | "[" (expr ("," expr)*)? "]"
//! path    := ("F" | "C" | "M") ("." ident)+
//! literal := string | ["-"] number | True | False | None | true | false | null
//! ```
//!
//! Missing paths evaluate to null.

use std::cmp::Ordering;

use crate::error::ValidationError;
use crate::rules::memory::MemoryView;
use crate::value::{lookup_path, Record, Value};

/// The read-only bindings a precondition is evaluated against.
#[derive(Clone, Copy)]
pub struct Bindings<'a> {
    /// The fact, bound as `F`.
    pub fact: &'a Record,
    /// The knowledge base context, bound as `C`.
    pub context: &'a Record,
    /// Working memory, bound as `M`.
    pub memory: &'a dyn MemoryView,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Root {
    Fact,
    Context,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path { root: Root, segments: Vec<String> },
    List(Vec<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare { op: CmpOp, lhs: Box<Expr>, rhs: Box<Expr> },
}

impl Expr {
    fn eval(&self, env: &Bindings<'_>) -> Value {
        match self {
            Self::Literal(v) => v.clone(),
            Self::Path { root, segments } => resolve(*root, segments, env),
            Self::List(items) => Value::List(items.iter().map(|e| e.eval(env)).collect()),
            Self::Not(inner) => Value::Bool(!inner.eval(env).is_truthy()),
            Self::And(lhs, rhs) => {
                Value::Bool(lhs.eval(env).is_truthy() && rhs.eval(env).is_truthy())
            }
            Self::Or(lhs, rhs) => {
                Value::Bool(lhs.eval(env).is_truthy() || rhs.eval(env).is_truthy())
            }
            Self::Compare { op, lhs, rhs } => {
                let (a, b) = (lhs.eval(env), rhs.eval(env));
                let result = match op {
                    CmpOp::Eq => a.loose_eq(&b),
                    CmpOp::Ne => !a.loose_eq(&b),
                    CmpOp::Lt => a.compare(&b) == Some(Ordering::Less),
                    CmpOp::Le => matches!(a.compare(&b), Some(Ordering::Less | Ordering::Equal)),
                    CmpOp::Gt => a.compare(&b) == Some(Ordering::Greater),
                    CmpOp::Ge => {
                        matches!(a.compare(&b), Some(Ordering::Greater | Ordering::Equal))
                    }
                    CmpOp::In => b.contains(&a),
                    CmpOp::NotIn => !b.contains(&a),
                };
                Value::Bool(result)
            }
        }
    }
}

fn resolve(root: Root, segments: &[String], env: &Bindings<'_>) -> Value {
    let found = match root {
        Root::Fact => lookup_path(env.fact, segments).cloned(),
        Root::Context => lookup_path(env.context, segments).cloned(),
        Root::Memory => segments.split_first().and_then(|(first, rest)| {
            let mut current = env.memory.attribute(first)?;
            for segment in rest {
                current = current.field(segment)?;
            }
            Some(current.clone())
        }),
    };
    found.unwrap_or(Value::Null)
}

/// A compiled precondition.
#[derive(Debug, Clone, PartialEq)]
pub struct Precondition {
    label: Option<String>,
    source: String,
    expr: Expr,
}

impl Precondition {
    /// Compiles `source`.
    ///
    /// # Errors
    /// Returns [`ValidationError::InvalidExpression`] when `source` does not parse.
    pub fn compile(source: &str) -> Result<Self, ValidationError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            source,
            tokens,
            pos: 0,
        };
        let expr = parser.parse_or()?;
        if let Some((_, offset)) = parser.tokens.get(parser.pos) {
            return Err(invalid(source, *offset, "unexpected trailing input"));
        }
        Ok(Self {
            label: None,
            source: source.to_string(),
            expr,
        })
    }

    /// Attaches a label used in precondition-failure narrations.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Label given with [`Precondition::with_label`].
    #[must_use]
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Expression text as written.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates the expression and applies truthiness.
    #[must_use]
    pub fn evaluate(&self, env: &Bindings<'_>) -> bool {
        self.expr.eval(env).is_truthy()
    }
}

fn invalid(source: &str, offset: usize, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidExpression {
        source_text: source.to_string(),
        offset,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    Cmp(CmpOp),
    Minus,
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
}

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>, ValidationError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;
        match c {
            b' ' | b'\t' | b'\n' | b'\r' => {
                i += 1;
                continue;
            }
            b'(' => tokens.push((Token::LParen, start)),
            b')' => tokens.push((Token::RParen, start)),
            b'[' => tokens.push((Token::LBracket, start)),
            b']' => tokens.push((Token::RBracket, start)),
            b',' => tokens.push((Token::Comma, start)),
            b'.' => tokens.push((Token::Dot, start)),
            b'-' => tokens.push((Token::Minus, start)),
            b'=' | b'!' | b'<' | b'>' => {
                let two = bytes.get(i + 1) == Some(&b'=');
                let op = match (c, two) {
                    (b'=', true) => CmpOp::Eq,
                    (b'!', true) => CmpOp::Ne,
                    (b'<', true) => CmpOp::Le,
                    (b'>', true) => CmpOp::Ge,
                    (b'<', false) => CmpOp::Lt,
                    (b'>', false) => CmpOp::Gt,
                    _ => return Err(invalid(source, start, "expected comparison operator")),
                };
                tokens.push((Token::Cmp(op), start));
                if two {
                    i += 1;
                }
            }
            b'\'' | b'"' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match bytes.get(i) {
                        None => return Err(invalid(source, start, "unterminated string")),
                        Some(&b) if b == quote => break,
                        Some(b'\\') => {
                            let escaped = source[i + 1..]
                                .chars()
                                .next()
                                .ok_or_else(|| invalid(source, i, "dangling escape"))?;
                            text.push(escaped);
                            i += 1 + escaped.len_utf8();
                        }
                        Some(_) => {
                            // Copy one UTF-8 character.
                            let ch = source[i..]
                                .chars()
                                .next()
                                .ok_or_else(|| invalid(source, i, "invalid character"))?;
                            text.push(ch);
                            i += ch.len_utf8();
                        }
                    }
                }
                tokens.push((Token::Str(text), start));
            }
            b'0'..=b'9' => {
                while i + 1 < bytes.len() && (bytes[i + 1].is_ascii_digit() || bytes[i + 1] == b'.') {
                    i += 1;
                }
                let text = &source[start..=i];
                let token = if text.contains('.') {
                    text.parse().map(Token::Float).map_err(|_| invalid(source, start, "bad float"))?
                } else {
                    text.parse().map(Token::Int).map_err(|_| invalid(source, start, "bad integer"))?
                };
                tokens.push((token, start));
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                while i + 1 < bytes.len() && (bytes[i + 1].is_ascii_alphanumeric() || bytes[i + 1] == b'_') {
                    i += 1;
                }
                tokens.push((Token::Ident(source[start..=i].to_string()), start));
            }
            _ => {
                let ch = source[start..].chars().next().unwrap_or(char::REPLACEMENT_CHARACTER);
                return Err(invalid(source, start, format!("unexpected character '{ch}'")));
            }
        }
        i += 1;
    }

    Ok(tokens)
}

struct Parser<'s> {
    source: &'s str,
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.source.len(), |(_, o)| *o)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(name)) if name == keyword)
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), ValidationError> {
        if self.peek() == Some(expected) {
            self.pos += 1;
            Ok(())
        } else {
            Err(invalid(self.source, self.offset(), format!("expected {what}")))
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ValidationError> {
        let mut lhs = self.parse_and()?;
        while self.peek_keyword("or") {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ValidationError> {
        let mut lhs = self.parse_not()?;
        while self.peek_keyword("and") {
            self.pos += 1;
            let rhs = self.parse_not()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr, ValidationError> {
        if self.peek_keyword("not") {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr, ValidationError> {
        let lhs = self.parse_operand()?;
        let op = match self.peek() {
            Some(Token::Cmp(op)) => {
                let op = *op;
                self.pos += 1;
                op
            }
            Some(Token::Ident(name)) if name == "in" => {
                self.pos += 1;
                CmpOp::In
            }
            Some(Token::Ident(name)) if name == "not" => {
                self.pos += 1;
                if !self.peek_keyword("in") {
                    return Err(invalid(self.source, self.offset(), "expected 'in' after 'not'"));
                }
                self.pos += 1;
                CmpOp::NotIn
            }
            _ => return Ok(lhs),
        };
        let rhs = self.parse_operand()?;
        Ok(Expr::Compare {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn parse_operand(&mut self) -> Result<Expr, ValidationError> {
        let offset = self.offset();
        match self.next() {
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Int(n)) => Ok(Expr::Literal(Value::Int(n))),
            Some(Token::Float(n)) => Ok(Expr::Literal(Value::Float(n))),
            Some(Token::Minus) => match self.next() {
                Some(Token::Int(n)) => Ok(Expr::Literal(Value::Int(-n))),
                Some(Token::Float(n)) => Ok(Expr::Literal(Value::Float(-n))),
                _ => Err(invalid(self.source, offset, "expected number after '-'")),
            },
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if self.peek() != Some(&Token::RBracket) {
                    loop {
                        items.push(self.parse_or()?);
                        if self.peek() == Some(&Token::Comma) {
                            self.pos += 1;
                            continue;
                        }
                        break;
                    }
                }
                self.expect(&Token::RBracket, "']'")?;
                Ok(Expr::List(items))
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "True" | "true" => Ok(Expr::Literal(Value::Bool(true))),
                "False" | "false" => Ok(Expr::Literal(Value::Bool(false))),
                "None" | "null" => Ok(Expr::Literal(Value::Null)),
                "F" => self.parse_path(Root::Fact),
                "C" => self.parse_path(Root::Context),
                "M" => self.parse_path(Root::Memory),
                other => Err(invalid(
                    self.source,
                    offset,
                    format!("unknown name '{other}'; paths must start with F, C or M"),
                )),
            },
            Some(_) => Err(invalid(self.source, offset, "unexpected token")),
            None => Err(invalid(self.source, offset, "unexpected end of expression")),
        }
    }

    fn parse_path(&mut self, root: Root) -> Result<Expr, ValidationError> {
        let mut segments = Vec::new();
        while self.peek() == Some(&Token::Dot) {
            self.pos += 1;
            let offset = self.offset();
            match self.next() {
                Some(Token::Ident(name)) => segments.push(name),
                _ => return Err(invalid(self.source, offset, "expected field name after '.'")),
            }
        }
        if segments.is_empty() {
            return Err(invalid(self.source, self.offset(), "expected '.' after binding"));
        }
        Ok(Expr::Path { root, segments })
    }
}
