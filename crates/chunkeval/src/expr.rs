//! Scalar expression parsing and elementwise evaluation.
//!
//! Expressions are parsed once into a syntax tree, constant subtrees are
//! folded, and the result is compiled into a small postfix program. The same
//! program runs for every element, so whole-array and chunked evaluation
//! perform identical floating-point operations in identical order.
//!
//! # Grammar
//!
//! ```text
//! expr   := term (('+' | '-') term)*
//! term   := unary (('*' | '/') unary)*
//! unary  := ('-' | '+') unary | power
//! power  := atom ('**' unary)?
//! atom   := number | variable | '(' expr ')'
//! ```
//!
//! `**` is right-associative and binds tighter than unary minus, so
//! `-x**2` is `-(x**2)`.
//!
//! Nesting, including long operator chains, is limited to
//! [`MAX_NESTING`] levels.

use crate::error::{ChunkError, Result};
use std::fmt;

/// Name of the free variable accepted by [`Expr::parse`].
pub const DEFAULT_VARIABLE: &str = "x";

/// Deepest syntax tree the parser builds.
pub const MAX_NESTING: usize = 256;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{n}"),
            Token::Ident(name) => write!(f, "{name}"),
            Token::Plus => f.write_str("+"),
            Token::Minus => f.write_str("-"),
            Token::Star => f.write_str("*"),
            Token::StarStar => f.write_str("**"),
            Token::Slash => f.write_str("/"),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
        }
    }
}

/// Splits expression text into `(offset, token)` pairs.
fn tokenize(src: &str) -> Result<Vec<(usize, Token)>> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let c = bytes[pos];
        match c {
            b' ' | b'\t' | b'\n' | b'\r' => pos += 1,
            b'+' => {
                tokens.push((pos, Token::Plus));
                pos += 1;
            }
            b'-' => {
                tokens.push((pos, Token::Minus));
                pos += 1;
            }
            b'/' => {
                tokens.push((pos, Token::Slash));
                pos += 1;
            }
            b'(' => {
                tokens.push((pos, Token::LParen));
                pos += 1;
            }
            b')' => {
                tokens.push((pos, Token::RParen));
                pos += 1;
            }
            b'*' => {
                if bytes.get(pos + 1) == Some(&b'*') {
                    tokens.push((pos, Token::StarStar));
                    pos += 2;
                } else {
                    tokens.push((pos, Token::Star));
                    pos += 1;
                }
            }
            b'0'..=b'9' | b'.' => {
                let start = pos;
                while pos < bytes.len() && (bytes[pos].is_ascii_digit() || bytes[pos] == b'.') {
                    pos += 1;
                }
                // Exponent suffix: e, E followed by optional sign and digits
                if pos < bytes.len() && (bytes[pos] == b'e' || bytes[pos] == b'E') {
                    let mut look = pos + 1;
                    if look < bytes.len() && (bytes[look] == b'+' || bytes[look] == b'-') {
                        look += 1;
                    }
                    if look < bytes.len() && bytes[look].is_ascii_digit() {
                        pos = look;
                        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                            pos += 1;
                        }
                    }
                }
                let text = &src[start..pos];
                let value = text.parse::<f64>().map_err(|_| ChunkError::Evaluation {
                    expr: src.to_string(),
                    position: start,
                    reason: format!("malformed number '{text}'"),
                })?;
                tokens.push((start, Token::Number(value)));
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                let start = pos;
                while pos < bytes.len()
                    && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_')
                {
                    pos += 1;
                }
                tokens.push((start, Token::Ident(src[start..pos].to_string())));
            }
            _ => {
                let ch = src[pos..].chars().next().unwrap_or('?');
                return Err(ChunkError::Evaluation {
                    expr: src.to_string(),
                    position: pos,
                    reason: format!("unexpected character '{ch}'"),
                });
            }
        }
    }

    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinOp {
    fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            BinOp::Div => a / b,
            BinOp::Pow => a.powf(b),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Const(f64),
    Var,
    Neg(Box<Node>),
    Binary(BinOp, Box<Node>, Box<Node>),
}

impl Node {
    /// Folds constant subtrees bottom-up.
    fn fold(self) -> Node {
        match self {
            Node::Neg(inner) => match inner.fold() {
                Node::Const(c) => Node::Const(-c),
                other => Node::Neg(Box::new(other)),
            },
            Node::Binary(op, lhs, rhs) => match (lhs.fold(), rhs.fold()) {
                (Node::Const(a), Node::Const(b)) => Node::Const(op.apply(a, b)),
                (lhs, rhs) => Node::Binary(op, Box::new(lhs), Box::new(rhs)),
            },
            leaf => leaf,
        }
    }
}

struct Parser<'a> {
    src: &'a str,
    var: &'a str,
    tokens: Vec<(usize, Token)>,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(o, _)| *o)
            .unwrap_or(self.src.len())
    }

    fn error(&self, reason: impl Into<String>) -> ChunkError {
        ChunkError::Evaluation {
            expr: self.src.to_string(),
            position: self.offset(),
            reason: reason.into(),
        }
    }

    fn descend(&mut self) -> Result<()> {
        if self.depth >= MAX_NESTING {
            return Err(self.error("expression nested too deeply"));
        }
        self.depth += 1;
        Ok(())
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_expr(&mut self) -> Result<Node> {
        let outer = self.depth;
        let mut lhs = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            // Each link deepens the left-leaning tree.
            self.descend()?;
            let rhs = self.parse_term()?;
            lhs = Node::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        self.depth = outer;
        Ok(lhs)
    }

    fn parse_term(&mut self) -> Result<Node> {
        let outer = self.depth;
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => break,
            };
            self.pos += 1;
            self.descend()?;
            let rhs = self.parse_unary()?;
            lhs = Node::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        self.depth = outer;
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Node> {
        let outer = self.depth;
        self.descend()?;
        let node = match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Node::Neg(Box::new(self.parse_unary()?))
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.parse_unary()?
            }
            _ => self.parse_power()?,
        };
        self.depth = outer;
        Ok(node)
    }

    fn parse_power(&mut self) -> Result<Node> {
        let base = self.parse_atom()?;
        if self.peek() == Some(&Token::StarStar) {
            self.pos += 1;
            let exponent = self.parse_unary()?;
            return Ok(Node::Binary(BinOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_atom(&mut self) -> Result<Node> {
        match self.bump() {
            Some(Token::Number(n)) => Ok(Node::Const(n)),
            Some(Token::Ident(name)) if name == self.var => Ok(Node::Var),
            Some(Token::Ident(name)) => {
                self.pos -= 1;
                Err(self.error(format!("unknown symbol '{name}'")))
            }
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    Some(_) => {
                        self.pos -= 1;
                        Err(self.error("expected ')'"))
                    }
                    None => Err(self.error("unbalanced '(': missing ')'")),
                }
            }
            Some(token) => {
                self.pos -= 1;
                Err(self.error(format!("unexpected operator '{token}'")))
            }
            None => Err(self.error("unexpected end of expression")),
        }
    }
}

/// One instruction of a compiled program.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Push(f64),
    Load,
    Neg,
    Bin(BinOp),
    PowI(i32),
}

/// Returns `Some(n)` if `c` is an integer that fits an `i32` exponent.
fn integer_exponent(c: f64) -> Option<i32> {
    if c.fract() == 0.0 && c >= i32::MIN as f64 && c <= i32::MAX as f64 {
        Some(c as i32)
    } else {
        None
    }
}

fn compile(node: &Node, ops: &mut Vec<Op>) {
    match node {
        Node::Const(c) => ops.push(Op::Push(*c)),
        Node::Var => ops.push(Op::Load),
        Node::Neg(inner) => {
            compile(inner, ops);
            ops.push(Op::Neg);
        }
        Node::Binary(BinOp::Pow, base, exponent) => {
            if let Node::Const(c) = **exponent {
                if let Some(n) = integer_exponent(c) {
                    compile(base, ops);
                    ops.push(Op::PowI(n));
                    return;
                }
            }
            compile(base, ops);
            compile(exponent, ops);
            ops.push(Op::Bin(BinOp::Pow));
        }
        Node::Binary(op, lhs, rhs) => {
            compile(lhs, ops);
            compile(rhs, ops);
            ops.push(Op::Bin(*op));
        }
    }
}

/// A parsed, validated scalar expression over one free variable.
///
/// Evaluation holds no state between elements.
#[derive(Debug, Clone)]
pub struct Expr {
    source: String,
    ops: Vec<Op>,
    max_depth: usize,
}

impl Expr {
    /// Parses an expression over the variable `x`.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkError::Evaluation`] on unknown symbols, unbalanced
    /// parentheses or dangling operators.
    pub fn parse(src: &str) -> Result<Self> {
        Self::parse_with_variable(src, DEFAULT_VARIABLE)
    }

    /// Parses an expression over a custom variable name.
    pub fn parse_with_variable(src: &str, var: &str) -> Result<Self> {
        let tokens = tokenize(src)?;
        let mut parser = Parser {
            src,
            var,
            tokens,
            pos: 0,
            depth: 0,
        };
        let tree = parser.parse_expr()?;
        if let Some(token) = parser.peek() {
            let reason = match token {
                Token::RParen => "unbalanced ')'".to_string(),
                other => format!("unexpected token '{other}'"),
            };
            return Err(parser.error(reason));
        }

        let mut ops = Vec::new();
        compile(&tree.fold(), &mut ops);

        let mut depth = 0usize;
        let mut max_depth = 0usize;
        for op in &ops {
            match op {
                Op::Push(_) | Op::Load => depth += 1,
                Op::Bin(_) => depth -= 1,
                Op::Neg | Op::PowI(_) => {}
            }
            max_depth = max_depth.max(depth);
        }

        Ok(Self {
            source: src.to_string(),
            ops,
            max_depth,
        })
    }

    /// Returns the expression text as given.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Returns true if the expression folded to a constant.
    pub fn is_constant(&self) -> bool {
        !self.ops.contains(&Op::Load)
    }

    fn run(&self, x: f64, stack: &mut Vec<f64>) -> f64 {
        stack.clear();
        for op in &self.ops {
            match *op {
                Op::Push(c) => stack.push(c),
                Op::Load => stack.push(x),
                Op::Neg => {
                    if let Some(top) = stack.last_mut() {
                        *top = -*top;
                    }
                }
                Op::PowI(n) => {
                    if let Some(top) = stack.last_mut() {
                        *top = top.powi(n);
                    }
                }
                Op::Bin(bin) => {
                    let b = stack.pop().unwrap_or(f64::NAN);
                    let a = stack.pop().unwrap_or(f64::NAN);
                    stack.push(bin.apply(a, b));
                }
            }
        }
        stack.pop().unwrap_or(f64::NAN)
    }

    /// Evaluates the expression at a single point.
    pub fn eval(&self, x: f64) -> f64 {
        let mut stack = Vec::with_capacity(self.max_depth);
        self.run(x, &mut stack)
    }

    /// Evaluates the expression elementwise, writing `out[i] = f(input[i])`.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkError::LengthMismatch`] if the slices differ in length.
    pub fn eval_into(&self, input: &[f64], out: &mut [f64]) -> Result<()> {
        if input.len() != out.len() {
            return Err(ChunkError::LengthMismatch {
                expected: input.len(),
                actual: out.len(),
            });
        }
        let mut stack = Vec::with_capacity(self.max_depth);
        for (dst, &x) in out.iter_mut().zip(input) {
            *dst = self.run(x, &mut stack);
        }
        Ok(())
    }

    /// Evaluates the expression elementwise into a new vector.
    pub fn eval_slice(&self, input: &[f64]) -> Vec<f64> {
        let mut stack = Vec::with_capacity(self.max_depth);
        input.iter().map(|&x| self.run(x, &mut stack)).collect()
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl std::str::FromStr for Expr {
    type Err = ChunkError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
