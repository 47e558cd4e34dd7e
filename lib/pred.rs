//! A small predicate language for `find` and filtered puts.
//!
//! ```text
//! pred  := or
//! or    := and ('|' and)*
//! and   := unary ('&' unary)*
//! unary := '!' unary | '(' or ')' | term
//! term  := 'true' | 'false' | attr [op value]
//! op    := '=' | '!=' | '~' | '<' | '<=' | '>' | '>='
//! ```
//!
//! `attr` names a `Dir` attribute, or `depth` for the level being visited. `~` matches a glob
//! with `*` and `?`. Ordering operators compare numerically when both sides are numbers. A bare
//! attribute is true when present and non-empty. The empty predicate matches everything.
//!
//! A top-level `depth` bound that cannot hold one level further down prunes the traversal.

use std::cmp::Ordering;

use crate::dir::Dir;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Glob,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Const(bool),
    Present(String),
    Cmp(String, Op, String),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

/// A compiled predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pred {
    expr: Expr,
}

/// The outcome of evaluating a predicate at one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eval {
    /// The node matches.
    pub matched: bool,
    /// Nothing below the node can match; do not descend.
    pub pruned: bool,
}

impl Pred {
    /// Compiles `src`.
    pub fn new(src: &str) -> Result<Self> {
        let toks = lex(src)?;
        if toks.is_empty() {
            return Ok(Self {
                expr: Expr::Const(true),
            });
        }
        let mut p = Parser { toks, pos: 0, src };
        let expr = p.or()?;
        if p.pos != p.toks.len() {
            return Err(Error::BadCtl(format!("pred {src:?}: trailing input")));
        }
        Ok(Self { expr })
    }

    /// Evaluates the predicate for `d` found at `depth`.
    pub fn eval_at(&self, d: &Dir, depth: usize) -> Eval {
        let matched = eval(&self.expr, d, depth);
        let pruned = match &self.expr {
            Expr::And(terms) => terms.iter().any(|t| depth_bound_fails(t, depth + 1)),
            t => depth_bound_fails(t, depth + 1),
        };
        Eval { matched, pruned }
    }

    /// True if `d` matches at depth 0.
    pub fn matches(&self, d: &Dir) -> bool {
        eval(&self.expr, d, 0)
    }
}

fn depth_bound_fails(t: &Expr, depth: usize) -> bool {
    match t {
        Expr::Cmp(a, op, v) if a == "depth" && matches!(op, Op::Eq | Op::Lt | Op::Le) => {
            !compare(&depth.to_string(), *op, v)
        }
        _ => false,
    }
}

fn eval(e: &Expr, d: &Dir, depth: usize) -> bool {
    match e {
        Expr::Const(b) => *b,
        Expr::Present(a) => !lookup(d, a, depth).is_empty(),
        Expr::Cmp(a, op, v) => compare(&lookup(d, a, depth), *op, v),
        Expr::Not(e) => !eval(e, d, depth),
        Expr::And(es) => es.iter().all(|e| eval(e, d, depth)),
        Expr::Or(es) => es.iter().any(|e| eval(e, d, depth)),
    }
}

fn lookup(d: &Dir, attr: &str, depth: usize) -> String {
    if attr == "depth" {
        return depth.to_string();
    }
    d.attr(attr).to_owned()
}

fn compare(lhs: &str, op: Op, rhs: &str) -> bool {
    let ord = match (lhs.parse::<i64>(), rhs.parse::<i64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => lhs.cmp(rhs),
    };
    match op {
        Op::Eq => ord == Ordering::Equal,
        Op::Ne => ord != Ordering::Equal,
        Op::Glob => glob(rhs.as_bytes(), lhs.as_bytes()),
        Op::Lt => ord == Ordering::Less,
        Op::Le => ord != Ordering::Greater,
        Op::Gt => ord == Ordering::Greater,
        Op::Ge => ord != Ordering::Less,
    }
}

fn glob(pat: &[u8], s: &[u8]) -> bool {
    match (pat.first(), s.first()) {
        (None, None) => true,
        (Some(b'*'), _) => glob(&pat[1..], s) || (!s.is_empty() && glob(pat, &s[1..])),
        (Some(b'?'), Some(_)) => glob(&pat[1..], &s[1..]),
        (Some(p), Some(c)) if p == c => glob(&pat[1..], &s[1..]),
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Word(String),
    Op(Op),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn lex(src: &str) -> Result<Vec<Tok>> {
    let mut toks = Vec::new();
    let mut chars = src.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '&' => {
                chars.next();
                toks.push(Tok::And);
            }
            '|' => {
                chars.next();
                toks.push(Tok::Or);
            }
            '(' => {
                chars.next();
                toks.push(Tok::LParen);
            }
            ')' => {
                chars.next();
                toks.push(Tok::RParen);
            }
            '!' | '=' | '~' | '<' | '>' => {
                chars.next();
                let eq = chars.peek() == Some(&'=');
                let tok = match (c, eq) {
                    ('!', true) => Tok::Op(Op::Ne),
                    ('!', false) => Tok::Not,
                    ('=', _) => Tok::Op(Op::Eq),
                    ('~', _) => Tok::Op(Op::Glob),
                    ('<', true) => Tok::Op(Op::Le),
                    ('<', false) => Tok::Op(Op::Lt),
                    ('>', true) => Tok::Op(Op::Ge),
                    _ => Tok::Op(Op::Gt),
                };
                if eq && matches!(c, '!' | '<' | '>') {
                    chars.next();
                }
                toks.push(tok);
            }
            '"' => {
                chars.next();
                let mut w = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some(c) => w.push(c),
                        None => return Err(Error::BadCtl(format!("pred {src:?}: open quote"))),
                    }
                }
                toks.push(Tok::Word(w));
            }
            _ => {
                let mut w = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || "&|()!=~<>\"".contains(c) {
                        break;
                    }
                    w.push(c);
                    chars.next();
                }
                toks.push(Tok::Word(w));
            }
        }
    }
    Ok(toks)
}

struct Parser<'a> {
    toks: Vec<Tok>,
    pos: usize,
    src: &'a str,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn next(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn err(&self, what: &str) -> Error {
        Error::BadCtl(format!("pred {:?}: {what}", self.src))
    }

    fn or(&mut self) -> Result<Expr> {
        let mut es = vec![self.and()?];
        while self.peek() == Some(&Tok::Or) {
            self.pos += 1;
            es.push(self.and()?);
        }
        Ok(if es.len() == 1 { es.remove(0) } else { Expr::Or(es) })
    }

    fn and(&mut self) -> Result<Expr> {
        let mut es = vec![self.unary()?];
        while self.peek() == Some(&Tok::And) {
            self.pos += 1;
            es.push(self.unary()?);
        }
        Ok(if es.len() == 1 { es.remove(0) } else { Expr::And(es) })
    }

    fn unary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Tok::Not) => Ok(Expr::Not(Box::new(self.unary()?))),
            Some(Tok::LParen) => {
                let e = self.or()?;
                if self.next() != Some(Tok::RParen) {
                    return Err(self.err("missing )"));
                }
                Ok(e)
            }
            Some(Tok::Word(w)) => {
                let Some(Tok::Op(op)) = self.peek().cloned() else {
                    return Ok(match w.as_str() {
                        "true" => Expr::Const(true),
                        "false" => Expr::Const(false),
                        _ => Expr::Present(w),
                    });
                };
                self.pos += 1;
                match self.next() {
                    Some(Tok::Word(v)) => Ok(Expr::Cmp(w, op, v)),
                    _ => Err(self.err("missing value")),
                }
            }
            _ => Err(self.err("syntax error")),
        }
    }
}
