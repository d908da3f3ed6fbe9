//! Textual AST reader.
//!
//! The input is a tree of `{ TAG LEFT RIGHT }` nodes. TAG is one of the
//! statement keywords (case-insensitive), `NIL`, a quoted `"name"`, a
//! single-quoted `'string literal'`, or a numeric literal. Children may be
//! nested nodes or absent. `$db<word>` introduces a live comment around a
//! node, closed by a trailing `$`; any other `$id` opens a balanced `$…$`
//! skip block.

use std::fs;
use std::path::Path;

use crate::error::FrontError;

/// The statement keywords, in table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stmt {
    St,
    If,
    Else,
    Var,
    While,
    Func,
    Ret,
    Call,
    Param,
    Eq,
    Void,
    Type,
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Cos,
    Sin,
    Tan,
    Out,
    In,
    Endl,
    Sqrt,
    IsEe,
    IsNe,
    IsBt,
    IsGt,
    Mod,
    And,
    Or,
}

const KEYWORDS: [(&str, Stmt); 31] = [
    ("ST", Stmt::St),
    ("IF", Stmt::If),
    ("ELSE", Stmt::Else),
    ("VAR", Stmt::Var),
    ("WHILE", Stmt::While),
    ("FUNC", Stmt::Func),
    ("RET", Stmt::Ret),
    ("CALL", Stmt::Call),
    ("PARAM", Stmt::Param),
    ("EQ", Stmt::Eq),
    ("VOID", Stmt::Void),
    ("TYPE", Stmt::Type),
    ("ADD", Stmt::Add),
    ("SUB", Stmt::Sub),
    ("MUL", Stmt::Mul),
    ("DIV", Stmt::Div),
    ("POW", Stmt::Pow),
    ("COS", Stmt::Cos),
    ("SIN", Stmt::Sin),
    ("TAN", Stmt::Tan),
    ("OUT", Stmt::Out),
    ("IN", Stmt::In),
    ("ENDL", Stmt::Endl),
    ("SQRT", Stmt::Sqrt),
    ("IS_EE", Stmt::IsEe),
    ("IS_NE", Stmt::IsNe),
    ("IS_BT", Stmt::IsBt),
    ("IS_GT", Stmt::IsGt),
    ("MOD", Stmt::Mod),
    ("AND", Stmt::And),
    ("OR", Stmt::Or),
];

/// The live-comment id; other ids open skip blocks.
const LIVE_ID: &str = "db";

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Stmt(Stmt),
    Name(String),
    Str(String),
    Number(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AstNode {
    pub kind: NodeKind,
    pub left: Option<Box<AstNode>>,
    pub right: Option<Box<AstNode>>,
}

impl AstNode {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            left: None,
            right: None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Name(n) => Some(n),
            _ => None,
        }
    }

    pub fn stmt(&self) -> Option<Stmt> {
        match &self.kind {
            NodeKind::Stmt(s) => Some(*s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Ast {
    pub root: Option<Box<AstNode>>,
}

pub fn read_ast(path: &Path) -> Result<Ast, FrontError> {
    let src = fs::read_to_string(path).map_err(|source| FrontError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_ast(&src)
}

pub fn parse_ast(src: &str) -> Result<Ast, FrontError> {
    let mut reader = Reader {
        src: src.as_bytes(),
        pos: 0,
    };
    let root = reader.read_node()?;
    Ok(Ast { root })
}

struct Reader<'a> {
    src: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(|c| c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn corrupted(&self) -> FrontError {
        FrontError::Corrupted(format!("unexpected input near byte {}", self.pos))
    }

    /// Take bytes until `stop` returns true, without consuming the stop byte.
    fn take_until(&mut self, stop: impl Fn(u8) -> bool) -> String {
        let start = self.pos;
        while self.peek().is_some_and(|c| !stop(c)) {
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.src[start..self.pos]).into_owned()
    }

    fn read_node(&mut self) -> Result<Option<Box<AstNode>>, FrontError> {
        self.skip_ws();
        let Some(mut c) = self.peek() else {
            return Ok(None);
        };

        let mut live_comment = false;
        if c == b'$' {
            self.bump();
            let id = self.take_until(|c| c.is_ascii_whitespace());
            if id.starts_with(LIVE_ID) {
                live_comment = true;
            } else {
                self.skip_block()?;
                return Ok(None);
            }
            self.skip_ws();
            match self.peek() {
                Some(next) => c = next,
                None => return Err(self.corrupted()),
            }
        }

        if c != b'{' {
            return Ok(None);
        }
        self.bump();
        self.skip_ws();

        let mut is_string = false;
        let token = match self.peek() {
            Some(b'"') => {
                self.bump();
                let t = self.take_until(|c| c == b'"');
                if self.bump() != Some(b'"') {
                    return Err(self.corrupted());
                }
                t
            }
            Some(b'\'') => {
                self.bump();
                is_string = true;
                let t = self.take_until(|c| c == b'\'');
                if self.bump() != Some(b'\'') {
                    return Err(self.corrupted());
                }
                t
            }
            Some(_) => {
                let t = self.take_until(|c| c.is_ascii_whitespace() || c == b'{' || c == b'}');
                if t.is_empty() {
                    return Err(self.corrupted());
                }
                t
            }
            None => return Err(self.corrupted()),
        };

        if token.eq_ignore_ascii_case("NIL") {
            self.skip_ws();
            if self.bump() != Some(b'}') {
                return Err(self.corrupted());
            }
            return Ok(None);
        }

        let kind = KEYWORDS
            .iter()
            .find(|(kw, _)| token.eq_ignore_ascii_case(kw))
            .map(|&(_, s)| NodeKind::Stmt(s))
            .unwrap_or_else(|| match token.parse::<f64>() {
                Ok(v) => NodeKind::Number(v),
                Err(_) if is_string => NodeKind::Str(token.clone()),
                Err(_) => NodeKind::Name(token.clone()),
            });
        let mut node = Box::new(AstNode::new(kind));

        node.left = self.read_node()?;
        node.right = self.read_node()?;

        self.skip_ws();
        if self.bump() != Some(b'}') {
            return Err(self.corrupted());
        }
        if live_comment {
            self.skip_ws();
            if self.bump() != Some(b'$') {
                return Err(self.corrupted());
            }
        }
        Ok(Some(node))
    }

    /// Skip a balanced `$…$` block: a `$` followed by whitespace closes one
    /// level, a `$` followed by an id opens another.
    fn skip_block(&mut self) -> Result<(), FrontError> {
        let mut depth = 1usize;
        while depth > 0 {
            self.take_until(|c| c == b'$');
            if self.bump() != Some(b'$') {
                return Err(self.corrupted());
            }
            match self.bump() {
                None => return Err(self.corrupted()),
                Some(c) if c.is_ascii_whitespace() => depth -= 1,
                Some(_) => depth += 1,
            }
        }
        Ok(())
    }
}
