//! Abstract syntax tree for the surface language.
//!
//! The vocabulary is deliberately small: variable declarations with a
//! literal initializer, expression statements, `if`/`while`/block/`return`
//! statements, function declarations with identifier-only parameters, and
//! identifier/binary/assignment/call expressions. Every node carries a
//! [`Span`] so downstream consumers can report exact source positions.

use crate::span::Span;

/// An identifier together with where it appeared.
#[derive(Debug, Clone, PartialEq)]
pub struct Ident {
    pub name: String,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// `var <ident> = <init>;` — the compiler requires `init` to be a
    /// number literal.
    VarDecl { name: Ident, init: Expr },
    /// An expression evaluated for its effect; the value is discarded.
    Expr(Expr),
    If {
        condition: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
    },
    While {
        condition: Expr,
        body: Box<Stmt>,
    },
    Block(Vec<Stmt>),
    /// `return;` returns the undefined value (zero).
    Return(Option<Expr>),
    FunctionDecl {
        name: Ident,
        params: Vec<Ident>,
        body: Vec<Stmt>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Number(f64),
    Ident(String),
    /// `<ident> = <value>` — produces the assigned value.
    Assign {
        target: Ident,
        value: Box<Expr>,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        callee: Ident,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    /// `==`
    Eq,
    /// `<`
    Lt,
    /// `<=`
    Le,
}

impl std::fmt::Display for BinOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Eq => "==",
            Self::Lt => "<",
            Self::Le => "<=",
        };
        write!(f, "{s}")
    }
}
