use crate::span::Span;

/// A lexed token with its source span.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Numeric literal. All numbers are doubles.
    Number(f64),
    /// Identifier or keyword candidate that is not a keyword.
    Ident(String),

    // Keywords.
    Var,
    Function,
    If,
    Else,
    While,
    Return,

    // Punctuation.
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Semicolon,

    // Operators.
    Plus,
    Minus,
    Star,
    Slash,
    /// `=`
    Assign,
    /// `==`
    EqEq,
    /// `<`
    Lt,
    /// `<=`
    Le,

    Eof,
}

impl TokenKind {
    /// Short human-readable name used in parse error messages.
    pub fn describe(&self) -> String {
        match self {
            Self::Number(n) => format!("number `{n}`"),
            Self::Ident(s) => format!("identifier `{s}`"),
            Self::Var => "`var`".into(),
            Self::Function => "`function`".into(),
            Self::If => "`if`".into(),
            Self::Else => "`else`".into(),
            Self::While => "`while`".into(),
            Self::Return => "`return`".into(),
            Self::LParen => "`(`".into(),
            Self::RParen => "`)`".into(),
            Self::LBrace => "`{`".into(),
            Self::RBrace => "`}`".into(),
            Self::Comma => "`,`".into(),
            Self::Semicolon => "`;`".into(),
            Self::Plus => "`+`".into(),
            Self::Minus => "`-`".into(),
            Self::Star => "`*`".into(),
            Self::Slash => "`/`".into(),
            Self::Assign => "`=`".into(),
            Self::EqEq => "`==`".into(),
            Self::Lt => "`<`".into(),
            Self::Le => "`<=`".into(),
            Self::Eof => "end of input".into(),
        }
    }
}
