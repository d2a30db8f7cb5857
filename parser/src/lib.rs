//! Front-end for the surface language: lexer, AST, and parser.
//!
//! The supported grammar is a small imperative subset — `var` declarations,
//! assignments, arithmetic and comparisons, `if`/`while`, function
//! declarations, and calls. Everything else is a parse error with a source
//! position.

pub mod ast;
mod lexer;
mod parser;
pub mod span;
pub mod token;

pub use lexer::Lexer;
pub use parser::Parser;

use span::Span;

/// A syntax error with the position it occurred at.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub span: Span,
}

impl ParseError {
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.span.start, self.message)
    }
}

impl std::error::Error for ParseError {}

/// Lex and parse a complete program.
pub fn parse(source: &str) -> Result<Vec<ast::Stmt>, ParseError> {
    let tokens = Lexer::new(source).tokenize()?;
    Parser::new(tokens).parse_program()
}
