use crate::ast::{BinOp, Expr, ExprKind, Ident, Stmt, StmtKind};
use crate::span::Span;
use crate::token::{Token, TokenKind};
use crate::ParseError;

/// Recursive-descent parser over a pre-lexed token stream.
///
/// Precedence, loosest first: assignment (right associative), comparison
/// (`==` `<` `<=`, left associative), additive, multiplicative, then
/// call/primary.
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    pub fn parse_program(mut self) -> Result<Vec<Stmt>, ParseError> {
        let mut statements = Vec::new();
        while self.peek().kind != TokenKind::Eof {
            statements.push(self.statement()?);
        }
        Ok(statements)
    }

    // ── token plumbing ─────────────────────────────────────────────

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if &self.peek().kind == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, ParseError> {
        if self.peek().kind == kind {
            Ok(self.advance())
        } else {
            let found = self.peek();
            Err(ParseError::new(
                format!(
                    "expected {}, found {}",
                    kind.describe(),
                    found.kind.describe()
                ),
                found.span,
            ))
        }
    }

    fn expect_ident(&mut self) -> Result<Ident, ParseError> {
        let token = self.advance();
        match token.kind {
            TokenKind::Ident(name) => Ok(Ident {
                name,
                span: token.span,
            }),
            other => Err(ParseError::new(
                format!("expected identifier, found {}", other.describe()),
                token.span,
            )),
        }
    }

    // ── statements ─────────────────────────────────────────────────

    fn statement(&mut self) -> Result<Stmt, ParseError> {
        match self.peek().kind {
            TokenKind::Var => self.var_declaration(),
            TokenKind::Function => self.function_declaration(),
            TokenKind::If => self.if_statement(),
            TokenKind::While => self.while_statement(),
            TokenKind::Return => self.return_statement(),
            TokenKind::LBrace => self.block_statement(),
            _ => self.expression_statement(),
        }
    }

    fn var_declaration(&mut self) -> Result<Stmt, ParseError> {
        let start = self.expect(TokenKind::Var)?.span;
        let name = self.expect_ident()?;
        self.expect(TokenKind::Assign)?;
        let init = self.expression()?;
        let end = self.expect(TokenKind::Semicolon)?.span;
        Ok(Stmt {
            kind: StmtKind::VarDecl { name, init },
            span: start.to(end),
        })
    }

    fn function_declaration(&mut self) -> Result<Stmt, ParseError> {
        let start = self.expect(TokenKind::Function)?.span;
        let name = self.expect_ident()?;
        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        if self.peek().kind != TokenKind::RParen {
            loop {
                params.push(self.expect_ident()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen)?;
        self.expect(TokenKind::LBrace)?;
        let mut body = Vec::new();
        while self.peek().kind != TokenKind::RBrace {
            if self.peek().kind == TokenKind::Eof {
                return Err(ParseError::new(
                    "unterminated function body",
                    self.peek().span,
                ));
            }
            body.push(self.statement()?);
        }
        let end = self.expect(TokenKind::RBrace)?.span;
        Ok(Stmt {
            kind: StmtKind::FunctionDecl { name, params, body },
            span: start.to(end),
        })
    }

    fn if_statement(&mut self) -> Result<Stmt, ParseError> {
        let start = self.expect(TokenKind::If)?.span;
        self.expect(TokenKind::LParen)?;
        let condition = self.expression()?;
        self.expect(TokenKind::RParen)?;
        let then_branch = Box::new(self.statement()?);
        let mut span = start.to(then_branch.span);
        let else_branch = if self.eat(&TokenKind::Else) {
            let stmt = self.statement()?;
            span = start.to(stmt.span);
            Some(Box::new(stmt))
        } else {
            None
        };
        Ok(Stmt {
            kind: StmtKind::If {
                condition,
                then_branch,
                else_branch,
            },
            span,
        })
    }

    fn while_statement(&mut self) -> Result<Stmt, ParseError> {
        let start = self.expect(TokenKind::While)?.span;
        self.expect(TokenKind::LParen)?;
        let condition = self.expression()?;
        self.expect(TokenKind::RParen)?;
        let body = Box::new(self.statement()?);
        let span = start.to(body.span);
        Ok(Stmt {
            kind: StmtKind::While { condition, body },
            span,
        })
    }

    fn return_statement(&mut self) -> Result<Stmt, ParseError> {
        let start = self.expect(TokenKind::Return)?.span;
        let value = if self.peek().kind != TokenKind::Semicolon {
            Some(self.expression()?)
        } else {
            None
        };
        let end = self.expect(TokenKind::Semicolon)?.span;
        Ok(Stmt {
            kind: StmtKind::Return(value),
            span: start.to(end),
        })
    }

    fn block_statement(&mut self) -> Result<Stmt, ParseError> {
        let start = self.expect(TokenKind::LBrace)?.span;
        let mut statements = Vec::new();
        while self.peek().kind != TokenKind::RBrace {
            if self.peek().kind == TokenKind::Eof {
                return Err(ParseError::new(
                    "unterminated block",
                    self.peek().span,
                ));
            }
            statements.push(self.statement()?);
        }
        let end = self.expect(TokenKind::RBrace)?.span;
        Ok(Stmt {
            kind: StmtKind::Block(statements),
            span: start.to(end),
        })
    }

    fn expression_statement(&mut self) -> Result<Stmt, ParseError> {
        let expr = self.expression()?;
        let end = self.expect(TokenKind::Semicolon)?.span;
        let span = expr.span.to(end);
        Ok(Stmt {
            kind: StmtKind::Expr(expr),
            span,
        })
    }

    // ── expressions ────────────────────────────────────────────────

    fn expression(&mut self) -> Result<Expr, ParseError> {
        self.assignment()
    }

    fn assignment(&mut self) -> Result<Expr, ParseError> {
        let left = self.comparison()?;
        if self.peek().kind != TokenKind::Assign {
            return Ok(left);
        }
        let eq_span = self.advance().span;
        // Only a bare identifier is a valid assignment target.
        let target = match left.kind {
            ExprKind::Ident(name) => Ident {
                name,
                span: left.span,
            },
            _ => {
                return Err(ParseError::new(
                    "invalid assignment target",
                    eq_span,
                ));
            }
        };
        let value = self.assignment()?;
        let span = left.span.to(value.span);
        Ok(Expr {
            kind: ExprKind::Assign {
                target,
                value: Box::new(value),
            },
            span,
        })
    }

    fn comparison(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::EqEq => BinOp::Eq,
                TokenKind::Lt => BinOp::Lt,
                TokenKind::Le => BinOp::Le,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.additive()?;
            let span = left.span.to(right.span);
            left = Expr {
                kind: ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            };
        }
    }

    fn additive(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.multiplicative()?;
            let span = left.span.to(right.span);
            left = Expr {
                kind: ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            };
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.call_or_primary()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.call_or_primary()?;
            let span = left.span.to(right.span);
            left = Expr {
                kind: ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            };
        }
    }

    fn call_or_primary(&mut self) -> Result<Expr, ParseError> {
        let token = self.advance();
        match token.kind {
            TokenKind::Number(value) => Ok(Expr {
                kind: ExprKind::Number(value),
                span: token.span,
            }),
            TokenKind::Ident(name) => {
                if self.peek().kind != TokenKind::LParen {
                    return Ok(Expr {
                        kind: ExprKind::Ident(name),
                        span: token.span,
                    });
                }
                self.advance();
                let mut args = Vec::new();
                if self.peek().kind != TokenKind::RParen {
                    loop {
                        args.push(self.expression()?);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                let end = self.expect(TokenKind::RParen)?.span;
                Ok(Expr {
                    kind: ExprKind::Call {
                        callee: Ident {
                            name,
                            span: token.span,
                        },
                        args,
                    },
                    span: token.span.to(end),
                })
            }
            TokenKind::LParen => {
                let inner = self.expression()?;
                let end = self.expect(TokenKind::RParen)?.span;
                Ok(Expr {
                    kind: inner.kind,
                    span: token.span.to(end),
                })
            }
            other => Err(ParseError::new(
                format!("expected expression, found {}", other.describe()),
                token.span,
            )),
        }
    }
}
