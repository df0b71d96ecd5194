//! Recursive-descent parser with precedence climbing for expressions.

use crate::ast::*;
use crate::lexer::{LexError, Lexer};
use crate::token::Token;
use crate::{CompileError, Stage};
use lunet_core::string::{Interner, StrId};

/// Parse a chunk into its top-level block, returning the interner that owns
/// every name and literal in the AST.
pub fn parse(source: &[u8]) -> Result<(Block, Interner), CompileError> {
    let mut p = Parser {
        lexer: Lexer::new(source),
    };
    let block = p.block()?;
    p.expect(&Token::Eof)?;
    Ok((block, p.lexer.strings))
}

struct Parser<'a> {
    lexer: Lexer<'a>,
}

impl From<LexError> for CompileError {
    fn from(e: LexError) -> Self {
        CompileError {
            stage: Stage::Lexer,
            message: e.message,
            line: e.line,
        }
    }
}

impl<'a> Parser<'a> {
    fn error(&self, msg: impl Into<String>) -> CompileError {
        CompileError {
            stage: Stage::Parser,
            message: msg.into(),
            line: self.line(),
        }
    }

    fn line(&self) -> u32 {
        self.lexer
            .current()
            .map(|t| t.line)
            .unwrap_or_else(|e| e.line)
    }

    fn peek(&self) -> Result<&Token, CompileError> {
        self.lexer.current().map(|t| &t.token).map_err(|e| CompileError {
            stage: Stage::Lexer,
            message: e.message.clone(),
            line: e.line,
        })
    }

    fn check(&self, tok: &Token) -> bool {
        self.peek().map(|t| t == tok).unwrap_or(false)
    }

    fn advance(&mut self) -> Result<Token, CompileError> {
        Ok(self.lexer.advance()?.token)
    }

    fn accept(&mut self, tok: &Token) -> Result<bool, CompileError> {
        if self.check(tok) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, tok: &Token) -> Result<(), CompileError> {
        if self.accept(tok)? {
            Ok(())
        } else {
            let found = self
                .peek()
                .map(|t| t.to_string())
                .unwrap_or_else(|_| "<error>".into());
            Err(self.error(format!("'{tok}' expected near '{found}'")))
        }
    }

    fn expect_name(&mut self) -> Result<StrId, CompileError> {
        match self.peek()?.clone() {
            Token::Name(id) => {
                self.advance()?;
                Ok(id)
            }
            other => Err(self.error(format!("<name> expected near '{other}'"))),
        }
    }

    fn block_ends(&self) -> bool {
        matches!(
            self.peek(),
            Ok(Token::End) | Ok(Token::Else) | Ok(Token::ElseIf) | Ok(Token::Until) | Ok(Token::Eof)
        )
    }

    // ---- Statements ----

    fn block(&mut self) -> Result<Block, CompileError> {
        let line = self.line();
        let mut stmts = Vec::new();
        loop {
            if self.block_ends() {
                break;
            }
            if self.check(&Token::Return) {
                stmts.push(self.return_stat()?);
                // return must close the block; allow a trailing ';'
                break;
            }
            if let Some(stmt) = self.statement()? {
                stmts.push(stmt);
            }
        }
        Ok(Block { stmts, line })
    }

    fn statement(&mut self) -> Result<Option<Stmt>, CompileError> {
        let line = self.line();
        match self.peek()?.clone() {
            Token::Semi => {
                self.advance()?;
                Ok(None)
            }
            Token::Local => {
                self.advance()?;
                if self.accept(&Token::Function)? {
                    let name = self.expect_name()?;
                    let body = self.func_body(false)?;
                    Ok(Some(Stmt::LocalFunction { name, body, line }))
                } else {
                    let mut names = vec![self.expect_name()?];
                    while self.accept(&Token::Comma)? {
                        names.push(self.expect_name()?);
                    }
                    let values = if self.accept(&Token::Assign)? {
                        self.expr_list()?
                    } else {
                        Vec::new()
                    };
                    Ok(Some(Stmt::Local {
                        names,
                        values,
                        line,
                    }))
                }
            }
            Token::If => {
                self.advance()?;
                let cond = self.expression()?;
                self.expect(&Token::Then)?;
                let then = self.block()?;
                let mut elseifs = Vec::new();
                while self.accept(&Token::ElseIf)? {
                    let c = self.expression()?;
                    self.expect(&Token::Then)?;
                    elseifs.push((c, self.block()?));
                }
                let else_block = if self.accept(&Token::Else)? {
                    Some(self.block()?)
                } else {
                    None
                };
                self.expect(&Token::End)?;
                Ok(Some(Stmt::If {
                    cond,
                    then,
                    elseifs,
                    else_block,
                    line,
                }))
            }
            Token::While => {
                self.advance()?;
                let cond = self.expression()?;
                self.expect(&Token::Do)?;
                let body = self.block()?;
                self.expect(&Token::End)?;
                Ok(Some(Stmt::While { cond, body, line }))
            }
            Token::Do => {
                self.advance()?;
                let body = self.block()?;
                self.expect(&Token::End)?;
                Ok(Some(Stmt::Do(body)))
            }
            Token::For => {
                self.advance()?;
                self.for_stat(line).map(Some)
            }
            Token::Repeat => {
                self.advance()?;
                let body = self.block()?;
                self.expect(&Token::Until)?;
                let cond = self.expression()?;
                Ok(Some(Stmt::Repeat { body, cond, line }))
            }
            Token::Function => {
                self.advance()?;
                let base = self.expect_name()?;
                let mut fields = Vec::new();
                let mut method = None;
                loop {
                    if self.accept(&Token::Dot)? {
                        fields.push(self.expect_name()?);
                    } else if self.accept(&Token::Colon)? {
                        method = Some(self.expect_name()?);
                        break;
                    } else {
                        break;
                    }
                }
                let body = self.func_body(method.is_some())?;
                Ok(Some(Stmt::Function {
                    name: FuncName {
                        base,
                        fields,
                        method,
                    },
                    body,
                    line,
                }))
            }
            Token::Break => {
                self.advance()?;
                Ok(Some(Stmt::Break(line)))
            }
            Token::Continue => {
                self.advance()?;
                Ok(Some(Stmt::Continue(line)))
            }
            Token::Goto => {
                self.advance()?;
                let label = self.expect_name()?;
                Ok(Some(Stmt::Goto { label, line }))
            }
            Token::DoubleColon => {
                self.advance()?;
                let name = self.expect_name()?;
                self.expect(&Token::DoubleColon)?;
                Ok(Some(Stmt::Label { name, line }))
            }
            _ => self.expr_stat(line).map(Some),
        }
    }

    fn return_stat(&mut self) -> Result<Stmt, CompileError> {
        let line = self.line();
        self.advance()?; // 'return'
        let values = if self.block_ends() || self.check(&Token::Semi) {
            Vec::new()
        } else {
            self.expr_list()?
        };
        self.accept(&Token::Semi)?;
        Ok(Stmt::Return { values, line })
    }

    fn for_stat(&mut self, line: u32) -> Result<Stmt, CompileError> {
        let first = self.expect_name()?;
        if self.accept(&Token::Assign)? {
            let start = self.expression()?;
            self.expect(&Token::Comma)?;
            let limit = self.expression()?;
            let step = if self.accept(&Token::Comma)? {
                Some(self.expression()?)
            } else {
                None
            };
            self.expect(&Token::Do)?;
            let body = self.block()?;
            self.expect(&Token::End)?;
            return Ok(Stmt::NumericFor {
                var: first,
                start,
                limit,
                step,
                body,
                line,
            });
        }

        let mut vars = vec![first];
        while self.accept(&Token::Comma)? {
            vars.push(self.expect_name()?);
        }
        self.expect(&Token::In)?;
        let exprs = self.expr_list()?;
        self.expect(&Token::Do)?;
        let body = self.block()?;
        self.expect(&Token::End)?;
        Ok(Stmt::GenericFor {
            vars,
            exprs,
            body,
            line,
        })
    }

    /// Either an assignment or a call statement; both start with a suffixed
    /// primary expression.
    fn expr_stat(&mut self, line: u32) -> Result<Stmt, CompileError> {
        let first = self.suffixed_expression()?;

        if self.check(&Token::Assign) || self.check(&Token::Comma) {
            let mut targets = vec![first];
            while self.accept(&Token::Comma)? {
                targets.push(self.suffixed_expression()?);
            }
            for t in &targets {
                if !matches!(
                    t,
                    Expr::Name(..) | Expr::Index { .. } | Expr::Field { .. }
                ) {
                    return Err(self.error("syntax error: cannot assign to this expression"));
                }
            }
            self.expect(&Token::Assign)?;
            let values = self.expr_list()?;
            return Ok(Stmt::Assign {
                targets,
                values,
                line,
            });
        }

        match first {
            e @ (Expr::Call { .. } | Expr::MethodCall { .. }) => Ok(Stmt::Call(e)),
            _ => Err(self.error("syntax error: expression is not a statement")),
        }
    }

    // ---- Expressions ----

    fn expr_list(&mut self) -> Result<Vec<Expr>, CompileError> {
        let mut list = vec![self.expression()?];
        while self.accept(&Token::Comma)? {
            list.push(self.expression()?);
        }
        Ok(list)
    }

    fn expression(&mut self) -> Result<Expr, CompileError> {
        self.sub_expression(0)
    }

    /// Precedence climbing, per the Lua 5.3 priority table in `ast.rs`.
    fn sub_expression(&mut self, min_prec: u8) -> Result<Expr, CompileError> {
        let line = self.line();
        let mut lhs = if let Some(unop) = self.check_unary()? {
            self.advance()?;
            let operand = self.sub_expression(UNARY_PRIORITY)?;
            Expr::Unary {
                op: unop,
                operand: Box::new(operand),
                line,
            }
        } else {
            self.simple_expression()?
        };

        while let Some(binop) = self.check_binary()? {
            let (left_prec, right_prec) = binop.priority();
            if left_prec <= min_prec {
                break;
            }
            let op_line = self.line();
            self.advance()?;
            let rhs = self.sub_expression(right_prec)?;
            lhs = Expr::Binary {
                op: binop,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line: op_line,
            };
        }
        Ok(lhs)
    }

    fn check_unary(&self) -> Result<Option<UnOp>, CompileError> {
        Ok(match self.peek()? {
            Token::Minus => Some(UnOp::Neg),
            Token::Not => Some(UnOp::Not),
            Token::Hash => Some(UnOp::Len),
            Token::Tilde => Some(UnOp::BNot),
            _ => None,
        })
    }

    fn check_binary(&self) -> Result<Option<BinOp>, CompileError> {
        Ok(match self.peek()? {
            Token::Plus => Some(BinOp::Add),
            Token::Minus => Some(BinOp::Sub),
            Token::Star => Some(BinOp::Mul),
            Token::Slash => Some(BinOp::Div),
            Token::FloorDiv => Some(BinOp::IDiv),
            Token::Percent => Some(BinOp::Mod),
            Token::Caret => Some(BinOp::Pow),
            Token::DotDot => Some(BinOp::Concat),
            Token::Ampersand => Some(BinOp::BAnd),
            Token::Pipe => Some(BinOp::BOr),
            Token::Tilde => Some(BinOp::BXor),
            Token::ShiftLeft => Some(BinOp::Shl),
            Token::ShiftRight => Some(BinOp::Shr),
            Token::Equal => Some(BinOp::Eq),
            Token::NotEqual => Some(BinOp::NotEq),
            Token::Less => Some(BinOp::Lt),
            Token::LessEq => Some(BinOp::LtEq),
            Token::Greater => Some(BinOp::Gt),
            Token::GreaterEq => Some(BinOp::GtEq),
            Token::And => Some(BinOp::And),
            Token::Or => Some(BinOp::Or),
            _ => None,
        })
    }

    fn simple_expression(&mut self) -> Result<Expr, CompileError> {
        let line = self.line();
        match self.peek()?.clone() {
            Token::Nil => {
                self.advance()?;
                Ok(Expr::Nil(line))
            }
            Token::True => {
                self.advance()?;
                Ok(Expr::True(line))
            }
            Token::False => {
                self.advance()?;
                Ok(Expr::False(line))
            }
            Token::Integer(i) => {
                self.advance()?;
                Ok(Expr::Integer(i, line))
            }
            Token::Float(f) => {
                self.advance()?;
                Ok(Expr::Float(f, line))
            }
            Token::String(id) => {
                self.advance()?;
                Ok(Expr::Str(id, line))
            }
            Token::DotDotDot => {
                self.advance()?;
                Ok(Expr::Vararg(line))
            }
            Token::Function => {
                self.advance()?;
                Ok(Expr::Function(self.func_body(false)?))
            }
            Token::LBrace => self.table_constructor(),
            _ => self.suffixed_expression(),
        }
    }

    /// A name or parenthesized expression with a chain of suffixes:
    /// `.name`, `[expr]`, `:m(args)`, call arguments.
    fn suffixed_expression(&mut self) -> Result<Expr, CompileError> {
        let line = self.line();
        let mut expr = match self.peek()?.clone() {
            Token::Name(id) => {
                self.advance()?;
                Expr::Name(id, line)
            }
            Token::LParen => {
                self.advance()?;
                let inner = self.expression()?;
                self.expect(&Token::RParen)?;
                Expr::Paren(Box::new(inner), line)
            }
            other => return Err(self.error(format!("unexpected symbol near '{other}'"))),
        };

        loop {
            let line = self.line();
            match self.peek()?.clone() {
                Token::Dot => {
                    self.advance()?;
                    let field = self.expect_name()?;
                    expr = Expr::Field {
                        table: Box::new(expr),
                        field,
                        line,
                    };
                }
                Token::LBracket => {
                    self.advance()?;
                    let key = self.expression()?;
                    self.expect(&Token::RBracket)?;
                    expr = Expr::Index {
                        table: Box::new(expr),
                        key: Box::new(key),
                        line,
                    };
                }
                Token::Colon => {
                    self.advance()?;
                    let method = self.expect_name()?;
                    let args = self.call_args()?;
                    expr = Expr::MethodCall {
                        object: Box::new(expr),
                        method,
                        args,
                        line,
                    };
                }
                Token::LParen | Token::LBrace | Token::String(_) => {
                    let args = self.call_args()?;
                    expr = Expr::Call {
                        func: Box::new(expr),
                        args,
                        line,
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn call_args(&mut self) -> Result<Vec<Expr>, CompileError> {
        let line = self.line();
        match self.peek()?.clone() {
            Token::LParen => {
                self.advance()?;
                let args = if self.check(&Token::RParen) {
                    Vec::new()
                } else {
                    self.expr_list()?
                };
                self.expect(&Token::RParen)?;
                Ok(args)
            }
            Token::LBrace => Ok(vec![self.table_constructor()?]),
            Token::String(id) => {
                self.advance()?;
                Ok(vec![Expr::Str(id, line)])
            }
            _ => Err(self.error("function arguments expected")),
        }
    }

    fn table_constructor(&mut self) -> Result<Expr, CompileError> {
        let line = self.line();
        self.expect(&Token::LBrace)?;
        let mut items = Vec::new();
        while !self.check(&Token::RBrace) {
            match self.peek()?.clone() {
                Token::LBracket => {
                    self.advance()?;
                    let key = self.expression()?;
                    self.expect(&Token::RBracket)?;
                    self.expect(&Token::Assign)?;
                    items.push(TableItem::Keyed(key, self.expression()?));
                }
                _ => {
                    // A bare `Name = expr` is a record field; the
                    // expression parser stops before `=`, so probe after.
                    let expr = self.expression()?;
                    if let (Expr::Name(id, _), true) = (&expr, self.check(&Token::Assign)) {
                        let id = *id;
                        self.advance()?;
                        items.push(TableItem::Named(id, self.expression()?));
                    } else if self.check(&Token::Assign) {
                        return Err(self.error("'}' expected near '='"));
                    } else {
                        items.push(TableItem::Item(expr));
                    }
                }
            }
            if !self.accept(&Token::Comma)? && !self.accept(&Token::Semi)? {
                break;
            }
        }
        self.expect(&Token::RBrace)?;
        Ok(Expr::Table(items, line))
    }

    fn func_body(&mut self, is_method: bool) -> Result<FuncBody, CompileError> {
        let line = self.line();
        self.expect(&Token::LParen)?;
        let mut params = Vec::new();
        let mut is_vararg = false;
        if is_method {
            // Implicit 'self' is materialized by the parser so the code
            // generator sees an ordinary first parameter.
            params.push(self.lexer.strings.intern(b"self"));
        }
        if !self.check(&Token::RParen) {
            loop {
                match self.peek()?.clone() {
                    Token::Name(id) => {
                        self.advance()?;
                        params.push(id);
                    }
                    Token::DotDotDot => {
                        self.advance()?;
                        is_vararg = true;
                        break;
                    }
                    other => {
                        return Err(self.error(format!("<name> expected near '{other}'")));
                    }
                }
                if !self.accept(&Token::Comma)? {
                    break;
                }
            }
        }
        self.expect(&Token::RParen)?;
        let body = self.block()?;
        let end_line = self.line();
        self.expect(&Token::End)?;
        Ok(FuncBody {
            params,
            is_vararg,
            body,
            line,
            end_line,
        })
    }
}
