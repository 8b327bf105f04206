use std::rc::Rc;

use super::lexer::{CompoundOp, Span, Token, TokenKind};
use super::syntax::{
    Case, CatchClause, Expr, ForInTarget, ForInit, FunctionNode, Property, PropertyKey,
    PropertyRole, Stmt, VarDecl,
};
use crate::ast::{BinaryOp, CompareOp, CountOp, UnaryOp};
use crate::{Error, Result};

/// A recursive descent parser for scripts.
pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
    /// Set while parsing the head of a `for` statement, where `in` ends the
    /// expression.
    no_in: bool,
}

impl Parser {
    #[must_use]
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            current: 0,
            no_in: false,
        }
    }

    /// Parses a whole script into the body of its top-level function.
    pub fn parse(&mut self) -> Result<FunctionNode> {
        let mut body = Vec::new();
        while !self.is_at_end() {
            body.push(self.statement()?);
        }
        Ok(FunctionNode {
            name: None,
            params: Vec::new(),
            body,
            start: 0,
            end: self.current_span().offset,
            is_expression: false,
        })
    }

    // ── Statements ──

    fn statement(&mut self) -> Result<Stmt> {
        match self.peek_kind() {
            TokenKind::LBrace => Ok(Stmt::Block(self.block()?)),
            TokenKind::Var | TokenKind::Const => {
                let statement = self.var_stmt()?;
                self.consume_semicolon()?;
                Ok(statement)
            }
            TokenKind::Semi => {
                self.advance();
                Ok(Stmt::Empty)
            }
            TokenKind::If => self.if_stmt(),
            TokenKind::Do => self.do_while_stmt(),
            TokenKind::While => self.while_stmt(),
            TokenKind::For => self.for_stmt(),
            TokenKind::Continue => {
                self.advance();
                let label = self.jump_label();
                self.consume_semicolon()?;
                Ok(Stmt::Continue(label))
            }
            TokenKind::Break => {
                self.advance();
                let label = self.jump_label();
                self.consume_semicolon()?;
                Ok(Stmt::Break(label))
            }
            TokenKind::Return => self.return_stmt(),
            TokenKind::With => self.with_stmt(),
            TokenKind::Switch => self.switch_stmt(),
            TokenKind::Throw => self.throw_stmt(),
            TokenKind::Try => self.try_stmt(),
            TokenKind::Debugger => {
                self.advance();
                self.consume_semicolon()?;
                Ok(Stmt::Debugger)
            }
            TokenKind::Function => Ok(Stmt::Function(Rc::new(self.function(false)?))),
            TokenKind::Ident(label) if self.check_ahead(&TokenKind::Colon, 1) => {
                let label = Rc::clone(label);
                self.advance();
                self.advance();
                let body = self.statement()?;
                Ok(Stmt::Labeled {
                    label,
                    body: Box::new(body),
                })
            }
            _ => {
                let expr = self.expression()?;
                self.consume_semicolon()?;
                Ok(Stmt::Expr(expr))
            }
        }
    }

    fn block(&mut self) -> Result<Vec<Stmt>> {
        self.expect(&TokenKind::LBrace)?;
        let mut statements = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.is_at_end() {
            statements.push(self.statement()?);
        }
        self.expect(&TokenKind::RBrace)?;
        Ok(statements)
    }

    /// Automatic semicolon insertion: a missing `;` is accepted before `}`,
    /// at the end of input and after a line break.
    fn consume_semicolon(&mut self) -> Result<()> {
        if self.match_token(&TokenKind::Semi) {
            return Ok(());
        }
        let token = self.peek();
        if token.newline_before || matches!(token.kind, TokenKind::RBrace | TokenKind::Eof) {
            return Ok(());
        }
        Err(self.error("expected ';'"))
    }

    fn jump_label(&mut self) -> Option<Rc<str>> {
        if self.peek().newline_before {
            return None;
        }
        if let TokenKind::Ident(label) = self.peek_kind() {
            let label = Rc::clone(label);
            self.advance();
            return Some(label);
        }
        None
    }

    fn var_stmt(&mut self) -> Result<Stmt> {
        let is_const = self.check(&TokenKind::Const);
        self.advance();
        let mut decls = Vec::new();
        loop {
            let name = self.expect_ident()?;
            let init = if self.match_token(&TokenKind::Eq) {
                Some(self.assignment()?)
            } else {
                None
            };
            decls.push(VarDecl { name, init });
            if !self.match_token(&TokenKind::Comma) {
                break;
            }
        }
        Ok(Stmt::Var { is_const, decls })
    }

    fn if_stmt(&mut self) -> Result<Stmt> {
        self.expect(&TokenKind::If)?;
        let condition = self.parenthesized()?;
        let then_branch = Box::new(self.statement()?);
        let else_branch = if self.match_token(&TokenKind::Else) {
            Some(Box::new(self.statement()?))
        } else {
            None
        };
        Ok(Stmt::If {
            condition,
            then_branch,
            else_branch,
        })
    }

    fn do_while_stmt(&mut self) -> Result<Stmt> {
        self.expect(&TokenKind::Do)?;
        let body = Box::new(self.statement()?);
        self.expect(&TokenKind::While)?;
        let condition = self.parenthesized()?;
        // The semicolon after do-while is optional.
        self.match_token(&TokenKind::Semi);
        Ok(Stmt::DoWhile { body, condition })
    }

    fn while_stmt(&mut self) -> Result<Stmt> {
        self.expect(&TokenKind::While)?;
        let condition = self.parenthesized()?;
        let body = Box::new(self.statement()?);
        Ok(Stmt::While { condition, body })
    }

    fn for_stmt(&mut self) -> Result<Stmt> {
        self.expect(&TokenKind::For)?;
        self.expect(&TokenKind::LParen)?;

        let init = match self.peek_kind() {
            TokenKind::Semi => None,
            TokenKind::Var | TokenKind::Const => {
                let saved = std::mem::replace(&mut self.no_in, true);
                let declaration = self.var_stmt();
                self.no_in = saved;
                let Stmt::Var { is_const, decls } = declaration? else {
                    return Err(self.error("expected variable declaration"));
                };
                if self.check(&TokenKind::In) && decls.len() == 1 && decls[0].init.is_none() {
                    let name = Rc::clone(&decls[0].name);
                    return self.for_in_rest(ForInTarget::Var(name));
                }
                Some(ForInit::Var { is_const, decls })
            }
            _ => {
                let saved = std::mem::replace(&mut self.no_in, true);
                let expression = self.expression();
                self.no_in = saved;
                let expression = expression?;
                if self.check(&TokenKind::In) {
                    return self.for_in_rest(ForInTarget::Expr(expression));
                }
                Some(ForInit::Expr(expression))
            }
        };

        self.expect(&TokenKind::Semi)?;
        let condition = if self.check(&TokenKind::Semi) {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect(&TokenKind::Semi)?;
        let next = if self.check(&TokenKind::RParen) {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect(&TokenKind::RParen)?;
        let body = Box::new(self.statement()?);
        Ok(Stmt::For {
            init,
            condition,
            next,
            body,
        })
    }

    fn for_in_rest(&mut self, each: ForInTarget) -> Result<Stmt> {
        self.expect(&TokenKind::In)?;
        let object = self.expression()?;
        self.expect(&TokenKind::RParen)?;
        let body = Box::new(self.statement()?);
        Ok(Stmt::ForIn { each, object, body })
    }

    fn return_stmt(&mut self) -> Result<Stmt> {
        self.expect(&TokenKind::Return)?;
        let token = self.peek();
        let value = if token.newline_before
            || matches!(
                token.kind,
                TokenKind::Semi | TokenKind::RBrace | TokenKind::Eof
            ) {
            None
        } else {
            Some(self.expression()?)
        };
        self.consume_semicolon()?;
        Ok(Stmt::Return(value))
    }

    fn with_stmt(&mut self) -> Result<Stmt> {
        self.expect(&TokenKind::With)?;
        let object = self.parenthesized()?;
        let body = Box::new(self.statement()?);
        Ok(Stmt::With { object, body })
    }

    fn switch_stmt(&mut self) -> Result<Stmt> {
        self.expect(&TokenKind::Switch)?;
        let tag = self.parenthesized()?;
        self.expect(&TokenKind::LBrace)?;
        let mut cases = Vec::new();
        let mut seen_default = false;
        while !self.match_token(&TokenKind::RBrace) {
            let label = if self.match_token(&TokenKind::Default) {
                if seen_default {
                    return Err(self.error("more than one default clause in switch"));
                }
                seen_default = true;
                None
            } else {
                self.expect(&TokenKind::Case)?;
                Some(self.expression()?)
            };
            self.expect(&TokenKind::Colon)?;
            let mut body = Vec::new();
            while !matches!(
                self.peek_kind(),
                TokenKind::Case | TokenKind::Default | TokenKind::RBrace | TokenKind::Eof
            ) {
                body.push(self.statement()?);
            }
            cases.push(Case { label, body });
        }
        Ok(Stmt::Switch { tag, cases })
    }

    fn throw_stmt(&mut self) -> Result<Stmt> {
        self.expect(&TokenKind::Throw)?;
        if self.peek().newline_before {
            return Err(self.error("line break after throw"));
        }
        let value = self.expression()?;
        self.consume_semicolon()?;
        Ok(Stmt::Throw(value))
    }

    fn try_stmt(&mut self) -> Result<Stmt> {
        self.expect(&TokenKind::Try)?;
        let block = self.block()?;
        let catch = if self.match_token(&TokenKind::Catch) {
            self.expect(&TokenKind::LParen)?;
            let name = self.expect_ident()?;
            self.expect(&TokenKind::RParen)?;
            let body = self.block()?;
            Some(CatchClause { name, body })
        } else {
            None
        };
        let finally = if self.match_token(&TokenKind::Finally) {
            Some(self.block()?)
        } else {
            None
        };
        if catch.is_none() && finally.is_none() {
            return Err(self.error("try without catch or finally"));
        }
        Ok(Stmt::Try {
            block,
            catch,
            finally,
        })
    }

    fn function(&mut self, is_expression: bool) -> Result<FunctionNode> {
        let start = self.current_span().offset;
        self.expect(&TokenKind::Function)?;
        let name = if is_expression && self.check(&TokenKind::LParen) {
            None
        } else {
            Some(self.expect_ident()?)
        };
        self.expect(&TokenKind::LParen)?;
        let mut params = Vec::new();
        if !self.check(&TokenKind::RParen) {
            params.push(self.expect_ident()?);
            while self.match_token(&TokenKind::Comma) {
                params.push(self.expect_ident()?);
            }
        }
        self.expect(&TokenKind::RParen)?;

        let saved = std::mem::replace(&mut self.no_in, false);
        let body = self.block();
        self.no_in = saved;
        let body = body?;
        let end = self.previous_span().offset + 1;
        Ok(FunctionNode {
            name,
            params,
            body,
            start,
            end,
            is_expression,
        })
    }

    // ── Expressions ──

    fn parenthesized(&mut self) -> Result<Expr> {
        self.expect(&TokenKind::LParen)?;
        let expr = self.allow_in(Self::expression)?;
        self.expect(&TokenKind::RParen)?;
        Ok(expr)
    }

    fn allow_in<T>(&mut self, parse: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let saved = std::mem::replace(&mut self.no_in, false);
        let result = parse(self);
        self.no_in = saved;
        result
    }

    fn expression(&mut self) -> Result<Expr> {
        let mut left = self.assignment()?;
        while self.match_token(&TokenKind::Comma) {
            let right = self.assignment()?;
            left = binary(BinaryOp::Comma, left, right);
        }
        Ok(left)
    }

    fn assignment(&mut self) -> Result<Expr> {
        let target = self.conditional()?;
        let op = match self.peek_kind() {
            TokenKind::Eq => None,
            TokenKind::AssignOp(op) => Some(compound_binary_op(*op)),
            _ => return Ok(target),
        };
        self.advance();
        let value = self.assignment()?;
        Ok(Expr::Assign {
            op,
            target: Box::new(target),
            value: Box::new(value),
        })
    }

    fn conditional(&mut self) -> Result<Expr> {
        let condition = self.logical_or()?;
        if !self.match_token(&TokenKind::Question) {
            return Ok(condition);
        }
        let then_expr = self.allow_in(Self::assignment)?;
        self.expect(&TokenKind::Colon)?;
        let else_expr = self.assignment()?;
        Ok(Expr::Conditional {
            condition: Box::new(condition),
            then_expr: Box::new(then_expr),
            else_expr: Box::new(else_expr),
        })
    }

    fn logical_or(&mut self) -> Result<Expr> {
        let mut left = self.logical_and()?;
        while self.match_token(&TokenKind::OrOr) {
            let right = self.logical_and()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn logical_and(&mut self) -> Result<Expr> {
        let mut left = self.bit_or()?;
        while self.match_token(&TokenKind::AndAnd) {
            let right = self.bit_or()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn bit_or(&mut self) -> Result<Expr> {
        let mut left = self.bit_xor()?;
        while self.match_token(&TokenKind::Pipe) {
            let right = self.bit_xor()?;
            left = binary(BinaryOp::BitOr, left, right);
        }
        Ok(left)
    }

    fn bit_xor(&mut self) -> Result<Expr> {
        let mut left = self.bit_and()?;
        while self.match_token(&TokenKind::Caret) {
            let right = self.bit_and()?;
            left = binary(BinaryOp::BitXor, left, right);
        }
        Ok(left)
    }

    fn bit_and(&mut self) -> Result<Expr> {
        let mut left = self.equality()?;
        while self.match_token(&TokenKind::Amp) {
            let right = self.equality()?;
            left = binary(BinaryOp::BitAnd, left, right);
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr> {
        let mut left = self.relational()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::EqEq => CompareOp::Eq,
                TokenKind::NotEq => CompareOp::Ne,
                TokenKind::EqEqEq => CompareOp::StrictEq,
                TokenKind::NotEqEq => CompareOp::StrictNe,
                _ => break,
            };
            self.advance();
            let right = self.relational()?;
            left = compare(op, left, right);
        }
        Ok(left)
    }

    fn relational(&mut self) -> Result<Expr> {
        let mut left = self.shift()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Lt => CompareOp::Lt,
                TokenKind::Gt => CompareOp::Gt,
                TokenKind::Le => CompareOp::Le,
                TokenKind::Ge => CompareOp::Ge,
                TokenKind::InstanceOf => CompareOp::InstanceOf,
                TokenKind::In if !self.no_in => CompareOp::In,
                _ => break,
            };
            self.advance();
            let right = self.shift()?;
            left = compare(op, left, right);
        }
        Ok(left)
    }

    fn shift(&mut self) -> Result<Expr> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Shl => BinaryOp::Shl,
                TokenKind::Sar => BinaryOp::Sar,
                TokenKind::Shr => BinaryOp::Shr,
                _ => break,
            };
            self.advance();
            let right = self.additive()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn additive(&mut self) -> Result<Expr> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.multiplicative()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.unary()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr> {
        let op = match self.peek_kind() {
            TokenKind::Delete => UnaryOp::Delete,
            TokenKind::Void => UnaryOp::Void,
            TokenKind::Typeof => UnaryOp::Typeof,
            TokenKind::Plus => UnaryOp::Add,
            TokenKind::Minus => UnaryOp::Sub,
            TokenKind::Tilde => UnaryOp::BitNot,
            TokenKind::Bang => UnaryOp::Not,
            TokenKind::PlusPlus | TokenKind::MinusMinus => {
                let op = if self.check(&TokenKind::PlusPlus) {
                    CountOp::Inc
                } else {
                    CountOp::Dec
                };
                self.advance();
                let target = self.unary()?;
                return Ok(Expr::Count {
                    op,
                    is_prefix: true,
                    target: Box::new(target),
                });
            }
            _ => return self.postfix(),
        };
        self.advance();
        let operand = self.unary()?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn postfix(&mut self) -> Result<Expr> {
        let expr = self.left_hand_side()?;
        let token = self.peek();
        if token.newline_before {
            return Ok(expr);
        }
        let op = match token.kind {
            TokenKind::PlusPlus => CountOp::Inc,
            TokenKind::MinusMinus => CountOp::Dec,
            _ => return Ok(expr),
        };
        self.advance();
        Ok(Expr::Count {
            op,
            is_prefix: false,
            target: Box::new(expr),
        })
    }

    fn left_hand_side(&mut self) -> Result<Expr> {
        let mut expr = if self.check(&TokenKind::New) {
            self.new_expression()?
        } else {
            self.primary()?
        };
        loop {
            expr = match self.peek_kind() {
                TokenKind::LParen => {
                    let args = self.arguments()?;
                    Expr::Call {
                        callee: Box::new(expr),
                        args,
                    }
                }
                TokenKind::Dot | TokenKind::LBracket => self.member(expr)?,
                _ => return Ok(expr),
            };
        }
    }

    fn new_expression(&mut self) -> Result<Expr> {
        self.expect(&TokenKind::New)?;
        let mut callee = if self.check(&TokenKind::New) {
            self.new_expression()?
        } else {
            self.primary()?
        };
        while matches!(self.peek_kind(), TokenKind::Dot | TokenKind::LBracket) {
            callee = self.member(callee)?;
        }
        let args = if self.check(&TokenKind::LParen) {
            self.arguments()?
        } else {
            Vec::new()
        };
        Ok(Expr::New {
            callee: Box::new(callee),
            args,
        })
    }

    /// `.name` or `[key]` applied to `object`.
    fn member(&mut self, object: Expr) -> Result<Expr> {
        let key = if self.match_token(&TokenKind::Dot) {
            Expr::Str(self.property_identifier()?)
        } else {
            self.expect(&TokenKind::LBracket)?;
            let key = self.allow_in(Self::expression)?;
            self.expect(&TokenKind::RBracket)?;
            key
        };
        Ok(Expr::Member {
            object: Box::new(object),
            key: Box::new(key),
        })
    }

    fn arguments(&mut self) -> Result<Vec<Expr>> {
        self.expect(&TokenKind::LParen)?;
        let mut args = Vec::new();
        if !self.check(&TokenKind::RParen) {
            args.push(self.allow_in(Self::assignment)?);
            while self.match_token(&TokenKind::Comma) {
                args.push(self.allow_in(Self::assignment)?);
            }
        }
        self.expect(&TokenKind::RParen)?;
        Ok(args)
    }

    fn primary(&mut self) -> Result<Expr> {
        let kind = self.peek_kind().clone();
        let expr = match kind {
            TokenKind::This => Expr::This,
            TokenKind::True => Expr::True,
            TokenKind::False => Expr::False,
            TokenKind::Null => Expr::Null,
            TokenKind::Number(value) => Expr::Number(value),
            TokenKind::Str(value) => Expr::Str(value),
            TokenKind::Ident(name) => Expr::Ident(name),
            TokenKind::RegExp { pattern, flags } => Expr::RegExp { pattern, flags },
            TokenKind::Function => return Ok(Expr::Function(Rc::new(self.function(true)?))),
            TokenKind::LParen => return self.parenthesized(),
            TokenKind::LBracket => return self.array_literal(),
            TokenKind::LBrace => return self.object_literal(),
            _ => return Err(self.error("unexpected token")),
        };
        self.advance();
        Ok(expr)
    }

    fn array_literal(&mut self) -> Result<Expr> {
        self.expect(&TokenKind::LBracket)?;
        let mut elements = Vec::new();
        loop {
            match self.peek_kind() {
                TokenKind::RBracket => break,
                TokenKind::Comma => {
                    self.advance();
                    elements.push(None);
                }
                _ => {
                    elements.push(Some(self.allow_in(Self::assignment)?));
                    if !self.match_token(&TokenKind::Comma) {
                        break;
                    }
                }
            }
        }
        self.expect(&TokenKind::RBracket)?;
        Ok(Expr::Array(elements))
    }

    fn object_literal(&mut self) -> Result<Expr> {
        self.expect(&TokenKind::LBrace)?;
        let mut properties = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            properties.push(self.object_property()?);
            if !self.match_token(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RBrace)?;
        Ok(Expr::Object(properties))
    }

    fn object_property(&mut self) -> Result<Property> {
        let role = match self.peek_kind() {
            TokenKind::Ident(name)
                if (&**name == "get" || &**name == "set")
                    && !matches!(
                        self.tokens.get(self.current + 1).map(|t| &t.kind),
                        Some(TokenKind::Colon | TokenKind::Comma | TokenKind::RBrace)
                    ) =>
            {
                if &**name == "get" {
                    PropertyRole::Getter
                } else {
                    PropertyRole::Setter
                }
            }
            _ => PropertyRole::Value,
        };
        if role != PropertyRole::Value {
            self.advance();
            let start = self.current_span().offset;
            let key = self.property_key()?;
            let mut function = self.accessor_function()?;
            function.start = start;
            return Ok(Property {
                key,
                value: Expr::Function(Rc::new(function)),
                role,
            });
        }

        let key = self.property_key()?;
        self.expect(&TokenKind::Colon)?;
        let value = self.allow_in(Self::assignment)?;
        Ok(Property {
            key,
            value,
            role: PropertyRole::Value,
        })
    }

    /// `(params) { body }` of a getter or setter.
    fn accessor_function(&mut self) -> Result<FunctionNode> {
        self.expect(&TokenKind::LParen)?;
        let mut params = Vec::new();
        if !self.check(&TokenKind::RParen) {
            params.push(self.expect_ident()?);
        }
        self.expect(&TokenKind::RParen)?;
        let body = self.allow_in(Self::block)?;
        Ok(FunctionNode {
            // Accessors do not bind their property name.
            name: None,
            params,
            body,
            start: 0,
            end: self.previous_span().offset + 1,
            is_expression: true,
        })
    }

    fn property_key(&mut self) -> Result<PropertyKey> {
        let key = match self.peek_kind() {
            TokenKind::Ident(name) | TokenKind::Str(name) => PropertyKey::Name(Rc::clone(name)),
            TokenKind::Number(value) => PropertyKey::Number(*value),
            kind => match kind.keyword_text() {
                Some(text) => PropertyKey::Name(Rc::from(text)),
                None => return Err(self.error("expected property name")),
            },
        };
        self.advance();
        Ok(key)
    }

    /// A property name after `.`; keywords are allowed.
    fn property_identifier(&mut self) -> Result<Rc<str>> {
        let name = match self.peek_kind() {
            TokenKind::Ident(name) => Rc::clone(name),
            kind => match kind.keyword_text() {
                Some(text) => Rc::from(text),
                None => return Err(self.error("expected property name")),
            },
        };
        self.advance();
        Ok(name)
    }

    // ── Token helpers ──

    fn peek(&self) -> &Token {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[self.current.min(last)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn is_at_end(&self) -> bool {
        matches!(self.peek_kind(), TokenKind::Eof)
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn check_ahead(&self, kind: &TokenKind, offset: usize) -> bool {
        self.tokens.get(self.current + offset).map(|t| &t.kind) == Some(kind)
    }

    fn advance(&mut self) {
        if !self.is_at_end() {
            self.current += 1;
        }
    }

    fn match_token(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<()> {
        if self.check(kind) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(&format!("expected {kind:?}")))
        }
    }

    fn expect_ident(&mut self) -> Result<Rc<str>> {
        if let TokenKind::Ident(name) = self.peek_kind() {
            let name = Rc::clone(name);
            self.advance();
            Ok(name)
        } else {
            Err(self.error("expected identifier"))
        }
    }

    fn current_span(&self) -> Span {
        self.peek().span
    }

    fn previous_span(&self) -> Span {
        self.tokens
            .get(self.current.saturating_sub(1))
            .map_or(Span::new(1, 1, 0), |t| t.span)
    }

    fn error(&self, message: &str) -> Error {
        let token = self.peek();
        Error::Parse {
            line: token.span.line,
            column: token.span.column,
            message: format!("{message}, found {:?}", token.kind),
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

fn compare(op: CompareOp, left: Expr, right: Expr) -> Expr {
    Expr::Compare {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

fn compound_binary_op(op: CompoundOp) -> BinaryOp {
    match op {
        CompoundOp::Add => BinaryOp::Add,
        CompoundOp::Sub => BinaryOp::Sub,
        CompoundOp::Mul => BinaryOp::Mul,
        CompoundOp::Div => BinaryOp::Div,
        CompoundOp::Mod => BinaryOp::Mod,
        CompoundOp::Shl => BinaryOp::Shl,
        CompoundOp::Sar => BinaryOp::Sar,
        CompoundOp::Shr => BinaryOp::Shr,
        CompoundOp::BitAnd => BinaryOp::BitAnd,
        CompoundOp::BitOr => BinaryOp::BitOr,
        CompoundOp::BitXor => BinaryOp::BitXor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::lexer::Lexer;

    fn parse(source: &str) -> FunctionNode {
        let tokens = Lexer::new(source).scan_tokens().unwrap();
        Parser::new(tokens).parse().unwrap()
    }

    fn parse_error(source: &str) -> Error {
        let tokens = Lexer::new(source).scan_tokens().unwrap();
        Parser::new(tokens).parse().unwrap_err()
    }

    #[test]
    fn test_precedence() {
        let program = parse("a = 1 + 2 * 3;");
        let Stmt::Expr(Expr::Assign { op: None, value, .. }) = &program.body[0] else {
            panic!("expected assignment");
        };
        let Expr::Binary {
            op: BinaryOp::Add,
            right,
            ..
        } = &**value
        else {
            panic!("expected addition");
        };
        assert!(matches!(
            &**right,
            Expr::Binary {
                op: BinaryOp::Mul,
                ..
            }
        ));
    }

    #[test]
    fn test_semicolon_insertion() {
        let program = parse("var a = 1\nvar b = 2\nreturn\na");
        assert_eq!(program.body.len(), 4);
        assert!(matches!(program.body[2], Stmt::Return(None)));
    }

    #[test]
    fn test_for_in_heads() {
        let program = parse("for (var k in o) {} for (x.y in o) {} for (var i = 0; i < 3; i++) {}");
        assert!(matches!(
            program.body[0],
            Stmt::ForIn {
                each: ForInTarget::Var(_),
                ..
            }
        ));
        assert!(matches!(
            program.body[1],
            Stmt::ForIn {
                each: ForInTarget::Expr(Expr::Member { .. }),
                ..
            }
        ));
        assert!(matches!(
            program.body[2],
            Stmt::For {
                init: Some(ForInit::Var { .. }),
                ..
            }
        ));
    }

    #[test]
    fn test_object_literal_accessors() {
        let program = parse("o = { get x() { return 1 }, set x(v) {}, get: 2, 'a b': 3, 4: 5 };");
        let Stmt::Expr(Expr::Assign { value, .. }) = &program.body[0] else {
            panic!("expected assignment");
        };
        let Expr::Object(properties) = &**value else {
            panic!("expected object literal");
        };
        let roles: Vec<PropertyRole> = properties.iter().map(|p| p.role).collect();
        assert_eq!(
            roles,
            vec![
                PropertyRole::Getter,
                PropertyRole::Setter,
                PropertyRole::Value,
                PropertyRole::Value,
                PropertyRole::Value,
            ]
        );
        assert_eq!(properties[4].key, PropertyKey::Number(4.0));
    }

    #[test]
    fn test_new_and_calls() {
        let program = parse("new a.B(1)(2);");
        let Stmt::Expr(Expr::Call { callee, args }) = &program.body[0] else {
            panic!("expected call");
        };
        assert_eq!(args.len(), 1);
        assert!(matches!(&**callee, Expr::New { args, .. } if args.len() == 1));
    }

    #[test]
    fn test_labels_and_switch() {
        let program = parse("outer: while (1) { switch (x) { case 1: break outer; default: } }");
        assert!(matches!(program.body[0], Stmt::Labeled { .. }));
    }

    #[test]
    fn test_errors_carry_position() {
        let Error::Parse { line, .. } = parse_error("var a = ;\n") else {
            panic!("expected a parse error");
        };
        assert_eq!(line, 1);
        assert!(matches!(parse_error("try {}"), Error::Parse { .. }));
        assert!(matches!(
            parse_error("switch (x) { default: default: }"),
            Error::Parse { .. }
        ));
    }
}
