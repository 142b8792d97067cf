use crate::ast::{
    Arg, BinaryOp, CaseTerm, ConstItem, Decl, Dim, Expr, ExprKind, FunctionDecl, FunctionSig,
    JumpTarget, LogicOp, Param, Pragma, Program, Stmt, StmtKind, TypeExpr, UnaryOp, VarItem,
    WhichCase,
};
use crate::lexer::{Span, Spanned};
use crate::parser_error::{ERR_BAD_JUMP_COUNT, ERR_EQ_AS_ASSIGN, ERR_SYNTAX, ParserError};
use crate::token::Token;

type ParseResult<T> = Result<T, ParserError>;

/// Recursive-descent parser producing the declaration/statement tree.
///
/// Errors are collected rather than returned immediately: after a failed
/// declaration or statement the parser skips to the next `;` (or a token
/// that clearly starts something new) and carries on, so one run reports
/// several independent syntax errors.
pub struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    /// Span of the most recently consumed token.
    ///
    /// Used to provide stable source locations for errors that occur after
    /// advancing past the last token or at end-of-file.
    last_span: Option<Span>,
    errors: Vec<ParserError>,
}

impl Parser {
    pub fn new(tokens: Vec<Spanned>) -> Self {
        Parser {
            tokens,
            pos: 0,
            last_span: None,
            errors: Vec::new(),
        }
    }

    fn current(&self) -> Option<&Spanned> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Spanned> {
        let token = self.tokens.get(self.pos);
        if let Some(s) = token {
            self.last_span = Some(s.span);
        }
        self.pos += 1;
        token
    }

    fn peek(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .map(|s| &s.token)
            .unwrap_or(&Token::Eof)
    }

    fn peek_next(&self) -> &Token {
        self.tokens
            .get(self.pos + 1)
            .map(|s| &s.token)
            .unwrap_or(&Token::Eof)
    }

    fn span(&self) -> Span {
        self.current()
            .map(|s| s.span)
            .or(self.last_span)
            .unwrap_or(Span { line: 1, col: 1 })
    }

    fn check(&self, token: &Token) -> bool {
        self.peek() == token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Constructs a `ParserError` at the current token, or the last consumed
    /// one once the stream is exhausted.
    fn error(&self, message: &str) -> ParserError {
        self.error_code(ERR_SYNTAX, message)
    }

    fn error_code(&self, code: u32, message: &str) -> ParserError {
        let span = self.span();
        ParserError {
            code,
            message: message.to_string(),
            line: span.line,
            col: span.col,
        }
    }

    fn expect(&mut self, token: &Token) -> ParseResult<Span> {
        if self.check(token) {
            let span = self.span();
            self.advance();
            Ok(span)
        } else {
            Err(self.error(&format!("expected '{}', found '{}'", token, self.peek())))
        }
    }

    fn expect_ident(&mut self, what: &str) -> ParseResult<(String, Span)> {
        match self.peek().clone() {
            Token::Ident(name) => {
                let span = self.span();
                self.advance();
                Ok((name, span))
            }
            other => Err(self.error(&format!("expected {}, found '{}'", what, other))),
        }
    }

    /// Skips to just past the next `;`, or to a token that begins a new
    /// declaration or closes a block. Always makes progress.
    fn synchronize(&mut self, start: usize) {
        if self.pos == start {
            self.advance();
        }
        loop {
            match self.peek() {
                Token::Eof | Token::End | Token::RBrace | Token::Case => return,
                Token::Semicolon => {
                    self.advance();
                    return;
                }
                t if starts_decl(t) || t.starts_statement() => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    /// Parses a whole source file.
    pub fn parse_program(&mut self) -> Result<Program, Vec<ParserError>> {
        let mut decls = Vec::new();
        while !self.check(&Token::Eof) {
            let start = self.pos;
            if !starts_decl(self.peek()) {
                let err = self.error(&format!("expected a declaration, found '{}'", self.peek()));
                self.errors.push(err);
                self.synchronize(start);
                continue;
            }
            match self.parse_decl() {
                Ok(decl) => decls.push(decl),
                Err(err) => {
                    self.errors.push(err);
                    self.synchronize(start);
                }
            }
        }

        if self.errors.is_empty() {
            Ok(Program { decls })
        } else {
            Err(std::mem::take(&mut self.errors))
        }
    }

    fn parse_decl(&mut self) -> ParseResult<Decl> {
        let span = self.span();
        match self.peek() {
            Token::Const => {
                self.advance();
                let mut items = Vec::new();
                loop {
                    let (name, span) = self.expect_ident("constant name")?;
                    if !self.eat(&Token::Eq) {
                        self.expect(&Token::Assign)?;
                    }
                    let value = self.parse_expr()?;
                    items.push(ConstItem { name, value, span });
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.expect(&Token::Semicolon)?;
                Ok(Decl::Const(items))
            }
            Token::Var => {
                let items = self.parse_var_items()?;
                self.expect(&Token::Semicolon)?;
                Ok(Decl::Var(items))
            }
            Token::Type => {
                self.advance();
                let (name, _) = self.expect_ident("type name")?;
                if !self.eat(&Token::Colon) {
                    self.expect(&Token::Eq)?;
                }
                let ty = self.parse_type()?;
                self.expect(&Token::Semicolon)?;
                Ok(Decl::Type { name, ty, span })
            }
            Token::Function | Token::Procedure => {
                let sig = self.parse_signature()?;
                let mut decls = Vec::new();
                while starts_decl(self.peek()) {
                    let start = self.pos;
                    match self.parse_decl() {
                        Ok(decl) => decls.push(decl),
                        Err(err) => {
                            self.errors.push(err);
                            self.synchronize(start);
                        }
                    }
                }
                let body = self.parse_statement()?;
                self.eat(&Token::Semicolon);
                Ok(Decl::Function(FunctionDecl { sig, decls, body }))
            }
            Token::Declare => {
                self.advance();
                if !matches!(self.peek(), Token::Function | Token::Procedure) {
                    return Err(self.error("expected 'function' or 'procedure' after 'declare'"));
                }
                let sig = self.parse_signature()?;
                self.expect(&Token::Semicolon)?;
                Ok(Decl::Declare(sig))
            }
            Token::Include => {
                self.advance();
                let path = match self.peek().clone() {
                    Token::Str(path) => {
                        self.advance();
                        path
                    }
                    other => {
                        return Err(self.error(&format!("expected a file name, found '{}'", other)));
                    }
                };
                self.expect(&Token::Semicolon)?;
                Ok(Decl::Include { path, span })
            }
            Token::Pragma => {
                let pragma = self.parse_pragma()?;
                self.expect(&Token::Semicolon)?;
                Ok(Decl::Pragma(pragma))
            }
            other => Err(self.error(&format!("expected a declaration, found '{}'", other))),
        }
    }

    fn parse_pragma(&mut self) -> ParseResult<Pragma> {
        let span = self.span();
        self.expect(&Token::Pragma)?;
        let (name, _) = self.expect_ident("pragma name")?;
        let value = self.parse_expr()?;
        Ok(Pragma { name, value, span })
    }

    fn parse_var_items(&mut self) -> ParseResult<Vec<VarItem>> {
        self.expect(&Token::Var)?;
        let mut items = Vec::new();
        loop {
            let (name, span) = self.expect_ident("variable name")?;
            let ty = if self.eat(&Token::Colon) {
                Some(self.parse_type()?)
            } else {
                None
            };
            let init = if self.eat(&Token::Eq) || self.eat(&Token::Assign) {
                Some(self.parse_expr()?)
            } else {
                None
            };
            items.push(VarItem {
                name,
                ty,
                init,
                span,
            });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok(items)
    }

    fn parse_type(&mut self) -> ParseResult<TypeExpr> {
        let (name, span) = self.expect_ident("type name")?;
        let mut dims = Vec::new();
        while self.eat(&Token::LBracket) {
            if self.eat(&Token::RBracket) {
                dims.push(Dim::Reference);
            } else if self.eat(&Token::DotDot) {
                self.expect(&Token::RBracket)?;
                dims.push(Dim::Open);
            } else {
                let size = self.parse_expr()?;
                self.expect(&Token::RBracket)?;
                dims.push(Dim::Sized(size));
            }
        }
        Ok(TypeExpr { name, dims, span })
    }

    fn parse_signature(&mut self) -> ParseResult<FunctionSig> {
        let is_function = matches!(self.peek(), Token::Function);
        self.advance();
        let (name, span) = self.expect_ident("function name")?;
        let params = if self.check(&Token::LParen) {
            self.parse_params()?
        } else {
            Vec::new()
        };
        let ret = if self.eat(&Token::Colon) {
            Some(self.parse_type()?)
        } else {
            None
        };
        if !is_function && ret.is_some() {
            return Err(self.error("a procedure cannot declare a return type"));
        }
        Ok(FunctionSig {
            name,
            params,
            ret,
            is_function,
            span,
        })
    }

    fn parse_params(&mut self) -> ParseResult<Vec<Param>> {
        self.expect(&Token::LParen)?;
        let mut params = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(params);
        }
        loop {
            let byref = if self.eat(&Token::Ref) {
                true
            } else {
                self.eat(&Token::Val);
                false
            };
            let (name, span) = self.expect_ident("parameter name")?;
            let ty = if self.eat(&Token::Colon) {
                Some(self.parse_type()?)
            } else {
                None
            };
            let default = if self.eat(&Token::Eq) || self.eat(&Token::Assign) {
                Some(self.parse_expr()?)
            } else {
                None
            };
            params.push(Param {
                name,
                byref,
                ty,
                default,
                span,
            });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RParen)?;
        Ok(params)
    }

    // ========================================================================
    // Statements
    // ========================================================================

    /// Parses statements until `close`, recovering from errors inside.
    fn parse_block_body(&mut self, close: &Token) -> Vec<Stmt> {
        let mut stmts = Vec::new();
        loop {
            if self.check(close) || self.check(&Token::Eof) {
                break;
            }
            let start = self.pos;
            match self.parse_statement() {
                Ok(stmt) => {
                    let is_label = matches!(stmt.kind, StmtKind::Label(_));
                    stmts.push(stmt);
                    if !is_label
                        && !self.eat(&Token::Semicolon)
                        && !self.check(close)
                        && !self.check(&Token::Eof)
                    {
                        let err =
                            self.error(&format!("expected ';', found '{}'", self.peek()));
                        self.errors.push(err);
                        self.synchronize(start);
                    }
                }
                Err(err) => {
                    self.errors.push(err);
                    self.synchronize(start);
                    if self.check(&Token::Case) {
                        self.advance();
                    }
                }
            }
        }
        stmts
    }

    fn parse_statement(&mut self) -> ParseResult<Stmt> {
        let span = self.span();
        let kind = match self.peek().clone() {
            Token::Begin => {
                self.advance();
                let body = self.parse_block_body(&Token::End);
                self.expect(&Token::End)?;
                StmtKind::Block(body)
            }
            Token::LBrace => {
                self.advance();
                let body = self.parse_block_body(&Token::RBrace);
                self.expect(&Token::RBrace)?;
                StmtKind::Block(body)
            }
            Token::Semicolon => StmtKind::Empty,
            Token::Var => StmtKind::Var(self.parse_var_items()?),
            Token::Pragma => StmtKind::Pragma(self.parse_pragma()?),
            Token::If => {
                self.advance();
                let cond = self.parse_expr()?;
                self.eat(&Token::Then);
                let then_branch = Box::new(self.parse_statement()?);
                if self.check(&Token::Semicolon) && matches!(self.peek_next(), Token::Else) {
                    self.advance();
                }
                let else_branch = if self.eat(&Token::Else) {
                    Some(Box::new(self.parse_statement()?))
                } else {
                    None
                };
                StmtKind::If {
                    cond,
                    then_branch,
                    else_branch,
                }
            }
            Token::While => {
                self.advance();
                let cond = self.parse_expr()?;
                self.eat(&Token::Do);
                let body = Box::new(self.parse_statement()?);
                StmtKind::While { cond, body }
            }
            Token::Do => {
                self.advance();
                let body = Box::new(self.parse_statement()?);
                self.eat(&Token::Semicolon);
                self.expect(&Token::While)?;
                let cond = self.parse_expr()?;
                StmtKind::DoWhile { body, cond }
            }
            Token::Repeat => {
                self.advance();
                self.eat(&Token::Do);
                let body = Box::new(self.parse_statement()?);
                StmtKind::Repeat { body }
            }
            Token::For => {
                self.advance();
                let (var, _) = self.expect_ident("loop variable")?;
                if !self.eat(&Token::Assign) {
                    self.expect(&Token::Eq)?;
                }
                let start = self.parse_expr()?;
                self.expect(&Token::To)?;
                let end = self.parse_expr()?;
                let step = if self.eat(&Token::Step) {
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                self.eat(&Token::Do);
                let body = Box::new(self.parse_statement()?);
                StmtKind::For {
                    var,
                    start,
                    end,
                    step,
                    body,
                }
            }
            Token::Which => self.parse_which()?,
            Token::Exit | Token::Continue => {
                let is_exit = matches!(self.peek(), Token::Exit);
                self.advance();
                let target = match self.peek() {
                    Token::For => Some(JumpTarget::For),
                    Token::While => Some(JumpTarget::While),
                    Token::Do => Some(JumpTarget::Do),
                    Token::Repeat => Some(JumpTarget::Repeat),
                    Token::Which => Some(JumpTarget::Which),
                    Token::Function | Token::Procedure => Some(JumpTarget::Function),
                    _ => None,
                };
                if target.is_some() {
                    self.advance();
                }
                let count = match self.peek() {
                    Token::Integer(n) => {
                        let n = *n;
                        if n < 1 {
                            return Err(self.error_code(
                                ERR_BAD_JUMP_COUNT,
                                "jump count must be at least 1",
                            ));
                        }
                        self.advance();
                        n
                    }
                    _ => 1,
                };
                if is_exit {
                    StmtKind::Exit { target, count }
                } else {
                    StmtKind::Continue { target, count }
                }
            }
            Token::Return => {
                self.advance();
                if matches!(
                    self.peek(),
                    Token::Semicolon | Token::End | Token::RBrace | Token::Else | Token::Eof
                ) {
                    StmtKind::Return(None)
                } else {
                    StmtKind::Return(Some(self.parse_expr()?))
                }
            }
            Token::Goto => {
                self.advance();
                let (label, _) = self.expect_ident("label name")?;
                StmtKind::Goto(label)
            }
            Token::Call => {
                self.advance();
                let expr = self.parse_expr()?;
                if !matches!(expr.kind, ExprKind::Call { .. }) {
                    return Err(self.error("expected a function call after 'call'"));
                }
                StmtKind::Expr(expr)
            }
            Token::Ident(name) if matches!(self.peek_next(), Token::Colon) => {
                self.advance();
                self.advance();
                StmtKind::Label(name)
            }
            Token::PlusPlus | Token::MinusMinus => {
                let delta = if matches!(self.peek(), Token::PlusPlus) { 1 } else { -1 };
                self.advance();
                let target = self.parse_postfix()?;
                StmtKind::Step { target, delta }
            }
            _ => self.parse_simple_statement()?,
        };
        Ok(Stmt { kind, span })
    }

    /// Assignment, compound assignment, increment or a bare call.
    fn parse_simple_statement(&mut self) -> ParseResult<StmtKind> {
        let target = self.parse_expr()?;

        let op = match self.peek() {
            Token::Assign => None,
            Token::PlusAssign => Some(BinaryOp::Add),
            Token::MinusAssign => Some(BinaryOp::Sub),
            Token::StarAssign => Some(BinaryOp::Mul),
            Token::SlashAssign => Some(BinaryOp::Div),
            Token::ShlAssign => Some(BinaryOp::Shl),
            Token::ShrAssign => Some(BinaryOp::Shr),
            Token::CaretAssign => Some(BinaryOp::BitXor),
            Token::PipeAssign => Some(BinaryOp::BitOr),
            Token::AmpAssign => Some(BinaryOp::BitAnd),
            _ => {
                return match target.kind {
                    ExprKind::IncDec {
                        target,
                        delta,
                        prefix: false,
                    } => Ok(StmtKind::Step {
                        target: *target,
                        delta,
                    }),
                    ExprKind::Call { .. } => Ok(StmtKind::Expr(target)),
                    ExprKind::Binary {
                        op: BinaryOp::Eq, ..
                    } => Err(ParserError {
                        code: ERR_EQ_AS_ASSIGN,
                        message: "'=' compares values; use ':=' to assign".to_string(),
                        line: target.span.line,
                        col: target.span.col,
                    }),
                    _ => Err(self.error(&format!(
                        "expected an assignment or call, found '{}'",
                        self.peek()
                    ))),
                };
            }
        };
        self.advance();
        let value = self.parse_expr()?;
        Ok(StmtKind::Assign { target, op, value })
    }

    fn parse_which(&mut self) -> ParseResult<StmtKind> {
        self.expect(&Token::Which)?;
        let subject = self.parse_expr()?;
        let close = if self.eat(&Token::LBrace) {
            Token::RBrace
        } else {
            self.expect(&Token::Begin)?;
            Token::End
        };

        let mut cases = Vec::new();
        let mut default = None;
        while !self.check(&close) && !self.check(&Token::Eof) {
            let span = self.span();
            self.expect(&Token::Case)?;
            if self.eat(&Token::Else) {
                self.expect(&Token::Colon)?;
                if default.is_some() {
                    return Err(self.error("duplicate 'case else'"));
                }
                default = Some(self.parse_case_body(&close));
                continue;
            }
            let mut terms = Vec::new();
            let mut join = None;
            loop {
                let op = match self.peek() {
                    Token::Eq => Some(BinaryOp::Eq),
                    Token::NotEq => Some(BinaryOp::NotEq),
                    Token::Lt => Some(BinaryOp::Lt),
                    Token::LtEq => Some(BinaryOp::LtEq),
                    Token::Gt => Some(BinaryOp::Gt),
                    Token::GtEq => Some(BinaryOp::GtEq),
                    Token::StrEq => Some(BinaryOp::StrEq),
                    Token::StrNotEq => Some(BinaryOp::StrNotEq),
                    _ => None,
                };
                if op.is_some() {
                    self.advance();
                }
                let value = self.parse_shift()?;
                terms.push(CaseTerm {
                    join,
                    op: op.unwrap_or(BinaryOp::Eq),
                    value,
                });
                join = match self.peek() {
                    Token::AndAnd | Token::And => Some(LogicOp::And),
                    Token::OrOr | Token::Or | Token::Comma => Some(LogicOp::Or),
                    _ => break,
                };
                self.advance();
            }
            self.expect(&Token::Colon)?;
            let body = self.parse_case_body(&close);
            cases.push(WhichCase { terms, body, span });
        }
        self.expect(&close)?;

        Ok(StmtKind::Which {
            subject,
            cases,
            default,
        })
    }

    fn parse_case_body(&mut self, close: &Token) -> Vec<Stmt> {
        let mut stmts = Vec::new();
        while !self.check(&Token::Case) && !self.check(close) && !self.check(&Token::Eof) {
            let start = self.pos;
            match self.parse_statement() {
                Ok(stmt) => {
                    let is_label = matches!(stmt.kind, StmtKind::Label(_));
                    stmts.push(stmt);
                    if !is_label
                        && !self.eat(&Token::Semicolon)
                        && !self.check(&Token::Case)
                        && !self.check(close)
                    {
                        let err =
                            self.error(&format!("expected ';', found '{}'", self.peek()));
                        self.errors.push(err);
                        self.synchronize(start);
                    }
                }
                Err(err) => {
                    self.errors.push(err);
                    self.synchronize(start);
                }
            }
        }
        stmts
    }

    // ========================================================================
    // Expressions, loosest binding first
    // ========================================================================

    pub fn parse_expr(&mut self) -> ParseResult<Expr> {
        let cond = self.parse_logical()?;
        if self.check(&Token::Question) {
            let span = self.span();
            self.advance();
            let then_expr = self.parse_expr()?;
            self.expect(&Token::Colon)?;
            let else_expr = self.parse_expr()?;
            return Ok(Expr::new(
                ExprKind::Ternary {
                    cond: Box::new(cond),
                    then_expr: Box::new(then_expr),
                    else_expr: Box::new(else_expr),
                },
                span,
            ));
        }
        Ok(cond)
    }

    fn parse_logical(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_relational()?;
        loop {
            let op = match self.peek() {
                Token::AndAnd | Token::And => LogicOp::And,
                Token::OrOr | Token::Or => LogicOp::Or,
                _ => break,
            };
            let span = self.span();
            self.advance();
            let right = self.parse_relational()?;
            left = Expr::new(
                ExprKind::Logical {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
        }
        Ok(left)
    }

    fn binary_level(
        &mut self,
        next: fn(&mut Self) -> ParseResult<Expr>,
        ops: fn(&Token) -> Option<BinaryOp>,
    ) -> ParseResult<Expr> {
        let mut left = next(self)?;
        while let Some(op) = ops(self.peek()) {
            let span = self.span();
            self.advance();
            let right = next(self)?;
            left = Expr::new(
                ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
        }
        Ok(left)
    }

    fn parse_relational(&mut self) -> ParseResult<Expr> {
        self.binary_level(Self::parse_string_eq, |t| match t {
            Token::Eq => Some(BinaryOp::Eq),
            Token::NotEq => Some(BinaryOp::NotEq),
            Token::Lt => Some(BinaryOp::Lt),
            Token::LtEq => Some(BinaryOp::LtEq),
            Token::Gt => Some(BinaryOp::Gt),
            Token::GtEq => Some(BinaryOp::GtEq),
            _ => None,
        })
    }

    fn parse_string_eq(&mut self) -> ParseResult<Expr> {
        self.binary_level(Self::parse_shift, |t| match t {
            Token::StrEq => Some(BinaryOp::StrEq),
            Token::StrNotEq => Some(BinaryOp::StrNotEq),
            _ => None,
        })
    }

    fn parse_shift(&mut self) -> ParseResult<Expr> {
        self.binary_level(Self::parse_additive, |t| match t {
            Token::Shl => Some(BinaryOp::Shl),
            Token::Shr => Some(BinaryOp::Shr),
            _ => None,
        })
    }

    fn parse_additive(&mut self) -> ParseResult<Expr> {
        self.binary_level(Self::parse_multiplicative, |t| match t {
            Token::Plus => Some(BinaryOp::Add),
            Token::Minus => Some(BinaryOp::Sub),
            _ => None,
        })
    }

    fn parse_multiplicative(&mut self) -> ParseResult<Expr> {
        self.binary_level(Self::parse_bitwise, |t| match t {
            Token::Star => Some(BinaryOp::Mul),
            Token::Slash => Some(BinaryOp::Div),
            Token::Percent => Some(BinaryOp::Mod),
            _ => None,
        })
    }

    fn parse_bitwise(&mut self) -> ParseResult<Expr> {
        self.binary_level(Self::parse_unary, |t| match t {
            Token::Amp => Some(BinaryOp::BitAnd),
            Token::Pipe => Some(BinaryOp::BitOr),
            Token::Caret => Some(BinaryOp::BitXor),
            _ => None,
        })
    }

    fn parse_unary(&mut self) -> ParseResult<Expr> {
        let span = self.span();
        let op = match self.peek() {
            Token::Minus => UnaryOp::Neg,
            Token::Bang | Token::Not => UnaryOp::Not,
            Token::Tilde => UnaryOp::BitNot,
            Token::Abs => UnaryOp::Abs,
            Token::Odd => UnaryOp::Odd,
            Token::Plus => {
                self.advance();
                return self.parse_unary();
            }
            Token::PlusPlus | Token::MinusMinus => {
                let delta = if matches!(self.peek(), Token::PlusPlus) { 1 } else { -1 };
                self.advance();
                let target = self.parse_postfix()?;
                return Ok(Expr::new(
                    ExprKind::IncDec {
                        target: Box::new(target),
                        delta,
                        prefix: true,
                    },
                    span,
                ));
            }
            _ => return self.parse_postfix(),
        };
        self.advance();
        let operand = self.parse_unary()?;
        Ok(Expr::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            span,
        ))
    }

    fn parse_postfix(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            let span = self.span();
            match self.peek() {
                Token::LParen => {
                    let args = self.parse_args()?;
                    expr = Expr::new(
                        ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                        },
                        span,
                    );
                }
                Token::LBracket => {
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(&Token::RBracket)?;
                    expr = Expr::new(
                        ExprKind::Index {
                            base: Box::new(expr),
                            index: Box::new(index),
                        },
                        span,
                    );
                }
                Token::PlusPlus | Token::MinusMinus => {
                    let delta = if matches!(self.peek(), Token::PlusPlus) { 1 } else { -1 };
                    self.advance();
                    return Ok(Expr::new(
                        ExprKind::IncDec {
                            target: Box::new(expr),
                            delta,
                            prefix: false,
                        },
                        span,
                    ));
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_args(&mut self) -> ParseResult<Vec<Arg>> {
        self.expect(&Token::LParen)?;
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            let byref = self.eat(&Token::Amp) || self.eat(&Token::Ref);
            let value = self.parse_expr()?;
            args.push(Arg { byref, value });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RParen)?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> ParseResult<Expr> {
        let span = self.span();
        let kind = match self.peek().clone() {
            Token::Integer(n) => ExprKind::Integer(n),
            Token::Float(n) => ExprKind::Float(n),
            Token::Str(s) => ExprKind::Str(s),
            Token::BigNumber(s) => ExprKind::BigNumber(s),
            Token::Char(c) => ExprKind::Char(c),
            Token::True => ExprKind::Bool(true),
            Token::False => ExprKind::Bool(false),
            Token::Null => ExprKind::Null,
            Token::Ident(name) => ExprKind::Ident(name),
            Token::LParen => {
                self.advance();
                let mut inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                inner.span = span;
                return Ok(inner);
            }
            Token::LBrace => {
                self.advance();
                let mut items = Vec::new();
                if !self.check(&Token::RBrace) {
                    loop {
                        items.push(self.parse_expr()?);
                        if !self.eat(&Token::Comma) || self.check(&Token::RBrace) {
                            break;
                        }
                    }
                }
                self.expect(&Token::RBrace)?;
                return Ok(Expr::new(ExprKind::ArrayLit(items), span));
            }
            Token::Lambda => {
                self.advance();
                let params = if self.check(&Token::LParen) {
                    self.parse_params()?
                } else {
                    Vec::new()
                };
                let ret = if self.eat(&Token::Colon) {
                    Some(self.parse_type()?)
                } else {
                    None
                };
                self.expect(&Token::FatArrow)?;
                let body = self.parse_expr()?;
                return Ok(Expr::new(
                    ExprKind::Lambda {
                        params,
                        ret,
                        body: Box::new(body),
                    },
                    span,
                ));
            }
            other => {
                return Err(self.error(&format!("expected an expression, found '{}'", other)));
            }
        };
        self.advance();
        Ok(Expr::new(kind, span))
    }
}

fn starts_decl(token: &Token) -> bool {
    matches!(
        token,
        Token::Const
            | Token::Var
            | Token::Type
            | Token::Function
            | Token::Procedure
            | Token::Declare
            | Token::Include
            | Token::Pragma
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;

    fn parse(source: &str) -> Program {
        let mut lexer = Lexer::new(source);
        let tokens = lexer.tokenize().unwrap();
        let mut parser = Parser::new(tokens);
        parser.parse_program().unwrap()
    }

    fn parse_errs(source: &str) -> Vec<ParserError> {
        let mut lexer = Lexer::new(source);
        let tokens = lexer.tokenize().unwrap();
        let mut parser = Parser::new(tokens);
        parser.parse_program().unwrap_err()
    }

    fn parse_expr(source: &str) -> Expr {
        let mut lexer = Lexer::new(source);
        let tokens = lexer.tokenize().unwrap();
        let mut parser = Parser::new(tokens);
        parser.parse_expr().unwrap()
    }

    fn main_body(program: &Program) -> Vec<Stmt> {
        for decl in &program.decls {
            if let Decl::Function(f) = decl {
                if f.sig.name == "main" {
                    if let StmtKind::Block(stmts) = &f.body.kind {
                        return stmts.clone();
                    }
                }
            }
        }
        panic!("no main with a block body");
    }

    #[test]
    fn test_function_with_locals() {
        let program = parse(
            "function main(): integer\n var x: integer = 3;\nbegin\n return x\nend;",
        );
        assert_eq!(program.decls.len(), 1);
        match &program.decls[0] {
            Decl::Function(f) => {
                assert_eq!(f.sig.name, "main");
                assert!(f.sig.is_function);
                assert_eq!(f.decls.len(), 1);
                assert!(matches!(f.body.kind, StmtKind::Block(_)));
            }
            other => panic!("unexpected decl {:?}", other),
        }
    }

    #[test]
    fn test_params_byref_and_default() {
        let program = parse("procedure p(ref a: integer, b: string = \"x\") begin end;");
        let Decl::Function(f) = &program.decls[0] else {
            panic!("expected function")
        };
        assert!(!f.sig.is_function);
        assert!(f.sig.params[0].byref);
        assert!(!f.sig.params[1].byref);
        assert!(f.sig.params[1].default.is_some());
    }

    #[test]
    fn test_array_types() {
        let program = parse("var a: integer[10], b: string[], c: float[..];");
        let Decl::Var(items) = &program.decls[0] else {
            panic!("expected var")
        };
        let dims: Vec<usize> = items
            .iter()
            .map(|i| i.ty.as_ref().unwrap().dims.len())
            .collect();
        assert_eq!(dims, vec![1, 1, 1]);
        assert!(matches!(items[1].ty.as_ref().unwrap().dims[0], Dim::Reference));
        assert!(matches!(items[2].ty.as_ref().unwrap().dims[0], Dim::Open));
    }

    #[test]
    fn test_precedence_bitwise_binds_tighter_than_multiplicative() {
        let expr = parse_expr("a * b & c");
        let ExprKind::Binary { op, right, .. } = expr.kind else {
            panic!("expected binary")
        };
        assert_eq!(op, BinaryOp::Mul);
        assert!(matches!(
            right.kind,
            ExprKind::Binary {
                op: BinaryOp::BitAnd,
                ..
            }
        ));
    }

    #[test]
    fn test_precedence_logical_loosest_before_ternary() {
        let expr = parse_expr("a < 1 && b = 2 ? 10 : 20");
        let ExprKind::Ternary { cond, .. } = expr.kind else {
            panic!("expected ternary")
        };
        assert!(matches!(
            cond.kind,
            ExprKind::Logical {
                op: LogicOp::And,
                ..
            }
        ));
    }

    #[test]
    fn test_string_equality_binds_tighter_than_relational() {
        let expr = parse_expr("a $= b = c");
        let ExprKind::Binary { op, left, .. } = expr.kind else {
            panic!("expected binary")
        };
        assert_eq!(op, BinaryOp::Eq);
        assert!(matches!(
            left.kind,
            ExprKind::Binary {
                op: BinaryOp::StrEq,
                ..
            }
        ));
    }

    #[test]
    fn test_aggregate_call_chain() {
        let expr = parse_expr("f(1)(2)[3]");
        let ExprKind::Index { base, .. } = expr.kind else {
            panic!("expected index")
        };
        let ExprKind::Call { callee, .. } = base.kind else {
            panic!("expected call")
        };
        assert!(matches!(callee.kind, ExprKind::Call { .. }));
    }

    #[test]
    fn test_lambda_literal() {
        let expr = parse_expr("lambda(x: integer): integer => x * 2");
        let ExprKind::Lambda { params, ret, .. } = expr.kind else {
            panic!("expected lambda")
        };
        assert_eq!(params.len(), 1);
        assert!(ret.is_some());
    }

    #[test]
    fn test_statements() {
        let program = parse(
            "function main(): integer begin
                var i: integer;
                for i := 1 to 10 step 2 do sum += i;
                while i > 0 do i--;
                do i++ while i < 3;
                repeat exit;
                if i then x := 1; else x := 2;
                again: goto again;
                exit while 2;
                return 0
            end;",
        );
        let body = main_body(&program);
        assert!(matches!(body[0].kind, StmtKind::Var(_)));
        assert!(matches!(body[1].kind, StmtKind::For { .. }));
        assert!(matches!(body[2].kind, StmtKind::While { .. }));
        assert!(matches!(body[3].kind, StmtKind::DoWhile { .. }));
        assert!(matches!(body[4].kind, StmtKind::Repeat { .. }));
        assert!(matches!(
            body[5].kind,
            StmtKind::If {
                else_branch: Some(_),
                ..
            }
        ));
        assert!(matches!(body[6].kind, StmtKind::Label(_)));
        assert!(matches!(body[7].kind, StmtKind::Goto(_)));
        assert!(matches!(
            body[8].kind,
            StmtKind::Exit {
                target: Some(JumpTarget::While),
                count: 2
            }
        ));
        assert!(matches!(body[9].kind, StmtKind::Return(Some(_))));
    }

    #[test]
    fn test_which_cases() {
        let program = parse(
            "function main(): integer begin
                which x begin
                    case 1 || 2: y := 1;
                    case >= 10 && < 20: y := 2; z := 3;
                    case else: y := 0
                end
            end;",
        );
        let body = main_body(&program);
        let StmtKind::Which { cases, default, .. } = &body[0].kind else {
            panic!("expected which")
        };
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].terms.len(), 2);
        assert_eq!(cases[0].terms[1].join, Some(LogicOp::Or));
        assert_eq!(cases[1].terms[0].op, BinaryOp::GtEq);
        assert_eq!(cases[1].terms[1].join, Some(LogicOp::And));
        assert_eq!(cases[1].body.len(), 2);
        assert_eq!(default.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_equals_used_as_assignment() {
        let errs = parse_errs("function main(): integer begin x = 1 end;");
        assert_eq!(errs[0].code, ERR_EQ_AS_ASSIGN);
    }

    #[test]
    fn test_exit_count_must_be_positive() {
        let errs = parse_errs("function main(): integer begin exit 0 end;");
        assert_eq!(errs[0].code, ERR_BAD_JUMP_COUNT);
    }

    #[test]
    fn test_recovery_reports_multiple_errors() {
        let errs = parse_errs(
            "function main(): integer begin\n x := ;\n y := 1;\n z := ) ;\nend;",
        );
        assert_eq!(errs.len(), 2);
        assert_eq!(errs[0].line, 2);
        assert_eq!(errs[1].line, 4);
    }

    #[test]
    fn test_missing_end_points_at_eof() {
        let errs = parse_errs("function main(): integer begin x := 1;");
        assert_eq!(errs.len(), 1);
        assert!(errs[0].message.contains("expected 'end'"));
        assert_eq!(errs[0].line, 1);
    }

    #[test]
    fn test_top_level_garbage() {
        let errs = parse_errs("x := 1; var y;");
        assert_eq!(errs.len(), 1);
        assert!(errs[0].message.contains("expected a declaration"));
    }
}
