//! Statement code generation. Statements leave the stack as they found it;
//! a failed statement is reported and compilation moves on to the next.

use super::decls::sized_array;
use super::expr::inline_operator;
use super::symbols::{Address, Symbol, SymbolKind};
use super::{CompilationSession, CompileResult, fail};
use crate::ast::{
    BinaryOp, Expr, ExprKind, JumpTarget, LogicOp, Stmt, StmtKind, VarItem, WhichCase,
};
use crate::bytecode::compile_error::CompileErrorKind;
use crate::bytecode::op::{
    Construct, FloatOp, InlineOp, Instruction, IntOp, JumpClass, Opcode,
};
use crate::bytecode::optimize;
use crate::lang::Type;
use crate::lexer::Span;

/// Where a `which` keeps its subject while the cases compare against it.
enum Subject {
    /// On the stack for the whole statement.
    Stack,
    /// In a hidden local, so jumps out of the statement need no cleanup.
    Slot(i64),
}

impl CompilationSession {
    pub(super) fn stmt(&mut self, stmt: &Stmt) {
        self.span = stmt.span;
        if let Err(e) = self.stmt_kind(stmt) {
            self.report_located(e);
        }
    }

    fn stmt_kind(&mut self, stmt: &Stmt) -> CompileResult<()> {
        let span = stmt.span;
        match &stmt.kind {
            StmtKind::Block(stmts) => {
                self.block(stmts);
                Ok(())
            }
            StmtKind::Var(items) => {
                for item in items {
                    self.local_var(item)?;
                }
                Ok(())
            }
            StmtKind::Assign { target, op, value } => self.assign(target, *op, value, span),
            StmtKind::Step { target, delta } => self.step(target, *delta, span),
            StmtKind::Expr(e) => {
                let ty = self.expr(e)?;
                self.discard(&ty, span)
            }
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            } => self.if_stmt(cond, then_branch, else_branch.as_deref()),
            StmtKind::While { cond, body } => self.while_stmt(cond, body),
            StmtKind::DoWhile { body, cond } => self.do_while_stmt(body, cond),
            StmtKind::Repeat { body } => {
                let top = self.here();
                self.stmt(body);
                self.emit(Instruction::op(Opcode::Jmp, top as i64));
                let exit = self.here();
                self.close_construct(top, Construct::Repeat, exit, Some(top), 0);
                Ok(())
            }
            StmtKind::For {
                var,
                start,
                end,
                step,
                body,
            } => self.for_stmt(var, start, end, step.as_ref(), body, span),
            StmtKind::Which {
                subject,
                cases,
                default,
            } => self.which_stmt(subject, cases, default.as_deref(), span),
            StmtKind::Exit { target, count } => {
                let class = match target {
                    None => JumpClass::ExitAny,
                    Some(JumpTarget::Function) => JumpClass::Return,
                    Some(t) => JumpClass::Exit(construct_of(*t)),
                };
                self.emit_jump(class, *count as u32, span);
                Ok(())
            }
            StmtKind::Continue { target, count } => {
                let class = match target {
                    None => JumpClass::ContinueAny,
                    Some(JumpTarget::Function) => {
                        return fail(
                            CompileErrorKind::OrphanedJump("'continue function'".to_string()),
                            span,
                        );
                    }
                    Some(t) => JumpClass::Continue(construct_of(*t)),
                };
                self.emit_jump(class, *count as u32, span);
                Ok(())
            }
            StmtKind::Return(value) => self.return_stmt(value.as_ref(), span),
            StmtKind::Goto(name) => {
                let id = self.label_id(name, span);
                self.emit_jump(JumpClass::Goto(id), 1, span);
                Ok(())
            }
            StmtKind::Label(name) => self.define_label(name, span),
            StmtKind::Pragma(p) => self.pragma(p),
            StmtKind::Empty => Ok(()),
        }
    }

    /// A nested block. Its array variables keep their slots, and are
    /// released, until the function ends.
    fn block(&mut self, stmts: &[Stmt]) {
        let mark = self.symbols.enter_block();
        for s in stmts {
            self.stmt(s);
        }
        let dropped = self.symbols.leave_block(mark);
        if let Some(ctx) = self.ctx_mut() {
            ctx.retired
                .extend(dropped.into_iter().filter(Symbol::owns_handle));
        }
    }

    /// `var` inside a body. The initializer may be any expression; without
    /// a type the variable takes the initializer's.
    fn local_var(&mut self, item: &VarItem) -> CompileResult<()> {
        let span = item.span;
        let declared = item.ty.as_ref().map(|t| self.resolve_type(t)).transpose()?;
        let init = match &item.init {
            Some(e) => {
                let from = self.expr(e)?;
                let ty = match (&declared, &from) {
                    (Some(t), _) => t.clone(),
                    (None, Type::Null | Type::Unknown) => Type::INTEGER,
                    (None, t) => t.clone(),
                };
                self.cast(&from, &ty, e.span)?;
                Some(ty)
            }
            None => None,
        };
        let ty = init.clone().or(declared).unwrap_or(Type::INTEGER);
        if ty == Type::Void {
            return fail(CompileErrorKind::VoidVariable(item.name.clone()), span);
        }

        let slot = self.allocate_slot();
        let level = self.level();
        let mut symbol = Symbol::new(&item.name, SymbolKind::Variable, ty.clone(), level, Address::Slot(slot));
        let managed = ty.is_managed();

        if init.is_some() {
            if managed {
                // the slot may still hold the value of an earlier pass
                self.emit(Instruction::op(Opcode::Lod, slot));
                self.release(span)?;
                symbol.refed = 1;
            }
        } else if let Some((size, holds)) = sized_array(&ty) {
            self.emit(Instruction::op(Opcode::Lit, size));
            self.emit(Instruction::new(Opcode::Mal, holds as i64, 0));
            self.emit(Instruction::op(Opcode::Lod, slot));
            self.release(span)?;
            symbol.refed = 1;
        } else if managed {
            self.emit(Instruction::op(Opcode::Lod, slot));
            self.release(span)?;
            self.emit(Instruction::op(Opcode::Lit, 0));
        } else {
            self.emit(Instruction::op(Opcode::Lit, 0));
        }
        self.emit(Instruction::op(Opcode::Sto, slot));
        self.declare(symbol, span)?;
        Ok(())
    }

    // ========================================================================
    // Assignment
    // ========================================================================

    pub(super) fn assign(
        &mut self,
        target: &Expr,
        op: Option<BinaryOp>,
        value: &Expr,
        span: Span,
    ) -> CompileResult<()> {
        match &target.kind {
            ExprKind::Ident(name) => {
                let (id, symbol) = self.assignable(name, target.span)?;
                match op {
                    None => {
                        self.expr_as(value, &symbol.ty)?;
                        if symbol.ty.is_managed() {
                            self.load_variable(&symbol);
                            self.release(span)?;
                        }
                        self.store_variable(&symbol);
                        self.symbols.get_mut(id).refed += 1;
                        Ok(())
                    }
                    Some(op) => match inline_operator(op) {
                        Some(inline) if symbol.ty.is_integer() => {
                            self.expr_as(value, &Type::INTEGER)?;
                            let level = self.level() - symbol.level;
                            self.emit(Instruction::new(
                                Opcode::inline_for(inline, symbol.byref),
                                level,
                                symbol.slot().unwrap_or(0),
                            ));
                            Ok(())
                        }
                        Some(inline)
                            if symbol.ty.is_float()
                                && matches!(op, BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div) =>
                        {
                            self.expr_as(value, &Type::Float)?;
                            self.float_inline(inline, &symbol);
                            Ok(())
                        }
                        _ => self.assign(target, None, &combine(op, target, value, span), span),
                    },
                }
            }
            ExprKind::Index { base, index } => match op {
                Some(op) => self.assign(target, None, &combine(op, target, value, span), span),
                None => self.store_element(base, index, value, span),
            },
            _ => fail(CompileErrorKind::NotAssignable("expression".to_string()), target.span),
        }
    }

    fn store_element(&mut self, base: &Expr, index: &Expr, value: &Expr, span: Span) -> CompileResult<()> {
        if let Some((symbol, element)) = self.array_variable(base)? {
            self.expr_as(value, &element)?;
            self.expr_as(index, &Type::INTEGER)?;
            if self.options.bounds_check {
                self.emit(Instruction::op(Opcode::Sld, 0));
                self.load_variable(&symbol);
                self.emit(Instruction::op(Opcode::Sws, 0));
                self.call_routine("__array_check", span)?;
            }
            self.element_offset();
            let level = self.level() - symbol.level;
            let slot = symbol.slot().unwrap_or(0);
            if element.is_managed() {
                let load = if symbol.byref { Opcode::Mli } else { Opcode::Mlo };
                self.emit(Instruction::new(load, level, slot));
                self.release(span)?;
            }
            let store = if symbol.byref { Opcode::Msi } else { Opcode::Mst };
            self.emit(Instruction::new(store, level, slot));
            return Ok(());
        }

        let base_ty = self.expr(base)?;
        let element = self.element_type(&base_ty, base)?;
        self.expr_as(value, &element)?;
        self.expr_as(index, &Type::INTEGER)?;
        if self.options.bounds_check {
            self.emit(Instruction::op(Opcode::Sld, 0));
            self.emit(Instruction::op(Opcode::Sld, 3));
            self.emit(Instruction::op(Opcode::Sws, 0));
            self.call_routine("__array_check", span)?;
        }
        self.element_offset();
        if element.is_managed() {
            self.emit(Instruction::op(Opcode::Mls, 1));
            self.release(span)?;
        }
        self.emit(Instruction::op(Opcode::Mss, 0));
        if base_ty.is_managed() {
            self.release(span)
        } else {
            self.emit(Instruction::op(Opcode::Dec, 1));
            Ok(())
        }
    }

    /// `x++` / `x--` as a statement.
    fn step(&mut self, target: &Expr, delta: i64, span: Span) -> CompileResult<()> {
        if let Some(name) = target.as_ident() {
            let (_, symbol) = self.assignable(name, target.span)?;
            if symbol.ty.is_integer() || symbol.ty.is_float() {
                self.step_variable(&symbol, delta);
                return Ok(());
            }
        }
        let amount = Expr::new(ExprKind::Integer(delta), span);
        self.assign(target, Some(BinaryOp::Add), &amount, span)
    }

    // ========================================================================
    // Control flow
    // ========================================================================

    /// Condition followed by its `JPC`, warning when the outcome is fixed.
    fn branch_on(&mut self, cond: &Expr) -> CompileResult<usize> {
        self.condition(cond)?;
        if let Some(v) = optimize::constant_condition(&self.code, self.barrier) {
            self.report(CompileErrorKind::ConstantCondition(v != 0), cond.span);
        }
        Ok(self.emit_fixed(Instruction::op(Opcode::Jpc, 0)))
    }

    fn if_stmt(&mut self, cond: &Expr, then_branch: &Stmt, else_branch: Option<&Stmt>) -> CompileResult<()> {
        let to_else = self.branch_on(cond)?;
        self.stmt(then_branch);
        match else_branch {
            Some(else_branch) => {
                let to_end = self.emit_fixed(Instruction::op(Opcode::Jmp, 0));
                let at = self.here();
                self.patch(to_else, at);
                self.stmt(else_branch);
                let end = self.here();
                self.patch(to_end, end);
            }
            None => {
                let end = self.here();
                self.patch(to_else, end);
            }
        }
        Ok(())
    }

    fn while_stmt(&mut self, cond: &Expr, body: &Stmt) -> CompileResult<()> {
        let top = self.here();
        let to_exit = self.branch_on(cond)?;
        self.stmt(body);
        self.emit(Instruction::op(Opcode::Jmp, top as i64));
        let exit = self.here();
        self.patch(to_exit, exit);
        self.close_construct(top, Construct::While, exit, Some(top), 0);
        Ok(())
    }

    fn do_while_stmt(&mut self, body: &Stmt, cond: &Expr) -> CompileResult<()> {
        let top = self.here();
        self.stmt(body);
        let cont = self.here();
        let to_exit = self.branch_on(cond)?;
        self.emit(Instruction::op(Opcode::Jmp, top as i64));
        let exit = self.here();
        self.patch(to_exit, exit);
        self.close_construct(top, Construct::Do, exit, Some(cont), 0);
        Ok(())
    }

    /// Counting loop over an integer or float counter. Four words stay on
    /// the stack while it runs: the end value, the step, the direction flag
    /// and the flag for a start equal to the end, which makes the first
    /// test inclusive either way.
    fn for_stmt(
        &mut self,
        var: &str,
        start: &Expr,
        end: &Expr,
        step: Option<&Expr>,
        body: &Stmt,
        span: Span,
    ) -> CompileResult<()> {
        let (id, symbol) = self.assignable(var, span)?;
        let float = match &symbol.ty {
            Type::Float => true,
            Type::Integer(_) => false,
            other => {
                return fail(
                    CompileErrorKind::InvalidCast {
                        from: other.to_string(),
                        to: Type::INTEGER.to_string(),
                    },
                    span,
                );
            }
        };
        self.symbols.get_mut(id).refed += 1;
        let begin = self.code.len();
        let counter = if float { Type::Float } else { Type::INTEGER };
        let sld = |n: i64| Instruction::op(Opcode::Sld, n);
        let compare = |int: IntOp, real: FloatOp| {
            if float {
                Instruction::fop(real)
            } else {
                Instruction::opr(int)
            }
        };

        self.expr_as(start, &counter)?;
        self.store_variable(&symbol);
        self.expr_as(end, &counter)?;
        match step {
            Some(step) => self.expr_as(step, &counter)?,
            None => {
                // +1 counting up, -1 counting down
                self.load_variable(&symbol);
                self.emit(sld(1));
                self.emit(compare(IntOp::Leq, FloatOp::Leq));
                self.emit(Instruction::op(Opcode::Lit, 2));
                self.emit(Instruction::opr(IntOp::Mul));
                self.emit(Instruction::op(Opcode::Lit, 1));
                self.emit(Instruction::opr(IntOp::Sub));
                if float {
                    self.emit(Instruction::fop(FloatOp::Flo));
                }
            }
        }
        self.load_variable(&symbol);
        self.emit(sld(2));
        self.emit(compare(IntOp::Leq, FloatOp::Leq));
        self.load_variable(&symbol);
        self.emit(sld(3));
        self.emit(compare(IntOp::Eql, FloatOp::Eql));

        let top = self.here();
        self.emit(sld(1));
        let to_desc = self.emit_fixed(Instruction::op(Opcode::Jpc, 0));
        self.load_variable(&symbol);
        self.emit(sld(4));
        self.emit(compare(IntOp::Leq, FloatOp::Leq));
        let to_cmp = self.emit_fixed(Instruction::op(Opcode::Jmp, 0));
        let desc = self.here();
        self.patch(to_desc, desc);
        self.load_variable(&symbol);
        self.emit(sld(4));
        self.emit(compare(IntOp::Grq, FloatOp::Grq));
        let cmp = self.here();
        self.patch(to_cmp, cmp);
        let to_exit = self.emit_fixed(Instruction::op(Opcode::Jpc, 0));

        self.stmt(body);

        let cont = self.here();
        self.emit(sld(0));
        let to_step = self.emit_fixed(Instruction::op(Opcode::Jpc, 0));
        let to_done = self.emit_fixed(Instruction::op(Opcode::Jmp, 0));
        let at = self.here();
        self.patch(to_step, at);
        self.emit(sld(2));
        if float {
            self.float_inline(InlineOp::Add, &symbol);
        } else {
            let level = self.level() - symbol.level;
            self.emit(Instruction::new(
                Opcode::inline_for(InlineOp::Add, symbol.byref),
                level,
                symbol.slot().unwrap_or(0),
            ));
        }
        self.emit(Instruction::op(Opcode::Jmp, top as i64));

        let exit = self.here();
        self.patch(to_exit, exit);
        self.patch(to_done, exit);
        self.emit(Instruction::op(Opcode::Dec, 4));
        self.close_construct(begin, Construct::For, exit, Some(cont), 4);
        Ok(())
    }

    fn which_stmt(
        &mut self,
        subject: &Expr,
        cases: &[WhichCase],
        default: Option<&[Stmt]>,
        span: Span,
    ) -> CompileResult<()> {
        let begin = self.code.len();
        let ty = match self.expr(subject)? {
            Type::Void => {
                return fail(CompileErrorKind::NoValue("a procedure call".to_string()), subject.span);
            }
            t @ (Type::Null | Type::Unknown) => {
                self.cast(&t, &Type::INTEGER, subject.span)?;
                Type::INTEGER
            }
            t => t,
        };

        let holder = if ty.is_managed() {
            let slot = self.allocate_slot();
            self.emit(Instruction::op(Opcode::Lod, slot));
            self.release(span)?;
            self.emit(Instruction::op(Opcode::Sto, slot));
            let level = self.level();
            let mut hidden = Symbol::new("which", SymbolKind::Variable, ty.clone(), level, Address::Slot(slot));
            hidden.refed = 1;
            if let Some(ctx) = self.ctx_mut() {
                ctx.retired.push(hidden);
            }
            Subject::Slot(slot)
        } else {
            Subject::Stack
        };
        let words = match holder {
            Subject::Stack => 1,
            Subject::Slot(_) => 0,
        };

        let mut to_end = Vec::new();
        for case in cases {
            for term in &case.terms {
                let op = match (ty.is_string(), term.op) {
                    (true, BinaryOp::Eq) => BinaryOp::StrEq,
                    (true, BinaryOp::NotEq) => BinaryOp::StrNotEq,
                    (_, op) => op,
                };
                let skip = match term.join {
                    None => None,
                    Some(LogicOp::And) => {
                        self.emit(Instruction::op(Opcode::Sld, 0));
                        Some(self.emit_fixed(Instruction::op(Opcode::Jpc, 0)))
                    }
                    Some(LogicOp::Or) => {
                        self.emit(Instruction::op(Opcode::Sld, 0));
                        self.emit(Instruction::op(Opcode::Lit, 0));
                        self.emit(Instruction::opr(IntOp::Eql));
                        Some(self.emit_fixed(Instruction::op(Opcode::Jpc, 0)))
                    }
                };
                let depth = if term.join.is_some() { 1 } else { 0 };
                self.load_subject(&holder, depth, span)?;
                let value = self.expr(&term.value)?;
                self.binary_on_stack(op, ty.clone(), value, term.value.span)?;
                if let Some(skip) = skip {
                    let join = match term.join {
                        Some(LogicOp::Or) => IntOp::Bor,
                        _ => IntOp::And,
                    };
                    self.emit(Instruction::opr(join));
                    let at = self.here();
                    self.patch(skip, at);
                }
            }
            let next = self.emit_fixed(Instruction::op(Opcode::Jpc, 0));
            self.block(&case.body);
            to_end.push(self.emit_fixed(Instruction::op(Opcode::Jmp, 0)));
            let at = self.here();
            self.patch(next, at);
        }
        if let Some(default) = default {
            self.block(default);
        }

        let end = self.here();
        for jump in to_end {
            self.patch(jump, end);
        }
        self.close_construct(begin, Construct::Which, end, None, words);
        if words > 0 {
            self.emit(Instruction::op(Opcode::Dec, words));
        }
        Ok(())
    }

    /// Pushes the `which` subject. `depth` is how many words sit above it.
    fn load_subject(&mut self, holder: &Subject, depth: i64, span: Span) -> CompileResult<()> {
        match holder {
            Subject::Stack => {
                self.emit(Instruction::op(Opcode::Sld, depth));
                Ok(())
            }
            Subject::Slot(slot) => {
                self.emit(Instruction::op(Opcode::Lod, *slot));
                self.emit(Instruction::op(Opcode::Sld, 0));
                self.addref(span)
            }
        }
    }

    fn return_stmt(&mut self, value: Option<&Expr>, span: Span) -> CompileResult<()> {
        let Some(ctx) = self.ctx() else {
            return Ok(());
        };
        let desc = ctx.desc.clone();
        let name = ctx.name.clone();
        match (value, desc.returns_value()) {
            (Some(e), true) => {
                self.expr_as(e, &desc.ret)?;
                if desc.ret.is_managed() {
                    self.emit(Instruction::new(Opcode::Lod, 0, -1));
                    self.release(span)?;
                }
                self.emit(Instruction::new(Opcode::Srv, 0, 1));
            }
            (Some(e), false) => return fail(CompileErrorKind::ReturnInProcedure(name), e.span),
            (None, true) => return fail(CompileErrorKind::ReturnNeedsValue(name), span),
            (None, false) => {}
        }
        self.emit_jump(JumpClass::Return, 1, span);
        Ok(())
    }
}

/// `target op value`, for compound assignments that have no in-place form.
fn combine(op: BinaryOp, target: &Expr, value: &Expr, span: Span) -> Expr {
    Expr::new(
        ExprKind::Binary {
            op,
            left: Box::new(target.clone()),
            right: Box::new(value.clone()),
        },
        span,
    )
}

fn construct_of(target: JumpTarget) -> Construct {
    match target {
        JumpTarget::For => Construct::For,
        JumpTarget::While => Construct::While,
        JumpTarget::Do => Construct::Do,
        JumpTarget::Repeat => Construct::Repeat,
        JumpTarget::Which | JumpTarget::Function => Construct::Which,
    }
}
