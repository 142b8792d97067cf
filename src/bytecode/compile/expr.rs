//! Expression code generation. Every expression leaves exactly one word on
//! the stack, except calls to procedures, which leave none. Array-valued
//! results are always owned references.

use std::rc::Rc;

use super::symbols::{Address, Symbol, SymbolKind};
use super::{CompilationSession, CompileResult, fail};
use crate::ast::{Arg, BinaryOp, Expr, ExprKind, LogicOp, Param, TypeExpr, UnaryOp};
use crate::bytecode::compile_error::CompileErrorKind;
use crate::bytecode::op::{
    ARRAY_HEADER_SIZE, AX, CX, DX, FLAG_FLOAT, FloatOp, InlineOp, Instruction, IntOp, Opcode,
    SymbolId, float_word,
};
use crate::lang::{ConstValue, FunctionDesc, IntFlags, Type, kinds_match};
use crate::lexer::Span;
use crate::runtime::natives::Native;

/// Where the function value of a call comes from.
enum Callee {
    Direct(SymbolId),
    Native(Native),
    Variable { level: i64, slot: i64, byref: bool },
    /// Already pushed, below the arguments.
    Stack,
}

impl CompilationSession {
    pub(super) fn expr(&mut self, expr: &Expr) -> CompileResult<Type> {
        let span = expr.span;
        match &expr.kind {
            ExprKind::Integer(v) => self.emit_const(&ConstValue::Int(*v, IntFlags::PLAIN), span),
            ExprKind::Float(v) => self.emit_const(&ConstValue::Float(*v), span),
            ExprKind::Str(s) => self.emit_const(&ConstValue::Str(s.clone()), span),
            ExprKind::BigNumber(s) => self.emit_const(&ConstValue::BigNumber(s.clone()), span),
            ExprKind::Char(c) => self.emit_const(&ConstValue::Int(*c, IntFlags::CHARACTER), span),
            ExprKind::Bool(b) => {
                self.emit_const(&ConstValue::Int(*b as i64, IntFlags::BOOLEAN), span)
            }
            ExprKind::Null => self.emit_const(&ConstValue::Null, span),
            ExprKind::Ident(name) => self.ident(name, span),
            ExprKind::Unary { op, operand } => self.unary(*op, operand, span),
            ExprKind::IncDec {
                target,
                delta,
                prefix,
            } => self.inc_dec(target, *delta, *prefix, span),
            ExprKind::Binary { op, left, right } => {
                let lt = self.expr(left)?;
                let rt = self.expr(right)?;
                self.binary_on_stack(*op, lt, rt, span)
            }
            ExprKind::Logical { op, left, right } => self.logical(*op, left, right),
            ExprKind::Ternary {
                cond,
                then_expr,
                else_expr,
            } => self.ternary(cond, then_expr, else_expr),
            ExprKind::Call { callee, args } => self.call(callee, args, span),
            ExprKind::Index { base, index } => self.index_load(base, index, span),
            ExprKind::ArrayLit(items) => self.array_literal(items),
            ExprKind::Lambda { params, ret, body } => self.lambda(params, ret.as_ref(), body, span),
        }
    }

    /// Replaces types an operator cannot work with.
    fn settle(&mut self, ty: Type, span: Span) -> CompileResult<Type> {
        match ty {
            Type::Unknown => {
                self.report(CompileErrorKind::UnknownKind, span);
                Ok(Type::INTEGER)
            }
            Type::Void => fail(CompileErrorKind::NoValue("a procedure call".to_string()), span),
            other => Ok(other),
        }
    }

    // ========================================================================
    // Names
    // ========================================================================

    fn ident(&mut self, name: &str, span: Span) -> CompileResult<Type> {
        let id = self.lookup(name, span)?;
        let symbol = self.symbols.get(id).clone();
        match &symbol.kind {
            SymbolKind::Variable => {
                self.load_variable(&symbol);
                if symbol.ty.is_managed() {
                    self.emit(Instruction::op(Opcode::Sld, 0));
                    self.addref(span)?;
                }
                Ok(symbol.ty)
            }
            SymbolKind::Constant(value) => self.emit_const(value, span),
            SymbolKind::Function => self.function_value(id, span),
            SymbolKind::TypeAlias => fail(CompileErrorKind::NotAValue(name.to_string()), span),
        }
    }

    /// Pushes the raw word of a variable, without touching reference counts.
    pub(super) fn load_variable(&mut self, symbol: &Symbol) {
        let op = if symbol.byref { Opcode::Lid } else { Opcode::Lod };
        let level = self.level() - symbol.level;
        self.emit(Instruction::new(op, level, symbol.slot().unwrap_or(0)));
    }

    pub(super) fn store_variable(&mut self, symbol: &Symbol) {
        let op = if symbol.byref { Opcode::Sid } else { Opcode::Sto };
        let level = self.level() - symbol.level;
        self.emit(Instruction::new(op, level, symbol.slot().unwrap_or(0)));
    }

    /// The variable behind an assignable name.
    pub(super) fn assignable(&self, name: &str, span: Span) -> CompileResult<(SymbolId, Symbol)> {
        let id = self.lookup(name, span)?;
        let symbol = self.symbols.get(id).clone();
        match symbol.kind {
            SymbolKind::Variable => Ok((id, symbol)),
            SymbolKind::Constant(_) => {
                fail(CompileErrorKind::AssignToConstant(name.to_string()), span)
            }
            _ => fail(CompileErrorKind::NotAssignable(name.to_string()), span),
        }
    }

    // ========================================================================
    // Operators
    // ========================================================================

    fn unary(&mut self, op: UnaryOp, operand: &Expr, span: Span) -> CompileResult<Type> {
        let ty = self.expr(operand)?;
        let ty = match self.settle(ty, span)? {
            Type::Null => Type::INTEGER,
            other => other,
        };
        match (op, &ty) {
            (UnaryOp::Neg, Type::Integer(_)) => {
                self.emit(Instruction::opr(IntOp::Neg));
                Ok(Type::INTEGER)
            }
            (UnaryOp::Neg, Type::Float) => {
                self.emit(Instruction::fop(FloatOp::Neg));
                Ok(Type::Float)
            }
            (UnaryOp::Neg, t) if t.is_big_number() => {
                self.emit(Instruction::op(Opcode::Lit, 0));
                self.call_routine("i2s", span)?;
                self.emit(Instruction::op(Opcode::Sws, 0));
                self.call_routine("big_number_sub", span)?;
                Ok(Type::big_number())
            }
            (UnaryOp::Not, Type::Float) => {
                self.emit(Instruction::op(Opcode::Lit, 0));
                self.emit(Instruction::fop(FloatOp::Eql));
                Ok(Type::BOOLEAN)
            }
            (UnaryOp::Not, t) => {
                self.to_condition(t, span)?;
                self.emit(Instruction::op(Opcode::Lit, 0));
                self.emit(Instruction::opr(IntOp::Eql));
                Ok(Type::BOOLEAN)
            }
            (UnaryOp::Abs, Type::Integer(_)) => {
                self.emit_abs(IntOp::Les, Instruction::opr(IntOp::Neg), false);
                Ok(Type::INTEGER)
            }
            (UnaryOp::Abs, Type::Float) => {
                self.emit_abs(IntOp::Les, Instruction::fop(FloatOp::Neg), true);
                Ok(Type::Float)
            }
            (UnaryOp::BitNot | UnaryOp::Odd, Type::Integer(_) | Type::Float) => {
                if ty.is_float() {
                    self.emit(Instruction::fop(FloatOp::Int));
                }
                if op == UnaryOp::BitNot {
                    self.emit(Instruction::opr(IntOp::Not));
                    Ok(Type::INTEGER)
                } else {
                    self.emit(Instruction::opr(IntOp::Odd));
                    Ok(Type::BOOLEAN)
                }
            }
            (_, other) => fail(
                CompileErrorKind::InvalidCast {
                    from: other.to_string(),
                    to: Type::INTEGER.to_string(),
                },
                span,
            ),
        }
    }

    /// `SLD 0; LIT 0; LES; JPC skip; NEG; skip:`
    fn emit_abs(&mut self, less: IntOp, negate: Instruction, float: bool) {
        self.emit(Instruction::op(Opcode::Sld, 0));
        self.emit(Instruction::op(Opcode::Lit, 0));
        if float {
            self.emit(Instruction::fop(FloatOp::Les));
        } else {
            self.emit(Instruction::opr(less));
        }
        let skip = self.emit_fixed(Instruction::op(Opcode::Jpc, 0));
        self.emit(negate);
        let at = self.here();
        self.patch(skip, at);
    }

    /// Combines the two values on top of the stack.
    pub(super) fn binary_on_stack(
        &mut self,
        op: BinaryOp,
        lt: Type,
        rt: Type,
        span: Span,
    ) -> CompileResult<Type> {
        let lt = self.settle(lt, span)?;
        let rt = self.settle(rt, span)?;

        if matches!(op, BinaryOp::StrEq | BinaryOp::StrNotEq) {
            self.unify_operands(&lt, &rt, &Type::string(), span)?;
            self.call_routine("integer_array_compare", span)?;
            self.emit(Instruction::op(Opcode::Lit, 0));
            let rel = if op == BinaryOp::StrEq { IntOp::Eql } else { IntOp::Neq };
            self.emit(Instruction::opr(rel));
            return Ok(Type::BOOLEAN);
        }

        let ordering = matches!(
            op,
            BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq
        );
        if ordering && (lt.is_string() || rt.is_string()) {
            // lexicographic through the comparison routine's sign
            self.unify_operands(&lt, &rt, &Type::string(), span)?;
            self.call_routine("integer_array_compare", span)?;
            self.emit(Instruction::op(Opcode::Lit, 0));
            self.emit(Instruction::opr(int_operator(op)));
            return Ok(Type::BOOLEAN);
        }

        if op == BinaryOp::Add && (lt.is_string() || rt.is_string()) {
            self.unify_operands(&lt, &rt, &Type::string(), span)?;
            self.call_routine("integer_array_append", span)?;
            return Ok(Type::string());
        }

        if lt.is_big_number() || rt.is_big_number() {
            let big = Type::big_number();
            self.unify_operands(&lt, &rt, &big, span)?;
            let routine = match op {
                BinaryOp::Add => "big_number_add",
                BinaryOp::Sub => "big_number_sub",
                BinaryOp::Mul => "big_number_mul",
                BinaryOp::Div => "big_number_div",
                BinaryOp::Mod => "big_number_mod",
                op if op.is_comparison() => {
                    self.call_routine("big_number_compare", span)?;
                    self.emit(Instruction::op(Opcode::Lit, 0));
                    self.emit(Instruction::opr(int_operator(op)));
                    return Ok(Type::BOOLEAN);
                }
                _ => {
                    return fail(
                        CompileErrorKind::InvalidCast {
                            from: big.to_string(),
                            to: Type::INTEGER.to_string(),
                        },
                        span,
                    );
                }
            };
            self.call_routine(routine, span)?;
            return Ok(big);
        }

        if lt.is_array() || rt.is_array() {
            return self.array_operator(op, &lt, &rt, span);
        }

        if matches!(lt, Type::Function(_)) || matches!(rt, Type::Function(_)) {
            let comparable = |t: &Type| matches!(t, Type::Function(_) | Type::Null);
            if matches!(op, BinaryOp::Eq | BinaryOp::NotEq) && comparable(&lt) && comparable(&rt) {
                self.emit(Instruction::opr(int_operator(op)));
                return Ok(Type::BOOLEAN);
            }
            return fail(CompileErrorKind::FunctionCast(Type::INTEGER.to_string()), span);
        }

        let bitwise = matches!(
            op,
            BinaryOp::Shl | BinaryOp::Shr | BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor
        );
        if !bitwise && (lt.is_float() || rt.is_float()) {
            if !lt.is_float() {
                self.emit(Instruction::op(Opcode::Sws, 0));
                self.emit(Instruction::fop(FloatOp::Flo));
                self.emit(Instruction::op(Opcode::Sws, 0));
            }
            if !rt.is_float() {
                self.emit(Instruction::fop(FloatOp::Flo));
            }
            let fop = match op {
                BinaryOp::Add => FloatOp::Add,
                BinaryOp::Sub => FloatOp::Sub,
                BinaryOp::Mul => FloatOp::Mul,
                BinaryOp::Div => FloatOp::Div,
                BinaryOp::Eq => FloatOp::Eql,
                BinaryOp::NotEq => FloatOp::Neq,
                BinaryOp::Lt => FloatOp::Les,
                BinaryOp::LtEq => FloatOp::Leq,
                BinaryOp::Gt => FloatOp::Gre,
                BinaryOp::GtEq => FloatOp::Grq,
                _ => return fail(CompileErrorKind::FloatModulo, span),
            };
            self.emit(Instruction::fop(fop));
            return Ok(if op.is_comparison() { Type::BOOLEAN } else { Type::Float });
        }

        if lt.is_float() {
            self.emit(Instruction::op(Opcode::Sws, 0));
            self.emit(Instruction::fop(FloatOp::Int));
            self.emit(Instruction::op(Opcode::Sws, 0));
        }
        if rt.is_float() {
            self.emit(Instruction::fop(FloatOp::Int));
        }
        self.emit(Instruction::opr(int_operator(op)));
        Ok(if op.is_comparison() { Type::BOOLEAN } else { Type::INTEGER })
    }

    /// Operators with at least one non-text array operand.
    fn array_operator(&mut self, op: BinaryOp, lt: &Type, rt: &Type, span: Span) -> CompileResult<Type> {
        let reference = |t: &Type| t.is_array() || *t == Type::Null;
        match op {
            BinaryOp::Eq | BinaryOp::NotEq if reference(lt) && reference(rt) => {
                // identity comparison, then drop both operands
                self.emit(Instruction::op(Opcode::Sld, 1));
                self.emit(Instruction::op(Opcode::Sld, 1));
                self.emit(Instruction::opr(int_operator(op)));
                self.emit(Instruction::op(Opcode::Sws, 0));
                self.release(span)?;
                self.emit(Instruction::op(Opcode::Sws, 0));
                self.release(span)?;
                Ok(Type::BOOLEAN)
            }
            BinaryOp::Add if lt.is_array() && rt.is_array() => {
                if !kinds_match(lt, rt) {
                    return fail(
                        CompileErrorKind::InvalidCast {
                            from: rt.to_string(),
                            to: lt.to_string(),
                        },
                        span,
                    );
                }
                self.call_routine("integer_array_append", span)?;
                let element = lt.element().cloned().unwrap_or(Type::INTEGER);
                Ok(Type::array_of(element, -1))
            }
            BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq
                if lt.is_array() && rt.is_array() =>
            {
                fail(CompileErrorKind::ArrayOrdering(op.symbol().to_string()), span)
            }
            _ => {
                let array = if lt.is_array() { lt } else { rt };
                fail(
                    CompileErrorKind::InvalidCast {
                        from: array.to_string(),
                        to: Type::INTEGER.to_string(),
                    },
                    span,
                )
            }
        }
    }

    /// Converts both operands on top of the stack to `target`.
    fn unify_operands(&mut self, lt: &Type, rt: &Type, target: &Type, span: Span) -> CompileResult<()> {
        if !kinds_match(lt, target) && *lt != Type::Null {
            self.emit(Instruction::op(Opcode::Sws, 0));
            self.cast(lt, target, span)?;
            self.emit(Instruction::op(Opcode::Sws, 0));
        }
        self.cast(rt, target, span)
    }

    /// Short-circuit `&&` / `||`. Both sides are normalized to 0 or 1.
    fn logical(&mut self, op: LogicOp, left: &Expr, right: &Expr) -> CompileResult<Type> {
        self.condition(left)?;
        self.boolate();
        self.emit(Instruction::op(Opcode::Sld, 0));
        if op == LogicOp::Or {
            self.emit(Instruction::op(Opcode::Lit, 0));
            self.emit(Instruction::opr(IntOp::Eql));
        }
        let done = self.emit_fixed(Instruction::op(Opcode::Jpc, 0));
        self.emit(Instruction::op(Opcode::Dec, 1));
        self.condition(right)?;
        self.boolate();
        let end = self.here();
        self.patch(done, end);
        Ok(Type::BOOLEAN)
    }

    fn ternary(&mut self, cond: &Expr, then_expr: &Expr, else_expr: &Expr) -> CompileResult<Type> {
        self.condition(cond)?;
        let to_else = self.emit_fixed(Instruction::op(Opcode::Jpc, 0));
        let then_ty = self.expr(then_expr)?;
        let to_end = self.emit_fixed(Instruction::op(Opcode::Jmp, 0));
        let at = self.here();
        self.patch(to_else, at);
        let else_ty = self.expr(else_expr)?;
        let ty = if then_ty == Type::Null { else_ty.clone() } else { then_ty };
        self.cast(&else_ty, &ty, else_expr.span)?;
        let end = self.here();
        self.patch(to_end, end);
        Ok(ty)
    }

    /// `++`/`--` used for its value.
    fn inc_dec(&mut self, target: &Expr, delta: i64, prefix: bool, span: Span) -> CompileResult<Type> {
        if let Some(name) = target.as_ident() {
            let (_, symbol) = self.assignable(name, target.span)?;
            if symbol.ty.is_integer() || symbol.ty.is_float() {
                if !prefix {
                    self.load_variable(&symbol);
                }
                self.step_variable(&symbol, delta);
                if prefix {
                    self.load_variable(&symbol);
                }
                return Ok(symbol.ty);
            }
        }
        // elements go through a full read and write
        let one = Expr::new(ExprKind::Integer(delta), span);
        let sum = Expr::new(
            ExprKind::Binary {
                op: BinaryOp::Add,
                left: Box::new(target.clone()),
                right: Box::new(one),
            },
            span,
        );
        if prefix {
            self.assign(target, None, &sum, span)?;
            self.expr(target)
        } else {
            let ty = self.expr(target)?;
            self.assign(target, None, &sum, span)?;
            Ok(ty)
        }
    }

    /// Adds `delta` to a numeric variable in place.
    pub(super) fn step_variable(&mut self, symbol: &Symbol, delta: i64) {
        if symbol.ty.is_float() {
            self.emit(Instruction::op(Opcode::Lit, float_word(delta as f64)));
            self.float_inline(InlineOp::Add, symbol);
        } else {
            self.emit(Instruction::op(Opcode::Lit, delta));
            let op = Opcode::inline_for(InlineOp::Add, symbol.byref);
            let level = self.level() - symbol.level;
            self.emit(Instruction::new(op, level, symbol.slot().unwrap_or(0)));
        }
    }

    /// Inline operation in float mode. `DX` is saved in `AX` around it.
    pub(super) fn float_inline(&mut self, op: InlineOp, symbol: &Symbol) {
        let level = self.level() - symbol.level;
        self.emit(Instruction::op(Opcode::Pus, DX));
        self.emit(Instruction::op(Opcode::Pop, AX));
        self.emit(Instruction::new(Opcode::Rio, FLAG_FLOAT, DX));
        self.emit(Instruction::new(
            Opcode::inline_for(op, symbol.byref),
            level,
            symbol.slot().unwrap_or(0),
        ));
        self.emit(Instruction::new(Opcode::Mov, AX, DX));
    }

    // ========================================================================
    // Calls
    // ========================================================================

    pub(super) fn call(&mut self, callee: &Expr, args: &[Arg], span: Span) -> CompileResult<Type> {
        let (target, desc, name) = match &callee.kind {
            ExprKind::Ident(name) => self.named_callee(name, callee.span)?,
            _ => {
                let ty = self.expr(callee)?;
                match ty {
                    Type::Function(desc) => (Callee::Stack, desc, "function value".to_string()),
                    other => return fail(CompileErrorKind::NotCallable(other.to_string()), span),
                }
            }
        };

        self.push_arguments(&desc, args, &name, span)?;
        match target {
            Callee::Native(native) => {
                self.emit(Instruction::op(Opcode::Sys, native.code()));
            }
            Callee::Direct(id) => {
                self.store_arguments(&desc, 3);
                self.emit_direct_call(id, &desc);
            }
            Callee::Variable { level, slot, byref } => {
                self.store_arguments(&desc, 3);
                if desc.returns_value() {
                    self.emit(Instruction::op(Opcode::Lit, 0));
                }
                let op = if byref { Opcode::Cii } else { Opcode::Cai };
                self.emit_fixed(Instruction::new(op, level, slot));
            }
            Callee::Stack => {
                self.store_arguments(&desc, 2);
                self.emit_fixed(Instruction::new(Opcode::Cas, 0, desc.result_words()));
            }
        }
        Ok(desc.ret.clone())
    }

    fn named_callee(
        &mut self,
        name: &str,
        span: Span,
    ) -> CompileResult<(Callee, Rc<FunctionDesc>, String)> {
        let id = self.lookup(name, span)?;
        let symbol = self.symbols.get(id).clone();
        match (&symbol.kind, &symbol.ty) {
            (SymbolKind::Function, Type::Function(desc)) => {
                let target = match symbol.address {
                    Address::Native(native) => Callee::Native(native),
                    _ => Callee::Direct(id),
                };
                Ok((target, desc.clone(), name.to_string()))
            }
            (SymbolKind::Variable, Type::Function(desc)) => Ok((
                Callee::Variable {
                    level: self.level() - symbol.level,
                    slot: symbol.slot().unwrap_or(0),
                    byref: symbol.byref,
                },
                desc.clone(),
                name.to_string(),
            )),
            (SymbolKind::Constant(ConstValue::Function(target)), _) => {
                let target = target.clone();
                self.named_callee(&target, span)
            }
            _ => fail(CompileErrorKind::NotCallable(name.to_string()), span),
        }
    }

    /// Pushes the arguments of a call in parameter order, filling missing
    /// trailing ones from their defaults.
    fn push_arguments(
        &mut self,
        desc: &FunctionDesc,
        args: &[Arg],
        name: &str,
        span: Span,
    ) -> CompileResult<()> {
        if args.len() > desc.params.len() {
            return fail(
                CompileErrorKind::ArgumentCount {
                    name: name.to_string(),
                    expected: desc.params.len(),
                    found: args.len(),
                },
                span,
            );
        }
        for (i, param) in desc.params.iter().enumerate() {
            match args.get(i) {
                Some(arg) if param.byref => self.reference_argument(arg, &param.name, &param.ty)?,
                Some(arg) if param.ty.is_handle() => self.handle_argument(arg)?,
                Some(arg) => self.expr_as(&arg.value, &param.ty)?,
                None => match &param.default {
                    Some(value) => {
                        let ty = self.emit_const(value, span)?;
                        self.cast(&ty, &param.ty, span)?;
                    }
                    None => {
                        return fail(
                            CompileErrorKind::MissingArgument {
                                name: name.to_string(),
                                param: param.name.clone(),
                            },
                            span,
                        );
                    }
                },
            }
        }
        Ok(())
    }

    /// Address of a variable for a `ref` parameter. A reference parameter
    /// passes its own address along.
    fn reference_argument(&mut self, arg: &Arg, param: &str, ty: &Type) -> CompileResult<()> {
        let span = arg.value.span;
        let not_variable = || CompileErrorKind::ByRefNotVariable(param.to_string());
        let Some(name) = arg.value.as_ident() else {
            return fail(not_variable(), span);
        };
        let id = self.lookup(name, span)?;
        let symbol = self.symbols.get(id).clone();
        if !symbol.is_variable() {
            return fail(not_variable(), span);
        }
        if !kinds_match(&symbol.ty, ty) && *ty != Type::Unknown {
            return fail(
                CompileErrorKind::InvalidCast {
                    from: symbol.ty.to_string(),
                    to: ty.to_string(),
                },
                span,
            );
        }
        let level = self.level() - symbol.level;
        let slot = symbol.slot().unwrap_or(0);
        let op = if symbol.byref { Opcode::Lod } else { Opcode::Lda };
        self.emit(Instruction::new(op, level, slot));
        self.symbols.get_mut(id).refed += 1;
        Ok(())
    }

    /// A handle argument is the raw word of a variable; nothing is counted.
    fn handle_argument(&mut self, arg: &Arg) -> CompileResult<()> {
        let span = arg.value.span;
        let symbol = match arg.value.as_ident().and_then(|n| self.symbols.lookup(n)) {
            Some(id) => self.symbols.get(id).clone(),
            None => return fail(CompileErrorKind::HandleTemporary, span),
        };
        if !symbol.is_variable() || !(symbol.ty.is_array() || symbol.ty.is_integer()) {
            return fail(CompileErrorKind::HandleTemporary, span);
        }
        self.load_variable(&symbol);
        Ok(())
    }

    // ========================================================================
    // Arrays
    // ========================================================================

    /// The variable behind `name[..]` when the base can be addressed
    /// directly, with the element type. Handles index as integer arrays.
    pub(super) fn array_variable(&mut self, base: &Expr) -> CompileResult<Option<(Symbol, Type)>> {
        let Some(name) = base.as_ident() else {
            return Ok(None);
        };
        let id = self.lookup(name, base.span)?;
        let symbol = self.symbols.get(id).clone();
        if !symbol.is_variable() {
            return Ok(None);
        }
        let element = match &symbol.ty {
            t if t.is_handle() => Type::INTEGER,
            Type::Array(a) => a.contains.clone(),
            _ => return fail(CompileErrorKind::NotAnArray(name.to_string()), base.span),
        };
        Ok(Some((symbol, element)))
    }

    /// Turns the index on top of the stack into the `CX` offset.
    pub(super) fn element_offset(&mut self) {
        self.emit(Instruction::op(Opcode::Lit, ARRAY_HEADER_SIZE));
        self.emit(Instruction::opr(IntOp::Add));
        self.emit(Instruction::op(Opcode::Pop, CX));
    }

    pub(super) fn element_type(&self, base: &Type, base_expr: &Expr) -> CompileResult<Type> {
        match base {
            Type::Array(a) => Ok(a.contains.clone()),
            t if t.is_handle() => Ok(Type::INTEGER),
            other => fail(
                CompileErrorKind::NotAnArray(
                    base_expr
                        .as_ident()
                        .map(str::to_string)
                        .unwrap_or_else(|| other.to_string()),
                ),
                base_expr.span,
            ),
        }
    }

    fn index_load(&mut self, base: &Expr, index: &Expr, span: Span) -> CompileResult<Type> {
        if let Some((symbol, element)) = self.array_variable(base)? {
            self.expr_as(index, &Type::INTEGER)?;
            if self.options.bounds_check {
                self.emit(Instruction::op(Opcode::Sld, 0));
                self.load_variable(&symbol);
                self.emit(Instruction::op(Opcode::Sws, 0));
                self.call_routine("__array_check", span)?;
            }
            self.element_offset();
            let op = if symbol.byref { Opcode::Mli } else { Opcode::Mlo };
            let level = self.level() - symbol.level;
            self.emit(Instruction::new(op, level, symbol.slot().unwrap_or(0)));
            if element.is_managed() {
                self.emit(Instruction::op(Opcode::Sld, 0));
                self.addref(span)?;
            }
            return Ok(element);
        }

        let base_ty = self.expr(base)?;
        let element = self.element_type(&base_ty, base)?;
        self.expr_as(index, &Type::INTEGER)?;
        if self.options.bounds_check {
            self.emit(Instruction::op(Opcode::Sld, 0));
            self.emit(Instruction::op(Opcode::Sld, 2));
            self.emit(Instruction::op(Opcode::Sws, 0));
            self.call_routine("__array_check", span)?;
        }
        self.element_offset();
        self.emit(Instruction::op(Opcode::Mls, 0));
        if element.is_managed() {
            self.emit(Instruction::op(Opcode::Sld, 0));
            self.addref(span)?;
        }
        if base_ty.is_managed() {
            self.emit(Instruction::op(Opcode::Sws, 0));
            self.release(span)?;
        } else {
            // a handle base is borrowed
            self.emit(Instruction::op(Opcode::Sws, 0));
            self.emit(Instruction::op(Opcode::Dec, 1));
        }
        Ok(element)
    }

    fn array_literal(&mut self, items: &[Expr]) -> CompileResult<Type> {
        self.emit(Instruction::op(Opcode::Lit, items.len() as i64));
        let alloc = self.emit_fixed(Instruction::new(Opcode::Mal, 0, 0));
        let mut element: Option<Type> = None;
        for (i, item) in items.iter().enumerate() {
            let ty = self.expr(item)?;
            match &element {
                Some(e) => {
                    let e = e.clone();
                    self.cast(&ty, &e, item.span)?;
                }
                None => {
                    let first = match ty {
                        Type::Null | Type::Unknown => Type::INTEGER,
                        Type::Void => {
                            return fail(
                                CompileErrorKind::NoValue("a procedure call".to_string()),
                                item.span,
                            );
                        }
                        t => t,
                    };
                    element = Some(first);
                }
            }
            self.store_element_register(i as i64);
        }
        let element = element.unwrap_or(Type::INTEGER);
        if element.is_managed() {
            if let Some(ins) = self.code.get_mut(alloc) {
                ins.level = 1;
            }
        }
        Ok(Type::array_of(element, -1))
    }

    // ========================================================================
    // Lambdas
    // ========================================================================

    /// An anonymous function compiled in place and pushed as a value.
    /// Parameters without a type are integers; the result type is the
    /// annotation or else the body's type.
    fn lambda(
        &mut self,
        params: &[Param],
        ret: Option<&TypeExpr>,
        body: &Expr,
        span: Span,
    ) -> CompileResult<Type> {
        let param_descs = self.param_descs(params)?;
        let annotated = ret.map(|t| self.resolve_type(t)).transpose()?;

        let over = self.emit_fixed(Instruction::op(Opcode::Jmp, 0));
        let entry = self.here();
        let provisional = Rc::new(FunctionDesc {
            params: param_descs.clone(),
            ret: annotated.clone().unwrap_or(Type::Unknown),
        });
        self.begin_function("lambda", provisional, params, entry);

        let ret = match self.lambda_body(body, annotated) {
            Ok(ret) => ret,
            Err(e) => {
                self.report_located(e);
                Type::Void
            }
        };
        let desc = Rc::new(FunctionDesc {
            params: param_descs,
            ret,
        });
        if let Some(ctx) = self.ctx_mut() {
            ctx.desc = desc.clone();
        }
        self.end_function(span);

        let after = self.here();
        self.patch(over, after);
        self.emit(Instruction::new(Opcode::Lfp, 0, entry as i64));
        Ok(Type::Function(desc))
    }

    fn lambda_body(&mut self, body: &Expr, annotated: Option<Type>) -> CompileResult<Type> {
        let ty = self.expr(body)?;
        let ret = match annotated {
            Some(t) => t,
            None => match &ty {
                Type::Null | Type::Unknown => Type::INTEGER,
                t => t.clone(),
            },
        };
        if ret == Type::Void {
            self.discard(&ty, body.span)?;
        } else {
            self.cast(&ty, &ret, body.span)?;
            self.emit(Instruction::new(Opcode::Srv, 0, 1));
        }
        Ok(ret)
    }
}

/// Integer operator for a binary operator. Text equality maps to plain
/// equality on the comparison result.
pub(super) fn int_operator(op: BinaryOp) -> IntOp {
    match op {
        BinaryOp::Add => IntOp::Add,
        BinaryOp::Sub => IntOp::Sub,
        BinaryOp::Mul => IntOp::Mul,
        BinaryOp::Div => IntOp::Div,
        BinaryOp::Mod => IntOp::Mod,
        BinaryOp::Shl => IntOp::Shl,
        BinaryOp::Shr => IntOp::Shr,
        BinaryOp::BitAnd => IntOp::And,
        BinaryOp::BitOr => IntOp::Bor,
        BinaryOp::BitXor => IntOp::Xor,
        BinaryOp::Eq | BinaryOp::StrEq => IntOp::Eql,
        BinaryOp::NotEq | BinaryOp::StrNotEq => IntOp::Neq,
        BinaryOp::Lt => IntOp::Les,
        BinaryOp::LtEq => IntOp::Leq,
        BinaryOp::Gt => IntOp::Gre,
        BinaryOp::GtEq => IntOp::Grq,
    }
}

/// Read-modify-write instruction family for a compound assignment.
pub(super) fn inline_operator(op: BinaryOp) -> Option<InlineOp> {
    match op {
        BinaryOp::Add => Some(InlineOp::Add),
        BinaryOp::Sub => Some(InlineOp::Sub),
        BinaryOp::Mul => Some(InlineOp::Mul),
        BinaryOp::Div => Some(InlineOp::Div),
        BinaryOp::Shl => Some(InlineOp::Shl),
        BinaryOp::Shr => Some(InlineOp::Shr),
        BinaryOp::BitXor => Some(InlineOp::Xor),
        BinaryOp::BitOr => Some(InlineOp::Or),
        BinaryOp::BitAnd => Some(InlineOp::And),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use crate::bytecode::compile::{CompileOptions, compile_source};
    use crate::runtime::runtime_error::RuntimeErrorKind;
    use crate::runtime::vm_bc::{Machine, MachineConfig};

    fn run_with(source: &str, options: &CompileOptions) -> (i64, String) {
        let out = match compile_source(source, "expr.ppp", options) {
            Ok(out) => out,
            Err(failure) => panic!("{}", failure.render()),
        };
        let mut machine = Machine::new(MachineConfig::default());
        let mut stdout = Vec::new();
        let summary = machine
            .run(&out.module.code, &mut stdout, &mut std::io::empty())
            .unwrap();
        assert!(summary.leaks.is_empty(), "leaks: {:?}", summary.leaks);
        (summary.exit_code, String::from_utf8(stdout).unwrap())
    }

    fn assert_result(body: &str, expected: i64) {
        let source = format!("function main(): integer {}", body);
        let (code, _) = run_with(&source, &CompileOptions::default());
        assert_eq!(code, expected, "optimized");
        let plain = CompileOptions {
            optimize: false,
            ..CompileOptions::default()
        };
        let (code, _) = run_with(&source, &plain);
        assert_eq!(code, expected, "unoptimized");
    }

    fn assert_error(source: &str, code: u32) {
        let failure = compile_source(source, "expr.ppp", &CompileOptions::default()).unwrap_err();
        assert!(failure.codes().contains(&code), "{:?}", failure.codes());
    }

    #[test]
    fn test_arithmetic_precedence() {
        assert_result("begin return 2 + 3 * 4 - 10 / 2 end;", 9);
        assert_result("begin return 17 % 5 + (1 << 4) end;", 18);
        assert_result("begin return -(3 - 10) end;", 7);
    }

    #[test]
    fn test_unary_operators() {
        assert_result("var x: integer = -5; begin return abs x + abs 3 end;", 8);
        assert_result("var x: integer = 6; begin return (odd x ? 1 : 0) + (odd 7 ? 10 : 0) end;", 10);
        assert_result("var x: integer = 0; begin return !x + ~0 end;", 0);
    }

    #[test]
    fn test_float_promotion() {
        assert_result("var f: float = 1.5; begin return f * 2 + 1 end;", 4);
        assert_result("var f: float = -2.5; begin return abs f * 2 end;", 5);
        assert_result("var i: integer = 3; begin return (i / 2.0 > 1.4) ? 1 : 0 end;", 1);
    }

    #[test]
    fn test_short_circuit() {
        assert_result(
            "var calls: integer;
             function hit(): boolean begin calls++; return true end;
             begin
                if 0 && hit() then calls := 100;
                if 1 || hit() then calls += 10;
                if 1 && hit() then calls += 1;
                return calls
             end;",
            12,
        );
    }

    #[test]
    fn test_increment_expressions() {
        assert_result(
            "var i: integer = 5; var a: integer;
             begin
                a := i++;
                a := a * 10 + ++i;
                return a
             end;",
            57,
        );
        assert_result(
            "var a: integer[3];
             begin
                a[1] := 4;
                return a[1]++ * 10 + a[1]
             end;",
            45,
        );
    }

    #[test]
    fn test_string_operators() {
        assert_result(
            "var s: string = \"abc\";
             begin
                return (s $= \"abc\" ? 1 : 0) + (s $!= \"abd\" ? 2 : 0) + (s = s ? 4 : 0)
             end;",
            7,
        );
    }

    #[test]
    fn test_string_ordering() {
        assert_result(
            "var s: string = \"abc\";
             begin
                return (s < \"abd\" ? 1 : 0) + (s <= \"abc\" ? 2 : 0) + (\"b\" > s ? 4 : 0)
                    + (s >= \"abcd\" ? 8 : 0) + (\"ab\" < s ? 16 : 0)
             end;",
            23,
        );
        assert_error(
            "function main(): integer var a: integer[2]; var b: integer[2]; begin return a < b end;",
            13001,
        );
    }

    #[test]
    fn test_big_numbers() {
        let (_, out) = run_with(
            "function main(): integer
                var b: bignumber = 99999999999999999999#;
             begin
                b := b * 3 + 1;
                println(b);
                return b > 1# ? 1 : 0
             end;",
            &CompileOptions::default(),
        );
        assert_eq!(out, "299999999999999999998\n");
    }

    #[test]
    fn test_arrays_and_nested_arrays() {
        assert_result(
            "var a: integer[5]; var i: integer;
             begin
                for i := 0 to 4 do a[i] := i * i;
                return a[2] + a[4] + length(a)
             end;",
            25,
        );
        assert_result(
            "var m: integer[2][];
             begin
                m[0] := {1, 2, 3};
                m[1] := {4, 5};
                m[0][2] += 10;
                return m[0][2] + m[1][1] + length(m[0])
             end;",
            21,
        );
    }

    #[test]
    fn test_array_literal_and_concatenation() {
        assert_result(
            "var a: integer[]; var b: integer[];
             begin
                a := {1, 2};
                b := a + {3, 4, 5};
                return b[4] * 10 + length(b)
             end;",
            55,
        );
    }

    #[test]
    fn test_bounds_check() {
        let out = compile_source(
            "function main(): integer var a: integer[2]; begin return a[2] end;",
            "expr.ppp",
            &CompileOptions::default(),
        )
        .unwrap();
        let mut machine = Machine::new(MachineConfig::default());
        let err = machine
            .run(&out.module.code, &mut Vec::new(), &mut std::io::empty())
            .unwrap_err();
        assert!(matches!(
            err.kind,
            RuntimeErrorKind::IndexOutOfBounds { index: 2, length: 2 }
        ));
    }

    #[test]
    fn test_function_values_and_lambdas() {
        assert_result(
            "function twice(n: integer): integer begin return n * 2 end;
             type unary = twice;
             function apply(f: unary, n: integer): integer begin return f(n) end;
             var g: unary;
             begin
                g := twice;
                return apply(g, 5) + apply(lambda(x) => x + 1, 5) + g(1)
             end;",
            18,
        );
    }

    #[test]
    fn test_lambda_sees_enclosing_frame() {
        assert_result(
            "var base: integer = 100;
             begin
                return (lambda(x: integer): integer => base + x)(5)
             end;",
            105,
        );
    }

    #[test]
    fn test_call_errors() {
        assert_error(
            "function f(a: integer): integer begin return a end;
             function main(): integer begin return f(1, 2) end;",
            11001,
        );
        assert_error(
            "function f(a: integer): integer begin return a end;
             function main(): integer begin return f() end;",
            10570,
        );
        assert_error(
            "procedure p(ref a: integer) begin end;
             function main(): integer begin p(1 + 2); return 0 end;",
            11061,
        );
        assert_error(
            "function main(): integer var x: integer; begin return x(1) end;",
            4006,
        );
        assert_error("function main(): integer begin return print end;", 4005);
        assert_error(
            "function main(): integer var x: integer; begin return x[0] end;",
            4030,
        );
        assert_error(
            "function main(): integer var f: float = 1.0; begin return f % 2 end;",
            13000,
        );
        assert_error(
            "function main(): integer var a: integer[2]; var b: integer[2]; begin return a < b end;",
            13001,
        );
        assert_error("function main(): integer begin resize({1}, 2); return 0 end;", 10550);
    }
}
