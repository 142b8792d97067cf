//! Declarations: the root block, functions, variables, constants, type
//! aliases, includes and pragmas. Also owns function prologue and epilogue
//! generation, including the release of locals and tail call conversion.

use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::debug;

use super::symbols::{Address, Symbol, SymbolKind};
use super::{CompilationSession, CompileResult, FunctionCtx, Located, fail};
use crate::ast::{
    BinaryOp, ConstItem, Decl, Dim, Expr, ExprKind, FunctionDecl, FunctionSig, LogicOp, Param,
    Pragma, Program, TypeExpr, UnaryOp, VarItem,
};
use crate::bytecode::compile_error::CompileErrorKind;
use crate::bytecode::op::{
    AX, FloatOp, Instruction, IntOp, JumpClass, Opcode, Operand, float_word, word_float,
};
use crate::bytecode::optimize;
use crate::lang::{ConstValue, FunctionDesc, IntFlags, ParamDesc, Type, signatures_match};
use crate::lexer::Span;

use super::expr::int_operator;

impl CompilationSession {
    /// Compiles a whole program: the root block, its declarations and the
    /// call into `main`.
    pub(super) fn compile_program(&mut self, program: &Program) {
        debug!("compiling root block");
        self.emit_fixed(Instruction::op(Opcode::Inc, 3));
        let lis = self.emit_fixed(Instruction::new(Opcode::Lis, 0, 0));
        let mark = self.symbols.enter_block();
        self.frames.push(FunctionCtx {
            name: "<root>".to_string(),
            level: 0,
            desc: Rc::new(FunctionDesc {
                params: Vec::new(),
                ret: Type::Void,
            }),
            entry: 0,
            body_start: lis + 1,
            lis_index: lis,
            first_local: 3,
            next_slot: 3,
            mark,
            labels: Vec::new(),
            retired: Vec::new(),
        });

        self.decls(&program.decls);
        if let Err(e) = self.call_main() {
            self.report_located(e);
        }

        self.release_locals();
        self.emit_fixed(Instruction::opr(IntOp::Return));
        self.close_frame();
    }

    /// `main` takes nothing or the command line, and returns an integer
    /// that becomes the exit code.
    fn call_main(&mut self) -> CompileResult<()> {
        let span = Span { line: 0, col: 0 };
        let Some(id) = self.symbols.lookup_at_level("main", 0) else {
            return fail(CompileErrorKind::MissingMain, span);
        };
        let symbol = self.symbols.get(id).clone();
        let desc = match (&symbol.kind, &symbol.ty) {
            (SymbolKind::Function, Type::Function(desc)) => desc.clone(),
            _ => return fail(CompileErrorKind::MissingMain, symbol.span),
        };
        if symbol.address == Address::Predeclared {
            // already reported as never defined
            return Ok(());
        }
        let takes_args = match desc.params.as_slice() {
            [] => false,
            [p] if p.ty.is_string() && !p.byref => true,
            _ => return fail(CompileErrorKind::BadMain, symbol.span),
        };
        if !matches!(desc.ret, Type::Integer(_)) {
            return fail(CompileErrorKind::BadMain, symbol.span);
        }
        if takes_args {
            self.call_routine("__command_line", symbol.span)?;
        }
        self.store_arguments(&desc, 3);
        self.emit_direct_call(id, &desc);
        self.emit(Instruction::op(Opcode::Pop, AX));
        Ok(())
    }

    pub(super) fn decls(&mut self, decls: &[Decl]) {
        for decl in decls {
            if let Err(e) = self.decl(decl) {
                self.report_located(e);
            }
        }
    }

    fn decl(&mut self, decl: &Decl) -> CompileResult<()> {
        match decl {
            Decl::Const(items) => {
                for item in items {
                    self.const_decl(item)?;
                }
                Ok(())
            }
            Decl::Var(items) => {
                for item in items {
                    self.span = item.span;
                    self.decl_var(item)?;
                }
                Ok(())
            }
            Decl::Type { name, ty, span } => {
                let resolved = self.resolve_type(ty)?;
                let level = self.level();
                let symbol = Symbol::new(name, SymbolKind::TypeAlias, resolved, level, Address::None);
                self.declare(symbol, *span)?;
                Ok(())
            }
            Decl::Function(f) => self.function_decl(f),
            Decl::Declare(sig) => {
                let desc = self.signature(sig)?;
                let level = self.level();
                let symbol = Symbol::new(
                    &sig.name,
                    SymbolKind::Function,
                    Type::Function(Rc::new(desc)),
                    level,
                    Address::Predeclared,
                );
                self.declare(symbol, sig.span)?;
                Ok(())
            }
            Decl::Include { path, span } => self.include(path, *span),
            Decl::Pragma(p) => self.pragma(p),
        }
    }

    fn const_decl(&mut self, item: &ConstItem) -> CompileResult<()> {
        let value = self.const_eval(&item.value)?;
        let ty = match &value {
            ConstValue::Function(name) => {
                let id = self.lookup(name, item.value.span)?;
                self.symbols.get(id).ty.clone()
            }
            other => other.natural_type(),
        };
        let level = self.level();
        let symbol = Symbol::new(&item.name, SymbolKind::Constant(value), ty, level, Address::None);
        self.declare(symbol, item.span)?;
        Ok(())
    }

    /// A variable in a declaration section. Initializers are constants;
    /// sized arrays are allocated on entry.
    fn decl_var(&mut self, item: &VarItem) -> CompileResult<()> {
        let init = match &item.init {
            Some(e) => Some(self.const_eval(e).map_err(|_| Located {
                kind: CompileErrorKind::NonConstantInit(item.name.clone()),
                span: e.span,
            })?),
            None => None,
        };
        let ty = match (&item.ty, &init) {
            (Some(t), _) => self.resolve_type(t)?,
            (None, Some(ConstValue::Function(name))) => {
                let id = self.lookup(name, item.span)?;
                self.symbols.get(id).ty.clone()
            }
            (None, Some(value)) => match value.natural_type() {
                Type::Null | Type::Unknown => Type::INTEGER,
                t => t,
            },
            (None, None) => Type::INTEGER,
        };
        if ty == Type::Void {
            return fail(CompileErrorKind::VoidVariable(item.name.clone()), item.span);
        }

        let slot = self.allocate_slot();
        let level = self.level();
        let mut symbol = Symbol::new(&item.name, SymbolKind::Variable, ty.clone(), level, Address::Slot(slot));
        match init {
            Some(value) => {
                let from = self.emit_const(&value, item.span)?;
                self.cast(&from, &ty, item.span)?;
                self.emit(Instruction::op(Opcode::Sto, slot));
                if ty.is_managed() {
                    symbol.refed = 1;
                }
            }
            None => {
                if let Some((size, holds)) = sized_array(&ty) {
                    self.emit(Instruction::op(Opcode::Lit, size));
                    self.emit(Instruction::new(Opcode::Mal, holds as i64, 0));
                    self.emit(Instruction::op(Opcode::Sto, slot));
                    symbol.refed = 1;
                }
            }
        }
        self.declare(symbol, item.span)?;
        Ok(())
    }

    // ========================================================================
    // Functions
    // ========================================================================

    fn function_decl(&mut self, f: &FunctionDecl) -> CompileResult<()> {
        let sig = &f.sig;
        let desc = Rc::new(self.signature(sig)?);
        let level = self.level();

        let predeclared = self.symbols.lookup_in_block(&sig.name).filter(|id| {
            let s = self.symbols.get(*id);
            s.kind == SymbolKind::Function && s.address == Address::Predeclared
        });
        let id = match predeclared {
            Some(id) => {
                let matches = match &self.symbols.get(id).ty {
                    Type::Function(declared) => signatures_match(declared, &desc),
                    _ => false,
                };
                if !matches {
                    self.report(CompileErrorKind::DeclarationMismatch(sig.name.clone()), sig.span);
                }
                self.symbols.get_mut(id).ty = Type::Function(desc.clone());
                id
            }
            None => {
                let symbol = Symbol::new(
                    &sig.name,
                    SymbolKind::Function,
                    Type::Function(desc.clone()),
                    level,
                    Address::None,
                );
                self.declare(symbol, sig.span)?
            }
        };

        debug!(function = %sig.name, level = level + 1, "compiling function");
        let over = self.emit_fixed(Instruction::op(Opcode::Jmp, 0));
        let entry = self.here();
        self.symbols.get_mut(id).address = Address::Code(entry);
        self.begin_function(&sig.name, desc, &sig.params, entry);

        self.decls(&f.decls);
        let body_start = self.here();
        if let Some(ctx) = self.ctx_mut() {
            ctx.body_start = body_start;
        }
        self.stmt(&f.body);
        self.end_function(sig.span);

        let after = self.here();
        self.patch(over, after);
        Ok(())
    }

    /// Prologue of a function or lambda whose entry is the current
    /// position. Opens its frame and declares its parameters.
    pub(super) fn begin_function(
        &mut self,
        name: &str,
        desc: Rc<FunctionDesc>,
        params: &[Param],
        entry: usize,
    ) {
        let param_count = desc.params.len() as i64;
        self.emit_fixed(Instruction::op(Opcode::Inc, 3 + param_count));
        let lis = self.emit_fixed(Instruction::new(Opcode::Lis, 0, 0));

        let level = self.level() + 1;
        if level as usize > self.options.max_level {
            self.report(CompileErrorKind::TooDeep(self.options.max_level), self.span);
        }
        let mark = self.symbols.enter_block();
        self.frames.push(FunctionCtx {
            name: name.to_string(),
            level,
            desc: desc.clone(),
            entry,
            body_start: lis + 1,
            lis_index: lis,
            first_local: 3 + param_count,
            next_slot: 3 + param_count,
            mark,
            labels: Vec::new(),
            retired: Vec::new(),
        });

        for (i, (param, pd)) in params.iter().zip(&desc.params).enumerate() {
            let mut symbol = Symbol::new(
                &param.name,
                SymbolKind::Variable,
                pd.ty.clone(),
                level,
                Address::Slot(3 + i as i64),
            );
            symbol.byref = pd.byref;
            if !pd.byref && pd.ty.is_managed() {
                symbol.refed = 1;
            }
            if let Err(e) = self.declare(symbol, param.span) {
                self.report_located(e);
            }
        }
    }

    /// Epilogue: binds `return` jumps, converts tail calls, releases
    /// locals and closes the frame.
    pub(super) fn end_function(&mut self, span: Span) {
        let Some(ctx) = self.ctx() else {
            return;
        };
        let (entry, body_start) = (ctx.entry, ctx.body_start);
        let result_words = ctx.desc.result_words();
        let name = ctx.name.clone();

        // a trailing `return` falls through into the epilogue anyway
        if self.options.optimize {
            let last = self.code.len().wrapping_sub(1);
            let trailing_return = self.code.last().is_some_and(|ins| {
                ins.op == Opcode::Jmp
                    && matches!(ins.operand, Operand::Pending(tag) if tag.class == JumpClass::Return)
            });
            if trailing_return && last >= body_start && !self.targets.contains(&(last + 1)) {
                self.code.pop();
                self.jump_sites.remove(&last);
            }
        }

        self.span = span;
        let epilogue = self.here();
        self.resolve_function_jumps(entry, epilogue);

        if self.options.optimize
            && self.options.rules.tail_calls
            && self.releasable_slots().is_empty()
            && !self.takes_local_address(body_start, epilogue)
        {
            let converted = optimize::convert_tail_calls(
                &mut self.code,
                body_start,
                epilogue,
                entry,
                result_words,
            );
            if converted > 0 {
                debug!(function = %name, converted, "tail calls");
            }
        }

        self.release_locals();
        self.emit_fixed(Instruction::opr(IntOp::Return));
        self.close_frame();
    }

    /// Patches the frame size, binds forward calls declared in this frame
    /// and pops it.
    fn close_frame(&mut self) {
        let Some(ctx) = self.ctx() else {
            return;
        };
        let (lis, locals, level) = (ctx.lis_index, ctx.next_slot - ctx.first_local, ctx.level);
        if let Some(ins) = self.code.get_mut(lis) {
            ins.level = locals;
        }
        self.resolve_predeclared(level);
        if let Some(ctx) = self.frames.pop() {
            self.symbols.leave_block(ctx.mark);
        }
    }

    /// Slots of the current frame that get released at the end.
    fn releasable_slots(&self) -> Vec<i64> {
        let Some(ctx) = self.ctx() else {
            return Vec::new();
        };
        let guard = self.options.release_guard;
        let mut slots: Vec<i64> = self
            .symbols
            .ids_at_level(ctx.level, |s| s.owns_handle() && guard.releases(s.refed))
            .into_iter()
            .filter_map(|id| self.symbols.get(id).slot())
            .collect();
        slots.extend(
            ctx.retired
                .iter()
                .filter(|s| guard.releases(s.refed))
                .filter_map(Symbol::slot),
        );
        slots
    }

    fn release_locals(&mut self) {
        for slot in self.releasable_slots() {
            self.emit(Instruction::op(Opcode::Lod, slot));
            if let Err(e) = self.release(self.span) {
                self.report_located(e);
                return;
            }
        }
    }

    /// Whether code in the range hands out the address of a local.
    fn takes_local_address(&self, from: usize, to: usize) -> bool {
        self.code
            .get(from..to)
            .unwrap_or_default()
            .iter()
            .any(|ins| ins.op == Opcode::Lda && ins.level == 0)
    }

    /// Binds calls to functions declared at `level`, and reports those
    /// that were only declared ahead.
    fn resolve_predeclared(&mut self, level: i64) {
        let ids = self.symbols.ids_at_level(level, |s| {
            s.kind == SymbolKind::Function && matches!(s.address, Address::Code(_) | Address::Predeclared)
        });
        for id in ids {
            let symbol = self.symbols.get(id).clone();
            let target = match symbol.address {
                Address::Code(addr) => Some(addr),
                _ => {
                    self.report(CompileErrorKind::NeverDefined(symbol.name.clone()), symbol.span);
                    None
                }
            };
            let (waiting, rest): (Vec<_>, Vec<_>) =
                self.unresolved.drain(..).partition(|(_, waiting)| *waiting == id);
            self.unresolved = rest;
            if let Some(addr) = target {
                for (at, _) in waiting {
                    self.patch(at, addr);
                }
            }
        }
    }

    // ========================================================================
    // Types and signatures
    // ========================================================================

    pub(super) fn resolve_type(&mut self, t: &TypeExpr) -> CompileResult<Type> {
        let base = match t.name.as_str() {
            "integer" | "int" => Type::INTEGER,
            "float" | "real" => Type::Float,
            "string" => Type::string(),
            "bignumber" | "biginteger" => Type::big_number(),
            "handle" => Type::HANDLE,
            "character" | "char" | "byte" => Type::CHARACTER,
            "boolean" | "bool" => Type::BOOLEAN,
            "void" => Type::Void,
            "array" => Type::array_of(Type::INTEGER, -1),
            name => {
                let symbol = self.symbols.lookup(name).map(|id| self.symbols.get(id));
                match symbol {
                    Some(s) if matches!(s.kind, SymbolKind::TypeAlias | SymbolKind::Function) => {
                        s.ty.clone()
                    }
                    _ => return fail(CompileErrorKind::UnknownType(name.to_string()), t.span),
                }
            }
        };
        let mut ty = base;
        for dim in t.dims.iter().rev() {
            let size = match dim {
                Dim::Sized(e) => match self.const_eval(e) {
                    Ok(ConstValue::Int(n, _)) if n > 0 => n,
                    _ => return fail(CompileErrorKind::BadArraySize, e.span),
                },
                Dim::Reference => -1,
                Dim::Open => 0,
            };
            ty = Type::array_of(ty, size);
        }
        Ok(ty)
    }

    fn signature(&mut self, sig: &FunctionSig) -> CompileResult<FunctionDesc> {
        let params = self.param_descs(&sig.params)?;
        let ret = if sig.is_function {
            match &sig.ret {
                Some(t) => self.resolve_type(t)?,
                None => Type::INTEGER,
            }
        } else {
            Type::Void
        };
        Ok(FunctionDesc { params, ret })
    }

    /// Parameter descriptors. Untyped parameters are integers; once one
    /// parameter has a default, every later one needs one too.
    pub(super) fn param_descs(&mut self, params: &[Param]) -> CompileResult<Vec<ParamDesc>> {
        let mut descs = Vec::with_capacity(params.len());
        let mut seen_default = false;
        for p in params {
            let ty = match &p.ty {
                Some(t) => self.resolve_type(t)?,
                None => Type::INTEGER,
            };
            if ty == Type::Void {
                return fail(CompileErrorKind::VoidVariable(p.name.clone()), p.span);
            }
            let default = p.default.as_ref().map(|e| self.const_eval(e)).transpose()?;
            if default.is_some() {
                seen_default = true;
            } else if seen_default {
                return fail(CompileErrorKind::DefaultOrder(p.name.clone()), p.span);
            }
            descs.push(ParamDesc {
                name: p.name.clone(),
                ty,
                byref: p.byref,
                default,
            });
        }
        Ok(descs)
    }

    // ========================================================================
    // Constant folding
    // ========================================================================

    pub(super) fn const_eval(&self, expr: &Expr) -> CompileResult<ConstValue> {
        let not_constant = || Located {
            kind: CompileErrorKind::NotConstant,
            span: expr.span,
        };
        let value = match &expr.kind {
            ExprKind::Integer(v) => ConstValue::Int(*v, IntFlags::PLAIN),
            ExprKind::Float(v) => ConstValue::Float(*v),
            ExprKind::Str(s) => ConstValue::Str(s.clone()),
            ExprKind::BigNumber(s) => ConstValue::BigNumber(s.clone()),
            ExprKind::Char(c) => ConstValue::Int(*c, IntFlags::CHARACTER),
            ExprKind::Bool(b) => ConstValue::Int(*b as i64, IntFlags::BOOLEAN),
            ExprKind::Null => ConstValue::Null,
            ExprKind::Ident(name) => {
                let id = self.lookup(name, expr.span)?;
                let symbol = self.symbols.get(id);
                match (&symbol.kind, symbol.address) {
                    (SymbolKind::Constant(value), _) => value.clone(),
                    (SymbolKind::Function, Address::Native(_)) => return Err(not_constant()),
                    (SymbolKind::Function, _) => ConstValue::Function(name.clone()),
                    _ => return Err(not_constant()),
                }
            }
            ExprKind::Unary { op, operand } => {
                let value = self.const_eval(operand)?;
                const_unary(*op, value).ok_or_else(not_constant)?
            }
            ExprKind::Binary { op, left, right } => {
                let l = self.const_eval(left)?;
                let r = self.const_eval(right)?;
                const_binary(*op, l, r).ok_or_else(not_constant)?
            }
            ExprKind::Logical { op, left, right } => {
                let l = truth(&self.const_eval(left)?).ok_or_else(not_constant)?;
                let r = truth(&self.const_eval(right)?).ok_or_else(not_constant)?;
                let v = match op {
                    LogicOp::And => l && r,
                    LogicOp::Or => l || r,
                };
                ConstValue::Int(v as i64, IntFlags::BOOLEAN)
            }
            ExprKind::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                if truth(&self.const_eval(cond)?).ok_or_else(not_constant)? {
                    self.const_eval(then_expr)?
                } else {
                    self.const_eval(else_expr)?
                }
            }
            ExprKind::ArrayLit(items) => ConstValue::Array(
                items
                    .iter()
                    .map(|e| self.const_eval(e))
                    .collect::<CompileResult<Vec<_>>>()?,
            ),
            _ => return Err(not_constant()),
        };
        Ok(value)
    }

    // ========================================================================
    // Includes and pragmas
    // ========================================================================

    /// Compiles the declarations of another file in place. A file is read
    /// at most once per compilation.
    fn include(&mut self, path: &str, span: Span) -> CompileResult<()> {
        let found = self.include_candidates(path).into_iter().find(|p| p.is_file());
        let Some(found) = found else {
            return fail(CompileErrorKind::IncludeNotFound(path.to_string()), span);
        };
        let canonical = found.canonicalize().unwrap_or_else(|_| found.clone());
        if !self.included.insert(canonical.clone()) {
            debug!(path = %found.display(), "already included");
            return Ok(());
        }
        let source = fs::read_to_string(&found).map_err(|e| Located {
            kind: CompileErrorKind::IncludeIo {
                path: path.to_string(),
                message: e.to_string(),
            },
            span,
        })?;

        debug!(path = %found.display(), "including");
        let saved = self.file;
        let dir = canonical.parent().map(Path::to_path_buf);
        if let Some(program) = self.parse_source(&source, &found.display().to_string(), dir) {
            self.decls(&program.decls);
        }
        self.file = saved;
        Ok(())
    }

    /// The including file's directory, the working directory, then the
    /// search path.
    fn include_candidates(&self, path: &str) -> Vec<PathBuf> {
        let relative = Path::new(path);
        if relative.is_absolute() {
            return vec![relative.to_path_buf()];
        }
        let mut candidates = Vec::new();
        if let Some(dir) = self.files.get(self.file).and_then(|f| f.dir.as_ref()) {
            candidates.push(dir.join(relative));
        }
        candidates.push(relative.to_path_buf());
        candidates.extend(self.options.search_path.iter().map(|dir| dir.join(relative)));
        candidates
    }

    pub(super) fn pragma(&mut self, p: &Pragma) -> CompileResult<()> {
        let value = match self.const_eval(&p.value)? {
            ConstValue::Int(v, _) => v != 0,
            _ => return fail(CompileErrorKind::NotConstant, p.value.span),
        };
        match p.name.as_str() {
            "optimize" => self.options.optimize = value,
            "boundary_check" | "bounds_check" => self.options.bounds_check = value,
            other => return fail(CompileErrorKind::UnknownPragma(other.to_string()), p.span),
        }
        debug!(pragma = %p.name, value, "pragma");
        Ok(())
    }
}

/// Length and element ownership of a fixed-size array type.
pub(super) fn sized_array(ty: &Type) -> Option<(i64, bool)> {
    ty.array()
        .filter(|a| a.size > 0)
        .map(|a| (a.size, a.contains.is_managed()))
}

fn truth(value: &ConstValue) -> Option<bool> {
    match value {
        ConstValue::Int(v, _) => Some(*v != 0),
        ConstValue::Float(f) => Some(*f != 0.0),
        _ => None,
    }
}

fn const_unary(op: UnaryOp, value: ConstValue) -> Option<ConstValue> {
    let boolean = |b: bool| ConstValue::Int(b as i64, IntFlags::BOOLEAN);
    Some(match (op, value) {
        (UnaryOp::Neg, ConstValue::Int(n, _)) => ConstValue::Int(n.wrapping_neg(), IntFlags::PLAIN),
        (UnaryOp::Neg, ConstValue::Float(f)) => ConstValue::Float(-f),
        (UnaryOp::Not, ConstValue::Int(n, _)) => boolean(n == 0),
        (UnaryOp::Not, ConstValue::Float(f)) => boolean(f == 0.0),
        (UnaryOp::BitNot, ConstValue::Int(n, _)) => ConstValue::Int(!n, IntFlags::PLAIN),
        (UnaryOp::Abs, ConstValue::Int(n, _)) => ConstValue::Int(n.wrapping_abs(), IntFlags::PLAIN),
        (UnaryOp::Abs, ConstValue::Float(f)) => ConstValue::Float(f.abs()),
        (UnaryOp::Odd, ConstValue::Int(n, _)) => boolean(n & 1 != 0),
        _ => return None,
    })
}

fn const_binary(op: BinaryOp, l: ConstValue, r: ConstValue) -> Option<ConstValue> {
    let compare = op.is_comparison();
    match (l, r) {
        (ConstValue::Int(a, _), ConstValue::Int(b, _)) => {
            if matches!(op, BinaryOp::StrEq | BinaryOp::StrNotEq) {
                return None;
            }
            let v = int_operator(op).apply(a, b)?;
            let flags = if compare { IntFlags::BOOLEAN } else { IntFlags::PLAIN };
            Some(ConstValue::Int(v, flags))
        }
        (ConstValue::Float(a), ConstValue::Float(b)) => const_float(op, a, b),
        (ConstValue::Float(a), ConstValue::Int(b, _)) => const_float(op, a, b as f64),
        (ConstValue::Int(a, _), ConstValue::Float(b)) => const_float(op, a as f64, b),
        (ConstValue::Str(a), ConstValue::Str(b)) => match op {
            BinaryOp::Add => Some(ConstValue::Str(a + &b)),
            BinaryOp::StrEq => Some(ConstValue::Int((a == b) as i64, IntFlags::BOOLEAN)),
            BinaryOp::StrNotEq => Some(ConstValue::Int((a != b) as i64, IntFlags::BOOLEAN)),
            _ => None,
        },
        (ConstValue::Str(a), ConstValue::Int(b, flags)) if op == BinaryOp::Add => {
            Some(ConstValue::Str(a + &int_text(b, flags)))
        }
        (ConstValue::Int(a, flags), ConstValue::Str(b)) if op == BinaryOp::Add => {
            Some(ConstValue::Str(int_text(a, flags) + &b))
        }
        _ => None,
    }
}

fn const_float(op: BinaryOp, a: f64, b: f64) -> Option<ConstValue> {
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
        _ => return None,
    };
    let word = fop.apply(float_word(a), float_word(b))?;
    Some(if op.is_comparison() {
        ConstValue::Int(word, IntFlags::BOOLEAN)
    } else {
        ConstValue::Float(word_float(word))
    })
}

/// Text of an integer the way the conversion routines print it.
fn int_text(v: i64, flags: IntFlags) -> String {
    if flags.character {
        char::from_u32(v as u32)
            .unwrap_or(char::REPLACEMENT_CHARACTER)
            .to_string()
    } else if flags.boolean {
        if v != 0 { "true" } else { "false" }.to_string()
    } else {
        v.to_string()
    }
}
