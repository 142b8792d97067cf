//! Implicit conversions, runtime routine calls and constant materialization.

use super::symbols::{Address, SymbolKind};
use super::{CompilationSession, CompileResult, fail};
use crate::bytecode::compile_error::CompileErrorKind;
use crate::bytecode::op::{
    ARRAY_HEADER_SIZE, CX, FloatOp, Instruction, IntOp, Opcode, Operand, float_word,
};
use crate::lang::{ConstValue, FunctionDesc, Type, kinds_match};
use crate::lexer::Span;

impl CompilationSession {
    /// Converts the value on top of the stack from `from` to `to`.
    pub(super) fn cast(&mut self, from: &Type, to: &Type, span: Span) -> CompileResult<()> {
        let from = match from {
            Type::Unknown => {
                self.report(CompileErrorKind::UnknownKind, span);
                Type::INTEGER
            }
            Type::Null => return Ok(()),
            other => other.clone(),
        };
        let invalid = || CompileErrorKind::InvalidCast {
            from: from.to_string(),
            to: to.to_string(),
        };

        match (&from, to) {
            (Type::Void, _) => fail(CompileErrorKind::NoValue("a procedure call".to_string()), span),
            (_, Type::Unknown) => Ok(()),
            (Type::Function(_), Type::Function(_)) => {
                if kinds_match(&from, to) {
                    Ok(())
                } else {
                    fail(CompileErrorKind::SignatureMismatch, span)
                }
            }
            (Type::Function(_), other) | (other, Type::Function(_)) => {
                fail(CompileErrorKind::FunctionCast(other.to_string()), span)
            }
            (Type::Integer(_), Type::Integer(_)) | (Type::Float, Type::Float) => Ok(()),
            (Type::Integer(_), Type::Float) => {
                self.emit(Instruction::fop(FloatOp::Flo));
                Ok(())
            }
            (Type::Float, Type::Integer(_)) => {
                self.emit(Instruction::fop(FloatOp::Int));
                Ok(())
            }
            (Type::Array(_), Type::Integer(flags)) if flags.handle => Ok(()),
            (Type::Integer(flags), Type::Array(_)) if flags.handle => Ok(()),
            (Type::Integer(flags), target) if target.is_text() => {
                let routine = if flags.boolean {
                    "b2s"
                } else if flags.character {
                    "c2s"
                } else {
                    "i2s"
                };
                self.call_routine(routine, span)
            }
            (Type::Float, target) if target.is_string() => self.call_routine("f2s", span),
            (source, Type::Integer(_)) if source.is_text() => self.call_routine("s2i", span),
            (source, Type::Float) if source.is_text() => self.call_routine("s2f", span),
            (Type::Array(a), Type::Array(b)) => {
                if kinds_match(&a.contains, &b.contains) || b.contains == Type::Unknown {
                    Ok(())
                } else {
                    fail(invalid(), span)
                }
            }
            (Type::Integer(_), Type::Array(_)) => fail(CompileErrorKind::IntegerAsArray, span),
            _ => fail(invalid(), span),
        }
    }

    /// Compiles `expr` and converts the result to `to`.
    pub(super) fn expr_as(&mut self, expr: &crate::ast::Expr, to: &Type) -> CompileResult<()> {
        let ty = self.expr(expr)?;
        self.cast(&ty, to, expr.span)
    }

    /// Calls the routine `name` with its arguments already on the stack.
    /// A user function of that name takes precedence over the native.
    pub(super) fn call_routine(&mut self, name: &str, span: Span) -> CompileResult<()> {
        let Some(id) = self.symbols.lookup(name) else {
            return fail(CompileErrorKind::MissingRoutine(name.to_string()), span);
        };
        let symbol = self.symbols.get(id).clone();
        match (&symbol.kind, symbol.address, &symbol.ty) {
            (SymbolKind::Function, Address::Native(native), _) => {
                self.emit(Instruction::op(Opcode::Sys, native.code()));
                Ok(())
            }
            (SymbolKind::Function, Address::Code(_) | Address::Predeclared, Type::Function(desc)) => {
                let desc = desc.clone();
                self.store_arguments(&desc, 3);
                self.emit_direct_call(id, &desc);
                Ok(())
            }
            _ => fail(CompileErrorKind::MissingRoutine(name.to_string()), span),
        }
    }

    /// Moves already pushed arguments up past the frame header. `reserve`
    /// is the distance from an argument to its parameter slot when the
    /// callee frame starts right above the remaining stack.
    pub(super) fn store_arguments(&mut self, desc: &FunctionDesc, reserve: i64) {
        let r = desc.result_words();
        for _ in &desc.params {
            self.emit(Instruction::op(Opcode::Stp, reserve + r));
        }
    }

    /// Result slot plus `CAL` to a user function.
    pub(super) fn emit_direct_call(&mut self, id: crate::bytecode::op::SymbolId, desc: &FunctionDesc) {
        if desc.returns_value() {
            self.emit(Instruction::op(Opcode::Lit, 0));
        }
        let symbol = self.symbols.get(id);
        let level = self.level() - symbol.level;
        match symbol.address {
            Address::Code(addr) => {
                self.emit_fixed(Instruction::new(Opcode::Cal, level, addr as i64));
            }
            _ => {
                let ins = Instruction {
                    op: Opcode::Cal,
                    level,
                    operand: Operand::Unresolved(id),
                };
                self.emit_unresolved(ins, id);
            }
        }
    }

    pub(super) fn addref(&mut self, span: Span) -> CompileResult<()> {
        self.call_routine("__memory_addref", span)
    }

    pub(super) fn release(&mut self, span: Span) -> CompileResult<()> {
        self.call_routine("__memory_release", span)
    }

    /// Drops a value nobody uses.
    pub(super) fn discard(&mut self, ty: &Type, span: Span) -> CompileResult<()> {
        match ty {
            Type::Void => Ok(()),
            t if t.is_managed() => self.release(span),
            _ => {
                self.emit(Instruction::op(Opcode::Dec, 1));
                Ok(())
            }
        }
    }

    /// Leaves 1 or 0 for a value used as a condition. Arrays count as true
    /// when non-null and are released.
    pub(super) fn to_condition(&mut self, ty: &Type, span: Span) -> CompileResult<()> {
        match ty {
            Type::Float => {
                self.emit(Instruction::op(Opcode::Lit, 0));
                self.emit(Instruction::fop(FloatOp::Neq));
            }
            Type::Array(_) => {
                self.emit(Instruction::op(Opcode::Sld, 0));
                self.emit(Instruction::op(Opcode::Lit, 0));
                self.emit(Instruction::opr(IntOp::Neq));
                self.emit(Instruction::op(Opcode::Sws, 0));
                self.release(span)?;
            }
            Type::Void => {
                return fail(CompileErrorKind::NoValue("a procedure call".to_string()), span);
            }
            Type::Function(_) => {
                return fail(CompileErrorKind::FunctionCast(Type::BOOLEAN.to_string()), span);
            }
            _ => {}
        }
        Ok(())
    }

    /// Compiles a condition; the result is zero for false.
    pub(super) fn condition(&mut self, expr: &crate::ast::Expr) -> CompileResult<()> {
        let ty = self.expr(expr)?;
        self.to_condition(&ty, expr.span)
    }

    /// Normalizes a condition word to exactly 0 or 1.
    pub(super) fn boolate(&mut self) {
        self.emit(Instruction::op(Opcode::Lit, 0));
        self.emit(Instruction::opr(IntOp::Neq));
    }

    // ========================================================================
    // Constants
    // ========================================================================

    /// Pushes a constant and returns its type. Text and arrays are
    /// allocated fresh, so the result is owned like any array value.
    pub(super) fn emit_const(&mut self, value: &ConstValue, span: Span) -> CompileResult<Type> {
        match value {
            ConstValue::Int(v, flags) => {
                self.emit(Instruction::op(Opcode::Lit, *v));
                Ok(Type::Integer(*flags))
            }
            ConstValue::Float(f) => {
                self.emit(Instruction::op(Opcode::Lit, float_word(*f)));
                Ok(Type::Float)
            }
            ConstValue::Null => {
                self.emit(Instruction::op(Opcode::Lit, 0));
                Ok(Type::Null)
            }
            ConstValue::Str(text) => {
                self.emit_text(text);
                Ok(Type::string())
            }
            ConstValue::BigNumber(text) => {
                self.emit_text(text);
                Ok(Type::big_number())
            }
            ConstValue::Array(items) => {
                let ty = value.natural_type();
                let holds = ty.element().is_some_and(Type::is_managed);
                self.emit(Instruction::op(Opcode::Lit, items.len() as i64));
                self.emit_fixed(Instruction::new(Opcode::Mal, holds as i64, 0));
                let element = ty.element().cloned().unwrap_or(Type::INTEGER);
                for (i, item) in items.iter().enumerate() {
                    let item_ty = self.emit_const(item, span)?;
                    self.cast(&item_ty, &element, span)?;
                    self.store_element_register(i as i64);
                }
                Ok(ty)
            }
            ConstValue::Function(name) => {
                let id = self.lookup(name, span)?;
                self.function_value(id, span)
            }
        }
    }

    fn emit_text(&mut self, text: &str) {
        let chars: Vec<char> = text.chars().collect();
        self.emit(Instruction::op(Opcode::Lit, chars.len() as i64));
        self.emit_fixed(Instruction::new(Opcode::Mal, 0, 0));
        for (i, c) in chars.iter().enumerate() {
            self.emit(Instruction::op(Opcode::Lit, *c as i64));
            self.store_element_register(i as i64);
        }
    }

    /// Stores the top word into element `index` of the array just below it.
    pub(super) fn store_element_register(&mut self, index: i64) {
        self.emit(Instruction::new(Opcode::Srg, ARRAY_HEADER_SIZE + index, CX));
        self.emit(Instruction::op(Opcode::Mss, 0));
    }

    /// Pushes a function value: `LFP` with the link to the declaring frame.
    pub(super) fn function_value(
        &mut self,
        id: crate::bytecode::op::SymbolId,
        span: Span,
    ) -> CompileResult<Type> {
        let symbol = self.symbols.get(id).clone();
        if symbol.kind != SymbolKind::Function {
            return fail(CompileErrorKind::NotAValue(symbol.name), span);
        }
        let level = self.level() - symbol.level;
        match symbol.address {
            Address::Code(addr) => {
                self.emit(Instruction::new(Opcode::Lfp, level, addr as i64));
            }
            Address::Predeclared => {
                let ins = Instruction {
                    op: Opcode::Lfp,
                    level,
                    operand: Operand::Unresolved(id),
                };
                self.emit_unresolved(ins, id);
            }
            _ => return fail(CompileErrorKind::NotAValue(symbol.name), span),
        }
        Ok(symbol.ty)
    }
}

#[cfg(test)]
mod tests {
    use crate::bytecode::compile::{CompileOptions, compile_source};
    use crate::runtime::vm_bc::{Machine, MachineConfig};

    fn run(source: &str) -> (i64, String) {
        let out = match compile_source(source, "cast.ppp", &CompileOptions::default()) {
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

    fn assert_error(source: &str, code: u32) {
        let failure = compile_source(source, "cast.ppp", &CompileOptions::default()).unwrap_err();
        assert!(failure.codes().contains(&code), "{:?}", failure.codes());
    }

    #[test]
    fn test_int_float_conversions() {
        let (code, _) = run(
            "function main(): integer
                var f: float = 2.5;
                var i: integer;
             begin
                i := f * 4;
                f := i;
                return i + (f > 9.5 ? 1 : 0)
             end;",
        );
        assert_eq!(code, 11);
    }

    #[test]
    fn test_text_conversions() {
        let (code, out) = run(
            "function main(): integer
                var s: string;
                var c: char = 'x';
                var b: boolean = true;
             begin
                s := 12;
                println(s + c + b);
                println(1.5);
                return s + 1
             end;",
        );
        assert_eq!(out, "12xtrue\n1.5\n");
        // "12" + 1 concatenates before the result converts back
        assert_eq!(code, 121);
    }

    #[test]
    fn test_string_to_float() {
        let (code, _) = run(
            "function main(): integer
                var f: float;
             begin
                f := \"2.25\";
                return f * 4
             end;",
        );
        assert_eq!(code, 9);
    }

    #[test]
    fn test_user_routine_overrides_native() {
        let (_, out) = run(
            "function i2s(n: integer): string begin return \"#\" end;
             function main(): integer begin println(\"v\" + 5); return 0 end;",
        );
        assert_eq!(out, "v#\n");
    }

    #[test]
    fn test_invalid_casts() {
        assert_error(
            "function main(): integer var a: integer[3]; var f: float[3]; begin a := f; return 0 end;",
            12001,
        );
        assert_error(
            "function main(): integer var a: integer[3]; begin a := 5; return 0 end;",
            11080,
        );
        assert_error(
            "function f(): integer begin return 1 end;
             function main(): integer var x: integer; begin x := f; return 0 end;",
            12000,
        );
        assert_error(
            "function f(a: integer): integer begin return a end;
             type binop = f;
             function g(a: float): integer begin return 1 end;
             function main(): integer var h: binop; begin h := g; return 0 end;",
            12002,
        );
        assert_error(
            "procedure p() begin end;
             function main(): integer var x: integer; begin x := p(); return 0 end;",
            11040,
        );
    }

    #[test]
    fn test_every_kind_pair_converts_or_fails() {
        let kinds = [
            ("integer", "42"),
            ("float", "2.5"),
            ("string", "\"42\""),
            ("bignumber", "42#"),
            ("integer[]", "{52, 50}"),
        ];
        // what `println(dst)` shows after `dst := src`, or the error code
        let expected: [[Result<&str, u32>; 5]; 5] = [
            [Ok("42"), Ok("42.0"), Ok("42"), Ok("42"), Err(11080)],
            [Ok("2"), Ok("2.5"), Ok("2.5"), Err(12001), Err(12001)],
            [Ok("42"), Ok("42.0"), Ok("42"), Ok("42"), Ok("42")],
            [Ok("42"), Ok("42.0"), Ok("42"), Ok("42"), Ok("42")],
            [Err(12001), Err(12001), Ok("42"), Ok("42"), Ok("42")],
        ];
        for (row, (from, value)) in kinds.iter().enumerate() {
            for (col, (to, _)) in kinds.iter().enumerate() {
                let source = format!(
                    "function main(): integer
                        var src: {from};
                        var dst: {to};
                     begin
                        src := {value};
                        dst := src;
                        println(dst);
                        return 0
                     end;"
                );
                match expected[row][col] {
                    Ok(shown) => {
                        let (_, out) = run(&source);
                        assert_eq!(out, format!("{shown}\n"), "{from} -> {to}");
                    }
                    Err(code) => assert_error(&source, code),
                }
            }
        }
    }

    #[test]
    fn test_handle_accepts_array() {
        let (code, _) = run(
            "function main(): integer
                var a: integer[4];
             begin
                resize(a, 9);
                return length(a)
             end;",
        );
        assert_eq!(code, 9);
    }
}
