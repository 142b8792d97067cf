use std::io::{BufRead, Write};
use std::time::Instant;

use tracing::{debug, info};

use crate::bytecode::op::{
    AX, CX, DX, FLAG_FLOAT, FloatOp, InlineOp, Instruction, IntOp, Opcode, Operand,
    REGISTER_COUNT,
};
use crate::runtime::files::FileTable;
use crate::runtime::heap::{Heap, Leak};
use crate::runtime::natives::Native;
use crate::runtime::runtime_error::{RuntimeError, RuntimeErrorKind};

#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Words of evaluation stack.
    pub stack_size: usize,
    pub max_handles: usize,
    pub max_files: usize,
    pub max_steps: Option<u64>,
    /// Log every instruction with the top of the stack.
    pub trace_stack: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            stack_size: 0x10000,
            max_handles: 0x1000,
            max_files: 0x100,
            max_steps: None,
            trace_stack: false,
        }
    }
}

/// What a finished run leaves behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// `AX` at halt: the value `main` returned.
    pub exit_code: i64,
    pub steps: u64,
    /// Highest stack index touched.
    pub max_stack_depth: usize,
    /// Handles still allocated at halt.
    pub leaks: Vec<Leak>,
}

type Step = Result<(), RuntimeErrorKind>;

/// Stack machine with display-free frames.
///
/// A frame starts at `b` with three header words: static link (frame of the
/// lexically enclosing function), dynamic link (caller's `b`) and return
/// address. Parameters and locals follow. The machine starts with `t = 0`,
/// `b = 1`, `p = 0` and halts when a return lands on address 0.
pub struct Machine {
    config: MachineConfig,
    stack: Vec<i64>,
    t: i64,
    b: i64,
    p: usize,
    regs: [i64; REGISTER_COUNT],
    pub(super) heap: Heap,
    pub(super) files: FileTable,
    pub(super) command_line: String,
    pub(super) started: Instant,
    steps: u64,
    max_depth: i64,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Self {
        Machine {
            stack: vec![0; config.stack_size],
            t: 0,
            b: 1,
            p: 0,
            regs: [0; REGISTER_COUNT],
            heap: Heap::new(config.max_handles),
            files: FileTable::new(config.max_files),
            command_line: String::new(),
            started: Instant::now(),
            steps: 0,
            max_depth: 0,
            config,
        }
    }

    /// Text `__command_line` hands to `main(args: string)`.
    pub fn with_command_line(mut self, args: &str) -> Self {
        self.command_line = args.to_string();
        self
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn register(&self, r: i64) -> i64 {
        self.regs.get(r as usize).copied().unwrap_or(0)
    }

    fn reset(&mut self) {
        self.stack.iter_mut().for_each(|w| *w = 0);
        self.t = 0;
        self.b = 1;
        self.p = 0;
        self.regs = [0; REGISTER_COUNT];
        self.heap = Heap::new(self.config.max_handles);
        self.files = FileTable::new(self.config.max_files);
        self.started = Instant::now();
        self.steps = 0;
        self.max_depth = 0;
    }

    /// Runs `code` from address 0 until the outermost return.
    pub fn run(
        &mut self,
        code: &[Instruction],
        out: &mut dyn Write,
        input: &mut dyn BufRead,
    ) -> Result<RunSummary, RuntimeError> {
        self.reset();
        debug!(instructions = code.len(), "machine start");

        loop {
            let pc = self.p;
            let Some(&ins) = code.get(pc) else {
                return Err(self.fail(RuntimeErrorKind::BadJump(pc as i64), pc));
            };
            self.p += 1;
            self.steps += 1;
            if let Some(max) = self.config.max_steps {
                if self.steps > max {
                    return Err(self.fail(RuntimeErrorKind::StepLimit(max), pc));
                }
            }
            if self.config.trace_stack {
                self.trace(pc, &ins);
            }

            let value = match ins.operand {
                Operand::Value(v) => v,
                _ => return Err(self.fail(RuntimeErrorKind::Unresolved(pc), pc)),
            };
            match self.execute(ins.op, ins.level, value, out, input) {
                Ok(true) => break,
                Ok(false) => {}
                Err(kind) => return Err(self.fail(kind, pc)),
            }
        }

        self.files
            .close_all()
            .map_err(|kind| RuntimeError::new(kind, self.p))?;
        out.flush()
            .map_err(|e| RuntimeError::new(RuntimeErrorKind::from(e), self.p))?;

        let leaks = self.heap.leaks();
        for leak in &leaks {
            debug!(handle = leak.handle, length = leak.length, refcount = leak.refcount, "probable leak");
        }
        debug!(steps = self.steps, exit_code = self.regs[AX as usize], "machine halt");

        Ok(RunSummary {
            exit_code: self.regs[AX as usize],
            steps: self.steps,
            max_stack_depth: self.max_depth.max(0) as usize,
            leaks,
        })
    }

    /// Wraps `kind` with the chain of return addresses still on the stack.
    fn fail(&self, kind: RuntimeErrorKind, pc: usize) -> RuntimeError {
        let mut err = RuntimeError::new(kind, pc);
        let mut frame = self.b;
        let mut depth = 0;
        while frame > 0 && depth < 16 {
            let (Some(&ret), Some(&link)) = (
                self.stack.get((frame + 2) as usize),
                self.stack.get((frame + 1) as usize),
            ) else {
                break;
            };
            if ret == 0 {
                break;
            }
            err = err.with_context(&format!("called from {:04}", ret - 1));
            frame = link;
            depth += 1;
        }
        err
    }

    fn trace(&self, pc: usize, ins: &Instruction) {
        let low = (self.t - 3).max(1);
        let top: Vec<String> = (low..=self.t)
            .filter_map(|i| self.stack.get(i as usize))
            .map(|w| w.to_string())
            .collect();
        info!(target: "ppp::vm", "{:04} {:<16} t={:<5} b={:<5} [{}]", pc, ins.to_string(), self.t, self.b, top.join(" "));
    }

    // ========================================================================
    // Stack access
    // ========================================================================

    fn index(&self, i: i64) -> Result<usize, RuntimeErrorKind> {
        usize::try_from(i)
            .ok()
            .filter(|&i| i < self.stack.len())
            .ok_or(RuntimeErrorKind::StackAccess(i))
    }

    fn load(&self, i: i64) -> Result<i64, RuntimeErrorKind> {
        Ok(self.stack[self.index(i)?])
    }

    fn store(&mut self, i: i64, value: i64) -> Step {
        let i = self.index(i)?;
        self.stack[i] = value;
        Ok(())
    }

    fn set_top(&mut self, t: i64) -> Step {
        if t < 0 {
            return Err(RuntimeErrorKind::StackAccess(t));
        }
        if t as usize >= self.stack.len() {
            return Err(RuntimeErrorKind::StackOverflow);
        }
        self.t = t;
        self.max_depth = self.max_depth.max(t);
        Ok(())
    }

    pub(super) fn push_word(&mut self, value: i64) -> Step {
        self.set_top(self.t + 1)?;
        self.stack[self.t as usize] = value;
        Ok(())
    }

    fn pop(&mut self) -> Result<i64, RuntimeErrorKind> {
        let value = self.load(self.t)?;
        self.set_top(self.t - 1)?;
        Ok(value)
    }

    /// The top `n` words, bottom first.
    pub(super) fn pop_n(&mut self, n: usize) -> Result<Vec<i64>, RuntimeErrorKind> {
        let first = self.t - n as i64 + 1;
        let words = (first..=self.t)
            .map(|i| self.load(i))
            .collect::<Result<Vec<_>, _>>()?;
        self.set_top(first - 1)?;
        Ok(words)
    }

    /// Frame base `levels` static links out.
    fn base(&self, levels: i64) -> Result<i64, RuntimeErrorKind> {
        let mut b = self.b;
        for _ in 0..levels {
            b = self.load(b)?;
        }
        Ok(b)
    }

    fn slot(&self, level: i64, offset: i64) -> Result<i64, RuntimeErrorKind> {
        Ok(self.base(level)? + offset)
    }

    fn register_index(r: i64) -> Result<usize, RuntimeErrorKind> {
        usize::try_from(r)
            .ok()
            .filter(|&r| r < REGISTER_COUNT)
            .ok_or_else(|| RuntimeErrorKind::BadInstruction(format!("register {}", r)))
    }

    // ========================================================================
    // Calls
    // ========================================================================

    fn call(&mut self, static_link: i64, addr: i64) -> Step {
        let frame = self.t + 1;
        self.set_top(self.t + 3)?;
        self.stack[frame as usize] = static_link;
        self.stack[frame as usize + 1] = self.b;
        self.stack[frame as usize + 2] = self.p as i64;
        self.set_top(frame - 1)?;
        self.b = frame;
        self.jump(addr)
    }

    fn call_value(&mut self, fp: i64) -> Step {
        let addr = fp & 0xFFFF_FFFF;
        if addr == 0 {
            return Err(RuntimeErrorKind::NullFunction);
        }
        self.call(fp >> 32, addr)
    }

    fn jump(&mut self, addr: i64) -> Step {
        self.p = usize::try_from(addr).map_err(|_| RuntimeErrorKind::BadJump(addr))?;
        Ok(())
    }

    /// Returns true when control leaves the outermost frame.
    fn ret(&mut self) -> Result<bool, RuntimeErrorKind> {
        let t = self.b - 1;
        let b = self.load(t + 2)?;
        let p = self.load(t + 3)?;
        self.set_top(t)?;
        self.b = b;
        self.jump(p)?;
        Ok(p == 0)
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    fn execute(
        &mut self,
        op: Opcode,
        level: i64,
        value: i64,
        out: &mut dyn Write,
        input: &mut dyn BufRead,
    ) -> Result<bool, RuntimeErrorKind> {
        match op {
            Opcode::Nop => {}
            Opcode::Lit => self.push_word(value)?,
            Opcode::Opr => {
                let op = IntOp::from_code(value)
                    .ok_or_else(|| RuntimeErrorKind::BadInstruction(format!("OPR {}", value)))?;
                match op {
                    IntOp::Return => return self.ret(),
                    op if op.is_unary() => {
                        let a = self.pop()?;
                        self.push_word(op.apply_unary(a))?;
                    }
                    op => {
                        let b = self.pop()?;
                        let a = self.pop()?;
                        let result = op.apply(a, b).ok_or(RuntimeErrorKind::DivideByZero)?;
                        self.push_word(result)?;
                    }
                }
            }
            Opcode::Fop => {
                let op = FloatOp::from_code(value)
                    .ok_or_else(|| RuntimeErrorKind::BadInstruction(format!("FOP {}", value)))?;
                if op.is_unary() {
                    let a = self.pop()?;
                    self.push_word(op.apply_unary(a))?;
                } else {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let result = op.apply(a, b).ok_or(RuntimeErrorKind::DivideByZero)?;
                    self.push_word(result)?;
                }
            }
            Opcode::Lod => {
                let v = self.load(self.slot(level, value)?)?;
                self.push_word(v)?;
            }
            Opcode::Sto => {
                let v = self.pop()?;
                self.store(self.slot(level, value)?, v)?;
            }
            Opcode::Lid => {
                let addr = self.load(self.slot(level, value)?)?;
                let v = self.load(addr)?;
                self.push_word(v)?;
            }
            Opcode::Sid => {
                let v = self.pop()?;
                let addr = self.load(self.slot(level, value)?)?;
                self.store(addr, v)?;
            }
            Opcode::Lda => {
                let addr = self.slot(level, value)?;
                self.push_word(addr)?;
            }
            Opcode::Cal => self.call(self.base(level)?, value)?,
            Opcode::Cai => {
                let fp = self.load(self.slot(level, value)?)?;
                self.call_value(fp)?;
            }
            Opcode::Cii => {
                let addr = self.load(self.slot(level, value)?)?;
                let fp = self.load(addr)?;
                self.call_value(fp)?;
            }
            Opcode::Cas => {
                let fp = self.load(self.t)?;
                if value == 0 {
                    self.set_top(self.t - 1)?;
                } else {
                    self.store(self.t, 0)?;
                }
                self.call_value(fp)?;
            }
            Opcode::Tac => {
                let n = level;
                let from = self.index(self.t - n + 1)?;
                let to = self.index(self.b + 3)?;
                self.stack.copy_within(from..from + n as usize, to);
                self.set_top(self.b - 1)?;
                self.jump(value)?;
            }
            Opcode::Inc => self.set_top(self.t + value)?,
            Opcode::Dec => self.set_top(self.t - value)?,
            Opcode::Jmp => self.jump(value)?,
            Opcode::Jpc => {
                if self.pop()? == 0 {
                    self.jump(value)?;
                }
            }
            Opcode::Stp => {
                let v = self.load(self.t)?;
                self.store(self.t + value, v)?;
                self.set_top(self.t - 1)?;
            }
            Opcode::Sld => {
                let v = self.load(self.t - value)?;
                self.push_word(v)?;
            }
            Opcode::Sws => {
                let (a, b) = (self.index(self.t)?, self.index(self.t - 1)?);
                self.stack.swap(a, b);
            }
            Opcode::Lis => {
                for _ in 0..level {
                    self.push_word(value)?;
                }
            }
            Opcode::Srv => {
                let v = self.pop()?;
                self.store(self.base(level)? - value, v)?;
            }
            Opcode::Mal => {
                let n = self.pop()?;
                let n = usize::try_from(n).map_err(|_| RuntimeErrorKind::IndexOutOfBounds {
                    index: n,
                    length: 0,
                })?;
                let h = self.heap.alloc(n, level != 0)?;
                self.push_word(h)?;
            }
            Opcode::Mls => {
                let h = self.load(self.t - value)?;
                let v = self.heap.load(h, self.regs[CX as usize])?;
                self.push_word(v)?;
            }
            Opcode::Mss => {
                let v = self.pop()?;
                let h = self.load(self.t - value)?;
                self.heap.store(h, self.regs[CX as usize], v)?;
            }
            Opcode::Mlo | Opcode::Mli => {
                let mut h = self.load(self.slot(level, value)?)?;
                if op == Opcode::Mli {
                    h = self.load(h)?;
                }
                let v = self.heap.load(h, self.regs[CX as usize])?;
                self.push_word(v)?;
            }
            Opcode::Mst | Opcode::Msi => {
                let v = self.pop()?;
                let mut h = self.load(self.slot(level, value)?)?;
                if op == Opcode::Msi {
                    h = self.load(h)?;
                }
                self.heap.store(h, self.regs[CX as usize], v)?;
            }
            Opcode::Pop => {
                let v = self.pop()?;
                if value != 0 {
                    self.regs[Self::register_index(value)?] = v;
                }
            }
            Opcode::Pus => {
                let v = self.regs[Self::register_index(value)?];
                self.push_word(v)?;
            }
            Opcode::Mov => {
                self.regs[Self::register_index(value)?] = self.regs[Self::register_index(level)?];
            }
            Opcode::Rio => self.regs[Self::register_index(value)?] |= level,
            Opcode::Srg => self.regs[Self::register_index(value)?] = level,
            Opcode::Lfp => {
                let link = self.base(level)?;
                self.push_word((link << 32) | (value & 0xFFFF_FFFF))?;
            }
            Opcode::Sys => {
                let native = Native::from_code(value)
                    .ok_or_else(|| RuntimeErrorKind::BadInstruction(format!("SYS {}", value)))?;
                self.call_native(native, out, input)?;
            }
            _ => {
                let Some((inline, indirect)) = op.inline_op() else {
                    return Err(RuntimeErrorKind::BadInstruction(op.mnemonic().to_string()));
                };
                self.inline(inline, indirect, level, value)?;
            }
        }
        Ok(false)
    }

    /// `slot op= pop`, in float mode when `DX` says so.
    fn inline(&mut self, op: InlineOp, indirect: bool, level: i64, offset: i64) -> Step {
        let v = self.pop()?;
        let mut addr = self.slot(level, offset)?;
        if indirect {
            addr = self.load(addr)?;
        }
        let current = self.load(addr)?;
        let float_mode = self.regs[DX as usize] & FLAG_FLOAT != 0;
        let result = if float_mode {
            let fop = match op {
                InlineOp::Add => FloatOp::Add,
                InlineOp::Sub => FloatOp::Sub,
                InlineOp::Mul => FloatOp::Mul,
                InlineOp::Div => FloatOp::Div,
                other => {
                    return Err(RuntimeErrorKind::BadInstruction(format!(
                        "{:?} in float mode",
                        other
                    )));
                }
            };
            fop.apply(current, v).ok_or(RuntimeErrorKind::DivideByZero)?
        } else {
            let iop = match op {
                InlineOp::Shl => IntOp::Shl,
                InlineOp::Shr => IntOp::Shr,
                InlineOp::Add => IntOp::Add,
                InlineOp::Sub => IntOp::Sub,
                InlineOp::Mul => IntOp::Mul,
                InlineOp::Div => IntOp::Div,
                InlineOp::Xor => IntOp::Xor,
                InlineOp::Or => IntOp::Bor,
                InlineOp::And => IntOp::And,
            };
            iop.apply(current, v).ok_or(RuntimeErrorKind::DivideByZero)?
        };
        self.store(addr, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::op::float_word;

    fn ins(op: Opcode, level: i64, value: i64) -> Instruction {
        Instruction::new(op, level, value)
    }

    fn ret() -> Instruction {
        Instruction::opr(IntOp::Return)
    }

    /// Wraps `body` as a root frame with one variable at slot 3 that
    /// leaves its result in AX.
    fn program(body: Vec<Instruction>) -> Vec<Instruction> {
        let mut code = vec![ins(Opcode::Inc, 0, 4)];
        code.extend(body);
        code.push(ins(Opcode::Pop, 0, AX));
        code.push(ret());
        code
    }

    fn run_code(code: &[Instruction]) -> Result<RunSummary, RuntimeError> {
        let mut machine = Machine::new(MachineConfig::default());
        let mut out = Vec::new();
        machine.run(code, &mut out, &mut std::io::empty())
    }

    fn assert_result(body: Vec<Instruction>, expected: i64) {
        let summary = run_code(&program(body)).unwrap();
        assert_eq!(summary.exit_code, expected);
    }

    fn assert_error(body: Vec<Instruction>, expected: RuntimeErrorKind) {
        let err = run_code(&program(body)).unwrap_err();
        assert_eq!(err.kind, expected);
    }

    #[test]
    fn test_arithmetic() {
        assert_result(
            vec![
                ins(Opcode::Lit, 0, 6),
                ins(Opcode::Lit, 0, 7),
                Instruction::opr(IntOp::Mul),
            ],
            42,
        );
    }

    #[test]
    fn test_int_divide_by_zero() {
        assert_error(
            vec![
                ins(Opcode::Lit, 0, 1),
                ins(Opcode::Lit, 0, 0),
                Instruction::opr(IntOp::Div),
            ],
            RuntimeErrorKind::DivideByZero,
        );
    }

    #[test]
    fn test_float_divide_by_zero() {
        assert_error(
            vec![
                ins(Opcode::Lit, 0, float_word(1.0)),
                ins(Opcode::Lit, 0, float_word(0.0)),
                Instruction::fop(FloatOp::Div),
            ],
            RuntimeErrorKind::DivideByZero,
        );
    }

    #[test]
    fn test_call_and_return_value() {
        // 0 INC 3 / 1 LIT 0 / 2 CAL 0 5 / 3 POP AX / 4 RET
        // 5 INC 3 / 6 LIT 9 / 7 SRV 0 1 / 8 RET
        let code = vec![
            ins(Opcode::Inc, 0, 3),
            ins(Opcode::Lit, 0, 0),
            ins(Opcode::Cal, 0, 5),
            ins(Opcode::Pop, 0, AX),
            ret(),
            ins(Opcode::Inc, 0, 3),
            ins(Opcode::Lit, 0, 9),
            ins(Opcode::Srv, 0, 1),
            ret(),
        ];
        assert_eq!(run_code(&code).unwrap().exit_code, 9);
    }

    #[test]
    fn test_null_function_value() {
        assert_error(
            vec![ins(Opcode::Lit, 0, 0), ins(Opcode::Cas, 0, 0)],
            RuntimeErrorKind::NullFunction,
        );
    }

    #[test]
    fn test_inline_float_mode() {
        assert_result(
            vec![
                ins(Opcode::Lit, 0, float_word(1.5)),
                ins(Opcode::Sto, 0, 3),
                ins(Opcode::Srg, FLAG_FLOAT, DX),
                ins(Opcode::Lit, 0, float_word(2.0)),
                ins(Opcode::Imu, 0, 3),
                ins(Opcode::Srg, 0, DX),
                ins(Opcode::Lod, 0, 3),
                Instruction::fop(FloatOp::Int),
            ],
            3,
        );
    }

    #[test]
    fn test_heap_store_and_load() {
        assert_result(
            vec![
                ins(Opcode::Lit, 0, 2),
                ins(Opcode::Mal, 0, 0),
                ins(Opcode::Srg, 5, CX),
                ins(Opcode::Lit, 0, 77),
                ins(Opcode::Mss, 0, 0),
                ins(Opcode::Mls, 0, 0),
                ins(Opcode::Sws, 0, 0),
                ins(Opcode::Sys, 0, Native::MemoryRelease.code()),
            ],
            77,
        );
    }

    #[test]
    fn test_leak_is_reported() {
        let code = program(vec![ins(Opcode::Lit, 0, 3), ins(Opcode::Mal, 0, 0)]);
        let summary = run_code(&code).unwrap();
        assert_eq!(summary.leaks.len(), 1);
        assert_eq!(summary.leaks[0].length, 3);
    }

    #[test]
    fn test_stack_overflow() {
        // every frame calls the next one
        let code = vec![
            ins(Opcode::Inc, 0, 3),
            ins(Opcode::Cal, 0, 2),
            ins(Opcode::Inc, 0, 3),
            ins(Opcode::Cal, 0, 2),
        ];
        let err = run_code(&code).unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::StackOverflow);
    }

    #[test]
    fn test_unresolved_operand_is_rejected() {
        let mut code = program(vec![]);
        code.insert(
            1,
            Instruction {
                op: Opcode::Cal,
                level: 0,
                operand: Operand::Unresolved(crate::bytecode::op::SymbolId(0)),
            },
        );
        let err = run_code(&code).unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::Unresolved(1));
    }

    #[test]
    fn test_step_limit() {
        let code = vec![ins(Opcode::Inc, 0, 3), ins(Opcode::Jmp, 0, 1)];
        let mut machine = Machine::new(MachineConfig {
            max_steps: Some(100),
            ..MachineConfig::default()
        });
        let err = machine
            .run(&code, &mut Vec::new(), &mut std::io::empty())
            .unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::StepLimit(100));
    }
}
