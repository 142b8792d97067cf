//! Peephole optimizer.
//!
//! Every instruction the compiler emits goes through [`push`], which
//! appends it and then applies [`rewrite_tail`] until nothing changes. A
//! rule only looks at the last few instructions, and only at those at or
//! after the *barrier*: the compiler raises the barrier whenever it records
//! an instruction index (a jump target, a slot to patch later), so rewrites
//! never move code somebody points at.
//!
//! Rules never fold division or modulo (division by zero must stay a
//! runtime error) and never touch an unresolved operand.

use crate::bytecode::op::{FloatOp, Instruction, IntOp, Opcode, Operand};

/// Individually togglable rewrite rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rules {
    /// Literal operands followed by an operator become one literal.
    pub fold_constants: bool,
    /// Repeated literal pushes become one `LIS`.
    pub merge_literals: bool,
    /// Adjacent `INC`/`DEC` merge or cancel; pushes followed by pops vanish.
    pub stack_adjust: bool,
    /// `x + 0`, `x * 1` and `x * 0` need no arithmetic.
    pub identities: bool,
    /// Two plain loads followed by `SWS` are emitted in swapped order.
    pub static_swap: bool,
    /// A jump to the very next instruction is dropped.
    pub jump_to_next: bool,
    /// Self-calls in tail position reuse the frame.
    pub tail_calls: bool,
}

impl Default for Rules {
    fn default() -> Self {
        Rules {
            fold_constants: true,
            merge_literals: true,
            stack_adjust: true,
            identities: true,
            static_swap: true,
            jump_to_next: true,
            tail_calls: true,
        }
    }
}

impl Rules {
    pub fn none() -> Self {
        Rules {
            fold_constants: false,
            merge_literals: false,
            stack_adjust: false,
            identities: false,
            static_swap: false,
            jump_to_next: false,
            tail_calls: false,
        }
    }
}

/// Appends `ins` and rewrites the tail until it is stable.
pub fn push(code: &mut Vec<Instruction>, barrier: usize, rules: &Rules, ins: Instruction) {
    code.push(ins);
    while rewrite_tail(code, barrier, rules) {}
}

/// Applies the first matching rule to the tail. Returns whether anything
/// changed.
pub fn rewrite_tail(code: &mut Vec<Instruction>, barrier: usize, rules: &Rules) -> bool {
    let len = code.len();
    if len == 0 || len - 1 < barrier {
        return false;
    }
    let last = code[len - 1];
    if !matches!(last.operand, Operand::Value(_)) {
        return false;
    }

    match last.op {
        Opcode::Opr if rules.fold_constants || rules.identities => {
            let Some(op) = last.int_op() else {
                return false;
            };
            (rules.fold_constants && fold_int(code, barrier, op))
                || (rules.identities && int_identity(code, barrier, rules, op))
        }
        Opcode::Fop if rules.fold_constants => match last.float_op() {
            Some(op) => fold_float(code, barrier, op),
            None => false,
        },
        Opcode::Lit | Opcode::Sld if rules.merge_literals => merge_literals(code, barrier),
        Opcode::Inc | Opcode::Dec if rules.stack_adjust => adjust_stack(code, barrier),
        Opcode::Sws if rules.static_swap => static_swap(code, barrier),
        Opcode::Jmp if rules.jump_to_next => {
            if last.value() == Some(len as i64) {
                code.pop();
                true
            } else {
                false
            }
        }
        _ => false,
    }
}

/// The literal the stream ends with, when a conditional jump is about to
/// test a value known at compile time.
pub fn constant_condition(code: &[Instruction], barrier: usize) -> Option<i64> {
    let last = code.last()?;
    if code.len() - 1 >= barrier && last.is_lit() {
        last.value()
    } else {
        None
    }
}

// =============================================================================
// Literal runs
// =============================================================================

/// The `needed` values pushed by the literal instructions that end at
/// `end`, bottom first. Also returns where the run starts and how many
/// copies stay behind in a partially consumed `LIS`.
struct LiteralRun {
    values: Vec<i64>,
    start: usize,
    leftover: i64,
}

fn literal_run(code: &[Instruction], barrier: usize, end: usize, needed: usize) -> Option<LiteralRun> {
    let mut values = Vec::with_capacity(needed);
    let mut i = end;
    let mut leftover = 0;
    while values.len() < needed {
        if i == 0 || i - 1 < barrier {
            return None;
        }
        i -= 1;
        let ins = code[i];
        let value = ins.value()?;
        match ins.op {
            Opcode::Lit => values.push(value),
            Opcode::Lis if ins.level > 0 => {
                let want = (needed - values.len()) as i64;
                let take = want.min(ins.level);
                for _ in 0..take {
                    values.push(value);
                }
                leftover = ins.level - take;
            }
            _ => return None,
        }
    }
    values.reverse();
    Some(LiteralRun {
        values,
        start: i,
        leftover,
    })
}

fn replace_run(code: &mut Vec<Instruction>, run: &LiteralRun, result: i64) {
    let keep = code[run.start];
    code.truncate(run.start);
    match run.leftover {
        0 => {}
        1 => code.push(Instruction::op(Opcode::Lit, keep.value().unwrap_or(0))),
        n => code.push(Instruction::new(Opcode::Lis, n, keep.value().unwrap_or(0))),
    }
    code.push(Instruction::op(Opcode::Lit, result));
}

fn fold_int(code: &mut Vec<Instruction>, barrier: usize, op: IntOp) -> bool {
    let end = code.len() - 1;
    if matches!(op, IntOp::Div | IntOp::Mod | IntOp::Return) {
        return false;
    }
    if op.is_unary() {
        let Some(run) = literal_run(code, barrier, end, 1) else {
            return false;
        };
        let result = op.apply_unary(run.values[0]);
        replace_run(code, &run, result);
        return true;
    }
    let Some(run) = literal_run(code, barrier, end, 2) else {
        return false;
    };
    let Some(result) = op.apply(run.values[0], run.values[1]) else {
        return false;
    };
    replace_run(code, &run, result);
    true
}

fn fold_float(code: &mut Vec<Instruction>, barrier: usize, op: FloatOp) -> bool {
    let end = code.len() - 1;
    if op == FloatOp::Div {
        return false;
    }
    if op.is_unary() {
        let Some(run) = literal_run(code, barrier, end, 1) else {
            return false;
        };
        let result = op.apply_unary(run.values[0]);
        replace_run(code, &run, result);
        return true;
    }
    let Some(run) = literal_run(code, barrier, end, 2) else {
        return false;
    };
    let Some(result) = op.apply(run.values[0], run.values[1]) else {
        return false;
    };
    replace_run(code, &run, result);
    true
}

fn int_identity(code: &mut Vec<Instruction>, barrier: usize, rules: &Rules, op: IntOp) -> bool {
    let len = code.len();
    if len < 2 || len - 2 < barrier || !code[len - 2].is_lit() {
        return false;
    }
    let operand = code[len - 2].value().unwrap_or(-1);
    match (operand, op) {
        (0, IntOp::Add | IntOp::Sub | IntOp::Bor | IntOp::Xor | IntOp::Shl | IntOp::Shr)
        | (1, IntOp::Mul) => {
            code.truncate(len - 2);
            true
        }
        (0, IntOp::Mul | IntOp::And) => {
            code.truncate(len - 2);
            push(code, barrier, rules, Instruction::op(Opcode::Dec, 1));
            code.push(Instruction::op(Opcode::Lit, 0));
            true
        }
        _ => false,
    }
}

// =============================================================================
// Literal merging and stack adjustment
// =============================================================================

/// `(count, value)` when `ins` pushes `count` copies of one literal.
fn literal_copies(ins: &Instruction) -> Option<(i64, i64)> {
    let value = ins.value()?;
    match ins.op {
        Opcode::Lit => Some((1, value)),
        Opcode::Lis if ins.level > 0 => Some((ins.level, value)),
        _ => None,
    }
}

fn merge_literals(code: &mut Vec<Instruction>, barrier: usize) -> bool {
    let len = code.len();
    if len < 2 || len - 2 < barrier {
        return false;
    }
    let last = code[len - 1];
    let Some((count, value)) = literal_copies(&code[len - 2]) else {
        return false;
    };
    let same = match last.op {
        Opcode::Lit => last.value() == Some(value),
        Opcode::Sld => last.value() == Some(0),
        _ => false,
    };
    if !same {
        return false;
    }
    code.truncate(len - 2);
    code.push(Instruction::new(Opcode::Lis, count + 1, value));
    true
}

/// Instructions that push exactly one word and have no other effect.
fn is_pure_load(ins: &Instruction) -> bool {
    matches!(ins.operand, Operand::Value(_))
        && matches!(
            ins.op,
            Opcode::Lit | Opcode::Lod | Opcode::Lda | Opcode::Lid | Opcode::Sld | Opcode::Lfp
        )
}

fn signed_adjust(ins: &Instruction) -> Option<i64> {
    let value = ins.value()?;
    match ins.op {
        Opcode::Inc => Some(value),
        Opcode::Dec => Some(-value),
        _ => None,
    }
}

fn push_adjust(code: &mut Vec<Instruction>, net: i64) {
    if net > 0 {
        code.push(Instruction::op(Opcode::Inc, net));
    } else if net < 0 {
        code.push(Instruction::op(Opcode::Dec, -net));
    }
}

fn adjust_stack(code: &mut Vec<Instruction>, barrier: usize) -> bool {
    let len = code.len();
    let Some(delta) = signed_adjust(&code[len - 1]) else {
        return false;
    };
    if delta == 0 {
        code.pop();
        return true;
    }
    if len < 2 || len - 2 < barrier {
        return false;
    }
    let prev = code[len - 2];

    if let Some(prev_delta) = signed_adjust(&prev) {
        code.truncate(len - 2);
        push_adjust(code, prev_delta + delta);
        return true;
    }

    if delta < 0 {
        if let Some((count, value)) = literal_copies(&prev) {
            code.truncate(len - 2);
            let popped = -delta;
            if count > popped {
                let kept = count - popped;
                if kept == 1 {
                    code.push(Instruction::op(Opcode::Lit, value));
                } else {
                    code.push(Instruction::new(Opcode::Lis, kept, value));
                }
            } else {
                push_adjust(code, count - popped);
            }
            return true;
        }
        if is_pure_load(&prev) {
            code.truncate(len - 2);
            push_adjust(code, delta + 1);
            return true;
        }
    }
    false
}

fn static_swap(code: &mut Vec<Instruction>, barrier: usize) -> bool {
    let len = code.len();
    if len < 2 || len - 2 < barrier {
        return false;
    }
    if let Some((count, _)) = literal_copies(&code[len - 2]) {
        if count >= 2 {
            code.pop();
            return true;
        }
    }
    if len < 3 || len - 3 < barrier {
        return false;
    }
    let (a, b) = (code[len - 3], code[len - 2]);
    let swappable = |ins: &Instruction| {
        matches!(ins.operand, Operand::Value(_))
            && matches!(
                ins.op,
                Opcode::Lit | Opcode::Lod | Opcode::Lda | Opcode::Lid | Opcode::Lfp
            )
    };
    if !swappable(&a) || !swappable(&b) {
        return false;
    }
    code.truncate(len - 3);
    code.push(b);
    code.push(a);
    true
}

// =============================================================================
// Tail calls
// =============================================================================

/// Rewrites self-calls in tail position inside `start..epilogue` of the
/// function entered at `entry`. A tail call is the call instruction
/// followed by the result store (for functions) and then either the
/// epilogue itself or a jump to it. The parameter stores and the result
/// slot push before the call become `NOP`s, and the call becomes
/// `TAC n entry`, which moves the `n` argument words into the current
/// frame. Returns the number of calls converted.
pub fn convert_tail_calls(
    code: &mut [Instruction],
    start: usize,
    epilogue: usize,
    entry: usize,
    result_words: i64,
) -> usize {
    let mut converted = 0;
    for i in start..epilogue.min(code.len()) {
        let call = code[i];
        if call.op != Opcode::Cal || call.level != 1 || call.value() != Some(entry as i64) {
            continue;
        }

        let mut next = i + 1;
        if result_words > 0 {
            if next >= epilogue || code[next].op != Opcode::Srv {
                continue;
            }
            next += 1;
        }
        let in_tail = next == epilogue
            || (code[next].op == Opcode::Jmp && code[next].value() == Some(epilogue as i64));
        if !in_tail {
            continue;
        }

        let mut first = i;
        if result_words > 0 {
            if first == start || !(code[first - 1].op == Opcode::Lit && code[first - 1].value() == Some(0)) {
                continue;
            }
            first -= 1;
        }
        let mut args = 0;
        while first > start && code[first - 1].op == Opcode::Stp {
            first -= 1;
            args += 1;
        }

        for ins in &mut code[first..i] {
            *ins = Instruction::op(Opcode::Nop, 0);
        }
        code[i] = Instruction::new(Opcode::Tac, args, entry as i64);
        converted += 1;
    }
    converted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::op::{JumpClass, JumpTag, float_word};

    fn lit(v: i64) -> Instruction {
        Instruction::op(Opcode::Lit, v)
    }

    fn run(seq: &[Instruction]) -> Vec<Instruction> {
        let mut code = Vec::new();
        for ins in seq {
            push(&mut code, 0, &Rules::default(), *ins);
        }
        code
    }

    #[test]
    fn test_folds_binary_and_comparison() {
        assert_eq!(run(&[lit(2), lit(3), Instruction::opr(IntOp::Add)]), vec![lit(5)]);
        assert_eq!(run(&[lit(2), lit(3), Instruction::opr(IntOp::Les)]), vec![lit(1)]);
        assert_eq!(run(&[lit(6), Instruction::opr(IntOp::Neg)]), vec![lit(-6)]);
    }

    #[test]
    fn test_folds_through_lis() {
        // 3 * 3 arrives as LIS 2 3 before the operator
        assert_eq!(run(&[lit(3), lit(3), Instruction::opr(IntOp::Mul)]), vec![lit(9)]);
        // 7 7 7 + leaves one 7 behind
        let code = run(&[lit(7), lit(7), lit(7), Instruction::opr(IntOp::Add)]);
        assert_eq!(code, vec![lit(7), lit(14)]);
    }

    #[test]
    fn test_never_folds_division() {
        let seq = [lit(1), lit(0), Instruction::opr(IntOp::Div)];
        assert_eq!(run(&seq), seq.to_vec());
        let seq = [lit(5), lit(2), Instruction::opr(IntOp::Mod)];
        assert_eq!(run(&seq), seq.to_vec());
        let seq = [lit(float_word(1.0)), lit(float_word(0.0)), Instruction::fop(FloatOp::Div)];
        assert_eq!(run(&seq), seq.to_vec());
    }

    #[test]
    fn test_folds_floats() {
        let code = run(&[lit(float_word(1.5)), lit(float_word(2.0)), Instruction::fop(FloatOp::Mul)]);
        assert_eq!(code, vec![lit(float_word(3.0))]);
        let code = run(&[lit(4), Instruction::fop(FloatOp::Flo)]);
        assert_eq!(code, vec![lit(float_word(4.0))]);
    }

    #[test]
    fn test_zero_literals_become_lis() {
        let code = run(&[lit(0), lit(0), lit(0)]);
        assert_eq!(code, vec![Instruction::new(Opcode::Lis, 3, 0)]);
        let code = run(&[lit(4), Instruction::op(Opcode::Sld, 0)]);
        assert_eq!(code, vec![Instruction::new(Opcode::Lis, 2, 4)]);
    }

    #[test]
    fn test_stack_adjustments_cancel() {
        let inc = Instruction::op(Opcode::Inc, 3);
        let dec = Instruction::op(Opcode::Dec, 3);
        assert!(run(&[inc, dec]).is_empty());
        assert_eq!(
            run(&[Instruction::op(Opcode::Dec, 1), Instruction::op(Opcode::Dec, 2)]),
            vec![dec]
        );
        // push then pop
        assert!(run(&[Instruction::new(Opcode::Lod, 0, 3), Instruction::op(Opcode::Dec, 1)]).is_empty());
        assert_eq!(
            run(&[Instruction::new(Opcode::Lod, 0, 3), Instruction::op(Opcode::Dec, 2)]),
            vec![Instruction::op(Opcode::Dec, 1)]
        );
    }

    #[test]
    fn test_identities() {
        let load = Instruction::new(Opcode::Lod, 0, 4);
        assert_eq!(run(&[load, lit(0), Instruction::opr(IntOp::Add)]), vec![load]);
        assert_eq!(run(&[load, lit(1), Instruction::opr(IntOp::Mul)]), vec![load]);
        // x * 0 drops the load entirely
        assert_eq!(run(&[load, lit(0), Instruction::opr(IntOp::Mul)]), vec![lit(0)]);
    }

    #[test]
    fn test_static_swap() {
        let a = Instruction::new(Opcode::Lod, 0, 3);
        let b = Instruction::new(Opcode::Lod, 1, 5);
        assert_eq!(run(&[a, b, Instruction::op(Opcode::Sws, 0)]), vec![b, a]);
        // stack-relative loads are not moved
        let sld = Instruction::op(Opcode::Sld, 1);
        let seq = [a, sld, Instruction::op(Opcode::Sws, 0)];
        assert_eq!(run(&seq), seq.to_vec());
    }

    #[test]
    fn test_jump_to_next_dropped() {
        let code = run(&[lit(1), Instruction::op(Opcode::Jmp, 2)]);
        assert_eq!(code, vec![lit(1)]);
    }

    #[test]
    fn test_barrier_protects_recorded_code() {
        let mut code = vec![lit(2), lit(3)];
        push(&mut code, 2, &Rules::default(), Instruction::opr(IntOp::Add));
        assert_eq!(code.len(), 3);
    }

    #[test]
    fn test_unresolved_operands_untouched() {
        let pending = Instruction::pending(
            Opcode::Jmp,
            JumpTag {
                class: JumpClass::Return,
                depth: 1,
            },
        );
        let mut code = vec![lit(1)];
        push(&mut code, 0, &Rules::default(), pending);
        assert_eq!(code, vec![lit(1), pending]);
    }

    #[test]
    fn test_rules_can_be_disabled() {
        let seq = [lit(2), lit(3), Instruction::opr(IntOp::Add)];
        let mut code = Vec::new();
        for ins in seq {
            push(&mut code, 0, &Rules::none(), ins);
        }
        assert_eq!(code, seq.to_vec());
    }

    #[test]
    fn test_constant_condition() {
        assert_eq!(constant_condition(&[lit(1)], 0), Some(1));
        assert_eq!(constant_condition(&[lit(1)], 1), None);
        assert_eq!(constant_condition(&[Instruction::new(Opcode::Lod, 0, 3)], 0), None);
    }

    #[test]
    fn test_tail_call_conversion() {
        // entry 10: ... args; STP; STP; LIT 0; CAL 1 10; SRV 0 1; (epilogue at 17)
        let mut code = vec![Instruction::op(Opcode::Nop, 0); 10];
        code.extend([
            Instruction::new(Opcode::Lod, 0, 3),
            Instruction::new(Opcode::Lod, 0, 4),
            Instruction::op(Opcode::Stp, 4),
            Instruction::op(Opcode::Stp, 4),
            lit(0),
            Instruction::new(Opcode::Cal, 1, 10),
            Instruction::new(Opcode::Srv, 0, 1),
            Instruction::opr(IntOp::Return),
        ]);
        let converted = convert_tail_calls(&mut code, 10, 17, 10, 1);
        assert_eq!(converted, 1);
        assert_eq!(code[12].op, Opcode::Nop);
        assert_eq!(code[14].op, Opcode::Nop);
        assert_eq!(code[15], Instruction::new(Opcode::Tac, 2, 10));
    }

    #[test]
    fn test_non_tail_call_untouched() {
        let mut code = vec![
            lit(1),
            Instruction::op(Opcode::Stp, 4),
            lit(0),
            Instruction::new(Opcode::Cal, 1, 0),
            lit(1),
            Instruction::opr(IntOp::Add),
            Instruction::new(Opcode::Srv, 0, 1),
        ];
        let before = code.clone();
        assert_eq!(convert_tail_calls(&mut code, 0, 7, 0, 1), 0);
        assert_eq!(code, before);
    }
}
