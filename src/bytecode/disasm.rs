use std::collections::BTreeSet;
use std::fmt::Write as _;

use crate::bytecode::ir::Module;
use crate::bytecode::op::{Instruction, Opcode, Operand, word_float};

/// Print disassembly of a module
pub fn print_module(name: &str, module: &Module) {
    print!("{}", render_module(name, module));
}

/// Header box followed by the listing.
pub fn render_module(name: &str, module: &Module) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "════════════════════════════════════════");
    let _ = writeln!(out, " {}", name);
    let _ = writeln!(out, " {} instructions, format v{}", module.len(), module.version);
    let _ = writeln!(out, "════════════════════════════════════════");
    out.push_str(&disassemble(&module.code));
    out
}

/// One line per instruction. Jump targets get a separator line and a `►`
/// marker; call targets are tagged as entries.
pub fn disassemble(code: &[Instruction]) -> String {
    let jump_targets = collect_jump_targets(code);
    let entries = collect_entries(code);
    let mut out = String::new();

    for (ip, ins) in code.iter().enumerate() {
        if jump_targets.contains(&ip) {
            let _ = writeln!(out, "      ┌──────────────────────────────────");
        }
        let marker = if jump_targets.contains(&ip) { "► " } else { "  " };
        let _ = write!(out, "{:04} {}{}", ip, marker, format_instruction(ins));
        if entries.contains(&ip) {
            let _ = write!(out, "    ; entry");
        }
        out.push('\n');
    }
    out
}

fn collect_jump_targets(code: &[Instruction]) -> BTreeSet<usize> {
    code.iter()
        .filter(|ins| ins.op.is_jump())
        .filter_map(|ins| ins.value())
        .filter_map(|v| usize::try_from(v).ok())
        .collect()
}

fn collect_entries(code: &[Instruction]) -> BTreeSet<usize> {
    code.iter()
        .filter(|ins| matches!(ins.op, Opcode::Cal | Opcode::Tac | Opcode::Lfp))
        .filter_map(|ins| ins.value())
        .filter_map(|v| usize::try_from(v).ok())
        .collect()
}

fn format_instruction(ins: &Instruction) -> String {
    let text = ins.to_string();
    // float literals are easier to read decoded
    match (ins.op, ins.operand) {
        (Opcode::Lit | Opcode::Lis, Operand::Value(v)) if looks_like_float(v) => {
            format!("{:<20}; {}", text, word_float(v))
        }
        (Opcode::Sys, Operand::Value(v)) => {
            match crate::runtime::natives::Native::from_code(v) {
                Some(native) => format!("{:<20}; {}", text, native.name()),
                None => text,
            }
        }
        _ => text,
    }
}

/// Large words whose float reading is a short finite number.
fn looks_like_float(word: i64) -> bool {
    if word.unsigned_abs() < 1 << 52 {
        return false;
    }
    let value = word_float(word);
    value.is_finite() && value != 0.0 && (1e-6..1e12).contains(&value.abs())
}
