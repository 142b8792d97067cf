use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// OPCODES - the compiler/machine contract
// =============================================================================

/// Machine opcodes. `code()` gives the numeric value used by legacy
/// headerless module files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    Nop,
    /// Push the operand.
    Lit,
    /// Integer operator; the operand selects an `IntOp`. `OPR 0 0` returns.
    Opr,
    /// Float operator; the operand selects a `FloatOp`.
    Fop,
    Lod,
    Sto,
    Cal,
    /// Tail call: reuse the current frame for the top `level` argument words.
    Tac,
    Inc,
    Jmp,
    /// Pop; jump when the popped word is zero.
    Jpc,
    /// Move the top word `operand` slots up and pop it (parameter store).
    Stp,
    Lid,
    Lda,
    Sid,
    Dec,
    Cai,
    Cii,
    /// Call the function value found under the arguments.
    Cas,
    /// Push a copy of the word `operand` below the top.
    Sld,
    Sws,
    /// Push `level` copies of the operand.
    Lis,
    Isl,
    Isr,
    Iad,
    Isu,
    Imu,
    Idi,
    Ixo,
    Ior,
    Ian,
    Izl,
    Izr,
    Iia,
    Iis,
    Iim,
    Iid,
    Iix,
    Iio,
    Iib,
    /// Store the top word into the result slot below the frame and pop.
    Srv,
    Mal,
    Mls,
    Mss,
    Mlo,
    Mst,
    Mli,
    Msi,
    Pop,
    Pus,
    Mov,
    Rio,
    Srg,
    /// Push a function value: address plus the static link for `level`.
    Lfp,
    /// Run a native routine.
    Sys,
}

impl Opcode {
    pub const ALL: [Opcode; 55] = [
        Opcode::Nop,
        Opcode::Lit,
        Opcode::Opr,
        Opcode::Fop,
        Opcode::Lod,
        Opcode::Sto,
        Opcode::Cal,
        Opcode::Tac,
        Opcode::Inc,
        Opcode::Jmp,
        Opcode::Jpc,
        Opcode::Stp,
        Opcode::Lid,
        Opcode::Lda,
        Opcode::Sid,
        Opcode::Dec,
        Opcode::Cai,
        Opcode::Cii,
        Opcode::Cas,
        Opcode::Sld,
        Opcode::Sws,
        Opcode::Lis,
        Opcode::Isl,
        Opcode::Isr,
        Opcode::Iad,
        Opcode::Isu,
        Opcode::Imu,
        Opcode::Idi,
        Opcode::Ixo,
        Opcode::Ior,
        Opcode::Ian,
        Opcode::Izl,
        Opcode::Izr,
        Opcode::Iia,
        Opcode::Iis,
        Opcode::Iim,
        Opcode::Iid,
        Opcode::Iix,
        Opcode::Iio,
        Opcode::Iib,
        Opcode::Srv,
        Opcode::Mal,
        Opcode::Mls,
        Opcode::Mss,
        Opcode::Mlo,
        Opcode::Mst,
        Opcode::Mli,
        Opcode::Msi,
        Opcode::Pop,
        Opcode::Pus,
        Opcode::Mov,
        Opcode::Rio,
        Opcode::Srg,
        Opcode::Lfp,
        Opcode::Sys,
    ];

    pub fn code(self) -> u32 {
        match self {
            Opcode::Nop => 0x0000,
            Opcode::Lit => 0x1000,
            Opcode::Opr => 0x1010,
            Opcode::Fop => 0x1015,
            Opcode::Lod => 0x1020,
            Opcode::Sto => 0x1030,
            Opcode::Cal => 0x1040,
            Opcode::Tac => 0x1045,
            Opcode::Inc => 0x1050,
            Opcode::Jmp => 0x1060,
            Opcode::Jpc => 0x1070,
            Opcode::Stp => 0x1090,
            Opcode::Lid => 0x10A0,
            Opcode::Lda => 0x10B0,
            Opcode::Sid => 0x10C0,
            Opcode::Dec => 0x10D0,
            Opcode::Cai => 0x10E0,
            Opcode::Cii => 0x10F0,
            Opcode::Cas => 0x1100,
            Opcode::Sld => 0x1110,
            Opcode::Sws => 0x1120,
            Opcode::Lis => 0x1130,
            Opcode::Lfp => 0x1140,
            Opcode::Isl => 0x2000,
            Opcode::Isr => 0x2010,
            Opcode::Iad => 0x2040,
            Opcode::Isu => 0x2050,
            Opcode::Imu => 0x2060,
            Opcode::Idi => 0x2070,
            Opcode::Ixo => 0x2080,
            Opcode::Ior => 0x2090,
            Opcode::Ian => 0x20A0,
            Opcode::Izl => 0x3000,
            Opcode::Izr => 0x3010,
            Opcode::Iia => 0x3020,
            Opcode::Iis => 0x3030,
            Opcode::Iim => 0x3040,
            Opcode::Iid => 0x3050,
            Opcode::Iix => 0x3060,
            Opcode::Iio => 0x3070,
            Opcode::Iib => 0x3080,
            Opcode::Srv => 0x5000,
            Opcode::Mal => 0xA000,
            Opcode::Mls => 0xA100,
            Opcode::Mss => 0xA110,
            Opcode::Mlo => 0xA120,
            Opcode::Mst => 0xA130,
            Opcode::Mli => 0xA140,
            Opcode::Msi => 0xA150,
            Opcode::Pop => 0xB000,
            Opcode::Pus => 0xB010,
            Opcode::Mov => 0xB020,
            Opcode::Rio => 0xB030,
            Opcode::Srg => 0xB050,
            Opcode::Sys => 0xE000,
        }
    }

    pub fn from_code(code: u32) -> Option<Opcode> {
        Opcode::ALL.iter().copied().find(|op| op.code() == code)
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Nop => "NOP",
            Opcode::Lit => "LIT",
            Opcode::Opr => "OPR",
            Opcode::Fop => "FOP",
            Opcode::Lod => "LOD",
            Opcode::Sto => "STO",
            Opcode::Cal => "CAL",
            Opcode::Tac => "TAC",
            Opcode::Inc => "INC",
            Opcode::Jmp => "JMP",
            Opcode::Jpc => "JPC",
            Opcode::Stp => "STP",
            Opcode::Lid => "LID",
            Opcode::Lda => "LDA",
            Opcode::Sid => "SID",
            Opcode::Dec => "DEC",
            Opcode::Cai => "CAI",
            Opcode::Cii => "CII",
            Opcode::Cas => "CAS",
            Opcode::Sld => "SLD",
            Opcode::Sws => "SWS",
            Opcode::Lis => "LIS",
            Opcode::Isl => "ISL",
            Opcode::Isr => "ISR",
            Opcode::Iad => "IAD",
            Opcode::Isu => "ISU",
            Opcode::Imu => "IMU",
            Opcode::Idi => "IDI",
            Opcode::Ixo => "IXO",
            Opcode::Ior => "IOR",
            Opcode::Ian => "IAN",
            Opcode::Izl => "IZL",
            Opcode::Izr => "IZR",
            Opcode::Iia => "IIA",
            Opcode::Iis => "IIS",
            Opcode::Iim => "IIM",
            Opcode::Iid => "IID",
            Opcode::Iix => "IIX",
            Opcode::Iio => "IIO",
            Opcode::Iib => "IIB",
            Opcode::Srv => "SRV",
            Opcode::Mal => "MAL",
            Opcode::Mls => "MLS",
            Opcode::Mss => "MSS",
            Opcode::Mlo => "MLO",
            Opcode::Mst => "MST",
            Opcode::Mli => "MLI",
            Opcode::Msi => "MSI",
            Opcode::Pop => "POP",
            Opcode::Pus => "PUS",
            Opcode::Mov => "MOV",
            Opcode::Rio => "RIO",
            Opcode::Srg => "SRG",
            Opcode::Lfp => "LFP",
            Opcode::Sys => "SYS",
        }
    }

    pub fn is_jump(self) -> bool {
        matches!(self, Opcode::Jmp | Opcode::Jpc)
    }

    /// Inline read-modify-write on a variable, direct or through a reference.
    pub fn inline_for(op: InlineOp, indirect: bool) -> Opcode {
        match (op, indirect) {
            (InlineOp::Shl, false) => Opcode::Isl,
            (InlineOp::Shr, false) => Opcode::Isr,
            (InlineOp::Add, false) => Opcode::Iad,
            (InlineOp::Sub, false) => Opcode::Isu,
            (InlineOp::Mul, false) => Opcode::Imu,
            (InlineOp::Div, false) => Opcode::Idi,
            (InlineOp::Xor, false) => Opcode::Ixo,
            (InlineOp::Or, false) => Opcode::Ior,
            (InlineOp::And, false) => Opcode::Ian,
            (InlineOp::Shl, true) => Opcode::Izl,
            (InlineOp::Shr, true) => Opcode::Izr,
            (InlineOp::Add, true) => Opcode::Iia,
            (InlineOp::Sub, true) => Opcode::Iis,
            (InlineOp::Mul, true) => Opcode::Iim,
            (InlineOp::Div, true) => Opcode::Iid,
            (InlineOp::Xor, true) => Opcode::Iix,
            (InlineOp::Or, true) => Opcode::Iio,
            (InlineOp::And, true) => Opcode::Iib,
        }
    }

    /// Decodes an inline opcode into (operation, indirect).
    pub fn inline_op(self) -> Option<(InlineOp, bool)> {
        let decoded = match self {
            Opcode::Isl => (InlineOp::Shl, false),
            Opcode::Isr => (InlineOp::Shr, false),
            Opcode::Iad => (InlineOp::Add, false),
            Opcode::Isu => (InlineOp::Sub, false),
            Opcode::Imu => (InlineOp::Mul, false),
            Opcode::Idi => (InlineOp::Div, false),
            Opcode::Ixo => (InlineOp::Xor, false),
            Opcode::Ior => (InlineOp::Or, false),
            Opcode::Ian => (InlineOp::And, false),
            Opcode::Izl => (InlineOp::Shl, true),
            Opcode::Izr => (InlineOp::Shr, true),
            Opcode::Iia => (InlineOp::Add, true),
            Opcode::Iis => (InlineOp::Sub, true),
            Opcode::Iim => (InlineOp::Mul, true),
            Opcode::Iid => (InlineOp::Div, true),
            Opcode::Iix => (InlineOp::Xor, true),
            Opcode::Iio => (InlineOp::Or, true),
            Opcode::Iib => (InlineOp::And, true),
            _ => return None,
        };
        Some(decoded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InlineOp {
    Shl,
    Shr,
    Add,
    Sub,
    Mul,
    Div,
    Xor,
    Or,
    And,
}

// =============================================================================
// Operators selected by OPR / FOP operands
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntOp {
    Return,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eql,
    Neq,
    Les,
    Leq,
    Gre,
    Grq,
    Shl,
    Shr,
    Bor,
    And,
    Xor,
    Odd,
    Neg,
    Not,
}

impl IntOp {
    const TABLE: [(IntOp, i64, &'static str); 20] = [
        (IntOp::Return, 0, "RET"),
        (IntOp::Add, 0x1010, "ADD"),
        (IntOp::Sub, 0x1020, "SUB"),
        (IntOp::Mul, 0x1030, "MUL"),
        (IntOp::Div, 0x1040, "DIV"),
        (IntOp::Mod, 0x1050, "MOD"),
        (IntOp::Eql, 0x1060, "EQL"),
        (IntOp::Neq, 0x1070, "NEQ"),
        (IntOp::Les, 0x1080, "LES"),
        (IntOp::Leq, 0x1090, "LEQ"),
        (IntOp::Gre, 0x1100, "GRE"),
        (IntOp::Grq, 0x1110, "GRQ"),
        (IntOp::Shl, 0x1120, "SHL"),
        (IntOp::Shr, 0x1130, "SHR"),
        (IntOp::Bor, 0x1140, "BOR"),
        (IntOp::And, 0x1150, "AND"),
        (IntOp::Xor, 0x1160, "XOR"),
        (IntOp::Odd, 0x1170, "ODD"),
        (IntOp::Neg, 0x1180, "NEG"),
        (IntOp::Not, 0x1190, "NOT"),
    ];

    pub fn code(self) -> i64 {
        IntOp::TABLE
            .iter()
            .find(|(op, _, _)| *op == self)
            .map(|(_, code, _)| *code)
            .unwrap_or(0)
    }

    pub fn from_code(code: i64) -> Option<IntOp> {
        IntOp::TABLE
            .iter()
            .find(|(_, c, _)| *c == code)
            .map(|(op, _, _)| *op)
    }

    pub fn name(self) -> &'static str {
        IntOp::TABLE
            .iter()
            .find(|(op, _, _)| *op == self)
            .map(|(_, _, name)| *name)
            .unwrap_or("?")
    }

    pub fn is_unary(self) -> bool {
        matches!(self, IntOp::Odd | IntOp::Neg | IntOp::Not)
    }

    /// Evaluates a binary operator. `None` on division by zero.
    pub fn apply(self, a: i64, b: i64) -> Option<i64> {
        let value = match self {
            IntOp::Add => a.wrapping_add(b),
            IntOp::Sub => a.wrapping_sub(b),
            IntOp::Mul => a.wrapping_mul(b),
            IntOp::Div => {
                if b == 0 {
                    return None;
                }
                a.wrapping_div(b)
            }
            IntOp::Mod => {
                if b == 0 {
                    return None;
                }
                a.wrapping_rem(b)
            }
            IntOp::Eql => (a == b) as i64,
            IntOp::Neq => (a != b) as i64,
            IntOp::Les => (a < b) as i64,
            IntOp::Leq => (a <= b) as i64,
            IntOp::Gre => (a > b) as i64,
            IntOp::Grq => (a >= b) as i64,
            IntOp::Shl => shift_left(a, b),
            IntOp::Shr => shift_right(a, b),
            IntOp::Bor => a | b,
            IntOp::And => a & b,
            IntOp::Xor => a ^ b,
            IntOp::Odd => (a & 1 != 0) as i64,
            IntOp::Neg => a.wrapping_neg(),
            IntOp::Not => !a,
            IntOp::Return => return None,
        };
        Some(value)
    }

    pub fn apply_unary(self, a: i64) -> i64 {
        match self {
            IntOp::Odd => (a & 1 != 0) as i64,
            IntOp::Neg => a.wrapping_neg(),
            IntOp::Not => !a,
            _ => a,
        }
    }
}

pub fn shift_left(a: i64, b: i64) -> i64 {
    if (0..64).contains(&b) { a << b } else { 0 }
}

pub fn shift_right(a: i64, b: i64) -> i64 {
    if (0..64).contains(&b) {
        a >> b
    } else if a < 0 {
        -1
    } else {
        0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatOp {
    Add,
    Sub,
    Mul,
    Div,
    Eql,
    Neq,
    Les,
    Leq,
    Gre,
    Grq,
    /// Float to integer (truncating).
    Int,
    /// Integer to float.
    Flo,
    Neg,
}

impl FloatOp {
    const TABLE: [(FloatOp, i64, &'static str); 13] = [
        (FloatOp::Add, 0x1000, "ADD"),
        (FloatOp::Sub, 0x1010, "SUB"),
        (FloatOp::Mul, 0x1020, "MUL"),
        (FloatOp::Div, 0x1030, "DIV"),
        (FloatOp::Eql, 0x1040, "EQL"),
        (FloatOp::Neq, 0x1050, "NEQ"),
        (FloatOp::Les, 0x1060, "LES"),
        (FloatOp::Leq, 0x1070, "LEQ"),
        (FloatOp::Gre, 0x1080, "GRE"),
        (FloatOp::Grq, 0x1090, "GRQ"),
        (FloatOp::Int, 0x10A0, "INT"),
        (FloatOp::Flo, 0x10B0, "FLO"),
        (FloatOp::Neg, 0x10C0, "NEG"),
    ];

    pub fn code(self) -> i64 {
        FloatOp::TABLE
            .iter()
            .find(|(op, _, _)| *op == self)
            .map(|(_, code, _)| *code)
            .unwrap_or(0)
    }

    pub fn from_code(code: i64) -> Option<FloatOp> {
        FloatOp::TABLE
            .iter()
            .find(|(_, c, _)| *c == code)
            .map(|(op, _, _)| *op)
    }

    pub fn name(self) -> &'static str {
        FloatOp::TABLE
            .iter()
            .find(|(op, _, _)| *op == self)
            .map(|(_, _, name)| *name)
            .unwrap_or("?")
    }

    pub fn is_unary(self) -> bool {
        matches!(self, FloatOp::Int | FloatOp::Flo | FloatOp::Neg)
    }

    /// Binary float operator on raw words. `None` on division by zero.
    pub fn apply(self, a: i64, b: i64) -> Option<i64> {
        let (x, y) = (f64::from_bits(a as u64), f64::from_bits(b as u64));
        let value = match self {
            FloatOp::Add => float_word(x + y),
            FloatOp::Sub => float_word(x - y),
            FloatOp::Mul => float_word(x * y),
            FloatOp::Div => {
                if y == 0.0 {
                    return None;
                }
                float_word(x / y)
            }
            FloatOp::Eql => (x == y) as i64,
            FloatOp::Neq => (x != y) as i64,
            FloatOp::Les => (x < y) as i64,
            FloatOp::Leq => (x <= y) as i64,
            FloatOp::Gre => (x > y) as i64,
            FloatOp::Grq => (x >= y) as i64,
            FloatOp::Int | FloatOp::Flo | FloatOp::Neg => return None,
        };
        Some(value)
    }

    pub fn apply_unary(self, a: i64) -> i64 {
        match self {
            FloatOp::Int => f64::from_bits(a as u64) as i64,
            FloatOp::Flo => float_word(a as f64),
            FloatOp::Neg => float_word(-f64::from_bits(a as u64)),
            _ => a,
        }
    }
}

pub fn float_word(value: f64) -> i64 {
    value.to_bits() as i64
}

pub fn word_float(word: i64) -> f64 {
    f64::from_bits(word as u64)
}

// =============================================================================
// Registers
// =============================================================================

pub const REGISTER_COUNT: usize = 7;

/// Register 0 means "no register" for PUS/POP.
pub const AX: i64 = 1;
pub const BX: i64 = 2;
/// Memory offset used by the MLx/MSx instructions.
pub const CX: i64 = 3;
/// Operation mode flags.
pub const DX: i64 = 4;
pub const EX: i64 = 5;
pub const FX: i64 = 6;

/// DX flag: inline operations work on floats.
pub const FLAG_FLOAT: i64 = 0x1;

/// Words before the first element of a heap block.
pub const ARRAY_HEADER_SIZE: i64 = 4;
/// Header word holding the element count.
pub const ARRAY_LENGTH_OFFSET: i64 = 2;
/// Words of the frame header: static link, dynamic link, return address.
pub const FRAME_HEADER_SIZE: i64 = 3;

// =============================================================================
// Instructions and operands
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabelId(pub u32);

/// Construct an `exit`/`continue` names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Construct {
    For,
    Which,
    Repeat,
    While,
    Do,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JumpClass {
    Exit(Construct),
    ExitAny,
    Continue(Construct),
    ContinueAny,
    Return,
    Goto(LabelId),
}

/// A jump whose target is not known yet. `depth` counts how many more
/// matching boundaries it must cross before it resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JumpTag {
    pub class: JumpClass,
    pub depth: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    Value(i64),
    /// Address of a function whose body has not been placed yet.
    Unresolved(SymbolId),
    /// Jump awaiting its boundary.
    Pending(JumpTag),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub op: Opcode,
    pub level: i64,
    pub operand: Operand,
}

impl Instruction {
    pub fn new(op: Opcode, level: i64, value: i64) -> Self {
        Instruction {
            op,
            level,
            operand: Operand::Value(value),
        }
    }

    pub fn op(op: Opcode, value: i64) -> Self {
        Instruction::new(op, 0, value)
    }

    pub fn opr(op: IntOp) -> Self {
        Instruction::new(Opcode::Opr, 0, op.code())
    }

    pub fn fop(op: FloatOp) -> Self {
        Instruction::new(Opcode::Fop, 0, op.code())
    }

    pub fn pending(op: Opcode, tag: JumpTag) -> Self {
        Instruction {
            op,
            level: 0,
            operand: Operand::Pending(tag),
        }
    }

    /// The resolved operand, if it is one.
    pub fn value(&self) -> Option<i64> {
        match self.operand {
            Operand::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_lit(&self) -> bool {
        self.op == Opcode::Lit && self.value().is_some()
    }

    pub fn int_op(&self) -> Option<IntOp> {
        if self.op == Opcode::Opr {
            self.value().and_then(IntOp::from_code)
        } else {
            None
        }
    }

    pub fn float_op(&self) -> Option<FloatOp> {
        if self.op == Opcode::Fop {
            self.value().and_then(FloatOp::from_code)
        } else {
            None
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:>3} ", self.op.mnemonic(), self.level)?;
        match (self.op, self.operand) {
            (Opcode::Opr, Operand::Value(v)) => match IntOp::from_code(v) {
                Some(op) => write!(f, "{}", op.name()),
                None => write!(f, "{}", v),
            },
            (Opcode::Fop, Operand::Value(v)) => match FloatOp::from_code(v) {
                Some(op) => write!(f, "{}", op.name()),
                None => write!(f, "{}", v),
            },
            (_, Operand::Value(v)) => write!(f, "{}", v),
            (_, Operand::Unresolved(id)) => write!(f, "<symbol {}>", id.0),
            (_, Operand::Pending(tag)) => write!(f, "<{:?} {}>", tag.class, tag.depth),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_codes_round_trip() {
        for op in Opcode::ALL {
            assert_eq!(Opcode::from_code(op.code()), Some(op));
        }
        assert_eq!(Opcode::from_code(0x1FFF), None);
    }

    #[test]
    fn test_opcode_codes_are_unique() {
        let mut codes: Vec<u32> = Opcode::ALL.iter().map(|o| o.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), 55);
    }

    #[test]
    fn test_int_ops() {
        assert_eq!(IntOp::Add.apply(2, 3), Some(5));
        assert_eq!(IntOp::Div.apply(7, 0), None);
        assert_eq!(IntOp::Mod.apply(7, 0), None);
        assert_eq!(IntOp::Div.apply(i64::MIN, -1), Some(i64::MIN));
        assert_eq!(IntOp::Les.apply(1, 2), Some(1));
        assert_eq!(IntOp::Shl.apply(1, 70), Some(0));
        assert_eq!(IntOp::Neg.apply_unary(5), -5);
        assert_eq!(IntOp::from_code(IntOp::Xor.code()), Some(IntOp::Xor));
    }

    #[test]
    fn test_float_ops() {
        let a = float_word(1.5);
        let b = float_word(2.0);
        assert_eq!(word_float(FloatOp::Mul.apply(a, b).unwrap()), 3.0);
        assert_eq!(FloatOp::Div.apply(a, float_word(0.0)), None);
        assert_eq!(FloatOp::Les.apply(a, b), Some(1));
        assert_eq!(FloatOp::Int.apply_unary(float_word(-2.7)), -2);
        assert_eq!(word_float(FloatOp::Flo.apply_unary(3)), 3.0);
    }

    #[test]
    fn test_inline_op_mapping() {
        for indirect in [false, true] {
            for op in [
                InlineOp::Shl,
                InlineOp::Shr,
                InlineOp::Add,
                InlineOp::Sub,
                InlineOp::Mul,
                InlineOp::Div,
                InlineOp::Xor,
                InlineOp::Or,
                InlineOp::And,
            ] {
                assert_eq!(Opcode::inline_for(op, indirect).inline_op(), Some((op, indirect)));
            }
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(Instruction::opr(IntOp::Add).to_string(), "OPR   0 ADD");
        assert_eq!(Instruction::new(Opcode::Lod, 1, 3).to_string(), "LOD   1 3");
    }
}
