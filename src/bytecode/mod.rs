pub mod compile;
pub mod compile_error;
pub mod disasm;
pub mod ir;
pub mod op;
pub mod optimize;

pub use compile::{CompileOptions, CompileOutput, ReleaseGuard, compile_file, compile_source};
pub use ir::Module;
pub use op::{Instruction, Opcode};
