//! P++: a one-pass compiler from P++ source to a compact stack bytecode,
//! and the machine that runs it.
//!
//! The pipeline is [`lexer`] → [`parser`] → [`bytecode::compile`], which
//! resolves names and types, inserts conversions and emits instructions
//! through the peephole optimizer in a single walk. The resulting
//! [`bytecode::Module`] runs on [`runtime::Machine`].

pub mod ast;
pub mod bytecode;
pub mod lang;
pub mod lexer;
pub mod logging;
pub mod parser;
pub mod parser_error;
pub mod runtime;
pub mod token;
