use thiserror::Error;

/// Conditions that stop the machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeErrorKind {
    #[error("division by zero")]
    DivideByZero,
    #[error("null handle")]
    NullHandle,
    #[error("invalid handle {0}")]
    InvalidHandle(i64),
    #[error("call through a null function pointer")]
    NullFunction,
    #[error("stack overflow")]
    StackOverflow,
    #[error("stack access out of range at {0}")]
    StackAccess(i64),
    #[error("handle table exhausted ({0} handles)")]
    HeapExhausted(usize),
    #[error("heap access out of range: handle {handle}, offset {offset}")]
    HeapAccess { handle: i64, offset: i64 },
    #[error("array index {index} out of bounds (length {length})")]
    IndexOutOfBounds { index: i64, length: i64 },
    #[error("file table exhausted ({0} files)")]
    FileTableFull(usize),
    #[error("invalid file {0}")]
    BadFile(i64),
    #[error("step limit of {0} exceeded")]
    StepLimit(u64),
    #[error("instruction {0} has an unresolved operand")]
    Unresolved(usize),
    #[error("invalid instruction: {0}")]
    BadInstruction(String),
    #[error("program counter {0} outside the code")]
    BadJump(i64),
    #[error("i/o error: {0}")]
    Io(String),
}

/// A fatal machine error with the instruction it happened at.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("runtime error at {pc:04}: {kind}")]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub pc: usize,
    pub context: Vec<String>,
}

impl RuntimeError {
    pub fn new(kind: RuntimeErrorKind, pc: usize) -> Self {
        RuntimeError {
            kind,
            pc,
            context: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: &str) -> Self {
        self.context.push(context.to_string());
        self
    }

    /// Error text followed by the context lines, innermost last.
    pub fn report(&self) -> String {
        let mut out = self.to_string();
        for (i, frame) in self.context.iter().rev().enumerate() {
            out.push_str(&format!("\n    {}: {}", i, frame));
        }
        out
    }
}

impl From<std::io::Error> for RuntimeErrorKind {
    fn from(err: std::io::Error) -> Self {
        RuntimeErrorKind::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_pc() {
        let err = RuntimeError::new(RuntimeErrorKind::DivideByZero, 12);
        assert_eq!(err.to_string(), "runtime error at 0012: division by zero");
    }

    #[test]
    fn test_context_is_reported() {
        let err = RuntimeError::new(RuntimeErrorKind::NullFunction, 3)
            .with_context("frame at 40")
            .with_context("frame at 10");
        let report = err.report();
        assert!(report.contains("null function pointer"));
        assert!(report.contains("0: frame at 10"));
        assert!(report.contains("1: frame at 40"));
    }
}
