/// Generic syntax error: unexpected symbol or missing delimiter.
pub const ERR_SYNTAX: u32 = 6000;
/// `=` where an assignment was meant.
pub const ERR_EQ_AS_ASSIGN: u32 = 4800;
/// `exit`/`continue` with a count below one.
pub const ERR_BAD_JUMP_COUNT: u32 = 11610;

/// A parsing error with source location.
///
/// `line` and `col` are 1-based positions coming from the lexer spans.
/// For EOF-ish errors (e.g. missing `end`, `)`), the parser uses the last
/// consumed token's span as a fallback so locations are never `0:0`.
#[derive(Debug, Clone)]
pub struct ParserError {
    pub code: u32,
    pub message: String,
    pub line: usize,
    pub col: usize,
}

impl std::fmt::Display for ParserError {
    /// Formats as `line:col: message` for CLI-friendly diagnostics.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.col, self.message)
    }
}
