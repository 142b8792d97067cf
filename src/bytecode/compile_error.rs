use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// Everything the compiler can complain about. `code()` gives the stable
/// number printed in diagnostics.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileErrorKind {
    #[error("{message}")]
    Lexical { code: u32, message: String },
    #[error("{message}")]
    Syntax { code: u32, message: String },

    #[error("undeclared identifier '{0}'")]
    Undeclared(String),
    #[error("'{0}' cannot be used as a value")]
    NotAValue(String),
    #[error("'{0}' is not a function")]
    NotCallable(String),
    #[error("'{0}' is already declared in this block")]
    Redeclared(String),
    #[error("label '{0}' is already defined")]
    DuplicateLabel(String),
    #[error("unknown type '{0}'")]
    UnknownType(String),
    #[error("array size must be a positive integer constant")]
    BadArraySize,
    #[error("'{0}' cannot have type void")]
    VoidVariable(String),
    #[error("'{0}' is not an array")]
    NotAnArray(String),

    #[error("'{name}' takes {expected} argument(s), {found} given")]
    ArgumentCount {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("missing argument '{param}' in call to '{name}'")]
    MissingArgument { name: String, param: String },
    #[error("argument for reference parameter '{0}' must be a variable")]
    ByRefNotVariable(String),

    #[error("'return' in function '{0}' needs a value")]
    ReturnNeedsValue(String),
    #[error("procedure '{0}' cannot return a value")]
    ReturnInProcedure(String),
    #[error("{0} has no value")]
    NoValue(String),
    #[error("cannot assign to '{0}'")]
    NotAssignable(String),
    #[error("cannot assign to constant '{0}'")]
    AssignToConstant(String),

    #[error("an integer can only be used as an array when it is a handle")]
    IntegerAsArray,
    #[error("cannot convert between a function and {0}")]
    FunctionCast(String),
    #[error("cannot convert {from} to {to}")]
    InvalidCast { from: String, to: String },
    #[error("function signatures do not match")]
    SignatureMismatch,
    #[error("only a variable can be passed as a handle")]
    HandleTemporary,
    #[error("'%' is not defined for floats")]
    FloatModulo,
    #[error("arrays cannot be compared with '{0}'")]
    ArrayOrdering(String),

    #[error("condition is always {0}")]
    ConstantCondition(bool),
    #[error("expression of unknown type treated as integer")]
    UnknownKind,

    #[error("{0} has no matching target")]
    OrphanedJump(String),
    #[error("'{0}' is declared but never defined")]
    NeverDefined(String),
    #[error("definition of '{0}' does not match its declaration")]
    DeclarationMismatch(String),
    #[error("no 'main' function")]
    MissingMain,
    #[error("'main' must be 'function main(): integer' or 'function main(args: string): integer'")]
    BadMain,
    #[error("runtime routine '{0}' is not available")]
    MissingRoutine(String),

    #[error("initializer of '{0}' must be a constant")]
    NonConstantInit(String),
    #[error("expression is not a compile-time constant")]
    NotConstant,
    #[error("parameter '{0}' needs a default because an earlier one has one")]
    DefaultOrder(String),
    #[error("include file '{0}' not found")]
    IncludeNotFound(String),
    #[error("cannot read '{path}': {message}")]
    IncludeIo { path: String, message: String },
    #[error("unknown pragma '{0}'")]
    UnknownPragma(String),

    #[error("program exceeds {0} instructions")]
    TooManyInstructions(usize),
    #[error("more than {0} identifiers")]
    TooManyIdentifiers(usize),
    #[error("nesting deeper than {0} levels")]
    TooDeep(usize),
}

impl CompileErrorKind {
    pub fn code(&self) -> u32 {
        use CompileErrorKind::*;
        match self {
            Lexical { code, .. } | Syntax { code, .. } => *code,
            Undeclared(_) => 4000,
            NotAValue(_) => 4005,
            NotCallable(_) => 4006,
            Redeclared(_) => 4010,
            DuplicateLabel(_) => 4011,
            UnknownType(_) => 4020,
            BadArraySize => 4021,
            VoidVariable(_) => 4022,
            NotAnArray(_) => 4030,
            ArgumentCount { .. } => 11001,
            MissingArgument { .. } => 10570,
            ByRefNotVariable(_) => 11061,
            ReturnNeedsValue(_) => 11030,
            ReturnInProcedure(_) => 11031,
            NoValue(_) => 11040,
            NotAssignable(_) => 11060,
            AssignToConstant(_) => 11062,
            IntegerAsArray => 11080,
            FunctionCast(_) => 12000,
            InvalidCast { .. } => 12001,
            SignatureMismatch => 12002,
            HandleTemporary => 10550,
            FloatModulo => 13000,
            ArrayOrdering(_) => 13001,
            ConstantCondition(_) => 11100,
            UnknownKind => 12010,
            OrphanedJump(_) => 11600,
            NeverDefined(_) => 15100,
            DeclarationMismatch(_) => 15101,
            MissingMain => 15500,
            BadMain => 15505,
            MissingRoutine(_) => 16000,
            NonConstantInit(_) => 10560,
            NotConstant => 10350,
            DefaultOrder(_) => 6610,
            IncludeNotFound(_) => 14000,
            IncludeIo { .. } => 14001,
            UnknownPragma(_) => 6500,
            TooManyInstructions(_) => 20000,
            TooManyIdentifiers(_) => 20001,
            TooDeep(_) => 20002,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            CompileErrorKind::ConstantCondition(_) | CompileErrorKind::UnknownKind => {
                Severity::Warning
            }
            _ => Severity::Error,
        }
    }
}

/// One reported problem with its location.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub kind: CompileErrorKind,
    pub file: String,
    pub line: usize,
    pub col: usize,
    /// The offending source line, when it is known.
    pub source_line: Option<String>,
}

impl Diagnostic {
    pub fn code(&self) -> u32 {
        self.kind.code()
    }

    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }

    pub fn is_error(&self) -> bool {
        self.severity() == Severity::Error
    }

    /// Multi-line form: the source line, a caret under the column (the
    /// padding copies the line's tabs so the caret lines up), the code and
    /// location, then the message.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(line) = &self.source_line {
            out.push_str(line);
            out.push('\n');
            let pad: String = line
                .chars()
                .take(self.col.saturating_sub(1))
                .map(|c| if c == '\t' { '\t' } else { ' ' })
                .collect();
            out.push_str(&pad);
            out.push_str("^\n");
        }
        let label = match self.severity() {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        out.push_str(&format!(
            "<{} {} in file [{}], line ~{}>\n[{}]",
            label,
            self.code(),
            self.file,
            self.line,
            self.kind
        ));
        out
    }
}

impl fmt::Display for Diagnostic {
    /// Formats as `file:line:col: error N: message`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.severity() {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(
            f,
            "{}:{}:{}: {} {}: {}",
            self.file,
            self.line,
            self.col,
            label,
            self.code(),
            self.kind
        )
    }
}

/// Returned when a compilation produced at least one error. Warnings
/// collected along the way are included.
#[derive(Debug, Clone, Error)]
#[error("compilation failed with {errors} error(s)")]
pub struct CompileFailure {
    pub errors: usize,
    pub diagnostics: Vec<Diagnostic>,
}

impl CompileFailure {
    pub fn new(diagnostics: Vec<Diagnostic>) -> Self {
        let errors = diagnostics.iter().filter(|d| d.is_error()).count();
        CompileFailure {
            errors,
            diagnostics,
        }
    }

    pub fn error_count(&self) -> usize {
        self.errors
    }

    pub fn codes(&self) -> Vec<u32> {
        self.diagnostics
            .iter()
            .filter(|d| d.is_error())
            .map(Diagnostic::code)
            .collect()
    }

    pub fn render(&self) -> String {
        self.diagnostics
            .iter()
            .map(Diagnostic::render)
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diag(kind: CompileErrorKind, line: &str, col: usize) -> Diagnostic {
        Diagnostic {
            kind,
            file: "main.ppp".to_string(),
            line: 7,
            col,
            source_line: Some(line.to_string()),
        }
    }

    #[test]
    fn test_codes_and_severity() {
        assert_eq!(CompileErrorKind::Undeclared("x".into()).code(), 4000);
        assert_eq!(CompileErrorKind::OrphanedJump("exit".into()).code(), 11600);
        assert_eq!(
            CompileErrorKind::ConstantCondition(true).severity(),
            Severity::Warning
        );
        assert_eq!(CompileErrorKind::SignatureMismatch.severity(), Severity::Error);
    }

    #[test]
    fn test_render_caret_mirrors_tabs() {
        let d = diag(CompileErrorKind::Undeclared("y".into()), "\tx := y;", 7);
        let text = d.render();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "\tx := y;");
        assert_eq!(lines[1], "\t     ^");
        assert_eq!(lines[2], "<error 4000 in file [main.ppp], line ~7>");
        assert_eq!(lines[3], "[undeclared identifier 'y']");
    }

    #[test]
    fn test_render_warning() {
        let d = diag(CompileErrorKind::ConstantCondition(false), "while 0 do", 7);
        assert!(d.render().contains("<warning 11100 in file [main.ppp], line ~7>"));
    }

    #[test]
    fn test_display_one_line() {
        let d = diag(CompileErrorKind::MissingMain, "", 1);
        assert_eq!(d.to_string(), "main.ppp:7:1: error 15500: no 'main' function");
    }

    #[test]
    fn test_failure_counts_errors_only() {
        let failure = CompileFailure::new(vec![
            diag(CompileErrorKind::UnknownKind, "", 1),
            diag(CompileErrorKind::BadArraySize, "", 1),
        ]);
        assert_eq!(failure.error_count(), 1);
        assert_eq!(failure.codes(), vec![4021]);
        assert_eq!(failure.to_string(), "compilation failed with 1 error(s)");
    }
}
