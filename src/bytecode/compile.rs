//! One-pass code generation.
//!
//! A [`CompilationSession`] walks the parsed tree once, resolving names,
//! types, lexical levels and slots as it goes and appending instructions
//! through the peephole optimizer. Forward references never need a second
//! pass over the tree: calls to functions whose body is not placed yet carry
//! an `Operand::Unresolved` that is patched when the declaring block ends,
//! and `exit`/`continue`/`goto`/`return` carry an `Operand::Pending` tag that
//! is bound when the enclosing construct, label or function closes.
//!
//! Problems are collected as diagnostics and compilation carries on, so one
//! run reports as much as it can. [`CompilationSession::finish`] decides
//! whether the result is usable.

mod cast;
mod decls;
mod expr;
mod jumps;
mod stmt;
pub mod symbols;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::debug;

use crate::ast::Program;
use crate::bytecode::compile_error::{CompileErrorKind, CompileFailure, Diagnostic};
use crate::bytecode::ir::Module;
use crate::bytecode::op::{Instruction, Operand, SymbolId};
use crate::bytecode::optimize::{self, Rules};
use crate::lang::{FunctionDesc, Type};
use crate::lexer::{Lexer, Span};
use crate::parser::Parser;
use crate::runtime::natives::Native;
use symbols::{Address, BlockMark, Symbol, SymbolKind, SymbolTable};

/// Which array variables get a release at the end of their block.
///
/// `AsWritten` releases a variable whose usage counter is non-zero, i.e.
/// one that was initialized, assigned or passed by reference. That
/// balances the counting done here and is the default.
/// `OnlyUnreferenced` releases only variables whose counter stayed at
/// zero, so anything assigned is left to the leak report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReleaseGuard {
    #[default]
    AsWritten,
    OnlyUnreferenced,
}

impl ReleaseGuard {
    pub fn releases(self, refed: u32) -> bool {
        match self {
            ReleaseGuard::AsWritten => refed != 0,
            ReleaseGuard::OnlyUnreferenced => refed == 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub optimize: bool,
    pub bounds_check: bool,
    /// Pre-declare the native routines at level 0.
    pub natives: bool,
    pub release_guard: ReleaseGuard,
    /// Directories searched for include files after the including file's
    /// own directory and the working directory.
    pub search_path: Vec<PathBuf>,
    pub max_instructions: usize,
    pub max_identifiers: usize,
    pub max_level: usize,
    pub rules: Rules,
}

impl Default for CompileOptions {
    fn default() -> Self {
        let search_path = match std::env::var_os("PPP_SOURCE_PATH") {
            Some(paths) => std::env::split_paths(&paths).collect(),
            None => vec![PathBuf::from("./lib")],
        };
        CompileOptions {
            optimize: true,
            bounds_check: true,
            natives: true,
            release_guard: ReleaseGuard::default(),
            search_path,
            max_instructions: 0x50000,
            max_identifiers: 0x5000,
            max_level: 0x100,
            rules: Rules::default(),
        }
    }
}

/// A usable compilation: the module plus any warnings.
#[derive(Debug, Clone)]
pub struct CompileOutput {
    pub module: Module,
    pub warnings: Vec<Diagnostic>,
}

/// Compiles `source` as if it were the file `file_name`.
pub fn compile_source(
    source: &str,
    file_name: &str,
    options: &CompileOptions,
) -> Result<CompileOutput, CompileFailure> {
    let mut session = CompilationSession::new(options.clone());
    let dir = Path::new(file_name).parent().map(Path::to_path_buf);
    if let Some(program) = session.parse_source(source, file_name, dir) {
        session.compile_program(&program);
    }
    session.finish()
}

pub fn compile_file(path: &Path, options: &CompileOptions) -> Result<CompileOutput, CompileFailure> {
    let mut session = CompilationSession::new(options.clone());
    let name = path.display().to_string();
    match std::fs::read_to_string(path) {
        Ok(source) => {
            if let Ok(canonical) = path.canonicalize() {
                session.included.insert(canonical);
            }
            let dir = path.parent().map(Path::to_path_buf);
            if let Some(program) = session.parse_source(&source, &name, dir) {
                session.compile_program(&program);
            }
        }
        Err(e) => {
            let kind = if e.kind() == std::io::ErrorKind::NotFound {
                CompileErrorKind::IncludeNotFound(name)
            } else {
                CompileErrorKind::IncludeIo {
                    path: name,
                    message: e.to_string(),
                }
            };
            session.report(kind, Span { line: 0, col: 0 });
        }
    }
    session.finish()
}

// =============================================================================
// Session state
// =============================================================================

/// A problem tied to a source position, on its way to becoming a
/// [`Diagnostic`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Located {
    pub kind: CompileErrorKind,
    pub span: Span,
}

pub(crate) type CompileResult<T> = Result<T, Located>;

pub(crate) fn fail<T>(kind: CompileErrorKind, span: Span) -> CompileResult<T> {
    Err(Located { kind, span })
}

struct SourceFile {
    name: String,
    dir: Option<PathBuf>,
    lines: Vec<String>,
}

#[derive(Debug, Clone)]
struct Label {
    name: String,
    pos: Option<usize>,
    span: Span,
}

/// Code generation state of the function whose body is being compiled.
/// The root block counts as a function at level 0.
struct FunctionCtx {
    name: String,
    /// Level of parameters and locals.
    level: i64,
    desc: Rc<FunctionDesc>,
    entry: usize,
    body_start: usize,
    /// The `LIS` that reserves locals; its count is known only at the end.
    lis_index: usize,
    first_local: i64,
    next_slot: i64,
    mark: BlockMark,
    labels: Vec<Label>,
    /// Block-scoped variables whose block already ended but whose slot
    /// still owns a handle until the function returns.
    retired: Vec<Symbol>,
}

pub struct CompilationSession {
    options: CompileOptions,
    code: Vec<Instruction>,
    /// Instructions before this index are never rewritten.
    barrier: usize,
    /// Every index handed out as a jump or call target.
    targets: HashSet<usize>,
    symbols: SymbolTable,
    frames: Vec<FunctionCtx>,
    diagnostics: Vec<Diagnostic>,
    files: Vec<SourceFile>,
    file: usize,
    included: HashSet<PathBuf>,
    /// Where each pending jump came from, for orphan reports.
    jump_sites: HashMap<usize, (Span, usize)>,
    /// Calls and function values waiting for a body address.
    unresolved: Vec<(usize, SymbolId)>,
    /// Position of the statement being compiled.
    span: Span,
    code_full: bool,
}

impl CompilationSession {
    pub fn new(options: CompileOptions) -> Self {
        let mut session = CompilationSession {
            symbols: SymbolTable::new(options.max_identifiers),
            options,
            code: Vec::new(),
            barrier: 0,
            targets: HashSet::new(),
            frames: Vec::new(),
            diagnostics: Vec::new(),
            files: Vec::new(),
            file: 0,
            included: HashSet::new(),
            jump_sites: HashMap::new(),
            unresolved: Vec::new(),
            span: Span { line: 0, col: 0 },
            code_full: false,
        };
        if session.options.natives {
            session.declare_natives();
        }
        session
    }

    fn declare_natives(&mut self) {
        for (native, name) in Native::ALL {
            let symbol = Symbol::new(
                name,
                SymbolKind::Function,
                Type::Function(Rc::new(native.signature())),
                0,
                Address::Native(native),
            );
            if let Err(kind) = self.symbols.declare(symbol) {
                self.report(kind, Span { line: 0, col: 0 });
            }
        }
    }

    /// Lexes and parses one file and makes it the current file for
    /// diagnostics. `None` when it had lexical or syntax errors.
    fn parse_source(&mut self, source: &str, name: &str, dir: Option<PathBuf>) -> Option<Program> {
        self.files.push(SourceFile {
            name: name.to_string(),
            dir,
            lines: source.lines().map(str::to_string).collect(),
        });
        self.file = self.files.len() - 1;
        debug!(file = name, "parsing");

        let tokens = match Lexer::new(source).tokenize() {
            Ok(tokens) => tokens,
            Err(errors) => {
                for e in errors {
                    let span = Span { line: e.line, col: e.col };
                    self.report(
                        CompileErrorKind::Lexical {
                            code: e.code,
                            message: e.message,
                        },
                        span,
                    );
                }
                return None;
            }
        };
        match Parser::new(tokens).parse_program() {
            Ok(program) => Some(program),
            Err(errors) => {
                for e in errors {
                    let span = Span { line: e.line, col: e.col };
                    self.report(
                        CompileErrorKind::Syntax {
                            code: e.code,
                            message: e.message,
                        },
                        span,
                    );
                }
                None
            }
        }
    }

    /// The module, or every diagnostic when at least one is an error.
    pub fn finish(self) -> Result<CompileOutput, CompileFailure> {
        if self.diagnostics.iter().any(Diagnostic::is_error) {
            debug!(diagnostics = self.diagnostics.len(), "compilation failed");
            return Err(CompileFailure::new(self.diagnostics));
        }
        let module = Module::new(self.code);
        if let Err(e) = module.check_resolved() {
            let diag = Diagnostic {
                kind: CompileErrorKind::OrphanedJump(e.to_string()),
                file: String::new(),
                line: 0,
                col: 0,
                source_line: None,
            };
            return Err(CompileFailure::new(vec![diag]));
        }
        debug!(instructions = module.len(), "compilation finished");
        Ok(CompileOutput {
            module,
            warnings: self.diagnostics,
        })
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    fn report(&mut self, kind: CompileErrorKind, span: Span) {
        self.report_in(kind, span, self.file);
    }

    fn report_in(&mut self, kind: CompileErrorKind, span: Span, file: usize) {
        let (name, source_line) = match self.files.get(file) {
            Some(f) => (
                f.name.clone(),
                span.line
                    .checked_sub(1)
                    .and_then(|i| f.lines.get(i))
                    .cloned(),
            ),
            None => (String::new(), None),
        };
        let diag = Diagnostic {
            kind,
            file: name,
            line: span.line,
            col: span.col,
            source_line,
        };
        debug!(code = diag.code(), line = diag.line, error = diag.is_error(), "{}", diag.kind);
        self.diagnostics.push(diag);
    }

    fn report_located(&mut self, err: Located) {
        self.report(err.kind, err.span);
    }

    // ========================================================================
    // Emission
    // ========================================================================

    /// Appends through the optimizer.
    fn emit(&mut self, ins: Instruction) {
        if !self.has_room() {
            return;
        }
        if self.options.optimize {
            optimize::push(&mut self.code, self.barrier, &self.options.rules, ins);
        } else {
            self.code.push(ins);
        }
    }

    /// Appends untouched and protects it from later rewrites. Returns its
    /// index for patching.
    fn emit_fixed(&mut self, ins: Instruction) -> usize {
        if self.has_room() {
            self.code.push(ins);
        }
        self.barrier = self.code.len();
        self.code.len().saturating_sub(1)
    }

    /// Emits an instruction whose operand names a function without an
    /// address yet.
    fn emit_unresolved(&mut self, ins: Instruction, id: SymbolId) {
        let at = self.emit_fixed(ins);
        self.unresolved.push((at, id));
    }

    fn has_room(&mut self) -> bool {
        if self.code.len() < self.options.max_instructions {
            return true;
        }
        if !self.code_full {
            self.code_full = true;
            self.report(
                CompileErrorKind::TooManyInstructions(self.options.max_instructions),
                self.span,
            );
        }
        false
    }

    /// Index of the next instruction, recorded as a target.
    fn here(&mut self) -> usize {
        let at = self.code.len();
        self.barrier = at;
        self.targets.insert(at);
        at
    }

    fn patch(&mut self, at: usize, target: usize) {
        if let Some(ins) = self.code.get_mut(at) {
            ins.operand = Operand::Value(target as i64);
        }
    }

    // ========================================================================
    // Scope helpers
    // ========================================================================

    fn ctx(&self) -> Option<&FunctionCtx> {
        self.frames.last()
    }

    fn ctx_mut(&mut self) -> Option<&mut FunctionCtx> {
        self.frames.last_mut()
    }

    /// Level of code being compiled right now.
    fn level(&self) -> i64 {
        self.ctx().map(|c| c.level).unwrap_or(0)
    }

    /// Next free slot in the current frame.
    fn allocate_slot(&mut self) -> i64 {
        match self.ctx_mut() {
            Some(ctx) => {
                ctx.next_slot += 1;
                ctx.next_slot - 1
            }
            None => 0,
        }
    }

    fn declare(&mut self, symbol: Symbol, span: Span) -> CompileResult<SymbolId> {
        self.symbols
            .declare(symbol.with_span(span))
            .map_err(|kind| Located { kind, span })
    }

    fn lookup(&self, name: &str, span: Span) -> CompileResult<SymbolId> {
        match self.symbols.lookup(name) {
            Some(id) => Ok(id),
            None => fail(CompileErrorKind::Undeclared(name.to_string()), span),
        }
    }
}
