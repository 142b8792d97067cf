//! Command-line driver: compiles a P++ source file (or loads a saved
//! module) and runs it. The process exits with the value `main` returned.

use std::ffi::OsString;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser};
use thiserror::Error;
use tracing::debug;

use ppp::bytecode::compile_error::CompileFailure;
use ppp::bytecode::disasm::print_module;
use ppp::bytecode::ir::{Module, ModuleError};
use ppp::bytecode::{CompileOptions, compile_file};
use ppp::logging;
use ppp::runtime::{Machine, MachineConfig, RuntimeError};

/// Extension of saved modules; such files are loaded instead of compiled.
const MODULE_EXTENSION: &str = "pbc";

#[derive(Parser, Debug, Clone)]
#[command(
    name = "ppp",
    about = "P++ compiler and bytecode machine",
    version
)]
struct Cli {
    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
    /// Write the compiled module to this file
    #[arg(short = 'o', long)]
    write_module: Option<PathBuf>,
    /// Disable the peephole optimizer
    #[arg(long, default_value_t = false)]
    no_optimize: bool,
    /// Do not emit array bounds checks
    #[arg(long, default_value_t = false)]
    no_bounds_check: bool,
    /// Print the disassembly before running
    #[arg(short, long, default_value_t = false)]
    list: bool,
    /// Log every executed instruction with the top of the stack
    #[arg(short, long, default_value_t = false)]
    trace_stack: bool,
    /// Suppress warnings, the leak report and log output below errors
    #[arg(short, long, default_value_t = false)]
    quiet: bool,
    /// Do not print compile diagnostics or runtime error reports
    #[arg(short = 's', long, default_value_t = false)]
    suppress_errors: bool,
    /// Stop after compiling
    #[arg(short, long, default_value_t = false)]
    compile_only: bool,
    /// Include search path, separated like PATH
    #[arg(long, env = "PPP_SOURCE_PATH")]
    source_path: Option<OsString>,
    /// Log filter directive (trace|debug|info|warn|error or an EnvFilter)
    #[arg(long)]
    log_level: Option<String>,
    /// Source file, or a saved .pbc module
    file: PathBuf,
    /// Command line handed to `main(args: string)`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Compile(#[from] CompileFailure),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Module(#[from] ModuleError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    fn code(&self) -> i32 {
        match self {
            CliError::Compile(_) => 3,
            CliError::Runtime(_) => 4,
            CliError::Module(_) => 2,
            CliError::Io(_) => 5,
        }
    }

    fn report(&self) -> String {
        match self {
            CliError::Compile(failure) => format!("{}\n\n{}", failure.render(), failure),
            CliError::Runtime(err) => err.report(),
            other => other.to_string(),
        }
    }
}

impl Cli {
    fn log_filter(&self) -> Option<String> {
        if let Some(level) = &self.log_level {
            return Some(level.clone());
        }
        let base = match (self.verbose, self.quiet) {
            (0, false) => None,
            (0, true) => Some("error"),
            (1, _) => Some("debug"),
            (_, _) => Some("trace"),
        };
        if self.trace_stack {
            // stack trace lines are info events
            return Some(format!("{},ppp::vm=info", base.unwrap_or("warn")));
        }
        base.map(str::to_string)
    }

    fn compile_options(&self) -> CompileOptions {
        let mut options = CompileOptions {
            optimize: !self.no_optimize,
            bounds_check: !self.no_bounds_check,
            ..CompileOptions::default()
        };
        if let Some(paths) = &self.source_path {
            options.search_path = std::env::split_paths(paths).collect();
        }
        options
    }

    fn machine_config(&self) -> MachineConfig {
        MachineConfig {
            trace_stack: self.trace_stack,
            ..MachineConfig::default()
        }
    }
}

fn is_module_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(MODULE_EXTENSION)
}

fn load_or_compile(cli: &Cli) -> Result<Module, CliError> {
    if is_module_file(&cli.file) {
        debug!(path = %cli.file.display(), "loading module");
        return Ok(Module::load(&cli.file)?);
    }
    let output = compile_file(&cli.file, &cli.compile_options())?;
    if !cli.quiet && !cli.suppress_errors {
        for warning in &output.warnings {
            eprintln!("{}\n", warning.render());
        }
    }
    Ok(output.module)
}

fn try_main(cli: &Cli) -> Result<i32, CliError> {
    let module = load_or_compile(cli)?;

    if let Some(path) = &cli.write_module {
        module.save(path)?;
        debug!(path = %path.display(), "module written");
    }
    if cli.list {
        print_module(&cli.file.display().to_string(), &module);
    }
    if cli.compile_only {
        return Ok(0);
    }

    let mut machine = Machine::new(cli.machine_config()).with_command_line(&cli.args.join(" "));
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let stdin = io::stdin();
    let mut input = stdin.lock();
    let result = machine.run(&module.code, &mut out, &mut input);
    out.flush()?;
    let summary = result?;

    if !cli.quiet && !summary.leaks.is_empty() {
        eprintln!("{} handle(s) still allocated at exit", summary.leaks.len());
        for leak in &summary.leaks {
            eprintln!(
                "    handle {}: {} word(s), refcount {}",
                leak.handle, leak.length, leak.refcount
            );
        }
    }
    Ok(summary.exit_code as i32)
}

fn main() {
    let cli = Cli::parse();
    logging::init_with_level(cli.log_filter().as_deref());

    let code = match try_main(&cli) {
        Ok(code) => code,
        Err(e) => {
            if !cli.suppress_errors {
                eprintln!("{}", e.report());
            }
            e.code()
        }
    };

    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags_and_trailing_args() {
        let cli = Cli::try_parse_from([
            "ppp", "-q", "--no-optimize", "-l", "prog.ppp", "a", "-b", "c",
        ])
        .unwrap();
        assert!(cli.quiet);
        assert!(cli.list);
        assert!(!cli.compile_options().optimize);
        assert!(cli.compile_options().bounds_check);
        assert_eq!(cli.file, PathBuf::from("prog.ppp"));
        assert_eq!(cli.args.join(" "), "a -b c");
    }

    #[test]
    fn test_verbosity_maps_to_filter() {
        let cli = Cli::try_parse_from(["ppp", "-vv", "x.ppp"]).unwrap();
        assert_eq!(cli.log_filter().as_deref(), Some("trace"));
        let cli = Cli::try_parse_from(["ppp", "-v", "--log-level", "info", "x.ppp"]).unwrap();
        assert_eq!(cli.log_filter().as_deref(), Some("info"));
    }

    #[test]
    fn test_quiet_and_trace_adjust_filter() {
        let cli = Cli::try_parse_from(["ppp", "-q", "x.ppp"]).unwrap();
        assert_eq!(cli.log_filter().as_deref(), Some("error"));
        let cli = Cli::try_parse_from(["ppp", "-t", "x.ppp"]).unwrap();
        assert_eq!(cli.log_filter().as_deref(), Some("warn,ppp::vm=info"));
        let cli = Cli::try_parse_from(["ppp", "-s", "x.ppp"]).unwrap();
        assert!(cli.suppress_errors);
        assert_eq!(cli.log_filter(), None);
    }

    #[test]
    fn test_module_extension() {
        assert!(is_module_file(Path::new("out/prog.pbc")));
        assert!(!is_module_file(Path::new("prog.ppp")));
    }

    #[test]
    fn test_error_codes() {
        let failure = CliError::Compile(CompileFailure::new(Vec::new()));
        assert_eq!(failure.code(), 3);
        let runtime = CliError::Runtime(RuntimeError::new(
            ppp::runtime::RuntimeErrorKind::DivideByZero,
            0,
        ));
        assert_eq!(runtime.code(), 4);
    }
}
