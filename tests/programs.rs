//! Whole programs through the public pipeline: source to module to machine.

use ppp::bytecode::ir::Module;
use ppp::bytecode::op::{Opcode, Operand};
use ppp::bytecode::{CompileOptions, ReleaseGuard, compile_source};
use ppp::lang::{FunctionDesc, ParamDesc, Type, kinds_match, signatures_match};
use ppp::runtime::{Machine, MachineConfig, RunSummary, RuntimeError, RuntimeErrorKind};

const SIEVE: &str = "
function main(): integer
    var composite: integer[31];
    var i: integer;
    var j: integer;
    var count: integer;
begin
    for i := 2 to 30 do
        if not composite[i] then begin
            print(i + \" \");
            count++;
            j := i * i;
            while j <= 30 do begin
                composite[j] := 1;
                j += i
            end
        end;
    println(\"\");
    return count
end;
";

const WORDS: &str = "
type text: string;

function join(parts: text[], sep: text): text
    var out: text;
    var i: integer;
begin
    for i := 0 to length(parts) - 1 do begin
        if i > 0 then out := out + sep;
        out := out + parts[i]
    end;
    return out
end;

function main(): integer
    var parts: text[3];
begin
    parts[0] := \"red\";
    parts[1] := \"green\";
    parts[2] := \"blue\";
    println(join(parts, \", \"));
    which parts[1] begin
        case \"red\": return 1;
        case \"green\": return 2;
        case else: return 3;
    end
end;
";

const NUMERIC: &str = "
const scale = 2.5;

function area(r: float): float begin return r * r * 3.0 end;

function main(): integer
    var total: float;
    var k: integer;
    function weight(n: integer): integer begin return n * k end;
begin
    k := 3;
    total := area(scale) + weight(4);
    println(total);
    if total > 30 && total < 31 then return 1;
    return 0
end;
";

const JUMPS: &str = "
function main(): integer
    var i: integer;
    var n: integer;
begin
    repeat begin
        i++;
        if i % 3 = 0 then continue;
        if i > 20 then exit;
        n += i
    end;
    again:
    n--;
    if n > 100 then goto again;
    return n
end;
";

fn compile_with(source: &str, options: &CompileOptions) -> Module {
    match compile_source(source, "program.ppp", options) {
        Ok(out) => out.module,
        Err(failure) => panic!("compile failed:\n{}", failure.render()),
    }
}

fn execute(module: &Module, config: MachineConfig) -> Result<(RunSummary, String), RuntimeError> {
    let mut machine = Machine::new(config);
    let mut out = Vec::new();
    let summary = machine.run(&module.code, &mut out, &mut std::io::empty())?;
    Ok((summary, String::from_utf8_lossy(&out).into_owned()))
}

fn run(source: &str) -> (RunSummary, String) {
    let module = compile_with(source, &CompileOptions::default());
    execute(&module, MachineConfig::default()).unwrap()
}

#[test]
fn test_sieve() {
    let (summary, out) = run(SIEVE);
    assert_eq!(out, "2 3 5 7 11 13 17 19 23 29 \n");
    assert_eq!(summary.exit_code, 10);
    assert!(summary.leaks.is_empty(), "leaks: {:?}", summary.leaks);
}

#[test]
fn test_string_arrays_and_which() {
    let (summary, out) = run(WORDS);
    assert_eq!(out, "red, green, blue\n");
    assert_eq!(summary.exit_code, 2);
    assert!(summary.leaks.is_empty(), "leaks: {:?}", summary.leaks);
}

#[test]
fn test_floats_and_nested_functions() {
    let (summary, out) = run(NUMERIC);
    assert_eq!(summary.exit_code, 1);
    assert!(out.starts_with("30.75"), "{}", out);
}

#[test]
fn test_optimizer_preserves_behavior() {
    let plain = CompileOptions {
        optimize: false,
        ..CompileOptions::default()
    };
    for source in [SIEVE, WORDS, NUMERIC, JUMPS] {
        let optimized = compile_with(source, &CompileOptions::default());
        let unoptimized = compile_with(source, &plain);
        assert!(optimized.len() < unoptimized.len());

        let (a, out_a) = execute(&optimized, MachineConfig::default()).unwrap();
        let (b, out_b) = execute(&unoptimized, MachineConfig::default()).unwrap();
        assert_eq!(a.exit_code, b.exit_code);
        assert_eq!(out_a, out_b);
        assert_eq!(a.leaks, b.leaks);
        assert!(a.steps <= b.steps);
    }
}

#[test]
fn test_every_operand_resolved() {
    let module = compile_with(JUMPS, &CompileOptions::default());
    assert!(module.check_resolved().is_ok());
    assert!(
        module
            .code
            .iter()
            .all(|ins| matches!(ins.operand, Operand::Value(_)))
    );
    assert_eq!(module.code[0].op, Opcode::Inc);
}

#[test]
fn test_saved_module_runs_the_same() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("words.pbc");
    let module = compile_with(WORDS, &CompileOptions::default());
    module.save(&path).unwrap();

    let loaded = Module::load(&path).unwrap();
    assert_eq!(loaded, module);
    let (summary, out) = execute(&loaded, MachineConfig::default()).unwrap();
    assert_eq!(summary.exit_code, 2);
    assert_eq!(out, "red, green, blue\n");
}

#[test]
fn test_release_guards() {
    let source = "
        var keep: string;
        function main(): integer
            var a: string;
            var untouched: string;
        begin
            keep := \"global\";
            a := keep + \"!\";
            return length(a)
        end;";

    let written = compile_with(source, &CompileOptions::default());
    let (summary, _) = execute(&written, MachineConfig::default()).unwrap();
    assert_eq!(summary.exit_code, 7);
    assert!(summary.leaks.is_empty(), "leaks: {:?}", summary.leaks);

    let unreferenced = CompileOptions {
        release_guard: ReleaseGuard::OnlyUnreferenced,
        ..CompileOptions::default()
    };
    let module = compile_with(source, &unreferenced);
    let (summary, _) = execute(&module, MachineConfig::default()).unwrap();
    assert_eq!(summary.exit_code, 7);
    // `keep` and `a` were assigned, so nothing releases them
    assert_eq!(summary.leaks.len(), 2);
}

#[test]
fn test_division_by_zero_stops_the_machine() {
    let module = compile_with(
        "function main(): integer var d: integer; begin return 10 / d end;",
        &CompileOptions::default(),
    );
    let err = execute(&module, MachineConfig::default()).unwrap_err();
    assert_eq!(err.kind, RuntimeErrorKind::DivideByZero);

    let module = compile_with(
        "function main(): integer var z: float; begin return 1.0 / z end;",
        &CompileOptions::default(),
    );
    let err = execute(&module, MachineConfig::default()).unwrap_err();
    assert_eq!(err.kind, RuntimeErrorKind::DivideByZero);
}

#[test]
fn test_step_limit() {
    let module = compile_with(
        "function main(): integer begin while true do; return 0 end;",
        &CompileOptions::default(),
    );
    let config = MachineConfig {
        max_steps: Some(1000),
        ..MachineConfig::default()
    };
    let err = execute(&module, config).unwrap_err();
    assert_eq!(err.kind, RuntimeErrorKind::StepLimit(1000));
}

#[test]
fn test_deep_recursion_needs_tail_calls() {
    let source = "
        function count(n: integer, acc: integer): integer
        begin
            if n = 0 then return acc;
            return count(n - 1, acc + 1)
        end;
        function main(): integer begin return count(100000, 0) % 1000 end;";

    let (summary, _) = run(source);
    assert_eq!(summary.exit_code, 0);

    let plain = CompileOptions {
        optimize: false,
        ..CompileOptions::default()
    };
    let module = compile_with(source, &plain);
    let err = execute(&module, MachineConfig::default()).unwrap_err();
    assert_eq!(err.kind, RuntimeErrorKind::StackOverflow);
}

#[test]
fn test_reads_standard_input() {
    let module = compile_with(
        "function main(): integer
         begin
            var name := read_line();
            println(\"hi \" + name);
            return length(name)
         end;",
        &CompileOptions::default(),
    );
    let mut machine = Machine::new(MachineConfig::default());
    let mut out = Vec::new();
    let mut input: &[u8] = b"bob\nignored\n";
    let summary = machine.run(&module.code, &mut out, &mut input).unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), "hi bob\n");
    assert_eq!(summary.exit_code, 3);
    assert!(summary.leaks.is_empty());
}

#[test]
fn test_diagnostics_report_every_error() {
    let failure = compile_source(
        "function main(): integer
         begin
            undefined_a := 1;
            exit;
            return \"x\" * 2
         end;",
        "broken.ppp",
        &CompileOptions::default(),
    )
    .unwrap_err();
    let codes = failure.codes();
    assert!(codes.contains(&4000));
    assert!(codes.contains(&11600));
    assert!(failure.error_count() >= 3);
    assert!(failure.render().contains("in file [broken.ppp], line ~3"));
}

#[test]
fn test_type_matching_from_the_data_model() {
    assert!(kinds_match(&Type::string(), &Type::array_of(Type::INTEGER, 3)));
    assert!(!kinds_match(&Type::Float, &Type::INTEGER));

    let unary = |ty: Type| FunctionDesc {
        params: vec![ParamDesc {
            name: "x".to_string(),
            ty,
            byref: false,
            default: None,
        }],
        ret: Type::INTEGER,
    };
    assert!(signatures_match(&unary(Type::BOOLEAN), &unary(Type::INTEGER)));
    assert!(!signatures_match(&unary(Type::Float), &unary(Type::INTEGER)));
}
