use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn write(dir: &Path, name: &str, source: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, source).unwrap();
    path
}

fn ppp() -> Command {
    let mut cmd = Command::cargo_bin("ppp").unwrap();
    cmd.env_remove("PPP_SOURCE_PATH").env_remove("RUST_LOG");
    cmd
}

const GREETER: &str = "
function main(args: string): integer
begin
    println(\"hello \" + args);
    return 7
end;
";

#[test]
fn test_runs_program_and_exits_with_main_result() {
    let dir = TempDir::new().unwrap();
    let file = write(dir.path(), "greet.ppp", GREETER);
    ppp()
        .arg(&file)
        .args(["big", "world"])
        .assert()
        .code(7)
        .stdout("hello big world\n");
}

#[test]
fn test_compile_error_exit_code() {
    let dir = TempDir::new().unwrap();
    let file = write(
        dir.path(),
        "bad.ppp",
        "function main(): integer\nbegin\n    return missing\nend;\n",
    );
    ppp()
        .arg(&file)
        .assert()
        .code(3)
        .stderr(predicate::str::contains("<error 4000 in file ["))
        .stderr(predicate::str::contains("line ~3>"))
        .stderr(predicate::str::contains("    return missing\n"));
}

#[test]
fn test_runtime_error_exit_code() {
    let dir = TempDir::new().unwrap();
    let file = write(
        dir.path(),
        "div.ppp",
        "function main(): integer var z: integer; begin return 1 / z end;",
    );
    ppp()
        .arg(&file)
        .assert()
        .code(4)
        .stderr(predicate::str::contains("division by zero"));
}

#[test]
fn test_warnings_and_quiet() {
    let dir = TempDir::new().unwrap();
    let file = write(
        dir.path(),
        "warn.ppp",
        "function main(): integer begin if 0 then return 1; return 0 end;",
    );
    ppp()
        .arg(&file)
        .assert()
        .success()
        .stderr(predicate::function(|err: &str| err.matches("11100").count() == 1))
        .stderr(predicate::str::contains("WARN").not());
    ppp()
        .arg("-q")
        .arg(&file)
        .assert()
        .success()
        .stderr(predicate::str::is_empty());
}

#[test]
fn test_suppress_errors_keeps_exit_codes() {
    let dir = TempDir::new().unwrap();
    let undeclared = write(
        dir.path(),
        "ud.ppp",
        "function main(): integer begin return missing end;",
    );
    let divide = write(
        dir.path(),
        "div.ppp",
        "function main(): integer var z: integer; begin return 1 / z end;",
    );
    ppp()
        .arg("-s")
        .arg(&undeclared)
        .assert()
        .code(3)
        .stderr(predicate::str::is_empty());
    ppp()
        .arg("--suppress-errors")
        .arg(&divide)
        .assert()
        .code(4)
        .stderr(predicate::str::is_empty());
    ppp()
        .arg("-q")
        .arg(&undeclared)
        .assert()
        .code(3)
        .stderr(predicate::str::contains("<error 4000"));
}

#[test]
fn test_write_module_then_run_it() {
    let dir = TempDir::new().unwrap();
    let file = write(dir.path(), "greet.ppp", GREETER);
    let module = dir.path().join("greet.pbc");
    ppp()
        .arg("-c")
        .arg("-o")
        .arg(&module)
        .arg(&file)
        .assert()
        .success()
        .stdout("");
    assert!(module.exists());

    ppp()
        .arg(&module)
        .arg("again")
        .assert()
        .code(7)
        .stdout("hello again\n");
}

#[test]
fn test_listing() {
    let dir = TempDir::new().unwrap();
    let file = write(
        dir.path(),
        "tiny.ppp",
        "function main(): integer begin return 5 end;",
    );
    ppp()
        .args(["-l", "-c"])
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::contains("INC"))
        .stdout(predicate::str::contains("instructions, format v1"));
}

#[test]
fn test_source_path_for_includes() {
    let dir = TempDir::new().unwrap();
    let lib = dir.path().join("lib");
    fs::create_dir(&lib).unwrap();
    write(
        &lib,
        "math.ppp",
        "function square(n: integer): integer begin return n * n end;",
    );
    let app = dir.path().join("app");
    fs::create_dir(&app).unwrap();
    let file = write(
        &app,
        "main.ppp",
        "include \"math.ppp\"; function main(): integer begin return square(9) end;",
    );

    ppp().arg(&file).assert().code(3);
    ppp()
        .arg("--source-path")
        .arg(&lib)
        .arg(&file)
        .assert()
        .code(81);
    ppp()
        .env("PPP_SOURCE_PATH", &lib)
        .arg(&file)
        .assert()
        .code(81);
}

#[test]
fn test_bounds_check_flag() {
    let dir = TempDir::new().unwrap();
    let file = write(
        dir.path(),
        "oob.ppp",
        "function main(): integer var a: integer[2]; begin return a[5] end;",
    );
    ppp()
        .arg(&file)
        .assert()
        .code(4)
        .stderr(predicate::str::contains("out of bounds"));
    ppp()
        .arg("--no-bounds-check")
        .arg(&file)
        .assert()
        .code(4)
        .stderr(predicate::str::contains("out of bounds").not());
}

#[test]
fn test_missing_file() {
    ppp()
        .arg("does/not/exist.ppp")
        .assert()
        .code(3)
        .stderr(predicate::str::contains("error 14000"));
}
