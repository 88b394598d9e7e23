//! End-to-end tests for the `xpy` binary

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

const MODULE: &str = r##"{
  "structs": [],
  "functions": [
    {
      "name": "add",
      "returns": "int",
      "params": ["int", "int"],
      "code": ".args a b\nLOAD_FAST a\nLOAD_FAST b\nBINARY_ADD\nRETURN_VALUE"
    },
    {
      "name": "at",
      "returns": "byte",
      "params": ["buffer", "int"],
      "code": ".args buf i\nLOAD_FAST buf\nLOAD_FAST i\nBINARY_SUBSCR\nRETURN_VALUE"
    },
    {
      "name": "at_byte",
      "returns": "byte",
      "params": ["buffer", "byte"],
      "code": ".args buf i\nLOAD_FAST buf\nLOAD_FAST i\nBINARY_SUBSCR\nRETURN_VALUE"
    },
    {
      "name": "at_uint",
      "returns": "byte",
      "params": ["buffer", "uint"],
      "code": ".args buf i\nLOAD_FAST buf\nLOAD_FAST i\nBINARY_SUBSCR\nRETURN_VALUE"
    },
    {
      "name": "at_unsigned",
      "returns": "byte",
      "params": ["buffer", "unsigned"],
      "code": ".args buf i\nLOAD_FAST buf\nLOAD_FAST i\nBINARY_SUBSCR\nRETURN_VALUE"
    },
    {
      "name": "at_ssize",
      "returns": "byte",
      "params": ["buffer", "ssize"],
      "code": ".args buf i\nLOAD_FAST buf\nLOAD_FAST i\nBINARY_SUBSCR\nRETURN_VALUE"
    },
    {
      "name": "greet",
      "returns": "void",
      "params": ["int"],
      "code": ".args n\nLOAD_GLOBAL print\nLOAD_CONST \"hello\"\nLOAD_FAST n\nCALL_FUNCTION 2\nPOP_TOP\nLOAD_CONST None\nRETURN_VALUE"
    }
  ]
}"##;

fn write_module(dir: &Path) -> PathBuf {
    let path = dir.join("module.json");
    std::fs::write(&path, MODULE).unwrap();
    path
}

fn xpy(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_xpy"))
        .current_dir(dir)
        .env_remove("RUST_LOG")
        .args(args)
        .output()
        .expect("failed to start xpy")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_run_returns_result() {
    let dir = tempfile::tempdir().unwrap();
    let module = write_module(dir.path());
    let output = xpy(dir.path(), &["run", module.to_str().unwrap(), "add", "2", "-5"]);
    assert!(output.status.success());
    assert_eq!(stdout(&output), "-3\n");
}

#[test]
fn test_run_with_buffer_argument() {
    let dir = tempfile::tempdir().unwrap();
    let module = write_module(dir.path());
    let output = xpy(dir.path(), &["run", module.to_str().unwrap(), "at", "b:abc", "1"]);
    assert!(output.status.success());
    assert_eq!(stdout(&output), "98\n");
}

#[test]
fn test_print_writes_to_stdout() {
    let dir = tempfile::tempdir().unwrap();
    let module = write_module(dir.path());
    let output = xpy(dir.path(), &["run", module.to_str().unwrap(), "greet", "3"]);
    assert!(output.status.success());
    assert_eq!(stdout(&output), "hello 3\n");
}

#[test]
fn test_overflow_aborts() {
    let dir = tempfile::tempdir().unwrap();
    let module = write_module(dir.path());
    let output = xpy(
        dir.path(),
        &["run", module.to_str().unwrap(), "add", "2147483647", "1"],
    );
    assert!(!output.status.success());
    assert!(stdout(&output).is_empty());
}

#[test]
fn test_out_of_bounds_aborts() {
    let dir = tempfile::tempdir().unwrap();
    let module = write_module(dir.path());
    let output = xpy(dir.path(), &["run", module.to_str().unwrap(), "at", "b:abc", "3"]);
    assert!(!output.status.success());
}

#[test]
fn test_index_types_in_range() {
    let dir = tempfile::tempdir().unwrap();
    let module = write_module(dir.path());
    for function in ["at_byte", "at_uint", "at_unsigned", "at_ssize"] {
        let output = xpy(
            dir.path(),
            &["run", module.to_str().unwrap(), function, "b:abcd", "3"],
        );
        assert!(output.status.success(), "{function} failed");
        assert_eq!(stdout(&output), "100\n", "{function}");
    }
}

#[test]
fn test_index_types_out_of_bounds_abort() {
    let dir = tempfile::tempdir().unwrap();
    let module = write_module(dir.path());
    let cases = [
        ("at_byte", "4"),
        ("at_uint", "4"),
        ("at_uint", "4294967295"),
        ("at_unsigned", "4294967296"),
        ("at_unsigned", "-1"),
        ("at_ssize", "4"),
        ("at_ssize", "4294967296"),
    ];
    for (function, index) in cases {
        let output = xpy(
            dir.path(),
            &["run", module.to_str().unwrap(), function, "b:abcd", index],
        );
        assert!(!output.status.success(), "{function} {index} did not abort");
        assert!(stdout(&output).is_empty(), "{function} {index}");
    }
}

#[test]
fn test_run_rejects_bad_arguments() {
    let dir = tempfile::tempdir().unwrap();
    let module = write_module(dir.path());
    let path = module.to_str().unwrap();

    let output = xpy(dir.path(), &["run", path, "add", "1"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("expects 2 arguments"));

    let output = xpy(dir.path(), &["run", path, "at", "7", "0"]);
    assert!(!output.status.success());

    let output = xpy(dir.path(), &["run", path, "missing"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown function missing"));
}

#[test]
fn test_dis_lists_instructions() {
    let dir = tempfile::tempdir().unwrap();
    let module = write_module(dir.path());
    let output = xpy(dir.path(), &["dis", module.to_str().unwrap()]);
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("def add(int, int) -> int"));
    assert!(text.contains("BINARY_ADD"));
    assert!(text.contains("LOAD_FAST"));
    assert!(text.contains("(buf)"));
}

#[test]
fn test_check_reports_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let module = write_module(dir.path());
    let output = xpy(dir.path(), &["check", module.to_str().unwrap(), "--json"]);
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["add"][0]["terminator"], "return");
    assert_eq!(report["greet"][0]["terminator"], "void_return");
}

#[test]
fn test_check_reports_compile_errors() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.json");
    std::fs::write(
        &path,
        r#"{"functions": [{"name": "f", "returns": "int", "code": "BINARY_ADD\nRETURN_VALUE"}]}"#,
    )
    .unwrap();
    let output = xpy(dir.path(), &["check", path.to_str().unwrap()]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("operand stack underflow"));
}

#[test]
fn test_config_file_keeps_ir() {
    let dir = tempfile::tempdir().unwrap();
    let module = write_module(dir.path());
    std::fs::write(dir.path().join("xpy.toml"), "[jit]\nkeep_ir = true\n").unwrap();
    let output = xpy(dir.path(), &["check", module.to_str().unwrap()]);
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("add: 1 blocks"));
    assert!(text.contains("function "));

    let other = dir.path().join("plain.toml");
    std::fs::write(&other, "[jit]\nkeep_ir = false\n").unwrap();
    let output = xpy(
        dir.path(),
        &["--config", other.to_str().unwrap(), "check", module.to_str().unwrap()],
    );
    assert!(output.status.success());
    assert!(!stdout(&output).contains("function "));
}
