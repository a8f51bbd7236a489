//! The generated runtime modules, run locally against real files.

mod common;

use common::{has_command, TempRoot};
use cronium_ssh::materializer::runtime_source;
use cronium_ssh::ScriptLanguage;
use serde_json::Value;
use std::path::Path;
use std::process::Command;

fn install(root: &TempRoot, language: ScriptLanguage, file: &str) {
    let source = runtime_source(language).expect("runtime module");
    std::fs::write(root.path().join(file), source).unwrap();
}

fn python(root: &Path, code: &str) -> String {
    let output = Command::new("python3")
        .arg("-c")
        .arg(format!("import cronium\n{code}"))
        .current_dir(root)
        .output()
        .expect("run python3");
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn bash(root: &Path, code: &str) -> (bool, String) {
    let output = Command::new("bash")
        .arg("-c")
        .arg(format!("source ./cronium.sh\n{code}"))
        .current_dir(root)
        .output()
        .expect("run bash");
    (
        output.status.success(),
        String::from_utf8_lossy(&output.stdout).trim().to_string(),
    )
}

/// Condition file contents paired with the expected `getCondition()`.
const CONDITION_CASES: &[(Option<&str>, bool)] = &[
    (None, false),
    (Some(""), false),
    (Some("{not json"), false),
    (Some(r#"{"condition": false}"#), false),
    (Some(r#"{"condition": "true"}"#), false),
    (Some(r#"{"condition": 1}"#), false),
    (Some(r#"{"condition": true}"#), true),
];

fn write_condition(root: &TempRoot, contents: Option<&str>) {
    let path = root.path().join("condition.json");
    match contents {
        Some(text) => std::fs::write(path, text).unwrap(),
        None => {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[test]
fn test_python_get_condition_truth_table() {
    if !has_command("python3") {
        eprintln!("Skipping test: python3 not installed");
        return;
    }
    let root = TempRoot::new();
    install(&root, ScriptLanguage::Python, "cronium.py");

    for (contents, expected) in CONDITION_CASES {
        write_condition(&root, *contents);
        let answer = python(root.path(), "print(cronium.getCondition())");
        let expected = if *expected { "True" } else { "False" };
        assert_eq!(answer, expected, "condition file {contents:?}");
    }
}

#[test]
fn test_bash_get_condition_truth_table() {
    if !has_command("python3") {
        eprintln!("Skipping test: python3 not installed");
        return;
    }
    let root = TempRoot::new();
    install(&root, ScriptLanguage::Bash, "cronium.sh");

    for (contents, expected) in CONDITION_CASES {
        write_condition(&root, *contents);
        let (status, answer) = bash(root.path(), "cronium.getCondition");
        assert_eq!(status, *expected, "condition file {contents:?}");
        assert_eq!(answer, expected.to_string());
    }
}

#[test]
fn test_node_get_condition_truth_table() {
    if !has_command("node") {
        eprintln!("Skipping test: node not installed");
        return;
    }
    let root = TempRoot::new();
    install(&root, ScriptLanguage::Node, "cronium.js");

    for (contents, expected) in CONDITION_CASES {
        write_condition(&root, *contents);
        let output = Command::new("node")
            .arg("-e")
            .arg("console.log(require('./cronium.js').getCondition())")
            .current_dir(root.path())
            .output()
            .expect("run node");
        let answer = String::from_utf8_lossy(&output.stdout).trim().to_string();
        assert_eq!(answer, expected.to_string(), "condition file {contents:?}");
    }
}

fn read_variables(root: &TempRoot) -> serde_json::Map<String, Value> {
    let text = std::fs::read_to_string(root.path().join("variables.json")).unwrap();
    match serde_json::from_str(&text).unwrap() {
        Value::Object(map) => map,
        other => panic!("variables file is not an object: {other}"),
    }
}

#[test]
fn test_python_set_variable_merges() {
    if !has_command("python3") {
        eprintln!("Skipping test: python3 not installed");
        return;
    }
    let root = TempRoot::new();
    install(&root, ScriptLanguage::Python, "cronium.py");

    assert_eq!(python(root.path(), "print(cronium.setVariable('a', '1'))"), "True");
    let first = read_variables(&root)["__updated__"].clone();
    std::thread::sleep(std::time::Duration::from_millis(5));
    python(root.path(), "cronium.setVariable('b', '2')");

    let vars = read_variables(&root);
    assert_eq!(vars["a"], "1");
    assert_eq!(vars["b"], "2");
    assert_ne!(vars["__updated__"], first);
    assert_eq!(python(root.path(), "print(cronium.getVariable('a'))"), "1");
}

/// A value JSON cannot encode leaves the existing files untouched.
#[test]
fn test_python_unserializable_value_keeps_files() {
    if !has_command("python3") {
        eprintln!("Skipping test: python3 not installed");
        return;
    }
    let root = TempRoot::new();
    install(&root, ScriptLanguage::Python, "cronium.py");

    python(root.path(), "cronium.setVariable('a', '1')\ncronium.output({'x': 1})");
    assert_eq!(
        python(root.path(), "print(cronium.setVariable('b', object()))"),
        "False"
    );
    python(root.path(), "cronium.output({'bad': object()})");

    let vars = read_variables(&root);
    assert_eq!(vars["a"], "1");
    assert!(vars.get("b").is_none());
    let output = std::fs::read_to_string(root.path().join("output.json")).unwrap();
    assert_eq!(serde_json::from_str::<Value>(&output).unwrap(), serde_json::json!({"x": 1}));
}

#[test]
fn test_bash_set_variable_merges() {
    if !has_command("python3") {
        eprintln!("Skipping test: python3 not installed");
        return;
    }
    let root = TempRoot::new();
    install(&root, ScriptLanguage::Bash, "cronium.sh");

    let (ok, _) = bash(root.path(), "cronium.setVariable a 1 && cronium.setVariable b 2");
    assert!(ok);

    let vars = read_variables(&root);
    assert_eq!(vars["a"], "1");
    assert_eq!(vars["b"], "2");
    assert!(vars["__updated__"].is_string());

    assert_eq!(bash(root.path(), "cronium.getVariable b"), (true, "2".to_string()));
    assert!(!bash(root.path(), "cronium.getVariable missing").0);
}

#[test]
fn test_python_input_defaults_to_empty_object() {
    if !has_command("python3") {
        eprintln!("Skipping test: python3 not installed");
        return;
    }
    let root = TempRoot::new();
    install(&root, ScriptLanguage::Python, "cronium.py");

    assert_eq!(python(root.path(), "print(cronium.input(), cronium.event())"), "{} {}");
    std::fs::write(root.path().join("input.json"), "{broken").unwrap();
    assert_eq!(python(root.path(), "print(cronium.input())"), "{}");
}
