//! End-to-end tests for the `leaktk` binary.

use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;

const SECRET_LINE: &str = r#"secret = "I6gHcCmvAbCdEf01XyZ9""#;

const PATTERNS: &str = r#"
[[rules]]
id = "generic-secret"
description = "Generic secret assignment"
regex = '''secret\s*=\s*"([0-9A-Za-z]{8,})"'''
secretGroup = 1
keywords = ["secret"]
"#;

fn write_config(workdir: &Path) -> std::path::PathBuf {
    let pattern_path = workdir.join("patterns");
    fs::write(&pattern_path, PATTERNS).unwrap();

    let config_path = workdir.join("leaktk.toml");
    fs::write(
        &config_path,
        format!(
            r#"
[logger]
level = "error"

[scanner]
workdir = {workdir:?}

[scanner.patterns]
autofetch = false
refresh_after = 0
expired_after = 0

[scanner.patterns.gitleaks]
version = "test"
local_path = {pattern_path:?}
"#,
        ),
    )
    .unwrap();
    config_path
}

fn leaktk() -> Command {
    Command::cargo_bin("leaktk").unwrap()
}

#[test]
fn help_lists_subcommands() {
    leaktk()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("scan"))
        .stdout(predicate::str::contains("listen"));
}

#[test]
fn scan_with_unknown_kind_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    leaktk()
        .args(["--config", config.to_str().unwrap(), "scan", "--kind", "Mystery", "x"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unsupported request kind"));
}

#[test]
fn text_scan_with_leak_uses_the_leak_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    leaktk()
        .args([
            "--config",
            config.to_str().unwrap(),
            "scan",
            "--kind",
            "Text",
            "--leak-exit-code",
            "42",
            SECRET_LINE,
        ])
        .assert()
        .code(42)
        .stdout(predicate::str::contains("\"kind\":\"ScanResults\""))
        .stdout(predicate::str::contains("I6gHcCmvAbCdEf01XyZ9"));
}

#[test]
fn clean_text_scan_exits_zero() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    leaktk()
        .args(["--config", config.to_str().unwrap(), "scan", "--kind", "Text", "all clear"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"results\":[]"));
}

#[test]
fn scan_reads_resource_from_file_with_at_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    let payload = dir.path().join("payload.txt");
    fs::write(&payload, SECRET_LINE).unwrap();

    leaktk()
        .args([
            "--config",
            config.to_str().unwrap(),
            "scan",
            "--kind",
            "Text",
            &format!("@{}", payload.display()),
        ])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("generic-secret"));
}

#[test]
fn listen_answers_each_request_line() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    let input = format!(
        "{}\n{}\n",
        serde_json::json!({
            "id": "first",
            "kind": "Text",
            "resource": SECRET_LINE,
        }),
        serde_json::json!({
            "id": "second",
            "kind": "Text",
            "resource": "all clear",
        }),
    );

    let assert = leaktk()
        .args(["--config", config.to_str().unwrap(), "listen"])
        .write_stdin(input)
        .assert()
        .success();

    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).into_owned();
    let lines: Vec<&str> = stdout.lines().filter(|l| !l.is_empty()).collect();
    assert_eq!(lines.len(), 2);
    assert!(stdout.contains("\"request_id\":\"first\""));
    assert!(stdout.contains("\"request_id\":\"second\""));
}

#[test]
fn listen_skips_undecodable_requests() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    let input = format!(
        "{}\n{}\n",
        r#"{"id":"x","kind":"Mystery","resource":"http://h"}"#,
        serde_json::json!({
            "id": "valid",
            "kind": "Text",
            "resource": "all clear",
        }),
    );

    let assert = leaktk()
        .args(["--config", config.to_str().unwrap(), "listen"])
        .write_stdin(input)
        .assert()
        .success();

    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).into_owned();
    let lines: Vec<&str> = stdout.lines().filter(|l| !l.is_empty()).collect();

    // The malformed request produces no response at all.
    assert_eq!(lines.len(), 1);
    assert!(stdout.contains("\"request_id\":\"valid\""));
}
