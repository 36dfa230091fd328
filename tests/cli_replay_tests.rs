//! Integration tests for the `nplusone` log replay binary

use predicates::prelude::*;
use std::io::Write;
use tempfile::NamedTempFile;

const USERS_LOG: &str = "\
// captured from staging
>>> GET /users
SELECT * FROM users
SELECT * FROM posts WHERE user_id = 1
SELECT * FROM posts WHERE user_id = 2
SELECT * FROM posts WHERE user_id = 3
<<<
>>> GET /health
SELECT 1
<<<
";

fn write_temp(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_text_report() {
    let log = write_temp(USERS_LOG);

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("nplusone");
    cmd.arg(log.path());

    cmd.assert()
        .success()
        .stdout(predicate::str::contains(
            "N+1 query detected: 3x [GET /users] select * from posts where user_id = ?",
        ))
        .stdout(predicate::str::contains(":4"))
        .stdout(predicate::str::contains("GET /health").not())
        .stderr(predicate::str::contains("Replayed 5 statements across 2 units of work"));
}

#[test]
fn test_json_report() {
    let log = write_temp(USERS_LOG);

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("nplusone");
    cmd.arg("--format").arg("json").arg(log.path());

    let output = cmd.output().unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<_> = stdout.lines().collect();
    assert_eq!(lines.len(), 1);

    let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(parsed["level"], "WARN");
    assert_eq!(parsed["msg"], "N+1 query detected");
    assert_eq!(parsed["query"], "select * from posts where user_id = ?");
    assert_eq!(parsed["count"], 3);
    assert_eq!(parsed["unit"], "GET /users");
    assert!(parsed["caller"].as_str().unwrap().ends_with(":4"));
}

#[test]
fn test_threshold_flag_suppresses_finding() {
    let log = write_temp(USERS_LOG);

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("nplusone");
    cmd.arg("-t").arg("4").arg(log.path());

    cmd.assert()
        .success()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("0 finding(s)"));
}

#[test]
fn test_fail_on_findings_exit_code() {
    let log = write_temp(USERS_LOG);

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("nplusone");
    cmd.arg("--fail-on-findings").arg(log.path());

    cmd.assert().failure().code(1);
}

#[test]
fn test_fail_on_findings_clean_log() {
    let log = write_temp(">>> GET /\nSELECT 1\n<<<\n");

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("nplusone");
    cmd.arg("--fail-on-findings").arg(log.path());

    cmd.assert().success();
}

#[test]
fn test_config_file_threshold() {
    let log = write_temp(USERS_LOG);
    let config = write_temp("threshold = 10\n");

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("nplusone");
    cmd.arg("--config").arg(config.path()).arg(log.path());

    cmd.assert().success().stdout(predicate::str::is_empty());
}

#[test]
fn test_threshold_flag_overrides_config() {
    let log = write_temp(USERS_LOG);
    let config = write_temp("threshold = 10\n");

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("nplusone");
    cmd.arg("-c")
        .arg(config.path())
        .arg("-t")
        .arg("3")
        .arg(log.path());

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("3x [GET /users]"));
}

#[test]
fn test_invalid_config_rejected() {
    let log = write_temp(USERS_LOG);
    let config = write_temp("threshold = 0\n");

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("nplusone");
    cmd.arg("--config").arg(config.path()).arg(log.path());

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Invalid configuration"));
}

#[test]
fn test_zero_threshold_flag_rejected() {
    let log = write_temp(USERS_LOG);

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("nplusone");
    cmd.arg("-t").arg("0").arg(log.path());

    cmd.assert().failure();
}

#[test]
fn test_missing_log_file() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("nplusone");
    cmd.arg("/nonexistent/queries.log");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read statement log"));
}

#[test]
fn test_stdin_log() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("nplusone");
    cmd.arg("-").write_stdin(USERS_LOG);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("<stdin>:4"));
}

#[test]
fn test_orphan_statements_reported_in_summary() {
    let log = write_temp("SELECT 1\nSELECT 1\n>>> job\nSELECT 2\n<<<\n");

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("nplusone");
    cmd.arg(log.path());

    cmd.assert()
        .success()
        .stderr(predicate::str::contains("(2 outside any unit)"));
}

#[test]
fn test_debug_flag_emits_trace() {
    let log = write_temp(USERS_LOG);

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("nplusone");
    cmd.arg("--debug").arg(log.path());

    cmd.assert()
        .success()
        .stderr(predicate::str::contains("Unit of work started"));
}
