//! CLI subprocess integration tests.
//!
//! These tests invoke the `testbed` binary as a subprocess and check exit
//! codes, captured output and JSON output stability. They use the direct
//! backend, so no sandboxing tools are needed.

use std::path::Path;
use std::process::Command;

fn testbed_bin(dir: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_testbed"));
    cmd.current_dir(dir).env_remove("TESTBED_LOG");
    cmd
}

fn write_direct_config(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("testbed.toml");
    let workspace = dir.join("ws");
    std::fs::write(
        &path,
        format!(
            "[environment]\nbackend = \"none\"\nworkspace = \"{}\"\nstop_timeout_secs = 1\n",
            workspace.display()
        ),
    )
    .unwrap();
    path
}

#[test]
fn cli_version_exits_zero() {
    let dir = tempfile::tempdir().unwrap();
    let output = testbed_bin(dir.path()).arg("--version").output().unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("testbed"));
}

#[test]
fn run_propagates_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    write_direct_config(dir.path());
    let output = testbed_bin(dir.path())
        .args(["run", "--", "/bin/sh", "-c", "exit 7"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(7));
}

#[test]
fn run_logs_captured_output() {
    let dir = tempfile::tempdir().unwrap();
    write_direct_config(dir.path());
    let output = testbed_bin(dir.path())
        .args(["run", "--", "/bin/echo", "hello from ecu"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("hello from ecu"), "{stderr}");
    assert!(stderr.contains("stdout"), "{stderr}");
}

#[test]
fn run_json_reports_result() {
    let dir = tempfile::tempdir().unwrap();
    write_direct_config(dir.path());
    let output = testbed_bin(dir.path())
        .args([
            "--json", "run", "--env", "GREETING=hi", "--", "/bin/sh", "-c", "echo $GREETING",
        ])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["exit_code"], 0);
    assert_eq!(json["state"], "exited");
    assert_eq!(json["stdout"], "hi\n");
    assert_eq!(json["process"], "sh");
}

#[test]
fn run_timeout_stops_process() {
    let dir = tempfile::tempdir().unwrap();
    write_direct_config(dir.path());
    let output = testbed_bin(dir.path())
        .args(["run", "--timeout", "1", "--", "/bin/sleep", "30"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(128 + 15));
}

#[test]
fn run_with_backend_flag_needs_no_config() {
    let dir = tempfile::tempdir().unwrap();
    let output = testbed_bin(dir.path())
        .args(["run", "--backend", "none", "--", "/bin/true"])
        .output()
        .unwrap();
    assert!(output.status.success());
}

#[test]
fn missing_config_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let output = testbed_bin(dir.path())
        .args(["run", "--", "/bin/true"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("configuration error"));
}

#[test]
fn unknown_backend_in_config_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("testbed.toml"),
        "[environment]\nbackend = \"qemu\"\n",
    )
    .unwrap();
    let output = testbed_bin(dir.path()).arg("check").output().unwrap();
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn missing_executable_is_failure() {
    let dir = tempfile::tempdir().unwrap();
    write_direct_config(dir.path());
    let output = testbed_bin(dir.path())
        .args(["run", "--", "/nonexistent/testbed/app"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("execution failed"));
}

#[test]
fn check_prints_normalized_config() {
    let dir = tempfile::tempdir().unwrap();
    write_direct_config(dir.path());
    let output = testbed_bin(dir.path()).arg("check").output().unwrap();
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["environment"]["backend"], "none");
    assert_eq!(json["environment"]["stop_timeout_secs"], 1);
}

#[test]
fn doctor_json_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    write_direct_config(dir.path());
    let output = testbed_bin(dir.path())
        .args(["--json", "doctor"])
        .output()
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(json["healthy"].is_boolean());
    let checks = json["checks"].as_array().unwrap();
    assert!(checks.iter().any(|c| c["name"] == "direct_backend"));
    assert!(checks
        .iter()
        .all(|c| c["name"] != "namespace_prereqs" && c["name"] != "container_prereqs"));
    assert!(output.status.success());
}
