//! CLI regression tests for the `asyncbridge` binary.
//!
//! These tests invoke the binary as a subprocess to catch regressions in flag
//! names, exit codes, and output formats.
//!
//! Run with: `cargo test -p asyncbridge-test`
//! Requires the `asyncbridge` binary to be built first (`cargo build -p asyncbridge`).

use std::path::PathBuf;

use assert_cmd::Command;
use predicates::str::contains;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Returns an assert_cmd Command wrapping the `asyncbridge` binary.
fn asyncbridge() -> Command {
    // cargo_bin is deprecated for custom build-dir setups; fine for standard workspace use.
    #[allow(deprecated)]
    Command::cargo_bin("asyncbridge")
        .expect("asyncbridge binary not found, run `cargo build -p asyncbridge` first")
}

/// Absolute path to the shared test fixtures directory.
fn fixtures() -> PathBuf {
    // CARGO_MANIFEST_DIR = .../crates/asyncbridge-test
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .expect("crates/")
        .parent()
        .expect("workspace root")
        .join("tests/fixtures")
}

fn stdout_json(output: &[u8]) -> serde_json::Value {
    let s = String::from_utf8(output.to_vec()).expect("stdout should be valid UTF-8");
    serde_json::from_str(&s).expect("stdout should be valid JSON")
}

// ---------------------------------------------------------------------------
// asyncbridge validate
// ---------------------------------------------------------------------------

#[test]
fn validate_valid_spec_exits_zero() {
    asyncbridge()
        .args(["validate", "--spec"])
        .arg(fixtures().join("sensor.yaml"))
        .assert()
        .success()
        .stderr(contains("is valid"));
}

#[test]
fn validate_reports_placeholder_warning() {
    asyncbridge()
        .args(["validate", "--spec"])
        .arg(fixtures().join("sensor.yaml"))
        .assert()
        .success()
        .stderr(contains("E1021"))
        .stderr(contains("sensors/{room}/temperature"));
}

#[test]
fn validate_missing_servers_exits_one() {
    asyncbridge()
        .args(["validate", "--spec"])
        .arg(fixtures().join("invalid-missing-servers.yaml"))
        .assert()
        .failure()
        .code(1)
        .stderr(contains("E1002"));
}

#[test]
fn validate_malformed_yaml_exits_one() {
    asyncbridge()
        .args(["validate", "--spec"])
        .arg(fixtures().join("malformed.yaml"))
        .assert()
        .failure()
        .code(1)
        .stderr(contains("E1001"));
}

#[test]
fn validate_missing_file_exits_one() {
    asyncbridge()
        .args(["validate", "--spec", "this-file-does-not-exist.yaml"])
        .assert()
        .failure()
        .code(1)
        .stderr(contains("E1000"));
}

#[test]
fn validate_json_format_outputs_valid_json() {
    let output = asyncbridge()
        .args(["validate", "--spec"])
        .arg(fixtures().join("sensor.yaml"))
        .args(["--format", "json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let v = stdout_json(&output);
    assert_eq!(v["summary"]["total"], 1);
    assert_eq!(v["results"][0]["valid"], true);
    assert!(v["results"][0]["warnings"].as_array().is_some());
}

#[test]
fn validate_mixed_specs_exits_one_with_summary() {
    let output = asyncbridge()
        .args(["validate", "--spec"])
        .arg(fixtures().join("sensor.yaml"))
        .arg(fixtures().join("invalid-missing-servers.yaml"))
        .args(["--format", "json"])
        .assert()
        .failure()
        .code(1)
        .get_output()
        .stdout
        .clone();

    let v = stdout_json(&output);
    assert_eq!(v["summary"]["valid"], 1);
    assert_eq!(v["summary"]["invalid"], 1);
    assert_eq!(v["results"][1]["errors"][0]["code"], "E1002");
}

#[test]
fn validate_requires_spec_flag() {
    asyncbridge().args(["validate"]).assert().failure().code(2);
}

// ---------------------------------------------------------------------------
// asyncbridge inspect
// ---------------------------------------------------------------------------

#[test]
fn inspect_prints_document_summary() {
    let output = asyncbridge()
        .args(["inspect", "--spec"])
        .arg(fixtures().join("sensor.yaml"))
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let v = stdout_json(&output);
    assert_eq!(v["title"], "Home Automation");
    assert_eq!(v["servers"][0]["url"], "mqtt://broker.example.com:1883");

    let channel = &v["channels"][0];
    assert_eq!(channel["address"], "sensors/{room}/temperature");
    assert_eq!(channel["parameters"][0]["id"], "room");
    assert_eq!(channel["parameters"][0]["enum"][0], "kitchen");
    assert_eq!(channel["operations"][0]["id"], "receiveTemperature");
    assert_eq!(channel["operations"][0]["action"], "receive");
}

#[test]
fn inspect_invalid_spec_exits_one() {
    asyncbridge()
        .args(["inspect", "--spec"])
        .arg(fixtures().join("invalid-missing-servers.yaml"))
        .assert()
        .failure()
        .code(1)
        .stderr(contains("error:"));
}

// ---------------------------------------------------------------------------
// asyncbridge resolve
// ---------------------------------------------------------------------------

#[test]
fn resolve_prints_binding() {
    let output = asyncbridge()
        .args(["resolve", "--spec"])
        .arg(fixtures().join("sensor.yaml"))
        .args([
            "--channel",
            "sensors/{room}/temperature",
            "--operation",
            "receiveTemperature",
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let v = stdout_json(&output);
    assert_eq!(v["serverUrl"], "mqtt://broker.example.com:1883");
    assert_eq!(v["protocol"], "mqtt");
    assert_eq!(v["topic"], "sensors/{room}/temperature");
    assert_eq!(v["action"], "receive");
    assert_eq!(v["contentType"], "application/json");
    assert_eq!(v["payloadSchema"][0]["name"], "celsius");
}

#[test]
fn resolve_with_overrides_and_params() {
    let output = asyncbridge()
        .args(["resolve", "--spec"])
        .arg(fixtures().join("sensor.yaml"))
        .args([
            "--channel",
            "temperature",
            "--operation",
            "receiveTemperature",
            "--server-url",
            "nats://localhost:4222",
            "--param",
            "room=kitchen",
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let v = stdout_json(&output);
    assert_eq!(v["serverUrl"], "nats://localhost:4222");
    assert_eq!(v["protocol"], "nats");
    assert_eq!(v["topic"], "sensors/kitchen/temperature");
}

#[test]
fn resolve_unknown_operation_exits_one() {
    asyncbridge()
        .args(["resolve", "--spec"])
        .arg(fixtures().join("sensor.yaml"))
        .args(["--channel", "lights/switch", "--operation", "nope"])
        .assert()
        .failure()
        .code(1)
        .stderr(contains("operation 'nope' not found"));
}

#[test]
fn resolve_malformed_param_exits_two() {
    asyncbridge()
        .args(["resolve", "--spec"])
        .arg(fixtures().join("sensor.yaml"))
        .args([
            "--channel",
            "lights/switch",
            "--operation",
            "switchLight",
            "--param",
            "no-equals-sign",
        ])
        .assert()
        .failure()
        .code(2);
}

// ---------------------------------------------------------------------------
// asyncbridge run
// ---------------------------------------------------------------------------

#[test]
fn run_missing_config_exits_one() {
    asyncbridge()
        .args(["run", "--config", "no-such-bridge.toml"])
        .assert()
        .failure()
        .code(1)
        .stderr(contains("failed to read config"));
}

#[test]
fn run_invalid_config_exits_one() {
    let tmp = TempDir::new().expect("temp dir");
    let config = tmp.path().join("bridge.toml");
    std::fs::write(&config, "[document]\npath = \"x.yaml\"\n").expect("write config");

    asyncbridge()
        .args(["run", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .code(1)
        .stderr(contains("invalid config"));
}

#[test]
fn run_invalid_log_format_exits_one() {
    asyncbridge()
        .args(["run", "--config"])
        .arg(fixtures().join("bridge-send.toml"))
        .args(["--log-format", "xml"])
        .assert()
        .failure()
        .code(1)
        .stderr(contains("invalid log format"));
}

#[test]
fn run_unknown_operation_exits_one() {
    asyncbridge()
        .args(["run", "--config"])
        .arg(fixtures().join("bridge-send.toml"))
        .args(["--operation", "nope"])
        .assert()
        .failure()
        .code(1)
        .stderr(contains("not found"));
}

#[test]
fn run_send_binding_exits_at_stdin_eof() {
    asyncbridge()
        .args(["run", "--config"])
        .arg(fixtures().join("bridge-send.toml"))
        .write_stdin("{\"state\": \"on\", \"brightness\": 40}\n")
        .assert()
        .success()
        .stdout("");
}

#[test]
fn run_send_binding_skips_invalid_input() {
    asyncbridge()
        .args(["run", "--config"])
        .arg(fixtures().join("bridge-send.toml"))
        .write_stdin("not json\n{\"state\": 1, \"brightness\": 40}\n")
        .assert()
        .success()
        .stderr(contains("stdin line is not JSON"))
        .stderr(contains("input not dispatched"));
}

#[test]
fn run_loopback_forwards_to_stdout() {
    let output = asyncbridge()
        .args(["run", "--config"])
        .arg(fixtures().join("bridge-loopback.toml"))
        .args(["--count", "1"])
        .write_stdin("{\"state\": \"off\", \"brightness\": 0}\n")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let v = stdout_json(&output);
    assert_eq!(v["topic"], "lights/switch");
    assert_eq!(v["payload"]["state"], "off");
    assert_eq!(v["payload"]["brightness"], 0);
}
