//! End-to-end tests for the `stackpilot` binary.
//!
//! Only commands that need no external toolchain are exercised here:
//! config init, runtime listing, hot-reload support, and validation.

use std::time::Duration;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::str::contains;

/// A `stackpilot` command whose config lookups land in `home`.
fn stackpilot(home: &tempfile::TempDir) -> assert_cmd::Command {
    let mut cmd: assert_cmd::Command = cargo_bin_cmd!("stackpilot");
    cmd.timeout(Duration::from_secs(15));
    cmd.env("XDG_CONFIG_HOME", home.path());
    cmd.env_remove("STACKPILOT_CONFIG");
    cmd.env("RUST_LOG", "warn");
    cmd
}

// -----------------------------------------------------------------------
// init
// -----------------------------------------------------------------------

#[test]
fn init_writes_config_once() {
    let home = tempfile::tempdir().unwrap();

    stackpilot(&home)
        .arg("init")
        .assert()
        .success()
        .stdout(contains("Config written to"));
    let path = home.path().join("stackpilot").join("config.toml");
    let written = std::fs::read_to_string(&path).unwrap();
    assert!(written.contains("[hot_reload]"));

    stackpilot(&home)
        .arg("init")
        .assert()
        .failure()
        .stderr(contains("already exists"));

    stackpilot(&home).args(["init", "--force"]).assert().success();
}

#[test]
fn explicit_config_flag_must_exist() {
    let home = tempfile::tempdir().unwrap();
    let missing = home.path().join("nope.toml");
    stackpilot(&home)
        .args(["runtimes", "--config", missing.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(contains("failed to read config file"));
}

// -----------------------------------------------------------------------
// runtimes / hot-reload-support
// -----------------------------------------------------------------------

#[test]
fn runtimes_lists_every_provider() {
    let home = tempfile::tempdir().unwrap();
    stackpilot(&home)
        .arg("runtimes")
        .assert()
        .success()
        .stdout(contains("node"))
        .stdout(contains("dotnet"))
        .stdout(contains("tauri"))
        .stdout(contains("external-window"));
}

#[test]
fn hot_reload_support_is_reported_as_json() {
    let home = tempfile::tempdir().unwrap();
    let output = stackpilot(&home)
        .args(["hot-reload-support", "wpf"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let check: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(check["supported"], true);

    let output = stackpilot(&home)
        .args(["hot-reload-support", "react"])
        .output()
        .unwrap();
    let check: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(check["supported"], false);
    assert!(check["message"].as_str().unwrap().contains("wpf"));
}

// -----------------------------------------------------------------------
// validate
// -----------------------------------------------------------------------

#[test]
fn validate_passes_and_fails_with_exit_status() {
    let home = tempfile::tempdir().unwrap();
    let good = home.path().join("Program.cs");
    std::fs::write(
        &good,
        "using System;\n\nnamespace Demo\n{\n    public class Program\n    {\n        static void Main() { }\n    }\n}\n",
    )
    .unwrap();
    stackpilot(&home)
        .args(["validate", good.to_str().unwrap()])
        .assert()
        .success()
        .stdout(contains("ok"));

    let bad = home.path().join("Program2.cs");
    std::fs::write(&bad, "class").unwrap();
    stackpilot(&home)
        .args(["validate", bad.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(contains("too short"));
}

#[test]
fn unknown_stack_is_reported() {
    let home = tempfile::tempdir().unwrap();
    stackpilot(&home)
        .args(["check", "cobol"])
        .assert()
        .failure()
        .stderr(contains("cobol"));
}
