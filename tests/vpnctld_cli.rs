//! Integration tests for vpnctld
//!
//! These tests only exercise paths that exit before the daemon loop

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a test vpnctld command
fn vpnctld() -> Command {
    Command::cargo_bin("vpnctld").unwrap()
}

#[test]
fn test_help_command() {
    vpnctld()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("IPsec VPN Driver Daemon"))
        .stdout(predicate::str::contains("--check-config"));
}

#[test]
fn test_print_default_config() {
    vpnctld()
        .arg("--print-default-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("[ipsec]"))
        .stdout(predicate::str::contains("status_check_interval = 60"))
        .stdout(predicate::str::contains("binary = \"ipsec\""));
}

#[test]
fn test_check_valid_config() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vpnctl.toml");
    fs::write(
        &path,
        r#"
[agent]
host = "net-1"
state_path = "/tmp/vpnctl-test"

[ipsec]
status_check_interval = 30

[appliance]
host = "192.168.200.20"
username = "stack"
password = "cisco"
"#,
    )
    .unwrap();

    vpnctld()
        .arg("--config")
        .arg(&path)
        .arg("--check-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration OK"))
        .stdout(predicate::str::contains("status_check_interval = 30"))
        .stdout(predicate::str::contains("host = \"192.168.200.20\""))
        .stdout(predicate::str::contains("cisco").not());
}

#[test]
fn test_check_rejects_zero_interval() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vpnctl.toml");
    fs::write(&path, "[ipsec]\nstatus_check_interval = 0\n").unwrap();

    vpnctld()
        .arg("--config")
        .arg(&path)
        .arg("--check-config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("status_check_interval"));
}

#[test]
fn test_missing_config_file() {
    vpnctld()
        .arg("--config")
        .arg("/nonexistent/vpnctl.toml")
        .arg("--check-config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config"));
}
