//! Integration tests for the RepoVault CLI
//!
//! These run the built binary and never touch the network.

mod common;

use assert_fs::prelude::*;
use assert_fs::TempDir;
use common::{assert_contains_all, git_fixture, FIXTURE_TIMESTAMP};
use predicates::prelude::*;
use std::process::{Command, Output};

fn repovault() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_repovault"));
    // Keep the host's credentials and config out of the picture
    for var in [
        "GITHUB_TOKEN",
        "GH_TOKEN",
        "GITLAB_TOKEN",
        "BITBUCKET_TOKEN",
        "BITBUCKET_USERNAME",
        "BITBUCKET_APP_PASSWORD",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

fn run(cmd: &mut Command) -> (Output, String, String) {
    let output = cmd.output().expect("Failed to execute repovault");
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    (output, stdout, stderr)
}

#[test]
fn test_cli_help() {
    let (output, stdout, _) = run(repovault().arg("--help"));

    assert!(output.status.success());
    assert_contains_all(
        &stdout,
        &[
            "--local",
            "--s3-bucket",
            "--platform",
            "--workers",
            "--method",
            "--health-check",
            "--validate-config",
            "--verify-backup",
            "--list",
            "--test",
        ],
    );
}

#[test]
fn test_cli_version() {
    let (output, stdout, _) = run(repovault().arg("--version"));

    assert!(output.status.success());
    assert!(stdout.contains("repovault"));
}

#[test]
fn test_invalid_flag() {
    let (output, _, stderr) = run(repovault().arg("--nonexistent-flag"));

    assert!(!output.status.success());
    assert!(stderr.contains("error") || stderr.contains("unexpected"));
}

#[test]
fn test_local_and_s3_conflict() {
    let (output, _, stderr) = run(repovault().args(["--local", "/tmp/x", "--s3-bucket", "b"]));

    assert!(!output.status.success());
    assert!(stderr.contains("cannot be used with"));
}

#[test]
fn test_error_handling_invalid_config() {
    let temp = TempDir::new().unwrap();
    let config = temp.child("invalid-config.yml");
    config.write_str("destination: [unclosed").unwrap();

    let (output, _, stderr) = run(repovault()
        .arg("--config")
        .arg(config.path())
        .arg("--validate-config"));

    assert!(!output.status.success());
    assert!(stderr.contains("parse") || stderr.contains("config"));
}

#[test]
fn test_validate_config_without_destination_fails() {
    let temp = TempDir::new().unwrap();
    let config = temp.child("config.yml");
    config.write_str("backup:\n  workers: 2\n").unwrap();

    let (output, stdout, _) = run(repovault()
        .arg("--config")
        .arg(config.path())
        .arg("--validate-config")
        .env("GITHUB_TOKEN", "ghp_cli_test"));

    assert!(!output.status.success());
    assert!(predicate::str::contains("destination").eval(&stdout));
    assert!(!stdout.contains("ghp_cli_test"));
}

#[test]
fn test_validate_config_passes_with_local_destination_and_token() {
    let temp = TempDir::new().unwrap();
    let backups = temp.child("backups");
    backups.create_dir_all().unwrap();
    let config = temp.child("config.yml");
    config
        .write_str("platforms:\n  gitlab:\n    enabled: false\n  bitbucket:\n    enabled: false\n")
        .unwrap();

    let (output, stdout, _) = run(repovault()
        .arg("--config")
        .arg(config.path())
        .arg("--local")
        .arg(backups.path())
        .arg("--validate-config")
        .env("GITHUB_TOKEN", "ghp_cli_test"));

    assert!(output.status.success(), "stdout: {}", stdout);
    assert!(stdout.contains("Configuration is valid"));
}

#[test]
fn test_validate_config_rejects_bad_pattern() {
    let temp = TempDir::new().unwrap();
    let backups = temp.child("backups");
    backups.create_dir_all().unwrap();
    let config = temp.child("config.yml");
    config.write_str("filters:\n  patterns:\n    - \"re:([\"\n").unwrap();

    let (output, _, _) = run(repovault()
        .arg("--config")
        .arg(config.path())
        .arg("--local")
        .arg(backups.path())
        .arg("--validate-config")
        .env("GITHUB_TOKEN", "ghp_cli_test"));

    assert!(!output.status.success());
}

#[test]
fn test_verify_backup_on_local_directory() {
    let temp = TempDir::new().unwrap();
    let source = git_fixture(temp.path(), "core", 2);
    let artifacts = temp.child("artifacts");
    artifacts.create_dir_all().unwrap();
    let bundle = artifacts.child(format!("core_{}.bundle", FIXTURE_TIMESTAMP));

    common::git(&source, &["bundle", "create", &bundle.path().display().to_string(), "--all"]);
    bundle.assert(predicate::path::is_file());

    let config = temp.child("config.yml");
    config.write_str("logging:\n  level: warn\n").unwrap();

    let (output, stdout, _) = run(repovault()
        .arg("--config")
        .arg(config.path())
        .arg("--verify-backup")
        .arg(artifacts.path()));
    assert!(output.status.success(), "stdout: {}", stdout);
    assert!(stdout.contains("Verified 1 artifact"));

    // Corrupt it and verify again
    let bytes = std::fs::read(bundle.path()).unwrap();
    std::fs::write(bundle.path(), &bytes[..bytes.len() / 3]).unwrap();

    let (output, stdout, _) = run(repovault()
        .arg("--config")
        .arg(config.path())
        .arg("--verify-backup")
        .arg(artifacts.path()));
    assert!(!output.status.success());
    assert!(stdout.contains("❌"));
}

#[test]
fn test_list_existing_backups() {
    let temp = TempDir::new().unwrap();
    let backups = temp.child("backups");
    backups
        .child("repos/github/acme/core_20240101_000000.bundle")
        .write_binary(b"old")
        .unwrap();
    backups
        .child("repos/gitlab/group/app_20240202_000000.bundle")
        .write_binary(b"newer")
        .unwrap();
    let config = temp.child("config.yml");
    config.write_str("logging:\n  level: warn\n").unwrap();

    let (output, stdout, _) = run(repovault()
        .arg("--config")
        .arg(config.path())
        .arg("--local")
        .arg(backups.path())
        .arg("--list"));
    assert!(output.status.success(), "stdout: {}", stdout);
    assert!(stdout.contains("Backups (2)"));

    let (output, stdout, _) = run(repovault()
        .arg("--config")
        .arg(config.path())
        .arg("--local")
        .arg(backups.path())
        .arg("--list")
        .arg("--platform")
        .arg("gitlab"));
    assert!(output.status.success());
    assert!(stdout.contains("Backups (1)"));
    assert!(stdout.contains("repos/gitlab/group/app_20240202_000000.bundle"));
}

#[test]
fn test_backup_without_any_credential_exits_nonzero() {
    let temp = TempDir::new().unwrap();
    let backups = temp.child("backups");
    backups.create_dir_all().unwrap();
    let config = temp.child("config.yml");
    config
        .write_str("platforms:\n  gitlab:\n    enabled: false\n  bitbucket:\n    enabled: false\n")
        .unwrap();

    // Empty PATH hides the gh CLI; git is not needed before discovery
    let (output, _, stderr) = run(repovault()
        .arg("--config")
        .arg(config.path())
        .arg("--local")
        .arg(backups.path())
        .env("PATH", temp.path()));

    assert!(!output.status.success());
    assert!(stderr.contains("credential"));
    backups.assert(predicate::path::is_dir());
}
