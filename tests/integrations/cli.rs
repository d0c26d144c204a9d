//! The `safewatch` binary's one-shot `evaluate` command.

use assert_cmd::Command;
use predicates::prelude::*;

#[path = "../helpers/mod.rs"]
mod helpers;
use helpers::{temp_file, REFERENCE_YAML};

fn safewatch(config: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("safewatch").unwrap();
    cmd.env_remove("RUST_LOG").arg("--config").arg(config);
    cmd
}

fn config_for(reference: &std::path::Path) -> tempfile::NamedTempFile {
    temp_file(
        &format!("[reference]\ndata_path = {:?}\n", reference.to_str().unwrap()),
        ".toml",
    )
}

#[test]
fn test_evaluate_prints_status_and_resolved_jurisdiction() {
    let reference = temp_file(REFERENCE_YAML, ".yaml");
    let config = config_for(reference.path());

    safewatch(config.path())
        .args(["evaluate", "--substance", "lead", "--jurisdiction", "US-NY", "--value", "12"])
        .assert()
        .success()
        .stdout(predicate::eq("warning\tUS\n"));
}

#[test]
fn test_evaluate_without_threshold_is_danger() {
    let reference = temp_file(REFERENCE_YAML, ".yaml");
    let config = config_for(reference.path());

    safewatch(config.path())
        .args(["evaluate", "--substance", "asbestos", "--jurisdiction", "US", "--value", "0"])
        .assert()
        .success()
        .stdout(predicate::eq("danger\t-\n"));
}

#[test]
fn test_evaluate_requires_reference_data() {
    let config = temp_file("log_level = \"error\"\n", ".toml");

    safewatch(config.path())
        .args(["evaluate", "--substance", "lead", "--jurisdiction", "US", "--value", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("reference.data_path"));
}

#[test]
fn test_invalid_config_exits_with_error() {
    let config = temp_file("[performance]\nworker_concurrency = 0\n", ".toml");

    safewatch(config.path())
        .args(["evaluate", "--substance", "lead", "--jurisdiction", "US", "--value", "1"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Failed to load configuration"));
}
