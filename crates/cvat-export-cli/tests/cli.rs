// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 CVAT Export Contributors. All Rights Reserved.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn cli() -> Command {
    let mut cmd = Command::cargo_bin("cvat-export").expect("binary should be built");
    for var in [
        "CVAT_SERVER",
        "CVAT_USERNAME",
        "CVAT_PASSWORD",
        "CVAT_TOKEN",
        "CVAT_ORG",
        "CVAT_EXPORT_FORMAT",
        "CVAT_EXPORT_WORKERS",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn test_help_lists_commands() -> Result<(), Box<dyn std::error::Error>> {
    cli()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("export"))
        .stdout(predicate::str::contains("remaining"))
        .stdout(predicate::str::contains("--server"));
    Ok(())
}

#[test]
fn test_version_flag() -> Result<(), Box<dyn std::error::Error>> {
    cli()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
    Ok(())
}

#[test]
fn test_remaining_prints_difference() -> Result<(), Box<dyn std::error::Error>> {
    let temp_dir = TempDir::new()?;
    let all = temp_dir.path().join("all.txt");
    let done = temp_dir.path().join("done.txt");
    fs::write(&all, "1 2 3\n4 5\n")?;
    fs::write(&done, "task_2\ntask_5\n")?;

    cli()
        .arg("remaining")
        .arg(&all)
        .arg(&done)
        .assert()
        .success()
        .stdout("1\n3\n4\n");
    Ok(())
}

#[test]
fn test_remaining_writes_batch_file() -> Result<(), Box<dyn std::error::Error>> {
    let temp_dir = TempDir::new()?;
    let all = temp_dir.path().join("all.txt");
    let done = temp_dir.path().join("error.txt");
    let output = temp_dir.path().join("todo.txt");
    fs::write(&all, "10 11 12\n")?;
    fs::write(&done, "11\n")?;

    cli()
        .arg("remaining")
        .arg(&all)
        .arg(&done)
        .arg("--output")
        .arg(&output)
        .assert()
        .success();

    assert_eq!(fs::read_to_string(&output)?, "10 12\n");
    Ok(())
}

#[test]
fn test_remaining_missing_file_fails() -> Result<(), Box<dyn std::error::Error>> {
    let temp_dir = TempDir::new()?;
    cli()
        .arg("remaining")
        .arg(temp_dir.path().join("missing.txt"))
        .arg(temp_dir.path().join("other.txt"))
        .assert()
        .failure();
    Ok(())
}

#[test]
fn test_export_rejects_unknown_format() -> Result<(), Box<dyn std::error::Error>> {
    let temp_dir = TempDir::new()?;
    cli()
        .current_dir(temp_dir.path())
        .args(["export", "1", "--format", "xml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("xml"));

    assert!(!temp_dir.path().join("task_1").exists());
    Ok(())
}

#[test]
fn test_export_rejects_zero_workers() -> Result<(), Box<dyn std::error::Error>> {
    let temp_dir = TempDir::new()?;
    cli()
        .current_dir(temp_dir.path())
        .args(["export", "1", "--workers", "0"])
        .assert()
        .failure();
    Ok(())
}

#[test]
fn test_export_rejects_invalid_id() -> Result<(), Box<dyn std::error::Error>> {
    let temp_dir = TempDir::new()?;
    cli()
        .current_dir(temp_dir.path())
        .args(["export", "abc"])
        .assert()
        .failure();
    Ok(())
}
