use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use tempfile::tempdir;

fn seqstore(dir: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("seqstore").unwrap();
    cmd.arg("--dir").arg(dir);
    cmd
}

#[test]
fn add_then_get_round_trips_stdin_and_stdout() {
    let dir = tempdir().unwrap();

    seqstore(dir.path())
        .args(["add", "abc"])
        .write_stdin("hello")
        .assert()
        .success();

    seqstore(dir.path())
        .args(["get", "abc"])
        .assert()
        .success()
        .stdout("hello");
}

#[test]
fn get_missing_identifier_fails() {
    let dir = tempdir().unwrap();
    seqstore(dir.path())
        .args(["get", "nope"])
        .assert()
        .failure();
}

#[test]
fn delete_then_iter_omits_identifier() {
    let dir = tempdir().unwrap();

    seqstore(dir.path())
        .args(["add", "a"])
        .write_stdin("1")
        .assert()
        .success();
    seqstore(dir.path())
        .args(["add", "b"])
        .write_stdin("2")
        .assert()
        .success();
    seqstore(dir.path()).args(["delete", "a"]).assert().success();

    seqstore(dir.path())
        .arg("iter")
        .assert()
        .success()
        .stdout(predicate::str::contains("b").and(predicate::str::contains("a").not()));
}

#[test]
fn stat_reports_identifier_count() {
    let dir = tempdir().unwrap();
    seqstore(dir.path())
        .args(["add", "a"])
        .write_stdin("1")
        .assert()
        .success();

    seqstore(dir.path())
        .arg("stat")
        .assert()
        .success()
        .stdout(predicate::str::contains("identifiers: 1"));
}

#[test]
fn open_creates_expected_directory_layout() {
    let dir = tempdir().unwrap();
    seqstore(dir.path())
        .args(["add", "a"])
        .write_stdin("1")
        .assert()
        .success();

    let entries: Vec<String> = walkdir::WalkDir::new(dir.path())
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();

    assert!(entries.contains(&"seqstore".to_string()));
    assert!(entries.contains(&"index".to_string()));
    assert!(entries.contains(&"sequentialstorage.version".to_string()));
}
