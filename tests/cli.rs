//! CLI test cases.

use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    Command::cargo_bin("docai").unwrap()
}

#[test]
fn test_help() {
    cmd().arg("--help").assert().success();
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_schema_document() {
    cmd()
        .arg("schema")
        .arg("Document")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"title\""));
}

#[test]
fn test_schema_suggestion_result() {
    cmd()
        .arg("schema")
        .arg("SuggestionResult")
        .assert()
        .success()
        .stdout(predicate::str::contains("document_id"));
}

#[test]
fn test_ocr_single_file() {
    cmd()
        .arg("ocr")
        .arg("--config-path")
        .arg("tests/fixtures/config.toml")
        .arg("--input")
        .arg("tests/fixtures/sample.png")
        .assert()
        .success()
        .stdout(predicate::str::contains("Transcribe all text visible"));
}

#[test]
fn test_suggest_batch() {
    cmd()
        .arg("suggest")
        .arg("--config-path")
        .arg("tests/fixtures/config.toml")
        .arg("tests/fixtures/documents.json")
        .arg("--field")
        .arg("title")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"document_id\":1"));
}
