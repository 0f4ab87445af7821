use std::path::Path;

use reloader::models::command::{CommandSpec, SessionConfig};
use reloader::AppError;

#[test]
fn validate_trims_program_and_resolves_relative_dir() {
    let temp = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir(temp.path().join("app")).expect("mkdir");
    let mut spec = CommandSpec::new("  go  ", "app").args(["run", "."]);

    spec.validate(temp.path()).expect("valid spec");

    assert_eq!(spec.program, "go");
    assert!(spec.dir.is_absolute());
    assert_eq!(
        spec.dir,
        temp.path().join("app").canonicalize().expect("canonical")
    );
    assert_eq!(spec.args, vec!["run", "."]);
}

#[test]
fn validate_keeps_absolute_dir() {
    let temp = tempfile::tempdir().expect("tempdir");
    let absolute = temp.path().canonicalize().expect("canonical");
    let mut spec = CommandSpec::new("make", &absolute);

    spec.validate(Path::new("/definitely/not/used")).expect("valid");
    assert_eq!(spec.dir, absolute);
}

#[test]
fn validate_rejects_blank_program() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut spec = CommandSpec::new("   ", ".");

    let err = spec.validate(temp.path()).expect_err("blank program");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn validate_rejects_missing_dir() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut spec = CommandSpec::new("make", "missing");

    let err = spec.validate(temp.path()).expect_err("no such directory");
    assert!(err.to_string().contains("missing"), "got {err}");
}

#[test]
fn validate_rejects_file_as_dir() {
    let temp = tempfile::tempdir().expect("tempdir");
    std::fs::write(temp.path().join("file"), "").expect("write");
    let mut spec = CommandSpec::new("make", "file");

    let err = spec.validate(temp.path()).expect_err("not a directory");
    assert!(err.to_string().contains("not a directory"), "got {err}");
}

#[test]
fn command_line_keeps_dir_unresolved() {
    let spec = CommandSpec::from_command_line("cargo run --bin app", "rel").expect("program");

    assert_eq!(spec.dir, Path::new("rel"));
    assert_eq!(spec.to_string(), "cargo run --bin app");
}

#[test]
fn session_config_starts_without_hooks() {
    let config = SessionConfig::new(CommandSpec::new("server", "."));

    assert!(config.before_hooks.is_empty());
    assert!(config.after_hooks.is_empty());
    assert_eq!(config.main_command.program, "server");
}

#[test]
fn env_overrides_accumulate() {
    let spec = CommandSpec::new("server", ".")
        .env("PORT", "8080")
        .env("MODE", "dev")
        .env("PORT", "9090");

    assert_eq!(spec.env.len(), 2);
    assert_eq!(spec.env["PORT"], "9090");
}
