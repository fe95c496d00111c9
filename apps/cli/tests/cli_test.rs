use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// A command isolated from any real user or project configuration.
fn kestrel(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("kestrel").unwrap();
    cmd.current_dir(home.path()).env("HOME", home.path()).env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_version() {
    let home = TempDir::new().unwrap();
    kestrel(&home).arg("--version").assert().success().stdout(predicate::str::contains("kestrel 0.1.0"));
}

#[test]
fn test_help() {
    let home = TempDir::new().unwrap();
    kestrel(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Kestrel chats with a local model"))
        .stdout(predicate::str::contains("--print-config"));
}

#[test]
fn test_print_config_defaults() {
    let home = TempDir::new().unwrap();
    kestrel(&home)
        .arg("--print-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("pool_size = 32"))
        .stdout(predicate::str::contains("provider = \"ollama\""));
}

#[test]
fn test_print_config_applies_file_and_overrides() {
    let home = TempDir::new().unwrap();
    let config = home.path().join("custom.toml");
    std::fs::write(&config, "[bus]\npool_size = 3\n\n[model]\nname = \"from-file\"\n").unwrap();

    kestrel(&home)
        .arg("--config")
        .arg(&config)
        .arg("--model")
        .arg("from-flag")
        .arg("--mock")
        .arg("--print-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("pool_size = 3"))
        .stdout(predicate::str::contains("name = \"from-flag\""))
        .stdout(predicate::str::contains("provider = \"mock\""));
}

#[test]
fn test_local_config_is_discovered() {
    let home = TempDir::new().unwrap();
    std::fs::write(home.path().join(".kestrel.toml"), "[history]\nlimit = 7\n").unwrap();

    kestrel(&home).arg("--print-config").assert().success().stdout(predicate::str::contains("limit = 7"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let home = TempDir::new().unwrap();
    let config = home.path().join("bad.toml");
    std::fs::write(&config, "[bus]\npool_size = 0\n").unwrap();

    kestrel(&home)
        .arg("--config")
        .arg(&config)
        .arg("--print-config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("bus.pool_size"));
}

#[test]
fn test_missing_config_is_rejected() {
    let home = TempDir::new().unwrap();
    kestrel(&home)
        .arg("--config")
        .arg(home.path().join("absent.toml"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_mock_session_quits_cleanly() {
    let home = TempDir::new().unwrap();
    kestrel(&home)
        .arg("--mock")
        .write_stdin("/quit\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("kestrel ready"));
}

#[test]
fn test_mock_session_ends_on_eof() {
    let home = TempDir::new().unwrap();
    kestrel(&home).arg("--mock").write_stdin("").assert().success();
}
