use assert_cmd::Command;
use predicates::prelude::*;

fn sdpcfg() -> Command {
    let mut cmd = Command::cargo_bin("sdpcfg").expect("binary builds");
    // Keep the tests off any real database.
    cmd.env("SDP_CONFIG_BACKEND", "memory");
    cmd
}

#[test]
fn help_lists_commands() {
    sdpcfg()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("get"))
        .stdout(predicate::str::contains("list"))
        .stdout(predicate::str::contains("process"))
        .stdout(predicate::str::contains("deploy"));
}

#[test]
fn get_reports_missing_key() {
    sdpcfg()
        .args(["get", "/x"])
        .assert()
        .success()
        .stdout(predicate::str::contains("/x does not exist"));
}

#[test]
fn invalid_path_is_an_error() {
    sdpcfg()
        .args(["get", "x"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid path"));
}

#[test]
fn update_of_missing_key_fails() {
    sdpcfg()
        .args(["update", "/missing", "v"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn bad_workflow_spec_is_rejected() {
    sdpcfg()
        .args(["process", "realtime:only-two"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("type:id:version"));
}
