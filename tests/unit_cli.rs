/// Tests for the CLI surface that need no privileges: argument handling,
/// `spec` output, and error reporting against an empty state root.

use std::process::{Command, Output};

use tempfile::TempDir;

fn vessel(root: &TempDir, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_vessel"))
        .arg("--root")
        .arg(root.path().join("state"))
        .args(args)
        .output()
        .expect("failed to execute vessel")
}

#[test]
fn cli_help_works() {
    let output = Command::new(env!("CARGO_BIN_EXE_vessel"))
        .arg("--help")
        .output()
        .expect("failed to execute vessel --help");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success());
    assert!(stdout.contains("vessel"), "help output should mention vessel");
    for command in ["create", "start", "run", "state", "kill", "delete", "list"] {
        assert!(stdout.contains(command), "help should list {command}");
    }
    // The child-side subcommands stay hidden.
    assert!(!stdout.contains("exec-init"));
}

#[test]
fn spec_writes_default_config() {
    let tmp = tempfile::tempdir().unwrap();
    let bundle = tmp.path().join("bundle");
    std::fs::create_dir_all(&bundle).unwrap();

    let output = vessel(&tmp, &["spec", "-b", bundle.to_str().unwrap()]);
    assert!(
        output.status.success(),
        "spec should succeed, stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let config: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(bundle.join("config.json")).unwrap())
            .unwrap();

    assert!(!config["ociVersion"].as_str().unwrap().is_empty());
    assert_eq!(config["process"]["args"], serde_json::json!(["sh"]));

    let namespaces: Vec<&str> = config["linux"]["namespaces"]
        .as_array()
        .unwrap()
        .iter()
        .map(|ns| ns["type"].as_str().unwrap())
        .collect();
    for expected in ["pid", "network", "ipc", "uts", "mount"] {
        assert!(namespaces.contains(&expected), "missing namespace {expected}");
    }
}

#[test]
fn spec_refuses_to_overwrite() {
    let tmp = tempfile::tempdir().unwrap();
    let bundle = tmp.path().join("bundle");
    std::fs::create_dir_all(&bundle).unwrap();
    std::fs::write(bundle.join("config.json"), "{}").unwrap();

    let output = vessel(&tmp, &["spec", "-b", bundle.to_str().unwrap()]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("already exists"), "got: {stderr}");
}

#[test]
fn create_rejects_bad_id() {
    let tmp = tempfile::tempdir().unwrap();
    let output = vessel(&tmp, &["create", "bad/id"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid container id"), "got: {stderr}");
}

#[test]
fn create_without_config_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let bundle = tmp.path().join("bundle");
    std::fs::create_dir_all(&bundle).unwrap();

    let output = vessel(&tmp, &["create", "test", "-b", bundle.to_str().unwrap()]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("config.json"), "got: {stderr}");
}

#[test]
fn state_of_unknown_container_is_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let output = vessel(&tmp, &["state", "ghost"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("does not exist"), "got: {stderr}");
}

#[test]
fn kill_and_delete_unknown_container_fail() {
    let tmp = tempfile::tempdir().unwrap();

    let output = vessel(&tmp, &["kill", "ghost", "9"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("does not exist"));

    let output = vessel(&tmp, &["delete", "ghost"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("does not exist"));
}

#[test]
fn exec_on_unknown_container_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let output = vessel(&tmp, &["exec", "ghost", "--", "true"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("does not exist"));
}

#[test]
fn list_on_empty_root_prints_header_only() {
    let tmp = tempfile::tempdir().unwrap();
    let output = vessel(&tmp, &["list"]);
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 1, "expected only a header, got:\n{stdout}");
    assert!(lines[0].contains("ID"));
    assert!(lines[0].contains("STATUS"));
}
