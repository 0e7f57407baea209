/// End-to-end lifecycle tests. These require:
/// 1. Running on Linux as root (namespaces, pivot_root).
/// 2. A rootfs extracted at `tests/rootfs/` (or the path in
///    `VESSEL_TEST_ROOTFS`), e.g. an Alpine minirootfs:
///
/// ```bash
/// mkdir -p tests/rootfs
/// curl -L https://dl-cdn.alpinelinux.org/alpine/v3.20/releases/x86_64/alpine-minirootfs-3.20.3-x86_64.tar.gz \
///     | tar -xz -C tests/rootfs
/// ```
///
/// Tests are skipped when the prerequisites are missing.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::Duration;

use tempfile::TempDir;

fn rootfs_path() -> String {
    std::env::var("VESSEL_TEST_ROOTFS").unwrap_or_else(|_| "tests/rootfs".to_string())
}

fn can_run() -> bool {
    if cfg!(not(target_os = "linux")) {
        eprintln!("SKIP: not on Linux");
        return false;
    }
    if !nix::unistd::geteuid().is_root() {
        eprintln!("SKIP: not running as root (euid != 0)");
        return false;
    }
    let rfs = rootfs_path();
    if !Path::new(&rfs).join("bin").exists() {
        eprintln!("SKIP: rootfs not found at {rfs}/bin");
        return false;
    }
    true
}

fn vessel(root: &TempDir, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_vessel"))
        .arg("--root")
        .arg(root.path().join("state"))
        .args(args)
        .output()
        .expect("failed to execute vessel")
}

/// Write a bundle whose rootfs is the shared test rootfs (absolute path)
/// and whose process runs `args`.
fn write_bundle(dir: &Path, args: &[&str], hooks: Option<serde_json::Value>) -> PathBuf {
    let rootfs = std::fs::canonicalize(rootfs_path()).unwrap();
    let mut config = serde_json::json!({
        "ociVersion": "1.0.2",
        "root": {"path": rootfs},
        "process": {
            "args": args,
            "env": ["PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"],
            "cwd": "/"
        },
        "hostname": "vessel-test",
        "mounts": [
            {
                "destination": "/proc",
                "type": "proc",
                "source": "proc",
                "options": ["nosuid", "noexec", "nodev"]
            }
        ],
        "linux": {
            "namespaces": [
                {"type": "pid"},
                {"type": "ipc"},
                {"type": "uts"},
                {"type": "mount"}
            ]
        }
    });
    if let Some(hooks) = hooks {
        config["hooks"] = hooks;
    }

    let bundle = dir.join("bundle");
    std::fs::create_dir_all(&bundle).unwrap();
    std::fs::write(
        bundle.join("config.json"),
        serde_json::to_string_pretty(&config).unwrap(),
    )
    .unwrap();
    bundle
}

fn parse_state(output: &Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).expect("state output should be JSON")
}

#[test]
fn create_state_delete_round_trip() {
    if !can_run() {
        return;
    }

    let tmp = tempfile::tempdir().unwrap();
    let bundle = write_bundle(tmp.path(), &["/bin/sleep", "3600"], None);

    let output = vessel(&tmp, &["create", "test", "-b", bundle.to_str().unwrap()]);
    assert!(
        output.status.success(),
        "create failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let output = vessel(&tmp, &["state", "test"]);
    assert!(output.status.success());
    let state = parse_state(&output);
    assert_eq!(state["id"], "test");
    assert_eq!(state["status"], "created");
    assert!(state["pid"].as_u64().unwrap() > 0);
    assert_eq!(
        state["bundle"].as_str().unwrap(),
        std::fs::canonicalize(&bundle).unwrap().to_str().unwrap()
    );

    let output = vessel(&tmp, &["delete", "-f", "test"]);
    assert!(
        output.status.success(),
        "delete failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let output = vessel(&tmp, &["state", "test"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("does not exist"));
}

#[test]
fn run_detached_then_kill_then_delete() {
    if !can_run() {
        return;
    }

    let tmp = tempfile::tempdir().unwrap();
    let bundle = write_bundle(tmp.path(), &["/bin/sleep", "3600"], None);

    let output = vessel(&tmp, &["run", "-d", "rund", "-b", bundle.to_str().unwrap()]);
    assert!(
        output.status.success(),
        "run -d failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let output = vessel(&tmp, &["state", "rund"]);
    let state = parse_state(&output);
    assert_eq!(state["status"], "running");

    let output = vessel(&tmp, &["kill", "rund", "9"]);
    assert!(output.status.success());

    // Give the kernel a moment to tear the init down.
    std::thread::sleep(Duration::from_millis(200));

    let output = vessel(&tmp, &["state", "rund"]);
    let state = parse_state(&output);
    assert_eq!(state["status"], "stopped");

    let output = vessel(&tmp, &["delete", "rund"]);
    assert!(output.status.success());

    let output = vessel(&tmp, &["state", "rund"]);
    assert!(!output.status.success());
}

#[test]
fn run_propagates_exit_code() {
    if !can_run() {
        return;
    }

    let tmp = tempfile::tempdir().unwrap();
    let bundle = write_bundle(tmp.path(), &["/bin/sh", "-c", "exit 42"], None);

    let output = vessel(&tmp, &["run", "code", "-b", bundle.to_str().unwrap()]);
    assert_eq!(
        output.status.code(),
        Some(42),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn duplicate_create_is_rejected() {
    if !can_run() {
        return;
    }

    let tmp = tempfile::tempdir().unwrap();
    let bundle = write_bundle(tmp.path(), &["/bin/sleep", "3600"], None);

    let output = vessel(&tmp, &["create", "dup", "-b", bundle.to_str().unwrap()]);
    assert!(output.status.success());

    let output = vessel(&tmp, &["create", "dup", "-b", bundle.to_str().unwrap()]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("already exists"));

    vessel(&tmp, &["delete", "-f", "dup"]);
}

#[test]
fn prestart_hook_receives_state_json() {
    if !can_run() {
        return;
    }

    let tmp = tempfile::tempdir().unwrap();
    let sink = tmp.path().join("hook-stdin.json");
    let hooks = serde_json::json!({
        "prestart": [{
            "path": "/bin/sh",
            "args": ["sh", "-c", format!("cat > {}", sink.display())]
        }]
    });
    let bundle = write_bundle(tmp.path(), &["/bin/sleep", "3600"], Some(hooks));

    let output = vessel(&tmp, &["create", "hooked", "-b", bundle.to_str().unwrap()]);
    assert!(
        output.status.success(),
        "create failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let doc: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&sink).unwrap()).unwrap();
    assert_eq!(doc["id"], "hooked");
    assert_eq!(doc["status"], "creating");
    assert!(doc["pid"].as_u64().unwrap() > 0);
    assert!(doc["ociVersion"].as_str().is_some());
    assert!(doc["bundle"].as_str().is_some());

    vessel(&tmp, &["delete", "-f", "hooked"]);
}

#[test]
fn failing_prestart_hook_aborts_create() {
    if !can_run() {
        return;
    }

    let tmp = tempfile::tempdir().unwrap();
    let witness = tmp.path().join("witness");
    let hooks = serde_json::json!({
        "prestart": [
            {"path": "/bin/sh", "args": ["sh", "-c", "exit 1"]},
            {"path": "/bin/sh", "args": ["sh", "-c", format!("touch {}", witness.display())]}
        ]
    });
    let bundle = write_bundle(tmp.path(), &["/bin/sleep", "3600"], Some(hooks));

    let output = vessel(&tmp, &["create", "doomed", "-b", bundle.to_str().unwrap()]);
    assert!(!output.status.success());
    assert!(!witness.exists(), "hook after a failed hook must not run");

    // The failed create must leave nothing behind.
    let output = vessel(&tmp, &["state", "doomed"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("does not exist"));
}
