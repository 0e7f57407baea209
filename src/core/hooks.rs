use std::fmt;
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::core::error::{Error, Result};
use crate::core::model::OciState;
use crate::core::spec::{Hook, Hooks};

/// The six OCI lifecycle points at which user hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    /// After namespaces are created, before the user command. Deprecated
    /// upstream but still honored.
    Prestart,
    /// Runtime namespace set up, before pivot. Host side.
    CreateRuntime,
    /// Inside the container namespaces, before the pivot completes.
    CreateContainer,
    /// Inside the container namespaces, just before exec.
    StartContainer,
    /// After the user command has started. Host side.
    Poststart,
    /// After the user command has exited. Host side.
    Poststop,
}

impl HookKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prestart => "prestart",
            Self::CreateRuntime => "createRuntime",
            Self::CreateContainer => "createContainer",
            Self::StartContainer => "startContainer",
            Self::Poststart => "poststart",
            Self::Poststop => "poststop",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Hooks {
    /// The hook list for a lifecycle point; empty when unset.
    pub fn list(&self, kind: HookKind) -> &[Hook] {
        let list = match kind {
            HookKind::Prestart => &self.prestart,
            HookKind::CreateRuntime => &self.create_runtime,
            HookKind::CreateContainer => &self.create_container,
            HookKind::StartContainer => &self.start_container,
            HookKind::Poststart => &self.poststart,
            HookKind::Poststop => &self.poststop,
        };
        list.as_deref().unwrap_or(&[])
    }
}

/// Run all hooks of one kind, in list order, delivering `state` as a JSON
/// document on each hook's stdin. The first failing hook aborts the rest.
pub fn run(kind: HookKind, hooks: Option<&Hooks>, state: &OciState) -> Result<()> {
    let Some(hooks) = hooks else { return Ok(()) };
    for hook in hooks.list(kind) {
        run_one(kind, hook, state)?;
    }
    Ok(())
}

/// Like [`run`], but failures are logged and swallowed. Used for `poststop`,
/// which must never abort teardown.
pub fn run_swallowed(kind: HookKind, hooks: Option<&Hooks>, state: &OciState) {
    if let Err(e) = run(kind, hooks, state) {
        log::warn!("ignoring {kind} hook failure: {e}");
    }
}

fn run_one(kind: HookKind, hook: &Hook, state: &OciState) -> Result<()> {
    let payload =
        serde_json::to_vec(state).map_err(|e| Error::json("serializing hook state", e))?;
    let display_path = hook.path.display().to_string();

    let mut command = Command::new(&hook.path);
    if let Some((argv0, rest)) = hook.args.as_deref().and_then(|a| a.split_first()) {
        command.arg0(argv0);
        command.args(rest);
    }
    command.env_clear();
    for pair in hook.env.as_deref().unwrap_or(&[]) {
        if let Some((key, value)) = pair.split_once('=') {
            command.env(key, value);
        }
    }
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .map_err(|e| Error::io(format!("spawning {kind} hook {display_path}"), e))?;
    let hook_pid = Pid::from_raw(child.id() as i32);

    if let Some(mut stdin) = child.stdin.take() {
        // A hook that exits without reading stdin is allowed; EPIPE here
        // must not fail the lifecycle operation.
        let _ = stdin.write_all(&payload);
    }

    let output = match hook.timeout {
        Some(secs) => {
            // Wait in a helper thread so the timeout can fire while the
            // hook is still running; on expiry the hook is killed by pid.
            let (tx, rx) = mpsc::channel();
            thread::spawn(move || {
                let _ = tx.send(child.wait_with_output());
            });
            match rx.recv_timeout(Duration::from_secs(secs)) {
                Ok(result) => result
                    .map_err(|e| Error::io(format!("waiting for {kind} hook"), e))?,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    let _ = kill(hook_pid, Signal::SIGKILL);
                    return Err(Error::HookTimeout {
                        kind,
                        path: display_path,
                    });
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(Error::io(
                        format!("waiting for {kind} hook"),
                        std::io::Error::from(std::io::ErrorKind::BrokenPipe),
                    ));
                }
            }
        }
        None => child
            .wait_with_output()
            .map_err(|e| Error::io(format!("waiting for {kind} hook"), e))?,
    };

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Err(Error::HookFailed {
        kind,
        path: display_path,
        code: output.status.code().unwrap_or(-1),
        stderr: if stderr.is_empty() {
            "(no stderr)".to_string()
        } else {
            stderr
        },
    })
}
