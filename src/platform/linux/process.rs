use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::fd::RawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use nix::sched::{clone, CloneFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, Pid};

use crate::core::error::{Error, Result};
use crate::core::state;

/// Environment variables carrying the init context across the re-exec
/// boundary. Data crosses only through these and inherited fds.
pub const ENV_CONTAINER_ID: &str = "VESSEL_CONTAINER_ID";
pub const ENV_BUNDLE: &str = "VESSEL_BUNDLE";
pub const ENV_CONTAINER_DIR: &str = "VESSEL_CONTAINER_DIR";
pub const ENV_SYNC_FD: &str = "VESSEL_SYNC_FD";
pub const ENV_CONSOLE_SOCKET: &str = "VESSEL_CONSOLE_SOCKET";
pub const ENV_JOIN_PID: &str = "VESSEL_JOIN_PID";
pub const ENV_JOIN_NAMESPACES: &str = "VESSEL_JOIN_NAMESPACES";

const INIT_STACK_SIZE: usize = 1024 * 1024;

/// What the launcher passes to the re-executed init process.
pub struct SpawnArgs<'a> {
    pub id: &'a str,
    pub bundle: &'a Path,
    pub container_dir: &'a Path,
    pub console_socket: Option<&'a Path>,
    pub sync_fd: RawFd,
}

/// Spawn the container init: clone a child directly into the requested
/// namespace set, then immediately re-execute this binary under the hidden
/// `init` subcommand. The child learns everything it needs from the
/// `VESSEL_*` environment and the inherited sync fd.
pub fn spawn_init(flags: CloneFlags, args: &SpawnArgs) -> Result<Pid> {
    let exe = c_string("/proc/self/exe")?;
    let argv = [c_string("vessel")?, c_string("init")?];

    let mut env = vec![
        c_string(format!("{ENV_CONTAINER_ID}={}", args.id))?,
        c_string(format!("{ENV_BUNDLE}={}", args.bundle.display()))?,
        c_string(format!("{ENV_CONTAINER_DIR}={}", args.container_dir.display()))?,
        c_string(format!("{ENV_SYNC_FD}={}", args.sync_fd))?,
    ];
    if let Some(socket) = args.console_socket {
        env.push(c_string(format!("{ENV_CONSOLE_SOCKET}={}", socket.display()))?);
    }
    if let Ok(filter) = std::env::var("RUST_LOG") {
        env.push(c_string(format!("RUST_LOG={filter}"))?);
    }

    let mut stack = vec![0u8; INIT_STACK_SIZE];
    let child_main = Box::new(|| -> isize {
        // In the cloned child. Nothing but the exec happens here; all real
        // setup runs in the re-entered binary.
        match unistd::execve(&exe, &argv, &env) {
            Ok(infallible) => match infallible {},
            Err(_) => 127,
        }
    });

    log::debug!("cloning init with flags {flags:?}");
    let pid = unsafe {
        clone(
            child_main,
            &mut stack,
            flags,
            Some(Signal::SIGCHLD as libc::c_int),
        )
    }
    .map_err(|e| Error::ns("clone", e))?;

    Ok(pid)
}

fn c_string(s: impl Into<Vec<u8>>) -> Result<CString> {
    CString::new(s).map_err(|e| Error::ProcessLaunch(e.to_string()))
}

/// Wait for a direct child and map its exit status to a shell-style code
/// (128 + signal number for signal death).
pub fn wait_exit(pid: Pid) -> Result<i32> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(128 + sig as i32),
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(Error::sys("waiting for container process", e)),
        }
    }
}

/// Deliver a signal to a container init process.
pub fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    kill(Pid::from_raw(pid as i32), signal)
        .map_err(|e| Error::sys(format!("signaling pid {pid}"), e))
}

/// Parse a signal argument: a number (`9`), a short name (`KILL`) or a
/// full name (`SIGKILL`), case-insensitive.
pub fn parse_signal(value: &str) -> Result<Signal> {
    if let Ok(number) = value.parse::<i32>() {
        return Signal::try_from(number).map_err(|_| Error::InvalidSignal(value.to_string()));
    }

    let upper = value.to_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&name).map_err(|_| Error::InvalidSignal(value.to_string()))
}

/// Open the ready fifo for write and release the init blocked on it.
/// `ENXIO` on the nonblocking open means the read end is gone, i.e. the
/// init died while `created`.
pub fn release_exec_fifo(path: &Path) -> Result<()> {
    let mut fifo = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .map_err(|e| {
            if e.raw_os_error() == Some(libc::ENXIO) {
                Error::Child("init process is no longer waiting on the ready fifo".into())
            } else {
                Error::io(format!("opening {}", path.display()), e)
            }
        })?;
    fifo.write_all(&[0])
        .map_err(|e| Error::io("releasing ready fifo", e))?;
    drop(fifo);

    std::fs::remove_file(path).map_err(|e| Error::io(format!("removing {}", path.display()), e))
}

/// SIGKILL a container init and wait (bounded) for the process to
/// disappear. The init is generally not our child, so this polls rather
/// than reaps.
pub fn kill_and_wait(pid: u32, start_time: Option<u64>) -> Result<()> {
    match send_signal(pid, Signal::SIGKILL) {
        Ok(()) => {}
        // Already gone.
        Err(Error::Io(_, ref e)) if e.raw_os_error() == Some(libc::ESRCH) => return Ok(()),
        Err(e) => return Err(e),
    }

    // Reap if it happens to be our child; harmless otherwise.
    let _ = waitpid(Pid::from_raw(pid as i32), Some(nix::sys::wait::WaitPidFlag::WNOHANG));

    for _ in 0..50 {
        if !state::pid_alive(pid, start_time) {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(100));
        let _ =
            waitpid(Pid::from_raw(pid as i32), Some(nix::sys::wait::WaitPidFlag::WNOHANG));
    }
    Err(Error::Child(format!("pid {pid} did not exit after SIGKILL")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_signal_numbers_and_names() {
        assert_eq!(parse_signal("9").unwrap(), Signal::SIGKILL);
        assert_eq!(parse_signal("15").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("KILL").unwrap(), Signal::SIGKILL);
        assert_eq!(parse_signal("kill").unwrap(), Signal::SIGKILL);
        assert_eq!(parse_signal("SIGTERM").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("sigusr1").unwrap(), Signal::SIGUSR1);
    }

    #[test]
    fn parse_signal_rejects_garbage() {
        assert!(matches!(parse_signal("NOTASIG"), Err(Error::InvalidSignal(_))));
        assert!(matches!(parse_signal("0"), Err(Error::InvalidSignal(_))));
        assert!(matches!(parse_signal("-3"), Err(Error::InvalidSignal(_))));
        assert!(matches!(parse_signal("999"), Err(Error::InvalidSignal(_))));
    }

    #[test]
    fn release_fifo_without_reader_reports_dead_init() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("exec.fifo");
        nix::unistd::mkfifo(&path, nix::sys::stat::Mode::from_bits_truncate(0o600)).unwrap();

        match release_exec_fifo(&path) {
            Err(Error::Child(_)) => {}
            other => panic!("expected Child error, got {other:?}"),
        }
        // The fifo file stays for delete to clean up.
        assert!(path.exists());
    }

    #[test]
    fn release_fifo_with_reader_writes_and_unlinks() {
        use std::io::Read;

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("exec.fifo");
        nix::unistd::mkfifo(&path, nix::sys::stat::Mode::from_bits_truncate(0o600)).unwrap();

        // Hold a nonblocking read end open, the way the init does.
        let mut reader = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
            .unwrap();

        release_exec_fifo(&path).unwrap();
        assert!(!path.exists());

        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte).unwrap();
        assert_eq!(byte, [0]);
    }
}
