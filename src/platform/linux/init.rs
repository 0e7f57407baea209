use std::convert::Infallible;
use std::env;
use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::Read;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::process;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{self, ForkResult, Gid, Uid};

use crate::core::error::{Error, Result};
use crate::core::hooks::{self, HookKind};
use crate::core::model::{ContainerStatus, OciState};
use crate::core::spec::{NamespaceType, Spec};
use crate::core::state::EXEC_FIFO;
use crate::platform::linux::{console, mounts, namespaces, process as proc_util, sync};

/// Context the parent passed across the re-exec boundary.
struct InitContext {
    id: String,
    bundle: PathBuf,
    container_dir: PathBuf,
    console_socket: Option<PathBuf>,
}

impl InitContext {
    fn from_env() -> Result<(Self, sync::SyncSender)> {
        let sync_fd: i32 = required_env(proc_util::ENV_SYNC_FD)?
            .parse()
            .map_err(|_| Error::ProcessLaunch("sync fd is not a number".into()))?;
        // SAFETY: the fd was opened by the parent for exactly this handoff
        // and nothing else in this process knows about it.
        let sync = unsafe { sync::SyncSender::from_raw(sync_fd) };
        // The write end must vanish when the user command replaces us.
        sync.close_on_exec()?;

        let ctx = InitContext {
            id: required_env(proc_util::ENV_CONTAINER_ID)?,
            bundle: PathBuf::from(required_env(proc_util::ENV_BUNDLE)?),
            container_dir: PathBuf::from(required_env(proc_util::ENV_CONTAINER_DIR)?),
            console_socket: env::var(proc_util::ENV_CONSOLE_SOCKET).ok().map(PathBuf::from),
        };
        Ok((ctx, sync))
    }
}

fn required_env(name: &str) -> Result<String> {
    env::var(name).map_err(|_| Error::ProcessLaunch(format!("{name} is not set")))
}

/// Entry point of the hidden `init` subcommand: the first process inside
/// the new namespaces. On success this never returns, because the user
/// command has replaced the process. Every failure is reported to the
/// parent over the sync channel before exiting non-zero.
pub fn run() -> ! {
    let (ctx, sync) = match InitContext::from_env() {
        Ok(pair) => pair,
        Err(e) => {
            // Without a sync fd there is no channel back to the parent.
            eprintln!("vessel: init: {e}");
            process::exit(1);
        }
    };

    match setup_and_exec(&ctx, &sync) {
        Ok(infallible) => match infallible {},
        Err(e) => {
            let _ = sync.signal_error(&e.to_string());
            process::exit(1);
        }
    }
}

fn setup_and_exec(ctx: &InitContext, sync: &sync::SyncSender) -> Result<Infallible> {
    let spec = Spec::load(&ctx.bundle)?;
    let rootfs = std::fs::canonicalize(spec.rootfs_path(&ctx.bundle))
        .map_err(|e| Error::io("resolving rootfs", e))?;

    // Namespaces declared with a path were excluded from the clone flags;
    // enter them now, before anything namespace-sensitive runs.
    namespaces::join_paths(spec.namespaces())?;

    // The ready fifo: created here, held open read-only (nonblocking, so
    // the open does not wait for a writer) for the whole `created` window.
    // The fd survives pivot_root even though the path does not.
    let fifo_path = ctx.container_dir.join(EXEC_FIFO);
    unistd::mkfifo(&fifo_path, Mode::S_IRUSR | Mode::S_IWUSR)
        .map_err(|e| Error::sys("creating ready fifo", e))?;
    let fifo = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(&fifo_path)
        .map_err(|e| Error::io("opening ready fifo", e))?;

    if spec.has_namespace(NamespaceType::Uts) {
        if let Some(hostname) = &spec.hostname {
            namespaces::set_hostname(hostname)?;
        }
    }

    // Terminal plumbing happens before any mount work: the console socket
    // and the devpts slave both live on the host side of the pivot. With a
    // terminal but no console socket, the caller's stdio is inherited.
    let pty = match (spec.process.terminal, &ctx.console_socket) {
        (true, Some(socket)) => {
            let pty = console::open_pty()?;
            console::send_master(socket, &pty)?;
            console::attach_slave(&pty.slave_path)?;
            Some(pty)
        }
        _ => None,
    };

    if spec.has_namespace(NamespaceType::Mount) {
        mounts::make_private()?;
        mounts::bind_rootfs(&rootfs)?;
        mounts::apply_mounts(&spec.mounts, &rootfs)?;
        let devices = spec.linux.as_ref().map(|l| l.devices.as_slice()).unwrap_or(&[]);
        mounts::create_devices(devices, &rootfs)?;
        if let Some(pty) = &pty {
            mounts::bind_console(&rootfs, &pty.slave_path)?;
        }
    }

    // createContainer runs from within the namespaces, before the pivot
    // completes. The pid is this process as it sees itself.
    let hook_state = |status| OciState {
        oci_version: spec.oci_version.clone(),
        id: ctx.id.clone(),
        status,
        pid: Some(unistd::getpid().as_raw() as u32),
        bundle: ctx.bundle.clone(),
        annotations: spec.annotations.clone(),
    };
    hooks::run(
        HookKind::CreateContainer,
        spec.hooks.as_ref(),
        &hook_state(ContainerStatus::Creating),
    )?;

    if spec.has_namespace(NamespaceType::Mount) {
        mounts::pivot_root(&rootfs)?;
    }
    unistd::chdir(&spec.process.cwd)
        .map_err(|e| Error::sys(format!("chdir {}", spec.process.cwd.display()), e))?;

    hooks::run(
        HookKind::StartContainer,
        spec.hooks.as_ref(),
        &hook_state(ContainerStatus::Created),
    )?;

    // Handshake: from here on the parent treats the container as created.
    sync.signal_ready()?;

    // Block on the fifo until `start` releases us. EOF counts too.
    fcntl(fifo.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_RDONLY))
        .map_err(|e| Error::sys("unsetting fifo nonblock", e))?;
    let mut gate = [0u8; 1];
    let mut fifo = fifo;
    loop {
        match fifo.read(&mut gate) {
            Ok(_) => break,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::io("waiting on ready fifo", e)),
        }
    }
    drop(fifo);

    let user = &spec.process.user;
    unistd::setgid(Gid::from_raw(user.gid)).map_err(|e| Error::sys("setgid", e))?;
    unistd::setuid(Uid::from_raw(user.uid)).map_err(|e| Error::sys("setuid", e))?;

    exec(&spec.process.args, &spec.process.env)
}

/// Replace this process with the user command. The sync write end carries
/// FD_CLOEXEC, so the parent sees EOF at exactly this moment.
fn exec(args: &[String], env: &[String]) -> Result<Infallible> {
    let argv = to_c_strings(args)?;
    let program = argv
        .first()
        .ok_or_else(|| Error::InvalidSpec("process.args must not be empty".into()))?;

    let mut envp = to_c_strings(env)?;
    if !env.iter().any(|e| e.starts_with("PATH=")) {
        envp.push(
            CString::new("PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin")
                .map_err(|e| Error::ProcessLaunch(e.to_string()))?,
        );
    }

    unistd::execvpe(program, &argv, &envp)
        .map_err(|e| Error::ProcessLaunch(format!("execvpe {:?}: {e}", args[0])))?;
    unreachable!("execvpe replaced the process");
}

fn to_c_strings(values: &[String]) -> Result<Vec<CString>> {
    values
        .iter()
        .map(|v| CString::new(v.as_str()).map_err(|e| Error::ProcessLaunch(e.to_string())))
        .collect()
}

/// Entry point of the hidden `exec-init` subcommand: join the namespaces
/// of a running container, then fork so the child lands in the joined pid
/// namespace and exec the requested command. Returns the command's exit
/// code to the caller.
pub fn run_exec(cmd: &[String]) -> Result<i32> {
    let target_pid: u32 = required_env(proc_util::ENV_JOIN_PID)?
        .parse()
        .map_err(|_| Error::ProcessLaunch("join pid is not a number".into()))?;
    let join_list: Vec<NamespaceType> = required_env(proc_util::ENV_JOIN_NAMESPACES)?
        .split(',')
        .filter(|s| !s.is_empty())
        .map(parse_ns_name)
        .collect::<Result<_>>()?;

    namespaces::join(target_pid, &join_list)?;

    // setns(CLONE_NEWPID) affects children, not the caller; the fork puts
    // the command inside the joined pid namespace.
    // SAFETY: this process is single-threaded and the child only execs.
    match unsafe { unistd::fork() }.map_err(|e| Error::sys("fork after setns", e))? {
        ForkResult::Parent { child } => proc_util::wait_exit(child),
        ForkResult::Child => {
            let env = [
                "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
                "TERM=xterm".to_string(),
            ];
            if let Err(e) = exec(cmd, &env) {
                eprintln!("vessel: exec: {e}");
            }
            process::exit(127);
        }
    }
}

fn parse_ns_name(name: &str) -> Result<NamespaceType> {
    match name {
        "pid" => Ok(NamespaceType::Pid),
        "net" => Ok(NamespaceType::Network),
        "mnt" => Ok(NamespaceType::Mount),
        "ipc" => Ok(NamespaceType::Ipc),
        "uts" => Ok(NamespaceType::Uts),
        "user" => Ok(NamespaceType::User),
        "cgroup" => Ok(NamespaceType::Cgroup),
        other => Err(Error::ProcessLaunch(format!("unknown namespace {other:?}"))),
    }
}
