use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command as SysCommand;

use anyhow::{bail, Context, Result};
use nix::unistd::Pid;

use crate::cli::{Cli, Command};
use crate::core::error::Error;
use crate::core::hooks::{self, HookKind};
use crate::core::id;
use crate::core::model::{ContainerState, ContainerStatus};
use crate::core::spec::{NamespaceType, Spec, CONFIG_FILE};
use crate::core::state::{self, Store};
use crate::platform::linux::{init, namespaces, process, sync};
use crate::util;

/// Dispatch a parsed CLI command. Returns the process exit code.
pub fn dispatch(cli: Cli) -> Result<i32> {
    // The hidden child-side subcommands never touch the store.
    match &cli.command {
        Command::Init => init::run(),
        Command::ExecInit { cmd } => {
            return Ok(init::run_exec(cmd)?);
        }
        _ => {}
    }

    let store = Store::open(cli.root.clone())?;

    match cli.command {
        Command::Spec { bundle } => cmd_spec(&bundle).map(|_| 0),
        Command::Create {
            id,
            bundle,
            pid_file,
            console_socket,
        } => cmd_create(&store, &id, &bundle, pid_file.as_deref(), console_socket.as_deref())
            .map(|_| 0),
        Command::Start { id } => cmd_start(&store, &id).map(|_| 0),
        Command::Run {
            id,
            bundle,
            pid_file,
            console_socket,
            detach,
        } => cmd_run(
            &store,
            &id,
            &bundle,
            pid_file.as_deref(),
            console_socket.as_deref(),
            detach,
        ),
        Command::State { id } => cmd_state(&store, &id).map(|_| 0),
        Command::Kill { id, signal } => cmd_kill(&store, &id, &signal).map(|_| 0),
        Command::Delete { id, force } => cmd_delete(&store, &id, force).map(|_| 0),
        Command::List => cmd_list(&store).map(|_| 0),
        Command::Exec { id, cmd } => cmd_exec(&store, &id, &cmd),
        Command::Init | Command::ExecInit { .. } => unreachable!("handled above"),
    }
}

// ─── spec ───────────────────────────────────────────────────────────────────

fn cmd_spec(bundle: &Path) -> Result<()> {
    let path = bundle.join(CONFIG_FILE);
    if path.exists() {
        bail!("{} already exists", path.display());
    }

    let spec = Spec::default_spec();
    let json = serde_json::to_string_pretty(&spec).context("serializing default spec")?;
    util::fs::write_file(&path, &json)?;
    Ok(())
}

// ─── create ─────────────────────────────────────────────────────────────────

fn cmd_create(
    store: &Store,
    id: &str,
    bundle: &Path,
    pid_file: Option<&Path>,
    console_socket: Option<&Path>,
) -> Result<ContainerState> {
    id::validate(id)?;
    let bundle = fs::canonicalize(bundle)
        .with_context(|| format!("resolving bundle {}", bundle.display()))?;
    let spec = Spec::load(&bundle)?;
    let rootfs = fs::canonicalize(spec.rootfs_path(&bundle))
        .with_context(|| format!("resolving rootfs of {}", bundle.display()))?;
    if rootfs == Path::new("/") {
        bail!("refusing to use / as a container rootfs");
    }

    store.claim(id)?;

    let mut state = ContainerState::new(id, &bundle, &rootfs, spec.clone());
    store.save(&state)?;

    match launch(store, &spec, &mut state, console_socket) {
        Ok(()) => {}
        Err(e) => {
            // `creating` must not survive a failed create: tear down the
            // child (if any) and the directory, then report.
            if state.pid != 0 {
                if let Err(cleanup) = process::kill_and_wait(state.pid, None) {
                    log::warn!("cleanup after failed create: {cleanup}");
                }
            }
            if let Err(cleanup) = store.remove(id) {
                log::warn!("cleanup after failed create: {cleanup}");
            }
            return Err(e).with_context(|| format!("creating container {id}"));
        }
    }

    if let Some(pid_file) = pid_file {
        state::write_pid_file(pid_file, state.pid)?;
    }
    Ok(state)
}

/// The parent half of the namespace launcher: spawn the init, write id
/// maps, run the host-side create hooks, then wait for the child's ready
/// signal before committing `created`.
fn launch(
    store: &Store,
    spec: &Spec,
    state: &mut ContainerState,
    console_socket: Option<&Path>,
) -> Result<()> {
    let flags = namespaces::clone_flags(spec.namespaces());
    let (receiver, sender) = sync::sync_pair()?;

    let pid = process::spawn_init(
        flags,
        &process::SpawnArgs {
            id: &state.id,
            bundle: &state.bundle,
            container_dir: &store.container_dir(&state.id),
            console_socket,
            sync_fd: sender.as_raw_fd(),
        },
    )?;
    // The child inherited its own copy of the write end.
    drop(sender);
    state.pid = pid.as_raw() as u32;
    // The on-disk record carries the pid from here on, so a create killed
    // mid-flight never leaves an unreapable `creating` entry behind.
    store.save(state)?;
    log::debug!("spawned init {pid} for container {}", state.id);

    if spec.has_namespace(NamespaceType::User) {
        if let Some(linux) = &spec.linux {
            namespaces::write_id_mappings(pid, linux)?;
        }
    }

    let oci = state.oci_state();
    hooks::run(HookKind::Prestart, spec.hooks.as_ref(), &oci)?;
    hooks::run(HookKind::CreateRuntime, spec.hooks.as_ref(), &oci)?;

    receiver.wait_ready()?;

    state.status = ContainerStatus::Created;
    state.process_start_time = state::process_start_time(state.pid);
    store.save(state)?;
    Ok(())
}

// ─── start ──────────────────────────────────────────────────────────────────

fn cmd_start(store: &Store, id: &str) -> Result<ContainerState> {
    let mut state = store.load(id)?;
    store.refresh(&mut state)?;
    if !state.status.can_start() {
        return Err(Error::InvalidState(state.status).into());
    }

    process::release_exec_fifo(&store.fifo_path(id))
        .with_context(|| format!("starting container {id}"))?;

    state.status = ContainerStatus::Running;
    store.save(&state)?;

    let config = state.config.clone();
    hooks::run(
        HookKind::Poststart,
        config.as_ref().and_then(|c| c.hooks.as_ref()),
        &state.oci_state(),
    )?;
    Ok(state)
}

// ─── run ────────────────────────────────────────────────────────────────────

fn cmd_run(
    store: &Store,
    id: &str,
    bundle: &Path,
    pid_file: Option<&Path>,
    console_socket: Option<&Path>,
    detach: bool,
) -> Result<i32> {
    let state = cmd_create(store, id, bundle, pid_file, console_socket)?;
    let state = cmd_start(store, id).map_err(|e| {
        // The created-but-unstartable container would otherwise linger.
        if let Err(cleanup) = process::kill_and_wait(state.pid, state.process_start_time) {
            log::warn!("cleanup after failed start: {cleanup}");
        }
        let _ = store.remove(id);
        e
    })?;

    if detach {
        return Ok(0);
    }

    // The init is our direct child here, so a real waitpid applies.
    let exit_code = process::wait_exit(Pid::from_raw(state.pid as i32))?;

    let mut state = store.load(id)?;
    state.status = ContainerStatus::Stopped;
    store.save(&state)?;

    hooks::run_swallowed(
        HookKind::Poststop,
        state.config.as_ref().and_then(|c| c.hooks.as_ref()),
        &state.oci_state(),
    );
    if let Err(e) = store.remove(id) {
        log::warn!("removing state of exited container {id}: {e}");
    }

    Ok(exit_code)
}

// ─── state ──────────────────────────────────────────────────────────────────

fn cmd_state(store: &Store, id: &str) -> Result<()> {
    let mut state = store.load(id)?;
    store.refresh(&mut state)?;

    let json = serde_json::to_string_pretty(&state.oci_state())
        .context("serializing container state")?;
    println!("{json}");
    Ok(())
}

// ─── kill ───────────────────────────────────────────────────────────────────

fn cmd_kill(store: &Store, id: &str, signal: &str) -> Result<()> {
    let mut state = store.load(id)?;
    store.refresh(&mut state)?;
    if !state.status.can_kill() {
        return Err(Error::InvalidState(state.status).into());
    }

    let signal = process::parse_signal(signal)?;
    process::send_signal(state.pid, signal)
        .with_context(|| format!("killing container {id}"))?;
    Ok(())
}

// ─── delete ─────────────────────────────────────────────────────────────────

fn cmd_delete(store: &Store, id: &str, force: bool) -> Result<()> {
    let mut state = store.load(id)?;
    store.refresh(&mut state)?;

    match state.status {
        ContainerStatus::Running if !force => {
            return Err(Error::InvalidState(state.status).into());
        }
        ContainerStatus::Running | ContainerStatus::Created => {
            process::kill_and_wait(state.pid, state.process_start_time)
                .with_context(|| format!("killing container {id}"))?;
        }
        // A `creating` record that survived refresh belongs to a crashed
        // create whose init is still around; reap it before removing.
        ContainerStatus::Creating if state.pid != 0 => {
            process::kill_and_wait(state.pid, state.process_start_time)
                .with_context(|| format!("killing container {id}"))?;
        }
        ContainerStatus::Creating | ContainerStatus::Stopped => {}
    }

    // From here on every cleanup step is attempted regardless of earlier
    // failures.
    hooks::run_swallowed(
        HookKind::Poststop,
        state.config.as_ref().and_then(|c| c.hooks.as_ref()),
        &state.oci_state(),
    );

    let fifo = store.fifo_path(id);
    if fifo.exists() {
        if let Err(e) = fs::remove_file(&fifo) {
            log::warn!("removing {}: {e}", fifo.display());
        }
    }
    store.remove(id)?;
    Ok(())
}

// ─── list ───────────────────────────────────────────────────────────────────

fn cmd_list(store: &Store) -> Result<()> {
    println!(
        "{:<24} {:<8} {:<10} {:<24} {}",
        "ID", "PID", "STATUS", "CREATED", "BUNDLE"
    );

    for id in store.list()? {
        let mut state = match store.load(&id) {
            Ok(state) => state,
            Err(_) => continue,
        };
        let _ = store.refresh(&mut state);

        let pid = if state.pid > 0 {
            state.pid.to_string()
        } else {
            "-".to_string()
        };
        println!(
            "{:<24} {:<8} {:<10} {:<24} {}",
            state.id,
            pid,
            state.status,
            state.created.format("%Y-%m-%d %H:%M:%S UTC"),
            state.bundle.display()
        );
    }
    Ok(())
}

// ─── exec ───────────────────────────────────────────────────────────────────

fn cmd_exec(store: &Store, id: &str, cmd: &[String]) -> Result<i32> {
    let mut state = store.load(id)?;
    store.refresh(&mut state)?;
    if !state.status.can_exec() {
        return Err(Error::InvalidState(state.status).into());
    }

    let join_order = namespaces::join_order(
        state
            .config
            .as_ref()
            .map(|c| c.namespaces())
            .unwrap_or(&[]),
    );
    let join_names: Vec<&str> = join_order
        .iter()
        .map(|t| namespaces::proc_name(*t))
        .collect();

    // Namespace joining needs a fresh single-threaded process; re-execute
    // this binary under the hidden exec-init subcommand.
    let status = SysCommand::new(current_exe()?)
        .arg("exec-init")
        .arg("--")
        .args(cmd)
        .env(process::ENV_JOIN_PID, state.pid.to_string())
        .env(process::ENV_JOIN_NAMESPACES, join_names.join(","))
        .status()
        .context("spawning exec-init")?;

    Ok(status.code().unwrap_or(127))
}

fn current_exe() -> Result<PathBuf> {
    std::env::current_exe().context("resolving current executable")
}
