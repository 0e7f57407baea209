use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::core::error::{Error, Result};
use crate::core::model::{ContainerState, ContainerStatus};

/// Name of the per-container state file.
pub const STATE_FILE: &str = "state.json";
/// Name of the ready fifo present while a container is `created`.
pub const EXEC_FIFO: &str = "exec.fifo";

/// Filesystem-backed store of container state records, one subdirectory
/// per container ID under the state root.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Open (and create if needed) the state root.
    ///
    /// When no explicit root is given: `/run/vessel` as root,
    /// `$HOME/.vessel` otherwise.
    pub fn open(root: Option<PathBuf>) -> Result<Self> {
        let root = match root {
            Some(r) => r,
            None => default_root()?,
        };
        fs::create_dir_all(&root)
            .map_err(|e| Error::io(format!("creating state root {}", root.display()), e))?;
        Ok(Store { root })
    }

    /// Directory for a specific container.
    pub fn container_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Path of the ready fifo for a container.
    pub fn fifo_path(&self, id: &str) -> PathBuf {
        self.container_dir(id).join(EXEC_FIFO)
    }

    /// Whether a committed state record exists for this ID.
    pub fn exists(&self, id: &str) -> bool {
        self.container_dir(id).join(STATE_FILE).exists()
    }

    /// Claim an ID by creating its directory. The kernel makes `mkdir` the
    /// arbiter between racing creates: exactly one caller wins. A leftover
    /// directory without a committed `state.json` is debris of a crashed
    /// create and is swept before retrying.
    pub fn claim(&self, id: &str) -> Result<()> {
        for _ in 0..2 {
            match fs::create_dir(self.container_dir(id)) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.exists(id) {
                        return Err(Error::AlreadyExists(id.to_string()));
                    }
                    self.remove(id)?;
                }
                Err(e) => {
                    return Err(Error::io(
                        format!("creating {}", self.container_dir(id).display()),
                        e,
                    ))
                }
            }
        }
        Err(Error::AlreadyExists(id.to_string()))
    }

    /// Persist a state record atomically: temp file in the container
    /// directory, fsync, chmod 0600, rename over `state.json`. Readers see
    /// either the prior committed record or this one, never a torn file.
    pub fn save(&self, state: &ContainerState) -> Result<()> {
        let dir = self.container_dir(&state.id);
        fs::create_dir_all(&dir)
            .map_err(|e| Error::io(format!("creating {}", dir.display()), e))?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".state-")
            .suffix(".tmp")
            .tempfile_in(&dir)
            .map_err(|e| Error::io(format!("creating temp file in {}", dir.display()), e))?;

        serde_json::to_writer_pretty(&mut tmp, state)
            .map_err(|e| Error::json("serializing container state", e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| Error::io("syncing container state", e))?;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(|e| Error::io("restricting state file mode", e))?;

        let path = dir.join(STATE_FILE);
        tmp.persist(&path)
            .map_err(|e| Error::io(format!("committing {}", path.display()), e.error))?;
        Ok(())
    }

    /// Load the committed state record for an ID.
    pub fn load(&self, id: &str) -> Result<ContainerState> {
        let path = self.container_dir(id).join(STATE_FILE);
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(id.to_string()));
            }
            Err(e) => return Err(Error::io(format!("reading {}", path.display()), e)),
        };
        serde_json::from_str(&data).map_err(|e| Error::json("parsing container state", e))
    }

    /// List container IDs known to the store.
    pub fn list(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.root)
            .map_err(|e| Error::io(format!("reading {}", self.root.display()), e))?;

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io("reading state root entry", e))?;
            if entry.path().join(STATE_FILE).exists() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Remove a container's directory and everything in it.
    pub fn remove(&self, id: &str) -> Result<()> {
        let dir = self.container_dir(id);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .map_err(|e| Error::io(format!("removing {}", dir.display()), e))?;
        }
        Ok(())
    }

    /// Lazily transition a record to `stopped` when its init process is
    /// gone. Persists the record when the status changed; returns whether
    /// it did. `creating` records are watched too: one whose pid is absent
    /// or dead was orphaned by a crashed create and gets swept here.
    pub fn refresh(&self, state: &mut ContainerState) -> Result<bool> {
        let watched = matches!(
            state.status,
            ContainerStatus::Creating | ContainerStatus::Created | ContainerStatus::Running
        );
        if watched && !pid_alive(state.pid, state.process_start_time) {
            state.status = ContainerStatus::Stopped;
            self.save(state)?;
            return Ok(true);
        }
        Ok(false)
    }
}

fn default_root() -> Result<PathBuf> {
    if nix::unistd::geteuid().is_root() {
        return Ok(PathBuf::from("/run/vessel"));
    }
    let home = std::env::var("HOME")
        .map_err(|_| Error::io("HOME not set", std::io::Error::from(std::io::ErrorKind::NotFound)))?;
    Ok(PathBuf::from(home).join(".vessel"))
}

/// Whether a PID refers to a live (non-zombie) process, guarding against
/// pid reuse with the recorded start time when one is available.
pub fn pid_alive(pid: u32, expected_start: Option<u64>) -> bool {
    match proc_stat(pid) {
        Some((proc_state, start_time)) => {
            if proc_state == 'Z' || proc_state == 'X' {
                return false;
            }
            match expected_start {
                Some(expected) => expected == start_time,
                None => true,
            }
        }
        None => false,
    }
}

/// Start time (clock ticks since boot) of a process, for pid-reuse guards.
pub fn process_start_time(pid: u32) -> Option<u64> {
    proc_stat(pid).map(|(_, start)| start)
}

/// Parse `(state, starttime)` out of `/proc/<pid>/stat`. The comm field may
/// contain spaces and parens, so fields are counted after the last `)`.
fn proc_stat(pid: u32) -> Option<(char, u64)> {
    if pid == 0 {
        return None;
    }
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let (_, rest) = stat.rsplit_once(')')?;
    let mut fields = rest.split_whitespace();
    let proc_state = fields.next()?.chars().next()?;
    // starttime is stat field 22; `rest` starts at field 3.
    let start_time = fields.nth(18)?.parse().ok()?;
    Some((proc_state, start_time))
}

/// Write a PID file for external orchestrators.
pub fn write_pid_file(path: &Path, pid: u32) -> Result<()> {
    let mut file = fs::File::create(path)
        .map_err(|e| Error::io(format!("creating pid file {}", path.display()), e))?;
    write!(file, "{pid}")
        .map_err(|e| Error::io(format!("writing pid file {}", path.display()), e))
}
