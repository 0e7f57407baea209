use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::spec::{Spec, OCI_VERSION};

/// Status of a container in the runtime's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// `create` is in progress. Transient; never survives a crashed create.
    Creating,
    /// The init process is alive and blocked on the ready fifo.
    Created,
    /// The init process has executed the user command.
    Running,
    /// The init process has exited.
    Stopped,
}

impl ContainerStatus {
    pub fn can_start(self) -> bool {
        matches!(self, Self::Created)
    }

    pub fn can_kill(self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn can_exec(self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Persisted record for a single container (`state.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    pub oci_version: String,
    pub id: String,
    pub status: ContainerStatus,
    /// PID of the init process on the host. 0 when not applicable.
    #[serde(default)]
    pub pid: u32,
    /// Absolute path to the bundle directory.
    pub bundle: PathBuf,
    pub created: DateTime<Utc>,
    /// Absolute path to the root filesystem.
    pub rootfs: PathBuf,
    /// Name of the user that created the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    /// Start time of the init process (`/proc/<pid>/stat` field 22),
    /// recorded to guard liveness checks against pid reuse.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_start_time: Option<u64>,
    /// Embedded copy of the spec the container was created from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Spec>,
}

impl ContainerState {
    pub fn new(id: &str, bundle: &Path, rootfs: &Path, config: Spec) -> Self {
        ContainerState {
            oci_version: OCI_VERSION.to_string(),
            id: id.to_string(),
            status: ContainerStatus::Creating,
            pid: 0,
            bundle: bundle.to_path_buf(),
            created: Utc::now(),
            rootfs: rootfs.to_path_buf(),
            owner: current_user(),
            annotations: config.annotations.clone(),
            process_start_time: None,
            config: Some(config),
        }
    }

    /// The OCI state shape: what `state` prints and hooks receive on stdin.
    pub fn oci_state(&self) -> OciState {
        OciState {
            oci_version: self.oci_version.clone(),
            id: self.id.clone(),
            status: self.status,
            pid: (self.pid != 0).then_some(self.pid),
            bundle: self.bundle.clone(),
            annotations: self.annotations.clone(),
        }
    }
}

/// The state document defined by the OCI runtime spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciState {
    pub oci_version: String,
    pub id: String,
    pub status: ContainerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub bundle: PathBuf,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

fn current_user() -> Option<String> {
    nix::unistd::User::from_uid(nix::unistd::geteuid())
        .ok()
        .flatten()
        .map(|u| u.name)
}
