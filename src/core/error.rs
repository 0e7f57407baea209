use std::io;

use thiserror::Error;

use crate::core::hooks::HookKind;
use crate::core::model::ContainerStatus;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors the runtime reports to callers.
///
/// Child-side failures cross the process boundary as text over the sync
/// channel and surface as [`Error::Child`] in the parent.
#[derive(Debug, Error)]
pub enum Error {
    #[error("container {0} already exists")]
    AlreadyExists(String),

    #[error("container {0} does not exist")]
    NotFound(String),

    #[error("invalid container id {0:?}: must be a non-empty path component")]
    InvalidId(String),

    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    #[error("operation not allowed while container is {0}")]
    InvalidState(ContainerStatus),

    #[error("invalid signal {0:?}")]
    InvalidSignal(String),

    #[error("sync channel closed before the container process signaled")]
    SyncBroken,

    #[error("container process failed: {0}")]
    Child(String),

    #[error("{kind} hook {path} exited with status {code}: {stderr}")]
    HookFailed {
        kind: HookKind,
        path: String,
        code: i32,
        stderr: String,
    },

    #[error("{kind} hook {path} timed out")]
    HookTimeout { kind: HookKind, path: String },

    #[error("namespace setup failed during {which}: {source}")]
    NamespaceSetup {
        which: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to launch container process: {0}")]
    ProcessLaunch(String),

    #[error("{0}: {1}")]
    Io(String, #[source] io::Error),

    #[error("{0}: {1}")]
    Json(String, #[source] serde_json::Error),
}

impl Error {
    /// An I/O failure with the context a caller needs to act on it.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io(context.into(), source)
    }

    /// A raw syscall failure, lifted out of an errno.
    pub fn sys(context: impl Into<String>, errno: nix::Error) -> Self {
        Error::Io(context.into(), io::Error::from_raw_os_error(errno as i32))
    }

    /// A namespace/mount/pivot failure inside the launcher or the child.
    pub fn ns(which: impl Into<String>, errno: nix::Error) -> Self {
        Error::NamespaceSetup {
            which: which.into(),
            source: io::Error::from_raw_os_error(errno as i32),
        }
    }

    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        Error::Json(context.into(), source)
    }
}
