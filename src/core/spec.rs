use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, Result};

/// OCI runtime spec version this runtime understands.
pub const OCI_VERSION: &str = "1.0.2";

/// Name of the configuration file inside a bundle.
pub const CONFIG_FILE: &str = "config.json";

/// The parsed container configuration from `<bundle>/config.json`.
/// Immutable for the life of the container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    #[serde(default = "default_version")]
    pub oci_version: String,
    pub root: Root,
    pub process: Process,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<Hooks>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linux: Option<Linux>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Root {
    /// Rootfs path, relative to the bundle unless absolute.
    pub path: PathBuf,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    #[serde(default)]
    pub terminal: bool,
    #[serde(default)]
    pub user: User,
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default = "default_cwd")]
    pub cwd: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    pub destination: PathBuf,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub fs_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Linux {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<Namespace>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uid_mappings: Vec<IdMapping>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gid_mappings: Vec<IdMapping>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<Device>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Namespace {
    #[serde(rename = "type")]
    pub ns_type: NamespaceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// The namespace classes a spec may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceType {
    Pid,
    Network,
    Mount,
    Ipc,
    Uts,
    User,
    Cgroup,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdMapping {
    #[serde(rename = "containerID")]
    pub container_id: u32,
    #[serde(rename = "hostID")]
    pub host_id: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub path: PathBuf,
    #[serde(rename = "type")]
    pub dev_type: String,
    pub major: u64,
    pub minor: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_mode: Option<u32>,
}

/// The six OCI lifecycle hook lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hooks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prestart: Option<Vec<Hook>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_runtime: Option<Vec<Hook>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_container: Option<Vec<Hook>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_container: Option<Vec<Hook>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poststart: Option<Vec<Hook>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poststop: Option<Vec<Hook>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hook {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    /// Timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

fn default_version() -> String {
    OCI_VERSION.to_string()
}

fn default_cwd() -> PathBuf {
    PathBuf::from("/")
}

impl Spec {
    /// Load and validate `config.json` from a bundle directory.
    pub fn load(bundle: &Path) -> Result<Self> {
        let path = bundle.join(CONFIG_FILE);
        let data = fs::read_to_string(&path)
            .map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
        let spec: Spec = serde_json::from_str(&data)
            .map_err(|e| Error::InvalidSpec(format!("{}: {e}", path.display())))?;
        spec.validate()?;
        Ok(spec)
    }

    fn validate(&self) -> Result<()> {
        if self.process.args.is_empty() {
            return Err(Error::InvalidSpec("process.args must not be empty".into()));
        }
        if self.root.path.as_os_str().is_empty() {
            return Err(Error::InvalidSpec("root.path must not be empty".into()));
        }
        Ok(())
    }

    /// Absolute rootfs path for this spec within `bundle`.
    pub fn rootfs_path(&self, bundle: &Path) -> PathBuf {
        if self.root.path.is_absolute() {
            self.root.path.clone()
        } else {
            bundle.join(&self.root.path)
        }
    }

    /// The namespaces the spec asks the runtime to create.
    pub fn namespaces(&self) -> &[Namespace] {
        self.linux.as_ref().map(|l| l.namespaces.as_slice()).unwrap_or(&[])
    }

    pub fn has_namespace(&self, ns_type: NamespaceType) -> bool {
        self.namespaces().iter().any(|ns| ns.ns_type == ns_type)
    }

    /// The default spec written by `vessel spec`: a shell in a private
    /// pid/net/ipc/uts/mount namespace set over `rootfs`.
    pub fn default_spec() -> Self {
        let namespaces = [
            NamespaceType::Pid,
            NamespaceType::Network,
            NamespaceType::Ipc,
            NamespaceType::Uts,
            NamespaceType::Mount,
        ]
        .into_iter()
        .map(|ns_type| Namespace { ns_type, path: None })
        .collect();

        Spec {
            oci_version: OCI_VERSION.to_string(),
            root: Root {
                path: PathBuf::from("rootfs"),
                readonly: false,
            },
            process: Process {
                terminal: false,
                user: User::default(),
                args: vec!["sh".to_string()],
                env: vec![
                    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"
                        .to_string(),
                    "TERM=xterm".to_string(),
                ],
                cwd: PathBuf::from("/"),
            },
            hostname: Some("vessel".to_string()),
            mounts: vec![
                Mount {
                    destination: PathBuf::from("/proc"),
                    fs_type: Some("proc".to_string()),
                    source: Some(PathBuf::from("proc")),
                    options: vec!["nosuid".into(), "noexec".into(), "nodev".into()],
                },
                Mount {
                    destination: PathBuf::from("/dev"),
                    fs_type: Some("tmpfs".to_string()),
                    source: Some(PathBuf::from("tmpfs")),
                    options: vec![
                        "nosuid".into(),
                        "strictatime".into(),
                        "mode=755".into(),
                        "size=65536k".into(),
                    ],
                },
                Mount {
                    destination: PathBuf::from("/dev/pts"),
                    fs_type: Some("devpts".to_string()),
                    source: Some(PathBuf::from("devpts")),
                    options: vec![
                        "nosuid".into(),
                        "noexec".into(),
                        "newinstance".into(),
                        "ptmxmode=0666".into(),
                        "mode=0620".into(),
                    ],
                },
            ],
            hooks: None,
            annotations: HashMap::new(),
            linux: Some(Linux {
                namespaces,
                ..Linux::default()
            }),
        }
    }
}
