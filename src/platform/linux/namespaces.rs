use std::fmt::Write as _;
use std::fs::{self, File};
use std::os::fd::AsFd;

use nix::sched::{setns, CloneFlags};
use nix::unistd::Pid;

use crate::core::error::{Error, Result};
use crate::core::spec::{IdMapping, Linux, Namespace, NamespaceType};

/// Fold the spec's namespace list into the clone flag set used to launch
/// the init process. Namespaces with an explicit `path` are joined, not
/// created, and contribute no flag here.
pub fn clone_flags(namespaces: &[Namespace]) -> CloneFlags {
    namespaces
        .iter()
        .filter(|ns| ns.path.is_none())
        .fold(CloneFlags::empty(), |acc, ns| acc | flag_for(ns.ns_type))
}

fn flag_for(ns_type: NamespaceType) -> CloneFlags {
    match ns_type {
        NamespaceType::Pid => CloneFlags::CLONE_NEWPID,
        NamespaceType::Network => CloneFlags::CLONE_NEWNET,
        NamespaceType::Mount => CloneFlags::CLONE_NEWNS,
        NamespaceType::Ipc => CloneFlags::CLONE_NEWIPC,
        NamespaceType::Uts => CloneFlags::CLONE_NEWUTS,
        NamespaceType::User => CloneFlags::CLONE_NEWUSER,
        NamespaceType::Cgroup => CloneFlags::CLONE_NEWCGROUP,
    }
}

/// The `/proc/<pid>/ns/` entry name for a namespace class.
pub fn proc_name(ns_type: NamespaceType) -> &'static str {
    match ns_type {
        NamespaceType::Pid => "pid",
        NamespaceType::Network => "net",
        NamespaceType::Mount => "mnt",
        NamespaceType::Ipc => "ipc",
        NamespaceType::Uts => "uts",
        NamespaceType::User => "user",
        NamespaceType::Cgroup => "cgroup",
    }
}

/// Join the namespaces the spec declares with an explicit `path` instead
/// of creating them. All fds are opened before the first `setns`, since a
/// mount-namespace join changes path resolution. Each join passes the
/// expected namespace flag so the kernel rejects a path of the wrong kind.
pub fn join_paths(namespaces: &[Namespace]) -> Result<()> {
    let mut handles = Vec::new();
    for ns in namespaces {
        if let Some(path) = &ns.path {
            let file = File::open(path)
                .map_err(|e| Error::io(format!("opening {}", path.display()), e))?;
            handles.push((ns.ns_type, file));
        }
    }

    for (ns_type, file) in &handles {
        setns(file.as_fd(), flag_for(*ns_type))
            .map_err(|e| Error::ns(format!("setns {}", proc_name(*ns_type)), e))?;
    }
    Ok(())
}

/// Set the hostname inside a UTS namespace.
pub fn set_hostname(name: &str) -> Result<()> {
    nix::unistd::sethostname(name).map_err(|e| Error::ns("sethostname", e))
}

/// Write the uid/gid mapping tables of a child in a fresh user namespace.
/// `setgroups` is denied before the gid map, as required for unprivileged
/// mappings.
pub fn write_id_mappings(pid: Pid, linux: &Linux) -> Result<()> {
    if linux.uid_mappings.is_empty() && linux.gid_mappings.is_empty() {
        return Ok(());
    }

    let proc_dir = format!("/proc/{pid}");
    if !linux.uid_mappings.is_empty() {
        write_map(&format!("{proc_dir}/uid_map"), &linux.uid_mappings)?;
    }
    if !linux.gid_mappings.is_empty() {
        fs::write(format!("{proc_dir}/setgroups"), "deny")
            .map_err(|e| Error::io(format!("denying setgroups for pid {pid}"), e))?;
        write_map(&format!("{proc_dir}/gid_map"), &linux.gid_mappings)?;
    }
    Ok(())
}

fn write_map(path: &str, mappings: &[IdMapping]) -> Result<()> {
    let mut table = String::new();
    for m in mappings {
        let _ = writeln!(table, "{} {} {}", m.container_id, m.host_id, m.size);
    }
    fs::write(path, table).map_err(|e| Error::io(format!("writing {path}"), e))
}

/// Join the namespaces of a running process, in the given order. All
/// namespace fds are opened before the first `setns`, since joining the
/// mount namespace changes what `/proc/<pid>` resolves to.
pub fn join(pid: u32, types: &[NamespaceType]) -> Result<()> {
    let mut handles = Vec::with_capacity(types.len());
    for ns_type in types {
        let path = format!("/proc/{pid}/ns/{}", proc_name(*ns_type));
        let file = File::open(&path).map_err(|e| Error::io(format!("opening {path}"), e))?;
        handles.push((*ns_type, file));
    }

    for (ns_type, file) in &handles {
        setns(file.as_fd(), CloneFlags::empty())
            .map_err(|e| Error::ns(format!("setns {}", proc_name(*ns_type)), e))?;
    }
    Ok(())
}

/// The namespace classes to join for `exec`, mount namespace last so the
/// `/proc/<pid>` opens above stay valid for the whole loop.
pub fn join_order(namespaces: &[Namespace]) -> Vec<NamespaceType> {
    let requested: Vec<NamespaceType> = if namespaces.is_empty() {
        vec![
            NamespaceType::Ipc,
            NamespaceType::Uts,
            NamespaceType::Network,
            NamespaceType::Pid,
            NamespaceType::Mount,
        ]
    } else {
        namespaces.iter().map(|ns| ns.ns_type).collect()
    };

    let mut ordered: Vec<NamespaceType> = requested
        .iter()
        .copied()
        .filter(|t| *t == NamespaceType::User)
        .chain(requested.iter().copied().filter(|t| {
            *t != NamespaceType::User && *t != NamespaceType::Mount
        }))
        .collect();
    if requested.contains(&NamespaceType::Mount) {
        ordered.push(NamespaceType::Mount);
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(ns_type: NamespaceType) -> Namespace {
        Namespace { ns_type, path: None }
    }

    #[test]
    fn flags_fold_over_namespace_list() {
        let flags = clone_flags(&[
            ns(NamespaceType::Pid),
            ns(NamespaceType::Mount),
            ns(NamespaceType::Uts),
        ]);
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(flags.contains(CloneFlags::CLONE_NEWNS));
        assert!(flags.contains(CloneFlags::CLONE_NEWUTS));
        assert!(!flags.contains(CloneFlags::CLONE_NEWNET));
    }

    #[test]
    fn namespaces_with_paths_are_not_created() {
        let joined = Namespace {
            ns_type: NamespaceType::Network,
            path: Some("/proc/1/ns/net".into()),
        };
        assert_eq!(clone_flags(&[joined]), CloneFlags::empty());
    }

    #[test]
    fn join_paths_without_paths_is_a_no_op() {
        let list = [ns(NamespaceType::Pid), ns(NamespaceType::Network)];
        join_paths(&list).unwrap();
    }

    #[test]
    fn join_paths_reports_missing_namespace_file() {
        let missing = Namespace {
            ns_type: NamespaceType::Network,
            path: Some("/proc/0/ns/net".into()),
        };
        match join_paths(&[missing]) {
            Err(Error::Io(context, _)) => assert!(context.contains("/proc/0/ns/net")),
            other => panic!("expected Io error, got {other:?}"),
        }
    }

    #[test]
    fn proc_names_match_kernel_entries() {
        assert_eq!(proc_name(NamespaceType::Mount), "mnt");
        assert_eq!(proc_name(NamespaceType::Network), "net");
        assert_eq!(proc_name(NamespaceType::Pid), "pid");
        assert_eq!(proc_name(NamespaceType::Uts), "uts");
    }

    #[test]
    fn join_order_puts_user_first_and_mount_last() {
        let order = join_order(&[
            ns(NamespaceType::Mount),
            ns(NamespaceType::Pid),
            ns(NamespaceType::User),
            ns(NamespaceType::Network),
        ]);
        assert_eq!(order.first(), Some(&NamespaceType::User));
        assert_eq!(order.last(), Some(&NamespaceType::Mount));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn join_order_defaults_when_spec_is_silent() {
        let order = join_order(&[]);
        assert!(order.contains(&NamespaceType::Pid));
        assert_eq!(order.last(), Some(&NamespaceType::Mount));
    }
}
