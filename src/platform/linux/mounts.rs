use std::fs;
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};

use crate::core::error::{Error, Result};
use crate::core::spec::{Device, Mount};

/// Make the entire mount tree private so changes inside the new mount
/// namespace do not propagate back to the host.
pub fn make_private() -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| Error::ns("remounting / private", e))
}

/// Bind-mount the rootfs onto itself so it becomes a mount point
/// (required for `pivot_root`).
pub fn bind_rootfs(rootfs: &Path) -> Result<()> {
    mount(
        Some(rootfs),
        rootfs,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| Error::ns(format!("bind-mounting rootfs {}", rootfs.display()), e))
}

/// Apply the spec's mounts in list order, resolving each destination under
/// the rootfs.
pub fn apply_mounts(mounts: &[Mount], rootfs: &Path) -> Result<()> {
    for m in mounts {
        apply_mount(m, rootfs)?;
    }
    Ok(())
}

fn apply_mount(m: &Mount, rootfs: &Path) -> Result<()> {
    let dest = join_inside(rootfs, &m.destination);
    let (mut flags, propagation, data) = parse_options(&m.options);
    let source = m.source.as_deref();
    let fs_type = m.fs_type.as_deref();

    if flags.contains(MsFlags::MS_BIND) && source.map(Path::is_file).unwrap_or(false) {
        // Bind mounts of a single file need a file, not a directory, as
        // the mount point.
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::io(format!("creating {}", parent.display()), e))?;
        }
        if !dest.exists() {
            fs::File::create(&dest)
                .map_err(|e| Error::io(format!("creating {}", dest.display()), e))?;
        }
    } else {
        fs::create_dir_all(&dest)
            .map_err(|e| Error::io(format!("creating {}", dest.display()), e))?;
    }

    log::debug!("mounting {fs_type:?} on {}", dest.display());
    mount(source, &dest, fs_type, flags, data.as_deref()).map_err(|e| {
        Error::ns(
            format!("mounting {} on {}", fs_type.unwrap_or("bind"), dest.display()),
            e,
        )
    })?;

    // Read-only bind mounts take effect only through a remount.
    if flags.contains(MsFlags::MS_BIND) && flags.contains(MsFlags::MS_RDONLY) {
        flags.insert(MsFlags::MS_REMOUNT);
        mount(source, &dest, fs_type, flags, None::<&str>)
            .map_err(|e| Error::ns(format!("remounting {} read-only", dest.display()), e))?;
    }

    // Propagation changes are a separate operation from the mount itself.
    if let Some(propagation) = propagation {
        mount(None::<&str>, &dest, None::<&str>, propagation, None::<&str>)
            .map_err(|e| Error::ns(format!("setting propagation on {}", dest.display()), e))?;
    }

    Ok(())
}

/// Translate an OCI mount option list into mount flags, a separate
/// propagation flag set, and the residual data string handed to the
/// filesystem.
pub fn parse_options(options: &[String]) -> (MsFlags, Option<MsFlags>, Option<String>) {
    let mut flags = MsFlags::empty();
    let mut propagation = None;
    let mut data: Vec<&str> = Vec::new();

    for opt in options {
        match opt.as_str() {
            "defaults" | "rw" => {}
            "ro" => flags |= MsFlags::MS_RDONLY,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "nodiratime" => flags |= MsFlags::MS_NODIRATIME,
            "relatime" => flags |= MsFlags::MS_RELATIME,
            "strictatime" => flags |= MsFlags::MS_STRICTATIME,
            "bind" => flags |= MsFlags::MS_BIND,
            "rbind" => flags |= MsFlags::MS_BIND | MsFlags::MS_REC,
            "private" => add_propagation(&mut propagation, MsFlags::MS_PRIVATE),
            "rprivate" => {
                add_propagation(&mut propagation, MsFlags::MS_PRIVATE | MsFlags::MS_REC)
            }
            "shared" => add_propagation(&mut propagation, MsFlags::MS_SHARED),
            "rshared" => add_propagation(&mut propagation, MsFlags::MS_SHARED | MsFlags::MS_REC),
            "slave" => add_propagation(&mut propagation, MsFlags::MS_SLAVE),
            "rslave" => add_propagation(&mut propagation, MsFlags::MS_SLAVE | MsFlags::MS_REC),
            other => data.push(other),
        }
    }

    let data = if data.is_empty() {
        None
    } else {
        Some(data.join(","))
    };
    (flags, propagation, data)
}

fn add_propagation(propagation: &mut Option<MsFlags>, flags: MsFlags) {
    *propagation = Some(propagation.unwrap_or(MsFlags::empty()) | flags);
}

/// The device nodes every container gets, whether or not the spec lists
/// devices.
const DEFAULT_DEVICES: [(&str, u64, u64); 6] = [
    ("/dev/null", 1, 3),
    ("/dev/zero", 1, 5),
    ("/dev/full", 1, 7),
    ("/dev/random", 1, 8),
    ("/dev/urandom", 1, 9),
    ("/dev/tty", 5, 0),
];

/// Create the default device set plus the spec's declared devices inside
/// the rootfs.
pub fn create_devices(devices: &[Device], rootfs: &Path) -> Result<()> {
    for (path, major, minor) in DEFAULT_DEVICES {
        let dev = Device {
            path: PathBuf::from(path),
            dev_type: "c".to_string(),
            major,
            minor,
            file_mode: Some(0o666),
        };
        create_device(&dev, rootfs)?;
    }
    for dev in devices {
        create_device(dev, rootfs)?;
    }
    Ok(())
}

fn create_device(dev: &Device, rootfs: &Path) -> Result<()> {
    let dest = join_inside(rootfs, &dev.path);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::io(format!("creating {}", parent.display()), e))?;
    }

    let kind = match dev.dev_type.as_str() {
        "c" | "u" => SFlag::S_IFCHR,
        "b" => SFlag::S_IFBLK,
        "p" => SFlag::S_IFIFO,
        other => {
            return Err(Error::InvalidSpec(format!(
                "unknown device type {other:?} for {}",
                dev.path.display()
            )))
        }
    };
    let mode = Mode::from_bits_truncate(dev.file_mode.unwrap_or(0o666));

    match mknod(&dest, kind, mode, makedev(dev.major, dev.minor)) {
        Ok(()) | Err(nix::errno::Errno::EEXIST) => Ok(()),
        // Without CAP_MKNOD (user namespaces), bind the host node instead.
        Err(nix::errno::Errno::EPERM) => bind_device(&dev.path, &dest),
        Err(e) => Err(Error::ns(format!("mknod {}", dest.display()), e)),
    }
}

fn bind_device(host: &Path, dest: &Path) -> Result<()> {
    if !dest.exists() {
        fs::File::create(dest)
            .map_err(|e| Error::io(format!("creating {}", dest.display()), e))?;
    }
    mount(
        Some(host),
        dest,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| Error::ns(format!("bind-mounting device {}", dest.display()), e))
}

/// Bind the PTY slave over `/dev/console` so the container sees its
/// controlling terminal at the conventional path.
pub fn bind_console(rootfs: &Path, slave_path: &Path) -> Result<()> {
    let dest = rootfs.join("dev/console");
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::io(format!("creating {}", parent.display()), e))?;
    }
    if !dest.exists() {
        fs::File::create(&dest)
            .map_err(|e| Error::io(format!("creating {}", dest.display()), e))?;
    }
    mount(
        Some(slave_path),
        &dest,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| Error::ns("bind-mounting /dev/console", e))
}

/// Swap the process root for `new_root`, detaching and removing the old
/// root afterwards.
pub fn pivot_root(new_root: &Path) -> Result<()> {
    let put_old = new_root.join(".oldroot");
    fs::create_dir_all(&put_old)
        .map_err(|e| Error::io(format!("creating {}", put_old.display()), e))?;

    nix::unistd::pivot_root(new_root, &put_old)
        .map_err(|e| Error::ns(format!("pivot_root to {}", new_root.display()), e))?;
    nix::unistd::chdir("/").map_err(|e| Error::ns("chdir / after pivot_root", e))?;

    umount2("/.oldroot", MntFlags::MNT_DETACH)
        .map_err(|e| Error::ns("detaching old root", e))?;
    fs::remove_dir("/.oldroot").map_err(|e| Error::io("removing old root directory", e))?;
    Ok(())
}

/// Resolve a container-absolute path beneath the rootfs.
fn join_inside(rootfs: &Path, container_path: &Path) -> PathBuf {
    match container_path.strip_prefix("/") {
        Ok(relative) => rootfs.join(relative),
        Err(_) => rootfs.join(container_path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_basic_flags() {
        let (flags, propagation, data) =
            parse_options(&opts(&["ro", "nosuid", "nodev", "noexec"]));
        assert!(flags.contains(MsFlags::MS_RDONLY));
        assert!(flags.contains(MsFlags::MS_NOSUID));
        assert!(flags.contains(MsFlags::MS_NODEV));
        assert!(flags.contains(MsFlags::MS_NOEXEC));
        assert!(propagation.is_none());
        assert!(data.is_none());
    }

    #[test]
    fn parse_data_options_pass_through() {
        let (flags, _, data) = parse_options(&opts(&["nosuid", "mode=755", "size=65536k"]));
        assert!(flags.contains(MsFlags::MS_NOSUID));
        assert_eq!(data.as_deref(), Some("mode=755,size=65536k"));
    }

    #[test]
    fn parse_bind_and_rbind() {
        let (flags, _, _) = parse_options(&opts(&["bind"]));
        assert!(flags.contains(MsFlags::MS_BIND));
        assert!(!flags.contains(MsFlags::MS_REC));

        let (flags, _, _) = parse_options(&opts(&["rbind"]));
        assert!(flags.contains(MsFlags::MS_BIND));
        assert!(flags.contains(MsFlags::MS_REC));
    }

    #[test]
    fn parse_propagation_is_separate() {
        let (flags, propagation, data) = parse_options(&opts(&["rbind", "rprivate"]));
        assert!(flags.contains(MsFlags::MS_BIND));
        assert!(!flags.contains(MsFlags::MS_PRIVATE));
        let propagation = propagation.unwrap();
        assert!(propagation.contains(MsFlags::MS_PRIVATE));
        assert!(propagation.contains(MsFlags::MS_REC));
        assert!(data.is_none());
    }

    #[test]
    fn join_inside_strips_leading_slash() {
        let rootfs = Path::new("/tmp/rootfs");
        assert_eq!(
            join_inside(rootfs, Path::new("/proc")),
            PathBuf::from("/tmp/rootfs/proc")
        );
        assert_eq!(
            join_inside(rootfs, Path::new("dev/pts")),
            PathBuf::from("/tmp/rootfs/dev/pts")
        );
    }
}
