use std::fs::OpenOptions;
use std::io::IoSlice;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use nix::fcntl::OFlag;
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt, PtyMaster};
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
use nix::unistd::{dup2, setsid};

use crate::core::error::{Error, Result};

/// An allocated pseudoterminal pair: the master fd and the slave's path
/// on the host devpts.
pub struct Pty {
    pub master: PtyMaster,
    pub slave_path: PathBuf,
}

/// Allocate a PTY: open the master, grant and unlock the slave, derive its
/// path.
pub fn open_pty() -> Result<Pty> {
    let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY)
        .map_err(|e| Error::sys("opening pty master", e))?;
    grantpt(&master).map_err(|e| Error::sys("granting pty slave", e))?;
    unlockpt(&master).map_err(|e| Error::sys("unlocking pty slave", e))?;
    let slave_path = ptsname_r(&master)
        .map_err(|e| Error::sys("resolving pty slave path", e))?
        .into();

    Ok(Pty { master, slave_path })
}

/// Hand the PTY master to the caller listening on `socket_path`: one
/// message with a single zero byte of payload and the fd as an
/// `SCM_RIGHTS` ancillary record, then disconnect.
pub fn send_master(socket_path: &Path, pty: &Pty) -> Result<()> {
    let stream = UnixStream::connect(socket_path).map_err(|e| {
        Error::io(format!("connecting console socket {}", socket_path.display()), e)
    })?;

    let payload = [IoSlice::new(&[0u8])];
    let fds = [pty.master.as_raw_fd()];
    let rights = [ControlMessage::ScmRights(&fds)];
    sendmsg::<()>(
        stream.as_raw_fd(),
        &payload,
        &rights,
        MsgFlags::empty(),
        None,
    )
    .map_err(|e| Error::sys("sending pty master fd", e))?;
    Ok(())
}

/// Make the PTY slave this process's controlling terminal and wire it to
/// stdio. Must run before pivot while the host devpts path is reachable.
pub fn attach_slave(slave_path: &Path) -> Result<()> {
    setsid().map_err(|e| Error::sys("creating session", e))?;

    let slave = OpenOptions::new()
        .read(true)
        .write(true)
        .open(slave_path)
        .map_err(|e| Error::io(format!("opening pty slave {}", slave_path.display()), e))?;
    let fd = slave.as_raw_fd();

    if unsafe { libc::ioctl(fd, libc::TIOCSCTTY, 0) } < 0 {
        return Err(Error::io(
            "setting controlling terminal",
            std::io::Error::last_os_error(),
        ));
    }

    for stdio in 0..3 {
        dup2(fd, stdio).map_err(|e| Error::sys("wiring pty slave to stdio", e))?;
    }
    Ok(())
}
