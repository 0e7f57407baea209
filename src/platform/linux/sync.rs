use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg, FdFlag};

use crate::core::error::{Error, Result};

/// One-shot parent/child handshake over an anonymous pipe.
///
/// Protocol: the child writes a single zero byte when it is ready to exec,
/// or a UTF-8 error message (never starting with a zero byte) when setup
/// failed. EOF before any byte means the child died silently.
pub fn sync_pair() -> Result<(SyncReceiver, SyncSender)> {
    let (read, write) = nix::unistd::pipe().map_err(|e| Error::sys("creating sync pipe", e))?;

    // The read end stays with the parent; make sure it does not leak into
    // the re-executed init process.
    fcntl(read.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map_err(|e| Error::sys("flagging sync pipe close-on-exec", e))?;

    Ok((
        SyncReceiver { pipe: File::from(read) },
        SyncSender { pipe: File::from(write) },
    ))
}

/// Parent side: the read end of the sync pipe.
pub struct SyncReceiver {
    pipe: File,
}

impl SyncReceiver {
    /// Block until the child signals. `Ok(())` for the ready byte,
    /// [`Error::Child`] carrying the child's message for an error report,
    /// [`Error::SyncBroken`] when the pipe closed without a byte.
    pub fn wait_ready(mut self) -> Result<()> {
        let mut first = [0u8; 1];
        let n = loop {
            match self.pipe.read(&mut first) {
                Ok(n) => break n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::io("reading sync pipe", e)),
            }
        };

        if n == 0 {
            return Err(Error::SyncBroken);
        }
        if first[0] == 0 {
            return Ok(());
        }

        // A non-zero first byte starts an error message; the child exits
        // right after sending it, so read to EOF.
        let mut message = vec![first[0]];
        self.pipe
            .read_to_end(&mut message)
            .map_err(|e| Error::io("reading sync error message", e))?;
        Err(Error::Child(
            String::from_utf8_lossy(&message).into_owned(),
        ))
    }
}

/// Child side: the write end of the sync pipe.
pub struct SyncSender {
    pipe: File,
}

impl SyncSender {
    /// Rebuild the sender from the fd number inherited across exec.
    ///
    /// # Safety
    ///
    /// `fd` must be the open write end of the sync pipe and owned by no
    /// one else in this process.
    pub unsafe fn from_raw(fd: RawFd) -> Self {
        SyncSender {
            pipe: File::from(OwnedFd::from_raw_fd(fd)),
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.pipe.as_raw_fd()
    }

    /// Arrange for the write end to vanish at exec, so the parent observes
    /// EOF exactly when the user command replaces the init process.
    pub fn close_on_exec(&self) -> Result<()> {
        fcntl(self.pipe.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
            .map_err(|e| Error::sys("flagging sync pipe close-on-exec", e))?;
        Ok(())
    }

    pub fn signal_ready(&self) -> Result<()> {
        (&self.pipe)
            .write_all(&[0])
            .map_err(|e| Error::io("signaling ready", e))
    }

    pub fn signal_error(&self, message: &str) -> Result<()> {
        let message = if message.is_empty() {
            "container init failed"
        } else {
            message
        };
        (&self.pipe)
            .write_all(message.as_bytes())
            .map_err(|e| Error::io("signaling error", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_byte_round_trip() {
        let (receiver, sender) = sync_pair().unwrap();
        sender.signal_ready().unwrap();
        receiver.wait_ready().unwrap();
    }

    #[test]
    fn error_message_round_trip() {
        let (receiver, sender) = sync_pair().unwrap();
        sender.signal_error("mount failed: no such device").unwrap();
        drop(sender);
        match receiver.wait_ready() {
            Err(Error::Child(msg)) => assert_eq!(msg, "mount failed: no such device"),
            other => panic!("expected Child error, got {other:?}"),
        }
    }

    #[test]
    fn closed_pipe_is_sync_broken() {
        let (receiver, sender) = sync_pair().unwrap();
        drop(sender);
        assert!(matches!(receiver.wait_ready(), Err(Error::SyncBroken)));
    }

    #[test]
    fn empty_error_message_still_errors() {
        let (receiver, sender) = sync_pair().unwrap();
        sender.signal_error("").unwrap();
        drop(sender);
        assert!(matches!(receiver.wait_ready(), Err(Error::Child(_))));
    }
}
