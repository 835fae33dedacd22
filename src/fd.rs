//! Owned duplicates of caller-provided descriptors.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use libc;
use nix::errno::Errno;

use error::Result;
use ring::SetupError;

/// An adapter's private dup of the socket or device descriptor it was
/// constructed from. Owning a duplicate means the caller's handle can be
/// returned to the OS at any time without racing our teardown.
#[derive(Debug)]
pub(crate) struct OwnedFd {
    fd: RawFd,
    closed: AtomicBool,
}

impl OwnedFd {
    pub(crate) fn dup_of(fd: RawFd) -> Result<OwnedFd> {
        // NOTE(unsafe) plain fcntl; the kernel validates fd
        let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
        if dup < 0 {
            return Err(SetupError::Descriptor {
                errno: Errno::last(),
            }.into());
        }
        Ok(OwnedFd {
            fd: dup,
            closed: AtomicBool::new(false),
        })
    }

    /// Returns the descriptor to the OS now rather than at drop. Idempotent,
    /// so an adapter's close path and its Drop can both call it.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // NOTE(unsafe) the swap above makes us the only closer
        unsafe {
            libc::close(self.fd);
        }
    }
}

impl AsRawFd for OwnedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for OwnedFd {
    fn drop(&mut self) {
        self.close();
    }
}
