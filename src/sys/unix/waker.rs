//! Cross-thread wakeup primitive, grounded on the teacher's
//! `sys::unix::waker::fdbased` eventfd implementation.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

/// A one-shot-per-wait eventfd counter used to interrupt `epoll_wait`.
///
/// `eventfd` is a 64 bit counter; writes add to it, and a read drains it
/// back to zero. Used by [`crate::base::EventBase`] as the notify channel
/// described in spec §4.3 ("Cross-thread wakeups").
#[derive(Debug)]
pub struct Waker {
    fd: File,
}

impl Waker {
    pub fn new() -> io::Result<Waker> {
        let raw = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if raw == -1 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { File::from_raw_fd(raw) };
        Ok(Waker { fd })
    }

    #[allow(clippy::unused_io_amount)]
    pub fn wake(&self) -> io::Result<()> {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        match (&self.fd).write(&buf) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                self.reset()?;
                self.wake()
            }
            Err(err) => Err(err),
        }
    }

    /// Drain the counter; call after the poller reports this fd readable.
    #[allow(clippy::unused_io_amount)]
    pub fn reset(&self) -> io::Result<()> {
        let mut buf: [u8; 8] = 0u64.to_ne_bytes();
        match (&self.fd).read(&mut buf) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
