//! Wakeup Descriptor
//!
//! Non-blocking `eventfd(2)` used to interrupt a selector blocked in
//! `epoll_wait`. `set()` makes the descriptor readable, `reset()` drains it.

use core::sync::atomic::{AtomicI32, Ordering};
use std::io;
use std::os::unix::io::RawFd;

/// Owned eventfd, closed exactly once
#[derive(Debug)]
pub struct EventFd {
    /// Descriptor (-1 once closed)
    fd: AtomicI32,
}

impl EventFd {
    /// Create a non-blocking, close-on-exec eventfd
    pub fn new() -> io::Result<Self> {
        // SAFETY: eventfd takes no pointers; the result is checked below.
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd: AtomicI32::new(fd),
        })
    }

    /// Pollable descriptor number
    pub fn fd(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }

    /// Raise the event (descriptor becomes readable)
    pub fn set(&self) -> io::Result<()> {
        let fd = self.open_fd()?;
        let one: u64 = 1;

        // SAFETY: writes 8 bytes from a live u64.
        let n = unsafe { libc::write(fd, (&one as *const u64).cast(), 8) };
        if n < 0 {
            let err = io::Error::last_os_error();
            // Counter saturated: already readable
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Drain the event (descriptor is no longer readable)
    pub fn reset(&self) -> io::Result<()> {
        let fd = self.open_fd()?;
        let mut value: u64 = 0;

        // SAFETY: reads 8 bytes into a live u64.
        let n = unsafe { libc::read(fd, (&mut value as *mut u64).cast(), 8) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Close the descriptor. Later calls are no-ops.
    pub fn close(&self) {
        let fd = self.fd.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            // SAFETY: fd came from eventfd and the swap hands it out once.
            unsafe {
                libc::close(fd);
            }
        }
    }

    /// Whether the descriptor is still open
    pub fn is_open(&self) -> bool {
        self.fd() >= 0
    }

    fn open_fd(&self) -> io::Result<RawFd> {
        let fd = self.fd();
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        Ok(fd)
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Tests
// ============================================================================
