//! Native epoll Wrapper
//!
//! Thin layer over `epoll_create1(2)`, `epoll_ctl(2)` and `epoll_wait(2)`.
//! The selector talks to the kernel only through the [`Poller`] trait, so the
//! event loop can be driven by a scripted poller in tests.
//!
//! ## Wait Outcomes
//!
//! | Kernel result | [`WaitStatus`] |
//! |---------------|----------------|
//! | `n >= 0` | `Ready(n)` |
//! | `-1` / `EINTR` | `Interrupted` |
//! | `-1` / other | `Err(io::Error)` |

use core::ffi::c_int;
use std::io;
use std::os::unix::io::RawFd;

// ============================================================================
// epoll Constants
// ============================================================================

/// Readable
pub const EPOLLIN: u32 = libc::EPOLLIN as u32;
/// Writable
pub const EPOLLOUT: u32 = libc::EPOLLOUT as u32;
/// Error condition
pub const EPOLLERR: u32 = libc::EPOLLERR as u32;
/// Hang up
pub const EPOLLHUP: u32 = libc::EPOLLHUP as u32;

/// Upper bound on events drained by a single `epoll_wait`
pub const MAX_POLL_EVENTS: usize = 1024;

/// epoll_ctl operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtlOp {
    /// EPOLL_CTL_ADD
    Add,
    /// EPOLL_CTL_MOD
    Modify,
    /// EPOLL_CTL_DEL
    Delete,
}

impl CtlOp {
    fn as_raw(self) -> c_int {
        match self {
            CtlOp::Add => libc::EPOLL_CTL_ADD,
            CtlOp::Modify => libc::EPOLL_CTL_MOD,
            CtlOp::Delete => libc::EPOLL_CTL_DEL,
        }
    }
}

/// Result of a single wait call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// Number of ready entries in the event table
    Ready(usize),
    /// Wait aborted by a signal before any event or timeout
    Interrupted,
}

// ============================================================================
// Poller Trait
// ============================================================================

/// Readiness-multiplexing primitive used by the selector.
///
/// `wait` fills an internal table; `event(i)` reads the `(fd, events)` pair
/// at index `i` for `i < n` of the last `Ready(n)`.
pub trait Poller: Send {
    /// Add, modify or remove `fd` from the interest table
    fn ctl(&mut self, op: CtlOp, fd: RawFd, events: u32) -> io::Result<()>;

    /// Block for at most `timeout_ms` (-1 = forever, 0 = poll)
    fn wait(&mut self, timeout_ms: i32) -> io::Result<WaitStatus>;

    /// Ready entry from the last wait
    fn event(&self, index: usize) -> (RawFd, u32);

    /// Release native resources. Must be safe to call twice.
    fn close(&mut self) -> io::Result<()>;
}

// ============================================================================
// EPoll
// ============================================================================

/// Owned epoll instance with its ready-event table
pub struct EPoll {
    /// epoll file descriptor (-1 once closed)
    epfd: RawFd,
    /// Ready-event table passed to epoll_wait
    events: Vec<libc::epoll_event>,
}

impl EPoll {
    /// Create an epoll instance able to report `max_events` per wait
    pub fn create(max_events: usize) -> io::Result<Self> {
        let max_events = max_events.clamp(1, MAX_POLL_EVENTS);

        // SAFETY: epoll_create1 takes no pointers; the result is checked below.
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            epfd,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; max_events],
        })
    }

    /// epoll file descriptor
    pub fn fd(&self) -> RawFd {
        self.epfd
    }

    /// Capacity of the ready-event table
    pub fn capacity(&self) -> usize {
        self.events.len()
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.epfd < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        Ok(())
    }
}

impl Poller for EPoll {
    fn ctl(&mut self, op: CtlOp, fd: RawFd, events: u32) -> io::Result<()> {
        self.ensure_open()?;

        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };

        // SAFETY: `event` outlives the call; the kernel ignores it for DEL.
        let ret = unsafe { libc::epoll_ctl(self.epfd, op.as_raw(), fd, &mut event) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn wait(&mut self, timeout_ms: i32) -> io::Result<WaitStatus> {
        self.ensure_open()?;

        // SAFETY: the table holds `events.len()` initialized entries.
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                self.events.len() as c_int,
                timeout_ms,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(WaitStatus::Interrupted);
            }
            return Err(err);
        }

        Ok(WaitStatus::Ready(n as usize))
    }

    fn event(&self, index: usize) -> (RawFd, u32) {
        // epoll_event is packed on x86_64; copy before reading fields
        let event = self.events[index];
        let data = event.u64;
        let events = event.events;
        (data as RawFd, events)
    }

    fn close(&mut self) -> io::Result<()> {
        if self.epfd < 0 {
            return Ok(());
        }
        let epfd = core::mem::replace(&mut self.epfd, -1);

        // SAFETY: epfd was returned by epoll_create1 and is closed exactly once.
        let ret = unsafe { libc::close(epfd) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for EPoll {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

// ============================================================================
// Utility Functions
// ============================================================================

/// Soft RLIMIT_NOFILE of this process
pub fn fd_limit() -> usize {
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };

    // SAFETY: `rlim` is a valid out-pointer for the duration of the call.
    let ret = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) };
    if ret < 0 || rlim.rlim_cur == libc::RLIM_INFINITY {
        return usize::MAX;
    }
    usize::try_from(rlim.rlim_cur).unwrap_or(usize::MAX)
}

/// Default number of events drained per wait
pub fn default_max_events() -> usize {
    fd_limit().min(MAX_POLL_EVENTS)
}

// ============================================================================
// Tests
// ============================================================================
