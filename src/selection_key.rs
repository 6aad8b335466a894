//! Selection Keys
//!
//! A [`SelectionKey`] is the registration of one file descriptor with one
//! selector. It carries three masks:
//!
//! | Mask | Written by | Meaning |
//! |------|------------|---------|
//! | interest | any thread | logical ops the caller wants |
//! | registered | selector (core lock) | epoll bits last sent to the kernel |
//! | ready | selector (core lock) | logical ops reported by the last select |
//!
//! Cancelling a key only clears its validity flag and queues it; the kernel
//! table is cleaned up by the selector's next deregistration pass.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};

use crate::epoll::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT};
use crate::selector::{SelectorError, SelectorShared};

// ============================================================================
// Operation Bits
// ============================================================================

/// Ready for reading
pub const OP_READ: u32 = 1 << 0;
/// Ready for writing
pub const OP_WRITE: u32 = 1 << 2;
/// Connection established
pub const OP_CONNECT: u32 = 1 << 3;
/// Incoming connection pending
pub const OP_ACCEPT: u32 = 1 << 4;

/// Every valid operation bit
pub const OP_ALL: u32 = OP_READ | OP_WRITE | OP_CONNECT | OP_ACCEPT;

/// Logical interest ops -> epoll event bits
pub fn translate_interest_ops(ops: u32) -> u32 {
    let mut events = 0;
    if ops & (OP_READ | OP_ACCEPT) != 0 {
        events |= EPOLLIN;
    }
    if ops & (OP_WRITE | OP_CONNECT) != 0 {
        events |= EPOLLOUT;
    }
    events
}

/// epoll event bits -> logical ops, restricted to `interest`
///
/// Error and hang-up conditions report every interested op so the owner
/// observes the failure on its next I/O call.
pub fn translate_ready_events(events: u32, interest: u32) -> u32 {
    if events & (EPOLLERR | EPOLLHUP) != 0 {
        return interest;
    }
    let mut ops = 0;
    if events & EPOLLIN != 0 {
        ops |= OP_READ | OP_ACCEPT;
    }
    if events & EPOLLOUT != 0 {
        ops |= OP_WRITE | OP_CONNECT;
    }
    ops & interest
}

// ============================================================================
// Selection Key
// ============================================================================

struct KeyInner {
    fd: RawFd,
    interest: AtomicU32,
    registered: AtomicU32,
    ready: AtomicU32,
    valid: AtomicBool,
    selector: Weak<SelectorShared>,
}

/// Registration of a file descriptor with an [`EPollSelector`](crate::selector::EPollSelector)
///
/// Cloning is cheap; clones refer to the same registration.
#[derive(Clone)]
pub struct SelectionKey {
    inner: Arc<KeyInner>,
}

impl SelectionKey {
    pub(crate) fn new(fd: RawFd, selector: Weak<SelectorShared>) -> Self {
        Self {
            inner: Arc::new(KeyInner {
                fd,
                interest: AtomicU32::new(0),
                registered: AtomicU32::new(0),
                ready: AtomicU32::new(0),
                valid: AtomicBool::new(true),
                selector,
            }),
        }
    }

    /// Registered file descriptor
    pub fn fd(&self) -> RawFd {
        self.inner.fd
    }

    /// Current interest set
    pub fn interest_ops(&self) -> u32 {
        self.inner.interest.load(Ordering::Acquire)
    }

    /// Replace the interest set
    ///
    /// The change is queued and applied to the kernel table at the start of
    /// the selector's next select; a select already blocked is not affected.
    pub fn set_interest_ops(&self, ops: u32) -> Result<(), SelectorError> {
        if ops & !OP_ALL != 0 {
            return Err(SelectorError::InvalidOps(ops));
        }
        if !self.is_valid() {
            return Err(SelectorError::CancelledKey);
        }

        let old = self.inner.interest.swap(ops, Ordering::AcqRel);
        if old != ops {
            match self.inner.selector.upgrade() {
                Some(selector) => selector.set_event_ops(self)?,
                None => return Err(SelectorError::Closed),
            }
        }
        Ok(())
    }

    /// Ops found ready by the last select that reported this key
    pub fn ready_ops(&self) -> u32 {
        self.inner.ready.load(Ordering::Acquire)
    }

    /// Readable
    pub fn is_readable(&self) -> bool {
        self.ready_ops() & OP_READ != 0
    }

    /// Writable
    pub fn is_writable(&self) -> bool {
        self.ready_ops() & OP_WRITE != 0
    }

    /// Connect finished (or failed)
    pub fn is_connectable(&self) -> bool {
        self.ready_ops() & OP_CONNECT != 0
    }

    /// Incoming connection pending
    pub fn is_acceptable(&self) -> bool {
        self.ready_ops() & OP_ACCEPT != 0
    }

    /// epoll bits currently held in the kernel table for this key
    pub fn registered_events(&self) -> u32 {
        self.inner.registered.load(Ordering::Acquire)
    }

    /// Whether the key is still registered
    pub fn is_valid(&self) -> bool {
        self.inner.valid.load(Ordering::Acquire)
    }

    /// Cancel the registration
    ///
    /// Takes effect immediately for dispatch; the kernel entry is removed by
    /// the selector's next deregistration pass. Cancelling twice is a no-op.
    pub fn cancel(&self) {
        if self.inner.valid.swap(false, Ordering::AcqRel) {
            if let Some(selector) = self.inner.selector.upgrade() {
                selector.cancel(self);
            }
        }
    }

    /// Same registration as `other`
    pub fn ptr_eq(&self, other: &SelectionKey) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn translate_interest_ops(&self) -> u32 {
        translate_interest_ops(self.interest_ops())
    }

    pub(crate) fn translate_ready_events(&self, events: u32) -> u32 {
        translate_ready_events(events, self.interest_ops())
    }

    pub(crate) fn set_registered_events(&self, events: u32) {
        self.inner.registered.store(events, Ordering::Release);
    }

    pub(crate) fn set_ready_ops(&self, ops: u32) {
        self.inner.ready.store(ops, Ordering::Release);
    }

    /// Invalidate without queueing (selector teardown)
    pub(crate) fn invalidate(&self) {
        self.inner.valid.store(false, Ordering::Release);
    }
}

impl PartialEq for SelectionKey {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for SelectionKey {}

impl fmt::Debug for SelectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectionKey")
            .field("fd", &self.fd())
            .field("interest", &self.interest_ops())
            .field("registered", &self.registered_events())
            .field("ready", &self.ready_ops())
            .field("valid", &self.is_valid())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
