//! epoll Selector
//!
//! Readiness multiplexing for many file descriptors with one `epoll_wait`
//! per select, concurrent interest changes, and cross-thread wakeup.
//!
//! ## Select Cycle
//!
//! ```text
//! select_with(timeout, action):
//!   lock core                      (held across the wait)
//!   drain update queue             (ADD / MOD / DEL per changed key)
//!   drain deregistration queue     (cancelled keys leave the table)
//!   epoll_wait                     (EINTR: shrink timeout, retry)
//!   drain deregistration queue     (keys cancelled during the wait)
//!   dispatch ready keys to action
//!   clear interrupt if the eventfd fired
//! ```
//!
//! ## Locks
//!
//! | Lock | Guards | Taken by |
//! |------|--------|----------|
//! | core | poller, fd -> key map | select, close |
//! | update queue | pending interest changes | `set_interest_ops`, select |
//! | cancelled queue | pending deregistrations | `cancel`, select |
//! | keys | registered keys by fd | `register`, select, close |
//! | interrupt | wakeup-triggered flag | `wakeup`, select, close |
//!
//! Registration, cancellation and wakeup never wait for an in-flight select.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::epoll::{self, CtlOp, EPoll, Poller, WaitStatus, EPOLLIN};
use crate::eventfd::EventFd;
use crate::lock_unpoisoned;
use crate::selection_key::{SelectionKey, OP_ALL};

// ============================================================================
// Error Types
// ============================================================================

/// Selector operation errors
#[derive(Debug)]
pub enum SelectorError {
    /// Selector has been closed
    Closed,
    /// Key has been cancelled
    CancelledKey,
    /// Descriptor already has a valid key with this selector
    AlreadyRegistered(RawFd),
    /// Interest set contains unknown bits
    InvalidOps(u32),
    /// epoll or eventfd failure
    Io(io::Error),
}

impl fmt::Display for SelectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectorError::Closed => write!(f, "Selector closed"),
            SelectorError::CancelledKey => write!(f, "Selection key cancelled"),
            SelectorError::AlreadyRegistered(fd) => {
                write!(f, "Descriptor {} already registered", fd)
            }
            SelectorError::InvalidOps(ops) => write!(f, "Invalid interest ops: {:#x}", ops),
            SelectorError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for SelectorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SelectorError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SelectorError {
    fn from(e: io::Error) -> Self {
        SelectorError::Io(e)
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Selector configuration
#[derive(Debug, Clone, Copy)]
pub struct SelectorConfig {
    /// Maximum events drained per `epoll_wait`
    pub max_events: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            max_events: epoll::default_max_events(),
        }
    }
}

impl SelectorConfig {
    /// Set the per-wait event batch size
    pub fn max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events.clamp(1, epoll::MAX_POLL_EVENTS);
        self
    }
}

// ============================================================================
// Shared State
// ============================================================================

/// State reachable from keys without the core lock
pub(crate) struct SelectorShared {
    open: AtomicBool,
    update_keys: Mutex<VecDeque<SelectionKey>>,
    cancelled_keys: Mutex<VecDeque<SelectionKey>>,
    keys: Mutex<HashMap<RawFd, SelectionKey>>,
}

impl SelectorShared {
    fn new() -> Self {
        Self {
            open: AtomicBool::new(true),
            update_keys: Mutex::new(VecDeque::new()),
            cancelled_keys: Mutex::new(VecDeque::new()),
            keys: Mutex::new(HashMap::new()),
        }
    }

    fn ensure_open(&self) -> Result<(), SelectorError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(SelectorError::Closed);
        }
        Ok(())
    }

    /// Queue `key` for an interest update at the next select
    pub(crate) fn set_event_ops(&self, key: &SelectionKey) -> Result<(), SelectorError> {
        self.ensure_open()?;
        lock_unpoisoned(&self.update_keys).push_back(key.clone());
        Ok(())
    }

    /// Queue an already-invalidated key for deregistration
    pub(crate) fn cancel(&self, key: &SelectionKey) {
        if self.open.load(Ordering::Acquire) {
            lock_unpoisoned(&self.cancelled_keys).push_back(key.clone());
        }
    }
}

/// State owned by the selecting thread
struct SelectorCore<P> {
    poller: P,
    fd_to_key: HashMap<RawFd, SelectionKey>,
}

// ============================================================================
// EPoll Selector
// ============================================================================

/// epoll-backed selector
///
/// Generic over the [`Poller`] so the cycle can run against a scripted
/// backend; [`EPollSelector::open`] uses the kernel's epoll.
pub struct EPollSelector<P: Poller = EPoll> {
    shared: Arc<SelectorShared>,
    core: Mutex<SelectorCore<P>>,
    eventfd: EventFd,
    interrupt_triggered: Mutex<bool>,
    config: SelectorConfig,
}

impl EPollSelector<EPoll> {
    /// Open a selector with the default configuration
    pub fn open() -> Result<Self, SelectorError> {
        Self::with_config(SelectorConfig::default())
    }

    /// Open a selector with `config`
    pub fn with_config(config: SelectorConfig) -> Result<Self, SelectorError> {
        let poller = EPoll::create(config.max_events)?;
        Self::with_poller(poller, config)
    }
}

impl<P: Poller> EPollSelector<P> {
    /// Build a selector on top of `poller`
    ///
    /// The poller is released by its own drop if the eventfd cannot be set up.
    pub fn with_poller(mut poller: P, config: SelectorConfig) -> Result<Self, SelectorError> {
        let eventfd = EventFd::new()?;
        poller.ctl(CtlOp::Add, eventfd.fd(), EPOLLIN)?;

        debug!(wakeup_fd = eventfd.fd(), max_events = config.max_events, "selector opened");

        Ok(Self {
            shared: Arc::new(SelectorShared::new()),
            core: Mutex::new(SelectorCore {
                poller,
                fd_to_key: HashMap::new(),
            }),
            eventfd,
            interrupt_triggered: Mutex::new(false),
            config,
        })
    }

    /// Whether the selector is open
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    /// Configuration this selector was opened with
    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    /// Register `fd` with interest `ops`
    ///
    /// A descriptor whose previous key was cancelled but not yet deregistered
    /// may be registered again (the descriptor number was reused).
    pub fn register(&self, fd: RawFd, ops: u32) -> Result<SelectionKey, SelectorError> {
        self.shared.ensure_open()?;
        if ops & !OP_ALL != 0 {
            return Err(SelectorError::InvalidOps(ops));
        }

        let key = SelectionKey::new(fd, Arc::downgrade(&self.shared));
        {
            let mut keys = lock_unpoisoned(&self.shared.keys);
            if let Some(existing) = keys.get(&fd) {
                if existing.is_valid() {
                    return Err(SelectorError::AlreadyRegistered(fd));
                }
            }
            keys.insert(fd, key.clone());
        }

        key.set_interest_ops(ops)?;
        Ok(key)
    }

    /// Registered keys, including cancelled keys not yet deregistered
    pub fn keys(&self) -> Vec<SelectionKey> {
        lock_unpoisoned(&self.shared.keys).values().cloned().collect()
    }

    /// Non-blocking select returning the ready keys
    pub fn select_now(&self) -> Result<Vec<SelectionKey>, SelectorError> {
        self.select_collect(0)
    }

    /// Select returning the ready keys
    ///
    /// `None` blocks until a key is ready or [`wakeup`](Self::wakeup) is
    /// called; `Some(Duration::ZERO)` polls.
    pub fn select(&self, timeout: Option<Duration>) -> Result<Vec<SelectionKey>, SelectorError> {
        let timeout_ms = match timeout {
            None => -1,
            Some(d) if d.is_zero() => 0,
            Some(d) => i64::try_from(d.as_millis()).unwrap_or(i64::MAX).max(1),
        };
        self.select_collect(timeout_ms)
    }

    fn select_collect(&self, timeout_ms: i64) -> Result<Vec<SelectionKey>, SelectorError> {
        let mut ready = Vec::new();
        self.select_with(timeout_ms, |key| ready.push(key.clone()))?;
        Ok(ready)
    }

    /// Run one select cycle, invoking `action` for every ready key
    ///
    /// `timeout_ms`: 0 polls, negative blocks indefinitely, positive is a
    /// bound in milliseconds (clamped to `i32::MAX`). Returns the number of
    /// keys whose ready set was updated.
    ///
    /// A panicking `action` leaves the selector usable: queued updates and
    /// deregistrations are drained again by the next call.
    pub fn select_with<F>(&self, timeout_ms: i64, mut action: F) -> Result<usize, SelectorError>
    where
        F: FnMut(&SelectionKey),
    {
        let mut core = self.lock_core();
        self.shared.ensure_open()?;

        let mut to = if timeout_ms < 0 {
            -1
        } else {
            timeout_ms.min(i32::MAX as i64) as i32
        };
        let timed_poll = to > 0;

        self.process_update_queue(&mut core)?;
        self.process_deregister_queue(&mut core)?;

        let num_entries = loop {
            let start = if timed_poll { Some(Instant::now()) } else { None };
            match core.poller.wait(to)? {
                WaitStatus::Ready(n) => break n,
                WaitStatus::Interrupted => {
                    if let Some(start) = start {
                        let elapsed = i32::try_from(start.elapsed().as_millis()).unwrap_or(i32::MAX);
                        to = to.saturating_sub(elapsed);
                        if to <= 0 {
                            // Timeout expired while interrupted
                            break 0;
                        }
                    }
                    trace!(timeout_ms = to, "epoll_wait interrupted, retrying");
                }
            }
        };

        self.process_deregister_queue(&mut core)?;
        self.process_events(&core, num_entries, &mut action)
    }

    /// Apply queued interest changes to the kernel table
    fn process_update_queue(&self, core: &mut SelectorCore<P>) -> Result<(), SelectorError> {
        let mut updates = lock_unpoisoned(&self.shared.update_keys);

        while let Some(key) = updates.pop_front() {
            if !key.is_valid() {
                continue;
            }
            let fd = key.fd();

            // A cancelled key still mapped here means the descriptor number
            // was reused before its deregistration pass ran.
            if let Some(previous) = core.fd_to_key.get(&fd).cloned() {
                if !previous.ptr_eq(&key) {
                    Self::evict(core, &previous)?;
                }
            }
            core.fd_to_key.entry(fd).or_insert_with(|| key.clone());

            let new_events = key.translate_interest_ops();
            let registered_events = key.registered_events();
            if new_events == registered_events {
                continue;
            }

            if new_events == 0 {
                Self::remove_from_table(core, fd)?;
            } else if registered_events == 0 {
                core.poller.ctl(CtlOp::Add, fd, new_events)?;
            } else {
                core.poller.ctl(CtlOp::Modify, fd, new_events)?;
            }
            key.set_registered_events(new_events);

            trace!(fd, events = new_events, "interest updated");
        }

        Ok(())
    }

    /// Remove cancelled keys from the map and the kernel table
    fn process_deregister_queue(&self, core: &mut SelectorCore<P>) -> Result<(), SelectorError> {
        loop {
            // One key per lock hold; a failure leaves the rest queued
            let key = lock_unpoisoned(&self.shared.cancelled_keys).pop_front();
            let Some(key) = key else {
                return Ok(());
            };
            self.deregister(core, &key)?;
        }
    }

    fn deregister(&self, core: &mut SelectorCore<P>, key: &SelectionKey) -> Result<(), SelectorError> {
        debug_assert!(!key.is_valid());
        let fd = key.fd();

        {
            let mut keys = lock_unpoisoned(&self.shared.keys);
            if keys.get(&fd).is_some_and(|k| k.ptr_eq(key)) {
                keys.remove(&fd);
            }
        }

        if core.fd_to_key.get(&fd).is_some_and(|k| k.ptr_eq(key)) {
            Self::evict(core, key)?;
            trace!(fd, "key deregistered");
        }

        Ok(())
    }

    fn evict(core: &mut SelectorCore<P>, key: &SelectionKey) -> Result<(), SelectorError> {
        let fd = key.fd();
        core.fd_to_key.remove(&fd);
        if key.registered_events() != 0 {
            Self::remove_from_table(core, fd)?;
            key.set_registered_events(0);
        }
        Ok(())
    }

    /// EPOLL_CTL_DEL, tolerating descriptors the kernel already dropped
    fn remove_from_table(core: &mut SelectorCore<P>, fd: RawFd) -> Result<(), SelectorError> {
        match core.poller.ctl(CtlOp::Delete, fd, 0) {
            Err(e) if matches!(e.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF)) => {
                trace!(fd, "descriptor already gone from epoll");
                Ok(())
            }
            other => other.map_err(SelectorError::from),
        }
    }

    /// Dispatch ready events; drain the eventfd if it fired
    fn process_events<F>(
        &self,
        core: &SelectorCore<P>,
        num_entries: usize,
        action: &mut F,
    ) -> Result<usize, SelectorError>
    where
        F: FnMut(&SelectionKey),
    {
        let wakeup_fd = self.eventfd.fd();
        let mut interrupted = false;
        let mut num_keys_updated = 0;

        for i in 0..num_entries {
            let (fd, events) = core.poller.event(i);
            if fd == wakeup_fd {
                interrupted = true;
                continue;
            }

            let Some(key) = core.fd_to_key.get(&fd) else {
                continue;
            };
            if !key.is_valid() {
                continue;
            }

            let ready = key.translate_ready_events(events);
            if ready != 0 {
                key.set_ready_ops(ready);
                action(key);
                num_keys_updated += 1;
            }
        }

        if interrupted {
            self.clear_interrupt()?;
        }

        Ok(num_keys_updated)
    }

    /// Interrupt a blocked or the next select
    ///
    /// Calls made before the next select drains the wakeup are coalesced.
    /// After [`close`](Self::close) this is a no-op.
    pub fn wakeup(&self) -> Result<(), SelectorError> {
        let mut triggered = lock_unpoisoned(&self.interrupt_triggered);
        if !*triggered {
            self.eventfd.set()?;
            *triggered = true;
        }
        Ok(())
    }

    fn clear_interrupt(&self) -> Result<(), SelectorError> {
        let mut triggered = lock_unpoisoned(&self.interrupt_triggered);
        self.eventfd.reset()?;
        *triggered = false;
        Ok(())
    }

    /// Close the selector and release its descriptors
    ///
    /// A thread blocked in `select` is woken and its select returns before
    /// the descriptors go away; selects started afterwards fail with
    /// [`SelectorError::Closed`]. Closing twice is a no-op.
    pub fn close(&self) -> Result<(), SelectorError> {
        if !self.shared.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        // The in-flight select holds the core lock until it sees the eventfd
        {
            let mut triggered = lock_unpoisoned(&self.interrupt_triggered);
            if !*triggered {
                if let Err(e) = self.eventfd.set() {
                    trace!(error = %e, "close wakeup failed");
                }
                *triggered = true;
            }
        }

        let mut core = self.lock_core();

        // The woken select may have drained the eventfd; block later wakeups
        *lock_unpoisoned(&self.interrupt_triggered) = true;

        for (_, key) in lock_unpoisoned(&self.shared.keys).drain() {
            key.invalidate();
        }
        lock_unpoisoned(&self.shared.update_keys).clear();
        lock_unpoisoned(&self.shared.cancelled_keys).clear();
        core.fd_to_key.clear();

        let result = core.poller.close();
        self.eventfd.close();

        debug!("selector closed");
        result.map_err(SelectorError::from)
    }

    fn lock_core(&self) -> MutexGuard<'_, SelectorCore<P>> {
        lock_unpoisoned(&self.core)
    }
}

impl<P: Poller> Drop for EPollSelector<P> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl<P: Poller> fmt::Debug for EPollSelector<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EPollSelector")
            .field("open", &self.is_open())
            .field("wakeup_fd", &self.eventfd.fd())
            .field("config", &self.config)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
