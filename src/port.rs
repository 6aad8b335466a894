//! Channel Group Ports
//!
//! A [`Port`] pairs an [`EPollSelector`] with a [`ThreadPool`]. A dedicated
//! poller thread runs the select loop; each ready registration is disarmed
//! (one-shot) and its channel's [`PollableChannel::on_event`] is handed to
//! the pool. Channels re-arm with [`Port::start_poll`].
//!
//! ## Lifecycle
//!
//! ```text
//! new() → start() → [register / start_poll / unregister]* → shutdown()
//! ```
//!
//! The default port is never shut down; explicitly opened groups must be
//! shut down by whoever opened them.

use core::any::Any;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::channel::ChannelError;
use crate::lock_unpoisoned;
use crate::selection_key::SelectionKey;
use crate::selector::{EPollSelector, SelectorConfig, SelectorError};
use crate::thread_pool::{Task, ThreadPool};

/// Consecutive select failures tolerated before the group shuts down
const MAX_SELECT_RETRIES: u32 = 5;

/// Delay before the first select retry; doubles on each further failure
const SELECT_RETRY_BACKOFF: Duration = Duration::from_millis(10);

// ============================================================================
// Configuration
// ============================================================================

/// Channel group configuration
#[derive(Debug, Clone)]
pub struct ChannelGroupConfig {
    /// Name prefix for the poller thread and default-pool workers
    pub thread_name_prefix: String,
    /// Selector settings for the group's port
    pub selector: SelectorConfig,
}

impl Default for ChannelGroupConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: "alice-port".to_string(),
            selector: SelectorConfig::default(),
        }
    }
}

impl ChannelGroupConfig {
    /// Set the thread name prefix
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Set the per-wait event batch size
    pub fn max_events(mut self, max_events: usize) -> Self {
        self.selector = self.selector.max_events(max_events);
        self
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Channel driven by readiness events from a port
pub trait PollableChannel: Send + Sync {
    /// Called on a pool thread with the logical ops found ready
    fn on_event(&self, ready_ops: u32);
}

/// Asynchronous channel group
pub trait AsyncChannelGroup: Send + Sync + 'static {
    /// Identity of the provider that created this group
    fn provider_id(&self) -> u64;

    /// Stop the group; idempotent
    fn shutdown(&self);

    /// Whether `shutdown` has been called
    fn is_shutdown(&self) -> bool;

    /// Upcast for the provider's type check
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

// ============================================================================
// Port
// ============================================================================

struct Registration {
    key: SelectionKey,
    channel: Weak<dyn PollableChannel>,
}

/// Selector-backed channel group
pub struct Port {
    provider_id: u64,
    selector: EPollSelector,
    pool: ThreadPool,
    channels: RwLock<HashMap<RawFd, Registration>>,
    shutdown: AtomicBool,
    poller: Mutex<Option<JoinHandle<()>>>,
    thread_name_prefix: String,
}

impl Port {
    /// Create a port for `provider_id` using `pool` for completions
    ///
    /// Fails if the selector cannot be opened. Call [`start`](Self::start)
    /// before registering channels.
    pub fn new(
        provider_id: u64,
        pool: ThreadPool,
        config: &ChannelGroupConfig,
    ) -> Result<Arc<Self>, ChannelError> {
        let selector = EPollSelector::with_config(config.selector)?;
        Ok(Arc::new(Self {
            provider_id,
            selector,
            pool,
            channels: RwLock::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            poller: Mutex::new(None),
            thread_name_prefix: config.thread_name_prefix.clone(),
        }))
    }

    /// Spawn the poller thread
    ///
    /// Starting a running or shut down port is a no-op.
    pub fn start(self: &Arc<Self>) -> Result<Arc<Self>, ChannelError> {
        let mut poller = lock_unpoisoned(&self.poller);
        if poller.is_some() || self.is_shutdown() {
            return Ok(Arc::clone(self));
        }

        let port = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("{}-poller", self.thread_name_prefix))
            .spawn(move || port.run_poller())?;

        *poller = Some(handle);
        debug!(
            provider = self.provider_id,
            pool_size = self.pool.pool_size(),
            "port started"
        );
        Ok(Arc::clone(self))
    }

    fn run_poller(&self) {
        self.poll_until_shutdown(|action| self.selector.select_with(-1, action));
    }

    /// Select loop over `select`, dispatching each ready key to the pool
    ///
    /// Select failures are retried with exponential backoff. After
    /// `MAX_SELECT_RETRIES` consecutive failures the group is shut down.
    fn poll_until_shutdown<S>(&self, mut select: S)
    where
        S: FnMut(&mut dyn FnMut(&SelectionKey)) -> Result<usize, SelectorError>,
    {
        let mut ready: Vec<(SelectionKey, u32)> = Vec::new();
        let mut failures = 0u32;

        while !self.shutdown.load(Ordering::Acquire) {
            let result = select(&mut |key: &SelectionKey| {
                let ops = key.ready_ops();
                // One-shot: disarm before the handler can re-arm
                match key.set_interest_ops(0) {
                    Ok(()) | Err(SelectorError::CancelledKey | SelectorError::Closed) => {}
                    Err(e) => trace!(fd = key.fd(), error = %e, "disarm failed"),
                }
                ready.push((key.clone(), ops));
            });

            match result {
                Ok(_) => failures = 0,
                Err(SelectorError::Closed) => break,
                Err(e) => {
                    failures += 1;
                    if failures > MAX_SELECT_RETRIES {
                        warn!(error = %e, failures, "select keeps failing, shutting down group");
                        self.shutdown_now();
                        break;
                    }
                    warn!(error = %e, failures, "select failed, retrying");
                    thread::sleep(SELECT_RETRY_BACKOFF * (1 << (failures - 1)));
                }
            }

            for (key, ops) in ready.drain(..) {
                self.dispatch(&key, ops);
            }
        }
    }

    fn dispatch(&self, key: &SelectionKey, ops: u32) {
        let channel = {
            let channels = self.channels.read().unwrap_or_else(|e| e.into_inner());
            channels
                .get(&key.fd())
                .filter(|reg| reg.key.ptr_eq(key))
                .and_then(|reg| reg.channel.upgrade())
        };

        if let Some(channel) = channel {
            let task: Task = Box::new(move || channel.on_event(ops));
            if self.execute(task).is_err() {
                warn!(fd = key.fd(), "event dropped: group shut down");
            }
        }
    }

    /// Register `channel` under `fd` with an empty interest set
    pub fn register(&self, fd: RawFd, channel: &Arc<dyn PollableChannel>) -> Result<(), ChannelError> {
        if self.is_shutdown() {
            return Err(ChannelError::ShutdownChannelGroup);
        }

        let key = self.selector.register(fd, 0)?;
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        channels.insert(
            fd,
            Registration {
                key,
                channel: Arc::downgrade(channel),
            },
        );
        Ok(())
    }

    /// Arm `fd` for the logical ops `ops` (one-shot)
    pub fn start_poll(&self, fd: RawFd, ops: u32) -> Result<(), ChannelError> {
        let key = {
            let channels = self.channels.read().unwrap_or_else(|e| e.into_inner());
            channels.get(&fd).map(|reg| reg.key.clone())
        };
        let key = key.ok_or(ChannelError::Closed)?;

        key.set_interest_ops(ops)?;
        self.selector.wakeup()?;
        Ok(())
    }

    /// Drop the registration for `fd`
    ///
    /// Must be called before the descriptor is closed.
    pub fn unregister(&self, fd: RawFd) {
        let removed = {
            let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
            channels.remove(&fd)
        };

        if let Some(reg) = removed {
            reg.key.cancel();
            let _ = self.selector.wakeup();
        }
    }

    /// Run `task` on the group's pool
    pub fn execute(&self, task: Task) -> Result<(), ChannelError> {
        self.pool
            .executor()
            .execute(task)
            .map_err(|_| ChannelError::ShutdownChannelGroup)
    }

    /// Pool running this group's completions
    pub fn thread_pool(&self) -> &ThreadPool {
        &self.pool
    }

    /// Number of registered channels
    pub fn channel_count(&self) -> usize {
        self.channels.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn shutdown_now(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        let _ = self.selector.wakeup();
        let handle = lock_unpoisoned(&self.poller).take();
        if let Some(handle) = handle {
            // The poller itself may shut the group down from a handler
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }

        if let Err(e) = self.selector.close() {
            warn!(error = %e, "selector close failed");
        }
        self.channels
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.pool.executor().shutdown();

        debug!(provider = self.provider_id, "port shut down");
    }
}

impl AsyncChannelGroup for Port {
    fn provider_id(&self) -> u64 {
        self.provider_id
    }

    fn shutdown(&self) {
        self.shutdown_now();
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("provider_id", &self.provider_id)
            .field("pool", &self.pool)
            .field("channels", &self.channel_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
