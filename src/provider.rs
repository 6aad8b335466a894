//! Asynchronous Channel Provider
//!
//! Factory for channel groups and channels. Groups opened through a provider
//! are [`Port`]s; a process-wide default port backs channels opened without
//! an explicit group.
//!
//! ## Group Validation
//!
//! | Group passed | Result |
//! |--------------|--------|
//! | `None` | default port |
//! | default port | accepted |
//! | port from this provider | accepted |
//! | port from another provider | `IllegalChannelGroup` |
//! | any other group type | `IllegalChannelGroup` |

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tracing::debug;

use crate::channel::{AsyncServerSocketChannel, AsyncSocketChannel, ChannelError};
use crate::lock_unpoisoned;
use crate::port::{AsyncChannelGroup, ChannelGroupConfig, Port};
use crate::thread_pool::{Executor, ThreadFactory, ThreadPool};

/// Provider id of the default port
const DEFAULT_PROVIDER_ID: u64 = 0;

static NEXT_PROVIDER_ID: AtomicU64 = AtomicU64::new(DEFAULT_PROVIDER_ID + 1);

static DEFAULT_PORT: OnceLock<Arc<Port>> = OnceLock::new();
static DEFAULT_PORT_INIT: Mutex<()> = Mutex::new(());

/// Default port, created on first use and never shut down
///
/// Initialization is serialized; a failed attempt is retried by the next
/// caller.
pub fn default_port() -> Result<Arc<Port>, ChannelError> {
    if let Some(port) = DEFAULT_PORT.get() {
        return Ok(Arc::clone(port));
    }

    let _guard = lock_unpoisoned(&DEFAULT_PORT_INIT);
    if let Some(port) = DEFAULT_PORT.get() {
        return Ok(Arc::clone(port));
    }

    let config = ChannelGroupConfig::default();
    let pool = ThreadPool::create_default(&config.thread_name_prefix)?;
    let port = Port::new(DEFAULT_PROVIDER_ID, pool, &config)?.start()?;
    debug!(pool_size = port.thread_pool().pool_size(), "default port created");

    Ok(Arc::clone(DEFAULT_PORT.get_or_init(|| port)))
}

fn is_default_port(port: &Arc<Port>) -> bool {
    DEFAULT_PORT
        .get()
        .map_or(false, |default| Arc::ptr_eq(default, port))
}

// ============================================================================
// Provider
// ============================================================================

/// Opens channel groups and channels
#[derive(Debug)]
pub struct AsyncChannelProvider {
    id: u64,
    config: ChannelGroupConfig,
}

impl Default for AsyncChannelProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncChannelProvider {
    /// Provider with default group configuration
    pub fn new() -> Self {
        Self::with_config(ChannelGroupConfig::default())
    }

    /// Provider whose groups use `config`
    pub fn with_config(config: ChannelGroupConfig) -> Self {
        Self {
            id: NEXT_PROVIDER_ID.fetch_add(1, Ordering::Relaxed),
            config,
        }
    }

    /// Identity stamped on every group this provider opens
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Open a group backed by a fixed pool of `n_threads` threads
    pub fn open_channel_group(
        &self,
        n_threads: usize,
        factory: ThreadFactory,
    ) -> Result<Arc<Port>, ChannelError> {
        let pool = ThreadPool::create(n_threads, factory)?;
        self.start_port(pool)
    }

    /// Open a group that completes on `executor`
    ///
    /// `initial_size` is a hint recorded on the pool.
    pub fn open_channel_group_with_executor(
        &self,
        executor: Arc<dyn Executor>,
        initial_size: usize,
    ) -> Result<Arc<Port>, ChannelError> {
        self.start_port(ThreadPool::wrap(executor, initial_size))
    }

    fn start_port(&self, pool: ThreadPool) -> Result<Arc<Port>, ChannelError> {
        let port = Port::new(self.id, pool, &self.config)?.start()?;
        debug!(provider = self.id, "channel group opened");
        Ok(port)
    }

    /// Resolve `group` to a port this provider may use
    pub fn to_port(
        &self,
        group: Option<Arc<dyn AsyncChannelGroup>>,
    ) -> Result<Arc<Port>, ChannelError> {
        let group = match group {
            Some(group) => group,
            None => return default_port(),
        };

        let port = group
            .as_any()
            .downcast::<Port>()
            .map_err(|_| ChannelError::IllegalChannelGroup)?;

        if port.provider_id() == self.id || is_default_port(&port) {
            Ok(port)
        } else {
            Err(ChannelError::IllegalChannelGroup)
        }
    }

    /// Open an unconnected socket channel in `group` (default port if `None`)
    pub fn open_socket_channel(
        &self,
        group: Option<Arc<dyn AsyncChannelGroup>>,
    ) -> Result<AsyncSocketChannel, ChannelError> {
        AsyncSocketChannel::open(self.to_port(group)?)
    }

    /// Open an unbound server socket channel in `group` (default port if `None`)
    pub fn open_server_socket_channel(
        &self,
        group: Option<Arc<dyn AsyncChannelGroup>>,
    ) -> Result<AsyncServerSocketChannel, ChannelError> {
        AsyncServerSocketChannel::open(self.to_port(group)?)
    }
}

// ============================================================================
// Tests
// ============================================================================
