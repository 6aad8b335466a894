//! Channel Group Thread Pools
//!
//! Worker pools that run completion handlers for a channel group.
//!
//! | Kind | Created by | Size |
//! |------|------------|------|
//! | Fixed | [`ThreadPool::create`] | exactly `n` threads from a factory |
//! | Wrapped | [`ThreadPool::wrap`] | caller-supplied [`Executor`] |
//! | Default | [`ThreadPool::create_default`] | container-aware CPU count |

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::warn;

use crate::lock_unpoisoned;

/// Unit of work submitted to a pool
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Produces a thread builder for worker `index`
pub type ThreadFactory = Arc<dyn Fn(usize) -> thread::Builder + Send + Sync>;

/// Environment variable overriding the default pool size
pub const DEFAULT_POOL_SIZE_ENV: &str = "ALICE_DEFAULT_POOL_SIZE";

// ============================================================================
// Executor
// ============================================================================

/// Task submitted after shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RejectedExecution;

impl fmt::Display for RejectedExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task rejected: executor shut down")
    }
}

impl std::error::Error for RejectedExecution {}

/// Something that runs tasks
pub trait Executor: Send + Sync {
    /// Submit `task` for execution
    fn execute(&self, task: Task) -> Result<(), RejectedExecution>;

    /// Stop accepting tasks; queued tasks still run
    fn shutdown(&self);

    /// Whether `shutdown` has been called
    fn is_shutdown(&self) -> bool;
}

/// Factory naming workers `<prefix>-<index>`
pub fn named_thread_factory(prefix: impl Into<String>) -> ThreadFactory {
    let prefix = prefix.into();
    Arc::new(move |index| thread::Builder::new().name(format!("{}-{}", prefix, index)))
}

// ============================================================================
// Fixed Thread Pool
// ============================================================================

/// Fixed number of workers draining a shared queue
pub struct FixedThreadPool {
    sender: Mutex<Option<Sender<Task>>>,
    shutdown: AtomicBool,
    size: usize,
}

impl FixedThreadPool {
    /// Spawn `n_threads` workers using `factory`
    pub fn new(n_threads: usize, factory: &ThreadFactory) -> io::Result<Self> {
        if n_threads == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "thread pool needs at least one thread",
            ));
        }

        let (sender, receiver) = mpsc::channel::<Task>();
        let receiver = Arc::new(Mutex::new(receiver));

        for index in 0..n_threads {
            let receiver = Arc::clone(&receiver);
            // Workers already spawned exit once `sender` drops on error
            factory(index).spawn(move || worker_loop(&receiver))?;
        }

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            shutdown: AtomicBool::new(false),
            size: n_threads,
        })
    }

    /// Number of workers
    pub fn size(&self) -> usize {
        self.size
    }
}

fn worker_loop(receiver: &Mutex<Receiver<Task>>) {
    loop {
        let task = lock_unpoisoned(receiver).recv();
        match task {
            Ok(task) => {
                if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                    warn!(
                        thread = thread::current().name().unwrap_or("<unnamed>"),
                        "task panicked"
                    );
                }
            }
            // Sender dropped: pool shut down and queue drained
            Err(_) => return,
        }
    }
}

impl Executor for FixedThreadPool {
    fn execute(&self, task: Task) -> Result<(), RejectedExecution> {
        let sender = lock_unpoisoned(&self.sender);
        match sender.as_ref() {
            Some(sender) => sender.send(task).map_err(|_| RejectedExecution),
            None => Err(RejectedExecution),
        }
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        lock_unpoisoned(&self.sender).take();
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl Drop for FixedThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Thread Pool
// ============================================================================

/// Worker pool owned by a channel group
#[derive(Clone)]
pub struct ThreadPool {
    executor: Arc<dyn Executor>,
    is_fixed: bool,
    pool_size: usize,
}

impl ThreadPool {
    /// Fixed pool of `n_threads` threads built by `factory`
    pub fn create(n_threads: usize, factory: ThreadFactory) -> io::Result<Self> {
        let pool = FixedThreadPool::new(n_threads, &factory)?;
        Ok(Self {
            executor: Arc::new(pool),
            is_fixed: true,
            pool_size: n_threads,
        })
    }

    /// Wrap an external executor
    ///
    /// `initial_size` is advisory: the executor decides its own parallelism.
    pub fn wrap(executor: Arc<dyn Executor>, initial_size: usize) -> Self {
        Self {
            executor,
            is_fixed: false,
            pool_size: initial_size,
        }
    }

    /// Pool backing the default channel group
    ///
    /// Sized from [`DEFAULT_POOL_SIZE_ENV`] when set to a positive integer,
    /// otherwise from the container-aware processor count.
    pub fn create_default(thread_name_prefix: &str) -> io::Result<Self> {
        let size = default_pool_size();
        Self::create(size, named_thread_factory(thread_name_prefix))
    }

    /// Underlying executor
    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    /// Whether the pool was created with a fixed thread count
    pub fn is_fixed_thread_pool(&self) -> bool {
        self.is_fixed
    }

    /// Thread count (advisory for wrapped executors)
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("is_fixed", &self.is_fixed)
            .field("pool_size", &self.pool_size)
            .field("shutdown", &self.executor.is_shutdown())
            .finish()
    }
}

fn default_pool_size() -> usize {
    std::env::var(DEFAULT_POOL_SIZE_ENV)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or_else(crate::metrics::available_processors)
}

// ============================================================================
// Tests
// ============================================================================
