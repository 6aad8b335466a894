//! # ALICE-Platform
//!
//! **Readiness Multiplexing, Async Channels and Container Limits for Linux**
//!
//! Platform plumbing for a runtime that serves asynchronous sockets from a
//! small pool of threads and sizes itself to the container it runs in.
//!
//! ## Features
//!
//! | Feature | Description |
//! |---------|-------------|
//! | **epoll Selector** | One `epoll_wait` per select, concurrent interest changes, eventfd wakeup |
//! | **Channel Groups** | Selector + thread pool ports driving async TCP channels |
//! | **Cgroup Metrics** | v1 and v2 limit readers that degrade to "unlimited" |
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ALICE-Platform                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  AsyncChannelProvider                                       │
//! │        │ open_channel_group / default_port                  │
//! │        ▼                                                    │
//! │  ┌──────────────┐   ┌───────────────┐   ┌───────────────┐   │
//! │  │     Port     │──▶│ EPollSelector │──▶│ EPoll/EventFd │   │
//! │  │   (poller)   │   │    (keys)     │   │    (libc)     │   │
//! │  └──────┬───────┘   └───────────────┘   └───────────────┘   │
//! │         │ on_event                                          │
//! │         ▼                                                   │
//! │  ┌──────────────┐   ┌───────────────┐                       │
//! │  │  ThreadPool  │◀──│    Metrics    │◀── cgroup v1 / v2     │
//! │  │  (handlers)  │   │  (cpu count)  │                       │
//! │  └──────────────┘   └───────────────┘                       │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use alice_platform::prelude::*;
//!
//! let provider = AsyncChannelProvider::new();
//! let server = provider.open_server_socket_channel(None)?;
//! server.bind("127.0.0.1:0")?;
//! server.accept(|accepted| {
//!     if let Ok(channel) = accepted {
//!         let _ = channel.write(b"hello".to_vec(), |_| {});
//!     }
//! })?;
//!
//! if let Some(metrics) = alice_platform::metrics::system() {
//!     println!("memory limit: {}", metrics.memory_limit());
//! }
//! ```
//!
//! ## Requirements
//!
//! - Linux for the selector, port and channel modules (epoll, eventfd)
//! - Cgroup parsing and metrics build on any platform

// Cgroup modules
pub mod cgroup;
pub mod cgroup_v1;
pub mod cgroup_v2;
pub mod metrics;

// Readiness and channel modules (epoll)
#[cfg(target_os = "linux")]
pub mod channel;
#[cfg(target_os = "linux")]
pub mod epoll;
#[cfg(target_os = "linux")]
pub mod eventfd;
#[cfg(target_os = "linux")]
pub mod port;
#[cfg(target_os = "linux")]
pub mod provider;
#[cfg(target_os = "linux")]
pub mod selection_key;
#[cfg(target_os = "linux")]
pub mod selector;
#[cfg(target_os = "linux")]
pub mod thread_pool;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::cgroup::{
        CgroupSubsystemController, DOUBLE_RETVAL_UNLIMITED, LONG_RETVAL_UNLIMITED,
    };
    pub use crate::cgroup_v1::CgroupV1SubsystemController;
    pub use crate::cgroup_v2::CgroupV2SubsystemController;
    pub use crate::metrics::{CgroupMetrics, CgroupVersion};

    #[cfg(target_os = "linux")]
    pub use crate::channel::{AsyncServerSocketChannel, AsyncSocketChannel, ChannelError};
    #[cfg(target_os = "linux")]
    pub use crate::port::{AsyncChannelGroup, ChannelGroupConfig, PollableChannel, Port};
    #[cfg(target_os = "linux")]
    pub use crate::provider::{default_port, AsyncChannelProvider};
    #[cfg(target_os = "linux")]
    pub use crate::selection_key::{
        SelectionKey, OP_ACCEPT, OP_CONNECT, OP_READ, OP_WRITE,
    };
    #[cfg(target_os = "linux")]
    pub use crate::selector::{EPollSelector, SelectorConfig, SelectorError};
    #[cfg(target_os = "linux")]
    pub use crate::thread_pool::{named_thread_factory, Executor, ThreadPool};
}

pub use prelude::*;

// ============================================================================
// Common Helpers
// ============================================================================

/// Lock `mutex`, recovering the guard if a holder panicked
///
/// Queues and maps guarded this way are only mutated by single calls that
/// cannot panic halfway, so a poisoned lock still guards valid state.
#[cfg(target_os = "linux")]
pub(crate) fn lock_unpoisoned<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// ============================================================================
// Tests
// ============================================================================
