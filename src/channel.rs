//! Asynchronous Socket Channels
//!
//! Non-blocking TCP channels bound to a [`Port`]. Every operation takes a
//! completion handler that runs on the group's thread pool.
//!
//! ## Operations
//!
//! | Channel | Operation | Outstanding limit |
//! |---------|-----------|-------------------|
//! | server | `accept` | one |
//! | socket | `connect` | one |
//! | socket | `read` | one |
//! | socket | `write` | one |
//!
//! An operation that would block arms the port for the matching op and
//! completes from [`PollableChannel::on_event`].

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use std::io::{self, Read, Write};
use std::mem;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::{Arc, Mutex, RwLock};

use tracing::trace;

use crate::lock_unpoisoned;
use crate::port::{AsyncChannelGroup, PollableChannel, Port};
use crate::selection_key::{OP_ACCEPT, OP_CONNECT, OP_READ, OP_WRITE};
use crate::selector::SelectorError;
use crate::thread_pool::Task;

// ============================================================================
// Error Types
// ============================================================================

/// Channel and channel group errors
#[derive(Debug)]
pub enum ChannelError {
    /// Group was not created by this provider
    IllegalChannelGroup,
    /// Group has been shut down
    ShutdownChannelGroup,
    /// Channel closed (possibly while an operation was outstanding)
    Closed,
    /// An accept is already outstanding
    AcceptPending,
    /// A connect is already outstanding
    ConnectionPending,
    /// Channel already connected
    AlreadyConnected,
    /// Channel already bound
    AlreadyBound,
    /// A read is already outstanding
    ReadPending,
    /// A write is already outstanding
    WritePending,
    /// Server channel not bound
    NotYetBound,
    /// Socket channel not connected
    NotYetConnected,
    /// Selector failure
    Selector(SelectorError),
    /// Socket I/O failure
    Io(io::Error),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::IllegalChannelGroup => write!(f, "Illegal channel group"),
            ChannelError::ShutdownChannelGroup => write!(f, "Channel group shut down"),
            ChannelError::Closed => write!(f, "Channel closed"),
            ChannelError::AcceptPending => write!(f, "Accept already pending"),
            ChannelError::ConnectionPending => write!(f, "Connection already pending"),
            ChannelError::AlreadyConnected => write!(f, "Channel already connected"),
            ChannelError::AlreadyBound => write!(f, "Channel already bound"),
            ChannelError::ReadPending => write!(f, "Read already pending"),
            ChannelError::WritePending => write!(f, "Write already pending"),
            ChannelError::NotYetBound => write!(f, "Channel not yet bound"),
            ChannelError::NotYetConnected => write!(f, "Channel not yet connected"),
            ChannelError::Selector(e) => write!(f, "Selector error: {}", e),
            ChannelError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChannelError::Selector(e) => Some(e),
            ChannelError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ChannelError {
    fn from(e: io::Error) -> Self {
        ChannelError::Io(e)
    }
}

impl From<SelectorError> for ChannelError {
    fn from(e: SelectorError) -> Self {
        match e {
            SelectorError::Closed | SelectorError::CancelledKey => ChannelError::Closed,
            other => ChannelError::Selector(other),
        }
    }
}

// ============================================================================
// Completion
// ============================================================================

type Handler<T> = Box<dyn FnOnce(Result<T, ChannelError>) + Send + 'static>;

/// Bytes transferred and the caller's buffer
pub type IoResult = Result<(usize, Vec<u8>), ChannelError>;

/// Run `handler(result)` on the group's pool
///
/// If the pool rejects the task the handler runs inline with
/// [`ChannelError::ShutdownChannelGroup`].
fn complete<T: Send + 'static>(port: &Port, handler: Handler<T>, result: Result<T, ChannelError>) {
    let slot = Arc::new(Mutex::new(Some((handler, result))));
    let task_slot = Arc::clone(&slot);
    let task: Task = Box::new(move || {
        let taken = lock_unpoisoned(&task_slot).take();
        if let Some((handler, result)) = taken {
            handler(result);
        }
    });

    if port.execute(task).is_err() {
        let taken = lock_unpoisoned(&slot).take();
        if let Some((handler, _)) = taken {
            handler(Err(ChannelError::ShutdownChannelGroup));
        }
    }
}

fn ensure_group(port: &Port) -> Result<(), ChannelError> {
    if port.is_shutdown() {
        return Err(ChannelError::ShutdownChannelGroup);
    }
    Ok(())
}

/// Open a non-blocking TCP socket and start connecting it to `addr`
///
/// Returns the socket and whether the handshake is still in progress.
fn start_connect(addr: &SocketAddr) -> io::Result<(TcpStream, bool)> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let ty = libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC;

    // SAFETY: socket(2) takes no pointers
    let fd = unsafe { libc::socket(domain, ty, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd is a fresh socket owned by nothing else
    let stream = unsafe { TcpStream::from_raw_fd(fd) };

    let (storage, len) = raw_socket_addr(addr);
    // SAFETY: storage holds a sockaddr of `len` bytes for the socket's family
    let ret = unsafe {
        libc::connect(
            fd,
            (&storage as *const libc::sockaddr_storage).cast::<libc::sockaddr>(),
            len,
        )
    };
    if ret == 0 {
        return Ok((stream, false));
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINPROGRESS) => Ok((stream, true)),
        _ => Err(err),
    }
}

fn raw_socket_addr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: all-zero is a valid sockaddr_storage
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            // SAFETY: sockaddr_storage is sized and aligned for every sockaddr
            let sin = unsafe {
                &mut *(&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_in>()
            };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = a.port().to_be();
            sin.sin_addr.s_addr = u32::from_ne_bytes(a.ip().octets());
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            // SAFETY: as above
            let sin6 = unsafe {
                &mut *(&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_in6>()
            };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = a.port().to_be();
            sin6.sin6_flowinfo = a.flowinfo();
            sin6.sin6_addr.s6_addr = a.ip().octets();
            sin6.sin6_scope_id = a.scope_id();
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

// ============================================================================
// Server Socket Channel
// ============================================================================

struct ServerInner {
    port: Arc<Port>,
    listener: RwLock<Option<TcpListener>>,
    pending: Mutex<Option<Handler<AsyncSocketChannel>>>,
    closed: AtomicBool,
}

/// Asynchronous listening socket
pub struct AsyncServerSocketChannel {
    inner: Arc<ServerInner>,
}

impl AsyncServerSocketChannel {
    pub(crate) fn open(port: Arc<Port>) -> Result<Self, ChannelError> {
        ensure_group(&port)?;
        Ok(Self {
            inner: Arc::new(ServerInner {
                port,
                listener: RwLock::new(None),
                pending: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Bind to `addr` and start listening
    pub fn bind(&self, addr: impl ToSocketAddrs) -> Result<(), ChannelError> {
        self.inner.ensure_open()?;
        let mut guard = self.inner.listener.write().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return Err(ChannelError::AlreadyBound);
        }

        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;

        let channel: Arc<dyn PollableChannel> = self.inner.clone();
        self.inner.port.register(listener.as_raw_fd(), &channel)?;
        *guard = Some(listener);
        Ok(())
    }

    /// Bound address
    pub fn local_addr(&self) -> Result<SocketAddr, ChannelError> {
        let guard = self.inner.listener.read().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(listener) => Ok(listener.local_addr()?),
            None => Err(ChannelError::NotYetBound),
        }
    }

    /// Accept one connection; `handler` receives the new channel
    ///
    /// The accepted channel is bound to the same group.
    pub fn accept<F>(&self, handler: F) -> Result<(), ChannelError>
    where
        F: FnOnce(Result<AsyncSocketChannel, ChannelError>) + Send + 'static,
    {
        self.inner.ensure_open()?;
        if self
            .inner
            .listener
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
        {
            return Err(ChannelError::NotYetBound);
        }

        {
            let mut pending = lock_unpoisoned(&self.inner.pending);
            if pending.is_some() {
                return Err(ChannelError::AcceptPending);
            }
            *pending = Some(Box::new(handler));
        }

        self.inner.try_accept();
        Ok(())
    }

    /// Channel group this channel belongs to
    pub fn port(&self) -> &Arc<Port> {
        &self.inner.port
    }

    /// Whether the channel is open
    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
    }

    /// Close the listener; an outstanding accept fails with `Closed`
    pub fn close(&self) {
        self.inner.close();
    }
}

impl ServerInner {
    fn ensure_open(&self) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        Ok(())
    }

    fn try_accept(&self) {
        let mut pending = lock_unpoisoned(&self.pending);
        if pending.is_none() {
            return;
        }

        let (fd, accepted) = {
            let guard = self.listener.read().unwrap_or_else(|e| e.into_inner());
            match guard.as_ref() {
                Some(listener) => (listener.as_raw_fd(), listener.accept()),
                None => (-1, Err(io::Error::from(io::ErrorKind::NotConnected))),
            }
        };

        let result = match accepted {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                match self.port.start_poll(fd, OP_ACCEPT) {
                    Ok(()) => return,
                    Err(e) => Err(e),
                }
            }
            Err(_) if self.closed.load(Ordering::Acquire) => Err(ChannelError::Closed),
            Err(e) => Err(ChannelError::Io(e)),
            Ok((stream, peer)) => {
                trace!(%peer, "connection accepted");
                AsyncSocketChannel::from_stream(Arc::clone(&self.port), stream)
            }
        };

        let handler = pending.take();
        drop(pending);
        if let Some(handler) = handler {
            complete(&self.port, handler, result);
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let listener = self
            .listener
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(listener) = listener {
            self.port.unregister(listener.as_raw_fd());
        }

        let handler = lock_unpoisoned(&self.pending).take();
        if let Some(handler) = handler {
            complete(&self.port, handler, Err(ChannelError::Closed));
        }
    }
}

impl PollableChannel for ServerInner {
    fn on_event(&self, _ready_ops: u32) {
        self.try_accept();
    }
}

impl Drop for AsyncServerSocketChannel {
    fn drop(&mut self) {
        self.inner.close();
    }
}

// ============================================================================
// Socket Channel
// ============================================================================

#[derive(Default)]
struct SocketState {
    connector: Option<Handler<()>>,
    reader: Option<(Vec<u8>, Handler<(usize, Vec<u8>)>)>,
    writer: Option<(Vec<u8>, Handler<(usize, Vec<u8>)>)>,
}

impl SocketState {
    fn pending_ops(&self) -> u32 {
        let mut ops = 0;
        if self.connector.is_some() {
            ops |= OP_CONNECT;
        }
        if self.reader.is_some() {
            ops |= OP_READ;
        }
        if self.writer.is_some() {
            ops |= OP_WRITE;
        }
        ops
    }
}

struct SocketInner {
    port: Arc<Port>,
    stream: RwLock<Option<TcpStream>>,
    state: Mutex<SocketState>,
    connected: AtomicBool,
    closed: AtomicBool,
}

type Completion = (Handler<(usize, Vec<u8>)>, IoResult);

/// Asynchronous TCP stream
pub struct AsyncSocketChannel {
    inner: Arc<SocketInner>,
}

impl AsyncSocketChannel {
    pub(crate) fn open(port: Arc<Port>) -> Result<Self, ChannelError> {
        ensure_group(&port)?;
        Ok(Self {
            inner: Arc::new(SocketInner {
                port,
                stream: RwLock::new(None),
                state: Mutex::new(SocketState::default()),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        })
    }

    fn from_stream(port: Arc<Port>, stream: TcpStream) -> Result<Self, ChannelError> {
        let channel = Self::open(port)?;
        channel.inner.attach(stream)?;
        channel.inner.connected.store(true, Ordering::Release);
        Ok(channel)
    }

    /// Connect to `addr`; `handler` runs once connected or failed
    ///
    /// The handshake runs on the port, not on a pool thread. A failed
    /// connect closes the channel.
    pub fn connect<F>(&self, addr: SocketAddr, handler: F) -> Result<(), ChannelError>
    where
        F: FnOnce(Result<(), ChannelError>) + Send + 'static,
    {
        self.inner.ensure_open()?;
        let mut state = lock_unpoisoned(&self.inner.state);
        if self.inner.is_connected() {
            return Err(ChannelError::AlreadyConnected);
        }
        if state.connector.is_some() {
            return Err(ChannelError::ConnectionPending);
        }

        let handler: Handler<()> = Box::new(handler);
        let started = start_connect(&addr)
            .map_err(ChannelError::from)
            .and_then(|(stream, in_progress)| {
                self.inner.attach(stream)?;
                Ok(in_progress)
            });

        match started {
            Ok(true) => {
                trace!(%addr, "connect in progress");
                state.connector = Some(handler);
                let arm = self.inner.arm(&state);
                drop(state);
                self.inner.finish(None, arm);
            }
            Ok(false) => {
                self.inner.connected.store(true, Ordering::Release);
                drop(state);
                complete(&self.inner.port, handler, Ok(()));
            }
            Err(e) => {
                drop(state);
                self.inner.close();
                complete(&self.inner.port, handler, Err(e));
            }
        }
        Ok(())
    }

    /// Read into `buf`; `handler` receives the byte count (0 at EOF) and `buf`
    pub fn read<F>(&self, buf: Vec<u8>, handler: F) -> Result<(), ChannelError>
    where
        F: FnOnce(IoResult) + Send + 'static,
    {
        self.inner.ensure_open()?;
        self.inner.ensure_connected()?;

        let mut state = lock_unpoisoned(&self.inner.state);
        if state.reader.is_some() {
            return Err(ChannelError::ReadPending);
        }
        state.reader = Some((buf, Box::new(handler)));
        let done = self.inner.try_read(&mut state);
        let arm = self.inner.arm(&state);
        drop(state);

        self.inner.finish(done, arm);
        Ok(())
    }

    /// Write from `buf`; `handler` receives the bytes written and `buf`
    ///
    /// A single write may be partial.
    pub fn write<F>(&self, buf: Vec<u8>, handler: F) -> Result<(), ChannelError>
    where
        F: FnOnce(IoResult) + Send + 'static,
    {
        self.inner.ensure_open()?;
        self.inner.ensure_connected()?;

        let mut state = lock_unpoisoned(&self.inner.state);
        if state.writer.is_some() {
            return Err(ChannelError::WritePending);
        }
        state.writer = Some((buf, Box::new(handler)));
        let done = self.inner.try_write(&mut state);
        let arm = self.inner.arm(&state);
        drop(state);

        self.inner.finish(done, arm);
        Ok(())
    }

    /// Local address
    pub fn local_addr(&self) -> Result<SocketAddr, ChannelError> {
        self.inner.with_stream(|s| s.local_addr())
    }

    /// Remote address
    pub fn peer_addr(&self) -> Result<SocketAddr, ChannelError> {
        self.inner.with_stream(|s| s.peer_addr())
    }

    /// Channel group this channel belongs to
    pub fn port(&self) -> &Arc<Port> {
        &self.inner.port
    }

    /// Whether the channel is open
    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
    }

    /// Close the socket; outstanding operations fail with `Closed`
    pub fn close(&self) {
        self.inner.close();
    }
}

impl SocketInner {
    fn ensure_open(&self) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn ensure_connected(&self) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::NotYetConnected);
        }
        Ok(())
    }

    fn with_stream<T>(&self, f: impl FnOnce(&TcpStream) -> io::Result<T>) -> Result<T, ChannelError> {
        let guard = self.stream.read().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(stream) => Ok(f(stream)?),
            None if self.closed.load(Ordering::Acquire) => Err(ChannelError::Closed),
            None => Err(ChannelError::NotYetConnected),
        }
    }

    /// Make `stream` this channel's socket and register it with the port
    fn attach(self: &Arc<Self>, stream: TcpStream) -> Result<(), ChannelError> {
        stream.set_nonblocking(true)?;
        let mut guard = self.stream.write().unwrap_or_else(|e| e.into_inner());
        self.ensure_open()?;

        let channel: Arc<dyn PollableChannel> = self.clone();
        self.port.register(stream.as_raw_fd(), &channel)?;
        *guard = Some(stream);
        Ok(())
    }

    fn fd(&self) -> Option<RawFd> {
        self.stream
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(AsRawFd::as_raw_fd)
    }

    /// Settle a connect the port reported ready, using `SO_ERROR`
    fn finish_connect(&self, state: &mut SocketState) -> Option<(Handler<()>, Result<(), ChannelError>)> {
        let handler = state.connector.take()?;
        let result = match self.with_stream(TcpStream::take_error) {
            Ok(None) => {
                self.connected.store(true, Ordering::Release);
                Ok(())
            }
            Ok(Some(e)) => Err(ChannelError::Io(e)),
            Err(e) => Err(e),
        };
        Some((handler, result))
    }

    /// Attempt the pending read; `None` while it would block
    fn try_read(&self, state: &mut SocketState) -> Option<Completion> {
        let (mut buf, handler) = state.reader.take()?;
        let result = self.with_stream(|mut s| s.read(&mut buf));
        match result {
            Err(ChannelError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                state.reader = Some((buf, handler));
                None
            }
            Ok(n) => Some((handler, Ok((n, buf)))),
            Err(e) => Some((handler, Err(e))),
        }
    }

    /// Attempt the pending write; `None` while it would block
    fn try_write(&self, state: &mut SocketState) -> Option<Completion> {
        let (buf, handler) = state.writer.take()?;
        let result = self.with_stream(|mut s| s.write(&buf));
        match result {
            Err(ChannelError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                state.writer = Some((buf, handler));
                None
            }
            Ok(n) => Some((handler, Ok((n, buf)))),
            Err(e) => Some((handler, Err(e))),
        }
    }

    /// Arm the port for whatever is still pending
    fn arm(&self, state: &SocketState) -> Result<(), ChannelError> {
        let ops = state.pending_ops();
        if ops == 0 {
            return Ok(());
        }
        match self.fd() {
            Some(fd) => self.port.start_poll(fd, ops),
            None => Err(ChannelError::Closed),
        }
    }

    /// Deliver a completion; fail everything pending if arming failed
    fn finish(&self, done: Option<Completion>, arm: Result<(), ChannelError>) {
        if let Some((handler, result)) = done {
            complete(&self.port, handler, result);
        }
        if let Err(e) = arm {
            trace!(error = %e, "arming failed, failing pending operations");
            self.fail_pending();
        }
    }

    fn fail_pending(&self) {
        let (connector, reader, writer) = {
            let mut state = lock_unpoisoned(&self.state);
            (state.connector.take(), state.reader.take(), state.writer.take())
        };
        if let Some(handler) = connector {
            complete(&self.port, handler, Err(ChannelError::Closed));
        }
        for (_, handler) in reader.into_iter().chain(writer) {
            complete(&self.port, handler, Err(ChannelError::Closed));
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let stream = self.stream.write().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(stream) = stream {
            self.port.unregister(stream.as_raw_fd());
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }

        self.fail_pending();
    }
}

impl PollableChannel for SocketInner {
    fn on_event(&self, ready_ops: u32) {
        let mut state = lock_unpoisoned(&self.state);
        let connect_done = if ready_ops & OP_CONNECT != 0 {
            self.finish_connect(&mut state)
        } else {
            None
        };
        let read_done = if ready_ops & OP_READ != 0 {
            self.try_read(&mut state)
        } else {
            None
        };
        let write_done = if ready_ops & OP_WRITE != 0 {
            self.try_write(&mut state)
        } else {
            None
        };
        let arm = self.arm(&state);
        drop(state);

        if let Some((handler, result)) = connect_done {
            if let Err(e) = &result {
                trace!(error = %e, "connect failed");
                self.close();
            }
            complete(&self.port, handler, result);
        }
        self.finish(read_done, Ok(()));
        self.finish(write_done, arm);
    }
}

impl Drop for AsyncSocketChannel {
    fn drop(&mut self) {
        self.inner.close();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::ChannelGroupConfig;
    use crate::thread_pool::{named_thread_factory, ThreadPool};
    use std::sync::mpsc;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn group() -> Arc<Port> {
        let pool = ThreadPool::create(2, named_thread_factory("channel-test")).unwrap();
        Port::new(7, pool, &ChannelGroupConfig::default())
            .unwrap()
            .start()
            .unwrap()
    }

    #[test]
    fn test_accept_connect_echo() {
        let port = group();
        let server = AsyncServerSocketChannel::open(Arc::clone(&port)).unwrap();
        server.bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();

        let (accepted_tx, accepted_rx) = mpsc::channel();
        server.accept(move |r| accepted_tx.send(r).unwrap()).unwrap();
        assert!(matches!(server.accept(|_| {}), Err(ChannelError::AcceptPending)));

        let client = AsyncSocketChannel::open(Arc::clone(&port)).unwrap();
        let (connect_tx, connect_rx) = mpsc::channel();
        client.connect(addr, move |r| connect_tx.send(r).unwrap()).unwrap();
        connect_rx.recv_timeout(TIMEOUT).unwrap().unwrap();
        assert_eq!(client.peer_addr().unwrap(), addr);

        let accepted = accepted_rx.recv_timeout(TIMEOUT).unwrap().unwrap();
        assert!(Arc::ptr_eq(accepted.port(), &port));

        // Read issued before any data arrives parks on the port
        let (read_tx, read_rx) = mpsc::channel();
        accepted
            .read(vec![0u8; 16], move |r| read_tx.send(r).unwrap())
            .unwrap();
        assert!(matches!(
            accepted.read(vec![0u8; 4], |_| {}),
            Err(ChannelError::ReadPending)
        ));

        let (write_tx, write_rx) = mpsc::channel();
        client
            .write(b"ping".to_vec(), move |r| write_tx.send(r).unwrap())
            .unwrap();
        let (written, _) = write_rx.recv_timeout(TIMEOUT).unwrap().unwrap();
        assert_eq!(written, 4);

        let (n, buf) = read_rx.recv_timeout(TIMEOUT).unwrap().unwrap();
        assert_eq!(&buf[..n], b"ping");

        // EOF after the peer closes
        client.close();
        let (eof_tx, eof_rx) = mpsc::channel();
        accepted
            .read(vec![0u8; 16], move |r| eof_tx.send(r).unwrap())
            .unwrap();
        let (n, _) = eof_rx.recv_timeout(TIMEOUT).unwrap().unwrap();
        assert_eq!(n, 0);

        server.close();
        port.shutdown();
    }

    #[test]
    fn test_pending_connect_leaves_pool_free() {
        let pool = ThreadPool::create(1, named_thread_factory("connect-test")).unwrap();
        let port = Port::new(7, pool, &ChannelGroupConfig::default())
            .unwrap()
            .start()
            .unwrap();

        // Unroutable: either stays in progress or fails fast
        let addr: SocketAddr = "10.255.255.1:9".parse().unwrap();
        let socket = AsyncSocketChannel::open(Arc::clone(&port)).unwrap();
        let (connect_tx, connect_rx) = mpsc::channel();
        socket.connect(addr, move |r| connect_tx.send(r).unwrap()).unwrap();

        // The only worker is not tied up by the handshake
        let (task_tx, task_rx) = mpsc::channel();
        port.execute(Box::new(move || task_tx.send(()).unwrap())).unwrap();
        task_rx.recv_timeout(Duration::from_secs(1)).unwrap();

        if socket.is_open() {
            assert!(matches!(
                socket.connect(addr, |_| {}),
                Err(ChannelError::ConnectionPending)
            ));
            assert!(matches!(
                socket.read(vec![0u8; 1], |_| {}),
                Err(ChannelError::NotYetConnected)
            ));
        }

        socket.close();
        assert!(connect_rx.recv_timeout(TIMEOUT).unwrap().is_err());
        port.shutdown();
    }

    #[test]
    fn test_connect_refused_closes_channel() {
        let port = group();
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let socket = AsyncSocketChannel::open(Arc::clone(&port)).unwrap();
        let (tx, rx) = mpsc::channel();
        socket.connect(addr, move |r| tx.send(r).unwrap()).unwrap();

        match rx.recv_timeout(TIMEOUT).unwrap() {
            Err(ChannelError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::ConnectionRefused),
            other => panic!("expected a refused connect, got {other:?}"),
        }
        assert!(!socket.is_open());
        assert!(matches!(socket.connect(addr, |_| {}), Err(ChannelError::Closed)));
        port.shutdown();
    }

    #[test]
    fn test_raw_socket_addr_layout() {
        let (storage, len) = raw_socket_addr(&"127.0.0.1:8080".parse().unwrap());
        assert_eq!(len as usize, mem::size_of::<libc::sockaddr_in>());
        let sin = unsafe { &*(&storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in>() };
        assert_eq!(sin.sin_family, libc::AF_INET as libc::sa_family_t);
        assert_eq!(u16::from_be(sin.sin_port), 8080);
        assert_eq!(sin.sin_addr.s_addr.to_ne_bytes(), [127, 0, 0, 1]);

        let (storage, len) = raw_socket_addr(&"[::1]:443".parse().unwrap());
        assert_eq!(len as usize, mem::size_of::<libc::sockaddr_in6>());
        let sin6 = unsafe { &*(&storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in6>() };
        assert_eq!(sin6.sin6_family, libc::AF_INET6 as libc::sa_family_t);
        assert_eq!(u16::from_be(sin6.sin6_port), 443);
        assert_eq!(sin6.sin6_addr.s6_addr[15], 1);
    }

    #[test]
    fn test_close_fails_outstanding_accept() {
        let port = group();
        let server = AsyncServerSocketChannel::open(Arc::clone(&port)).unwrap();
        server.bind("127.0.0.1:0").unwrap();

        let (tx, rx) = mpsc::channel();
        server.accept(move |r| tx.send(r.err()).unwrap()).unwrap();
        server.close();

        assert!(matches!(
            rx.recv_timeout(TIMEOUT).unwrap(),
            Some(ChannelError::Closed)
        ));
        assert!(!server.is_open());
        assert!(matches!(server.accept(|_| {}), Err(ChannelError::Closed)));
        port.shutdown();
    }

    #[test]
    fn test_unconnected_and_unbound_errors() {
        let port = group();

        let server = AsyncServerSocketChannel::open(Arc::clone(&port)).unwrap();
        assert!(matches!(server.accept(|_| {}), Err(ChannelError::NotYetBound)));
        assert!(matches!(server.local_addr(), Err(ChannelError::NotYetBound)));

        let socket = AsyncSocketChannel::open(Arc::clone(&port)).unwrap();
        assert!(matches!(
            socket.read(vec![0u8; 1], |_| {}),
            Err(ChannelError::NotYetConnected)
        ));
        assert!(matches!(socket.peer_addr(), Err(ChannelError::NotYetConnected)));

        port.shutdown();
    }

    #[test]
    fn test_open_on_shutdown_group() {
        let port = group();
        port.shutdown();
        assert!(matches!(
            AsyncSocketChannel::open(Arc::clone(&port)),
            Err(ChannelError::ShutdownChannelGroup)
        ));
        assert!(matches!(
            AsyncServerSocketChannel::open(port),
            Err(ChannelError::ShutdownChannelGroup)
        ));
    }

    #[test]
    fn test_selector_error_mapping() {
        assert!(matches!(
            ChannelError::from(SelectorError::Closed),
            ChannelError::Closed
        ));
        assert!(matches!(
            ChannelError::from(SelectorError::InvalidOps(2)),
            ChannelError::Selector(SelectorError::InvalidOps(2))
        ));
        assert!(ChannelError::IllegalChannelGroup
            .to_string()
            .contains("Illegal channel group"));
    }
}
