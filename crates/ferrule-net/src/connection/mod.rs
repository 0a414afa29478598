//! Full-duplex byte-stream sessions with a remote peer.
//!
//! A [`Connection`] owns one established TCP session. It is either dialed
//! with [`connect`](Connection::connect) or created by an
//! [`Endpoint`](crate::Endpoint) accepting a peer. Calling
//! [`process`](Connection::process) starts a dedicated worker thread that
//! multiplexes a wake-up channel with socket readiness; from then on,
//! inbound chunks arrive on the message callback, outbound bytes queue in
//! a [`ByteQueue`] and are flushed by the worker, and the end of the
//! session is announced exactly once through the broken callback.
//!
//! # Closing
//!
//! [`close(false)`](Connection::close) tears the session down immediately;
//! because the socket carries a zero-linger option, the peer observes a
//! reset. [`close(true)`](Connection::close) drains everything queued,
//! half-closes the send side, waits for the peer's own close, and only
//! then releases the socket, so the peer is guaranteed to see every byte
//! before the end-of-stream marker.
//!
//! # Sharing
//!
//! `Connection` is a cheap clonable handle; the worker keeps its own
//! reference to the shared state alive until its loop exits, so a callback
//! may drop the last outside handle (or call `close`) without pulling the
//! rug out from under the worker.

mod config;

pub use config::ConnectionConfig;

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ferrule_core::{DiagnosticsBus, level};
use parking_lot::Mutex;
use socket2::{Domain, Socket, Type};
use tokio::io::{AsyncWriteExt, Interest};
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::queue::ByteQueue;

/// The most bytes read from the socket in one pass.
const MAXIMUM_READ_SIZE: usize = 65536;

/// The most bytes written to the socket in one pass.
const MAXIMUM_WRITE_SIZE: usize = 65536;

/// Called with each chunk of bytes read from the peer, in arrival order.
/// Chunks are whatever the socket yielded, not framed messages.
pub type MessageReceivedCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Called at most once when the session ends. The argument is `true` when
/// the peer closed its side gracefully, `false` for every other ending.
pub type BrokenCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// State shared between the caller-facing handle and the worker.
struct ConnectionState {
    /// A connected socket that the worker has not yet taken over.
    pending_socket: Option<std::net::TcpStream>,
    /// Whether the session's socket is currently valid.
    connected: bool,
    /// The peer has closed its sending side; no further reads.
    peer_closed: bool,
    /// A graceful local close is in progress.
    closing: bool,
    /// Our send side has been shut down as part of a graceful close.
    shutdown_sent: bool,
    /// Latch ensuring the broken callback fires at most once.
    broken_fired: bool,
    outbound: ByteQueue,
    message_received: Option<MessageReceivedCallback>,
    broken: Option<BrokenCallback>,
    bound_address: Ipv4Addr,
    bound_port: u16,
    peer_address: Ipv4Addr,
    peer_port: u16,
}

impl ConnectionState {
    fn new() -> Self {
        Self {
            pending_socket: None,
            connected: false,
            peer_closed: false,
            closing: false,
            shutdown_sent: false,
            broken_fired: false,
            outbound: ByteQueue::new(),
            message_received: None,
            broken: None,
            bound_address: Ipv4Addr::UNSPECIFIED,
            bound_port: 0,
            peer_address: Ipv4Addr::UNSPECIFIED,
            peer_port: 0,
        }
    }

    /// Install a fresh session over `socket`, resetting per-session flags.
    fn begin_session(
        &mut self,
        socket: std::net::TcpStream,
        bound: SocketAddrV4,
        peer: SocketAddrV4,
    ) {
        self.pending_socket = Some(socket);
        self.connected = true;
        self.peer_closed = false;
        self.closing = false;
        self.shutdown_sent = false;
        self.broken_fired = false;
        self.outbound = ByteQueue::new();
        self.bound_address = *bound.ip();
        self.bound_port = bound.port();
        self.peer_address = *peer.ip();
        self.peer_port = peer.port();
    }

    /// The broken callback, if it exists and has not fired yet. Taking it
    /// sets the latch; the caller invokes it with the state lock released.
    fn take_broken(&mut self) -> Option<BrokenCallback> {
        if self.broken_fired {
            return None;
        }
        let broken = self.broken.clone();
        if broken.is_some() {
            self.broken_fired = true;
        }
        broken
    }
}

struct ConnectionInner {
    state: Mutex<ConnectionState>,
    /// Tells the worker to exit at its next pass.
    stop: AtomicBool,
    /// Wakes the worker when state changes (queued data, close requests).
    wake: Notify,
    worker: Mutex<Option<JoinHandle<()>>>,
    config: ConnectionConfig,
    diagnostics: DiagnosticsBus,
}

/// A full-duplex byte-stream session with a remote peer.
///
/// See the [module documentation](self) for an overview.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Create an idle connection with default configuration.
    pub fn new() -> Self {
        Self::with_config(ConnectionConfig::default())
    }

    /// Create an idle connection with the given configuration.
    pub fn with_config(config: ConnectionConfig) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                state: Mutex::new(ConnectionState::new()),
                stop: AtomicBool::new(false),
                wake: Notify::new(),
                worker: Mutex::new(None),
                config,
                diagnostics: DiagnosticsBus::new("connection"),
            }),
        }
    }

    /// Wrap a socket the endpoint accept path already established.
    pub(crate) fn from_accepted(
        socket: std::net::TcpStream,
        bound: SocketAddrV4,
        peer: SocketAddrV4,
    ) -> Self {
        let connection = Self::new();
        connection.inner.state.lock().begin_session(socket, bound, peer);
        connection
    }

    /// The bus this connection publishes its diagnostics on.
    pub fn diagnostics(&self) -> &DiagnosticsBus {
        &self.inner.diagnostics
    }

    /// Whether a session with a peer is currently established.
    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().connected
    }

    /// The local IPv4 address of the session, once established.
    pub fn bound_address(&self) -> Ipv4Addr {
        self.inner.state.lock().bound_address
    }

    /// The local port of the session, once established.
    pub fn bound_port(&self) -> u16 {
        self.inner.state.lock().bound_port
    }

    /// The peer's IPv4 address, once established.
    pub fn peer_address(&self) -> Ipv4Addr {
        self.inner.state.lock().peer_address
    }

    /// The peer's port, once established.
    pub fn peer_port(&self) -> u16 {
        self.inner.state.lock().peer_port
    }

    /// Establish a session with the given peer.
    ///
    /// Any previous session is torn down first, as if by `close(false)`.
    /// On success the local address and port are captured and `true` is
    /// returned; on failure an error-level diagnostic is published and the
    /// connection is left idle. The handshake wait is bounded by
    /// [`ConnectionConfig::connect_timeout`].
    ///
    /// Call [`process`](Self::process) afterwards to start exchanging
    /// messages.
    pub fn connect(&self, peer_address: Ipv4Addr, peer_port: u16) -> bool {
        if let Some(broken) = self.shut_down_immediately() {
            broken(false);
        }
        let socket = match Socket::new(Domain::IPV4, Type::STREAM, None) {
            Ok(socket) => socket,
            Err(e) => {
                self.inner
                    .diagnostics
                    .publish(level::ERROR, format!("error creating socket: {e}"));
                return false;
            }
        };
        // Reset-on-close has to be in place before the handshake starts.
        let _ = socket.set_linger(Some(Duration::ZERO));
        let ephemeral = SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
        if let Err(e) = socket.bind(&ephemeral.into()) {
            self.inner
                .diagnostics
                .publish(level::ERROR, format!("error in bind: {e}"));
            return false;
        }
        let target = SocketAddr::from(SocketAddrV4::new(peer_address, peer_port));
        let connected = match self.inner.config.connect_timeout {
            Some(timeout) => socket.connect_timeout(&target.into(), timeout),
            None => socket.connect(&target.into()),
        };
        if let Err(e) = connected {
            self.inner
                .diagnostics
                .publish(level::ERROR, format!("error in connect: {e}"));
            return false;
        }
        let bound = match socket.local_addr().ok().and_then(|address| address.as_socket()) {
            Some(SocketAddr::V4(address)) => address,
            _ => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
        };
        let peer = SocketAddrV4::new(peer_address, peer_port);
        self.inner.state.lock().begin_session(socket.into(), bound, peer);
        true
    }

    /// Start the worker that exchanges messages with the peer.
    ///
    /// `message_received` is called with each inbound chunk, in order;
    /// `broken` is called at most once when the session ends, with `true`
    /// for a graceful peer close. Both callbacks run on the worker thread
    /// with no internal lock held, so they may send, close, or drop the
    /// connection freely.
    ///
    /// Returns `false` (with an error diagnostic) when there is no
    /// established session to process. Calling it again while the worker
    /// is already attached publishes a warning and returns `true`.
    pub fn process<M, B>(&self, message_received: M, broken: B) -> bool
    where
        M: Fn(Vec<u8>) + Send + Sync + 'static,
        B: Fn(bool) + Send + Sync + 'static,
    {
        if !self.inner.state.lock().connected {
            self.inner.diagnostics.publish(level::ERROR, "not connected");
            return false;
        }
        let mut worker = self.inner.worker.lock();
        if worker.is_some() {
            drop(worker);
            self.inner
                .diagnostics
                .publish(level::WARNING, "already processing");
            return true;
        }
        let socket = {
            let mut state = self.inner.state.lock();
            state.message_received = Some(Arc::new(message_received));
            state.broken = Some(Arc::new(broken));
            state.pending_socket.take()
        };
        let Some(socket) = socket else {
            drop(worker);
            self.inner.diagnostics.publish(level::ERROR, "not connected");
            return false;
        };
        if let Err(e) = socket.set_nonblocking(true) {
            drop(worker);
            self.inner.state.lock().connected = false;
            self.inner
                .diagnostics
                .publish(level::ERROR, format!("error preparing socket: {e}"));
            return false;
        }
        self.inner.stop.store(false, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("ferrule-connection".into())
            .spawn(move || run_worker(inner, socket));
        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                true
            }
            Err(e) => {
                drop(worker);
                self.inner.state.lock().connected = false;
                self.inner
                    .diagnostics
                    .publish(level::ERROR, format!("error spawning worker: {e}"));
                false
            }
        }
    }

    /// Queue bytes for transmission and wake the worker.
    ///
    /// Bytes are transmitted in enqueue order. This never blocks; if the
    /// session is gone the bytes simply never leave the queue.
    pub fn send_message(&self, message: impl Into<Vec<u8>>) {
        self.inner.state.lock().outbound.enqueue(message);
        self.inner.wake.notify_one();
    }

    /// End the session.
    ///
    /// With `clean == false` the socket is released immediately and the
    /// broken callback fires with `graceful = false` if the session was up
    /// and the callback has not fired before. With `clean == true` the
    /// worker first finishes sending everything queued, then half-closes
    /// the send side and waits for the peer's own close before releasing
    /// the socket and firing the broken callback.
    ///
    /// Safe to call from inside this connection's own callbacks; the
    /// worker is never joined from its own thread.
    pub fn close(&self, clean: bool) {
        if clean {
            {
                let mut state = self.inner.state.lock();
                if !state.connected {
                    return;
                }
                state.closing = true;
            }
            self.inner.diagnostics.publish(1, "closing connection");
            self.inner.wake.notify_one();
        } else if let Some(broken) = self.shut_down_immediately() {
            broken(false);
        }
    }

    /// Stop the worker and release the socket. Returns the broken callback
    /// to invoke (outside all locks) if the session was up and the
    /// callback has not fired yet.
    fn shut_down_immediately(&self) -> Option<BrokenCallback> {
        let was_connected = self.inner.state.lock().connected;
        self.inner.stop.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
        let handle = self.inner.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                // Called from one of our own callbacks; the worker sees the
                // stop flag and unwinds on its own. Joining here would be
                // joining ourselves.
            } else {
                let _ = handle.join();
            }
        }
        let broken = {
            let mut state = self.inner.state.lock();
            state.pending_socket = None;
            state.connected = false;
            if was_connected { state.take_broken() } else { None }
        };
        if was_connected {
            self.inner.diagnostics.publish(1, "closed connection");
        }
        broken
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Connection")
            .field("connected", &state.connected)
            .field("bound_port", &state.bound_port)
            .field("peer_address", &state.peer_address)
            .field("peer_port", &state.peer_port)
            .finish()
    }
}

/// Worker thread entry: a current-thread runtime drives the session loop.
fn run_worker(inner: Arc<ConnectionInner>, socket: std::net::TcpStream) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            inner.state.lock().connected = false;
            inner
                .diagnostics
                .publish(level::ERROR, format!("error creating worker runtime: {e}"));
            return;
        }
    };
    runtime.block_on(session_loop(&inner, socket));
}

/// Mark the session down and hand back the broken callback to fire.
fn release_session(inner: &ConnectionInner) -> Option<BrokenCallback> {
    let mut state = inner.state.lock();
    state.connected = false;
    state.take_broken()
}

async fn session_loop(inner: &Arc<ConnectionInner>, socket: std::net::TcpStream) {
    let mut stream = match TcpStream::from_std(socket) {
        Ok(stream) => stream,
        Err(e) => {
            let broken = release_session(inner);
            inner
                .diagnostics
                .publish(level::ERROR, format!("error registering socket: {e}"));
            if let Some(broken) = broken {
                broken(false);
            }
            return;
        }
    };
    let close_on_backpressure = inner.config.close_on_send_backpressure;
    let mut buffer = vec![0u8; MAXIMUM_READ_SIZE];
    let mut wait = true;
    loop {
        if inner.stop.load(Ordering::SeqCst) || !inner.state.lock().connected {
            break;
        }
        if wait {
            // Watch the socket only for what the session can act on right
            // now; with nothing to read or write, only a state change can
            // make progress.
            let interest = {
                let state = inner.state.lock();
                let mut interest: Option<Interest> = None;
                if !state.peer_closed {
                    interest = Some(Interest::READABLE);
                }
                if state.outbound.bytes_queued() > 0 {
                    interest = Some(match interest {
                        Some(interest) => interest | Interest::WRITABLE,
                        None => Interest::WRITABLE,
                    });
                }
                interest
            };
            tracing::trace!(target: "ferrule_net::connection", "worker going to sleep");
            match interest {
                Some(interest) => {
                    tokio::select! {
                        _ = inner.wake.notified() => {}
                        _ = stream.ready(interest) => {}
                    }
                }
                None => inner.wake.notified().await,
            }
            tracing::trace!(target: "ferrule_net::connection", "worker woke up");
            if inner.stop.load(Ordering::SeqCst) {
                break;
            }
        }
        wait = true;

        // Read whatever the peer has sent.
        if !inner.state.lock().peer_closed {
            match stream.try_read(&mut buffer) {
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(_) => {
                    let broken = release_session(inner);
                    inner
                        .diagnostics
                        .publish(1, "connection closed abruptly by the peer");
                    if let Some(broken) = broken {
                        broken(false);
                    }
                    break;
                }
                Ok(0) => {
                    let broken = {
                        let mut state = inner.state.lock();
                        state.peer_closed = true;
                        // During a local graceful close the peer's close is
                        // the expected final step, announced once the
                        // socket is released below.
                        if state.closing { None } else { state.take_broken() }
                    };
                    inner
                        .diagnostics
                        .publish(1, "connection closed gracefully by the peer");
                    if let Some(broken) = broken {
                        broken(true);
                    }
                }
                Ok(received) => {
                    wait = false;
                    let callback = inner.state.lock().message_received.clone();
                    if let Some(callback) = callback {
                        callback(buffer[..received].to_vec());
                    }
                }
            }
        }

        // A callback may have torn the session down.
        if inner.stop.load(Ordering::SeqCst) || !inner.state.lock().connected {
            break;
        }

        // Flush queued outbound bytes.
        let chunk = {
            let mut state = inner.state.lock();
            if state.outbound.bytes_queued() > 0 {
                state.outbound.peek(MAXIMUM_WRITE_SIZE)
            } else {
                Vec::new()
            }
        };
        if !chunk.is_empty() {
            match stream.try_write(&chunk) {
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if close_on_backpressure {
                        let broken = release_session(inner);
                        inner
                            .diagnostics
                            .publish(1, "send buffer full, dropping connection");
                        if let Some(broken) = broken {
                            broken(false);
                        }
                        break;
                    }
                    // The bytes stay queued; write readiness wakes us when
                    // the kernel can take more.
                }
                Err(_) | Ok(0) => {
                    let broken = release_session(inner);
                    inner
                        .diagnostics
                        .publish(1, "connection closed abruptly by the peer");
                    if let Some(broken) = broken {
                        broken(false);
                    }
                    break;
                }
                Ok(sent) => {
                    let mut state = inner.state.lock();
                    state.outbound.discard(sent);
                    if sent == chunk.len() && state.outbound.bytes_queued() > 0 {
                        wait = false;
                    }
                }
            }
        }

        // Graceful close: once drained, half-close our side, then wait for
        // the peer before releasing the socket.
        let (send_shutdown, release) = {
            let state = inner.state.lock();
            if state.closing && state.outbound.bytes_queued() == 0 {
                (!state.shutdown_sent, state.peer_closed)
            } else {
                (false, false)
            }
        };
        if send_shutdown {
            let _ = stream.shutdown().await;
            inner.state.lock().shutdown_sent = true;
            tracing::trace!(
                target: "ferrule_net::connection",
                "outbound drained, send side closed"
            );
        }
        if release {
            let broken = release_session(inner);
            inner.diagnostics.publish(1, "closed connection");
            if let Some(broken) = broken {
                broken(false);
            }
            break;
        }
    }
    {
        let mut state = inner.state.lock();
        state.connected = false;
        state.pending_socket = None;
    }
    tracing::trace!(target: "ferrule_net::connection", "worker exiting");
}
