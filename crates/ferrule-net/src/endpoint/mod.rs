//! Local transport endpoints.
//!
//! An [`Endpoint`] binds a local IPv4 address in one of four [`Mode`]s and
//! runs a dedicated worker thread. In [`Mode::Connection`] the worker
//! accepts TCP peers and hands each one to the new-connection callback as
//! a fresh [`Connection`]; in the datagram modes it delivers received
//! datagrams to the packet callback and flushes datagrams queued with
//! [`send_packet`](Endpoint::send_packet).
//!
//! ```no_run
//! use std::net::Ipv4Addr;
//! use ferrule_net::{Endpoint, EndpointConfig, Mode};
//!
//! let endpoint = Endpoint::new();
//! endpoint.open(
//!     EndpointConfig::new(Mode::Datagram).local_address(Ipv4Addr::LOCALHOST),
//!     |_connection| {},
//!     |sender, port, body| println!("{} bytes from {sender}:{port}", body.len()),
//! );
//! endpoint.send_packet(Ipv4Addr::LOCALHOST, 9000, b"ping".to_vec());
//! ```

mod config;

pub use config::{EndpointConfig, Mode};

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ferrule_core::{DiagnosticsBus, level};
use parking_lot::Mutex;
use socket2::{Domain, Socket, Type};
use tokio::io::Interest;
use tokio::sync::Notify;

use crate::connection::Connection;
use crate::interfaces::interface_addresses;

/// The most bytes read from the socket in one pass; larger datagrams are
/// truncated by the kernel.
const MAXIMUM_READ_SIZE: usize = 65536;

/// Listen backlog for connection-mode endpoints.
const LISTEN_BACKLOG: i32 = 128;

/// Called from the worker with each accepted peer. The callee is expected
/// to retain the connection and call [`Connection::process`] on it.
pub type NewConnectionCallback = Arc<dyn Fn(Connection) + Send + Sync>;

/// Called from the worker with each received datagram: the sender's
/// address, the sender's port, and the payload.
pub type PacketReceivedCallback = Arc<dyn Fn(Ipv4Addr, u16, Vec<u8>) + Send + Sync>;

/// A datagram queued for transmission.
struct Packet {
    address: Ipv4Addr,
    port: u16,
    body: Vec<u8>,
}

struct EndpointState {
    mode: Mode,
    local_address: Ipv4Addr,
    port: u16,
    open: bool,
    outbound: VecDeque<Packet>,
    new_connection: Option<NewConnectionCallback>,
    packet_received: Option<PacketReceivedCallback>,
}

impl EndpointState {
    fn new() -> Self {
        Self {
            mode: Mode::Datagram,
            local_address: Ipv4Addr::UNSPECIFIED,
            port: 0,
            open: false,
            outbound: VecDeque::new(),
            new_connection: None,
            packet_received: None,
        }
    }
}

struct EndpointInner {
    state: Mutex<EndpointState>,
    /// Tells the worker to exit at its next pass.
    stop: AtomicBool,
    /// Wakes the worker when state changes (queued packets, close).
    wake: Notify,
    diagnostics: DiagnosticsBus,
}

/// One of the two sockets a worker can be handed.
enum WorkerSocket {
    Listener(std::net::TcpListener),
    Datagram(std::net::UdpSocket),
}

/// A bound local transport address plus mode-specific behavior.
///
/// See the [module documentation](self) for an overview. The endpoint is
/// exclusively owned by its creator; dropping it closes it.
pub struct Endpoint {
    inner: Arc<EndpointInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Endpoint {
    /// Create an idle endpoint.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EndpointInner {
                state: Mutex::new(EndpointState::new()),
                stop: AtomicBool::new(false),
                wake: Notify::new(),
                diagnostics: DiagnosticsBus::new("endpoint"),
            }),
            worker: Mutex::new(None),
        }
    }

    /// The bus this endpoint publishes its diagnostics on.
    pub fn diagnostics(&self) -> &DiagnosticsBus {
        &self.inner.diagnostics
    }

    /// Whether the endpoint is currently open.
    pub fn is_open(&self) -> bool {
        self.inner.state.lock().open
    }

    /// The local address the endpoint was opened with.
    pub fn bound_address(&self) -> Ipv4Addr {
        self.inner.state.lock().local_address
    }

    /// The port actually bound, even when `0` was requested.
    pub fn bound_port(&self) -> u16 {
        self.inner.state.lock().port
    }

    /// Bind the local address and start the worker.
    ///
    /// `new_connection` receives accepted peers in [`Mode::Connection`];
    /// `packet_received` receives datagrams in [`Mode::Datagram`] and
    /// [`Mode::MulticastReceive`]. Both run on the worker thread with no
    /// internal lock held. Any previously open state is closed first.
    ///
    /// Returns `false` when any setup step fails; the failure is published
    /// at error level and everything acquired so far is released.
    pub fn open<N, P>(&self, config: EndpointConfig, new_connection: N, packet_received: P) -> bool
    where
        N: Fn(Connection) + Send + Sync + 'static,
        P: Fn(Ipv4Addr, u16, Vec<u8>) + Send + Sync + 'static,
    {
        self.close();
        let Some((socket, port)) = self.configure_socket(&config) else {
            return false;
        };
        {
            let mut state = self.inner.state.lock();
            state.mode = config.mode;
            state.local_address = config.local_address;
            state.port = port;
            state.open = true;
            state.outbound.clear();
            state.new_connection = Some(Arc::new(new_connection));
            state.packet_received = Some(Arc::new(packet_received));
        }
        self.inner.stop.store(false, Ordering::SeqCst);
        self.inner
            .diagnostics
            .publish(0, format!("endpoint opened for port {port}"));
        let worker_socket = if config.mode == Mode::Connection {
            WorkerSocket::Listener(socket.into())
        } else {
            WorkerSocket::Datagram(socket.into())
        };
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("ferrule-endpoint".into())
            .spawn(move || run_worker(inner, worker_socket));
        match spawned {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                true
            }
            Err(e) => {
                self.inner.state.lock().open = false;
                self.inner
                    .diagnostics
                    .publish(level::ERROR, format!("error spawning worker: {e}"));
                false
            }
        }
    }

    /// Create and configure the socket for `config`, returning it along
    /// with the port actually bound.
    fn configure_socket(&self, config: &EndpointConfig) -> Option<(Socket, u16)> {
        let socket_type = if config.mode == Mode::Connection {
            Type::STREAM
        } else {
            Type::DGRAM
        };
        let socket = match Socket::new(Domain::IPV4, socket_type, None) {
            Ok(socket) => socket,
            Err(e) => {
                self.inner
                    .diagnostics
                    .publish(level::ERROR, format!("error creating socket: {e}"));
                return None;
            }
        };
        let mut port = config.port;
        if config.mode == Mode::MulticastSend {
            if let Err(e) = socket.set_multicast_if_v4(&config.local_address) {
                self.inner.diagnostics.publish(
                    level::ERROR,
                    format!("error setting multicast interface: {e}"),
                );
                return None;
            }
        } else {
            let bind_address = if config.mode == Mode::MulticastReceive {
                if let Err(e) = socket.set_reuse_address(true) {
                    self.inner.diagnostics.publish(
                        level::ERROR,
                        format!("error enabling address reuse: {e}"),
                    );
                    return None;
                }
                Ipv4Addr::UNSPECIFIED
            } else {
                config.local_address
            };
            let bind_target = SocketAddr::from(SocketAddrV4::new(bind_address, config.port));
            if let Err(e) = socket.bind(&bind_target.into()) {
                self.inner
                    .diagnostics
                    .publish(level::ERROR, format!("error in bind: {e}"));
                return None;
            }
            if config.mode == Mode::MulticastReceive {
                for interface in interface_addresses() {
                    if let Err(e) = socket.join_multicast_v4(&config.group_address, &interface) {
                        self.inner.diagnostics.publish(
                            level::ERROR,
                            format!(
                                "error joining group {} on interface {interface}: {e}",
                                config.group_address
                            ),
                        );
                        return None;
                    }
                }
            } else {
                match socket.local_addr().ok().and_then(|address| address.as_socket()) {
                    Some(local) => port = local.port(),
                    None => {
                        self.inner
                            .diagnostics
                            .publish(level::ERROR, "error reading bound address");
                        return None;
                    }
                }
            }
            if config.mode == Mode::Connection {
                if let Err(e) = socket.listen(LISTEN_BACKLOG) {
                    self.inner
                        .diagnostics
                        .publish(level::ERROR, format!("error in listen: {e}"));
                    return None;
                }
            }
        }
        if let Err(e) = socket.set_nonblocking(true) {
            self.inner
                .diagnostics
                .publish(level::ERROR, format!("error making socket non-blocking: {e}"));
            return None;
        }
        Some((socket, port))
    }

    /// Queue a datagram for transmission and wake the worker.
    ///
    /// Meaningful in [`Mode::Datagram`] and [`Mode::MulticastSend`]; other
    /// modes never flush the queue.
    pub fn send_packet(&self, address: Ipv4Addr, port: u16, body: impl Into<Vec<u8>>) {
        self.inner.state.lock().outbound.push_back(Packet {
            address,
            port,
            body: body.into(),
        });
        self.inner.wake.notify_one();
    }

    /// Stop the worker and release the socket. Idempotent.
    ///
    /// Once this returns (from any thread other than the worker itself),
    /// no further callbacks are delivered.
    pub fn close(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                // Closing from one of our own callbacks; the worker sees
                // the stop flag and unwinds on its own.
            } else {
                let _ = handle.join();
            }
        }
        let (was_open, port) = {
            let mut state = self.inner.state.lock();
            let was_open = state.open;
            state.open = false;
            state.outbound.clear();
            state.new_connection = None;
            state.packet_received = None;
            (was_open, state.port)
        };
        if was_open {
            self.inner
                .diagnostics
                .publish(0, format!("closing endpoint for port {port}"));
        }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Endpoint")
            .field("mode", &state.mode)
            .field("open", &state.open)
            .field("port", &state.port)
            .finish()
    }
}

/// Worker thread entry: a current-thread runtime drives the mode's loop.
fn run_worker(inner: Arc<EndpointInner>, socket: WorkerSocket) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            inner.state.lock().open = false;
            inner
                .diagnostics
                .publish(level::ERROR, format!("error creating worker runtime: {e}"));
            return;
        }
    };
    runtime.block_on(async {
        match socket {
            WorkerSocket::Listener(listener) => accept_loop(&inner, listener).await,
            WorkerSocket::Datagram(socket) => datagram_loop(&inner, socket).await,
        }
    });
    inner.state.lock().open = false;
    tracing::trace!(target: "ferrule_net::endpoint", "worker exiting");
}

async fn accept_loop(inner: &Arc<EndpointInner>, listener: std::net::TcpListener) {
    let listener = match tokio::net::TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            inner
                .diagnostics
                .publish(level::ERROR, format!("error registering socket: {e}"));
            return;
        }
    };
    loop {
        if inner.stop.load(Ordering::SeqCst) {
            break;
        }
        tokio::select! {
            _ = inner.wake.notified() => {}
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => accept_connection(inner, stream, peer),
                    Err(e) => {
                        // Transient; keep listening.
                        inner
                            .diagnostics
                            .publish(level::WARNING, format!("error in accept: {e}"));
                    }
                }
            }
        }
    }
}

/// Wrap an accepted socket in a [`Connection`] and hand it to the owner.
fn accept_connection(inner: &EndpointInner, stream: tokio::net::TcpStream, peer: SocketAddr) {
    // Abrupt closes of the accepted session should reset the peer.
    let _ = stream.set_linger(Some(Duration::ZERO));
    let bound = match stream.local_addr() {
        Ok(SocketAddr::V4(address)) => address,
        _ => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
    };
    let SocketAddr::V4(peer) = peer else {
        return;
    };
    let stream = match stream.into_std() {
        Ok(stream) => stream,
        Err(e) => {
            inner
                .diagnostics
                .publish(level::WARNING, format!("error adopting accepted socket: {e}"));
            return;
        }
    };
    let connection = Connection::from_accepted(stream, bound, peer);
    let callback = inner.state.lock().new_connection.clone();
    if let Some(callback) = callback {
        callback(connection);
    }
}

async fn datagram_loop(inner: &Arc<EndpointInner>, socket: std::net::UdpSocket) {
    let socket = match tokio::net::UdpSocket::from_std(socket) {
        Ok(socket) => socket,
        Err(e) => {
            inner
                .diagnostics
                .publish(level::ERROR, format!("error registering socket: {e}"));
            return;
        }
    };
    let mode = inner.state.lock().mode;
    let can_receive = matches!(mode, Mode::Datagram | Mode::MulticastReceive);
    let can_send = matches!(mode, Mode::Datagram | Mode::MulticastSend);
    let mut buffer = vec![0u8; MAXIMUM_READ_SIZE];
    let mut wait = true;
    loop {
        if inner.stop.load(Ordering::SeqCst) {
            break;
        }
        if wait {
            let interest = {
                let state = inner.state.lock();
                let mut interest: Option<Interest> = None;
                if can_receive {
                    interest = Some(Interest::READABLE);
                }
                if can_send && !state.outbound.is_empty() {
                    interest = Some(match interest {
                        Some(interest) => interest | Interest::WRITABLE,
                        None => Interest::WRITABLE,
                    });
                }
                interest
            };
            match interest {
                Some(interest) => {
                    tokio::select! {
                        _ = inner.wake.notified() => {}
                        _ = socket.ready(interest) => {}
                    }
                }
                None => inner.wake.notified().await,
            }
            if inner.stop.load(Ordering::SeqCst) {
                break;
            }
        }
        wait = true;

        if can_receive {
            match socket.try_recv_from(&mut buffer) {
                Ok((received, SocketAddr::V4(peer))) => {
                    let callback = inner.state.lock().packet_received.clone();
                    if let Some(callback) = callback {
                        callback(*peer.ip(), peer.port(), buffer[..received].to_vec());
                    }
                }
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => {
                    inner
                        .diagnostics
                        .publish(level::ERROR, format!("error in recvfrom: {e}"));
                    break;
                }
            }
        }

        // Flush at most one queued datagram per pass.
        if can_send {
            let head = {
                let state = inner.state.lock();
                state.outbound.front().map(|packet| {
                    (
                        SocketAddr::from(SocketAddrV4::new(packet.address, packet.port)),
                        packet.body.clone(),
                    )
                })
            };
            if let Some((target, body)) = head {
                match socket.try_send_to(&body, target) {
                    Ok(sent) => {
                        if sent != body.len() {
                            inner.diagnostics.publish(
                                level::WARNING,
                                format!("datagram truncated ({sent} of {} bytes)", body.len()),
                            );
                        }
                        let mut state = inner.state.lock();
                        state.outbound.pop_front();
                        if !state.outbound.is_empty() {
                            wait = false;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                    Err(e) => {
                        inner
                            .diagnostics
                            .publish(level::ERROR, format!("error in sendto: {e}"));
                        break;
                    }
                }
            }
        }
    }
}
