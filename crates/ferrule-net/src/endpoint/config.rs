//! Configuration for local transport endpoints.

use std::net::Ipv4Addr;

/// The set of behaviors an [`Endpoint`](super::Endpoint) is opened with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Send and receive unicast/broadcast UDP datagrams.
    Datagram,
    /// Listen for TCP peers and hand out accepted connections.
    Connection,
    /// Send UDP datagrams to a multicast group.
    MulticastSend,
    /// Receive UDP datagrams addressed to a multicast group.
    MulticastReceive,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Datagram => write!(f, "Datagram"),
            Self::Connection => write!(f, "Connection"),
            Self::MulticastSend => write!(f, "MulticastSend"),
            Self::MulticastReceive => write!(f, "MulticastReceive"),
        }
    }
}

/// Configuration for opening an [`Endpoint`](super::Endpoint).
#[derive(Clone, Debug)]
pub struct EndpointConfig {
    /// What the endpoint does once open.
    pub mode: Mode,
    /// The local interface address to bind or send through.
    /// `0.0.0.0` means all interfaces.
    pub local_address: Ipv4Addr,
    /// The multicast group, for the multicast modes.
    pub group_address: Ipv4Addr,
    /// The port to bind. `0` requests an ephemeral port; the port actually
    /// bound is reported by [`bound_port`](super::Endpoint::bound_port).
    pub port: u16,
}

impl EndpointConfig {
    /// Create a configuration for the given mode, bound to all interfaces
    /// on an ephemeral port.
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            local_address: Ipv4Addr::UNSPECIFIED,
            group_address: Ipv4Addr::UNSPECIFIED,
            port: 0,
        }
    }

    /// Set the local interface address.
    pub fn local_address(mut self, address: Ipv4Addr) -> Self {
        self.local_address = address;
        self
    }

    /// Set the multicast group address.
    pub fn group_address(mut self, address: Ipv4Addr) -> Self {
        self.group_address = address;
        self
    }

    /// Set the port to bind.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}
