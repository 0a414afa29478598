//! Configuration for stream connections.

use std::time::Duration;

/// Tuning knobs for a [`Connection`](super::Connection).
#[derive(Clone, Copy, Debug)]
pub struct ConnectionConfig {
    /// Treat a full kernel send buffer as a broken peer.
    pub close_on_send_backpressure: bool,
    /// How long [`connect`](super::Connection::connect) waits for the
    /// handshake. `None` leaves the wait to the operating system.
    pub connect_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            close_on_send_backpressure: false,
            connect_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl ConnectionConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat a send that cannot make progress as a broken peer.
    ///
    /// When enabled, a write attempt that finds the kernel send buffer
    /// full closes the connection immediately and fires the broken
    /// callback with `graceful = false`. When disabled (the default), the
    /// bytes stay queued and are flushed once the socket becomes writable
    /// again.
    pub fn close_on_send_backpressure(mut self, enabled: bool) -> Self {
        self.close_on_send_backpressure = enabled;
        self
    }

    /// Set the handshake timeout for outbound connects.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Let the operating system decide when a connect attempt has failed.
    pub fn no_connect_timeout(mut self) -> Self {
        self.connect_timeout = None;
        self
    }
}
