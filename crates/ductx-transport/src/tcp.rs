//! TCP transport for the radio control plane.
//!
//! This module provides [`TcpTransport`], which implements the blocking
//! [`Transport`] trait over a `std::net::TcpStream`. The radio accepts one
//! line-oriented ASCII command connection on its control port.
//!
//! # Example
//!
//! ```no_run
//! use ductx_transport::TcpTransport;
//! use ductx_core::transport::Transport;
//! use std::time::Duration;
//!
//! # fn example() -> ductx_core::Result<()> {
//! let mut transport = TcpTransport::connect("192.168.0.10:8617")?;
//! transport.send(b"UTC?\n")?;
//!
//! let mut buf = [0u8; 256];
//! let n = transport.receive(&mut buf, Duration::from_secs(2))?;
//! # Ok(())
//! # }
//! ```

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use ductx_core::error::{Error, Result};
use ductx_core::transport::Transport;

/// Default connection timeout (5 seconds).
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Shortest read timeout handed to the socket; `set_read_timeout` rejects zero.
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// TCP transport for radio control.
///
/// The connection is established eagerly via [`connect`](TcpTransport::connect)
/// or [`connect_with_timeout`](TcpTransport::connect_with_timeout).
#[derive(Debug)]
pub struct TcpTransport {
    /// The underlying TCP stream, `None` after `close()` is called.
    stream: Option<TcpStream>,
    /// The address string for logging.
    addr: String,
}

impl TcpTransport {
    /// Connect to a TCP endpoint using the default timeout.
    ///
    /// The `addr` parameter should be a `host:port` string, e.g.,
    /// `"192.168.0.10:8617"`.
    pub fn connect(addr: &str) -> Result<Self> {
        Self::connect_with_timeout(addr, DEFAULT_CONNECT_TIMEOUT)
    }

    /// Connect to a TCP endpoint with a specified timeout.
    ///
    /// Every address the host name resolves to is tried in turn; the error
    /// from the last attempt is returned if none succeed.
    pub fn connect_with_timeout(addr: &str, timeout: Duration) -> Result<Self> {
        tracing::debug!(
            addr = %addr,
            timeout_ms = timeout.as_millis(),
            "Connecting to TCP endpoint"
        );

        let candidates: Vec<SocketAddr> = addr
            .to_socket_addrs()
            .map_err(|e| Error::Transport(format!("cannot resolve {}: {}", addr, e)))?
            .collect();

        let mut last_err = Error::Transport(format!("no addresses for {}", addr));
        for sock_addr in candidates {
            match TcpStream::connect_timeout(&sock_addr, timeout) {
                Ok(stream) => {
                    // Commands are small and latency-sensitive.
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::warn!(
                            addr = %addr,
                            error = %e,
                            "Failed to set TCP_NODELAY (continuing anyway)"
                        );
                    }
                    tracing::info!(addr = %addr, "TCP connection established");
                    return Ok(Self {
                        stream: Some(stream),
                        addr: addr.to_string(),
                    });
                }
                Err(e) => {
                    tracing::error!(addr = %sock_addr, error = %e, "TCP connection failed");
                    last_err = map_connect_error(e, addr);
                }
            }
        }
        Err(last_err)
    }

    /// Wrap an existing `TcpStream` as a `TcpTransport`.
    ///
    /// Useful when the connection was accepted from a listener in tests.
    pub fn from_stream(stream: TcpStream, addr: String) -> Self {
        tracing::debug!(addr = %addr, "Wrapping existing TCP stream");
        Self {
            stream: Some(stream),
            addr,
        }
    }

    /// Get the address string this transport was connected to.
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;

        tracing::trace!(addr = %self.addr, bytes = data.len(), "Sending data");

        stream.write_all(data).map_err(|e| {
            tracing::error!(addr = %self.addr, error = %e, "Failed to send data");
            map_io_error(e)
        })?;
        stream.flush().map_err(map_io_error)?;

        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;

        stream
            .set_read_timeout(Some(timeout.max(MIN_READ_TIMEOUT)))
            .map_err(Error::Io)?;

        match stream.read(buf) {
            Ok(0) => {
                // 0 bytes read means the peer has closed the connection.
                tracing::warn!(addr = %self.addr, "Peer closed connection (0 bytes read)");
                Err(Error::ConnectionLost)
            }
            Ok(n) => {
                tracing::trace!(addr = %self.addr, bytes = n, "Received data");
                Ok(n)
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                Err(Error::Timeout)
            }
            Err(e) => {
                tracing::error!(addr = %self.addr, error = %e, "Failed to receive data");
                Err(map_io_error(e))
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            tracing::debug!(addr = %self.addr, "Closing TCP connection");
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                tracing::warn!(
                    addr = %self.addr,
                    error = %e,
                    "Failed to shutdown TCP stream (continuing anyway)"
                );
            }
            tracing::info!(addr = %self.addr, "TCP connection closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

/// Map a connection-time I/O error to the appropriate [`Error`] variant.
fn map_connect_error(e: std::io::Error, addr: &str) -> Error {
    match e.kind() {
        std::io::ErrorKind::ConnectionRefused => {
            Error::Transport(format!("connection refused: {}", addr))
        }
        std::io::ErrorKind::TimedOut => Error::Timeout,
        _ => Error::Io(e),
    }
}

/// Map a data-path I/O error to the appropriate [`Error`] variant.
fn map_io_error(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::ConnectionAborted => Error::ConnectionLost,
        _ => Error::Io(e),
    }
}
