//! UDP transports for the radio data plane.
//!
//! This module provides two datagram senders:
//!
//! - [`UdpSocketPool`] -- a small round-robin pool of sockets bound to one
//!   network interface and connected to one radio data port. It implements
//!   [`FrameSink`] and carries the sample frames.
//! - [`UdpSender`] -- a single unconnected socket used for best-effort
//!   datagrams to arbitrary destinations, such as the loopback status
//!   broadcast.
//!
//! Unlike [`super::TcpTransport`], neither implements
//! [`Transport`](ductx_core::Transport): UDP is connectionless and the data
//! plane never reads.
//!
//! # Example
//!
//! ```no_run
//! use ductx_core::FrameSink;
//! use ductx_transport::UdpSocketPool;
//! use std::net::{Ipv4Addr, SocketAddrV4};
//!
//! # fn example() -> ductx_core::Result<()> {
//! let dest = SocketAddrV4::new(Ipv4Addr::new(10, 1, 10, 1), 41001);
//! let mut pool = UdpSocketPool::open("eth1", Ipv4Addr::new(10, 1, 10, 2), dest, 4)?;
//! pool.send_frame(&[0u8; 4136])?;
//! # Ok(())
//! # }
//! ```

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use ductx_core::error::{Error, Result};
use ductx_core::transport::FrameSink;
use socket2::{Domain, Protocol, Socket, Type};

/// Default number of sockets in a data-plane pool.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Kernel send buffer requested for each data socket (4 MiB).
const SEND_BUFFER_BYTES: usize = 4 * 1024 * 1024;

/// Round-robin pool of UDP sockets bound to one interface.
///
/// Every socket is connected to the same radio data port; consecutive frames
/// go out on consecutive sockets. No ordering between sockets is implied.
#[derive(Debug)]
pub struct UdpSocketPool {
    sockets: Vec<UdpSocket>,
    cursor: usize,
    interface: String,
    dest: SocketAddrV4,
}

impl UdpSocketPool {
    /// Open `size` sockets on `interface`, each bound to `local_addr` on an
    /// ephemeral port and connected to `dest`.
    ///
    /// An empty `interface` skips the device binding. Any socket that cannot
    /// be created, bound or connected fails the whole pool with
    /// [`Error::Resource`]; sockets opened so far are dropped.
    pub fn open(
        interface: &str,
        local_addr: Ipv4Addr,
        dest: SocketAddrV4,
        size: usize,
    ) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidParameter(
                "socket pool needs at least one socket".into(),
            ));
        }

        tracing::debug!(
            interface = %interface,
            dest = %dest,
            size,
            "Opening UDP socket pool"
        );

        let mut sockets = Vec::with_capacity(size);
        for index in 0..size {
            let socket = open_data_socket(interface, local_addr, dest).map_err(|source| {
                tracing::error!(
                    interface = %interface,
                    index,
                    error = %source,
                    "Failed to create data socket"
                );
                Error::Resource {
                    resource: format!("data socket {} on {}", index, display_iface(interface)),
                    source,
                }
            })?;
            sockets.push(socket);
        }

        tracing::info!(interface = %interface, dest = %dest, size, "UDP socket pool open");

        Ok(Self {
            sockets,
            cursor: 0,
            interface: interface.to_string(),
            dest,
        })
    }

    /// Number of open sockets (zero after [`close`](FrameSink::close)).
    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    /// Whether the pool has been closed.
    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    /// Destination every socket is connected to.
    pub fn dest(&self) -> SocketAddrV4 {
        self.dest
    }

    /// Local addresses of the pool's sockets, in rotation order.
    pub fn local_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.sockets
            .iter()
            .map(|s| s.local_addr().map_err(Error::Io))
            .collect()
    }
}

impl FrameSink for UdpSocketPool {
    fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        if self.sockets.is_empty() {
            return Err(Error::NotConnected);
        }
        let socket = &self.sockets[self.cursor];
        self.cursor = (self.cursor + 1) % self.sockets.len();

        let sent = socket.send(frame).map_err(|e| {
            tracing::warn!(interface = %self.interface, error = %e, "Data send failed");
            Error::Io(e)
        })?;
        if sent != frame.len() {
            return Err(Error::Transport(format!(
                "short datagram: sent {} of {} bytes",
                sent,
                frame.len()
            )));
        }
        Ok(())
    }

    fn close(&mut self) {
        if !self.sockets.is_empty() {
            tracing::debug!(
                interface = %self.interface,
                sockets = self.sockets.len(),
                "Closing UDP socket pool"
            );
            self.sockets.clear();
            self.cursor = 0;
        }
    }
}

impl Drop for UdpSocketPool {
    fn drop(&mut self) {
        if !self.sockets.is_empty() {
            tracing::debug!(interface = %self.interface, "UdpSocketPool dropped while open");
        }
    }
}

fn open_data_socket(
    interface: &str,
    local_addr: Ipv4Addr,
    dest: SocketAddrV4,
) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    if let Err(e) = socket.set_send_buffer_size(SEND_BUFFER_BYTES) {
        tracing::warn!(error = %e, "Failed to enlarge send buffer (continuing anyway)");
    }

    if !interface.is_empty() {
        bind_to_device(&socket, interface)?;
    }

    socket.bind(&SocketAddr::V4(SocketAddrV4::new(local_addr, 0)).into())?;
    socket.connect(&SocketAddr::V4(dest).into())?;

    Ok(socket.into())
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "fuchsia"))]
fn bind_to_device(socket: &Socket, interface: &str) -> std::io::Result<()> {
    socket.bind_device(Some(interface.as_bytes()))
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "fuchsia")))]
fn bind_to_device(_socket: &Socket, interface: &str) -> std::io::Result<()> {
    tracing::warn!(interface = %interface, "Interface binding unsupported on this platform");
    Ok(())
}

fn display_iface(interface: &str) -> &str {
    if interface.is_empty() { "any interface" } else { interface }
}

/// Single unconnected UDP socket for best-effort datagrams.
#[derive(Debug)]
pub struct UdpSender {
    socket: UdpSocket,
}

impl UdpSender {
    /// Bind a sender on `local` (use port 0 for an ephemeral port).
    pub fn bind(local: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(local).map_err(|source| Error::Resource {
            resource: format!("UDP socket on {}", local),
            source,
        })?;
        tracing::debug!(local = %local, "UDP sender bound");
        Ok(Self { socket })
    }

    /// Bind a sender on an ephemeral loopback port.
    pub fn loopback() -> Result<Self> {
        Self::bind(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)))
    }

    /// Send one datagram to `target`.
    pub fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<()> {
        self.socket.send_to(data, target).map_err(Error::Io)?;
        Ok(())
    }

    /// Local address of the socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(Error::Io)
    }
}
