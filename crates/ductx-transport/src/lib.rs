//! Transport implementations for ductx.
//!
//! This crate provides the blocking socket layer under the transmit engine:
//!
//! - [`TcpTransport`]: the radio's line-oriented control connection,
//!   implementing [`Transport`](ductx_core::Transport)
//! - [`UdpSocketPool`]: round-robin, interface-bound data sockets,
//!   implementing [`FrameSink`](ductx_core::FrameSink)
//! - [`UdpSender`]: a single socket for best-effort datagrams such as the
//!   loopback status broadcast
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
//! transport.send(b"DUCSTAT? 1\n")?;
//!
//! let mut buf = [0u8; 256];
//! let n = transport.receive(&mut buf, Duration::from_secs(1))?;
//! # Ok(())
//! # }
//! ```

pub mod tcp;
pub mod udp;

pub use tcp::TcpTransport;
pub use udp::{DEFAULT_POOL_SIZE, UdpSender, UdpSocketPool};
