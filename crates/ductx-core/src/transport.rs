//! Transport traits for radio communication.
//!
//! The [`Transport`] trait abstracts over the control-plane link to a radio:
//! a TCP socket in production, a scripted mock in tests. The command channel
//! in `ductx-ndr` operates on a `Transport` rather than directly on a
//! `TcpStream`, enabling deterministic unit testing with `MockTransport` from
//! the `ductx-test-harness` crate.
//!
//! The [`FrameSink`] trait is the data-plane counterpart: something that
//! accepts one fully-built datagram at a time.

use std::time::Duration;

use crate::error::Result;

/// Blocking byte-level control transport to a radio.
///
/// Implementations handle buffering and error recovery at the socket layer.
/// Line framing and command syntax are handled by the command channel that
/// consumes this trait.
pub trait Transport: Send {
    /// Send raw bytes to the radio.
    ///
    /// Blocks until all bytes have been handed to the underlying socket.
    fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive bytes from the radio into the provided buffer.
    ///
    /// Returns the number of bytes actually read. Waits up to `timeout` for
    /// data to arrive; returns [`Error::Timeout`](crate::error::Error::Timeout)
    /// if nothing arrives within the deadline and
    /// [`Error::ConnectionLost`](crate::error::Error::ConnectionLost) if the
    /// peer closed the connection.
    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Close the transport connection.
    ///
    /// After calling `close()`, subsequent `send()` and `receive()` calls
    /// return [`Error::NotConnected`](crate::error::Error::NotConnected).
    fn close(&mut self) -> Result<()>;

    /// Check whether the transport is currently connected.
    fn is_connected(&self) -> bool;
}

/// Blocking datagram sink for outbound sample frames.
///
/// A sink may spread frames across several sockets; no ordering guarantee
/// between consecutive frames is implied beyond what the network provides.
pub trait FrameSink: Send {
    /// Transmit one datagram.
    fn send_frame(&mut self, frame: &[u8]) -> Result<()>;

    /// Release any sockets held by the sink. Further sends fail.
    fn close(&mut self);
}
