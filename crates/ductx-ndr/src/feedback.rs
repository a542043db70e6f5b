//! Best-effort status broadcast for external flow-control listeners.
//!
//! After every successful poll the tracker hands its fresh state to a
//! [`FlowFeedbackPort`], which sends it as a status frame to a loopback
//! port derived from the stream id, plus a copy to a fixed diagnostic
//! port. Delivery is never confirmed and send failures are only logged.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Mutex;

use ductx_core::Result;
use ductx_transport::UdpSender;

use crate::frame::{self, FrameCounters, StatusReport};

/// First loopback port of the per-stream status range.
pub const STATUS_PORT_BASE: u16 = 42_000;

/// Loopback port that receives a copy of every status frame.
pub const DIAGNOSTIC_PORT: u16 = 65_500;

/// Loopback status port for a stream id.
pub fn status_port(stream_id: u32) -> u16 {
    // The low 12 bits keep the result below 46096.
    STATUS_PORT_BASE + (stream_id & 0x0FFF) as u16
}

/// Sends status frames for one stream.
#[derive(Debug)]
pub struct FlowFeedbackPort {
    sender: UdpSender,
    stream_id: u32,
    target: SocketAddr,
    diagnostic: Option<SocketAddr>,
    counters: Mutex<FrameCounters>,
}

impl FlowFeedbackPort {
    /// Port for `stream_id` using the standard loopback targets.
    pub fn for_stream(stream_id: u32) -> Result<Self> {
        Self::with_targets(
            stream_id,
            loopback(status_port(stream_id)),
            Some(loopback(DIAGNOSTIC_PORT)),
        )
    }

    /// Port with explicit targets.
    pub fn with_targets(
        stream_id: u32,
        target: SocketAddr,
        diagnostic: Option<SocketAddr>,
    ) -> Result<Self> {
        Ok(Self {
            sender: UdpSender::loopback()?,
            stream_id,
            target,
            diagnostic,
            counters: Mutex::new(FrameCounters::new()),
        })
    }

    /// Primary destination.
    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Broadcast one report. Failures are logged and otherwise ignored.
    pub fn publish(&self, report: &StatusReport) {
        let counters = {
            let mut c = self.counters.lock().unwrap_or_else(|e| e.into_inner());
            let now = *c;
            c.increment();
            now
        };
        let bytes = frame::build_status_frame(self.stream_id, counters, report);

        for dest in std::iter::once(self.target).chain(self.diagnostic) {
            if let Err(e) = self.sender.send_to(&bytes, dest) {
                tracing::trace!(dest = %dest, error = %e, "Status broadcast dropped");
            }
        }
    }
}

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
}
