//! # ductx -- synchronized IQ transmit streaming for networked radios
//!
//! `ductx` streams continuous IQ sample blocks to the digital upconverters
//! (DUCs) of NDR-family software-defined-radio transmitters over Ethernet.
//! It keeps every DUC's transmit buffer fed without underrun or overrun and
//! can start several DUCs on the same sample.
//!
//! ## Architecture
//!
//! | Crate              | Purpose                                           |
//! |--------------------|---------------------------------------------------|
//! | `ductx-core`       | Errors, channel configuration, transport traits  |
//! | `ductx-transport`  | TCP control transport, UDP socket pool            |
//! | `ductx-ndr`        | Framing, flow control, channel and group control  |
//! | **`ductx`**        | This facade crate -- re-exports everything        |
//!
//! Everything is blocking: each channel runs one poll thread, and sends
//! happen on the caller's thread.
//!
//! ## Quick Start
//!
//! ```no_run
//! use ductx::{ChannelConfig, IqSample};
//! use ductx::ndr::{ChannelBuilder, CommandChannel};
//!
//! fn main() -> ductx::Result<()> {
//!     let commands = CommandChannel::connect("192.168.0.10:8617")?;
//!     let channel = ChannelBuilder::new(ChannelConfig {
//!         channel: 1,
//!         stream_id: 100,
//!         interface: "eth1".into(),
//!         ..ChannelConfig::default()
//!     })
//!     .commands(commands)
//!     .build()?;
//!
//!     channel.start()?;
//!     let block = vec![IqSample::new(0, 0); channel.samples_per_frame()];
//!     for _ in 0..1000 {
//!         channel.send_samples(&block)?;
//!     }
//!     channel.stop()
//! }
//! ```

pub use ductx_core::*;

/// Blocking socket layer.
pub mod transport {
    pub use ductx_transport::*;
}

/// NDR transmit engine.
///
/// Provides [`ChannelBuilder`](ndr::ChannelBuilder),
/// [`ChannelController`](ndr::ChannelController) and
/// [`SynchronizedGroupController`](ndr::SynchronizedGroupController).
pub mod ndr {
    pub use ductx_ndr::*;
}

/// Radio models known to this build.
pub fn supported_models() -> Vec<ndr::NdrRadioModel> {
    ndr::models::all_models()
}
