//! ductx-ndr: transmit engine for NDR-family networked radios.
//!
//! Streams fixed-size IQ blocks to the radio's DUCs over UDP while keeping
//! each DUC's transmit buffer between underrun and overrun, and starts
//! several DUCs in lockstep through a radio-side DUC group.
//!
//! # Layers
//!
//! | Module         | Role                                                  |
//! |----------------|-------------------------------------------------------|
//! | [`frame`]      | Ethernet/IPv4/UDP + VRL/VRT frame codec, status frames |
//! | [`codec`]      | Control-plane command builders and reply parsers      |
//! | [`command`]    | Serialized TCP command channel                        |
//! | [`tracker`]    | Buffer estimate, poll thread, admission gate          |
//! | [`feedback`]   | Loopback status broadcast                             |
//! | [`packetizer`] | Frame building and sending per channel                |
//! | [`channel`]    | Per-DUC controller                                    |
//! | [`builder`]    | Fluent construction of channel controllers            |
//! | [`group`]      | Synchronized start of several channels                |
//! | [`models`]     | Radio model limits                                    |
//! | [`rates`]      | Sample-rate table                                     |
//!
//! # Example
//!
//! ```no_run
//! use ductx_core::{ChannelConfig, IqSample};
//! use ductx_ndr::{ChannelBuilder, CommandChannel, GroupOptions, SynchronizedGroupController};
//!
//! # fn example() -> ductx_core::Result<()> {
//! let commands = CommandChannel::connect("192.168.0.10:8617")?;
//! let members = [(1, 100), (2, 101)]
//!     .into_iter()
//!     .map(|(channel, stream_id)| {
//!         ChannelBuilder::new(ChannelConfig {
//!             channel,
//!             stream_id,
//!             interface: "eth1".into(),
//!             ..ChannelConfig::default()
//!         })
//!         .commands(commands.clone())
//!         .build()
//!     })
//!     .collect::<ductx_core::Result<Vec<_>>>()?;
//!
//! let mut group = SynchronizedGroupController::new(commands, members, GroupOptions::default())?;
//! group.start()?;
//! let block = vec![IqSample::new(0, 0); 1024];
//! loop {
//!     group.send_frames(&[&block, &block])?;
//! }
//! # }
//! ```

pub mod builder;
pub mod channel;
pub mod codec;
pub mod command;
pub mod feedback;
pub mod frame;
pub mod group;
pub mod models;
pub mod packetizer;
pub mod rates;
pub mod tracker;

pub use builder::ChannelBuilder;
pub use channel::{ChannelController, SinkFactory, udp_sink_factory};
pub use command::{CommandChannel, CommandOptions, DEFAULT_CONTROL_PORT};
pub use feedback::FlowFeedbackPort;
pub use frame::{FrameCounters, FrameFormat, FrameLayout, StatusReport};
pub use group::{GroupOptions, GroupState, SynchronizedGroupController};
pub use models::NdrRadioModel;
pub use packetizer::FramePacketizer;
pub use tracker::{Admission, BufferState, BufferStatusTracker, TrackerOptions};
