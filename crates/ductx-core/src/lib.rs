//! ductx-core: Core types, traits and error definitions for ductx.
//!
//! This crate defines the radio-agnostic pieces shared by the transport
//! layer, the transmit engine and the test harness.
//!
//! # Key types
//!
//! - [`ChannelConfig`] -- static configuration of one upconverter channel
//! - [`Transport`] -- blocking control-plane byte channel
//! - [`FrameSink`] -- blocking data-plane datagram sink
//! - [`Error`] / [`Result`] -- error handling

pub mod error;
pub mod transport;
pub mod types;

pub use error::{Error, Result};
pub use transport::{FrameSink, Transport};
pub use types::*;
