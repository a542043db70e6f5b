//! ductx-test-harness: Test utilities, mock transports and a simulated
//! radio for ductx.
//!
//! This crate provides [`MockTransport`] for deterministic unit testing of
//! the command channel without a socket, [`MockRadio`] for end-to-end tests
//! of channels and groups against a simulated multi-DUC radio over TCP, and
//! [`CaptureSink`] for inspecting the frames a packetizer emits.

pub mod capture;
pub mod mock_radio;
pub mod mock_transport;

pub use capture::CaptureSink;
pub use mock_radio::{DucState, MockRadio, RadioGroup, RadioSink, RadioState};
pub use mock_transport::{MockTransport, SentLog};
