//! ChannelBuilder -- fluent builder for [`ChannelController`] instances.
//!
//! Separates configuration from construction: the caller sets the model,
//! framing, socket pool and tracker tuning, then `build()` validates the
//! channel configuration against the model and wires the tracker,
//! packetizer and sink factory together. Nothing touches the radio until
//! [`ChannelController::start`].
//!
//! # Example
//!
//! ```no_run
//! use ductx_core::ChannelConfig;
//! use ductx_ndr::builder::ChannelBuilder;
//! use ductx_ndr::command::CommandChannel;
//! use ductx_ndr::models::ndr651;
//!
//! # fn example() -> ductx_core::Result<()> {
//! let commands = CommandChannel::connect("192.168.0.10:8617")?;
//! let channel = ChannelBuilder::new(ChannelConfig {
//!     channel: 1,
//!     stream_id: 100,
//!     interface: "eth1".into(),
//!     ..ChannelConfig::default()
//! })
//! .model(ndr651())
//! .commands(commands)
//! .build()?;
//! channel.start()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use ductx_core::{ByteOrder, ChannelConfig, Error, FrameSink, IqOrder, Result};
use ductx_transport::DEFAULT_POOL_SIZE;

use crate::channel::{ChannelController, ChannelParts, SinkFactory, udp_sink_factory};
use crate::command::CommandChannel;
use crate::feedback::FlowFeedbackPort;
use crate::frame::{FrameFormat, FrameLayout};
use crate::models::{self, NdrRadioModel};
use crate::packetizer::{DEFAULT_SEND_TIMEOUT, FramePacketizer};
use crate::rates;
use crate::tracker::{BufferStatusTracker, TrackerOptions};

/// Fluent builder for [`ChannelController`].
///
/// Only the command channel is required:
///
/// ```ignore
/// let channel = ChannelBuilder::new(config).commands(commands).build()?;
/// ```
pub struct ChannelBuilder {
    config: ChannelConfig,
    model: Option<NdrRadioModel>,
    commands: Option<Arc<CommandChannel>>,
    format: FrameFormat,
    pool_size: usize,
    tracker_options: TrackerOptions,
    send_timeout: Duration,
    sink_factory: Option<SinkFactory>,
    feedback: bool,
    span: Option<tracing::Span>,
}

impl ChannelBuilder {
    /// Create a builder for `config` with default settings.
    pub fn new(config: ChannelConfig) -> Self {
        ChannelBuilder {
            config,
            model: None,
            commands: None,
            format: FrameFormat::default(),
            pool_size: DEFAULT_POOL_SIZE,
            tracker_options: TrackerOptions::default(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
            sink_factory: None,
            feedback: true,
            span: None,
        }
    }

    /// Set the radio model (default: NDR651).
    pub fn model(mut self, model: NdrRadioModel) -> Self {
        self.model = Some(model);
        self
    }

    /// Set the command channel shared with the radio's other channels.
    pub fn commands(mut self, commands: Arc<CommandChannel>) -> Self {
        self.commands = Some(commands);
        self
    }

    /// Set the samples carried by each frame (default: 1024).
    pub fn samples_per_frame(mut self, samples: usize) -> Self {
        self.format.samples_per_frame = samples;
        self
    }

    /// Set the byte order of sample words (default: big-endian).
    pub fn byte_order(mut self, order: ByteOrder) -> Self {
        self.format.byte_order = order;
        self
    }

    /// Set the I/Q order within each sample (default: I first).
    pub fn iq_order(mut self, order: IqOrder) -> Self {
        self.format.iq_order = order;
        self
    }

    /// Set the OUI and class codes stamped into each frame.
    pub fn class_id(mut self, oui: u32, info_class: u16, packet_class: u16) -> Self {
        self.format.class_oui = oui;
        self.format.info_class = info_class;
        self.format.packet_class = packet_class;
        self
    }

    /// Set the number of data sockets (default: 4). Ignored when a custom
    /// sink factory is set.
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the buffer tracker tuning.
    pub fn tracker_options(mut self, options: TrackerOptions) -> Self {
        self.tracker_options = options;
        self
    }

    /// Set how long a blocking send waits for buffer space (default: 2s).
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Replace the UDP socket pool with another [`FrameSink`], e.g. a
    /// capture sink in tests.
    pub fn sink_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&ChannelConfig) -> Result<Box<dyn FrameSink>> + Send + Sync + 'static,
    {
        self.sink_factory = Some(Box::new(factory));
        self
    }

    /// Enable or disable the loopback status broadcast (default: enabled).
    pub fn feedback(mut self, enable: bool) -> Self {
        self.feedback = enable;
        self
    }

    /// Log under `span` instead of the default `duc` span.
    pub fn span(mut self, span: tracing::Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Validate the configuration and assemble the controller.
    ///
    /// Requires that [`commands()`](Self::commands) has been called.
    pub fn build(self) -> Result<ChannelController> {
        let commands = self.commands.ok_or_else(|| {
            Error::Configuration(
                "command channel is required: call .commands() before .build()".into(),
            )
        })?;
        let model = self.model.unwrap_or_else(models::ndr651);
        let config = self.config;

        model.check_channel(config.channel)?;
        model.check_tx_mask(config.tx_channel_mask)?;
        rates::rate_index_to_sample_rate(config.rate_index)?;
        if let Some(tx) = &config.transmitter {
            model.check_transmitter(tx.index)?;
        }
        if self.sink_factory.is_none() && self.pool_size == 0 {
            return Err(Error::Configuration(
                "socket pool needs at least one socket".into(),
            ));
        }
        let layout = FrameLayout::new(&config, self.format)?;

        let span = self.span.unwrap_or_else(|| {
            tracing::info_span!("duc", channel = config.channel, stream_id = config.stream_id)
        });

        let mut tracker = BufferStatusTracker::new(
            config.channel,
            Arc::clone(&commands),
            model.duc_buffer_samples,
            self.tracker_options,
        )
        .with_span(span.clone());
        if self.feedback {
            tracker = tracker.with_feedback(FlowFeedbackPort::for_stream(config.stream_id)?);
        }
        let tracker = Arc::new(tracker);

        let packetizer = FramePacketizer::new(layout, Arc::clone(&tracker))
            .with_send_timeout(self.send_timeout)
            .with_span(span.clone());

        let sink_factory = self
            .sink_factory
            .unwrap_or_else(|| udp_sink_factory(self.pool_size));

        tracing::debug!(parent: &span, model = model.name, "Channel built");

        Ok(ChannelController::from_parts(ChannelParts {
            config,
            model,
            format: self.format,
            commands,
            tracker,
            packetizer,
            sink_factory,
            span,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandOptions;
    use ductx_core::TransmitterConfig;
    use ductx_test_harness::MockTransport;

    fn commands() -> Arc<CommandChannel> {
        CommandChannel::from_transport(Box::new(MockTransport::new()), CommandOptions::default())
    }

    #[test]
    fn defaults() {
        let ch = ChannelBuilder::new(ChannelConfig::default())
            .commands(commands())
            .feedback(false)
            .build()
            .unwrap();
        assert_eq!(ch.model().model_id, "ndr651");
        assert_eq!(ch.samples_per_frame(), 1024);
        assert_eq!(ch.tracker().capacity(), 67_108_864);
        assert_eq!(ch.tracker().prime_threshold(), 33_554_432);
        assert!(!ch.is_running());
    }

    #[test]
    fn commands_required() {
        let err = ChannelBuilder::new(ChannelConfig::default())
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains(".commands()"));
    }

    #[test]
    fn channel_out_of_range() {
        let err = ChannelBuilder::new(ChannelConfig {
            channel: 9,
            ..ChannelConfig::default()
        })
        .commands(commands())
        .build()
        .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[test]
    fn reserved_rate_rejected() {
        let err = ChannelBuilder::new(ChannelConfig {
            rate_index: 14,
            ..ChannelConfig::default()
        })
        .commands(commands())
        .build()
        .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[test]
    fn unknown_transmitter_rejected() {
        let err = ChannelBuilder::new(ChannelConfig {
            transmitter: Some(TransmitterConfig {
                index: 3,
                frequency_hz: 1_000_000_000,
                attenuation_db: 0.0,
            }),
            ..ChannelConfig::default()
        })
        .commands(commands())
        .build()
        .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[test]
    fn empty_pool_rejected() {
        let err = ChannelBuilder::new(ChannelConfig::default())
            .commands(commands())
            .pool_size(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn oversized_frame_rejected() {
        let err = ChannelBuilder::new(ChannelConfig::default())
            .commands(commands())
            .samples_per_frame(20_000)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn custom_framing_and_threshold() {
        let ch = ChannelBuilder::new(ChannelConfig::default())
            .model(models::custom(2, 65_536))
            .commands(commands())
            .samples_per_frame(512)
            .byte_order(ByteOrder::Little)
            .iq_order(IqOrder::QFirst)
            .tracker_options(TrackerOptions {
                prime_threshold: Some(4096),
                ..TrackerOptions::default()
            })
            .feedback(false)
            .build()
            .unwrap();
        assert_eq!(ch.samples_per_frame(), 512);
        assert_eq!(ch.tracker().capacity(), 65_536);
        assert_eq!(ch.tracker().prime_threshold(), 4096);
    }
}
