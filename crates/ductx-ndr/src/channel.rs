//! ChannelController -- one DUC's configuration, tracker and packetizer.
//!
//! The controller is the per-channel facade the caller (or a group
//! controller) talks to. It owns:
//!
//! - the channel's [`ChannelConfig`], behind a mutex that doubles as the
//!   sequence lock: setters, `start()` and `stop()` all hold it, so a
//!   configuration call issued during a start or stop waits its turn;
//! - the [`BufferStatusTracker`] and its poll thread;
//! - the [`FramePacketizer`] and, while running, its [`FrameSink`].
//!
//! Construct one with [`ChannelBuilder`](crate::builder::ChannelBuilder).
//!
//! Lock order is config, then packetizer. Senders take only the packetizer
//! lock; a sender blocked on buffer space is woken by `stop()` stopping the
//! tracker before the packetizer lock is needed.

use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use ductx_core::types::iq_from_f32;
use ductx_core::{ChannelConfig, Error, FrameSink, IqSample, Result};
use ductx_transport::UdpSocketPool;
use num_complex::Complex;

use crate::codec;
use crate::command::CommandChannel;
use crate::frame::{FrameFormat, FrameLayout};
use crate::models::NdrRadioModel;
use crate::packetizer::FramePacketizer;
use crate::rates;
use crate::tracker::{BufferState, BufferStatusTracker};

/// Opens the data-plane sink for a channel when it starts.
pub type SinkFactory = Box<dyn Fn(&ChannelConfig) -> Result<Box<dyn FrameSink>> + Send + Sync>;

/// Sink factory opening a [`UdpSocketPool`] of `pool_size` sockets on the
/// channel's interface, aimed at the radio's data port.
pub fn udp_sink_factory(pool_size: usize) -> SinkFactory {
    Box::new(move |config: &ChannelConfig| {
        let dest = SocketAddrV4::new(config.radio_addr, config.radio_udp_port);
        let pool = UdpSocketPool::open(&config.interface, config.local_addr, dest, pool_size)?;
        Ok(Box::new(pool) as Box<dyn FrameSink>)
    })
}

/// Controls one DUC.
pub struct ChannelController {
    config: Mutex<ChannelConfig>,
    channel: u8,
    model: NdrRadioModel,
    format: FrameFormat,
    commands: Arc<CommandChannel>,
    tracker: Arc<BufferStatusTracker>,
    packetizer: Mutex<FramePacketizer>,
    sink_factory: SinkFactory,
    running: AtomicBool,
    span: tracing::Span,
}

pub(crate) struct ChannelParts {
    pub config: ChannelConfig,
    pub model: NdrRadioModel,
    pub format: FrameFormat,
    pub commands: Arc<CommandChannel>,
    pub tracker: Arc<BufferStatusTracker>,
    pub packetizer: FramePacketizer,
    pub sink_factory: SinkFactory,
    pub span: tracing::Span,
}

impl ChannelController {
    pub(crate) fn from_parts(parts: ChannelParts) -> Self {
        Self {
            channel: parts.config.channel,
            config: Mutex::new(parts.config),
            model: parts.model,
            format: parts.format,
            commands: parts.commands,
            tracker: parts.tracker,
            packetizer: Mutex::new(parts.packetizer),
            sink_factory: parts.sink_factory,
            running: AtomicBool::new(false),
            span: parts.span,
        }
    }

    // -----------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------

    /// Select a sample rate by table index. Applied to the radio at once if
    /// the channel is running.
    pub fn set_rate_index(&self, rate_index: u8) -> Result<()> {
        let rate = rates::rate_index_to_sample_rate(rate_index)?;
        self.update(|c| c.rate_index = rate_index)?;
        tracing::debug!(parent: &self.span, rate_index, rate, "Rate set");
        Ok(())
    }

    /// Select the transmitters this DUC feeds.
    pub fn set_tx_channel_mask(&self, mask: u8) -> Result<()> {
        self.model.check_tx_mask(mask)?;
        self.update(|c| c.tx_channel_mask = mask)
    }

    /// Change the stream id. Only allowed while stopped; takes effect on the
    /// next `start()`.
    pub fn set_stream_id(&self, stream_id: u32) -> Result<()> {
        let mut config = self.lock_config();
        if self.is_running() {
            return Err(Error::InvalidParameter(
                "stream id can only change while the channel is stopped".into(),
            ));
        }
        config.stream_id = stream_id;
        Ok(())
    }

    /// Set the DUC frequency offset in Hz.
    pub fn set_frequency(&self, frequency_offset_hz: f64) -> Result<()> {
        self.update(|c| c.frequency_offset_hz = frequency_offset_hz)
    }

    /// Set the DUC attenuation in dB.
    pub fn set_attenuation(&self, attenuation_db: f64) -> Result<()> {
        self.update(|c| c.attenuation_db = attenuation_db)
    }

    /// Set the shared transmitter frequency. The channel must carry a
    /// transmitter configuration.
    pub fn set_tx_frequency(&self, frequency_hz: u64) -> Result<()> {
        let mut config = self.lock_config();
        let tx = config.transmitter.as_mut().ok_or_else(no_transmitter)?;
        tx.frequency_hz = frequency_hz;
        let index = tx.index;
        if self.is_running() {
            self.commands
                .execute(&codec::cmd_tx_frequency(index, frequency_hz))?;
        }
        Ok(())
    }

    /// Set the shared transmitter attenuation. The channel must carry a
    /// transmitter configuration.
    pub fn set_tx_attenuation(&self, attenuation_db: f64) -> Result<()> {
        let mut config = self.lock_config();
        let tx = config.transmitter.as_mut().ok_or_else(no_transmitter)?;
        tx.attenuation_db = attenuation_db;
        let index = tx.index;
        if self.is_running() {
            self.commands
                .execute(&codec::cmd_tx_attenuation(index, attenuation_db))?;
        }
        Ok(())
    }

    /// Push the full configuration to the radio with the DUC enabled.
    pub fn apply_and_enable(&self) -> Result<()> {
        let config = self.lock_config();
        self.push_config(&config)
    }

    fn update(&self, f: impl FnOnce(&mut ChannelConfig)) -> Result<()> {
        let mut config = self.lock_config();
        f(&mut config);
        if self.is_running() {
            self.commands.execute(&codec::cmd_duc(&config, true))?;
        }
        Ok(())
    }

    fn push_config(&self, config: &ChannelConfig) -> Result<()> {
        if let Some(tx) = config.transmitter {
            self.commands
                .execute(&codec::cmd_tx_frequency(tx.index, tx.frequency_hz))?;
            self.commands
                .execute(&codec::cmd_tx_attenuation(tx.index, tx.attenuation_db))?;
        }
        self.commands.execute(&codec::cmd_duc(config, true))
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    /// Push the configuration, start polling and open the data sink.
    ///
    /// On failure every step already taken is undone.
    pub fn start(&self) -> Result<()> {
        let config = self.lock_config();
        if self.is_running() {
            return Ok(());
        }

        let layout = FrameLayout::new(&config, self.format)?;
        self.push_config(&config)?;

        if let Err(e) = self.tracker.start() {
            self.disable_quietly(&config);
            return Err(e);
        }

        let sink = match (self.sink_factory)(&config) {
            Ok(sink) => sink,
            Err(e) => {
                tracing::error!(parent: &self.span, error = %e, "Failed to open data sink");
                self.tracker.stop();
                self.disable_quietly(&config);
                return Err(e);
            }
        };

        {
            let mut packetizer = self.lock_packetizer();
            packetizer.set_layout(layout);
            packetizer.open(sink);
        }
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(parent: &self.span, config = %*config, "Channel started");
        Ok(())
    }

    /// Disable the DUC on the radio, stop polling and release the sink.
    ///
    /// Every step runs even if an earlier one failed; the first error is
    /// returned. Blocked senders wake with [`Error::StreamClosed`].
    pub fn stop(&self) -> Result<()> {
        let config = self.lock_config();
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let mut first_err = None;
        if let Err(e) = self.commands.execute(&codec::cmd_duc(&config, false)) {
            tracing::warn!(parent: &self.span, error = %e, "Failed to disable DUC");
            first_err.get_or_insert(e);
        }
        self.tracker.stop();
        self.lock_packetizer().close();

        tracing::info!(parent: &self.span, "Channel stopped");
        first_err.map_or(Ok(()), Err)
    }

    fn disable_quietly(&self, config: &ChannelConfig) {
        if let Err(e) = self.commands.execute(&codec::cmd_duc(config, false)) {
            tracing::warn!(parent: &self.span, error = %e, "Failed to disable DUC during cleanup");
        }
    }

    // -----------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------

    /// Send one frame-sized block, blocking until the radio has room.
    pub fn send_samples(&self, block: &[IqSample]) -> Result<usize> {
        self.lock_packetizer().send_frame(block)
    }

    /// Send one block only if it is admitted right now; `Ok(0)` otherwise.
    pub fn try_send_samples(&self, block: &[IqSample]) -> Result<usize> {
        self.lock_packetizer().try_send_frame(block)
    }

    /// Scale floating-point samples to 16-bit words and send them.
    pub fn send_samples_f32(&self, block: &[Complex<f32>], scale: f32) -> Result<usize> {
        let mut words = Vec::with_capacity(block.len());
        iq_from_f32(block, scale, &mut words);
        self.send_samples(&words)
    }

    // -----------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------

    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Copy of the current configuration.
    pub fn config(&self) -> ChannelConfig {
        self.lock_config().clone()
    }

    pub fn stream_id(&self) -> u32 {
        self.lock_config().stream_id
    }

    pub fn model(&self) -> &NdrRadioModel {
        &self.model
    }

    /// Samples every block must contain.
    pub fn samples_per_frame(&self) -> usize {
        self.format.samples_per_frame
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Snapshot of the tracked buffer.
    pub fn buffer_state(&self) -> BufferState {
        self.tracker.snapshot()
    }

    /// Whether this channel has buffered enough to be enabled.
    pub fn is_ready(&self) -> bool {
        self.tracker.is_ready()
    }

    pub fn tracker(&self) -> &Arc<BufferStatusTracker> {
        &self.tracker
    }

    pub fn commands(&self) -> &Arc<CommandChannel> {
        &self.commands
    }

    fn lock_config(&self) -> MutexGuard<'_, ChannelConfig> {
        self.config.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_packetizer(&self) -> MutexGuard<'_, FramePacketizer> {
        self.packetizer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for ChannelController {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(parent: &self.span, error = %e, "Stop on drop failed");
        }
    }
}

impl std::fmt::Debug for ChannelController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelController")
            .field("channel", &self.channel)
            .field("running", &self.is_running())
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

fn no_transmitter() -> Error {
    Error::Configuration("channel has no transmitter configuration".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ChannelBuilder;
    use crate::frame::{PAYLOAD_OFFSET, VRL_OFFSET};
    use crate::models;
    use crate::tracker::TrackerOptions;
    use ductx_core::TransmitterConfig;
    use ductx_test_harness::{CaptureSink, MockRadio};
    use std::time::Duration;

    const CAPACITY: u32 = 16_384;
    const SPF: usize = 1024;

    fn config(stream_id: u32) -> ChannelConfig {
        ChannelConfig {
            channel: 1,
            stream_id,
            ..ChannelConfig::default()
        }
    }

    fn builder(radio: &MockRadio, config: ChannelConfig) -> ChannelBuilder {
        let commands = CommandChannel::connect(radio.addr()).unwrap();
        let sink = radio.data_sink(config.channel, SPF as u32);
        ChannelBuilder::new(config)
            .model(models::custom(2, CAPACITY))
            .commands(commands)
            .feedback(false)
            .sink_factory(move |_| Ok(Box::new(sink.clone()) as Box<dyn FrameSink>))
    }

    fn block() -> Vec<IqSample> {
        vec![IqSample::new(100, -100); SPF]
    }

    #[test]
    fn start_and_stop_drive_the_radio() {
        let radio = MockRadio::start(2, CAPACITY).unwrap();
        let ch = builder(&radio, config(100)).build().unwrap();

        ch.start().unwrap();
        assert!(ch.is_running());
        assert!(ch.tracker().is_running());
        let duc = radio.duc(1).unwrap();
        assert_eq!(duc.tx_mask, 1);
        assert_eq!(duc.stream_id, 100);

        ch.stop().unwrap();
        assert!(!ch.is_running());
        assert!(!ch.tracker().is_running());
        assert_eq!(radio.duc(1).unwrap().tx_mask, 0);
        assert_eq!(radio.count_commands("DUC"), 2);

        // Second stop is a no-op.
        ch.stop().unwrap();
        assert_eq!(radio.count_commands("DUC"), 2);
    }

    #[test]
    fn start_pushes_transmitter_settings() {
        let radio = MockRadio::start(2, CAPACITY).unwrap();
        let cfg = ChannelConfig {
            transmitter: Some(TransmitterConfig {
                index: 1,
                frequency_hz: 2_400_000_000,
                attenuation_db: 10.0,
            }),
            ..config(100)
        };
        let ch = builder(&radio, cfg).build().unwrap();
        ch.start().unwrap();

        let tx = radio.with_state(|s| s.transmitters.get(&1).cloned()).unwrap();
        assert_eq!(tx.frequency_mhz, Some(2400.0));
        assert_eq!(tx.attenuation_db, Some(10.0));

        ch.set_tx_frequency(2_401_000_000).unwrap();
        let tx = radio.with_state(|s| s.transmitters.get(&1).cloned()).unwrap();
        assert_eq!(tx.frequency_mhz, Some(2401.0));
        ch.stop().unwrap();
    }

    #[test]
    fn transmitter_setters_need_transmitter() {
        let radio = MockRadio::start(2, CAPACITY).unwrap();
        let ch = builder(&radio, config(100)).build().unwrap();
        assert!(matches!(
            ch.set_tx_frequency(100_000_000),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            ch.set_tx_attenuation(3.0),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn send_samples_reaches_radio_buffer() {
        let radio = MockRadio::start(2, CAPACITY).unwrap();
        let ch = builder(&radio, config(100)).build().unwrap();
        ch.start().unwrap();

        for _ in 0..4 {
            assert_eq!(ch.send_samples(&block()).unwrap(), SPF);
        }
        assert_eq!(radio.duc(1).unwrap().free, CAPACITY - 4 * SPF as u32);
        assert!(ch.buffer_state().free <= CAPACITY - 4 * SPF as u32);
        ch.stop().unwrap();
    }

    #[test]
    fn send_after_stop_is_closed() {
        let radio = MockRadio::start(2, CAPACITY).unwrap();
        let ch = builder(&radio, config(100)).build().unwrap();
        assert!(matches!(ch.send_samples(&block()), Err(Error::StreamClosed)));
        ch.start().unwrap();
        ch.stop().unwrap();
        assert!(matches!(ch.send_samples(&block()), Err(Error::StreamClosed)));
    }

    #[test]
    fn live_setters_reconfigure_radio() {
        let radio = MockRadio::start(2, CAPACITY).unwrap();
        let ch = builder(&radio, config(100)).build().unwrap();

        // Stopped: stored only.
        ch.set_rate_index(3).unwrap();
        assert_eq!(radio.count_commands("DUC"), 0);

        ch.start().unwrap();
        assert_eq!(radio.duc(1).unwrap().rate_index, 3);
        ch.set_rate_index(5).unwrap();
        ch.set_attenuation(6.0).unwrap();
        ch.set_frequency(-25_000.0).unwrap();
        let duc = radio.duc(1).unwrap();
        assert_eq!(duc.rate_index, 5);
        assert_eq!(duc.attenuation_db, 6.0);
        assert_eq!(duc.frequency_hz, -25_000.0);
        ch.stop().unwrap();
    }

    #[test]
    fn invalid_settings_rejected() {
        let radio = MockRadio::start(2, CAPACITY).unwrap();
        let ch = builder(&radio, config(100)).build().unwrap();
        assert!(matches!(ch.set_rate_index(14), Err(Error::InvalidParameter(_))));
        assert!(matches!(ch.set_rate_index(17), Err(Error::InvalidParameter(_))));
        assert!(matches!(
            ch.set_tx_channel_mask(0b100),
            Err(Error::InvalidParameter(_))
        ));
        assert_eq!(ch.config().rate_index, 0);
    }

    #[test]
    fn stream_id_changes_only_while_stopped() {
        let radio = MockRadio::start(2, CAPACITY).unwrap();
        let ch = builder(&radio, config(100)).build().unwrap();
        ch.set_stream_id(200).unwrap();
        ch.start().unwrap();
        assert_eq!(radio.duc(1).unwrap().stream_id, 200);
        assert!(matches!(ch.set_stream_id(300), Err(Error::InvalidParameter(_))));
        assert_eq!(ch.stream_id(), 200);
        ch.stop().unwrap();
    }

    #[test]
    fn float_samples_are_scaled() {
        let radio = MockRadio::start(2, CAPACITY).unwrap();
        let commands = CommandChannel::connect(radio.addr()).unwrap();
        let capture = CaptureSink::new();
        let sink = capture.clone();
        let ch = ChannelBuilder::new(config(100))
            .model(models::custom(2, CAPACITY))
            .commands(commands)
            .feedback(false)
            .sink_factory(move |_| Ok(Box::new(sink.clone()) as Box<dyn FrameSink>))
            .build()
            .unwrap();
        ch.start().unwrap();

        let input = vec![Complex::new(0.5f32, -0.25f32); SPF];
        assert_eq!(ch.send_samples_f32(&input, 1000.0).unwrap(), SPF);

        let frames = capture.frames();
        let at = PAYLOAD_OFFSET - VRL_OFFSET;
        assert_eq!(&frames[0][at..at + 4], &[0x01, 0xF4, 0xFF, 0x06]);
        ch.stop().unwrap();
        assert!(capture.is_closed());
    }

    #[test]
    fn sink_failure_undoes_start() {
        let radio = MockRadio::start(2, CAPACITY).unwrap();
        let commands = CommandChannel::connect(radio.addr()).unwrap();
        let ch = ChannelBuilder::new(config(100))
            .model(models::custom(2, CAPACITY))
            .commands(commands)
            .feedback(false)
            .sink_factory(|_| Err(Error::Configuration("no sink".into())))
            .build()
            .unwrap();

        assert!(matches!(ch.start(), Err(Error::Configuration(_))));
        assert!(!ch.is_running());
        assert!(!ch.tracker().is_running());
        assert_eq!(radio.duc(1).unwrap().tx_mask, 0);
    }

    #[test]
    fn stop_completes_when_radio_is_gone() {
        let radio = MockRadio::start(2, CAPACITY).unwrap();
        let capture = CaptureSink::new();
        let sink = capture.clone();
        let commands = CommandChannel::connect(radio.addr()).unwrap();
        let ch = ChannelBuilder::new(config(100))
            .model(models::custom(2, CAPACITY))
            .commands(commands)
            .feedback(false)
            .tracker_options(TrackerOptions {
                poll_rate_hz: 0.1,
                ..TrackerOptions::default()
            })
            .sink_factory(move |_| Ok(Box::new(sink.clone()) as Box<dyn FrameSink>))
            .build()
            .unwrap();
        ch.start().unwrap();

        radio.disconnect_clients();
        std::thread::sleep(Duration::from_millis(100));

        assert!(ch.stop().is_err());
        assert!(!ch.is_running());
        assert!(!ch.tracker().is_running());
        assert!(capture.is_closed());
    }

    #[test]
    fn drop_disables_duc() {
        let radio = MockRadio::start(2, CAPACITY).unwrap();
        {
            let ch = builder(&radio, config(100)).build().unwrap();
            ch.start().unwrap();
            assert_eq!(radio.duc(1).unwrap().tx_mask, 1);
        }
        assert_eq!(radio.duc(1).unwrap().tx_mask, 0);
    }
}
