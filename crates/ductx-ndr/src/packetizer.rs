//! Per-channel frame builder and sender.
//!
//! [`FramePacketizer`] turns one fixed-size block of samples into one frame,
//! waits for the channel's [`BufferStatusTracker`] to admit it, and hands the
//! UDP payload to a [`FrameSink`]. The admission is committed only after the
//! sink accepted the frame, so a failed send never debits the estimate or
//! advances the counters.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use ductx_core::{Error, FrameSink, IqSample, Result};

use crate::frame::{self, FrameCounters, FrameLayout};
use crate::tracker::{Admission, BufferStatusTracker};

/// Default limit on how long a blocking send waits for buffer space.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Builds and sends frames for one DUC.
pub struct FramePacketizer {
    layout: FrameLayout,
    counters: FrameCounters,
    tracker: Arc<BufferStatusTracker>,
    sink: Option<Box<dyn FrameSink>>,
    buf: BytesMut,
    send_timeout: Duration,
    frames_sent: u64,
    span: tracing::Span,
}

impl FramePacketizer {
    pub fn new(layout: FrameLayout, tracker: Arc<BufferStatusTracker>) -> Self {
        let buf = BytesMut::with_capacity(layout.frame_len());
        Self {
            layout,
            counters: FrameCounters::new(),
            tracker,
            sink: None,
            buf,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            frames_sent: 0,
            span: tracing::Span::none(),
        }
    }

    /// Limit on how long [`send_frame`](Self::send_frame) waits for space.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    /// Attach a sink and restart the counters.
    pub fn open(&mut self, sink: Box<dyn FrameSink>) {
        if let Some(mut old) = self.sink.replace(sink) {
            old.close();
        }
        self.counters = FrameCounters::new();
        tracing::debug!(parent: &self.span, frame_len = self.layout.frame_len(), "Packetizer open");
    }

    /// Close and drop the sink. Later sends fail with [`Error::StreamClosed`].
    pub fn close(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            sink.close();
            tracing::debug!(parent: &self.span, frames = self.frames_sent, "Packetizer closed");
        }
    }

    pub fn is_open(&self) -> bool {
        self.sink.is_some()
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    /// Replace the header template, e.g. after the stream id changed.
    pub fn set_layout(&mut self, layout: FrameLayout) {
        self.buf.reserve(layout.frame_len());
        self.layout = layout;
        self.counters = FrameCounters::new();
    }

    /// Counters the next frame will carry.
    pub fn counters(&self) -> FrameCounters {
        self.counters
    }

    /// Frames sent since construction.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Send one block, waiting up to the send timeout for admission.
    ///
    /// Returns the number of samples sent. A block that is not exactly one
    /// frame long is a [`Error::Configuration`] error.
    pub fn send_frame(&mut self, samples: &[IqSample]) -> Result<usize> {
        self.prepare(samples)?;
        let tracker = Arc::clone(&self.tracker);
        let admission = tracker
            .wait_for_space(samples.len() as u32, self.send_timeout)
            .inspect_err(|e| {
                tracing::debug!(parent: &self.span, error = %e, "Send not admitted");
            })?;
        self.emit(admission)
    }

    /// Send one block only if it can be admitted right now; returns `Ok(0)`
    /// when the gate denies.
    pub fn try_send_frame(&mut self, samples: &[IqSample]) -> Result<usize> {
        self.prepare(samples)?;
        let tracker = Arc::clone(&self.tracker);
        match tracker.admit(samples.len() as u32) {
            Some(admission) => self.emit(admission),
            None => Ok(0),
        }
    }

    fn prepare(&mut self, samples: &[IqSample]) -> Result<()> {
        if self.sink.is_none() {
            return Err(Error::StreamClosed);
        }
        frame::build_frame(&self.layout, self.counters, samples, &mut self.buf)
    }

    fn emit(&mut self, admission: Admission<'_>) -> Result<usize> {
        let sink = self.sink.as_mut().ok_or(Error::StreamClosed)?;
        let payload = &self.buf[self.layout.udp_payload_range()];
        if let Err(e) = sink.send_frame(payload) {
            tracing::warn!(parent: &self.span, error = %e, "Frame send failed");
            return Err(e);
        }
        let sent = admission.samples() as usize;
        admission.commit();
        self.counters.increment();
        self.frames_sent += 1;
        tracing::trace!(
            parent: &self.span,
            frame = self.counters.frame(),
            samples = sent,
            "Frame sent"
        );
        Ok(sent)
    }
}

impl std::fmt::Debug for FramePacketizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePacketizer")
            .field("stream_id", &self.layout.stream_id())
            .field("counters", &self.counters)
            .field("open", &self.sink.is_some())
            .field("frames_sent", &self.frames_sent)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DucStatus;
    use crate::command::{CommandChannel, CommandOptions};
    use crate::frame::{FrameFormat, VRL_MAGIC, VRL_TRAILER};
    use crate::tracker::TrackerOptions;
    use ductx_core::ChannelConfig;
    use ductx_test_harness::{CaptureSink, MockTransport};

    const SPF: usize = 1024;

    fn running_tracker(free: u32) -> Arc<BufferStatusTracker> {
        tracker_from_reply(&format!("DUCSTAT 1, 0, 0, {}, 0, 0, 0, 0\n", free))
    }

    fn tracker_from_reply(reply: &str) -> Arc<BufferStatusTracker> {
        let mut mock = MockTransport::new();
        mock.expect(b"DUCSTAT? 1\n", reply.as_bytes());
        let commands = CommandChannel::from_transport(Box::new(mock), CommandOptions::default());
        let options = TrackerOptions {
            poll_rate_hz: 0.1,
            ..TrackerOptions::default()
        };
        let tracker = Arc::new(BufferStatusTracker::new(1, commands, 1 << 20, options));
        tracker.start().unwrap();
        tracker
    }

    fn packetizer(free: u32) -> (FramePacketizer, CaptureSink, Arc<BufferStatusTracker>) {
        packetizer_on(running_tracker(free))
    }

    fn packetizer_on(
        tracker: Arc<BufferStatusTracker>,
    ) -> (FramePacketizer, CaptureSink, Arc<BufferStatusTracker>) {
        let config = ChannelConfig {
            stream_id: 100,
            ..ChannelConfig::default()
        };
        let layout = FrameLayout::new(&config, FrameFormat::default()).unwrap();
        let capture = CaptureSink::new();
        let mut p = FramePacketizer::new(layout, Arc::clone(&tracker))
            .with_send_timeout(Duration::from_millis(50));
        p.open(Box::new(capture.clone()));
        (p, capture, tracker)
    }

    fn block(value: i16) -> Vec<IqSample> {
        vec![IqSample::new(value, -value); SPF]
    }

    fn word(frame: &[u8], index: usize) -> u32 {
        u32::from_be_bytes(frame[4 * index..4 * index + 4].try_into().unwrap())
    }

    #[test]
    fn sends_udp_payload_and_debits() {
        let (mut p, capture, tracker) = packetizer(8192);
        assert_eq!(p.send_frame(&block(1)).unwrap(), SPF);
        assert_eq!(p.send_frame(&block(2)).unwrap(), SPF);

        let frames = capture.frames();
        assert_eq!(frames.len(), 2);
        let range = p.layout().udp_payload_range();
        assert_eq!(frames[0].len(), range.end - range.start);
        assert_eq!(word(&frames[0], 0), VRL_MAGIC);
        assert_eq!(word(&frames[0], 1) >> 20, 0);
        assert_eq!(word(&frames[1], 1) >> 20, 1);
        assert_eq!(word(&frames[0], 3), 100);
        assert_eq!(*frames[1].last().unwrap(), (VRL_TRAILER & 0xFF) as u8);

        assert_eq!(tracker.snapshot().free, 8192 - 2 * SPF as u32);
        assert_eq!(p.frames_sent(), 2);
        assert_eq!(p.counters().frame(), 2);
        tracker.stop();
    }

    #[test]
    fn wrong_block_size_rejected() {
        let (mut p, capture, tracker) = packetizer(8192);
        let short = vec![IqSample::new(0, 0); SPF - 1];
        assert!(matches!(p.send_frame(&short), Err(Error::Configuration(_))));
        assert!(matches!(p.try_send_frame(&[]), Err(Error::Configuration(_))));
        assert_eq!(capture.frame_count(), 0);
        assert_eq!(tracker.snapshot().free, 8192);
        tracker.stop();
    }

    #[test]
    fn try_send_denied_returns_zero() {
        let (mut p, capture, tracker) = packetizer(SPF as u32);
        // free == block size is not enough.
        assert_eq!(p.try_send_frame(&block(1)).unwrap(), 0);
        assert_eq!(capture.frame_count(), 0);
        assert_eq!(p.counters().frame(), 0);
        tracker.stop();
    }

    #[test]
    fn blocking_send_times_out() {
        let (mut p, capture, tracker) = packetizer(0);
        assert!(matches!(p.send_frame(&block(1)), Err(Error::Timeout)));
        assert_eq!(capture.frame_count(), 0);
        tracker.stop();
    }

    #[test]
    fn empty_zero_free_blocks_until_resync() {
        let tracker = tracker_from_reply("DUCSTAT 1, 1, 0, 0, 0, 0, 0, 0\n");
        let (p, capture, tracker) = packetizer_on(tracker);
        let mut p = p.with_send_timeout(Duration::from_secs(5));
        assert_eq!(tracker.snapshot().free, 0);
        assert!(tracker.snapshot().empty);

        let sender = std::thread::spawn(move || {
            let n = p.send_frame(&block(3));
            (n, p)
        });

        std::thread::sleep(Duration::from_millis(100));
        assert!(!sender.is_finished(), "send returned before space was reported");
        assert_eq!(capture.frame_count(), 0);

        tracker.apply_status(&DucStatus {
            channel: 1,
            empty: true,
            full: false,
            free: 8192,
            underrun: false,
            underrun_count: 0,
            overrun: false,
            overrun_count: 0,
        });
        let (n, p) = sender.join().unwrap();
        assert_eq!(n.unwrap(), SPF);
        assert_eq!(capture.frame_count(), 1);
        assert_eq!(p.frames_sent(), 1);
        assert_eq!(tracker.snapshot().free, 8192 - SPF as u32);
        tracker.stop();
    }

    #[test]
    fn sink_failure_keeps_estimate_and_counters() {
        let (mut p, capture, tracker) = packetizer(8192);
        capture.set_failing(true);
        assert!(p.send_frame(&block(1)).is_err());
        assert_eq!(tracker.snapshot().free, 8192);
        assert_eq!(p.counters(), FrameCounters::new());

        capture.set_failing(false);
        assert_eq!(p.send_frame(&block(1)).unwrap(), SPF);
        tracker.stop();
    }

    #[test]
    fn closed_packetizer_refuses() {
        let (mut p, capture, tracker) = packetizer(8192);
        p.close();
        assert!(capture.is_closed());
        assert!(!p.is_open());
        assert!(matches!(p.send_frame(&block(1)), Err(Error::StreamClosed)));
        tracker.stop();
    }

    #[test]
    fn stopped_tracker_closes_stream() {
        let (mut p, _capture, tracker) = packetizer(8192);
        tracker.stop();
        assert!(matches!(p.send_frame(&block(1)), Err(Error::StreamClosed)));
        assert_eq!(p.try_send_frame(&block(1)).unwrap(), 0);
    }
}
