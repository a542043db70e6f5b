//! Transmit-buffer tracking and admission control for one DUC.
//!
//! The radio gives no per-frame acknowledgement, so the sender works from
//! an estimate of the DUC's free buffer space:
//!
//! - every frame sent debits the estimate immediately (optimistic);
//! - a background thread polls `DUCSTAT?` at a fixed cadence and replaces
//!   the estimate with the radio's figure (authoritative).
//!
//! Senders consult the estimate through [`BufferStatusTracker::admit`] or
//! block in [`BufferStatusTracker::wait_for_space`], which sleeps on a
//! condition variable with bounded exponential backoff. Each tracker has its
//! own lock, so channels never serialize each other.
//!
//! The poll thread is owned by the tracker: a crossbeam channel carries the
//! stop signal, and `stop()` (also run on drop) joins it.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use ductx_core::{Error, Result};

use crate::codec::{self, DUC_STATUS_FIELDS, DUC_STATUS_KEYWORD, DucStatus, UTC_KEYWORD};
use crate::command::CommandChannel;
use crate::feedback::FlowFeedbackPort;
use crate::frame::StatusReport;

/// Highest poll rate the radio tolerates.
pub const MAX_POLL_RATE_HZ: f64 = 20.0;

const DEFAULT_POLL_RATE_HZ: f64 = 20.0;
const DEFAULT_UTC_REFRESH_TICKS: u32 = 20;
const DEFAULT_BACKOFF_MIN: Duration = Duration::from_micros(500);
const DEFAULT_BACKOFF_MAX: Duration = Duration::from_millis(20);
/// Shortest sleep a blocked sender takes between checks.
const MIN_BACKOFF: Duration = Duration::from_micros(100);

/// Tracker tuning.
#[derive(Debug, Clone)]
pub struct TrackerOptions {
    /// Poll rate in Hz; capped at [`MAX_POLL_RATE_HZ`].
    pub poll_rate_hz: f64,
    /// Re-query UTC every this many successful polls (0 = only once).
    pub utc_refresh_ticks: u32,
    /// Samples held back from every resync, so the estimate never reaches
    /// the radio's last free sample.
    pub reserve_samples: u32,
    /// Backlog that marks the channel ready; `None` means half the buffer.
    pub prime_threshold: Option<u32>,
    /// First sleep of a blocked sender.
    pub backoff_min: Duration,
    /// Longest sleep of a blocked sender.
    pub backoff_max: Duration,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            poll_rate_hz: DEFAULT_POLL_RATE_HZ,
            utc_refresh_ticks: DEFAULT_UTC_REFRESH_TICKS,
            reserve_samples: 0,
            prime_threshold: None,
            backoff_min: DEFAULT_BACKOFF_MIN,
            backoff_max: DEFAULT_BACKOFF_MAX,
        }
    }
}

impl TrackerOptions {
    /// Interval between polls after applying the rate cap.
    pub fn poll_period(&self) -> Duration {
        let hz = if self.poll_rate_hz > 0.0 {
            self.poll_rate_hz.min(MAX_POLL_RATE_HZ)
        } else {
            DEFAULT_POLL_RATE_HZ
        };
        Duration::from_secs_f64(1.0 / hz)
    }

    /// First and longest sender sleep, floored at 100 µs and ordered.
    pub fn backoff_bounds(&self) -> (Duration, Duration) {
        let min = self.backoff_min.max(MIN_BACKOFF);
        (min, self.backoff_max.max(min))
    }
}

/// Snapshot of a DUC's tracked buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferState {
    /// Buffer depth in samples.
    pub capacity: u32,
    /// Estimated free space in samples, reserve already deducted.
    pub free: u32,
    /// Radio reported the buffer empty.
    pub empty: bool,
    /// Radio reported the buffer full.
    pub full: bool,
    /// Underrun reported by the last poll.
    pub underrun: bool,
    /// Total underruns reported by the radio.
    pub underrun_count: u32,
    /// Overrun reported by the last poll.
    pub overrun: bool,
    /// Total overruns reported by the radio.
    pub overrun_count: u32,
    /// When the last poll succeeded.
    pub last_poll: Option<Instant>,
    /// Radio UTC seconds from the last UTC query.
    pub utc_seconds: Option<u64>,
    /// Backlog has reached the prime threshold since the last start.
    pub ready: bool,
    /// The control link was up at the last exchange.
    pub link_up: bool,
    /// Successful polls since start.
    pub polls_ok: u64,
    /// Failed polls since start.
    pub polls_failed: u64,
}

impl BufferState {
    fn new(capacity: u32, reserve: u32) -> Self {
        Self {
            capacity,
            free: capacity.saturating_sub(reserve),
            empty: true,
            full: false,
            underrun: false,
            underrun_count: 0,
            overrun: false,
            overrun_count: 0,
            last_poll: None,
            utc_seconds: None,
            ready: false,
            link_up: true,
            polls_ok: 0,
            polls_failed: 0,
        }
    }

    /// Status frame payload for this state.
    pub fn report(&self, channel: u8) -> StatusReport {
        StatusReport {
            channel,
            empty: self.empty,
            full: self.full,
            underrun: self.underrun,
            overrun: self.overrun,
            free: self.free,
            underrun_count: self.underrun_count,
            overrun_count: self.overrun_count,
            utc_seconds: self.utc_seconds.unwrap_or(0) as u32,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BufferState,
    running: bool,
    prime_threshold: u32,
    reserve: u32,
}

impl Inner {
    fn backlog(&self) -> u32 {
        self.state
            .capacity
            .saturating_sub(self.state.free.saturating_add(self.reserve))
    }

    fn update_ready(&mut self) {
        if !self.state.ready && (self.state.full || self.backlog() >= self.prime_threshold) {
            self.state.ready = true;
        }
    }

    fn debit(&mut self, samples: u32) {
        self.state.free = self.state.free.saturating_sub(samples);
        self.state.empty = false;
        self.update_ready();
    }
}

#[derive(Debug)]
struct Shared {
    inner: Mutex<Inner>,
    space: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn resync(&self, status: &DucStatus) {
        let mut inner = self.lock();
        let reserve = inner.reserve;
        let s = &mut inner.state;
        s.free = status.free.min(s.capacity).saturating_sub(reserve);
        s.empty = status.empty;
        s.full = status.full;
        s.underrun = status.underrun;
        s.underrun_count = status.underrun_count;
        s.overrun = status.overrun;
        s.overrun_count = status.overrun_count;
        s.last_poll = Some(Instant::now());
        s.link_up = true;
        s.polls_ok += 1;
        inner.update_ready();
        drop(inner);
        self.space.notify_all();
    }

    /// Record a failed poll; returns true if the link just went down.
    fn poll_failed(&self, err: &Error) -> bool {
        let mut inner = self.lock();
        inner.state.polls_failed += 1;
        let went_down = err.is_link_down() && inner.state.link_up;
        if err.is_link_down() {
            inner.state.link_up = false;
        }
        drop(inner);
        if went_down {
            self.space.notify_all();
        }
        went_down
    }
}

/// Permission to send a number of samples.
///
/// Holds the channel's lock until it is committed or dropped, so no poll
/// can resync between the admission check and the debit.
#[must_use = "an admission does nothing unless committed"]
pub struct Admission<'a> {
    guard: MutexGuard<'a, Inner>,
    samples: u32,
}

impl Admission<'_> {
    /// Samples admitted.
    pub fn samples(&self) -> u32 {
        self.samples
    }

    /// Free space at admission time.
    pub fn free(&self) -> u32 {
        self.guard.state.free
    }

    /// Debit the admitted samples from the estimate.
    pub fn commit(mut self) {
        let n = self.samples;
        self.guard.debit(n);
    }
}

impl std::fmt::Debug for Admission<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission")
            .field("samples", &self.samples)
            .field("free", &self.guard.state.free)
            .finish()
    }
}

#[derive(Clone)]
struct Poller {
    shared: Arc<Shared>,
    commands: Arc<CommandChannel>,
    channel: u8,
    feedback: Option<Arc<FlowFeedbackPort>>,
    span: tracing::Span,
}

impl Poller {
    fn poll_status(&self) -> Result<DucStatus> {
        let fields = self.commands.query(
            &codec::cmd_duc_status(self.channel),
            DUC_STATUS_KEYWORD,
            DUC_STATUS_FIELDS,
        )?;
        let fields: Vec<&str> = fields.iter().map(String::as_str).collect();
        let status = codec::parse_duc_status(&fields)?;
        if status.channel != self.channel {
            return Err(Error::Protocol(format!(
                "DUCSTAT reply for DUC {}, expected {}",
                status.channel, self.channel
            )));
        }
        Ok(status)
    }

    fn poll_utc(&self) -> Result<u64> {
        let fields = self.commands.query(&codec::cmd_utc(), UTC_KEYWORD, 1)?;
        fields[0]
            .parse()
            .map_err(|_| Error::Protocol(format!("invalid UTC seconds: {}", fields[0])))
    }

    /// Poll once and resync. Failures are recorded, not retried.
    fn poll_and_resync(&self) -> Result<DucStatus> {
        match self.poll_status() {
            Ok(status) => {
                self.shared.resync(&status);
                Ok(status)
            }
            Err(e) => {
                if self.shared.poll_failed(&e) {
                    tracing::error!(parent: &self.span, error = %e, "Control link down, gating sends");
                } else {
                    tracing::warn!(parent: &self.span, error = %e, "Buffer status poll failed");
                }
                Err(e)
            }
        }
    }

    fn refresh_utc(&self) -> bool {
        match self.poll_utc() {
            Ok(secs) => {
                self.shared.lock().state.utc_seconds = Some(secs);
                true
            }
            Err(e) => {
                tracing::debug!(parent: &self.span, error = %e, "UTC query failed");
                false
            }
        }
    }

    fn publish(&self) {
        if let Some(port) = &self.feedback {
            let report = self.shared.lock().state.report(self.channel);
            port.publish(&report);
        }
    }

    fn run(self, stop: Receiver<()>, period: Duration, utc_refresh_ticks: u32) {
        let span = self.span.clone();
        let _enter = span.enter();
        tracing::debug!(period_ms = period.as_millis() as u64, "Poll thread started");

        let mut utc_pending = true;
        let mut since_utc = 0u32;
        loop {
            match stop.recv_timeout(period) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }

            if self.poll_and_resync().is_err() {
                continue;
            }
            since_utc = since_utc.saturating_add(1);
            let refresh = utc_refresh_ticks > 0 && since_utc >= utc_refresh_ticks;
            if (utc_pending || refresh) && self.refresh_utc() {
                utc_pending = false;
                since_utc = 0;
            }
            self.publish();
        }

        tracing::debug!("Poll thread stopped");
    }
}

struct Worker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Buffer estimate, poll thread and admission gate for one DUC.
pub struct BufferStatusTracker {
    poller: Poller,
    options: TrackerOptions,
    capacity: u32,
    worker: Mutex<Option<Worker>>,
}

impl BufferStatusTracker {
    /// Create a stopped tracker for `channel` with a buffer of `capacity`
    /// samples.
    pub fn new(
        channel: u8,
        commands: Arc<CommandChannel>,
        capacity: u32,
        options: TrackerOptions,
    ) -> Self {
        let reserve = options.reserve_samples.min(capacity);
        let prime_threshold = options.prime_threshold.unwrap_or(capacity / 2);
        let inner = Inner {
            state: BufferState::new(capacity, reserve),
            running: false,
            prime_threshold,
            reserve,
        };
        Self {
            poller: Poller {
                shared: Arc::new(Shared {
                    inner: Mutex::new(inner),
                    space: Condvar::new(),
                }),
                commands,
                channel,
                feedback: None,
                span: tracing::debug_span!("tracker", channel),
            },
            options,
            capacity,
            worker: Mutex::new(None),
        }
    }

    /// Broadcast state through `port` after every successful poll.
    pub fn with_feedback(mut self, port: FlowFeedbackPort) -> Self {
        self.poller.feedback = Some(Arc::new(port));
        self
    }

    /// Log under `span` instead of the default tracker span.
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.poller.span = span;
        self
    }

    /// DUC index.
    pub fn channel(&self) -> u8 {
        self.poller.channel
    }

    /// Buffer depth in samples.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Reset the estimate, poll once synchronously and start the poll
    /// thread. Does nothing if already running.
    ///
    /// A failed initial poll is logged and leaves the full-buffer estimate
    /// in place; a thread that cannot be spawned is a resource error.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.is_some() {
            return Ok(());
        }

        {
            let mut inner = self.poller.shared.lock();
            let reserve = inner.reserve;
            inner.state = BufferState::new(self.capacity, reserve);
            inner.state.link_up = self.poller.commands.is_connected();
            inner.running = true;
        }

        let _ = self.poller.poll_and_resync();

        let (stop_tx, stop_rx) = channel::bounded(1);
        let poller = self.poller.clone();
        let period = self.options.poll_period();
        let utc_refresh = self.options.utc_refresh_ticks;
        let handle = thread::Builder::new()
            .name(format!("ductx-poll-{}", self.poller.channel))
            .spawn(move || poller.run(stop_rx, period, utc_refresh))
            .map_err(|source| {
                self.poller.shared.lock().running = false;
                Error::Resource {
                    resource: format!("poll thread for DUC {}", self.poller.channel),
                    source,
                }
            })?;

        *worker = Some(Worker {
            stop: stop_tx,
            handle,
        });
        tracing::debug!(parent: &self.poller.span, "Tracker started");
        Ok(())
    }

    /// Stop the poll thread and wake every blocked sender, which then sees
    /// [`Error::StreamClosed`]. Safe to call repeatedly.
    pub fn stop(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        self.poller.shared.lock().running = false;
        self.poller.shared.space.notify_all();

        if let Some(worker) = worker {
            let _ = worker.stop.send(());
            if worker.handle.join().is_err() {
                tracing::error!(parent: &self.poller.span, "Poll thread panicked");
            }
            tracing::debug!(parent: &self.poller.span, "Tracker stopped");
        }
    }

    /// Whether the poll thread is running.
    pub fn is_running(&self) -> bool {
        self.poller.shared.lock().running
    }

    /// True iff the tracker is running, the link is up and more than
    /// `samples` are free.
    pub fn ok_to_send(&self, samples: u32) -> bool {
        let inner = self.poller.shared.lock();
        inner.running && inner.state.link_up && inner.state.free > samples
    }

    /// Like [`ok_to_send`](Self::ok_to_send), but on success keeps the lock
    /// so the caller can [`commit`](Admission::commit) the debit atomically.
    pub fn admit(&self, samples: u32) -> Option<Admission<'_>> {
        let guard = self.poller.shared.lock();
        if guard.running && guard.state.link_up && guard.state.free > samples {
            Some(Admission { guard, samples })
        } else {
            None
        }
    }

    /// Block until `samples` can be admitted.
    ///
    /// Sleeps on the channel's condition variable between checks, doubling
    /// the sleep from `backoff_min` up to `backoff_max`. Fails with
    /// [`Error::Timeout`] after `timeout`, [`Error::NotConnected`] as soon
    /// as the link is known to be down, and [`Error::StreamClosed`] once
    /// the tracker is stopped.
    pub fn wait_for_space(&self, samples: u32, timeout: Duration) -> Result<Admission<'_>> {
        let deadline = Instant::now() + timeout;
        let (mut backoff, backoff_max) = self.options.backoff_bounds();
        let mut guard = self.poller.shared.lock();
        loop {
            if !guard.running {
                return Err(Error::StreamClosed);
            }
            if !guard.state.link_up {
                return Err(Error::NotConnected);
            }
            if guard.state.free > samples {
                return Ok(Admission { guard, samples });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            let wait = backoff.min(deadline - now);
            guard = match self.poller.shared.space.wait_timeout(guard, wait) {
                Ok((g, _)) => g,
                Err(e) => e.into_inner().0,
            };
            backoff = (backoff * 2).min(backoff_max);
        }
    }

    /// Debit `samples` from the estimate after a send.
    pub fn sent_n_samples(&self, samples: u32) {
        self.poller.shared.lock().debit(samples);
    }

    /// Resync from an externally obtained status reply.
    pub fn apply_status(&self, status: &DucStatus) {
        self.poller.shared.resync(status);
    }

    /// Poll the radio now, on the caller's thread.
    pub fn poll_now(&self) -> Result<DucStatus> {
        self.poller.poll_and_resync()
    }

    /// Copy of the tracked state.
    pub fn snapshot(&self) -> BufferState {
        self.poller.shared.lock().state.clone()
    }

    /// Whether the backlog has reached the prime threshold since start.
    pub fn is_ready(&self) -> bool {
        self.poller.shared.lock().state.ready
    }

    /// Backlog that marks the channel ready.
    pub fn prime_threshold(&self) -> u32 {
        self.poller.shared.lock().prime_threshold
    }

    /// Change the backlog that marks the channel ready.
    pub fn set_prime_threshold(&self, samples: u32) {
        let mut inner = self.poller.shared.lock();
        inner.prime_threshold = samples;
        inner.update_ready();
    }
}

impl Drop for BufferStatusTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for BufferStatusTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferStatusTracker")
            .field("channel", &self.poller.channel)
            .field("capacity", &self.capacity)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
