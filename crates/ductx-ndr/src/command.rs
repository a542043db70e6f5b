//! Command channel to the radio's control port.
//!
//! [`CommandChannel`] owns the single TCP connection the radio accepts and
//! serializes every exchange on it: the mutex is held from the moment a
//! command is written until its reply has settled, so a buffer-status poll
//! and a configuration call can never interleave on the wire.
//!
//! Replies carry no terminator. [`execute`](CommandChannel::execute) and
//! [`query`](CommandChannel::query) finish as soon as the line they are
//! waiting for has arrived. Raw exchanges are complete once no new bytes
//! arrive within a short settle window after the first byte.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use ductx_core::error::{Error, Result};
use ductx_core::transport::Transport;
use ductx_transport::TcpTransport;

use crate::codec;

/// Default radio control port.
pub const DEFAULT_CONTROL_PORT: u16 = 8617;

/// Default time to wait for the first byte of a reply.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

/// Default quiet period that ends a reply.
const DEFAULT_SETTLE: Duration = Duration::from_millis(20);

/// Default TCP connect timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Options for the command channel.
#[derive(Debug, Clone)]
pub struct CommandOptions {
    /// Time to wait for a reply to begin.
    pub command_timeout: Duration,
    /// Quiet period after the last received byte that ends a reply.
    pub settle: Duration,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            settle: DEFAULT_SETTLE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Serialized command/response channel to one radio.
///
/// Shared between channel controllers, group controllers and poll threads
/// as an `Arc<CommandChannel>`. When the link drops the transport is
/// discarded and every later call fails with [`Error::NotConnected`].
pub struct CommandChannel {
    transport: Mutex<Option<Box<dyn Transport>>>,
    /// Set when an exchange may have left reply bytes on the socket.
    stale: AtomicBool,
    options: CommandOptions,
    peer: String,
    span: tracing::Span,
}

impl CommandChannel {
    /// Connect to a radio control port (`host:port`) with default options.
    pub fn connect(addr: &str) -> Result<Arc<Self>> {
        Self::connect_with_options(addr, CommandOptions::default())
    }

    /// Connect with custom options.
    pub fn connect_with_options(addr: &str, options: CommandOptions) -> Result<Arc<Self>> {
        tracing::debug!(addr = %addr, "Connecting command channel");
        let transport = TcpTransport::connect_with_timeout(addr, options.connect_timeout)?;
        Ok(Arc::new(Self::with_peer(
            Box::new(transport),
            options,
            addr.to_string(),
        )))
    }

    /// Build a channel over an existing transport, e.g. a mock in tests.
    pub fn from_transport(transport: Box<dyn Transport>, options: CommandOptions) -> Arc<Self> {
        Arc::new(Self::with_peer(transport, options, "custom".to_string()))
    }

    fn with_peer(transport: Box<dyn Transport>, options: CommandOptions, peer: String) -> Self {
        let span = tracing::debug_span!("ndr_cmd", peer = %peer);
        Self {
            transport: Mutex::new(Some(transport)),
            stale: AtomicBool::new(false),
            options,
            peer,
            span,
        }
    }

    /// The configured reply timeout.
    pub fn command_timeout(&self) -> Duration {
        self.options.command_timeout
    }

    /// Address or label of the radio end.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Whether the control link is up.
    pub fn is_connected(&self) -> bool {
        self.lock()
            .as_ref()
            .map(|t| t.is_connected())
            .unwrap_or(false)
    }

    /// Write one command line.
    ///
    /// Any reply is left on the socket for [`await_response`](Self::await_response).
    pub fn send_command(&self, text: &str) -> Result<()> {
        let mut guard = self.lock();
        self.write_line(&mut guard, text)?;
        self.stale.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Collect reply lines until the reply settles or `timeout` expires
    /// with nothing received.
    pub fn await_response(&self, timeout: Duration) -> Result<Vec<String>> {
        let mut guard = self.lock();
        let lines = self.read_reply(&mut guard, timeout)?;
        self.stale.store(false, Ordering::Relaxed);
        Ok(lines)
    }

    /// Send a command and collect its reply as one exchange.
    pub fn send_command_and_await_response(
        &self,
        text: &str,
        timeout: Duration,
    ) -> Result<Vec<String>> {
        self.exchange(text, timeout, |_| false)
    }

    /// Send a set command and require an `OK`.
    ///
    /// Returns as soon as an `OK` or `ERROR` line has arrived.
    pub fn execute(&self, command: &str) -> Result<()> {
        let lines = self.exchange(command, self.options.command_timeout, |line| {
            line == "OK" || line.starts_with("ERROR")
        })?;
        codec::check_ack(command, &lines).inspect_err(|e| {
            tracing::warn!(parent: &self.span, command = %command, error = %e, "Command failed");
        })
    }

    /// Send a query and return the fields of the reply line led by
    /// `keyword`, which must carry exactly `field_count` fields.
    ///
    /// Returns as soon as the `keyword` line or an `ERROR` line has arrived.
    pub fn query(&self, command: &str, keyword: &str, field_count: usize) -> Result<Vec<String>> {
        let lines = self.exchange(command, self.options.command_timeout, |line| {
            line.starts_with("ERROR") || line.split_whitespace().next() == Some(keyword)
        })?;
        if let Some(err) = codec::find_error(&lines) {
            return Err(Error::Protocol(format!("{} rejected: {}", keyword, err)));
        }
        let line = codec::find_reply(&lines, keyword)
            .ok_or_else(|| Error::Protocol(format!("no {} line in reply", keyword)))?;
        let fields = codec::split_fields(line, keyword, field_count)?;
        Ok(fields.into_iter().map(str::to_string).collect())
    }

    /// Close the control connection. Later calls fail with
    /// [`Error::NotConnected`].
    pub fn close(&self) -> Result<()> {
        let mut guard = self.lock();
        if let Some(mut transport) = guard.take() {
            tracing::debug!(parent: &self.span, "Closing command channel");
            transport.close()?;
        }
        Ok(())
    }

    /// One locked write-and-read. The reply ends early once a complete line
    /// satisfies `done`, otherwise when it settles.
    fn exchange(
        &self,
        text: &str,
        timeout: Duration,
        done: impl Fn(&str) -> bool,
    ) -> Result<Vec<String>> {
        let mut guard = self.lock();
        if self.stale.swap(false, Ordering::Relaxed) {
            self.discard_stale(&mut guard);
        }
        self.write_line(&mut guard, text)?;
        self.read_reply_until(&mut guard, timeout, done)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Box<dyn Transport>>> {
        self.transport.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write_line(&self, guard: &mut Option<Box<dyn Transport>>, text: &str) -> Result<()> {
        let transport = guard.as_mut().ok_or(Error::NotConnected)?;
        tracing::trace!(parent: &self.span, command = %text, "Sending command");
        let mut line = Vec::with_capacity(text.len() + 1);
        line.extend_from_slice(text.as_bytes());
        line.push(b'\n');
        let result = transport.send(&line);
        self.note_link(guard, result)
    }

    fn read_reply(
        &self,
        guard: &mut Option<Box<dyn Transport>>,
        timeout: Duration,
    ) -> Result<Vec<String>> {
        self.read_reply_until(guard, timeout, |_| false)
    }

    fn read_reply_until(
        &self,
        guard: &mut Option<Box<dyn Transport>>,
        timeout: Duration,
        done: impl Fn(&str) -> bool,
    ) -> Result<Vec<String>> {
        let deadline = Instant::now() + timeout;
        let mut data: Vec<u8> = Vec::new();
        let mut buf = [0u8; 1024];

        loop {
            let now = Instant::now();
            let wait = if data.is_empty() {
                if now >= deadline {
                    self.stale.store(true, Ordering::Relaxed);
                    return Err(Error::Timeout);
                }
                deadline - now
            } else {
                self.options.settle
            };

            let transport = guard.as_mut().ok_or(Error::NotConnected)?;
            match transport.receive(&mut buf, wait) {
                Ok(n) => {
                    let scanned = data.len();
                    data.extend_from_slice(&buf[..n]);
                    if completes(&data, scanned, &done) {
                        // Anything after the last newline belongs to no line yet.
                        if data.last() != Some(&b'\n') {
                            self.stale.store(true, Ordering::Relaxed);
                        }
                        break;
                    }
                }
                Err(Error::Timeout) if !data.is_empty() => break,
                Err(Error::Timeout) => {
                    if Instant::now() >= deadline {
                        self.stale.store(true, Ordering::Relaxed);
                        return Err(Error::Timeout);
                    }
                }
                Err(e) => return self.note_link(guard, Err(e)),
            }
        }

        let lines: Vec<String> = String::from_utf8_lossy(&data)
            .lines()
            .map(|l| l.trim_end_matches('\r').to_string())
            .filter(|l| !l.is_empty())
            .collect();
        tracing::trace!(parent: &self.span, lines = lines.len(), "Reply received");
        Ok(lines)
    }

    /// Drop bytes left over from an earlier exchange that timed out.
    fn discard_stale(&self, guard: &mut Option<Box<dyn Transport>>) {
        let Some(transport) = guard.as_mut() else {
            return;
        };
        let mut buf = [0u8; 1024];
        let mut dropped = 0usize;
        while let Ok(n) = transport.receive(&mut buf, Duration::ZERO) {
            dropped += n;
        }
        if dropped > 0 {
            tracing::debug!(parent: &self.span, bytes = dropped, "Discarded stale reply data");
        }
    }

    /// Drop the transport if `result` says the link is gone.
    fn note_link<T>(&self, guard: &mut Option<Box<dyn Transport>>, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_link_down() {
                tracing::error!(parent: &self.span, error = %e, "Control link lost");
                if let Some(mut transport) = guard.take() {
                    let _ = transport.close();
                }
            }
        }
        result
    }
}

/// Whether a complete line that starts at or after `scanned`'s line
/// satisfies `done`.
fn completes(data: &[u8], scanned: usize, done: &impl Fn(&str) -> bool) -> bool {
    let start = data[..scanned]
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |i| i + 1);
    let Some(end) = data.iter().rposition(|&b| b == b'\n') else {
        return false;
    };
    if end < start {
        return false;
    }
    String::from_utf8_lossy(&data[start..end])
        .lines()
        .map(|l| l.trim())
        .any(|l| done(l))
}

impl std::fmt::Debug for CommandChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandChannel")
            .field("peer", &self.peer)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{BufferStatusTracker, TrackerOptions};
    use ductx_test_harness::{MockRadio, MockTransport};

    fn mock_channel(mock: MockTransport) -> Arc<CommandChannel> {
        CommandChannel::from_transport(Box::new(mock), CommandOptions::default())
    }

    #[test]
    fn exchange_collects_lines() {
        let mut mock = MockTransport::new();
        mock.expect(b"DUCSTAT? 1\n", b"OK\r\nDUCSTAT 1, 1, 0, 4096, 0, 0, 0, 0\n");
        let ch = mock_channel(mock);

        let lines = ch
            .send_command_and_await_response("DUCSTAT? 1", Duration::from_millis(100))
            .unwrap();
        assert_eq!(lines, vec!["OK", "DUCSTAT 1, 1, 0, 4096, 0, 0, 0, 0"]);
    }

    #[test]
    fn split_send_and_await() {
        let mut mock = MockTransport::new();
        mock.expect(b"UTC?\n", b"UTC 5\n");
        let ch = mock_channel(mock);

        ch.send_command("UTC?").unwrap();
        assert_eq!(ch.await_response(Duration::from_millis(50)).unwrap(), vec!["UTC 5"]);
    }

    #[test]
    fn no_reply_times_out() {
        let mut mock = MockTransport::new();
        mock.expect(b"UTC?\n", b"");
        let ch = mock_channel(mock);

        let start = Instant::now();
        let err = ch
            .send_command_and_await_response("UTC?", Duration::from_millis(30))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(30));
        // A timeout leaves the link up.
        assert!(ch.is_connected());
    }

    #[test]
    fn execute_ok_and_error() {
        let mut mock = MockTransport::new();
        mock.expect(b"DUCGE 1, 1\n", b"OK\n");
        mock.expect(b"DUCGE 9, 1\n", b"ERROR: bad group\n");
        let ch = mock_channel(mock);

        ch.execute("DUCGE 1, 1").unwrap();
        let err = ch.execute("DUCGE 9, 1").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(err.to_string().contains("bad group"));
    }

    #[test]
    fn query_requires_exact_fields() {
        let mut mock = MockTransport::new();
        mock.expect(b"UTC?\n", b"UTC 1700000000\n");
        mock.expect(b"UTC?\n", b"UTC 1, 2\n");
        mock.expect(b"UTC?\n", b"ERROR: busy\n");
        let ch = mock_channel(mock);

        assert_eq!(ch.query("UTC?", "UTC", 1).unwrap(), vec!["1700000000"]);
        assert!(matches!(ch.query("UTC?", "UTC", 1), Err(Error::Protocol(_))));
        assert!(matches!(ch.query("UTC?", "UTC", 1), Err(Error::Protocol(_))));
    }

    #[test]
    fn not_connected_is_reported() {
        let mut mock = MockTransport::new();
        mock.set_connected(false);
        let ch = mock_channel(mock);

        assert!(!ch.is_connected());
        assert!(matches!(ch.send_command("UTC?"), Err(Error::NotConnected)));
        assert!(matches!(ch.execute("UTC?"), Err(Error::NotConnected)));
    }

    #[test]
    fn link_loss_drops_transport() {
        let mut mock = MockTransport::new();
        mock.expect_disconnect(b"DUCSTAT? 1\n");
        let ch = mock_channel(mock);

        let err = ch
            .send_command_and_await_response("DUCSTAT? 1", Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionLost));
        assert!(!ch.is_connected());
        assert!(matches!(ch.execute("UTC?"), Err(Error::NotConnected)));
    }

    #[test]
    fn close_then_not_connected() {
        let ch = mock_channel(MockTransport::new());
        ch.close().unwrap();
        assert!(!ch.is_connected());
        assert!(matches!(ch.send_command("UTC?"), Err(Error::NotConnected)));
    }

    #[test]
    fn tcp_round_trip_against_mock_radio() {
        let radio = MockRadio::start(1, 4096).unwrap();
        let ch = CommandChannel::connect(radio.addr()).unwrap();

        ch.execute("DUC 1, 1, 0, 0, 0, 1, 0, 100").unwrap();
        let fields = ch.query("DUCSTAT? 1", "DUCSTAT", 8).unwrap();
        assert_eq!(fields[3], "4096");
        assert_eq!(radio.duc(1).unwrap().stream_id, 100);
    }

    #[test]
    fn execute_and_query_return_before_settle() {
        let radio = MockRadio::start(1, 4096).unwrap();
        let options = CommandOptions {
            settle: Duration::from_millis(300),
            ..CommandOptions::default()
        };
        let ch = CommandChannel::connect_with_options(radio.addr(), options).unwrap();

        let start = Instant::now();
        ch.execute("DUC 1, 1, 0, 0, 0, 1, 0, 100").unwrap();
        ch.query("DUCSTAT? 1", "DUCSTAT", 8).unwrap();
        ch.query("UTC?", "UTC", 1).unwrap();
        assert!(
            start.elapsed() < Duration::from_millis(300),
            "took {:?}",
            start.elapsed()
        );

        // Raw exchanges still wait for the reply to settle.
        let start = Instant::now();
        ch.send_command_and_await_response("UTC?", Duration::from_millis(500))
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[test]
    fn trailing_fragment_does_not_break_next_exchange() {
        let mut mock = MockTransport::new();
        mock.expect(b"DUCGE 1, 1\n", b"OK\nDUCS");
        mock.expect(b"UTC?\n", b"UTC 7\n");
        let ch = mock_channel(mock);

        ch.execute("DUCGE 1, 1").unwrap();
        assert_eq!(ch.query("UTC?", "UTC", 1).unwrap(), vec!["7"]);
    }

    #[test]
    fn shared_link_keeps_poll_cadence() {
        let radio = MockRadio::start(8, 1 << 20).unwrap();
        let ch = CommandChannel::connect(radio.addr()).unwrap();
        let trackers: Vec<_> = (1..=8u8)
            .map(|duc| {
                let t = BufferStatusTracker::new(
                    duc,
                    Arc::clone(&ch),
                    1 << 20,
                    TrackerOptions::default(),
                );
                t.start().unwrap();
                t
            })
            .collect();

        std::thread::sleep(Duration::from_secs(1));
        for t in &trackers {
            t.stop();
        }

        // 8 channels at 20 Hz for one second, plus the initial polls.
        let polls = radio.count_commands("DUCSTAT?");
        assert!(polls >= 8 * 14, "only {} polls", polls);
    }

    #[test]
    fn concurrent_exchanges_do_not_interleave() {
        let radio = MockRadio::start(2, 4096).unwrap();
        let ch = CommandChannel::connect(radio.addr()).unwrap();

        let handles: Vec<_> = (1..=2u8)
            .map(|duc| {
                let ch = Arc::clone(&ch);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        let cmd = format!("DUCSTAT? {}", duc);
                        let fields = ch.query(&cmd, "DUCSTAT", 8).unwrap();
                        assert_eq!(fields[0], duc.to_string());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(radio.count_commands("DUCSTAT?"), 20);
    }
}
