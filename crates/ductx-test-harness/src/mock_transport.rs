//! Mock transport for deterministic testing of the command channel.
//!
//! [`MockTransport`] implements the [`Transport`] trait with pre-loaded
//! request/response pairs. This lets you test command formatting and
//! response parsing without a radio or a socket.
//!
//! # Example
//!
//! ```
//! use ductx_test_harness::MockTransport;
//!
//! let mut mock = MockTransport::new();
//! // When the engine sends this request, return this response.
//! mock.expect(b"UTC?\n", b"UTC 1700000000\n");
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ductx_core::error::{Error, Result};
use ductx_core::transport::Transport;

/// A pre-loaded request/response pair for the mock transport.
#[derive(Debug, Clone)]
struct Expectation {
    /// The exact bytes we expect to be sent.
    request: Vec<u8>,
    /// What the next `receive()` calls should yield.
    reply: Reply,
}

#[derive(Debug, Clone)]
enum Reply {
    Bytes(Vec<u8>),
    /// The peer hangs up instead of answering.
    Disconnect,
}

/// Shared record of every `send()` made through a [`MockTransport`].
///
/// The transport is usually boxed and moved into the code under test, so
/// the log is reachable through this cloneable handle.
#[derive(Debug, Clone, Default)]
pub struct SentLog(Arc<Mutex<Vec<Vec<u8>>>>);

impl SentLog {
    /// All payloads sent so far, in order.
    pub fn entries(&self) -> Vec<Vec<u8>> {
        self.0.lock().map(|v| v.clone()).unwrap_or_default()
    }

    /// Sent payloads decoded as text lines with the trailing newline removed.
    pub fn lines(&self) -> Vec<String> {
        self.entries()
            .iter()
            .map(|b| String::from_utf8_lossy(b).trim_end().to_string())
            .collect()
    }

    fn push(&self, data: &[u8]) {
        if let Ok(mut v) = self.0.lock() {
            v.push(data.to_vec());
        }
    }
}

/// A mock [`Transport`] for testing protocol code without hardware.
///
/// Expectations are consumed in order. When `send()` is called, the sent
/// data is recorded and matched against the next expectation. The
/// corresponding response is then returned by the following `receive()`
/// calls, after which `receive()` reports [`Error::Timeout`] as a quiet
/// socket would.
///
/// If no expectation matches or the queue is exhausted, `send()` returns
/// [`Error::Protocol`].
#[derive(Debug)]
pub struct MockTransport {
    expectations: VecDeque<Expectation>,
    pending: Option<Reply>,
    cursor: usize,
    connected: bool,
    log: SentLog,
}

impl MockTransport {
    /// Create a new mock transport in the connected state.
    pub fn new() -> Self {
        MockTransport {
            expectations: VecDeque::new(),
            pending: None,
            cursor: 0,
            connected: true,
            log: SentLog::default(),
        }
    }

    /// Add an expected request/response pair.
    pub fn expect(&mut self, request: &[u8], response: &[u8]) {
        self.expectations.push_back(Expectation {
            request: request.to_vec(),
            reply: Reply::Bytes(response.to_vec()),
        });
    }

    /// Add an expected request that the peer answers by closing the
    /// connection.
    pub fn expect_disconnect(&mut self, request: &[u8]) {
        self.expectations.push_back(Expectation {
            request: request.to_vec(),
            reply: Reply::Disconnect,
        });
    }

    /// Handle onto the log of sent data.
    pub fn sent_log(&self) -> SentLog {
        self.log.clone()
    }

    /// Return the number of expectations that have not yet been consumed.
    pub fn remaining_expectations(&self) -> usize {
        self.expectations.len()
    }

    /// Set the connected state of the mock transport.
    ///
    /// When set to `false`, subsequent `send()` and `receive()` calls will
    /// return [`Error::NotConnected`].
    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        if !self.connected {
            return Err(Error::NotConnected);
        }

        self.log.push(data);

        let Some(expectation) = self.expectations.pop_front() else {
            return Err(Error::Protocol("no more expectations in mock transport".into()));
        };
        if data != expectation.request.as_slice() {
            return Err(Error::Protocol(format!(
                "unexpected send data: expected {:?}, got {:?}",
                String::from_utf8_lossy(&expectation.request),
                String::from_utf8_lossy(data)
            )));
        }
        self.pending = Some(expectation.reply);
        self.cursor = 0;
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        if !self.connected {
            return Err(Error::NotConnected);
        }

        match self.pending.take() {
            None => Err(Error::Timeout),
            Some(Reply::Disconnect) => {
                self.connected = false;
                Err(Error::ConnectionLost)
            }
            Some(Reply::Bytes(response)) => {
                let remaining = &response[self.cursor..];
                if remaining.is_empty() {
                    self.cursor = 0;
                    return Err(Error::Timeout);
                }
                let n = remaining.len().min(buf.len());
                buf[..n].copy_from_slice(&remaining[..n]);
                self.cursor += n;
                if self.cursor < response.len() {
                    self.pending = Some(Reply::Bytes(response));
                } else {
                    self.cursor = 0;
                }
                Ok(n)
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        self.connected = false;
        self.pending = None;
        self.cursor = 0;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
