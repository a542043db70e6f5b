//! Simulated radio for end-to-end testing.
//!
//! [`MockRadio`] listens on a loopback TCP port and speaks the radio's
//! line-oriented control protocol. It keeps a model of every DUC's transmit
//! buffer so that buffer-status polls reflect what the code under test has
//! sent (through a [`RadioSink`]) and what the radio has consumed.
//!
//! Consumption is deterministic: each `DUCSTAT?` poll drains
//! [`RadioState::drain_per_poll`] samples from a DUC that is enabled and
//! whose group (if any) is enabled.
//!
//! # Example
//!
//! ```no_run
//! use ductx_test_harness::MockRadio;
//!
//! # fn example() -> ductx_core::Result<()> {
//! let radio = MockRadio::start(2, 16_384)?;
//! let addr = radio.addr().to_string();
//! // ... connect a command channel to `addr` ...
//! assert_eq!(radio.count_commands("DUCGE"), 0);
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ductx_core::error::{Error, Result};
use ductx_core::transport::FrameSink;

/// Highest DUC group index the simulated radio accepts.
pub const MAX_GROUP: u8 = 4;

const ACCEPT_POLL: Duration = Duration::from_millis(5);
const READ_POLL: Duration = Duration::from_millis(20);

/// Simulated state of one DUC.
#[derive(Debug, Clone, PartialEq)]
pub struct DucState {
    /// Buffer depth in samples.
    pub capacity: u32,
    /// Free space in samples.
    pub free: u32,
    /// Transmit channel mask; zero means disabled.
    pub tx_mask: u8,
    /// Last configured rate index.
    pub rate_index: u8,
    /// Last configured stream id.
    pub stream_id: u32,
    /// Last configured frequency offset in Hz.
    pub frequency_hz: f64,
    /// Last configured attenuation in dB.
    pub attenuation_db: f64,
    /// Underrun since the last status report.
    pub underrun: bool,
    /// Total underruns.
    pub underrun_count: u32,
    /// Overrun since the last status report.
    pub overrun: bool,
    /// Total overruns.
    pub overrun_count: u32,
    /// Samples delivered through a [`RadioSink`].
    pub samples_received: u64,
}

impl DucState {
    fn new(capacity: u32) -> Self {
        Self {
            capacity,
            free: capacity,
            tx_mask: 0,
            rate_index: 0,
            stream_id: 0,
            frequency_hz: 0.0,
            attenuation_db: 0.0,
            underrun: false,
            underrun_count: 0,
            overrun: false,
            overrun_count: 0,
            samples_received: 0,
        }
    }

    /// Samples held in the buffer.
    pub fn backlog(&self) -> u32 {
        self.capacity - self.free
    }
}

/// Simulated DUC group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RadioGroup {
    /// Member DUC indices.
    pub members: BTreeSet<u8>,
    /// Whether the group is enabled.
    pub enabled: bool,
}

/// Simulated transmitter settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TxState {
    /// Last `TXF` value in MHz.
    pub frequency_mhz: Option<f64>,
    /// Last `TXA` value in dB.
    pub attenuation_db: Option<f64>,
}

/// Everything the simulated radio knows.
#[derive(Debug, Default)]
pub struct RadioState {
    /// DUCs by index (1-based).
    pub ducs: BTreeMap<u8, DucState>,
    /// Groups by index (1-based).
    pub groups: BTreeMap<u8, RadioGroup>,
    /// Transmitters by index.
    pub transmitters: BTreeMap<u8, TxState>,
    /// Every command line received, in order.
    pub commands: Vec<String>,
    /// Value reported by `UTC?`.
    pub utc_seconds: u64,
    /// Samples consumed per status poll from each consuming DUC.
    pub drain_per_poll: u32,
    /// Replacement replies for `DUCSTAT?` by channel.
    pub status_overrides: BTreeMap<u8, String>,
    /// When set, commands are recorded but never answered.
    pub mute: bool,
}

impl RadioState {
    fn consuming(&self, channel: u8) -> bool {
        let Some(duc) = self.ducs.get(&channel) else {
            return false;
        };
        if duc.tx_mask == 0 {
            return false;
        }
        match self.groups.values().find(|g| g.members.contains(&channel)) {
            Some(group) => group.enabled,
            None => true,
        }
    }

    fn handle(&mut self, line: &str) -> Option<String> {
        self.commands.push(line.to_string());
        if self.mute {
            return None;
        }

        let (keyword, rest) = match line.split_once(' ') {
            Some((k, r)) => (k, r),
            None => (line, ""),
        };
        let args: Vec<&str> = if rest.trim().is_empty() {
            Vec::new()
        } else {
            rest.split(',').map(str::trim).collect()
        };

        let reply = match keyword {
            "DUC" => self.apply_duc(&args),
            "TXF" => self.apply_tx(&args, true),
            "TXA" => self.apply_tx(&args, false),
            "DUCSTAT?" => self.status(&args),
            "UTC?" => Ok(format!("UTC {}", self.utc_seconds)),
            "DUCG" => self.apply_group_member(&args),
            "DUCGE" => self.apply_group_enable(&args),
            other => Err(format!("unknown command {}", other)),
        };
        Some(reply.unwrap_or_else(|e| format!("ERROR: {}", e)))
    }

    fn apply_duc(&mut self, args: &[&str]) -> std::result::Result<String, String> {
        if args.len() != 8 {
            return Err(format!("DUC expects 8 fields, got {}", args.len()));
        }
        let channel: u8 = num(args[0])?;
        let frequency_hz: f64 = num(args[2])?;
        let attenuation_db: f64 = num(args[3])?;
        let rate_index: u8 = num(args[4])?;
        let tx_mask: u8 = num(args[5])?;
        let stream_id: u32 = num(args[7])?;

        let duc = self
            .ducs
            .get_mut(&channel)
            .ok_or_else(|| format!("no DUC {}", channel))?;
        duc.frequency_hz = frequency_hz;
        duc.attenuation_db = attenuation_db;
        duc.rate_index = rate_index;
        duc.stream_id = stream_id;
        duc.tx_mask = tx_mask;
        if tx_mask == 0 {
            duc.free = duc.capacity;
        }
        Ok("OK".into())
    }

    fn apply_tx(&mut self, args: &[&str], frequency: bool) -> std::result::Result<String, String> {
        if args.len() != 2 {
            return Err(format!("expected 2 fields, got {}", args.len()));
        }
        let tx: u8 = num(args[0])?;
        let value: f64 = num(args[1])?;
        let entry = self.transmitters.entry(tx).or_default();
        if frequency {
            entry.frequency_mhz = Some(value);
        } else {
            entry.attenuation_db = Some(value);
        }
        Ok("OK".into())
    }

    fn status(&mut self, args: &[&str]) -> std::result::Result<String, String> {
        if args.len() != 1 {
            return Err(format!("DUCSTAT? expects 1 field, got {}", args.len()));
        }
        let channel: u8 = num(args[0])?;
        if let Some(reply) = self.status_overrides.get(&channel) {
            return Ok(reply.clone());
        }

        let consuming = self.consuming(channel);
        let drain = self.drain_per_poll;
        let duc = self
            .ducs
            .get_mut(&channel)
            .ok_or_else(|| format!("no DUC {}", channel))?;

        if consuming && drain > 0 {
            let backlog = duc.backlog();
            if drain > backlog {
                duc.underrun = true;
                duc.underrun_count += 1;
            }
            duc.free += drain.min(backlog);
        }

        let reply = format!(
            "DUCSTAT {}, {}, {}, {}, {}, {}, {}, {}",
            channel,
            u8::from(duc.free == duc.capacity),
            u8::from(duc.free == 0),
            duc.free,
            u8::from(duc.underrun),
            duc.underrun_count,
            u8::from(duc.overrun),
            duc.overrun_count
        );
        duc.underrun = false;
        duc.overrun = false;
        Ok(reply)
    }

    fn apply_group_member(&mut self, args: &[&str]) -> std::result::Result<String, String> {
        if args.len() != 3 {
            return Err(format!("DUCG expects 3 fields, got {}", args.len()));
        }
        let group: u8 = num(args[0])?;
        let channel: u8 = num(args[1])?;
        let member: u8 = num(args[2])?;
        check_group(group)?;
        if !self.ducs.contains_key(&channel) {
            return Err(format!("no DUC {}", channel));
        }
        let g = self.groups.entry(group).or_default();
        if member != 0 {
            g.members.insert(channel);
        } else {
            g.members.remove(&channel);
        }
        Ok("OK".into())
    }

    fn apply_group_enable(&mut self, args: &[&str]) -> std::result::Result<String, String> {
        if args.len() != 2 {
            return Err(format!("DUCGE expects 2 fields, got {}", args.len()));
        }
        let group: u8 = num(args[0])?;
        let enable: u8 = num(args[1])?;
        check_group(group)?;
        self.groups.entry(group).or_default().enabled = enable != 0;
        Ok("OK".into())
    }
}

fn num<T: std::str::FromStr>(s: &str) -> std::result::Result<T, String> {
    s.parse().map_err(|_| format!("bad number {:?}", s))
}

fn check_group(group: u8) -> std::result::Result<(), String> {
    if (1..=MAX_GROUP).contains(&group) {
        Ok(())
    } else {
        Err(format!("group {} out of range", group))
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<RadioState>,
    shutdown: AtomicBool,
    /// Bumped to make connection threads hang up.
    generation: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RadioState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A threaded TCP server simulating a multi-DUC radio.
///
/// Accepts any number of sequential or concurrent control connections on
/// `127.0.0.1`. Stopped and joined on drop.
#[derive(Debug)]
pub struct MockRadio {
    addr: String,
    shared: Arc<Shared>,
    accept: Option<JoinHandle<()>>,
}

impl MockRadio {
    /// Start a radio with `channels` DUCs (numbered from 1), each with a
    /// buffer of `capacity` samples.
    pub fn start(channels: u8, capacity: u32) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .map_err(|e| Error::Transport(format!("failed to bind mock radio: {}", e)))?;
        let addr = listener.local_addr().map_err(Error::Io)?.to_string();
        listener.set_nonblocking(true).map_err(Error::Io)?;

        let shared = Arc::new(Shared::default());
        {
            let mut state = shared.lock();
            for ch in 1..=channels {
                state.ducs.insert(ch, DucState::new(capacity));
            }
            state.utc_seconds = 1_700_000_000;
        }

        let accept_shared = Arc::clone(&shared);
        let accept = thread::Builder::new()
            .name("mock-radio-accept".into())
            .spawn(move || accept_loop(listener, accept_shared))
            .map_err(|source| Error::Resource {
                resource: "mock radio thread".into(),
                source,
            })?;

        tracing::debug!(addr = %addr, channels, capacity, "Mock radio listening");

        Ok(Self {
            addr,
            shared,
            accept: Some(accept),
        })
    }

    /// Address of the control port, e.g. `"127.0.0.1:40123"`.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Run `f` with exclusive access to the simulated state.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut RadioState) -> R) -> R {
        f(&mut self.shared.lock())
    }

    /// Snapshot of one DUC.
    pub fn duc(&self, channel: u8) -> Option<DucState> {
        self.shared.lock().ducs.get(&channel).cloned()
    }

    /// Snapshot of one group.
    pub fn group(&self, group: u8) -> Option<RadioGroup> {
        self.shared.lock().groups.get(&group).cloned()
    }

    /// Every command line received so far.
    pub fn commands(&self) -> Vec<String> {
        self.shared.lock().commands.clone()
    }

    /// Number of received commands starting with `prefix` followed by a
    /// space or end of line.
    pub fn count_commands(&self, prefix: &str) -> usize {
        self.shared
            .lock()
            .commands
            .iter()
            .filter(|c| c.split(' ').next() == Some(prefix))
            .count()
    }

    /// Set the per-poll consumption of consuming DUCs.
    pub fn set_drain_per_poll(&self, samples: u32) {
        self.shared.lock().drain_per_poll = samples;
    }

    /// Force the reply to `DUCSTAT? <channel>`; `None` restores simulation.
    pub fn set_status_reply(&self, channel: u8, reply: Option<&str>) {
        let mut state = self.shared.lock();
        match reply {
            Some(r) => {
                state.status_overrides.insert(channel, r.to_string());
            }
            None => {
                state.status_overrides.remove(&channel);
            }
        }
    }

    /// Stop answering commands (they are still recorded).
    pub fn set_mute(&self, mute: bool) {
        self.shared.lock().mute = mute;
    }

    /// Hang up every open control connection.
    pub fn disconnect_clients(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// A data-plane sink that delivers frames of `samples_per_frame` samples
    /// into `channel`'s buffer.
    pub fn data_sink(&self, channel: u8, samples_per_frame: u32) -> RadioSink {
        RadioSink {
            shared: Arc::clone(&self.shared),
            channel,
            samples_per_frame,
            closed: false,
        }
    }
}

impl Drop for MockRadio {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept.take() {
            let _ = handle.join();
        }
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    let mut connections = Vec::new();
    while !shared.shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                tracing::trace!(peer = %peer, "Mock radio accepted connection");
                let conn_shared = Arc::clone(&shared);
                connections.push(thread::spawn(move || serve(stream, conn_shared)));
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                tracing::warn!(error = %e, "Mock radio accept failed");
                break;
            }
        }
    }
    for handle in connections {
        let _ = handle.join();
    }
}

fn serve(mut stream: TcpStream, shared: Arc<Shared>) {
    let generation = shared.generation.load(Ordering::SeqCst);
    if stream.set_nonblocking(false).is_err() || stream.set_read_timeout(Some(READ_POLL)).is_err()
    {
        return;
    }

    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        if shared.shutdown.load(Ordering::SeqCst)
            || shared.generation.load(Ordering::SeqCst) != generation
        {
            break;
        }
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => pending.extend_from_slice(&buf[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(_) => break,
        }

        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line).trim().to_string();
            if text.is_empty() {
                continue;
            }
            let reply = shared.lock().handle(&text);
            if let Some(reply) = reply {
                if stream.write_all(format!("{}\n", reply).as_bytes()).is_err() {
                    return;
                }
            }
        }
    }
    let _ = stream.shutdown(std::net::Shutdown::Both);
}

/// [`FrameSink`] that credits a simulated DUC buffer.
///
/// Each frame fills `samples_per_frame` samples; a frame that does not fit
/// sets the overrun flag and fills the buffer. Clones feed the same DUC.
#[derive(Debug, Clone)]
pub struct RadioSink {
    shared: Arc<Shared>,
    channel: u8,
    samples_per_frame: u32,
    closed: bool,
}

impl FrameSink for RadioSink {
    fn send_frame(&mut self, _frame: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::NotConnected);
        }
        let mut state = self.shared.lock();
        let duc = state
            .ducs
            .get_mut(&self.channel)
            .ok_or_else(|| Error::InvalidParameter(format!("no DUC {}", self.channel)))?;
        if self.samples_per_frame > duc.free {
            duc.overrun = true;
            duc.overrun_count += 1;
            duc.free = 0;
        } else {
            duc.free -= self.samples_per_frame;
        }
        duc.samples_received += u64::from(self.samples_per_frame);
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
