// ductx test application -- CLI tool for exercising the transmit engine
// against a real radio or the in-process simulated radio.
//
// Usage:
//   ductx-test-app list
//   ductx-test-app rates
//   ductx-test-app --host 192.168.0.10 status --channel 1 --channel 2
//   ductx-test-app --host 192.168.0.10 --interface eth1 \
//       --radio-data-addr 10.1.10.1 --radio-udp-port 41001 --local-addr 10.1.10.2 \
//       tone --channel 1 --sid 100 --duration 10
//   ductx-test-app --mock group --channel 1 --channel 2 --sid 100 --sid 101 --duration 5
//   ductx-test-app listen --sid 100 --duration 30

use std::net::{Ipv4Addr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use num_complex::Complex;
use rand::Rng;

use ductx::ndr::codec::{self, DUC_STATUS_FIELDS, DUC_STATUS_KEYWORD, UTC_KEYWORD};
use ductx::ndr::feedback::status_port;
use ductx::ndr::frame::parse_status_frame;
use ductx::ndr::models::{self, NdrRadioModel};
use ductx::ndr::rates::{rate_index_to_sample_rate, valid_rates};
use ductx::ndr::{
    ChannelBuilder, ChannelController, CommandChannel, DEFAULT_CONTROL_PORT, GroupOptions,
    GroupState, SynchronizedGroupController,
};
use ductx::{ChannelConfig, FrameSink};
use ductx_test_harness::MockRadio;

/// Buffer depth of the simulated radio's DUCs.
const MOCK_BUFFER_SAMPLES: u32 = 262_144;

/// Poll rate the simulated radio's consumption is paced against.
const MOCK_POLLS_PER_SEC: f64 = 20.0;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// ductx test application -- streams IQ to NDR radios from the command line.
#[derive(Parser)]
#[command(name = "ductx-test-app", version, about)]
struct Cli {
    /// Radio control address (e.g. 192.168.0.10).
    #[arg(long)]
    host: Option<String>,

    /// Radio control port.
    #[arg(long, default_value_t = DEFAULT_CONTROL_PORT)]
    port: u16,

    /// Radio model id (e.g. ndr651).
    #[arg(long, default_value = "ndr651")]
    model: String,

    /// Local interface the data sockets bind to (e.g. eth1).
    #[arg(long, default_value = "")]
    interface: String,

    /// Radio-side 10GbE data port index.
    #[arg(long, default_value_t = 1)]
    data_port: u8,

    /// Radio data-plane address.
    #[arg(long, default_value_t = Ipv4Addr::new(192, 168, 0, 10))]
    radio_data_addr: Ipv4Addr,

    /// Radio data-plane UDP port.
    #[arg(long, default_value_t = 41001)]
    radio_udp_port: u16,

    /// Local data-plane address.
    #[arg(long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    local_addr: Ipv4Addr,

    /// Use the in-process simulated radio instead of real hardware.
    #[arg(long)]
    mock: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List supported radio models.
    List,

    /// Print the sample-rate table.
    Rates,

    /// Query buffer status and radio time.
    Status {
        /// DUC index; repeat for several.
        #[arg(long, required = true)]
        channel: Vec<u8>,
    },

    /// Stream a test signal on one DUC.
    Tone {
        #[command(flatten)]
        stream: StreamArgs,

        /// DUC index.
        #[arg(long, default_value_t = 1)]
        channel: u8,

        /// Stream id.
        #[arg(long, default_value_t = 100)]
        sid: u32,
    },

    /// Start several DUCs in lockstep and stream a test signal to each.
    Group {
        #[command(flatten)]
        stream: StreamArgs,

        /// DUC index; repeat for each member.
        #[arg(long, required = true)]
        channel: Vec<u8>,

        /// Stream id; one per member, in the same order.
        #[arg(long, required = true)]
        sid: Vec<u32>,

        /// Radio DUC group index.
        #[arg(long, default_value_t = 1)]
        group: u8,

        /// Backlog each member must reach before the group is enabled
        /// (default: half the buffer).
        #[arg(long)]
        prime: Option<u32>,
    },

    /// Print status frames broadcast for a stream.
    Listen {
        /// Stream id whose status port to listen on.
        #[arg(long)]
        sid: u32,

        /// Duration in seconds.
        #[arg(long, default_value_t = 10)]
        duration: u64,
    },
}

#[derive(clap::Args)]
struct StreamArgs {
    /// Sample-rate table index.
    #[arg(long, default_value_t = 10)]
    rate: u8,

    /// Samples per frame.
    #[arg(long, default_value_t = 1024)]
    block: usize,

    /// Streaming duration in seconds.
    #[arg(long, default_value_t = 5)]
    duration: u64,

    /// Test signal.
    #[arg(long, value_enum, default_value = "tone")]
    signal: Signal,

    /// Tone offset from centre in Hz.
    #[arg(long, default_value_t = 1000.0)]
    tone_hz: f64,

    /// Peak amplitude as a fraction of full scale.
    #[arg(long, default_value_t = 0.5)]
    amplitude: f32,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Signal {
    Tone,
    Noise,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Format a sample rate as a human-readable string.
fn format_rate(hz: f64) -> String {
    if hz >= 1e6 {
        format!("{:.4} Msps", hz / 1e6)
    } else {
        format!("{:.3} ksps", hz / 1e3)
    }
}

/// Generates blocks of the requested test signal.
struct SignalSource {
    signal: Signal,
    amplitude: f32,
    phase: f64,
    step: f64,
    rng: rand::rngs::ThreadRng,
}

impl SignalSource {
    fn new(args: &StreamArgs, sample_rate: f64) -> Self {
        SignalSource {
            signal: args.signal,
            amplitude: args.amplitude.clamp(0.0, 1.0),
            phase: 0.0,
            step: std::f64::consts::TAU * args.tone_hz / sample_rate,
            rng: rand::thread_rng(),
        }
    }

    fn fill(&mut self, block: &mut [Complex<f32>]) {
        match self.signal {
            Signal::Tone => {
                for s in block.iter_mut() {
                    let (sin, cos) = self.phase.sin_cos();
                    *s = Complex::new(cos as f32, sin as f32) * self.amplitude;
                    self.phase = (self.phase + self.step) % std::f64::consts::TAU;
                }
            }
            Signal::Noise => {
                for s in block.iter_mut() {
                    let re: f32 = self.rng.gen_range(-1.0..=1.0);
                    let im: f32 = self.rng.gen_range(-1.0..=1.0);
                    *s = Complex::new(re, im) * self.amplitude;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Session setup
// ---------------------------------------------------------------------------

/// A control connection plus, in mock mode, the simulated radio behind it.
struct Session {
    radio: Option<MockRadio>,
    commands: Arc<CommandChannel>,
    model: NdrRadioModel,
}

fn lookup_model(id: &str) -> Result<NdrRadioModel> {
    models::by_id(&id.to_lowercase()).with_context(|| {
        let known: Vec<_> = models::all_models().iter().map(|m| m.model_id).collect();
        format!("unknown model '{}'. Supported: {}", id, known.join(", "))
    })
}

fn open_session(cli: &Cli) -> Result<Session> {
    let model = lookup_model(&cli.model)?;

    if cli.mock {
        if cli.host.is_some() {
            bail!("--host is not valid with --mock");
        }
        let model = models::custom(model.duc_count, MOCK_BUFFER_SAMPLES);
        let radio = MockRadio::start(model.duc_count, model.duc_buffer_samples)
            .context("failed to start simulated radio")?;
        let commands = CommandChannel::connect(radio.addr())
            .context("failed to connect to simulated radio")?;
        println!("Simulated {} DUCs on {}", model.duc_count, radio.addr());
        return Ok(Session {
            radio: Some(radio),
            commands,
            model,
        });
    }

    let host = cli
        .host
        .as_deref()
        .context("--host is required unless --mock is used")?;
    let addr = format!("{}:{}", host, cli.port);
    let commands =
        CommandChannel::connect(&addr).with_context(|| format!("failed to connect to {addr}"))?;
    Ok(Session {
        radio: None,
        commands,
        model,
    })
}

fn build_channel(
    cli: &Cli,
    session: &Session,
    args: &StreamArgs,
    channel: u8,
    sid: u32,
) -> Result<ChannelController> {
    let config = ChannelConfig {
        channel,
        rate_index: args.rate,
        stream_id: sid,
        interface: cli.interface.clone(),
        data_port: cli.data_port,
        radio_addr: cli.radio_data_addr,
        radio_udp_port: cli.radio_udp_port,
        local_addr: cli.local_addr,
        ..ChannelConfig::default()
    };
    let mut builder = ChannelBuilder::new(config)
        .model(session.model.clone())
        .commands(Arc::clone(&session.commands))
        .samples_per_frame(args.block);
    if let Some(radio) = &session.radio {
        let sink = radio.data_sink(channel, args.block as u32);
        builder =
            builder.sink_factory(move |_| Ok(Box::new(sink.clone()) as Box<dyn FrameSink>));
    }
    builder
        .build()
        .with_context(|| format!("failed to set up DUC {channel}"))
}

/// Pace the simulated radio's consumption to the stream's sample rate.
fn pace_mock(session: &Session, sample_rate: f64) {
    if let Some(radio) = &session.radio {
        let per_poll = (sample_rate / MOCK_POLLS_PER_SEC).min(f64::from(MOCK_BUFFER_SAMPLES / 4));
        radio.set_drain_per_poll(per_poll as u32);
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

fn cmd_list() -> Result<()> {
    let entries = models::all_models();
    println!(
        "{:<10}  {:<8}  {:>4}  {:>3}  {:>6}  {:>12}",
        "Model", "Id", "DUCs", "TX", "Groups", "Buffer"
    );
    println!(
        "{:<10}  {:<8}  {:>4}  {:>3}  {:>6}  {:>12}",
        "-".repeat(10),
        "-".repeat(8),
        "----",
        "---",
        "------",
        "-".repeat(12)
    );
    for m in &entries {
        println!(
            "{:<10}  {:<8}  {:>4}  {:>3}  {:>6}  {:>12}",
            m.name, m.model_id, m.duc_count, m.tx_count, m.group_count, m.duc_buffer_samples
        );
    }
    println!();
    println!("{} models total.", entries.len());
    Ok(())
}

fn cmd_rates() -> Result<()> {
    println!("{:>5}  Sample rate", "Index");
    println!("{:>5}  -----------", "-----");
    for (index, rate) in valid_rates() {
        println!("{:>5}  {}", index, format_rate(rate));
    }
    Ok(())
}

fn cmd_status(session: &Session, channels: &[u8]) -> Result<()> {
    for &ch in channels {
        session.model.check_channel(ch)?;
        let fields = session.commands.query(
            &codec::cmd_duc_status(ch),
            DUC_STATUS_KEYWORD,
            DUC_STATUS_FIELDS,
        )?;
        let fields: Vec<&str> = fields.iter().map(String::as_str).collect();
        let s = codec::parse_duc_status(&fields)?;
        println!(
            "DUC {}: free={} empty={} full={} underruns={} overruns={}",
            s.channel, s.free, s.empty, s.full, s.underrun_count, s.overrun_count
        );
    }
    let utc = session.commands.query(&codec::cmd_utc(), UTC_KEYWORD, 1)?;
    println!("Radio UTC: {}", utc[0]);
    Ok(())
}

fn cmd_tone(cli: &Cli, session: &Session, args: &StreamArgs, channel: u8, sid: u32) -> Result<()> {
    let sample_rate = rate_index_to_sample_rate(args.rate)?;
    pace_mock(session, sample_rate);

    let duc = build_channel(cli, session, args, channel, sid)?;
    duc.start()
        .with_context(|| format!("failed to start DUC {channel}"))?;
    println!(
        "Streaming {:?} on DUC {} (sid {}) at {} for {} s",
        args.signal,
        channel,
        sid,
        format_rate(sample_rate),
        args.duration
    );

    let mut source = SignalSource::new(args, sample_rate);
    let mut block = vec![Complex::new(0.0f32, 0.0); args.block];
    let deadline = Duration::from_secs(args.duration);
    let start = Instant::now();
    let mut samples = 0u64;
    let mut result = Ok(());

    while start.elapsed() < deadline {
        source.fill(&mut block);
        match duc.send_samples_f32(&block, f32::from(i16::MAX)) {
            Ok(n) => samples += n as u64,
            Err(e) => {
                result = Err(e).context("send failed");
                break;
            }
        }
    }

    let state = duc.buffer_state();
    let stop = duc.stop();
    let elapsed = start.elapsed().as_secs_f64();

    println!();
    println!("Results:");
    println!("  Samples sent:   {samples}");
    println!("  Elapsed:        {elapsed:.3} s");
    if elapsed > 0.0 {
        println!("  Achieved rate:  {}", format_rate(samples as f64 / elapsed));
    }
    println!("  Underruns:      {}", state.underrun_count);
    println!("  Overruns:       {}", state.overrun_count);

    result?;
    stop.context("failed to stop cleanly")
}

fn cmd_group(
    cli: &Cli,
    session: &Session,
    args: &StreamArgs,
    channels: &[u8],
    sids: &[u32],
    group: u8,
    prime: Option<u32>,
) -> Result<()> {
    if channels.len() != sids.len() {
        bail!(
            "{} channels but {} stream ids; give one --sid per --channel",
            channels.len(),
            sids.len()
        );
    }
    let sample_rate = rate_index_to_sample_rate(args.rate)?;
    pace_mock(session, sample_rate);

    let members = channels
        .iter()
        .zip(sids)
        .map(|(&ch, &sid)| build_channel(cli, session, args, ch, sid))
        .collect::<Result<Vec<_>>>()?;
    let mut controller = SynchronizedGroupController::new(
        Arc::clone(&session.commands),
        members,
        GroupOptions {
            group,
            prime_threshold: prime,
        },
    )?;
    controller.start().context("failed to start group")?;
    println!(
        "Group {} priming {} DUCs at {}",
        group,
        channels.len(),
        format_rate(sample_rate)
    );

    let mut source = SignalSource::new(args, sample_rate);
    let mut float_block = vec![Complex::new(0.0f32, 0.0); args.block];
    let mut words = Vec::with_capacity(args.block);
    let deadline = Duration::from_secs(args.duration);
    let start = Instant::now();
    let mut enabled_at = None;
    let mut refused = 0u64;
    let mut result = Ok(());

    while start.elapsed() < deadline {
        source.fill(&mut float_block);
        ductx::types::iq_from_f32(&float_block, f32::from(i16::MAX), &mut words);
        let blocks: Vec<&[ductx::IqSample]> = channels.iter().map(|_| words.as_slice()).collect();
        match controller.send_frames(&blocks) {
            Ok(sent) => refused += sent.iter().filter(|&&n| n == 0).count() as u64,
            Err(e) => {
                result = Err(e).context("send failed");
                break;
            }
        }
        if enabled_at.is_none() && controller.state() == GroupState::Enabled {
            enabled_at = Some(start.elapsed());
            println!("Group enabled after {:.3} s", start.elapsed().as_secs_f64());
        }
    }

    let states: Vec<_> = controller
        .members()
        .iter()
        .map(|m| (m.channel(), m.buffer_state()))
        .collect();
    let stop = controller.stop();

    println!();
    println!("Results:");
    match enabled_at {
        Some(t) => println!("  Enabled at:     {:.3} s", t.as_secs_f64()),
        None => println!("  Enabled at:     never (still priming)"),
    }
    println!("  Refused blocks: {refused}");
    for (ch, s) in states {
        println!(
            "  DUC {ch}: underruns={} overruns={} polls={}/{}",
            s.underrun_count,
            s.overrun_count,
            s.polls_ok,
            s.polls_ok + s.polls_failed
        );
    }

    result?;
    stop.context("failed to stop cleanly")
}

fn cmd_listen(sid: u32, duration_secs: u64) -> Result<()> {
    let port = status_port(sid);
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, port))
        .with_context(|| format!("failed to bind status port {port}"))?;
    socket.set_read_timeout(Some(Duration::from_millis(200)))?;
    println!("Listening for stream {sid} status on 127.0.0.1:{port}");

    let deadline = Duration::from_secs(duration_secs);
    let start = Instant::now();
    let mut buf = [0u8; 256];
    let mut count = 0u64;
    while start.elapsed() < deadline {
        let n = match socket.recv(&mut buf) {
            Ok(n) => n,
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(e) => return Err(e).context("receive failed"),
        };
        match parse_status_frame(&buf[..n]) {
            Ok(frame) => {
                count += 1;
                let r = frame.report;
                println!(
                    "[{:>5}] DUC {} free={} empty={} full={} ur={} or={} utc={}",
                    frame.frame_count,
                    r.channel,
                    r.free,
                    r.empty,
                    r.full,
                    r.underrun_count,
                    r.overrun_count,
                    r.utc_seconds
                );
            }
            Err(e) => eprintln!("Ignoring {n}-byte datagram: {e}"),
        }
    }
    println!("{count} status frames received.");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // These commands do not need a radio.
    match &cli.command {
        Command::List => return cmd_list(),
        Command::Rates => return cmd_rates(),
        Command::Listen { sid, duration } => return cmd_listen(*sid, *duration),
        _ => {}
    }

    let session = open_session(&cli)?;

    match &cli.command {
        Command::Status { channel } => cmd_status(&session, channel),
        Command::Tone {
            stream,
            channel,
            sid,
        } => cmd_tone(&cli, &session, stream, *channel, *sid),
        Command::Group {
            stream,
            channel,
            sid,
            group,
            prime,
        } => cmd_group(&cli, &session, stream, channel, sid, *group, *prime),
        Command::List => unreachable!("list handled above"),
        Command::Rates => unreachable!("rates handled above"),
        Command::Listen { .. } => unreachable!("listen handled above"),
    }
}
