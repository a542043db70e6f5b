//! Wire-frame codec for the transmit data plane.
//!
//! Outbound sample frames are fixed-size once a channel is configured:
//!
//! ```text
//! offset  size  field
//!      0    14  Ethernet: dst MAC, src MAC, ethertype 0x0800
//!     14    20  IPv4: DF, TTL 64, protocol 17, header checksum
//!     34     8  UDP: ports, length, checksum 0
//!     42     4  VRL magic "VRLP"
//!     46     4  VRL frame word: frame count (31-20) | frame size in words (19-0)
//!     50     4  VRT header: type (31-28) | C (27) | packet count (19-16) | size (15-0)
//!     54     4  stream id (20 bits)
//!     58     8  class id: OUI, then info class (31-16) | packet class (15-0)
//!     66  4*N   N samples of 16-bit I and Q in the configured orders
//!  66+4N     4  VRL trailer "VEND"
//! ```
//!
//! Only the two counters and the payload change from frame to frame, so
//! [`FrameLayout`] precomputes everything up to the payload once.
//!
//! Everything in this module is pure -- no I/O is performed.

use std::ops::Range;

use bytes::{BufMut, BytesMut};
use ductx_core::{ByteOrder, ChannelConfig, Error, IqOrder, IqSample, Result};

/// VRL frame start word (`"VRLP"`).
pub const VRL_MAGIC: u32 = 0x5652_4C50;

/// VRL frame end word (`"VEND"`).
pub const VRL_TRAILER: u32 = 0x5645_4E44;

/// Ethernet header length.
pub const ETH_HEADER_LEN: usize = 14;

/// IPv4 header length (no options).
pub const IPV4_HEADER_LEN: usize = 20;

/// UDP header length.
pub const UDP_HEADER_LEN: usize = 8;

/// Offset of the VRL frame inside a full frame.
pub const VRL_OFFSET: usize = ETH_HEADER_LEN + IPV4_HEADER_LEN + UDP_HEADER_LEN;

/// Offset of the first sample inside a full frame.
pub const PAYLOAD_OFFSET: usize = VRL_OFFSET + 4 * (VRL_HEADER_WORDS + VRT_HEADER_WORDS);

/// Default number of samples carried per frame.
pub const DEFAULT_SAMPLES_PER_FRAME: usize = 1024;

/// Packet class code of the local status broadcast (`"ST"`).
pub const STATUS_PACKET_CLASS: u16 = 0x5354;

/// Packet class code of sample data frames.
pub const DATA_PACKET_CLASS: u16 = 0x0000;

const VRL_HEADER_WORDS: usize = 2;
const VRT_HEADER_WORDS: usize = 4;
const VRL_TRAILER_WORDS: usize = 1;
const FRAME_WORD_OFFSET: usize = VRL_OFFSET + 4;
const VRT_HEADER_OFFSET: usize = VRL_OFFSET + 8;

const VRT_TYPE_DATA: u32 = 0x1;
const VRT_TYPE_CONTEXT: u32 = 0x4;
const VRT_CLASS_ID_BIT: u32 = 1 << 27;

const ETHERTYPE_IPV4: u16 = 0x0800;
const IP_PROTO_UDP: u8 = 17;
const IP_FLAG_DF: u16 = 0x4000;
const IP_TTL: u8 = 64;

/// Fixed-point radix of 64-bit context fields.
pub const CONTEXT_RADIX_BITS: u32 = 20;

/// Fixed-point radix of the reference-level field.
const REFERENCE_LEVEL_RADIX: f32 = 128.0;

// Context indicator field (CIF0) bits, most significant first.
const CIF_REFERENCE_POINT: u32 = 1 << 30;
const CIF_BANDWIDTH: u32 = 1 << 29;
const CIF_IF_REFERENCE: u32 = 1 << 28;
const CIF_RF_REFERENCE: u32 = 1 << 27;
const CIF_RF_OFFSET: u32 = 1 << 26;
const CIF_IF_BAND_OFFSET: u32 = 1 << 25;
const CIF_REFERENCE_LEVEL: u32 = 1 << 24;
const CIF_GAIN: u32 = 1 << 23;
const CIF_OVER_RANGE: u32 = 1 << 22;
const CIF_SAMPLE_RATE: u32 = 1 << 21;

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Frame (12-bit) and packet (4-bit) counters stamped into every frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCounters {
    frame: u16,
    packet: u8,
}

impl FrameCounters {
    /// Counters starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters starting at the given values, truncated to their widths.
    pub fn starting_at(frame: u16, packet: u8) -> Self {
        Self {
            frame: frame & 0x0FFF,
            packet: packet & 0x0F,
        }
    }

    /// Current 12-bit frame count.
    pub fn frame(&self) -> u16 {
        self.frame
    }

    /// Current 4-bit packet count.
    pub fn packet(&self) -> u8 {
        self.packet
    }

    /// Advance both counters, wrapping at 4096 and 16.
    pub fn increment(&mut self) {
        self.frame = (self.frame + 1) & 0x0FFF;
        self.packet = (self.packet + 1) & 0x0F;
    }
}

// ---------------------------------------------------------------------------
// Frame layout
// ---------------------------------------------------------------------------

/// Per-channel framing parameters that are not addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    /// Samples per frame; every block sent must be exactly this long.
    pub samples_per_frame: usize,
    /// Byte order of sample words.
    pub byte_order: ByteOrder,
    /// Order of I and Q within each sample.
    pub iq_order: IqOrder,
    /// 24-bit OUI in the class id.
    pub class_oui: u32,
    /// Information class code.
    pub info_class: u16,
    /// Packet class code.
    pub packet_class: u16,
}

impl Default for FrameFormat {
    fn default() -> Self {
        Self {
            samples_per_frame: DEFAULT_SAMPLES_PER_FRAME,
            byte_order: ByteOrder::Big,
            iq_order: IqOrder::IFirst,
            class_oui: 0,
            info_class: 0,
            packet_class: DATA_PACKET_CLASS,
        }
    }
}

/// Precomputed header template for one channel's frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLayout {
    header: Vec<u8>,
    format: FrameFormat,
    vrl_words: u32,
    vrt_words: u32,
    stream_id: u32,
}

impl FrameLayout {
    /// Build the template for `config` framed as `format`.
    ///
    /// Fails with [`Error::Configuration`] if the frame would not fit the
    /// 16-bit packet size or the IPv4 length field.
    pub fn new(config: &ChannelConfig, format: FrameFormat) -> Result<Self> {
        let spf = format.samples_per_frame;
        if spf == 0 {
            return Err(Error::Configuration("frame must carry at least one sample".into()));
        }
        let vrt_words = VRT_HEADER_WORDS + spf;
        let vrl_words = VRL_HEADER_WORDS + vrt_words + VRL_TRAILER_WORDS;
        let ip_len = IPV4_HEADER_LEN + UDP_HEADER_LEN + 4 * vrl_words;
        if vrt_words > 0xFFFF || ip_len > usize::from(u16::MAX) {
            return Err(Error::Configuration(format!(
                "{} samples per frame exceeds the maximum datagram size",
                spf
            )));
        }
        // Bounded by the checks above.
        let vrt_words = vrt_words as u32;
        let vrl_words = vrl_words as u32;
        let ip_len = ip_len as u16;
        let udp_len = ip_len - IPV4_HEADER_LEN as u16;
        let stream_id = config.stream_id_20();

        let mut header = BytesMut::with_capacity(PAYLOAD_OFFSET);

        header.put_slice(&config.radio_mac);
        header.put_slice(&config.local_mac);
        header.put_u16(ETHERTYPE_IPV4);

        let ip_start = header.len();
        header.put_u8(0x45);
        header.put_u8(0);
        header.put_u16(ip_len);
        header.put_u16(0);
        header.put_u16(IP_FLAG_DF);
        header.put_u8(IP_TTL);
        header.put_u8(IP_PROTO_UDP);
        header.put_u16(0);
        header.put_slice(&config.local_addr.octets());
        header.put_slice(&config.radio_addr.octets());
        let checksum = internet_checksum(&header[ip_start..]);
        header[ip_start + 10..ip_start + 12].copy_from_slice(&checksum.to_be_bytes());

        header.put_u16(config.local_udp_port);
        header.put_u16(config.radio_udp_port);
        header.put_u16(udp_len);
        header.put_u16(0);

        header.put_u32(VRL_MAGIC);
        header.put_u32(vrl_words);
        header.put_u32((VRT_TYPE_DATA << 28) | VRT_CLASS_ID_BIT | vrt_words);
        header.put_u32(stream_id);
        header.put_u32(format.class_oui & 0x00FF_FFFF);
        header.put_u32((u32::from(format.info_class) << 16) | u32::from(format.packet_class));

        debug_assert_eq!(header.len(), PAYLOAD_OFFSET);

        Ok(Self {
            header: header.to_vec(),
            format,
            vrl_words,
            vrt_words,
            stream_id,
        })
    }

    /// Total frame length in bytes, link header included.
    pub fn frame_len(&self) -> usize {
        VRL_OFFSET + 4 * self.vrl_words as usize
    }

    /// Byte range of the UDP payload (the VRL frame) within a full frame.
    pub fn udp_payload_range(&self) -> Range<usize> {
        VRL_OFFSET..self.frame_len()
    }

    /// Samples carried by each frame.
    pub fn samples_per_frame(&self) -> usize {
        self.format.samples_per_frame
    }

    /// Framing parameters.
    pub fn format(&self) -> &FrameFormat {
        &self.format
    }

    /// 20-bit stream id stamped into each frame.
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// VRT packet size in words.
    pub fn vrt_words(&self) -> u32 {
        self.vrt_words
    }
}

/// Assemble one frame into `out`, replacing its contents.
///
/// Fails with [`Error::Configuration`] if `samples` is not exactly one
/// frame's worth; blocks are never padded or truncated.
pub fn build_frame(
    layout: &FrameLayout,
    counters: FrameCounters,
    samples: &[IqSample],
    out: &mut BytesMut,
) -> Result<()> {
    let spf = layout.samples_per_frame();
    if samples.len() != spf {
        return Err(Error::Configuration(format!(
            "block of {} samples, frame holds {}",
            samples.len(),
            spf
        )));
    }

    out.clear();
    out.reserve(layout.frame_len());
    out.put_slice(&layout.header);

    let frame_word = (u32::from(counters.frame()) << 20) | layout.vrl_words;
    out[FRAME_WORD_OFFSET..FRAME_WORD_OFFSET + 4].copy_from_slice(&frame_word.to_be_bytes());
    let vrt_header = (VRT_TYPE_DATA << 28)
        | VRT_CLASS_ID_BIT
        | (u32::from(counters.packet()) << 16)
        | layout.vrt_words;
    out[VRT_HEADER_OFFSET..VRT_HEADER_OFFSET + 4].copy_from_slice(&vrt_header.to_be_bytes());

    let order = layout.format.byte_order;
    for s in samples {
        let (first, second) = match layout.format.iq_order {
            IqOrder::IFirst => (s.re, s.im),
            IqOrder::QFirst => (s.im, s.re),
        };
        out.put_slice(&order.i16_bytes(first));
        out.put_slice(&order.i16_bytes(second));
    }
    out.put_u32(VRL_TRAILER);

    debug_assert_eq!(out.len(), layout.frame_len());
    Ok(())
}

/// RFC 1071 one's-complement sum over `header`.
///
/// Computing the checksum of a header that already contains its checksum
/// yields zero.
pub fn internet_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = header.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

// ---------------------------------------------------------------------------
// Context frames
// ---------------------------------------------------------------------------

/// Fields extracted from a radio context packet.
///
/// Frequencies are in Hz after removing the 20-bit fixed-point radix.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ContextFields {
    /// Stream the context describes.
    pub stream_id: u32,
    /// Bandwidth.
    pub bandwidth_hz: Option<i64>,
    /// IF reference frequency.
    pub if_reference_hz: Option<i64>,
    /// RF reference frequency.
    pub rf_reference_hz: Option<i64>,
    /// Reference level (threshold) in dB.
    pub reference_level_db: Option<f32>,
    /// Sample rate.
    pub sample_rate_hz: Option<i64>,
}

struct WordReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    order: ByteOrder,
}

impl WordReader<'_> {
    fn next(&mut self, what: &str) -> Result<u32> {
        let word = self
            .bytes
            .get(self.pos..self.pos + 4)
            .ok_or_else(|| Error::Protocol(format!("context packet truncated in {}", what)))?;
        self.pos += 4;
        Ok(self.order.read_u32([word[0], word[1], word[2], word[3]]))
    }

    fn next_fixed(&mut self, what: &str) -> Result<i64> {
        let ms = self.next(what)?;
        let ls = self.next(what)?;
        let raw = ((u64::from(ms) << 32) | u64::from(ls)) as i64;
        Ok(raw >> CONTEXT_RADIX_BITS)
    }

    fn skip(&mut self, words: usize, what: &str) -> Result<()> {
        for _ in 0..words {
            self.next(what)?;
        }
        Ok(())
    }
}

/// Decode the fields this engine uses from a VRT context packet.
///
/// Every 32-bit word, header included, is read in `byte_order`; 64-bit
/// fields are two words, most significant first.
pub fn decode_context_fields(bytes: &[u8], byte_order: ByteOrder) -> Result<ContextFields> {
    let mut r = WordReader {
        bytes,
        pos: 0,
        order: byte_order,
    };

    let header = r.next("header")?;
    let packet_type = header >> 28;
    if packet_type != VRT_TYPE_CONTEXT && packet_type != VRT_TYPE_CONTEXT + 1 {
        return Err(Error::Protocol(format!(
            "not a context packet (type {})",
            packet_type
        )));
    }
    let size_bytes = 4 * (header & 0xFFFF) as usize;
    if size_bytes > bytes.len() {
        return Err(Error::Protocol(format!(
            "context packet declares {} bytes, buffer has {}",
            size_bytes,
            bytes.len()
        )));
    }
    r.bytes = &bytes[..size_bytes];

    let mut fields = ContextFields {
        stream_id: r.next("stream id")?,
        ..ContextFields::default()
    };
    if header & VRT_CLASS_ID_BIT != 0 {
        r.skip(2, "class id")?;
    }
    if (header >> 22) & 0x3 != 0 {
        r.skip(1, "integer timestamp")?;
    }
    if (header >> 20) & 0x3 != 0 {
        r.skip(2, "fractional timestamp")?;
    }

    let cif = r.next("indicator field")?;
    if cif & CIF_REFERENCE_POINT != 0 {
        r.skip(1, "reference point")?;
    }
    if cif & CIF_BANDWIDTH != 0 {
        fields.bandwidth_hz = Some(r.next_fixed("bandwidth")?);
    }
    if cif & CIF_IF_REFERENCE != 0 {
        fields.if_reference_hz = Some(r.next_fixed("IF reference")?);
    }
    if cif & CIF_RF_REFERENCE != 0 {
        fields.rf_reference_hz = Some(r.next_fixed("RF reference")?);
    }
    if cif & CIF_RF_OFFSET != 0 {
        r.skip(2, "RF offset")?;
    }
    if cif & CIF_IF_BAND_OFFSET != 0 {
        r.skip(2, "IF band offset")?;
    }
    if cif & CIF_REFERENCE_LEVEL != 0 {
        let raw = r.next("reference level")? as u16 as i16;
        fields.reference_level_db = Some(f32::from(raw) / REFERENCE_LEVEL_RADIX);
    }
    if cif & CIF_GAIN != 0 {
        r.skip(1, "gain")?;
    }
    if cif & CIF_OVER_RANGE != 0 {
        r.skip(1, "over-range count")?;
    }
    if cif & CIF_SAMPLE_RATE != 0 {
        fields.sample_rate_hz = Some(r.next_fixed("sample rate")?);
    }

    Ok(fields)
}

/// Encode a context packet carrying the populated `fields`.
///
/// The inverse of [`decode_context_fields`]; used by simulators and tests.
pub fn build_context_packet(fields: &ContextFields, byte_order: ByteOrder) -> Vec<u8> {
    let mut cif = 0u32;
    let mut body: Vec<u32> = Vec::new();

    fn push_fixed(bit: u32, value: Option<i64>, cif: &mut u32, body: &mut Vec<u32>) {
        if let Some(hz) = value {
            *cif |= bit;
            let raw = (hz << CONTEXT_RADIX_BITS) as u64;
            body.push((raw >> 32) as u32);
            body.push(raw as u32);
        }
    }
    push_fixed(CIF_BANDWIDTH, fields.bandwidth_hz, &mut cif, &mut body);
    push_fixed(CIF_IF_REFERENCE, fields.if_reference_hz, &mut cif, &mut body);
    push_fixed(CIF_RF_REFERENCE, fields.rf_reference_hz, &mut cif, &mut body);
    if let Some(db) = fields.reference_level_db {
        cif |= CIF_REFERENCE_LEVEL;
        body.push(u32::from((db * REFERENCE_LEVEL_RADIX).round() as i16 as u16));
    }
    push_fixed(CIF_SAMPLE_RATE, fields.sample_rate_hz, &mut cif, &mut body);

    let words = 3 + body.len() as u32;
    let mut out = Vec::with_capacity(4 * words as usize);
    for word in [(VRT_TYPE_CONTEXT << 28) | words, fields.stream_id, cif]
        .into_iter()
        .chain(body)
    {
        out.extend_from_slice(&byte_order.u32_bytes(word));
    }
    out
}

// ---------------------------------------------------------------------------
// Status frames
// ---------------------------------------------------------------------------

/// Locally tracked buffer status as broadcast to flow-control listeners.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusReport {
    /// DUC index.
    pub channel: u8,
    /// Buffer empty.
    pub empty: bool,
    /// Buffer full.
    pub full: bool,
    /// Underrun flagged by the last poll.
    pub underrun: bool,
    /// Overrun flagged by the last poll.
    pub overrun: bool,
    /// Free space in samples.
    pub free: u32,
    /// Total underruns.
    pub underrun_count: u32,
    /// Total overruns.
    pub overrun_count: u32,
    /// Radio UTC seconds, truncated to 32 bits.
    pub utc_seconds: u32,
}

/// A decoded status frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusFrame {
    /// 20-bit stream id.
    pub stream_id: u32,
    /// 12-bit frame count.
    pub frame_count: u16,
    /// 4-bit packet count.
    pub packet_count: u8,
    /// Status payload.
    pub report: StatusReport,
}

const STATUS_PAYLOAD_WORDS: usize = 6;
const STATUS_VRT_WORDS: usize = VRT_HEADER_WORDS + STATUS_PAYLOAD_WORDS;

/// Length in bytes of a status frame.
pub const STATUS_FRAME_LEN: usize =
    4 * (VRL_HEADER_WORDS + STATUS_VRT_WORDS + VRL_TRAILER_WORDS);

const FLAG_EMPTY: u32 = 1 << 0;
const FLAG_FULL: u32 = 1 << 1;
const FLAG_UNDERRUN: u32 = 1 << 2;
const FLAG_OVERRUN: u32 = 1 << 3;

/// Build a status broadcast frame (a bare VRL frame, network byte order).
pub fn build_status_frame(stream_id: u32, counters: FrameCounters, report: &StatusReport) -> BytesMut {
    let vrl_words = (STATUS_FRAME_LEN / 4) as u32;
    let mut flags = 0;
    if report.empty {
        flags |= FLAG_EMPTY;
    }
    if report.full {
        flags |= FLAG_FULL;
    }
    if report.underrun {
        flags |= FLAG_UNDERRUN;
    }
    if report.overrun {
        flags |= FLAG_OVERRUN;
    }

    let mut out = BytesMut::with_capacity(STATUS_FRAME_LEN);
    out.put_u32(VRL_MAGIC);
    out.put_u32((u32::from(counters.frame()) << 20) | vrl_words);
    out.put_u32(
        (VRT_TYPE_DATA << 28)
            | VRT_CLASS_ID_BIT
            | (u32::from(counters.packet()) << 16)
            | STATUS_VRT_WORDS as u32,
    );
    out.put_u32(stream_id & 0x000F_FFFF);
    out.put_u32(0);
    out.put_u32(u32::from(STATUS_PACKET_CLASS));
    out.put_u32(u32::from(report.channel));
    out.put_u32(flags);
    out.put_u32(report.free);
    out.put_u32(report.underrun_count);
    out.put_u32(report.overrun_count);
    out.put_u32(report.utc_seconds);
    out.put_u32(VRL_TRAILER);
    out
}

/// Decode a status broadcast frame.
pub fn parse_status_frame(data: &[u8]) -> Result<StatusFrame> {
    if data.len() < STATUS_FRAME_LEN {
        return Err(Error::Protocol(format!(
            "status frame too short: {} bytes, expected {}",
            data.len(),
            STATUS_FRAME_LEN
        )));
    }
    let word = |i: usize| u32::from_be_bytes([data[4 * i], data[4 * i + 1], data[4 * i + 2], data[4 * i + 3]]);

    if word(0) != VRL_MAGIC {
        return Err(Error::Protocol(format!("bad VRL magic {:#010x}", word(0))));
    }
    let frame_word = word(1);
    if (frame_word & 0x000F_FFFF) as usize != STATUS_FRAME_LEN / 4 {
        return Err(Error::Protocol(format!(
            "status frame size {} words, expected {}",
            frame_word & 0x000F_FFFF,
            STATUS_FRAME_LEN / 4
        )));
    }
    let vrt = word(2);
    let class = (word(5) & 0xFFFF) as u16;
    if class != STATUS_PACKET_CLASS {
        return Err(Error::Protocol(format!("not a status frame (class {:#06x})", class)));
    }
    if word(STATUS_FRAME_LEN / 4 - 1) != VRL_TRAILER {
        return Err(Error::Protocol("missing VRL trailer".into()));
    }

    let flags = word(7);
    Ok(StatusFrame {
        stream_id: word(3),
        frame_count: (frame_word >> 20) as u16,
        packet_count: ((vrt >> 16) & 0x0F) as u8,
        report: StatusReport {
            channel: word(6) as u8,
            empty: flags & FLAG_EMPTY != 0,
            full: flags & FLAG_FULL != 0,
            underrun: flags & FLAG_UNDERRUN != 0,
            overrun: flags & FLAG_OVERRUN != 0,
            free: word(8),
            underrun_count: word(9),
            overrun_count: word(10),
            utc_seconds: word(11),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_config() -> ChannelConfig {
        ChannelConfig {
            channel: 1,
            stream_id: 0xABC0_0064,
            radio_addr: Ipv4Addr::new(10, 1, 10, 1),
            radio_udp_port: 41001,
            local_addr: Ipv4Addr::new(10, 1, 10, 2),
            local_udp_port: 41002,
            radio_mac: [0x00, 0x50, 0xC2, 0x01, 0x02, 0x03],
            local_mac: [0x02, 0x00, 0x00, 0x00, 0x00, 0x01],
            ..ChannelConfig::default()
        }
    }

    fn small_format(spf: usize) -> FrameFormat {
        FrameFormat {
            samples_per_frame: spf,
            ..FrameFormat::default()
        }
    }

    fn word(bytes: &[u8], offset: usize) -> u32 {
        u32::from_be_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
    }

    #[test]
    fn counters_wrap_at_widths() {
        let mut c = FrameCounters::new();
        for _ in 0..16 {
            c.increment();
        }
        assert_eq!(c.packet(), 0);
        assert_eq!(c.frame(), 16);

        let mut c = FrameCounters::starting_at(4095, 15);
        c.increment();
        assert_eq!((c.frame(), c.packet()), (0, 0));

        let start = FrameCounters::starting_at(123, 7);
        let mut c = start;
        for _ in 0..4096 {
            c.increment();
        }
        assert_eq!(c, start);
    }

    #[test]
    fn checksum_reference_vector() {
        let header = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xC0, 0xA8,
            0x00, 0x01, 0xC0, 0xA8, 0x00, 0xC7,
        ];
        assert_eq!(internet_checksum(&header), 0xB861);

        let mut with_sum = header;
        with_sum[10..12].copy_from_slice(&0xB861u16.to_be_bytes());
        assert_eq!(internet_checksum(&with_sum), 0);
    }

    #[test]
    fn checksum_odd_length_and_carry() {
        assert_eq!(internet_checksum(&[0xFF, 0xFF, 0xFF, 0xFF]), 0x0000);
        assert_eq!(internet_checksum(&[0x01]), !0x0100);
        assert_eq!(internet_checksum(&[]), 0xFFFF);
    }

    #[test]
    fn layout_lengths() {
        let layout = FrameLayout::new(&test_config(), FrameFormat::default()).unwrap();
        assert_eq!(layout.frame_len(), 42 + 4 * (2 + 4 + 1024 + 1));
        assert_eq!(layout.udp_payload_range(), 42..layout.frame_len());
        assert_eq!(layout.stream_id(), 0x0_0064);
        assert_eq!(layout.vrt_words(), 1028);
    }

    #[test]
    fn layout_rejects_oversize_and_empty() {
        assert!(matches!(
            FrameLayout::new(&test_config(), small_format(0)),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            FrameLayout::new(&test_config(), small_format(20_000)),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn frame_headers() {
        let cfg = test_config();
        let layout = FrameLayout::new(&cfg, small_format(4)).unwrap();
        let samples = [IqSample::new(1, -1); 4];
        let mut out = BytesMut::new();
        build_frame(&layout, FrameCounters::starting_at(0xABC, 0x5), &samples, &mut out).unwrap();
        let f = &out[..];

        assert_eq!(f.len(), layout.frame_len());
        assert_eq!(&f[0..6], &cfg.radio_mac);
        assert_eq!(&f[6..12], &cfg.local_mac);
        assert_eq!(&f[12..14], &[0x08, 0x00]);

        let ip = &f[14..34];
        assert_eq!(ip[0], 0x45);
        assert_eq!(ip[9], 17);
        assert_eq!(u16::from_be_bytes([ip[2], ip[3]]) as usize, f.len() - 14);
        assert_eq!(&ip[12..16], &[10, 1, 10, 2]);
        assert_eq!(&ip[16..20], &[10, 1, 10, 1]);
        assert_eq!(internet_checksum(ip), 0);

        let udp = &f[34..42];
        assert_eq!(u16::from_be_bytes([udp[0], udp[1]]), 41002);
        assert_eq!(u16::from_be_bytes([udp[2], udp[3]]), 41001);
        assert_eq!(u16::from_be_bytes([udp[4], udp[5]]) as usize, f.len() - 34);

        assert_eq!(word(f, 42), VRL_MAGIC);
        let frame_word = word(f, 46);
        assert_eq!(frame_word >> 20, 0xABC);
        assert_eq!((frame_word & 0xF_FFFF) as usize, (f.len() - 42) / 4);

        let vrt = word(f, 50);
        assert_eq!(vrt >> 28, 1);
        assert_ne!(vrt & (1 << 27), 0);
        assert_eq!((vrt >> 16) & 0xF, 0x5);
        assert_eq!(vrt & 0xFFFF, 4 + 4);
        assert_eq!(word(f, 54), 0x64);
        assert_eq!(word(f, f.len() - 4), VRL_TRAILER);
    }

    #[test]
    fn payload_byte_and_iq_order() {
        let cfg = test_config();
        let samples = [IqSample::new(0x0102, 0x0304)];
        let mut out = BytesMut::new();

        let big = FrameLayout::new(&cfg, small_format(1)).unwrap();
        build_frame(&big, FrameCounters::new(), &samples, &mut out).unwrap();
        assert_eq!(&out[PAYLOAD_OFFSET..PAYLOAD_OFFSET + 4], &[1, 2, 3, 4]);

        let swapped = FrameLayout::new(
            &cfg,
            FrameFormat {
                samples_per_frame: 1,
                byte_order: ByteOrder::Little,
                iq_order: IqOrder::QFirst,
                ..FrameFormat::default()
            },
        )
        .unwrap();
        build_frame(&swapped, FrameCounters::new(), &samples, &mut out).unwrap();
        assert_eq!(&out[PAYLOAD_OFFSET..PAYLOAD_OFFSET + 4], &[4, 3, 2, 1]);
    }

    #[test]
    fn only_counters_and_payload_vary() {
        let layout = FrameLayout::new(&test_config(), small_format(8)).unwrap();
        let mut a = BytesMut::new();
        let mut b = BytesMut::new();
        build_frame(&layout, FrameCounters::new(), &[IqSample::new(0, 0); 8], &mut a).unwrap();
        build_frame(
            &layout,
            FrameCounters::starting_at(9, 9),
            &[IqSample::new(7, 7); 8],
            &mut b,
        )
        .unwrap();
        assert_eq!(a.len(), b.len());
        let differing: Vec<usize> = (0..a.len()).filter(|&i| a[i] != b[i]).collect();
        assert!(differing.iter().all(|&i| (46..48).contains(&i)
            || (50..52).contains(&i)
            || (PAYLOAD_OFFSET..PAYLOAD_OFFSET + 32).contains(&i)));
    }

    #[test]
    fn payload_length_mismatch() {
        let layout = FrameLayout::new(&test_config(), FrameFormat::default()).unwrap();
        let mut out = BytesMut::new();
        let err = build_frame(&layout, FrameCounters::new(), &[IqSample::new(0, 0); 512], &mut out)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "configuration error: block of 512 samples, frame holds 1024"
        );
    }

    #[test]
    fn context_round_trip_both_orders() {
        let fields = ContextFields {
            stream_id: 0x100,
            bandwidth_hz: Some(40_000_000),
            if_reference_hz: Some(-1_250_000),
            rf_reference_hz: Some(2_400_000_000),
            reference_level_db: Some(-12.5),
            sample_rate_hz: Some(51_200_000),
        };
        for order in [ByteOrder::Big, ByteOrder::Little] {
            let bytes = build_context_packet(&fields, order);
            assert_eq!(decode_context_fields(&bytes, order).unwrap(), fields);
        }
    }

    #[test]
    fn context_applies_radix_shift() {
        // Sample rate only: header, stream id, CIF, two words.
        let raw: u64 = (25_600_000u64 << 20) | 0xF_FFFF;
        let mut bytes = Vec::new();
        for w in [
            (VRT_TYPE_CONTEXT << 28) | 5,
            7,
            CIF_SAMPLE_RATE,
            (raw >> 32) as u32,
            raw as u32,
        ] {
            bytes.extend_from_slice(&w.to_be_bytes());
        }
        let f = decode_context_fields(&bytes, ByteOrder::Big).unwrap();
        assert_eq!(f.sample_rate_hz, Some(25_600_000));
        assert_eq!(f.bandwidth_hz, None);
        assert_eq!(f.stream_id, 7);
    }

    #[test]
    fn context_skips_unused_fields() {
        // Gain and over-range words sit between reference level and sample rate.
        let mut words = vec![
            (VRT_TYPE_CONTEXT << 28) | VRT_CLASS_ID_BIT | 11,
            1,
            0,
            0,
            CIF_REFERENCE_LEVEL | CIF_GAIN | CIF_OVER_RANGE | CIF_SAMPLE_RATE,
            u32::from((-256i16) as u16),
            0xDEAD,
            0xBEEF,
        ];
        let raw = 1_000_000u64 << 20;
        words.push((raw >> 32) as u32);
        words.push(raw as u32);
        words.push(0);
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
        let f = decode_context_fields(&bytes, ByteOrder::Big).unwrap();
        assert_eq!(f.reference_level_db, Some(-2.0));
        assert_eq!(f.sample_rate_hz, Some(1_000_000));
    }

    #[test]
    fn context_rejects_truncated_and_wrong_type() {
        let fields = ContextFields {
            sample_rate_hz: Some(1),
            ..ContextFields::default()
        };
        let bytes = build_context_packet(&fields, ByteOrder::Big);
        assert!(decode_context_fields(&bytes[..bytes.len() - 4], ByteOrder::Big).is_err());

        let mut data_pkt = bytes.clone();
        data_pkt[0] = 0x10;
        assert!(matches!(
            decode_context_fields(&data_pkt, ByteOrder::Big),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn status_round_trip() {
        let report = StatusReport {
            channel: 2,
            empty: false,
            full: true,
            underrun: false,
            overrun: true,
            free: 1234,
            underrun_count: 3,
            overrun_count: 4,
            utc_seconds: 1_700_000_000,
        };
        let bytes = build_status_frame(0x12_3456, FrameCounters::starting_at(7, 3), &report);
        assert_eq!(bytes.len(), STATUS_FRAME_LEN);

        let frame = parse_status_frame(&bytes).unwrap();
        assert_eq!(frame.stream_id, 0x2_3456);
        assert_eq!(frame.frame_count, 7);
        assert_eq!(frame.packet_count, 3);
        assert_eq!(frame.report, report);
    }

    #[test]
    fn status_parse_rejects_garbage() {
        assert!(parse_status_frame(&[0u8; 8]).is_err());

        let mut bytes =
            build_status_frame(1, FrameCounters::new(), &StatusReport::default()).to_vec();
        bytes[0] = 0;
        assert!(parse_status_frame(&bytes).is_err());

        let mut bytes =
            build_status_frame(1, FrameCounters::new(), &StatusReport::default()).to_vec();
        bytes[23] = 0;
        assert!(parse_status_frame(&bytes).is_err());
    }
}
