//! Core types used throughout ductx.
//!
//! These describe one radio upconverter channel and the sample format it is
//! fed with, independently of how frames are built or sent.

use std::fmt;
use std::net::Ipv4Addr;

use num_complex::Complex;

/// Byte order of 16-bit I/Q sample words (and of context-frame words) on
/// the wire.
///
/// This is radio configuration, not a protocol constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    /// Network byte order.
    #[default]
    Big,
    /// Little-endian, as produced natively by x86 hosts.
    Little,
}

impl ByteOrder {
    /// Encode a 16-bit sample word.
    pub fn i16_bytes(self, v: i16) -> [u8; 2] {
        match self {
            ByteOrder::Big => v.to_be_bytes(),
            ByteOrder::Little => v.to_le_bytes(),
        }
    }

    /// Decode a 32-bit word.
    pub fn read_u32(self, b: [u8; 4]) -> u32 {
        match self {
            ByteOrder::Big => u32::from_be_bytes(b),
            ByteOrder::Little => u32::from_le_bytes(b),
        }
    }

    /// Encode a 32-bit word.
    pub fn u32_bytes(self, v: u32) -> [u8; 4] {
        match self {
            ByteOrder::Big => v.to_be_bytes(),
            ByteOrder::Little => v.to_le_bytes(),
        }
    }
}

/// Order of the in-phase and quadrature halves of each sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IqOrder {
    /// I first, then Q.
    #[default]
    IFirst,
    /// Q first, then I.
    QFirst,
}

/// A 16-bit complex baseband sample as sent to the radio.
pub type IqSample = Complex<i16>;

/// Physical transmitter RF settings, carried by the one channel in a
/// deployment that owns the RF chain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransmitterConfig {
    /// Transmitter index on the radio (1-based).
    pub index: u8,
    /// RF centre frequency in Hz.
    pub frequency_hz: u64,
    /// Transmitter attenuation in dB.
    pub attenuation_db: f64,
}

/// Static configuration of one radio upconverter (DUC) channel.
///
/// Everything here is pushed to the radio by the channel controller; the
/// addressing half is also baked into every outbound frame header.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    /// DUC index on the radio (1-based).
    pub channel: u8,
    /// Index into the radio's sample-rate table.
    pub rate_index: u8,
    /// Frequency offset from the transmitter centre, in Hz.
    pub frequency_offset_hz: f64,
    /// DUC attenuation in dB.
    pub attenuation_db: f64,
    /// Bitmap of physical transmitters this DUC feeds (bit 0 = TX 1).
    pub tx_channel_mask: u8,
    /// Stream identifier stamped into every frame. Only the low 20 bits
    /// are carried in the class/stream field.
    pub stream_id: u32,
    /// Local network interface the data sockets bind to (e.g. `"eth1"`).
    pub interface: String,
    /// Radio-side 10GbE data port index.
    pub data_port: u8,
    /// Radio data-plane address.
    pub radio_addr: Ipv4Addr,
    /// Radio data-plane UDP port for this stream.
    pub radio_udp_port: u16,
    /// Local source address written into the IP header.
    pub local_addr: Ipv4Addr,
    /// Local source UDP port written into the UDP header.
    pub local_udp_port: u16,
    /// Destination MAC address for the link header.
    pub radio_mac: [u8; 6],
    /// Source MAC address for the link header.
    pub local_mac: [u8; 6],
    /// Shared transmitter frequency/attenuation, if this channel controls
    /// the RF chain.
    pub transmitter: Option<TransmitterConfig>,
}

impl ChannelConfig {
    /// Stream identifier as carried in the 20-bit class/stream field.
    pub fn stream_id_20(&self) -> u32 {
        self.stream_id & 0x000F_FFFF
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            channel: 1,
            rate_index: 0,
            frequency_offset_hz: 0.0,
            attenuation_db: 0.0,
            tx_channel_mask: 0x01,
            stream_id: 0,
            interface: String::from("eth0"),
            data_port: 1,
            radio_addr: Ipv4Addr::new(192, 168, 0, 10),
            radio_udp_port: 0,
            local_addr: Ipv4Addr::UNSPECIFIED,
            local_udp_port: 0,
            radio_mac: [0xFF; 6],
            local_mac: [0x00; 6],
            transmitter: None,
        }
    }
}

impl fmt::Display for ChannelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DUC{} rate={} sid={} if={}",
            self.channel, self.rate_index, self.stream_id, self.interface
        )
    }
}

/// Convert floating-point baseband samples to 16-bit I/Q words.
///
/// Each component is multiplied by `scale`, rounded, and saturated to the
/// `i16` range. This is a plain per-sample loop.
pub fn iq_from_f32(input: &[Complex<f32>], scale: f32, out: &mut Vec<IqSample>) {
    out.clear();
    out.reserve(input.len());
    for s in input {
        out.push(IqSample::new(saturate(s.re * scale), saturate(s.im * scale)));
    }
}

fn saturate(v: f32) -> i16 {
    // `as` saturates on overflow and maps NaN to zero.
    v.round() as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_order_i16() {
        assert_eq!(ByteOrder::Big.i16_bytes(0x1234), [0x12, 0x34]);
        assert_eq!(ByteOrder::Little.i16_bytes(0x1234), [0x34, 0x12]);
    }

    #[test]
    fn byte_order_u32_round_trip() {
        for order in [ByteOrder::Big, ByteOrder::Little] {
            let v = 0xDEAD_BEEF;
            assert_eq!(order.read_u32(order.u32_bytes(v)), v);
        }
        assert_eq!(ByteOrder::Little.read_u32([1, 0, 0, 0]), 1);
        assert_eq!(ByteOrder::Big.read_u32([0, 0, 0, 1]), 1);
    }

    #[test]
    fn stream_id_truncated_to_20_bits() {
        let cfg = ChannelConfig {
            stream_id: 0xABC1_2345,
            ..ChannelConfig::default()
        };
        assert_eq!(cfg.stream_id_20(), 0x1_2345);
    }

    #[test]
    fn iq_conversion_scales_and_saturates() {
        let input = [
            Complex::new(0.5f32, -0.5),
            Complex::new(2.0, -2.0),
            Complex::new(f32::NAN, 0.0),
        ];
        let mut out = Vec::new();
        iq_from_f32(&input, 32767.0, &mut out);
        assert_eq!(out[0], IqSample::new(16384, -16384));
        assert_eq!(out[1], IqSample::new(i16::MAX, i16::MIN));
        assert_eq!(out[2], IqSample::new(0, 0));
    }

    #[test]
    fn display_channel() {
        let cfg = ChannelConfig {
            channel: 2,
            stream_id: 101,
            interface: "eth2".into(),
            ..ChannelConfig::default()
        };
        assert_eq!(cfg.to_string(), "DUC2 rate=0 sid=101 if=eth2");
    }
}
