//! Control-plane command encoding and response decoding.
//!
//! The radio speaks newline-terminated ASCII over TCP. Commands are a
//! keyword followed by comma-separated arguments; queries end the keyword
//! with `?`. Replies are one or more lines beginning with the keyword.
//!
//! ```text
//! Command:   DUC 1, 1, 0, 0, 0, 1, 0, 100
//! Reply:     OK
//! Query:     DUCSTAT? 1
//! Reply:     DUCSTAT 1, 0, 0, 65536, 0, 0, 0, 0
//! Error:     ERROR: <reason>
//! ```
//!
//! All encoding/decoding in this module is pure parsing -- no I/O is
//! performed.

use ductx_core::{ChannelConfig, Error, Result};

/// DUC mode argument for normal streaming operation.
pub const DUC_MODE_STREAM: u8 = 0;

/// Keyword of the buffer-status reply.
pub const DUC_STATUS_KEYWORD: &str = "DUCSTAT";

/// Number of fields in a buffer-status reply.
pub const DUC_STATUS_FIELDS: usize = 8;

/// Keyword of the UTC reply.
pub const UTC_KEYWORD: &str = "UTC";

// ---------------------------------------------------------------------------
// Command builders
//
// Each builder returns the command line WITHOUT the trailing newline; the
// command channel appends it.
// ---------------------------------------------------------------------------

/// Build the combined DUC configuration command.
///
/// A disabled DUC is configured with transmit mask 0.
///
/// Example output: `"DUC 1, 1, 0, 0, 0, 1, 0, 100"`
pub fn cmd_duc(config: &ChannelConfig, enabled: bool) -> String {
    let mask = if enabled { config.tx_channel_mask } else { 0 };
    format!(
        "DUC {}, {}, {}, {}, {}, {}, {}, {}",
        config.channel,
        config.data_port,
        config.frequency_offset_hz,
        config.attenuation_db,
        config.rate_index,
        mask,
        DUC_MODE_STREAM,
        config.stream_id
    )
}

/// Build a transmitter frequency command.
///
/// Example output: `"TXF 1, 915.000000"`
pub fn cmd_tx_frequency(tx: u8, freq_hz: u64) -> String {
    format!("TXF {}, {:.6}", tx, hz_to_mhz(freq_hz))
}

/// Build a transmitter attenuation command.
///
/// Example output: `"TXA 1, 10"`
pub fn cmd_tx_attenuation(tx: u8, attenuation_db: f64) -> String {
    format!("TXA {}, {}", tx, attenuation_db)
}

/// Build a buffer-status query.
///
/// Example output: `"DUCSTAT? 1"`
pub fn cmd_duc_status(channel: u8) -> String {
    format!("DUCSTAT? {}", channel)
}

/// Build a UTC query.
pub fn cmd_utc() -> String {
    "UTC?".to_string()
}

/// Build a group membership command.
///
/// Example output: `"DUCG 1, 2, 1"`
pub fn cmd_group_member(group: u8, channel: u8, member: bool) -> String {
    format!("DUCG {}, {}, {}", group, channel, u8::from(member))
}

/// Build a group enable command.
///
/// Example output: `"DUCGE 1, 0"`
pub fn cmd_group_enable(group: u8, enable: bool) -> String {
    format!("DUCGE {}, {}", group, u8::from(enable))
}

/// Convert frequency in Hz to MHz for transmitter commands.
pub fn hz_to_mhz(hz: u64) -> f64 {
    hz as f64 / 1_000_000.0
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

/// Decoded buffer-status reply for one DUC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DucStatus {
    /// DUC index the reply refers to.
    pub channel: u8,
    /// Buffer is empty.
    pub empty: bool,
    /// Buffer is full.
    pub full: bool,
    /// Free space in samples.
    pub free: u32,
    /// An underrun occurred since the last report.
    pub underrun: bool,
    /// Total underruns.
    pub underrun_count: u32,
    /// An overrun occurred since the last report.
    pub overrun: bool,
    /// Total overruns.
    pub overrun_count: u32,
}

/// Keyword a command's reply lines begin with (`"DUCSTAT? 1"` -> `"DUCSTAT"`).
pub fn reply_keyword(command: &str) -> &str {
    let word = command.split_whitespace().next().unwrap_or("");
    word.strip_suffix('?').unwrap_or(word)
}

/// Return the first `ERROR` line, if the radio rejected the command.
pub fn find_error(lines: &[String]) -> Option<&str> {
    lines
        .iter()
        .map(|l| l.trim())
        .find(|l| l.starts_with("ERROR"))
}

/// Find the reply line whose leading token is exactly `keyword`.
pub fn find_reply<'a>(lines: &'a [String], keyword: &str) -> Option<&'a str> {
    lines
        .iter()
        .map(|l| l.trim())
        .find(|l| l.split_whitespace().next() == Some(keyword))
}

/// Split a reply line into its comma-separated fields, requiring exactly
/// `expected` of them.
///
/// Fewer or more fields is a protocol error; nothing is indexed past a
/// count check.
pub fn split_fields<'a>(line: &'a str, keyword: &str, expected: usize) -> Result<Vec<&'a str>> {
    let body = line
        .trim()
        .strip_prefix(keyword)
        .ok_or_else(|| Error::Protocol(format!("reply does not start with {}: {}", keyword, line)))?
        .trim();

    let fields: Vec<&str> = if body.is_empty() {
        Vec::new()
    } else {
        body.split(',').map(str::trim).collect()
    };

    if fields.len() != expected {
        return Err(Error::Protocol(format!(
            "{} has {} fields, expected {}",
            keyword,
            fields.len(),
            expected
        )));
    }
    Ok(fields)
}

/// Check that a set command was acknowledged.
///
/// An `ERROR` line becomes a protocol error; a reply with no lines at all
/// means the radio never answered.
pub fn check_ack(command: &str, lines: &[String]) -> Result<()> {
    if let Some(err) = find_error(lines) {
        return Err(Error::Protocol(format!("{} rejected: {}", reply_keyword(command), err)));
    }
    if lines.iter().all(|l| l.trim().is_empty()) {
        return Err(Error::Timeout);
    }
    if lines.iter().any(|l| l.trim() == "OK") {
        Ok(())
    } else {
        Err(Error::Protocol(format!(
            "unexpected reply to {}: {:?}",
            reply_keyword(command),
            lines
        )))
    }
}

/// Parse the fields of a `DUCSTAT` reply.
pub fn parse_duc_status(fields: &[&str]) -> Result<DucStatus> {
    if fields.len() != DUC_STATUS_FIELDS {
        return Err(Error::Protocol(format!(
            "{} has {} fields, expected {}",
            DUC_STATUS_KEYWORD,
            fields.len(),
            DUC_STATUS_FIELDS
        )));
    }
    Ok(DucStatus {
        channel: parse_num(fields[0], "channel")?,
        empty: parse_flag(fields[1], "empty")?,
        full: parse_flag(fields[2], "full")?,
        free: parse_num(fields[3], "free")?,
        underrun: parse_flag(fields[4], "underrun")?,
        underrun_count: parse_num(fields[5], "underrun count")?,
        overrun: parse_flag(fields[6], "overrun")?,
        overrun_count: parse_num(fields[7], "overrun count")?,
    })
}

/// Locate and parse the `DUCSTAT` reply among `lines`.
pub fn parse_duc_status_reply(lines: &[String]) -> Result<DucStatus> {
    let line = find_reply(lines, DUC_STATUS_KEYWORD)
        .ok_or_else(|| Error::Protocol(format!("no {} line in reply", DUC_STATUS_KEYWORD)))?;
    parse_duc_status(&split_fields(line, DUC_STATUS_KEYWORD, DUC_STATUS_FIELDS)?)
}

/// Locate and parse the `UTC` reply among `lines`.
pub fn parse_utc_reply(lines: &[String]) -> Result<u64> {
    let line = find_reply(lines, UTC_KEYWORD)
        .ok_or_else(|| Error::Protocol(format!("no {} line in reply", UTC_KEYWORD)))?;
    let fields = split_fields(line, UTC_KEYWORD, 1)?;
    parse_num(fields[0], "UTC seconds")
}

fn parse_num<T: std::str::FromStr>(s: &str, what: &str) -> Result<T> {
    s.parse()
        .map_err(|_| Error::Protocol(format!("invalid {}: {}", what, s)))
}

fn parse_flag(s: &str, what: &str) -> Result<bool> {
    match s {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(Error::Protocol(format!("invalid {} flag: {}", what, other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn cmd_duc_enabled_and_disabled() {
        let cfg = ChannelConfig {
            channel: 2,
            data_port: 1,
            rate_index: 3,
            tx_channel_mask: 0b11,
            stream_id: 101,
            frequency_offset_hz: 1_500.0,
            attenuation_db: 6.5,
            ..ChannelConfig::default()
        };
        assert_eq!(cmd_duc(&cfg, true), "DUC 2, 1, 1500, 6.5, 3, 3, 0, 101");
        assert_eq!(cmd_duc(&cfg, false), "DUC 2, 1, 1500, 6.5, 3, 0, 0, 101");
    }

    #[test]
    fn cmd_transmitter() {
        assert_eq!(cmd_tx_frequency(1, 915_000_000), "TXF 1, 915.000000");
        assert_eq!(cmd_tx_attenuation(2, 10.0), "TXA 2, 10");
    }

    #[test]
    fn cmd_queries_and_groups() {
        assert_eq!(cmd_duc_status(3), "DUCSTAT? 3");
        assert_eq!(cmd_utc(), "UTC?");
        assert_eq!(cmd_group_member(1, 2, true), "DUCG 1, 2, 1");
        assert_eq!(cmd_group_member(4, 8, false), "DUCG 4, 8, 0");
        assert_eq!(cmd_group_enable(1, false), "DUCGE 1, 0");
    }

    #[test]
    fn reply_keyword_strips_query_mark() {
        assert_eq!(reply_keyword("DUCSTAT? 1"), "DUCSTAT");
        assert_eq!(reply_keyword("UTC?"), "UTC");
        assert_eq!(reply_keyword("DUCGE 1, 1"), "DUCGE");
    }

    #[test]
    fn parse_status_exact() {
        let reply = lines(&["DUCSTAT 1, 0, 1, 0, 1, 7, 0, 2"]);
        let status = parse_duc_status_reply(&reply).unwrap();
        assert_eq!(
            status,
            DucStatus {
                channel: 1,
                empty: false,
                full: true,
                free: 0,
                underrun: true,
                underrun_count: 7,
                overrun: false,
                overrun_count: 2,
            }
        );
    }

    #[test]
    fn parse_status_skips_unrelated_lines() {
        let reply = lines(&["OK", "DUCSTAT 2, 1, 0, 4096, 0, 0, 0, 0"]);
        assert_eq!(parse_duc_status_reply(&reply).unwrap().free, 4096);
    }

    #[test]
    fn parse_status_too_few_fields() {
        let reply = lines(&["DUCSTAT 1, 0, 0, 4096"]);
        let err = parse_duc_status_reply(&reply).unwrap_err();
        assert_eq!(err.to_string(), "protocol error: DUCSTAT has 4 fields, expected 8");
    }

    #[test]
    fn parse_status_too_many_fields() {
        let reply = lines(&["DUCSTAT 1, 0, 0, 4096, 0, 0, 0, 0, 9"]);
        assert!(matches!(parse_duc_status_reply(&reply), Err(Error::Protocol(_))));
    }

    #[test]
    fn parse_status_bad_flag() {
        let reply = lines(&["DUCSTAT 1, 2, 0, 4096, 0, 0, 0, 0"]);
        assert!(matches!(parse_duc_status_reply(&reply), Err(Error::Protocol(_))));
    }

    #[test]
    fn parse_status_keyword_must_match_exactly() {
        let reply = lines(&["DUCSTATX 1, 0, 0, 4096, 0, 0, 0, 0"]);
        assert!(matches!(parse_duc_status_reply(&reply), Err(Error::Protocol(_))));
    }

    #[test]
    fn parse_utc() {
        assert_eq!(parse_utc_reply(&lines(&["UTC 1700000000"])).unwrap(), 1_700_000_000);
        assert!(parse_utc_reply(&lines(&["UTC"])).is_err());
        assert!(parse_utc_reply(&lines(&["UTC 1, 2"])).is_err());
        assert!(parse_utc_reply(&lines(&["UTC abc"])).is_err());
    }

    #[test]
    fn ack_variants() {
        assert!(check_ack("DUCGE 1, 1", &lines(&["OK"])).is_ok());
        assert!(matches!(check_ack("DUCGE 1, 1", &[]), Err(Error::Timeout)));

        let err = check_ack("DUCG 9, 1, 1", &lines(&["ERROR: group 9 out of range"])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "protocol error: DUCG rejected: ERROR: group 9 out of range"
        );

        assert!(matches!(
            check_ack("DUC 1", &lines(&["WHAT"])),
            Err(Error::Protocol(_))
        ));
    }
}
