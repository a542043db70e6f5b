//! DUC sample-rate table.
//!
//! The radio selects a DUC's sample rate by index into a fixed table. The
//! first fourteen entries step down by powers of two from the 102.4 Msps
//! converter clock; index 14 is reserved, and the last two entries derive
//! from the 13 MHz narrowband reference.
//!
//! | Index | Rate (sps)        |
//! |-------|-------------------|
//! | 0     | 102 400 000       |
//! | 1     | 51 200 000        |
//! | 2     | 25 600 000        |
//! | 3     | 12 800 000        |
//! | 4     | 6 400 000         |
//! | 5     | 3 200 000         |
//! | 6     | 1 600 000         |
//! | 7     | 800 000           |
//! | 8     | 400 000           |
//! | 9     | 200 000           |
//! | 10    | 100 000           |
//! | 11    | 50 000            |
//! | 12    | 25 000            |
//! | 13    | 12 500            |
//! | 14    | reserved          |
//! | 15    | 13 000 000 / 48   |
//! | 16    | 13 000 000 / 12   |

use ductx_core::{Error, Result};

/// Narrowband reference clock for the computed entries.
const NARROWBAND_CLOCK: f64 = 13_000_000.0;

const RATE_TABLE: [Option<f64>; 17] = [
    Some(102_400_000.0),
    Some(51_200_000.0),
    Some(25_600_000.0),
    Some(12_800_000.0),
    Some(6_400_000.0),
    Some(3_200_000.0),
    Some(1_600_000.0),
    Some(800_000.0),
    Some(400_000.0),
    Some(200_000.0),
    Some(100_000.0),
    Some(50_000.0),
    Some(25_000.0),
    Some(12_500.0),
    None,
    Some(NARROWBAND_CLOCK / 48.0),
    Some(NARROWBAND_CLOCK / 12.0),
];

/// Number of slots in the rate table, reserved slots included.
pub const RATE_TABLE_LEN: usize = RATE_TABLE.len();

/// Map a rate index to its sample rate in samples per second.
///
/// Reserved and out-of-table indices are rejected with
/// [`Error::InvalidParameter`].
pub fn rate_index_to_sample_rate(index: u8) -> Result<f64> {
    RATE_TABLE
        .get(usize::from(index))
        .copied()
        .flatten()
        .ok_or_else(|| Error::InvalidParameter(format!("unsupported DUC rate index {}", index)))
}

/// Find the rate index whose sample rate is exactly `rate`.
pub fn sample_rate_to_rate_index(rate: f64) -> Option<u8> {
    RATE_TABLE
        .iter()
        .position(|r| *r == Some(rate))
        .and_then(|i| u8::try_from(i).ok())
}

/// Iterate over all valid `(index, rate)` pairs.
pub fn valid_rates() -> impl Iterator<Item = (u8, f64)> {
    RATE_TABLE
        .iter()
        .enumerate()
        .filter_map(|(i, r)| Some((u8::try_from(i).ok()?, (*r)?)))
}
