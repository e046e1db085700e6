//! Log sequence numbers and WAL segment naming.

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

/// A WAL location. The server prints these as `X/Y` with both halves
/// in hex.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Lsn(pub u64);

impl Lsn {
    pub fn segment_number(&self, segment_size: u32) -> u64 {
        self.0 / segment_size as u64
    }
}

impl std::str::FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let mut parts = s.splitn(2, '/');
        let hi = parts.next().unwrap_or("");
        let lo = match parts.next() {
            Some(lo) => lo,
            None => bail!("invalid lsn '{}'", s),
        };
        let hi = u64::from_str_radix(hi, 16)
            .map_err(|_| anyhow::format_err!("invalid lsn '{}'", s))?;
        let lo = u64::from_str_radix(lo, 16)
            .map_err(|_| anyhow::format_err!("invalid lsn '{}'", s))?;
        if lo > 0xFFFF_FFFF {
            bail!("invalid lsn '{}'", s);
        }
        Ok(Lsn((hi << 32) | lo))
    }
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl std::convert::TryFrom<String> for Lsn {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Error> {
        s.parse()
    }
}

impl From<Lsn> for String {
    fn from(lsn: Lsn) -> String {
        lsn.to_string()
    }
}

/// Name of the WAL segment containing `lsn`.
pub fn wal_segment_name(timeline: u32, lsn: Lsn, segment_size: u32) -> String {
    let segments_per_id = 0x1_0000_0000u64 / segment_size as u64;
    let segno = lsn.segment_number(segment_size);
    format!(
        "{:08X}{:08X}{:08X}",
        timeline,
        segno / segments_per_id,
        segno % segments_per_id
    )
}

/// All segment names from the one containing `start` through the one
/// containing `stop`, in order.
pub fn wal_segment_range(
    timeline: u32,
    start: Lsn,
    stop: Lsn,
    segment_size: u32,
) -> Result<Vec<String>, Error> {
    if stop < start {
        bail!("stop lsn {} before start lsn {}", stop, start);
    }
    let first = start.segment_number(segment_size);
    let last = stop.segment_number(segment_size);
    let mut list = Vec::with_capacity((last - first + 1) as usize);
    for segno in first..=last {
        let lsn = Lsn(segno * segment_size as u64);
        list.push(wal_segment_name(timeline, lsn, segment_size));
    }
    Ok(list)
}
