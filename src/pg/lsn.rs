//! Log Sequence Numbers
//!
//! PostgreSQL write-ahead log positions in their `X/Y` text form.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// A write-ahead log position
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

// On the wire and in JSON an LSN travels in its PostgreSQL text form
impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

impl Lsn {
    /// The zero position, reported before any WAL has been observed
    pub const ZERO: Lsn = Lsn(0);

    /// Whether any WAL position has been observed at all
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Bytes between two positions, saturating at zero
    pub fn distance_from(&self, other: Lsn) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s
            .split_once('/')
            .ok_or_else(|| Error::Protocol(format!("invalid LSN: {s}")))?;
        let hi = u64::from_str_radix(hi, 16)
            .map_err(|_| Error::Protocol(format!("invalid LSN: {s}")))?;
        let lo = u64::from_str_radix(lo, 16)
            .map_err(|_| Error::Protocol(format!("invalid LSN: {s}")))?;
        if hi > u32::MAX as u64 || lo > u32::MAX as u64 {
            return Err(Error::Protocol(format!("LSN out of range: {s}")));
        }
        Ok(Lsn((hi << 32) | lo))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let lsn: Lsn = "0/3000".parse().unwrap();
        assert_eq!(lsn, Lsn(0x3000));
        assert_eq!(lsn.to_string(), "0/3000");

        let lsn: Lsn = "16/B374D848".parse().unwrap();
        assert_eq!(lsn, Lsn((0x16 << 32) | 0xB374D848));
        assert_eq!(lsn.to_string(), "16/B374D848");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<Lsn>().is_err());
        assert!("3000".parse::<Lsn>().is_err());
        assert!("0/XYZ".parse::<Lsn>().is_err());
        assert!("100000000/0".parse::<Lsn>().is_err());
    }

    #[test]
    fn test_serde_uses_text_form() {
        let lsn: Lsn = "0/3100".parse().unwrap();
        let json = serde_json::to_string(&lsn).unwrap();
        assert_eq!(json, "\"0/3100\"");
        let back: Lsn = serde_json::from_str(&json).unwrap();
        assert_eq!(back, lsn);
    }

    #[test]
    fn test_ordering() {
        let a: Lsn = "0/3000".parse().unwrap();
        let b: Lsn = "0/3100".parse().unwrap();
        assert!(a < b);
        assert_eq!(b.distance_from(a), 0x100);
        assert_eq!(a.distance_from(b), 0);
    }
}
