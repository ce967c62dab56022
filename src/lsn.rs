use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A write-ahead log position, in the usual `XXXXXXXX/XXXXXXXX` text form.
///
/// Stored as the underlying 64-bit position so that "has this standby caught
/// up" style comparisons are plain integer comparisons.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Lsn(u64);

impl Lsn {
    pub fn new(position: u64) -> Self {
        Lsn(position)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// The "0/0" position, reported while the local database is unreachable.
    pub fn zero() -> Self {
        Lsn(0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("malformed WAL position {0:?}")]
pub struct ParseLsnError(String);

impl FromStr for Lsn {
    type Err = ParseLsnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(2, '/');
        let hi = parts.next().ok_or_else(|| ParseLsnError(s.to_string()))?;
        let lo = parts.next().ok_or_else(|| ParseLsnError(s.to_string()))?;

        let hi = u64::from_str_radix(hi, 16).map_err(|_| ParseLsnError(s.to_string()))?;
        let lo = u64::from_str_radix(lo, 16).map_err(|_| ParseLsnError(s.to_string()))?;
        if hi > u64::from(u32::MAX) || lo > u64::from(u32::MAX) {
            return Err(ParseLsnError(s.to_string()));
        }

        Ok(Lsn((hi << 32) | lo))
    }
}

impl std::convert::TryFrom<String> for Lsn {
    type Error = ParseLsnError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Lsn> for String {
    fn from(lsn: Lsn) -> String {
        lsn.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_round_trip() {
        let lsn: Lsn = "16/B374D848".parse().unwrap();
        assert_eq!(lsn.as_u64(), (0x16 << 32) | 0xB374D848);
        assert_eq!(lsn.to_string(), "16/B374D848");

        assert_eq!("0/0".parse::<Lsn>().unwrap(), Lsn::zero());
    }

    #[test]
    fn ordering_follows_position() {
        let older: Lsn = "0/5000060".parse().unwrap();
        let newer: Lsn = "1/10".parse().unwrap();
        assert!(older < newer);
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<Lsn>().is_err());
        assert!("16".parse::<Lsn>().is_err());
        assert!("xyz/123".parse::<Lsn>().is_err());
        assert!("100000000/0".parse::<Lsn>().is_err());
    }
}
