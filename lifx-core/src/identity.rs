//! Device identity: hardware addresses, wire packing, IPv6 link-local derivation, source ids.

use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Hardware address of a device (6 octets). The all-zero address targets every device.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Default)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    /// Broadcast sentinel: "any device may reply".
    pub const BROADCAST: MacAddr = MacAddr([0; 6]);

    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        MacAddr(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == [0; 6]
    }

    /// Pack into the 64-bit frame-address target field.
    /// The printed octet order is reversed into the integer so that, once written
    /// little-endian, the octets appear on the wire in printed order followed by two zeros.
    pub fn to_wire(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf[..6].copy_from_slice(&self.0);
        u64::from_le_bytes(buf)
    }

    /// Inverse of [`MacAddr::to_wire`]. The two high bytes are ignored.
    pub fn from_wire(value: u64) -> Self {
        let buf = value.to_le_bytes();
        let mut out = [0u8; 6];
        out.copy_from_slice(&buf[..6]);
        MacAddr(out)
    }

    /// Derive the modified EUI-64 address of this device inside `prefix` (four groups,
    /// e.g. `fe80:0:0:0`). The universal/local bit of the first octet is inverted.
    pub fn ipv6_link_local(&self, prefix: &str) -> Result<Ipv6Addr, MacParseError> {
        let [a, b, c, d, e, f] = self.0;
        let high2 = u16::from_be_bytes([a, b]) ^ 0x0200;
        let low2 = u16::from_be_bytes([e, f]);
        let text = format!(
            "{}:{:04x}:{:02x}ff:fe{:02x}:{:04x}",
            prefix.trim_end_matches(':'),
            high2,
            c,
            d,
            low2
        );
        text.parse()
            .map_err(|_| MacParseError::InvalidPrefix(prefix.to_string()))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Error parsing a hardware address or deriving an address from it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MacParseError {
    #[error("expected 12 hex digits, got {0}")]
    BadLength(usize),
    #[error("invalid hex digit {0:?}")]
    BadDigit(char),
    #[error("invalid ipv6 prefix {0:?}")]
    InvalidPrefix(String),
}

impl FromStr for MacAddr {
    type Err = MacParseError;

    /// Accepts `d0:73:d5:01:02:03`, `D0-73-D5-01-02-03`, `d073.d501.0203`, `d073d5010203`...
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: Vec<char> = s
            .chars()
            .filter(|c| !matches!(c, ' ' | '.' | ':' | '-'))
            .collect();
        if digits.len() != 12 {
            return Err(MacParseError::BadLength(digits.len()));
        }
        let mut out = [0u8; 6];
        for (i, pair) in digits.chunks(2).enumerate() {
            let hi = pair[0].to_digit(16).ok_or(MacParseError::BadDigit(pair[0]))?;
            let lo = pair[1].to_digit(16).ok_or(MacParseError::BadDigit(pair[1]))?;
            out[i] = (hi * 16 + lo) as u8;
        }
        Ok(MacAddr(out))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Random per-session source identifier. Zero is avoided: devices broadcast replies to it.
pub fn random_source_id() -> u32 {
    rand::thread_rng().gen_range(1..=u32::MAX)
}
