//! MAC address types with safe parsing and formatting.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A 48-bit Ethernet MAC address.
///
/// # Examples
///
/// ```
/// use vxgw_types::MacAddress;
///
/// let mac: MacAddress = "00:11:22:33:44:55".parse().unwrap();
/// assert_eq!(mac.to_string(), "00:11:22:33:44:55");
///
/// // Also supports hyphen-separated format
/// let mac2: MacAddress = "00-11-22-33-44-55".parse().unwrap();
/// assert_eq!(mac, mac2);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// The broadcast MAC address (FF:FF:FF:FF:FF:FF).
    pub const BROADCAST: MacAddress = MacAddress([0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);

    /// The zero/null MAC address (00:00:00:00:00:00).
    pub const ZERO: MacAddress = MacAddress([0, 0, 0, 0, 0, 0]);

    /// Creates a new MAC address from raw bytes.
    pub const fn new(bytes: [u8; 6]) -> Self {
        MacAddress(bytes)
    }

    /// Returns the raw bytes of the MAC address.
    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Returns true if this is a multicast address.
    ///
    /// A multicast address has the least significant bit of the first octet set.
    pub const fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    /// Returns true if this is a unicast address.
    pub const fn is_unicast(&self) -> bool {
        !self.is_multicast()
    }

    /// Returns true if this is the broadcast address.
    pub const fn is_broadcast(&self) -> bool {
        self.0[0] == 0xff && self.0[1] == 0xff && self.0[2] == 0xff
            && self.0[3] == 0xff && self.0[4] == 0xff && self.0[5] == 0xff
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let separator = if s.contains(':') { ':' } else { '-' };

        let parts: Vec<&str> = s.split(separator).collect();
        if parts.len() != 6 {
            return Err(ParseError::InvalidMacAddress(s.to_string()));
        }

        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return Err(ParseError::InvalidMacAddress(s.to_string()));
            }
            bytes[i] = u8::from_str_radix(part, 16)
                .map_err(|_| ParseError::InvalidMacAddress(s.to_string()))?;
        }

        Ok(MacAddress(bytes))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> String {
        mac.to_string()
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        MacAddress(bytes)
    }
}

/// A MAC address as found in the VTEP `*_Macs_*` tables.
///
/// Besides concrete addresses the VTEP schema accepts the literal
/// `unknown-dst`, which matches any destination the switch has no entry for
/// (unknown unicast, broadcast and multicast). Entries keyed by it decide
/// where flooded traffic goes.
///
/// ```
/// use vxgw_types::VtepMac;
///
/// let wildcard: VtepMac = "unknown-dst".parse().unwrap();
/// assert!(wildcard.is_unknown_dst());
///
/// let mac: VtepMac = "aa:bb:cc:dd:ee:ff".parse().unwrap();
/// assert!(mac.ieee().is_some());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum VtepMac {
    /// A concrete MAC address.
    Ieee(MacAddress),
    /// The `unknown-dst` wildcard.
    UnknownDst,
}

impl VtepMac {
    /// The literal used by the VTEP schema for the wildcard.
    pub const UNKNOWN_DST: &'static str = "unknown-dst";

    /// Returns true if this is the `unknown-dst` wildcard.
    pub const fn is_unknown_dst(&self) -> bool {
        matches!(self, VtepMac::UnknownDst)
    }

    /// Returns the concrete address, if any.
    pub const fn ieee(&self) -> Option<MacAddress> {
        match self {
            VtepMac::Ieee(mac) => Some(*mac),
            VtepMac::UnknownDst => None,
        }
    }

    /// Returns true for a concrete unicast address.
    pub const fn is_ucast(&self) -> bool {
        match self {
            VtepMac::Ieee(mac) => mac.is_unicast(),
            VtepMac::UnknownDst => false,
        }
    }
}

impl fmt::Display for VtepMac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VtepMac::Ieee(mac) => mac.fmt(f),
            VtepMac::UnknownDst => f.write_str(Self::UNKNOWN_DST),
        }
    }
}

impl FromStr for VtepMac {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == Self::UNKNOWN_DST {
            Ok(VtepMac::UnknownDst)
        } else {
            s.parse().map(VtepMac::Ieee)
        }
    }
}

impl TryFrom<String> for VtepMac {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<VtepMac> for String {
    fn from(mac: VtepMac) -> String {
        mac.to_string()
    }
}

impl From<MacAddress> for VtepMac {
    fn from(mac: MacAddress) -> Self {
        VtepMac::Ieee(mac)
    }
}
