//! VLAN tag type used by VTEP port bindings.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// An 802.1Q tag as it appears in a VTEP `vlan_bindings` map.
///
/// Unlike a switch VLAN id, tag 0 is meaningful here: it binds the untagged
/// traffic of a physical port. Valid range is 0-4095.
///
/// # Examples
///
/// ```
/// use vxgw_types::VlanTag;
///
/// let tag = VlanTag::new(100).unwrap();
/// assert_eq!(tag.as_u16(), 100);
/// assert!(VlanTag::UNTAGGED.is_untagged());
/// assert!(VlanTag::new(4096).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct VlanTag(u16);

impl VlanTag {
    /// Maximum valid tag.
    pub const MAX: u16 = 4095;

    /// Untagged traffic.
    pub const UNTAGGED: VlanTag = VlanTag(0);

    /// Creates a new VLAN tag.
    ///
    /// # Errors
    ///
    /// Returns an error if the tag is above 4095.
    pub const fn new(tag: u16) -> Result<Self, ParseError> {
        if tag <= Self::MAX {
            Ok(VlanTag(tag))
        } else {
            Err(ParseError::InvalidVlanTag(tag))
        }
    }

    /// Returns the tag as a u16.
    pub const fn as_u16(&self) -> u16 {
        self.0
    }

    /// Returns true for the untagged binding.
    pub const fn is_untagged(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for VlanTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for VlanTag {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Handle "Vlan100" format
        let tag_str = if s.to_lowercase().starts_with("vlan") {
            &s[4..]
        } else {
            s
        };

        let tag: u16 = tag_str
            .parse()
            .map_err(|_| ParseError::InvalidNumber(s.to_string()))?;

        VlanTag::new(tag)
    }
}

impl TryFrom<u16> for VlanTag {
    type Error = ParseError;

    fn try_from(tag: u16) -> Result<Self, Self::Error> {
        VlanTag::new(tag)
    }
}

impl From<VlanTag> for u16 {
    fn from(tag: VlanTag) -> u16 {
        tag.0
    }
}
