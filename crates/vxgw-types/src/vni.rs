//! VXLAN network identifier with validation.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A 24-bit VXLAN network identifier.
///
/// VNIs are allocated outside the gateway and arrive as plain numbers; this
/// type only guarantees that the value fits the 24 bits of the VXLAN header.
///
/// # Examples
///
/// ```
/// use vxgw_types::Vni;
///
/// let vni = Vni::new(10042).unwrap();
/// assert_eq!(vni.as_u32(), 10042);
///
/// assert!(Vni::new(1 << 24).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Vni(u32);

impl Vni {
    /// Maximum valid VNI.
    pub const MAX: u32 = 0x00ff_ffff;

    /// Creates a new VNI.
    ///
    /// # Errors
    ///
    /// Returns an error if the value does not fit in 24 bits.
    pub const fn new(vni: u32) -> Result<Self, ParseError> {
        if vni <= Self::MAX {
            Ok(Vni(vni))
        } else {
            Err(ParseError::InvalidVni(vni))
        }
    }

    /// Returns the VNI as a u32.
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Vni {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Vni {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let vni: u32 = s
            .trim()
            .parse()
            .map_err(|_| ParseError::InvalidNumber(s.to_string()))?;
        Vni::new(vni)
    }
}

impl TryFrom<u32> for Vni {
    type Error = ParseError;

    fn try_from(vni: u32) -> Result<Self, Self::Error> {
        Vni::new(vni)
    }
}

impl From<Vni> for u32 {
    fn from(vni: Vni) -> u32 {
        vni.0
    }
}
