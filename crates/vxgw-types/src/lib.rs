//! Common types for the VXLAN gateway.
//!
//! This crate provides type-safe representations of the network primitives
//! shared by the VTEP control client and the synchronization broker:
//!
//! - [`MacAddress`]: 48-bit Ethernet MAC addresses
//! - [`VtepMac`]: a MAC as stored in the VTEP tables, which may be the
//!   `unknown-dst` wildcard
//! - [`Vni`]: 24-bit VXLAN network identifiers
//! - [`VlanTag`]: 802.1Q tags as used by VTEP port bindings (0 = untagged)

mod mac;
mod vlan;
mod vni;

pub use mac::{MacAddress, VtepMac};
pub use vlan::VlanTag;
pub use vni::Vni;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid VNI: {0} (must be 0-16777215)")]
    InvalidVni(u32),

    #[error("invalid VLAN tag: {0} (must be 0-4095)")]
    InvalidVlanTag(u16),

    #[error("invalid number: {0}")]
    InvalidNumber(String),
}
