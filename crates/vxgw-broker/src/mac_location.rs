//! The unit of replicated forwarding state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use uuid::Uuid;
use vxgw_types::VtepMac;

/// Prefix of logical switches that represent overlay networks.
pub const LOGICAL_SWITCH_PREFIX: &str = "mn-";

/// Name of the logical switch representing overlay network `network`.
///
/// # Example
///
/// ```
/// use uuid::Uuid;
/// use vxgw_broker::{logical_switch_name, network_id};
///
/// let network = Uuid::nil();
/// let name = logical_switch_name(network);
/// assert_eq!(name, "mn-00000000-0000-0000-0000-000000000000");
/// assert_eq!(network_id(&name), Some(network));
/// ```
pub fn logical_switch_name(network: Uuid) -> String {
    format!("{}{}", LOGICAL_SWITCH_PREFIX, network.hyphenated())
}

/// Overlay network represented by a logical switch, if any.
pub fn network_id(ls_name: &str) -> Option<Uuid> {
    ls_name
        .strip_prefix(LOGICAL_SWITCH_PREFIX)
        .and_then(|id| Uuid::parse_str(id).ok())
}

/// Where a MAC (optionally with an IP) lives: behind which tunnel endpoint,
/// in which logical switch.
///
/// A record without tunnel endpoint is a withdrawal: it removes whatever was
/// known for (logical switch, mac[, ip]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MacLocation {
    /// Logical switch name, see [`logical_switch_name`].
    pub logical_switch: String,
    pub mac: VtepMac,
    pub ip: Option<Ipv4Addr>,
    pub tunnel_endpoint: Option<Ipv4Addr>,
}

impl MacLocation {
    pub fn new(
        logical_switch: impl Into<String>,
        mac: VtepMac,
        ip: Option<Ipv4Addr>,
        tunnel_endpoint: Option<Ipv4Addr>,
    ) -> Self {
        Self {
            logical_switch: logical_switch.into(),
            mac,
            ip,
            tunnel_endpoint,
        }
    }

    /// Withdrawal of (logical switch, mac[, ip]).
    pub fn withdrawal(logical_switch: impl Into<String>, mac: VtepMac, ip: Option<Ipv4Addr>) -> Self {
        Self::new(logical_switch, mac, ip, None)
    }

    pub fn is_withdrawal(&self) -> bool {
        self.tunnel_endpoint.is_none()
    }

    /// Identity of the entry this record writes or removes.
    pub fn key(&self) -> (&str, VtepMac, Option<Ipv4Addr>) {
        (&self.logical_switch, self.mac, self.ip)
    }

    /// Overlay network of the logical switch, if it represents one.
    pub fn network_id(&self) -> Option<Uuid> {
        network_id(&self.logical_switch)
    }
}

impl fmt::Display for MacLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mac)?;
        if let Some(ip) = self.ip {
            write!(f, "/{}", ip)?;
        }
        match self.tunnel_endpoint {
            Some(endpoint) => write!(f, " at {} in {}", endpoint, self.logical_switch),
            None => write!(f, " withdrawn from {}", self.logical_switch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_network_id_rejects_foreign_names() {
        assert_eq!(network_id("ls1"), None);
        assert_eq!(network_id("mn-not-a-uuid"), None);
        assert_eq!(network_id("MN-00000000-0000-0000-0000-000000000000"), None);
    }

    #[test]
    fn test_display() {
        let mac: VtepMac = "02:00:00:00:00:01".parse().unwrap();
        let ml = MacLocation::new(
            "mn-x",
            mac,
            Some(Ipv4Addr::new(172, 16, 0, 5)),
            Some(Ipv4Addr::new(10, 0, 0, 1)),
        );
        assert_eq!(ml.to_string(), "02:00:00:00:00:01/172.16.0.5 at 10.0.0.1 in mn-x");

        let ml = MacLocation::withdrawal("mn-x", VtepMac::UnknownDst, None);
        assert!(ml.is_withdrawal());
        assert_eq!(ml.to_string(), "unknown-dst withdrawn from mn-x");
    }

    #[test]
    fn test_key_ignores_endpoint() {
        let a = MacLocation::new("ls", VtepMac::UnknownDst, None, Some(Ipv4Addr::new(1, 1, 1, 1)));
        let b = MacLocation::withdrawal("ls", VtepMac::UnknownDst, None);
        assert_eq!(a.key(), b.key());
        assert_ne!(a, b);
    }
}
