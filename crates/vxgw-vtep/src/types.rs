//! VTEP table rows and snapshots.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use uuid::Uuid;
use vxgw_types::{MacAddress, VlanTag, Vni, VtepMac};

/// Default management port of the VTEP configuration database.
pub const DEFAULT_MGMT_PORT: u16 = 6632;

/// VTEP schema table names, used in errors and logs.
pub mod tables {
    pub const PHYSICAL_SWITCH: &str = "Physical_Switch";
    pub const PHYSICAL_PORT: &str = "Physical_Port";
    pub const LOGICAL_SWITCH: &str = "Logical_Switch";
    pub const UCAST_MACS_LOCAL: &str = "Ucast_Macs_Local";
    pub const UCAST_MACS_REMOTE: &str = "Ucast_Macs_Remote";
    pub const MCAST_MACS_LOCAL: &str = "Mcast_Macs_Local";
    pub const MCAST_MACS_REMOTE: &str = "Mcast_Macs_Remote";
}

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generates a fresh random id.
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

row_id!(
    /// Row id of a `Logical_Switch`.
    LogicalSwitchId
);
row_id!(
    /// Row id of a `Physical_Switch`.
    PhysicalSwitchId
);
row_id!(
    /// Row id of a `Physical_Port`.
    PhysicalPortId
);

/// Connection state of a VTEP control session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a delete-style operation.
///
/// Deleting something that is not there is an expected outcome, so it is
/// reported here rather than as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpStatus {
    /// At least one row was affected.
    Applied,
    /// No row matched.
    NotFound,
}

impl OpStatus {
    /// Maps a count of affected rows to a status.
    pub fn from_count(count: usize) -> Self {
        if count == 0 {
            OpStatus::NotFound
        } else {
            OpStatus::Applied
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, OpStatus::NotFound)
    }
}

/// A forwarding domain on the device, bound to one VNI.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicalSwitch {
    pub id: LogicalSwitchId,
    pub name: String,
    pub vni: Vni,
    pub description: String,
}

impl LogicalSwitch {
    pub fn new(id: LogicalSwitchId, name: impl Into<String>, vni: Vni) -> Self {
        Self {
            id,
            name: name.into(),
            vni,
            description: String::new(),
        }
    }
}

/// Device inventory entry for the physical switch itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalSwitch {
    pub id: PhysicalSwitchId,
    pub name: String,
    pub description: String,
    pub mgmt_ips: Vec<Ipv4Addr>,
    pub tunnel_ips: Vec<Ipv4Addr>,
    pub ports: Vec<PhysicalPortId>,
}

impl PhysicalSwitch {
    /// The address remote peers should tunnel to, if the device reports one.
    pub fn tunnel_ip(&self) -> Option<Ipv4Addr> {
        self.tunnel_ips.first().copied()
    }
}

/// Device inventory entry for a physical port and its VLAN bindings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalPort {
    pub id: PhysicalPortId,
    pub name: String,
    pub description: String,
    pub vlan_bindings: BTreeMap<VlanTag, LogicalSwitchId>,
}

impl PhysicalPort {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: PhysicalPortId::random(),
            name: name.into(),
            description: String::new(),
            vlan_bindings: BTreeMap::new(),
        }
    }
}

/// A (port, vlan) pair bound to a logical switch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Binding {
    pub port_name: String,
    pub vlan: VlanTag,
}

impl Binding {
    pub fn new(port_name: impl Into<String>, vlan: VlanTag) -> Self {
        Self {
            port_name: port_name.into(),
            vlan,
        }
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port_name, self.vlan)
    }
}

/// A row of `Ucast_Macs_Local` or `Ucast_Macs_Remote`.
///
/// Rows are keyed by (logical switch, mac, ip).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UcastMac {
    pub logical_switch: LogicalSwitchId,
    pub mac: MacAddress,
    pub ip: Option<Ipv4Addr>,
    pub locator: Ipv4Addr,
}

impl UcastMac {
    pub fn new(
        logical_switch: LogicalSwitchId,
        mac: MacAddress,
        ip: Option<Ipv4Addr>,
        locator: Ipv4Addr,
    ) -> Self {
        Self {
            logical_switch,
            mac,
            ip,
            locator,
        }
    }

    pub fn same_key(&self, other: &UcastMac) -> bool {
        self.logical_switch == other.logical_switch && self.mac == other.mac && self.ip == other.ip
    }
}

/// A row of `Mcast_Macs_Local` or `Mcast_Macs_Remote`.
///
/// Rows are keyed by (logical switch, mac); the mac is usually `unknown-dst`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct McastMac {
    pub logical_switch: LogicalSwitchId,
    pub mac: VtepMac,
    pub ip: Option<Ipv4Addr>,
    pub locator: Ipv4Addr,
}

impl McastMac {
    pub fn new(logical_switch: LogicalSwitchId, mac: VtepMac, locator: Ipv4Addr) -> Self {
        Self {
            logical_switch,
            mac,
            ip: None,
            locator,
        }
    }

    pub fn same_key(&self, other: &McastMac) -> bool {
        self.logical_switch == other.logical_switch && self.mac == other.mac
    }
}

/// Insert or delete of a single row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowChange<T> {
    Insert(T),
    Delete(T),
}

impl<T> RowChange<T> {
    pub fn row(&self) -> &T {
        match self {
            RowChange::Insert(row) | RowChange::Delete(row) => row,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, RowChange::Insert(_))
    }
}

/// A change notification from the device's tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableUpdate {
    LogicalSwitch(RowChange<LogicalSwitch>),
    UcastLocal(RowChange<UcastMac>),
    UcastRemote(RowChange<UcastMac>),
    McastLocal(RowChange<McastMac>),
    McastRemote(RowChange<McastMac>),
}

impl TableUpdate {
    /// The VTEP table this update belongs to.
    pub fn table(&self) -> &'static str {
        match self {
            TableUpdate::LogicalSwitch(_) => tables::LOGICAL_SWITCH,
            TableUpdate::UcastLocal(_) => tables::UCAST_MACS_LOCAL,
            TableUpdate::UcastRemote(_) => tables::UCAST_MACS_REMOTE,
            TableUpdate::McastLocal(_) => tables::MCAST_MACS_LOCAL,
            TableUpdate::McastRemote(_) => tables::MCAST_MACS_REMOTE,
        }
    }
}

/// Full read of the device tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VtepSnapshot {
    pub physical_switches: Vec<PhysicalSwitch>,
    pub physical_ports: Vec<PhysicalPort>,
    pub logical_switches: Vec<LogicalSwitch>,
    pub ucast_macs_local: Vec<UcastMac>,
    pub ucast_macs_remote: Vec<UcastMac>,
    pub mcast_macs_local: Vec<McastMac>,
    pub mcast_macs_remote: Vec<McastMac>,
}

impl VtepSnapshot {
    pub fn logical_switch_by_name(&self, name: &str) -> Option<&LogicalSwitch> {
        self.logical_switches.iter().find(|ls| ls.name == name)
    }

    pub fn logical_switch_by_id(&self, id: LogicalSwitchId) -> Option<&LogicalSwitch> {
        self.logical_switches.iter().find(|ls| ls.id == id)
    }

    /// Replays the snapshot as a sequence of inserts.
    ///
    /// Logical switches come first so that consumers can resolve the MAC
    /// rows that reference them.
    pub fn into_updates(self) -> Vec<TableUpdate> {
        let mut updates = Vec::with_capacity(
            self.logical_switches.len()
                + self.ucast_macs_local.len()
                + self.ucast_macs_remote.len()
                + self.mcast_macs_local.len()
                + self.mcast_macs_remote.len(),
        );
        updates.extend(
            self.logical_switches
                .into_iter()
                .map(|ls| TableUpdate::LogicalSwitch(RowChange::Insert(ls))),
        );
        updates.extend(
            self.ucast_macs_local
                .into_iter()
                .map(|m| TableUpdate::UcastLocal(RowChange::Insert(m))),
        );
        updates.extend(
            self.mcast_macs_local
                .into_iter()
                .map(|m| TableUpdate::McastLocal(RowChange::Insert(m))),
        );
        updates.extend(
            self.ucast_macs_remote
                .into_iter()
                .map(|m| TableUpdate::UcastRemote(RowChange::Insert(m))),
        );
        updates.extend(
            self.mcast_macs_remote
                .into_iter()
                .map(|m| TableUpdate::McastRemote(RowChange::Insert(m))),
        );
        updates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_op_status_from_count() {
        assert_eq!(OpStatus::from_count(0), OpStatus::NotFound);
        assert_eq!(OpStatus::from_count(3), OpStatus::Applied);
        assert!(OpStatus::NotFound.is_not_found());
    }

    #[test]
    fn test_ucast_key_ignores_locator() {
        let ls = LogicalSwitchId::random();
        let mac = MacAddress::new([2, 0, 0, 0, 0, 1]);
        let a = UcastMac::new(ls, mac, None, Ipv4Addr::new(10, 0, 0, 1));
        let b = UcastMac::new(ls, mac, None, Ipv4Addr::new(10, 0, 0, 2));
        let c = UcastMac::new(ls, mac, Some(Ipv4Addr::new(192, 168, 0, 1)), a.locator);
        assert!(a.same_key(&b));
        assert!(!a.same_key(&c));
    }

    #[test]
    fn test_snapshot_replays_logical_switches_first() {
        let ls = LogicalSwitch::new(LogicalSwitchId::random(), "ls0", Vni::new(7).unwrap());
        let mac = UcastMac::new(
            ls.id,
            MacAddress::new([2, 0, 0, 0, 0, 9]),
            None,
            Ipv4Addr::new(10, 0, 0, 1),
        );
        let snapshot = VtepSnapshot {
            ucast_macs_local: vec![mac.clone()],
            logical_switches: vec![ls.clone()],
            ..Default::default()
        };

        let updates = snapshot.into_updates();
        assert_eq!(
            updates,
            vec![
                TableUpdate::LogicalSwitch(RowChange::Insert(ls)),
                TableUpdate::UcastLocal(RowChange::Insert(mac)),
            ]
        );
        assert_eq!(updates[1].table(), tables::UCAST_MACS_LOCAL);
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
    }
}
