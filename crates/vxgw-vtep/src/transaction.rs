//! Multi-row device updates committed as a single unit.
//!
//! A [`Transaction`] is an ordered list of [`TableOp`]s. The transport
//! commits all of them or none: if any op fails, the device state is left
//! exactly as it was before the transaction.

use std::fmt;
use std::net::Ipv4Addr;
use vxgw_types::{MacAddress, VlanTag, Vni, VtepMac};

use crate::types::{LogicalSwitchId, McastMac, UcastMac};

/// A single table operation inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableOp {
    /// Insert a logical switch. Fails if the name or VNI is taken.
    InsertLogicalSwitch {
        id: LogicalSwitchId,
        name: String,
        vni: Vni,
        description: String,
    },
    /// Delete a logical switch row. Referencing rows must be gone already.
    DeleteLogicalSwitch { id: LogicalSwitchId },
    /// Bind (port, vlan) to a logical switch, replacing any previous binding
    /// of the same pair.
    BindVlan {
        port: String,
        vlan: VlanTag,
        logical_switch: LogicalSwitchId,
    },
    /// Remove the binding of (port, vlan).
    UnbindVlan { port: String, vlan: VlanTag },
    /// Remove every binding that points at a logical switch.
    ClearBindings { logical_switch: LogicalSwitchId },
    /// Insert or replace a `Ucast_Macs_Remote` row.
    UpsertUcastRemote(UcastMac),
    /// Delete `Ucast_Macs_Remote` rows; `ip: None` matches every ip.
    DeleteUcastRemote {
        logical_switch: LogicalSwitchId,
        mac: MacAddress,
        ip: Option<Ipv4Addr>,
    },
    /// Insert or replace a `Mcast_Macs_Remote` row.
    UpsertMcastRemote(McastMac),
    /// Delete the `Mcast_Macs_Remote` rows for a mac.
    DeleteMcastRemote {
        logical_switch: LogicalSwitchId,
        mac: VtepMac,
    },
    /// Delete every remote MAC row of a logical switch.
    DeleteRemoteMacs { logical_switch: LogicalSwitchId },
}

impl TableOp {
    /// Short operation name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            TableOp::InsertLogicalSwitch { .. } => "insert_logical_switch",
            TableOp::DeleteLogicalSwitch { .. } => "delete_logical_switch",
            TableOp::BindVlan { .. } => "bind_vlan",
            TableOp::UnbindVlan { .. } => "unbind_vlan",
            TableOp::ClearBindings { .. } => "clear_bindings",
            TableOp::UpsertUcastRemote(_) => "upsert_ucast_remote",
            TableOp::DeleteUcastRemote { .. } => "delete_ucast_remote",
            TableOp::UpsertMcastRemote(_) => "upsert_mcast_remote",
            TableOp::DeleteMcastRemote { .. } => "delete_mcast_remote",
            TableOp::DeleteRemoteMacs { .. } => "delete_remote_macs",
        }
    }
}

impl fmt::Display for TableOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableOp::InsertLogicalSwitch { name, vni, .. } => {
                write!(f, "{} {} vni={}", self.name(), name, vni)
            }
            TableOp::DeleteLogicalSwitch { id } => write!(f, "{} {}", self.name(), id),
            TableOp::BindVlan {
                port,
                vlan,
                logical_switch,
            } => write!(f, "{} {}/{} -> {}", self.name(), port, vlan, logical_switch),
            TableOp::UnbindVlan { port, vlan } => write!(f, "{} {}/{}", self.name(), port, vlan),
            TableOp::ClearBindings { logical_switch }
            | TableOp::DeleteRemoteMacs { logical_switch } => {
                write!(f, "{} {}", self.name(), logical_switch)
            }
            TableOp::UpsertUcastRemote(row) => {
                write!(f, "{} {} -> {}", self.name(), row.mac, row.locator)
            }
            TableOp::DeleteUcastRemote { mac, ip, .. } => match ip {
                Some(ip) => write!(f, "{} {} ip={}", self.name(), mac, ip),
                None => write!(f, "{} {} (all ips)", self.name(), mac),
            },
            TableOp::UpsertMcastRemote(row) => {
                write!(f, "{} {} -> {}", self.name(), row.mac, row.locator)
            }
            TableOp::DeleteMcastRemote { mac, .. } => write!(f, "{} {}", self.name(), mac),
        }
    }
}

/// Per-op result of a committed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpResult {
    /// A row was inserted or replaced.
    Upserted,
    /// Number of rows the op removed (may be zero).
    Deleted(usize),
}

impl OpResult {
    /// Rows removed by this op, zero for upserts.
    pub fn deleted(&self) -> usize {
        match self {
            OpResult::Deleted(n) => *n,
            OpResult::Upserted => 0,
        }
    }
}

/// An ordered batch of table operations committed atomically.
///
/// # Example
///
/// ```
/// use vxgw_vtep::{LogicalSwitchId, Transaction};
/// use vxgw_types::VlanTag;
///
/// let ls = LogicalSwitchId::random();
/// let txn = Transaction::new("add_bindings")
///     .bind_vlan("eth0", VlanTag::new(10).unwrap(), ls)
///     .bind_vlan("eth1", VlanTag::UNTAGGED, ls);
/// assert_eq!(txn.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    label: &'static str,
    ops: Vec<TableOp>,
}

impl Transaction {
    /// Creates an empty transaction; `label` names it in logs and errors.
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            ops: Vec::new(),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn ops(&self) -> &[TableOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<TableOp> {
        self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Appends an arbitrary op.
    pub fn push(mut self, op: TableOp) -> Self {
        self.ops.push(op);
        self
    }

    pub fn insert_logical_switch(
        self,
        id: LogicalSwitchId,
        name: impl Into<String>,
        vni: Vni,
    ) -> Self {
        self.push(TableOp::InsertLogicalSwitch {
            id,
            name: name.into(),
            vni,
            description: String::new(),
        })
    }

    pub fn delete_logical_switch(self, id: LogicalSwitchId) -> Self {
        self.push(TableOp::DeleteLogicalSwitch { id })
    }

    pub fn bind_vlan(
        self,
        port: impl Into<String>,
        vlan: VlanTag,
        logical_switch: LogicalSwitchId,
    ) -> Self {
        self.push(TableOp::BindVlan {
            port: port.into(),
            vlan,
            logical_switch,
        })
    }

    pub fn unbind_vlan(self, port: impl Into<String>, vlan: VlanTag) -> Self {
        self.push(TableOp::UnbindVlan {
            port: port.into(),
            vlan,
        })
    }

    pub fn clear_bindings(self, logical_switch: LogicalSwitchId) -> Self {
        self.push(TableOp::ClearBindings { logical_switch })
    }

    pub fn upsert_ucast_remote(self, row: UcastMac) -> Self {
        self.push(TableOp::UpsertUcastRemote(row))
    }

    pub fn delete_ucast_remote(
        self,
        logical_switch: LogicalSwitchId,
        mac: MacAddress,
        ip: Option<Ipv4Addr>,
    ) -> Self {
        self.push(TableOp::DeleteUcastRemote {
            logical_switch,
            mac,
            ip,
        })
    }

    pub fn upsert_mcast_remote(self, row: McastMac) -> Self {
        self.push(TableOp::UpsertMcastRemote(row))
    }

    pub fn delete_mcast_remote(self, logical_switch: LogicalSwitchId, mac: VtepMac) -> Self {
        self.push(TableOp::DeleteMcastRemote {
            logical_switch,
            mac,
        })
    }

    pub fn delete_remote_macs(self, logical_switch: LogicalSwitchId) -> Self {
        self.push(TableOp::DeleteRemoteMacs { logical_switch })
    }
}
