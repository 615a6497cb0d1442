//! Control client for hardware VTEPs.
//!
//! A hardware VTEP exposes its forwarding state as a set of tables:
//!
//! - `Physical_Switch` / `Physical_Port`: device inventory, port VLAN bindings
//! - `Logical_Switch`: forwarding domains, one per VNI
//! - `Ucast_Macs_Local` / `Mcast_Macs_Local`: MACs the device learned itself
//! - `Ucast_Macs_Remote` / `Mcast_Macs_Remote`: MACs the controller pushed
//!
//! [`VtepControlClient`] manages a session to one device and performs the
//! logical-switch, binding and remote-MAC operations on it. Multi-row
//! changes go through a [`Transaction`] so they apply all or nothing. The
//! wire protocol sits behind [`VtepTransport`]; [`MemoryVtep`] is an
//! in-process device used for simulation and tests.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use vxgw_vtep::{MemoryVtep, VtepControlClient, DEFAULT_MGMT_PORT};
//!
//! let device = Arc::new(MemoryVtep::new("vtep0", mgmt_ip, tunnel_ip, ["eth0"]));
//! let client = VtepControlClient::new(device);
//! client.connect(mgmt_ip, DEFAULT_MGMT_PORT).await?;
//! let ls = client.add_logical_switch("mn-net0", Vni::new(10_000)?).await?;
//! ```

mod client;
mod error;
mod memory;
mod transaction;
mod transport;
mod types;

pub use client::{TableUpdates, VtepClientFactory, VtepControlClient};
pub use error::{VtepError, VtepResult};
pub use memory::MemoryVtep;
pub use transaction::{OpResult, TableOp, Transaction};
pub use transport::{TransportEvent, TransportEvents, VtepTransport};
pub use types::{
    tables, Binding, ConnectionState, LogicalSwitch, LogicalSwitchId, McastMac, OpStatus,
    PhysicalPort, PhysicalPortId, PhysicalSwitch, PhysicalSwitchId, RowChange, TableUpdate,
    UcastMac, VtepSnapshot, DEFAULT_MGMT_PORT,
};
