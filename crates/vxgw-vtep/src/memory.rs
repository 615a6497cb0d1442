//! In-memory VTEP.
//!
//! [`MemoryVtep`] keeps the VTEP tables in process and implements
//! [`VtepTransport`] over them. It backs the simulation mode of the
//! gateway daemon and the tests. Transactions are committed on a copy of
//! the tables and swapped in only when every op succeeded, so a failing op
//! leaves the device untouched.
//!
//! Beyond the management interface, the device can be driven from the
//! "wire" side: [`MemoryVtep::learn_ucast_local`] plays a host appearing
//! behind a bound port, and [`MemoryVtep::drop_connection`] plays a lost
//! management session.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use vxgw_types::{MacAddress, VtepMac};

use crate::error::{VtepError, VtepResult};
use crate::transaction::{OpResult, TableOp, Transaction};
use crate::transport::{TransportEvent, TransportEvents, VtepTransport};
use crate::types::{
    tables::LOGICAL_SWITCH, LogicalSwitch, LogicalSwitchId, McastMac, PhysicalPort, PhysicalSwitch,
    PhysicalSwitchId, RowChange, TableUpdate, UcastMac, VtepSnapshot,
};

type FaultFn = Box<dyn Fn(&TableOp) -> bool + Send + Sync>;

struct Device {
    tables: VtepSnapshot,
    reachable: bool,
    session: Option<mpsc::UnboundedSender<TransportEvent>>,
    fault: Option<FaultFn>,
    sessions_opened: usize,
}

/// A VTEP whose tables live in memory.
pub struct MemoryVtep {
    mgmt_ip: Ipv4Addr,
    tunnel_ip: Ipv4Addr,
    device: Mutex<Device>,
}

impl MemoryVtep {
    /// Creates a device with one physical switch and the given ports.
    pub fn new<I, S>(name: &str, mgmt_ip: Ipv4Addr, tunnel_ip: Ipv4Addr, ports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let physical_ports: Vec<PhysicalPort> = ports.into_iter().map(PhysicalPort::new).collect();
        let physical_switch = PhysicalSwitch {
            id: PhysicalSwitchId::random(),
            name: name.to_string(),
            description: String::new(),
            mgmt_ips: vec![mgmt_ip],
            tunnel_ips: vec![tunnel_ip],
            ports: physical_ports.iter().map(|p| p.id).collect(),
        };

        Self {
            mgmt_ip,
            tunnel_ip,
            device: Mutex::new(Device {
                tables: VtepSnapshot {
                    physical_switches: vec![physical_switch],
                    physical_ports,
                    ..Default::default()
                },
                reachable: true,
                session: None,
                fault: None,
                sessions_opened: 0,
            }),
        }
    }

    pub fn mgmt_ip(&self) -> Ipv4Addr {
        self.mgmt_ip
    }

    pub fn tunnel_ip(&self) -> Ipv4Addr {
        self.tunnel_ip
    }

    /// Current device tables, whether or not a session is open.
    pub fn tables(&self) -> VtepSnapshot {
        self.device.lock().tables.clone()
    }

    pub fn is_open(&self) -> bool {
        self.device.lock().session.is_some()
    }

    /// Number of sessions opened so far.
    pub fn sessions_opened(&self) -> usize {
        self.device.lock().sessions_opened
    }

    /// Unreachable devices refuse new sessions.
    pub fn set_reachable(&self, reachable: bool) {
        self.device.lock().reachable = reachable;
    }

    /// Makes every transaction containing an op matching `fault` fail.
    pub fn fail_when<F>(&self, fault: F)
    where
        F: Fn(&TableOp) -> bool + Send + Sync + 'static,
    {
        self.device.lock().fault = Some(Box::new(fault));
    }

    pub fn clear_fault(&self) {
        self.device.lock().fault = None;
    }

    /// Drops the open session as if the connection was lost.
    pub fn drop_connection(&self, reason: &str) {
        if let Some(session) = self.device.lock().session.take() {
            warn!(mgmt_ip = %self.mgmt_ip, reason, "Dropping VTEP session");
            let _ = session.send(TransportEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
    }

    /// Learns a host behind one of the device ports.
    pub fn learn_ucast_local(
        &self,
        ls_name: &str,
        mac: MacAddress,
        ip: Option<Ipv4Addr>,
    ) -> VtepResult<()> {
        let mut device = self.device.lock();
        let ls = device
            .tables
            .logical_switch_by_name(ls_name)
            .map(|ls| ls.id)
            .ok_or_else(|| {
                VtepError::device("learn_ucast_local", format!("unknown logical switch {}", ls_name))
            })?;

        let row = UcastMac::new(ls, mac, ip, self.tunnel_ip);
        let mut changes = Vec::new();
        upsert_ucast(
            &mut device.tables.ucast_macs_local,
            row,
            &mut changes,
            TableUpdate::UcastLocal,
        );
        device.publish(changes);
        Ok(())
    }

    /// Forgets a local host; returns the number of rows removed.
    pub fn forget_ucast_local(&self, ls_name: &str, mac: MacAddress) -> usize {
        let mut device = self.device.lock();
        let Some(ls) = device.tables.logical_switch_by_name(ls_name).map(|ls| ls.id) else {
            return 0;
        };

        let mut changes = Vec::new();
        let removed = remove_rows(
            &mut device.tables.ucast_macs_local,
            |row| row.logical_switch == ls && row.mac == mac,
            &mut changes,
            TableUpdate::UcastLocal,
        );
        device.publish(changes);
        removed
    }

    fn apply(
        &self,
        tables: &mut VtepSnapshot,
        op: &TableOp,
        changes: &mut Vec<TableUpdate>,
    ) -> VtepResult<OpResult> {
        match op {
            TableOp::InsertLogicalSwitch {
                id,
                name,
                vni,
                description,
            } => {
                if tables.logical_switch_by_name(name).is_some() {
                    return Err(VtepError::already_exists(
                        LOGICAL_SWITCH,
                        format!("name={}", name),
                    ));
                }
                if tables.logical_switches.iter().any(|ls| ls.vni == *vni) {
                    return Err(VtepError::already_exists(
                        LOGICAL_SWITCH,
                        format!("vni={}", vni),
                    ));
                }
                if tables.logical_switch_by_id(*id).is_some() {
                    return Err(VtepError::already_exists(
                        LOGICAL_SWITCH,
                        format!("id={}", id),
                    ));
                }

                let ls = LogicalSwitch {
                    id: *id,
                    name: name.clone(),
                    vni: *vni,
                    description: description.clone(),
                };
                tables.logical_switches.push(ls.clone());
                changes.push(TableUpdate::LogicalSwitch(RowChange::Insert(ls)));
                Ok(OpResult::Upserted)
            }

            TableOp::DeleteLogicalSwitch { id } => {
                let Some(pos) = tables.logical_switches.iter().position(|ls| ls.id == *id) else {
                    return Ok(OpResult::Deleted(0));
                };
                let bound = tables
                    .physical_ports
                    .iter()
                    .any(|p| p.vlan_bindings.values().any(|ls| ls == id));
                let has_remote = tables.ucast_macs_remote.iter().any(|m| m.logical_switch == *id)
                    || tables.mcast_macs_remote.iter().any(|m| m.logical_switch == *id);
                if bound || has_remote {
                    return Err(VtepError::device(
                        op.name(),
                        format!("logical switch {} is still referenced", id),
                    ));
                }

                remove_rows(
                    &mut tables.ucast_macs_local,
                    |m| m.logical_switch == *id,
                    changes,
                    TableUpdate::UcastLocal,
                );
                remove_rows(
                    &mut tables.mcast_macs_local,
                    |m| m.logical_switch == *id,
                    changes,
                    TableUpdate::McastLocal,
                );
                let ls = tables.logical_switches.remove(pos);
                changes.push(TableUpdate::LogicalSwitch(RowChange::Delete(ls)));
                Ok(OpResult::Deleted(1))
            }

            TableOp::BindVlan {
                port,
                vlan,
                logical_switch,
            } => {
                if tables.logical_switch_by_id(*logical_switch).is_none() {
                    return Err(VtepError::device(
                        op.name(),
                        format!("unknown logical switch {}", logical_switch),
                    ));
                }
                let Some(physical_port) =
                    tables.physical_ports.iter_mut().find(|p| p.name == *port)
                else {
                    return Err(VtepError::device(
                        op.name(),
                        format!("unknown port {}", port),
                    ));
                };

                let previous = physical_port.vlan_bindings.insert(*vlan, *logical_switch);
                if let Some(previous) = previous.filter(|ls| ls != logical_switch) {
                    self.sync_flood_local(tables, previous, changes);
                }
                self.sync_flood_local(tables, *logical_switch, changes);
                Ok(OpResult::Upserted)
            }

            TableOp::UnbindVlan { port, vlan } => {
                let removed = tables
                    .physical_ports
                    .iter_mut()
                    .find(|p| p.name == *port)
                    .and_then(|p| p.vlan_bindings.remove(vlan));
                match removed {
                    Some(ls) => {
                        self.sync_flood_local(tables, ls, changes);
                        Ok(OpResult::Deleted(1))
                    }
                    None => Ok(OpResult::Deleted(0)),
                }
            }

            TableOp::ClearBindings { logical_switch } => {
                let mut count = 0;
                for port in tables.physical_ports.iter_mut() {
                    let before = port.vlan_bindings.len();
                    port.vlan_bindings.retain(|_, ls| *ls != *logical_switch);
                    count += before - port.vlan_bindings.len();
                }
                self.sync_flood_local(tables, *logical_switch, changes);
                Ok(OpResult::Deleted(count))
            }

            TableOp::UpsertUcastRemote(row) => {
                require_logical_switch(tables, op, row.logical_switch)?;
                upsert_ucast(
                    &mut tables.ucast_macs_remote,
                    row.clone(),
                    changes,
                    TableUpdate::UcastRemote,
                );
                Ok(OpResult::Upserted)
            }

            TableOp::DeleteUcastRemote {
                logical_switch,
                mac,
                ip,
            } => Ok(OpResult::Deleted(remove_rows(
                &mut tables.ucast_macs_remote,
                |m| {
                    m.logical_switch == *logical_switch
                        && m.mac == *mac
                        && ip.map_or(true, |ip| m.ip == Some(ip))
                },
                changes,
                TableUpdate::UcastRemote,
            ))),

            TableOp::UpsertMcastRemote(row) => {
                require_logical_switch(tables, op, row.logical_switch)?;
                upsert_mcast(
                    &mut tables.mcast_macs_remote,
                    row.clone(),
                    changes,
                    TableUpdate::McastRemote,
                );
                Ok(OpResult::Upserted)
            }

            TableOp::DeleteMcastRemote {
                logical_switch,
                mac,
            } => Ok(OpResult::Deleted(remove_rows(
                &mut tables.mcast_macs_remote,
                |m| m.logical_switch == *logical_switch && m.mac == *mac,
                changes,
                TableUpdate::McastRemote,
            ))),

            TableOp::DeleteRemoteMacs { logical_switch } => {
                let ucast = remove_rows(
                    &mut tables.ucast_macs_remote,
                    |m| m.logical_switch == *logical_switch,
                    changes,
                    TableUpdate::UcastRemote,
                );
                let mcast = remove_rows(
                    &mut tables.mcast_macs_remote,
                    |m| m.logical_switch == *logical_switch,
                    changes,
                    TableUpdate::McastRemote,
                );
                Ok(OpResult::Deleted(ucast + mcast))
            }
        }
    }

    /// A bound logical switch floods its unknown-dst traffic from this
    /// device's tunnel ip; an unbound one has no local flood row.
    fn sync_flood_local(
        &self,
        tables: &mut VtepSnapshot,
        logical_switch: LogicalSwitchId,
        changes: &mut Vec<TableUpdate>,
    ) {
        let bound = tables
            .physical_ports
            .iter()
            .any(|p| p.vlan_bindings.values().any(|ls| *ls == logical_switch));
        let present = tables
            .mcast_macs_local
            .iter()
            .any(|m| m.logical_switch == logical_switch && m.mac.is_unknown_dst());

        if bound && !present {
            let row = McastMac::new(logical_switch, VtepMac::UnknownDst, self.tunnel_ip);
            tables.mcast_macs_local.push(row.clone());
            changes.push(TableUpdate::McastLocal(RowChange::Insert(row)));
        } else if !bound && present {
            remove_rows(
                &mut tables.mcast_macs_local,
                |m| m.logical_switch == logical_switch && m.mac.is_unknown_dst(),
                changes,
                TableUpdate::McastLocal,
            );
        }
    }
}

impl Device {
    fn publish(&self, changes: Vec<TableUpdate>) {
        let Some(session) = &self.session else {
            return;
        };
        for change in changes {
            let _ = session.send(TransportEvent::Update(change));
        }
    }
}

#[async_trait]
impl VtepTransport for MemoryVtep {
    async fn open(&self, mgmt_ip: Ipv4Addr, mgmt_port: u16) -> VtepResult<TransportEvents> {
        let mut device = self.device.lock();
        if !device.reachable {
            return Err(VtepError::connection(mgmt_ip, mgmt_port, "connection refused"));
        }
        if mgmt_ip != self.mgmt_ip {
            return Err(VtepError::connection(mgmt_ip, mgmt_port, "no route to host"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        device.session = Some(tx);
        device.sessions_opened += 1;
        debug!(%mgmt_ip, mgmt_port, "VTEP session opened");
        Ok(rx)
    }

    async fn close(&self) {
        if self.device.lock().session.take().is_some() {
            debug!(mgmt_ip = %self.mgmt_ip, "VTEP session closed");
        }
    }

    async fn snapshot(&self) -> VtepResult<VtepSnapshot> {
        let device = self.device.lock();
        if device.session.is_none() {
            return Err(VtepError::NotConnected);
        }
        Ok(device.tables.clone())
    }

    async fn transact(&self, txn: Transaction) -> VtepResult<Vec<OpResult>> {
        let mut device = self.device.lock();
        if device.session.is_none() {
            return Err(VtepError::NotConnected);
        }

        let mut tables = device.tables.clone();
        let mut changes = Vec::new();
        let mut results = Vec::with_capacity(txn.len());

        for op in txn.ops() {
            if device.fault.as_ref().is_some_and(|fault| fault(op)) {
                return Err(VtepError::device(txn.label(), format!("{} failed", op)));
            }
            let result = self.apply(&mut tables, op, &mut changes).map_err(|e| {
                debug!(label = txn.label(), %op, error = %e, "Transaction aborted");
                e
            })?;
            results.push(result);
        }

        device.tables = tables;
        device.publish(changes);
        Ok(results)
    }
}

fn require_logical_switch(
    tables: &VtepSnapshot,
    op: &TableOp,
    logical_switch: LogicalSwitchId,
) -> VtepResult<()> {
    if tables.logical_switch_by_id(logical_switch).is_some() {
        Ok(())
    } else {
        Err(VtepError::device(
            op.name(),
            format!("unknown logical switch {}", logical_switch),
        ))
    }
}

fn upsert_ucast(
    rows: &mut Vec<UcastMac>,
    row: UcastMac,
    changes: &mut Vec<TableUpdate>,
    wrap: fn(RowChange<UcastMac>) -> TableUpdate,
) {
    match rows.iter_mut().find(|existing| existing.same_key(&row)) {
        Some(existing) if *existing == row => {}
        Some(existing) => {
            let old = std::mem::replace(existing, row.clone());
            changes.push(wrap(RowChange::Delete(old)));
            changes.push(wrap(RowChange::Insert(row)));
        }
        None => {
            rows.push(row.clone());
            changes.push(wrap(RowChange::Insert(row)));
        }
    }
}

fn upsert_mcast(
    rows: &mut Vec<McastMac>,
    row: McastMac,
    changes: &mut Vec<TableUpdate>,
    wrap: fn(RowChange<McastMac>) -> TableUpdate,
) {
    match rows.iter_mut().find(|existing| existing.same_key(&row)) {
        Some(existing) if *existing == row => {}
        Some(existing) => {
            let old = std::mem::replace(existing, row.clone());
            changes.push(wrap(RowChange::Delete(old)));
            changes.push(wrap(RowChange::Insert(row)));
        }
        None => {
            rows.push(row.clone());
            changes.push(wrap(RowChange::Insert(row)));
        }
    }
}

fn remove_rows<T, P>(
    rows: &mut Vec<T>,
    matches: P,
    changes: &mut Vec<TableUpdate>,
    wrap: fn(RowChange<T>) -> TableUpdate,
) -> usize
where
    P: Fn(&T) -> bool,
{
    let (removed, kept): (Vec<T>, Vec<T>) = std::mem::take(rows).into_iter().partition(&matches);
    *rows = kept;
    let count = removed.len();
    changes.extend(removed.into_iter().map(|row| wrap(RowChange::Delete(row))));
    count
}
