//! Device side of a broker.
//!
//! The VTEP peer turns the device's local MAC tables into [`MacLocation`]s
//! and writes records from the overlay into the device's remote MAC tables.
//! Local rows only ever reach the stream and remote rows are only ever
//! written, so the device never echoes what the peer applied.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use vxgw_types::VtepMac;
use vxgw_vtep::{LogicalSwitchId, RowChange, TableUpdate, TableUpdates, VtepControlClient};

use crate::error::Result;
use crate::mac_location::MacLocation;
use crate::peer::{PeerUpdates, UpdateStream, VxLanPeer};

struct DeviceState {
    name: String,
    client: Arc<VtepControlClient>,
    stream: UpdateStream,
    switches: Mutex<HashMap<LogicalSwitchId, String>>,
}

impl DeviceState {
    fn switch_name(&self, id: LogicalSwitchId) -> Option<String> {
        let name = self.switches.lock().get(&id).cloned();
        if name.is_none() {
            debug!(peer = %self.name, logical_switch = %id, "Dropping update for unknown logical switch");
        }
        name
    }

    /// Local rows point at the device itself.
    fn endpoint(&self, locator: Ipv4Addr) -> Ipv4Addr {
        self.client.tunnel_ip().unwrap_or(locator)
    }

    fn translate(&self, update: TableUpdate) -> Option<MacLocation> {
        match update {
            TableUpdate::LogicalSwitch(RowChange::Insert(ls)) => {
                self.switches.lock().insert(ls.id, ls.name);
                None
            }
            TableUpdate::LogicalSwitch(RowChange::Delete(ls)) => {
                self.switches.lock().remove(&ls.id);
                None
            }
            TableUpdate::UcastLocal(change) => {
                let row = change.row();
                let ls = self.switch_name(row.logical_switch)?;
                let mac = VtepMac::Ieee(row.mac);
                Some(if change.is_insert() {
                    MacLocation::new(ls, mac, row.ip, Some(self.endpoint(row.locator)))
                } else {
                    MacLocation::withdrawal(ls, mac, row.ip)
                })
            }
            TableUpdate::McastLocal(change) => {
                let row = change.row();
                if !row.mac.is_unknown_dst() {
                    return None;
                }
                let ls = self.switch_name(row.logical_switch)?;
                Some(if change.is_insert() {
                    MacLocation::new(ls, row.mac, None, Some(self.endpoint(row.locator)))
                } else {
                    MacLocation::withdrawal(ls, row.mac, None)
                })
            }
            TableUpdate::UcastRemote(_) | TableUpdate::McastRemote(_) => None,
        }
    }
}

/// VTEP peer over one control client.
pub struct VtepPeer {
    state: Arc<DeviceState>,
    pump: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl VtepPeer {
    pub fn new(client: Arc<VtepControlClient>, mgmt_ip: Ipv4Addr) -> Self {
        let name = format!("vtep({})", mgmt_ip);
        Self {
            state: Arc::new(DeviceState {
                stream: UpdateStream::new(name.clone()),
                name,
                client,
                switches: Mutex::new(HashMap::new()),
            }),
            pump: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn client(&self) -> &Arc<VtepControlClient> {
        &self.state.client
    }
}

async fn pump(state: Arc<DeviceState>, mut updates: TableUpdates, cancel: CancellationToken) {
    loop {
        let update = tokio::select! {
            _ = cancel.cancelled() => return,
            update = updates.recv() => update,
        };

        match update {
            Some(update) => {
                if let Some(ml) = state.translate(update) {
                    state.stream.publish(ml);
                }
            }
            None => {
                info!(peer = %state.name, "VTEP update stream completed");
                state.stream.complete();
                return;
            }
        }
    }
}

#[async_trait]
impl VxLanPeer for VtepPeer {
    fn name(&self) -> &str {
        &self.state.name
    }

    fn observable_updates(&self) -> Result<PeerUpdates> {
        let updates = self.state.stream.take()?;
        if let Some(table_updates) = self.state.client.take_updates() {
            let handle = tokio::spawn(pump(
                Arc::clone(&self.state),
                table_updates,
                self.cancel.clone(),
            ));
            *self.pump.lock() = Some(handle);
        } else {
            // Somebody else consumes the device stream; ours stays empty.
            debug!(peer = %self.state.name, "Device update stream already taken");
        }
        Ok(updates)
    }

    async fn apply(&self, ml: &MacLocation) -> Result<()> {
        let client = &self.state.client;
        if ml.tunnel_endpoint.is_some() && ml.tunnel_endpoint == client.tunnel_ip() {
            debug!(peer = %self.state.name, %ml, "Skipping record pointing at the device itself");
            return Ok(());
        }

        let Some(ls) = client.get_logical_switch_by_name(&ml.logical_switch).await? else {
            debug!(peer = %self.state.name, %ml, "Dropping record for logical switch absent from the device");
            return Ok(());
        };

        let status = match (ml.mac, ml.tunnel_endpoint) {
            (VtepMac::Ieee(mac), Some(endpoint)) if mac.is_unicast() => {
                client
                    .add_ucast_mac_remote_by_id(ls.id, mac, ml.ip, endpoint)
                    .await?;
                None
            }
            (VtepMac::Ieee(mac), None) if mac.is_unicast() => Some(
                client
                    .del_ucast_mac_remote_by_id(ls.id, mac, ml.ip)
                    .await?,
            ),
            (mac, Some(endpoint)) => {
                client
                    .add_mcast_mac_remote_by_id(ls.id, mac, endpoint)
                    .await?;
                None
            }
            (mac, None) => Some(client.del_mcast_mac_remote_all_ips_by_id(ls.id, mac).await?),
        };

        if status.is_some_and(|s| s.is_not_found()) {
            debug!(peer = %self.state.name, %ml, "Nothing to withdraw");
        }
        Ok(())
    }

    async fn stop(&self) {
        self.cancel.cancel();
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            let _ = pump.await;
        }
        self.state.stream.complete();
        info!(peer = %self.state.name, "VTEP peer stopped");
    }
}
