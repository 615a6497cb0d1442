//! VtepControlClient - control session to one hardware VTEP.
//!
//! The client owns the device connection and is the only component that
//! issues control calls against it. It tracks the [`ConnectionState`],
//! forwards device table updates to a single consumer, and turns the
//! logical-switch / binding / remote-MAC operations into [`Transaction`]s
//! that the transport commits atomically.
//!
//! # Connection state machine
//!
//! ```text
//! Disconnected --connect()--> Connecting --session open--> Connected
//!      ^                          |                            |
//!      +------- open failed ------+                            |
//!      +------------ disconnect() or connection loss ----------+
//! ```
//!
//! Every control operation issued while not `Connected` fails with
//! [`VtepError::NotConnected`].

use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use vxgw_types::{MacAddress, VlanTag, Vni, VtepMac};

use crate::error::{VtepError, VtepResult};
use crate::transaction::{OpResult, Transaction};
use crate::transport::{TransportEvent, TransportEvents, VtepTransport};
use crate::types::{
    tables, Binding, ConnectionState, LogicalSwitch, LogicalSwitchId, McastMac, OpStatus,
    PhysicalPort, PhysicalSwitch, PhysicalSwitchId, TableUpdate, UcastMac, VtepSnapshot,
};

/// Receiving half of the device table-update stream.
pub type TableUpdates = mpsc::UnboundedReceiver<TableUpdate>;

/// Creates control clients, one per device.
pub trait VtepClientFactory: Send + Sync {
    fn create(&self) -> Arc<VtepControlClient>;
}

impl<F> VtepClientFactory for F
where
    F: Fn() -> Arc<VtepControlClient> + Send + Sync,
{
    fn create(&self) -> Arc<VtepControlClient> {
        self()
    }
}

#[derive(Default)]
struct Session {
    mgmt_ip: Option<Ipv4Addr>,
    mgmt_port: Option<u16>,
    tunnel_ip: Option<Ipv4Addr>,
    generation: u64,
    updates_tx: Option<mpsc::UnboundedSender<TableUpdate>>,
    updates_rx: Option<TableUpdates>,
    pump: Option<JoinHandle<()>>,
}

struct Inner {
    transport: Arc<dyn VtepTransport>,
    session: Mutex<Session>,
    state: watch::Sender<ConnectionState>,
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Called by the pump when the transport stream ends.
    fn on_session_end(&self, generation: u64, reason: Option<String>) {
        let mut session = self.session.lock();
        if session.generation != generation || self.state() == ConnectionState::Disconnected {
            return;
        }

        warn!(
            mgmt_ip = ?session.mgmt_ip,
            reason = reason.as_deref().unwrap_or("session closed"),
            "Lost connection to VTEP"
        );
        self.state.send_replace(ConnectionState::Disconnected);
        session.updates_tx = None;
        session.pump = None;
    }
}

/// Control client for a single VTEP.
///
/// Constructed per device; there is no process-wide connection registry.
pub struct VtepControlClient {
    inner: Arc<Inner>,
}

impl VtepControlClient {
    /// Creates a disconnected client over the given transport.
    pub fn new(transport: Arc<dyn VtepTransport>) -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            inner: Arc::new(Inner {
                transport,
                session: Mutex::new(Session {
                    updates_tx: Some(updates_tx),
                    updates_rx: Some(updates_rx),
                    ..Default::default()
                }),
                state,
            }),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Watch over the connection state.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Takes the table-update stream.
    ///
    /// The stream carries a baseline of the device tables as inserts right
    /// after connecting, then every committed change. It completes when the
    /// session ends. There is a single consumer per session: the first call
    /// returns the stream, later calls return `None` until a new session is
    /// opened.
    pub fn take_updates(&self) -> Option<TableUpdates> {
        self.inner.session.lock().updates_rx.take()
    }

    /// Management address of the current or last session.
    pub fn management_ip(&self) -> Option<Ipv4Addr> {
        self.inner.session.lock().mgmt_ip
    }

    /// Management port of the current or last session.
    pub fn management_port(&self) -> Option<u16> {
        self.inner.session.lock().mgmt_port
    }

    /// Tunnel endpoint of the device, read from its physical switch at
    /// connect time.
    pub fn tunnel_ip(&self) -> Option<Ipv4Addr> {
        self.inner.session.lock().tunnel_ip
    }

    /// Opens the session to the device.
    ///
    /// Connecting an already connected (or connecting) client is a no-op.
    #[instrument(skip(self))]
    pub async fn connect(&self, mgmt_ip: Ipv4Addr, mgmt_port: u16) -> VtepResult<()> {
        let generation = {
            let mut session = self.inner.session.lock();
            if self.inner.state() != ConnectionState::Disconnected {
                debug!(state = %self.inner.state(), "VTEP session already active");
                return Ok(());
            }
            session.mgmt_ip = Some(mgmt_ip);
            session.mgmt_port = Some(mgmt_port);
            session.generation += 1;
            self.inner.state.send_replace(ConnectionState::Connecting);
            session.generation
        };

        info!("Connecting to VTEP");
        let events = match self.inner.transport.open(mgmt_ip, mgmt_port).await {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "Failed to connect to VTEP");
                self.inner.state.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let snapshot = match self.inner.transport.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Failed to read VTEP tables");
                self.inner.transport.close().await;
                self.inner.state.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let tunnel_ip = snapshot
            .physical_switches
            .iter()
            .find_map(PhysicalSwitch::tunnel_ip);
        if tunnel_ip.is_none() {
            warn!("VTEP reports no tunnel ip");
        }

        let mut session = self.inner.session.lock();
        session.tunnel_ip = tunnel_ip;
        let updates_tx = match &session.updates_tx {
            Some(tx) => tx.clone(),
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                session.updates_tx = Some(tx.clone());
                session.updates_rx = Some(rx);
                tx
            }
        };

        // Baseline goes out before any live update.
        for update in snapshot.into_updates() {
            let _ = updates_tx.send(update);
        }

        session.pump = Some(tokio::spawn(pump(
            Arc::clone(&self.inner),
            events,
            updates_tx,
            generation,
        )));
        self.inner.state.send_replace(ConnectionState::Connected);
        info!(tunnel_ip = ?tunnel_ip, "Connected to VTEP");

        Ok(())
    }

    /// Closes the session. The update stream completes.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) {
        let pump = {
            let mut session = self.inner.session.lock();
            if self.inner.state() == ConnectionState::Disconnected {
                return;
            }
            self.inner.state.send_replace(ConnectionState::Disconnected);
            session.updates_tx = None;
            session.pump.take()
        };

        info!(mgmt_ip = ?self.management_ip(), "Disconnecting from VTEP");
        self.inner.transport.close().await;
        if let Some(pump) = pump {
            let _ = pump.await;
        }
    }

    fn ensure_connected(&self) -> VtepResult<()> {
        if self.inner.state() == ConnectionState::Connected {
            Ok(())
        } else {
            Err(VtepError::NotConnected)
        }
    }

    async fn read(&self) -> VtepResult<VtepSnapshot> {
        self.ensure_connected()?;
        self.inner.transport.snapshot().await
    }

    async fn commit(&self, txn: Transaction) -> VtepResult<Vec<OpResult>> {
        self.ensure_connected()?;
        debug!(label = txn.label(), ops = txn.len(), "Committing VTEP transaction");
        self.inner.transport.transact(txn).await
    }

    async fn commit_deletes(&self, txn: Transaction) -> VtepResult<OpStatus> {
        let results = self.commit(txn).await?;
        Ok(OpStatus::from_count(
            results.iter().map(OpResult::deleted).sum(),
        ))
    }

    pub async fn list_physical_switches(&self) -> VtepResult<Vec<PhysicalSwitch>> {
        Ok(self.read().await?.physical_switches)
    }

    pub async fn list_logical_switches(&self) -> VtepResult<Vec<LogicalSwitch>> {
        Ok(self.read().await?.logical_switches)
    }

    /// Lists the ports of a physical switch; unknown switches have none.
    pub async fn list_physical_ports(
        &self,
        physical_switch: PhysicalSwitchId,
    ) -> VtepResult<Vec<PhysicalPort>> {
        let snapshot = self.read().await?;
        let Some(ps) = snapshot
            .physical_switches
            .iter()
            .find(|ps| ps.id == physical_switch)
        else {
            return Ok(Vec::new());
        };

        Ok(snapshot
            .physical_ports
            .iter()
            .filter(|port| ps.ports.contains(&port.id))
            .cloned()
            .collect())
    }

    pub async fn list_ucast_macs_local(&self) -> VtepResult<Vec<UcastMac>> {
        Ok(self.read().await?.ucast_macs_local)
    }

    pub async fn list_ucast_macs_remote(&self) -> VtepResult<Vec<UcastMac>> {
        Ok(self.read().await?.ucast_macs_remote)
    }

    pub async fn list_mcast_macs_local(&self) -> VtepResult<Vec<McastMac>> {
        Ok(self.read().await?.mcast_macs_local)
    }

    pub async fn list_mcast_macs_remote(&self) -> VtepResult<Vec<McastMac>> {
        Ok(self.read().await?.mcast_macs_remote)
    }

    pub async fn get_logical_switch(
        &self,
        id: LogicalSwitchId,
    ) -> VtepResult<Option<LogicalSwitch>> {
        Ok(self.read().await?.logical_switch_by_id(id).cloned())
    }

    pub async fn get_logical_switch_by_name(
        &self,
        name: &str,
    ) -> VtepResult<Option<LogicalSwitch>> {
        Ok(self.read().await?.logical_switch_by_name(name).cloned())
    }

    /// Creates a logical switch bound to `vni`.
    ///
    /// Fails with [`VtepError::AlreadyExists`] if the name or the VNI is
    /// already used by another logical switch.
    #[instrument(skip(self))]
    pub async fn add_logical_switch(&self, name: &str, vni: Vni) -> VtepResult<LogicalSwitchId> {
        let snapshot = self.read().await?;
        check_logical_switch_free(&snapshot, name, vni)?;

        let id = LogicalSwitchId::random();
        self.commit(Transaction::new("add_logical_switch").insert_logical_switch(id, name, vni))
            .await?;

        info!(%id, "Added logical switch");
        Ok(id)
    }

    /// Binds every (port, vlan) pair to the logical switch, all or nothing.
    #[instrument(skip(self, bindings))]
    pub async fn add_bindings(
        &self,
        logical_switch: LogicalSwitchId,
        bindings: impl IntoIterator<Item = Binding>,
    ) -> VtepResult<()> {
        let snapshot = self.read().await?;
        if snapshot.logical_switch_by_id(logical_switch).is_none() {
            return Err(VtepError::device(
                "add_bindings",
                format!("unknown logical switch {}", logical_switch),
            ));
        }

        let txn = bindings
            .into_iter()
            .fold(Transaction::new("add_bindings"), |txn, b| {
                txn.bind_vlan(b.port_name, b.vlan, logical_switch)
            });
        if txn.is_empty() {
            return Ok(());
        }

        let count = txn.len();
        self.commit(txn).await?;
        info!(count, "Added bindings");
        Ok(())
    }

    /// Binds (port, vlan) to the logical switch named `ls_name`, creating it
    /// with `vni` if needed, and points its `unknown-dst` traffic at
    /// `flood_ip` when given. Everything happens in one transaction.
    #[instrument(skip(self))]
    pub async fn bind_vlan(
        &self,
        ls_name: &str,
        port: &str,
        vlan: VlanTag,
        vni: Vni,
        flood_ip: Option<Ipv4Addr>,
    ) -> VtepResult<LogicalSwitchId> {
        let snapshot = self.read().await?;
        let mut txn = Transaction::new("bind_vlan");

        let id = match snapshot.logical_switch_by_name(ls_name) {
            Some(ls) => ls.id,
            None => {
                check_logical_switch_free(&snapshot, ls_name, vni)?;
                let id = LogicalSwitchId::random();
                txn = txn.insert_logical_switch(id, ls_name, vni);
                id
            }
        };

        txn = txn.bind_vlan(port, vlan, id);
        if let Some(flood_ip) = flood_ip {
            txn = txn.upsert_mcast_remote(McastMac::new(id, VtepMac::UnknownDst, flood_ip));
        }

        self.commit(txn).await?;
        Ok(id)
    }

    /// Lists the (port, vlan) pairs bound to a logical switch.
    pub async fn list_port_vlan_bindings(
        &self,
        logical_switch: LogicalSwitchId,
    ) -> VtepResult<Vec<Binding>> {
        let snapshot = self.read().await?;
        let mut bindings: Vec<Binding> = snapshot
            .physical_ports
            .iter()
            .flat_map(|port| {
                port.vlan_bindings
                    .iter()
                    .filter(|(_, ls)| **ls == logical_switch)
                    .map(|(vlan, _)| Binding::new(port.name.clone(), *vlan))
            })
            .collect();
        bindings.sort();
        Ok(bindings)
    }

    pub async fn delete_binding(
        &self,
        port: &str,
        vlan: VlanTag,
    ) -> VtepResult<OpStatus> {
        self.commit_deletes(Transaction::new("delete_binding").unbind_vlan(port, vlan))
            .await
    }

    /// Removes every binding of a logical switch in one transaction.
    pub async fn clear_bindings(&self, logical_switch: LogicalSwitchId) -> VtepResult<OpStatus> {
        self.commit_deletes(Transaction::new("clear_bindings").clear_bindings(logical_switch))
            .await
    }

    /// Upserts a `Ucast_Macs_Remote` row.
    pub async fn add_ucast_mac_remote(
        &self,
        ls_name: &str,
        mac: MacAddress,
        ip: Option<Ipv4Addr>,
        tunnel_endpoint: Ipv4Addr,
    ) -> VtepResult<()> {
        let ls = self.require_logical_switch("add_ucast_mac_remote", ls_name).await?;
        self.add_ucast_mac_remote_by_id(ls, mac, ip, tunnel_endpoint)
            .await
    }

    /// Same as [`VtepControlClient::add_ucast_mac_remote`] for a switch
    /// already resolved.
    pub async fn add_ucast_mac_remote_by_id(
        &self,
        ls: LogicalSwitchId,
        mac: MacAddress,
        ip: Option<Ipv4Addr>,
        tunnel_endpoint: Ipv4Addr,
    ) -> VtepResult<()> {
        let row = UcastMac::new(ls, mac, ip, tunnel_endpoint);
        self.commit(Transaction::new("add_ucast_mac_remote").upsert_ucast_remote(row))
            .await?;
        Ok(())
    }

    /// Upserts a `Mcast_Macs_Remote` row.
    pub async fn add_mcast_mac_remote(
        &self,
        ls_name: &str,
        mac: VtepMac,
        tunnel_endpoint: Ipv4Addr,
    ) -> VtepResult<()> {
        let ls = self.require_logical_switch("add_mcast_mac_remote", ls_name).await?;
        self.add_mcast_mac_remote_by_id(ls, mac, tunnel_endpoint).await
    }

    pub async fn add_mcast_mac_remote_by_id(
        &self,
        ls: LogicalSwitchId,
        mac: VtepMac,
        tunnel_endpoint: Ipv4Addr,
    ) -> VtepResult<()> {
        let row = McastMac::new(ls, mac, tunnel_endpoint);
        self.commit(Transaction::new("add_mcast_mac_remote").upsert_mcast_remote(row))
            .await?;
        Ok(())
    }

    /// Deletes the `Ucast_Macs_Remote` row for (mac, ip).
    pub async fn del_ucast_mac_remote(
        &self,
        ls_name: &str,
        mac: MacAddress,
        ip: Ipv4Addr,
    ) -> VtepResult<OpStatus> {
        let Some(ls) = self.get_logical_switch_by_name(ls_name).await? else {
            return Ok(OpStatus::NotFound);
        };
        self.del_ucast_mac_remote_by_id(ls.id, mac, Some(ip)).await
    }

    /// Deletes every `Ucast_Macs_Remote` row for mac, whatever its ip.
    pub async fn del_ucast_mac_remote_all_ips(
        &self,
        ls_name: &str,
        mac: MacAddress,
    ) -> VtepResult<OpStatus> {
        let Some(ls) = self.get_logical_switch_by_name(ls_name).await? else {
            return Ok(OpStatus::NotFound);
        };
        self.del_ucast_mac_remote_by_id(ls.id, mac, None).await
    }

    /// Deletes the `Ucast_Macs_Remote` rows for mac in a resolved switch,
    /// restricted to `ip` when given.
    pub async fn del_ucast_mac_remote_by_id(
        &self,
        ls: LogicalSwitchId,
        mac: MacAddress,
        ip: Option<Ipv4Addr>,
    ) -> VtepResult<OpStatus> {
        let label = if ip.is_some() {
            "del_ucast_mac_remote"
        } else {
            "del_ucast_mac_remote_all_ips"
        };
        self.commit_deletes(Transaction::new(label).delete_ucast_remote(ls, mac, ip))
            .await
    }

    /// Deletes every `Mcast_Macs_Remote` row for mac.
    pub async fn del_mcast_mac_remote_all_ips(
        &self,
        ls_name: &str,
        mac: VtepMac,
    ) -> VtepResult<OpStatus> {
        let Some(ls) = self.get_logical_switch_by_name(ls_name).await? else {
            return Ok(OpStatus::NotFound);
        };
        self.del_mcast_mac_remote_all_ips_by_id(ls.id, mac).await
    }

    pub async fn del_mcast_mac_remote_all_ips_by_id(
        &self,
        ls: LogicalSwitchId,
        mac: VtepMac,
    ) -> VtepResult<OpStatus> {
        self.commit_deletes(
            Transaction::new("del_mcast_mac_remote_all_ips").delete_mcast_remote(ls, mac),
        )
        .await
    }

    /// Deletes a logical switch together with its bindings and remote MAC
    /// rows, in one transaction.
    #[instrument(skip(self))]
    pub async fn delete_logical_switch(&self, name: &str) -> VtepResult<OpStatus> {
        let Some(ls) = self.get_logical_switch_by_name(name).await? else {
            return Ok(OpStatus::NotFound);
        };

        self.commit(
            Transaction::new("delete_logical_switch")
                .clear_bindings(ls.id)
                .delete_remote_macs(ls.id)
                .delete_logical_switch(ls.id),
        )
        .await?;

        info!(id = %ls.id, "Deleted logical switch");
        Ok(OpStatus::Applied)
    }

    async fn require_logical_switch(
        &self,
        operation: &str,
        ls_name: &str,
    ) -> VtepResult<LogicalSwitchId> {
        self.get_logical_switch_by_name(ls_name)
            .await?
            .map(|ls| ls.id)
            .ok_or_else(|| {
                VtepError::device(operation, format!("unknown logical switch {}", ls_name))
            })
    }
}

fn check_logical_switch_free(snapshot: &VtepSnapshot, name: &str, vni: Vni) -> VtepResult<()> {
    if snapshot.logical_switch_by_name(name).is_some() {
        return Err(VtepError::already_exists(
            tables::LOGICAL_SWITCH,
            format!("name={}", name),
        ));
    }
    if snapshot.logical_switches.iter().any(|ls| ls.vni == vni) {
        return Err(VtepError::already_exists(
            tables::LOGICAL_SWITCH,
            format!("vni={}", vni),
        ));
    }
    Ok(())
}

async fn pump(
    inner: Arc<Inner>,
    mut events: TransportEvents,
    updates: mpsc::UnboundedSender<TableUpdate>,
    generation: u64,
) {
    let reason = loop {
        match events.recv().await {
            Some(TransportEvent::Update(update)) => {
                // A dropped consumer must not stop the pump; the session
                // end still has to be observed.
                let _ = updates.send(update);
            }
            Some(TransportEvent::Disconnected { reason }) => break Some(reason),
            None => break None,
        }
    };

    drop(updates);
    inner.on_session_end(generation, reason);
}
