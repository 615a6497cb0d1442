//! Overlay side of a broker.
//!
//! The overlay peer reads and writes the shared [`OverlayDirectory`] on
//! behalf of one VTEP. Its writes are tagged with the VTEP management
//! address; directory changes carrying that tag are the peer's own echoes
//! and are never published back.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use uuid::Uuid;
use vxgw_types::VtepMac;

use super::directory::{DirectoryChange, DirectoryEntry, OverlayDirectory};
use crate::error::{Result, VxgwError};
use crate::flooding_proxy::FloodingProxyFeed;
use crate::mac_location::{logical_switch_name, MacLocation};
use crate::peer::{PeerUpdates, UpdateStream, VxLanPeer};

struct OverlayState {
    name: String,
    origin: String,
    tunnel_zone: Uuid,
    directory: Arc<dyn OverlayDirectory>,
    stream: UpdateStream,
    tracked: Mutex<BTreeSet<Uuid>>,
    proxy: Mutex<Option<Ipv4Addr>>,
}

impl OverlayState {
    fn is_tracked(&self, network: Uuid) -> bool {
        self.tracked.lock().contains(&network)
    }

    /// Entries worth sending to the device: unicast ones written by others.
    fn is_foreign_ucast(&self, entry: &DirectoryEntry) -> bool {
        entry.origin != self.origin && entry.mac.is_ucast()
    }

    fn on_change(&self, change: DirectoryChange) {
        let entry = change.entry();
        if entry.origin == self.origin {
            trace!(peer = %self.name, mac = %entry.mac, "Skipping own directory write");
            return;
        }
        if !self.is_foreign_ucast(entry) || !self.is_tracked(entry.network) {
            return;
        }

        let ml = match change {
            DirectoryChange::Put(e) => MacLocation::new(
                logical_switch_name(e.network),
                e.mac,
                e.ip,
                Some(e.endpoint),
            ),
            DirectoryChange::Removed(e) => {
                MacLocation::withdrawal(logical_switch_name(e.network), e.mac, e.ip)
            }
        };
        self.stream.publish(ml);
    }

    fn set_proxy(&self, proxy: Option<Ipv4Addr>) {
        {
            let mut current = self.proxy.lock();
            if *current == proxy {
                return;
            }
            *current = proxy;
        }

        info!(peer = %self.name, tunnel_zone = %self.tunnel_zone, proxy = ?proxy, "Flooding proxy update");
        let networks: Vec<Uuid> = self.tracked.lock().iter().copied().collect();
        for network in networks {
            self.stream.publish(MacLocation::new(
                logical_switch_name(network),
                VtepMac::UnknownDst,
                None,
                proxy,
            ));
        }
    }
}

/// Overlay peer of one VTEP.
pub struct OverlayPeer {
    state: Arc<OverlayState>,
    changes: Mutex<Option<mpsc::UnboundedReceiver<DirectoryChange>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl OverlayPeer {
    /// Creates the overlay peer of the VTEP managed at `mgmt_ip`, member of
    /// `tunnel_zone`.
    ///
    /// The directory subscription starts here, so no change committed after
    /// construction is lost.
    pub fn new(directory: Arc<dyn OverlayDirectory>, mgmt_ip: Ipv4Addr, tunnel_zone: Uuid) -> Self {
        let name = format!("overlay({})", mgmt_ip);
        let changes = directory.subscribe();

        Self {
            state: Arc::new(OverlayState {
                stream: UpdateStream::new(name.clone()),
                name,
                origin: mgmt_ip.to_string(),
                tunnel_zone,
                directory,
                tracked: Mutex::new(BTreeSet::new()),
                proxy: Mutex::new(None),
            }),
            changes: Mutex::new(Some(changes)),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Tag carried by this peer's directory writes.
    pub fn origin(&self) -> &str {
        &self.state.origin
    }

    pub fn tunnel_zone(&self) -> Uuid {
        self.state.tunnel_zone
    }

    pub fn tracked_networks(&self) -> Vec<Uuid> {
        self.state.tracked.lock().iter().copied().collect()
    }

    /// Current flooding proxy of the peer's tunnel zone.
    pub fn flooding_proxy(&self) -> Option<Ipv4Addr> {
        *self.state.proxy.lock()
    }

    /// Starts tracking `network`.
    ///
    /// Publishes the network's current entries and flooding proxy so the
    /// device starts from a complete view.
    pub async fn watch_network(&self, network: Uuid) -> Result<()> {
        if !self.state.tracked.lock().insert(network) {
            return Ok(());
        }
        info!(peer = %self.state.name, %network, "Tracking overlay network");

        let entries = match self.state.directory.entries(network).await {
            Ok(entries) => entries,
            Err(e) => {
                self.state.tracked.lock().remove(&network);
                return Err(e);
            }
        };

        let ls = logical_switch_name(network);
        for entry in entries.into_iter().filter(|e| self.state.is_foreign_ucast(e)) {
            self.state.stream.publish(MacLocation::new(
                ls.clone(),
                entry.mac,
                entry.ip,
                Some(entry.endpoint),
            ));
        }

        if let Some(proxy) = self.flooding_proxy() {
            self.state
                .stream
                .publish(MacLocation::new(ls, VtepMac::UnknownDst, None, Some(proxy)));
        }
        Ok(())
    }

    /// Stops tracking `network` and withdraws the entries this peer wrote
    /// for it. Returns false if it was not tracked.
    pub async fn forget_network(&self, network: Uuid) -> Result<bool> {
        if !self.state.tracked.lock().remove(&network) {
            return Ok(false);
        }
        info!(peer = %self.state.name, %network, "Stopped tracking overlay network");

        let origin = self.state.origin.as_str();
        let own: Vec<DirectoryEntry> = self
            .state
            .directory
            .entries(network)
            .await?
            .into_iter()
            .filter(|entry| entry.origin == origin)
            .collect();
        for entry in &own {
            self.state
                .directory
                .remove(network, entry.mac, entry.ip, Some(origin))
                .await?;
        }
        if !own.is_empty() {
            debug!(peer = %self.state.name, %network, count = own.len(), "Withdrew own directory entries");
        }
        Ok(true)
    }

    /// Follows the flooding proxy of the peer's tunnel zone.
    pub fn subscribe_flooding_proxy(&self, feed: &FloodingProxyFeed) {
        let mut proxies = feed.subscribe();
        let zone = self.state.tunnel_zone;
        let current = proxies.borrow_and_update().get(&zone).copied();
        self.state.set_proxy(current);

        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = proxies.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let proxy = proxies.borrow_and_update().get(&zone).copied();
                        state.set_proxy(proxy);
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }
}

async fn listen_directory(
    state: Arc<OverlayState>,
    mut changes: mpsc::UnboundedReceiver<DirectoryChange>,
    cancel: CancellationToken,
) {
    loop {
        let change = tokio::select! {
            _ = cancel.cancelled() => break,
            change = changes.recv() => change,
        };

        match change {
            Some(change) => state.on_change(change),
            None => {
                state
                    .stream
                    .error(VxgwError::stream(&state.name, "overlay directory closed"));
                state.stream.complete();
                break;
            }
        }
    }
}

#[async_trait]
impl VxLanPeer for OverlayPeer {
    fn name(&self) -> &str {
        &self.state.name
    }

    fn observable_updates(&self) -> Result<PeerUpdates> {
        let updates = self.state.stream.take()?;
        if let Some(changes) = self.changes.lock().take() {
            let handle = tokio::spawn(listen_directory(
                Arc::clone(&self.state),
                changes,
                self.cancel.clone(),
            ));
            self.tasks.lock().push(handle);
        }
        Ok(updates)
    }

    async fn apply(&self, ml: &MacLocation) -> Result<()> {
        let Some(network) = ml.network_id() else {
            debug!(peer = %self.state.name, %ml, "Ignoring record outside the overlay");
            return Ok(());
        };
        if !self.state.is_tracked(network) {
            debug!(peer = %self.state.name, %ml, "Ignoring record for untracked network");
            return Ok(());
        }

        match ml.tunnel_endpoint {
            Some(endpoint) => {
                self.state
                    .directory
                    .put(DirectoryEntry {
                        network,
                        mac: ml.mac,
                        ip: ml.ip,
                        endpoint,
                        origin: self.state.origin.clone(),
                    })
                    .await
            }
            // Only entries this peer wrote are withdrawn; a MAC that moved
            // behind another VTEP keeps that VTEP's entry.
            None => self
                .state
                .directory
                .remove(network, ml.mac, ml.ip, Some(self.state.origin.as_str()))
                .await
                .map(|_| ()),
        }
    }

    async fn stop(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        self.state.stream.complete();
        info!(peer = %self.state.name, "Overlay peer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::MemoryDirectory;
    use crate::peer::PeerEvent;
    use pretty_assertions::assert_eq;

    const MGMT_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);

    fn expect_update(event: Option<PeerEvent>) -> MacLocation {
        match event {
            Some(PeerEvent::Update(ml)) => ml,
            other => panic!("expected an update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_own_writes_are_not_echoed() {
        let directory = Arc::new(MemoryDirectory::new());
        let peer = OverlayPeer::new(directory.clone(), MGMT_IP, Uuid::new_v4());
        let mut updates = peer.observable_updates().unwrap();
        let network = Uuid::new_v4();
        peer.watch_network(network).await.unwrap();

        let mac: VtepMac = "02:00:00:00:00:01".parse().unwrap();
        let ls = logical_switch_name(network);
        let own = MacLocation::new(ls.clone(), mac, None, Some(Ipv4Addr::new(10, 1, 1, 10)));
        peer.apply(&own).await.unwrap();
        assert_eq!(directory.len(), 1);

        // A write from another VTEP does come through.
        directory
            .put(DirectoryEntry {
                network,
                mac,
                ip: None,
                endpoint: Ipv4Addr::new(10, 2, 2, 2),
                origin: "192.168.1.20".to_string(),
            })
            .await
            .unwrap();

        let ml = expect_update(updates.recv().await);
        assert_eq!(
            ml,
            MacLocation::new(ls, mac, None, Some(Ipv4Addr::new(10, 2, 2, 2)))
        );
        assert!(updates.try_recv().is_err());
    }

    fn foreign_entry(network: Uuid, mac: VtepMac) -> DirectoryEntry {
        DirectoryEntry {
            network,
            mac,
            ip: None,
            endpoint: Ipv4Addr::new(10, 2, 2, 2),
            origin: "192.168.1.20".to_string(),
        }
    }

    #[tokio::test]
    async fn test_own_withdrawal_is_not_echoed() {
        let directory = Arc::new(MemoryDirectory::new());
        let peer = OverlayPeer::new(directory.clone(), MGMT_IP, Uuid::new_v4());
        let mut updates = peer.observable_updates().unwrap();
        let network = Uuid::new_v4();
        peer.watch_network(network).await.unwrap();

        let mac: VtepMac = "02:00:00:00:00:01".parse().unwrap();
        let ls = logical_switch_name(network);
        peer.apply(&MacLocation::new(ls.clone(), mac, None, Some(Ipv4Addr::new(10, 1, 1, 10))))
            .await
            .unwrap();
        peer.apply(&MacLocation::withdrawal(ls, mac, None))
            .await
            .unwrap();
        assert!(directory.is_empty());

        // Anything published from here on proves the withdrawal was not
        // sent back.
        let other: VtepMac = "02:00:00:00:00:02".parse().unwrap();
        directory.put(foreign_entry(network, other)).await.unwrap();
        let ml = expect_update(updates.recv().await);
        assert_eq!(ml.mac, other);
        assert!(updates.try_recv().is_err());
        peer.stop().await;
    }

    #[tokio::test]
    async fn test_withdrawal_keeps_entries_of_other_writers() {
        let directory = Arc::new(MemoryDirectory::new());
        let peer = OverlayPeer::new(directory.clone(), MGMT_IP, Uuid::new_v4());
        let mut updates = peer.observable_updates().unwrap();
        let network = Uuid::new_v4();
        peer.watch_network(network).await.unwrap();

        let mac: VtepMac = "02:00:00:00:00:01".parse().unwrap();
        let moved = foreign_entry(network, mac);
        directory.put(moved.clone()).await.unwrap();
        expect_update(updates.recv().await);

        peer.apply(&MacLocation::withdrawal(logical_switch_name(network), mac, None))
            .await
            .unwrap();

        assert_eq!(directory.all_entries(), vec![moved]);
        tokio::task::yield_now().await;
        assert!(updates.try_recv().is_err());
        peer.stop().await;
    }

    #[tokio::test]
    async fn test_forget_network_withdraws_own_entries() {
        let directory = Arc::new(MemoryDirectory::new());
        let peer = OverlayPeer::new(directory.clone(), MGMT_IP, Uuid::new_v4());
        let network = Uuid::new_v4();
        peer.watch_network(network).await.unwrap();

        let ls = logical_switch_name(network);
        let own: VtepMac = "02:00:00:00:00:01".parse().unwrap();
        let other: VtepMac = "02:00:00:00:00:02".parse().unwrap();
        peer.apply(&MacLocation::new(ls, own, None, Some(Ipv4Addr::new(10, 1, 1, 10))))
            .await
            .unwrap();
        let foreign = foreign_entry(network, other);
        directory.put(foreign.clone()).await.unwrap();

        assert!(peer.forget_network(network).await.unwrap());
        assert_eq!(directory.all_entries(), vec![foreign]);
        assert!(peer.tracked_networks().is_empty());
        assert!(!peer.forget_network(network).await.unwrap());
    }

    #[tokio::test]
    async fn test_untracked_records_are_ignored() {
        let directory = Arc::new(MemoryDirectory::new());
        let peer = OverlayPeer::new(directory.clone(), MGMT_IP, Uuid::new_v4());
        let mac: VtepMac = "02:00:00:00:00:01".parse().unwrap();

        let untracked = MacLocation::new(
            logical_switch_name(Uuid::new_v4()),
            mac,
            None,
            Some(Ipv4Addr::new(10, 1, 1, 10)),
        );
        peer.apply(&untracked).await.unwrap();
        let foreign = MacLocation::new("ls1", mac, None, Some(Ipv4Addr::new(10, 1, 1, 10)));
        peer.apply(&foreign).await.unwrap();

        assert!(directory.is_empty());
    }

    #[tokio::test]
    async fn test_second_subscription_fails() {
        let peer = OverlayPeer::new(Arc::new(MemoryDirectory::new()), MGMT_IP, Uuid::new_v4());
        let _updates = peer.observable_updates().unwrap();
        assert!(matches!(
            peer.observable_updates(),
            Err(VxgwError::StreamTaken(_))
        ));
        peer.stop().await;
    }
}
