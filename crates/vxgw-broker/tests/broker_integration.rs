//! Integration tests for SyncBroker over in-memory devices and directory.

mod common;

use common::*;
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;
use vxgw_broker::{
    logical_switch_name, DirectoryChange, DirectoryEntry, FloodingProxyFeed, MacLocation,
    MemoryDirectory, OverlayDirectory, OverlayPeer, SyncBroker, VtepPeer, VxLanPeer,
};
use vxgw_types::{VlanTag, VtepMac};
use vxgw_vtep::{ConnectionState, MemoryVtep, UcastMac, VtepControlClient, DEFAULT_MGMT_PORT};

const PROXY: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 100);

#[tokio::test]
async fn test_local_mac_reaches_other_vtep_without_echo() {
    let directory = Arc::new(MemoryDirectory::new());
    let feed = FloodingProxyFeed::new();
    let zone = Uuid::new_v4();
    let network = Uuid::new_v4();
    let ls = logical_switch_name(network);

    let (device_a, device_b) = (device(10), device(20));
    let broker_a = start_broker(&directory, &feed, zone, &device_a).await.unwrap();
    let broker_b = start_broker(&directory, &feed, zone, &device_b).await.unwrap();
    for broker in [&broker_a, &broker_b] {
        broker
            .bind_network(network, "eth0", VlanTag::UNTAGGED, vni(5000))
            .await
            .unwrap();
    }

    device_a.learn_ucast_local(&ls, mac(1), None).unwrap();

    eventually("mac on vtep b", || ucast_remote(&device_b, network).len() == 1).await;
    let row = &ucast_remote(&device_b, network)[0];
    assert_eq!(row.mac, mac(1));
    assert_eq!(row.locator, tunnel_ip(10));

    settle().await;
    let entries = ucast_entries(&directory);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].origin, mgmt_ip(10).to_string());
    assert_eq!(entries[0].endpoint, tunnel_ip(10));
    // Neither the origin device nor the directory got an echo back.
    assert!(ucast_remote(&device_a, network).is_empty());

    device_a.forget_ucast_local(&ls, mac(1));
    eventually("withdrawal on vtep b", || ucast_remote(&device_b, network).is_empty()).await;
    assert!(ucast_entries(&directory).is_empty());

    broker_a.terminate().await;
    broker_b.terminate().await;
}

#[tokio::test]
async fn test_withdrawal_after_mac_move_keeps_new_location() {
    let directory = Arc::new(MemoryDirectory::new());
    let feed = FloodingProxyFeed::new();
    let zone = Uuid::new_v4();
    let network = Uuid::new_v4();
    let ls = logical_switch_name(network);

    let (device_a, device_b) = (device(10), device(20));
    let broker_a = start_broker(&directory, &feed, zone, &device_a).await.unwrap();
    let broker_b = start_broker(&directory, &feed, zone, &device_b).await.unwrap();
    for broker in [&broker_a, &broker_b] {
        broker
            .bind_network(network, "eth0", VlanTag::UNTAGGED, vni(5000))
            .await
            .unwrap();
    }

    device_a.learn_ucast_local(&ls, mac(1), None).unwrap();
    eventually("mac on vtep b", || ucast_remote(&device_b, network).len() == 1).await;

    // The MAC moves behind vtep b.
    device_b.learn_ucast_local(&ls, mac(1), None).unwrap();
    eventually("directory follows the move", || {
        ucast_entries(&directory)
            .iter()
            .any(|e| e.endpoint == tunnel_ip(20) && e.origin == mgmt_ip(20).to_string())
    })
    .await;
    eventually("vtep a points at vtep b", || {
        ucast_remote(&device_a, network)
            .iter()
            .any(|row| row.locator == tunnel_ip(20))
    })
    .await;

    // Vtep a ages out its stale local entry.
    device_a.forget_ucast_local(&ls, mac(1));
    settle().await;

    let entries = ucast_entries(&directory);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].endpoint, tunnel_ip(20));
    assert_eq!(entries[0].origin, mgmt_ip(20).to_string());
    let rows = ucast_remote(&device_a, network);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].locator, tunnel_ip(20));

    broker_a.terminate().await;
    broker_b.terminate().await;
}

#[tokio::test]
async fn test_unbind_withdraws_own_directory_entries() {
    let directory = Arc::new(MemoryDirectory::new());
    let feed = FloodingProxyFeed::new();
    let zone = Uuid::new_v4();
    let network = Uuid::new_v4();

    let (device_a, device_b) = (device(10), device(20));
    let broker_a = start_broker(&directory, &feed, zone, &device_a).await.unwrap();
    let broker_b = start_broker(&directory, &feed, zone, &device_b).await.unwrap();
    for broker in [&broker_a, &broker_b] {
        broker
            .bind_network(network, "eth0", VlanTag::UNTAGGED, vni(5000))
            .await
            .unwrap();
    }
    directory
        .put(host_entry(network, mac(2), Ipv4Addr::new(10, 2, 2, 2)))
        .await
        .unwrap();

    device_a
        .learn_ucast_local(&logical_switch_name(network), mac(1), None)
        .unwrap();
    eventually("mac on vtep b", || ucast_remote(&device_b, network).len() == 2).await;

    broker_a.unbind_network(network).await.unwrap();

    let own = mgmt_ip(10).to_string();
    assert!(directory.all_entries().iter().all(|e| e.origin != own));
    assert_eq!(ucast_entries(&directory).len(), 1);
    eventually("withdrawal on vtep b", || {
        let rows = ucast_remote(&device_b, network);
        rows.len() == 1 && rows[0].mac == mac(2)
    })
    .await;

    broker_a.terminate().await;
    broker_b.terminate().await;
}

#[tokio::test]
async fn test_overlay_entries_reach_device() {
    let directory = Arc::new(MemoryDirectory::new());
    let feed = FloodingProxyFeed::new();
    let network = Uuid::new_v4();
    let host = Ipv4Addr::new(10, 2, 2, 2);

    // Present before the network is bound: delivered as part of the baseline.
    directory.put(host_entry(network, mac(1), host)).await.unwrap();

    let device = device(10);
    let broker = start_broker(&directory, &feed, Uuid::new_v4(), &device)
        .await
        .unwrap();
    broker
        .bind_network(network, "eth0", VlanTag::UNTAGGED, vni(5000))
        .await
        .unwrap();
    eventually("baseline entry", || ucast_remote(&device, network).len() == 1).await;

    directory.put(host_entry(network, mac(2), host)).await.unwrap();
    eventually("live entry", || ucast_remote(&device, network).len() == 2).await;

    directory
        .remove(network, VtepMac::Ieee(mac(1)), None, None)
        .await
        .unwrap();
    eventually("withdrawal", || ucast_remote(&device, network).len() == 1).await;
    assert_eq!(ucast_remote(&device, network)[0].mac, mac(2));

    broker.terminate().await;
}

#[tokio::test]
async fn test_untracked_network_is_not_replicated() {
    let directory = Arc::new(MemoryDirectory::new());
    let device = device(10);
    let broker = start_broker(&directory, &FloodingProxyFeed::new(), Uuid::new_v4(), &device)
        .await
        .unwrap();
    let bound = Uuid::new_v4();
    broker
        .bind_network(bound, "eth0", VlanTag::UNTAGGED, vni(5000))
        .await
        .unwrap();

    let other = Uuid::new_v4();
    directory
        .put(host_entry(other, mac(1), Ipv4Addr::new(10, 2, 2, 2)))
        .await
        .unwrap();
    settle().await;

    assert!(device.tables().ucast_macs_remote.is_empty());
    broker.terminate().await;
}

#[tokio::test]
async fn test_updates_are_applied_in_order() {
    let directory = Arc::new(MemoryDirectory::new());
    let device = device(10);
    let network = Uuid::new_v4();
    let broker = start_broker(&directory, &FloodingProxyFeed::new(), Uuid::new_v4(), &device)
        .await
        .unwrap();
    broker
        .bind_network(network, "eth0", VlanTag::UNTAGGED, vni(5000))
        .await
        .unwrap();

    for i in 1..=20u8 {
        directory
            .put(host_entry(network, mac(1), Ipv4Addr::new(10, 2, 2, i)))
            .await
            .unwrap();
    }

    let last = Ipv4Addr::new(10, 2, 2, 20);
    eventually("last location", || {
        let rows = ucast_remote(&device, network);
        rows.len() == 1 && rows[0].locator == last
    })
    .await;
    settle().await;
    assert_eq!(ucast_remote(&device, network)[0].locator, last);

    broker.terminate().await;
}

#[tokio::test]
async fn test_interleaved_puts_and_removals_keep_their_order() {
    let directory = Arc::new(MemoryDirectory::new());
    let device = device(10);
    let network = Uuid::new_v4();
    let broker = start_broker(&directory, &FloodingProxyFeed::new(), Uuid::new_v4(), &device)
        .await
        .unwrap();
    broker
        .bind_network(network, "eth0", VlanTag::UNTAGGED, vni(5000))
        .await
        .unwrap();

    for i in 1..=10u8 {
        let endpoint = Ipv4Addr::new(10, 2, 2, i);
        directory.put(host_entry(network, mac(1), endpoint)).await.unwrap();
        directory
            .remove(network, VtepMac::Ieee(mac(1)), None, None)
            .await
            .unwrap();
        directory.put(host_entry(network, mac(2), endpoint)).await.unwrap();
    }
    let last = Ipv4Addr::new(10, 2, 2, 99);
    directory.put(host_entry(network, mac(1), last)).await.unwrap();
    directory
        .remove(network, VtepMac::Ieee(mac(2)), None, None)
        .await
        .unwrap();

    let converged = |rows: Vec<UcastMac>| {
        rows.len() == 1 && rows[0].mac == mac(1) && rows[0].locator == last
    };
    eventually("final state", || converged(ucast_remote(&device, network))).await;
    settle().await;
    assert!(converged(ucast_remote(&device, network)));

    broker.terminate().await;
}

#[tokio::test]
async fn test_flooding_proxy_follows_the_feed() {
    let directory = Arc::new(MemoryDirectory::new());
    let feed = FloodingProxyFeed::new();
    let zone = Uuid::new_v4();
    let network = Uuid::new_v4();
    feed.set_proxy(zone, PROXY);

    let device = device(10);
    let broker = start_broker(&directory, &feed, zone, &device).await.unwrap();
    broker
        .bind_network(network, "eth0", VlanTag::UNTAGGED, vni(5000))
        .await
        .unwrap();
    assert_eq!(broker.overlay().flooding_proxy(), Some(PROXY));

    eventually("proxy at bind time", || {
        let rows = mcast_remote(&device, network);
        rows.len() == 1 && rows[0].mac.is_unknown_dst() && rows[0].locator == PROXY
    })
    .await;

    let moved = Ipv4Addr::new(10, 0, 0, 101);
    feed.set_proxy(zone, moved);
    eventually("proxy moved", || {
        let rows = mcast_remote(&device, network);
        rows.len() == 1 && rows[0].locator == moved
    })
    .await;

    // A proxy of another zone is not ours.
    feed.set_proxy(Uuid::new_v4(), PROXY);
    settle().await;
    assert_eq!(mcast_remote(&device, network)[0].locator, moved);

    feed.clear_proxy(zone);
    eventually("proxy cleared", || mcast_remote(&device, network).is_empty()).await;

    broker.terminate().await;
}

#[tokio::test]
async fn test_vtep_peer_apply_is_idempotent() {
    let device = device(10);
    let client = Arc::new(VtepControlClient::new(device.clone()));
    client.connect(device.mgmt_ip(), DEFAULT_MGMT_PORT).await.unwrap();
    let network = Uuid::new_v4();
    let ls = logical_switch_name(network);
    client
        .bind_vlan(&ls, "eth0", VlanTag::UNTAGGED, vni(5000), None)
        .await
        .unwrap();
    let peer = VtepPeer::new(client.clone(), device.mgmt_ip());

    let located = MacLocation::new(
        ls.clone(),
        VtepMac::Ieee(mac(1)),
        None,
        Some(Ipv4Addr::new(10, 2, 2, 2)),
    );
    peer.apply(&located).await.unwrap();
    let after_first = device.tables();
    peer.apply(&located).await.unwrap();
    assert_eq!(device.tables(), after_first);
    assert_eq!(after_first.ucast_macs_remote.len(), 1);

    let withdrawn = MacLocation::withdrawal(ls.clone(), VtepMac::Ieee(mac(1)), None);
    peer.apply(&withdrawn).await.unwrap();
    peer.apply(&withdrawn).await.unwrap();
    assert!(device.tables().ucast_macs_remote.is_empty());

    // Records pointing at the device itself or at a switch it does not
    // have are dropped.
    let own = MacLocation::new(ls, VtepMac::Ieee(mac(2)), None, Some(device.tunnel_ip()));
    peer.apply(&own).await.unwrap();
    let absent = MacLocation::new(
        logical_switch_name(Uuid::new_v4()),
        VtepMac::Ieee(mac(3)),
        None,
        Some(Ipv4Addr::new(10, 2, 2, 2)),
    );
    peer.apply(&absent).await.unwrap();
    assert!(device.tables().ucast_macs_remote.is_empty());

    peer.stop().await;
    client.disconnect().await;
}

#[tokio::test]
async fn test_overlay_peer_apply_is_idempotent() {
    let directory = Arc::new(MemoryDirectory::new());
    let mut changes = directory.subscribe();
    let peer = OverlayPeer::new(directory.clone(), mgmt_ip(10), Uuid::new_v4());
    let network = Uuid::new_v4();
    peer.watch_network(network).await.unwrap();

    let located = MacLocation::new(
        logical_switch_name(network),
        VtepMac::Ieee(mac(1)),
        None,
        Some(tunnel_ip(10)),
    );
    peer.apply(&located).await.unwrap();
    peer.apply(&located).await.unwrap();

    assert_eq!(directory.len(), 1);
    assert!(changes.try_recv().is_ok());
    assert!(changes.try_recv().is_err());
    peer.stop().await;
}

#[tokio::test]
async fn test_start_fails_on_unreachable_device() {
    let directory = Arc::new(MemoryDirectory::new());
    let device = device(10);
    device.set_reachable(false);

    let err = start_broker(&directory, &FloodingProxyFeed::new(), Uuid::new_v4(), &device)
        .await
        .err()
        .unwrap();

    assert!(err.is_connection_loss());
    assert_eq!(device.sessions_opened(), 0);
    assert!(!device.is_open());
}

#[tokio::test]
async fn test_terminate_twice_is_safe() {
    let directory = Arc::new(MemoryDirectory::new());
    let device = device(10);
    let broker = start_broker(&directory, &FloodingProxyFeed::new(), Uuid::new_v4(), &device)
        .await
        .unwrap();
    assert_eq!(broker.connection_state(), ConnectionState::Connected);
    assert!(device.is_open());

    broker.terminate().await;
    broker.terminate().await;

    assert!(broker.is_terminated());
    assert_eq!(broker.connection_state(), ConnectionState::Disconnected);
    assert!(!device.is_open());
    // Termination was asked for, the device did not go away on its own.
    assert!(!broker.device_completed().is_cancelled());
}

#[tokio::test]
async fn test_device_loss_completes_the_device_stream() {
    let directory = Arc::new(MemoryDirectory::new());
    let device = device(10);
    let broker = start_broker(&directory, &FloodingProxyFeed::new(), Uuid::new_v4(), &device)
        .await
        .unwrap();

    device.drop_connection("link down");

    tokio::time::timeout(Duration::from_secs(5), broker.device_completed().cancelled())
        .await
        .unwrap();
    assert_eq!(broker.connection_state(), ConnectionState::Disconnected);
    broker.terminate().await;
}

#[tokio::test]
async fn test_bind_and_unbind_network() {
    let directory = Arc::new(MemoryDirectory::new());
    let device = device(10);
    let network = Uuid::new_v4();
    let broker = start_broker(&directory, &FloodingProxyFeed::new(), Uuid::new_v4(), &device)
        .await
        .unwrap();

    broker
        .bind_network(network, "eth0", VlanTag::new(10).unwrap(), vni(5000))
        .await
        .unwrap();
    // Binding again changes nothing.
    broker
        .bind_network(network, "eth0", VlanTag::new(10).unwrap(), vni(5000))
        .await
        .unwrap();
    assert_eq!(device.tables().logical_switches.len(), 1);
    assert_eq!(broker.overlay().tracked_networks(), vec![network]);

    directory
        .put(host_entry(network, mac(1), Ipv4Addr::new(10, 2, 2, 2)))
        .await
        .unwrap();
    eventually("entry on device", || ucast_remote(&device, network).len() == 1).await;

    let status = broker.unbind_network(network).await.unwrap();
    assert!(!status.is_not_found());
    let tables = device.tables();
    assert!(tables.logical_switches.is_empty());
    assert!(tables.ucast_macs_remote.is_empty());
    assert!(tables.physical_ports.iter().all(|p| p.vlan_bindings.is_empty()));
    assert!(broker.overlay().tracked_networks().is_empty());

    assert!(broker.unbind_network(network).await.unwrap().is_not_found());
    broker.terminate().await;
}

/// Directory whose unicast puts take a while to commit.
struct SlowDirectory {
    inner: MemoryDirectory,
    device: Arc<MemoryVtep>,
    started: AtomicBool,
    committed: AtomicBool,
    device_open_at_commit: AtomicBool,
}

impl SlowDirectory {
    fn new(device: Arc<MemoryVtep>) -> Self {
        Self {
            inner: MemoryDirectory::new(),
            device,
            started: AtomicBool::new(false),
            committed: AtomicBool::new(false),
            device_open_at_commit: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl OverlayDirectory for SlowDirectory {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<DirectoryChange> {
        self.inner.subscribe()
    }

    async fn entries(&self, network: Uuid) -> vxgw_broker::Result<Vec<DirectoryEntry>> {
        self.inner.entries(network).await
    }

    async fn put(&self, entry: DirectoryEntry) -> vxgw_broker::Result<()> {
        if !entry.mac.is_ucast() {
            return self.inner.put(entry).await;
        }
        self.started.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.inner.put(entry).await?;
        self.device_open_at_commit
            .store(self.device.is_open(), Ordering::SeqCst);
        self.committed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(
        &self,
        network: Uuid,
        mac: VtepMac,
        ip: Option<Ipv4Addr>,
        origin: Option<&str>,
    ) -> vxgw_broker::Result<usize> {
        self.inner.remove(network, mac, ip, origin).await
    }
}

#[tokio::test]
async fn test_terminate_lets_in_flight_update_finish_before_closing() {
    let device = device(10);
    let directory = Arc::new(SlowDirectory::new(device.clone()));
    let network = Uuid::new_v4();
    let overlay = Arc::new(OverlayPeer::new(
        directory.clone(),
        device.mgmt_ip(),
        Uuid::new_v4(),
    ));
    let transport = device.clone();
    let factory = move || Arc::new(VtepControlClient::new(transport.clone()));
    let broker = SyncBroker::start(
        overlay,
        &factory,
        device.mgmt_ip(),
        DEFAULT_MGMT_PORT,
        &FloodingProxyFeed::new(),
    )
    .await
    .unwrap();
    broker
        .bind_network(network, "eth0", VlanTag::UNTAGGED, vni(5000))
        .await
        .unwrap();

    device
        .learn_ucast_local(&logical_switch_name(network), mac(1), None)
        .unwrap();
    eventually("put in flight", || directory.started.load(Ordering::SeqCst)).await;

    broker.terminate().await;

    assert!(directory.committed.load(Ordering::SeqCst));
    assert!(directory.device_open_at_commit.load(Ordering::SeqCst));
    assert_eq!(directory.inner.len(), 1);
    assert!(!device.is_open());
}
