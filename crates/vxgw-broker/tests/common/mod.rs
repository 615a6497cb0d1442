//! Shared fixtures for the broker integration tests.
#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;
use vxgw_broker::{
    logical_switch_name, DirectoryEntry, FloodingProxyFeed, MemoryDirectory, OverlayPeer,
    SyncBroker,
};
use vxgw_types::{MacAddress, VtepMac, Vni};
use vxgw_vtep::{McastMac, MemoryVtep, UcastMac, VtepControlClient, DEFAULT_MGMT_PORT};

pub fn mgmt_ip(n: u8) -> Ipv4Addr {
    Ipv4Addr::new(192, 168, 1, n)
}

pub fn tunnel_ip(n: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 1, 1, n)
}

pub fn mac(n: u8) -> MacAddress {
    MacAddress::new([0x02, 0, 0, 0, 0, n])
}

pub fn vni(v: u32) -> Vni {
    Vni::new(v).unwrap()
}

/// Device number `n`, managed at 192.168.1.n with tunnel ip 10.1.1.n.
pub fn device(n: u8) -> Arc<MemoryVtep> {
    Arc::new(MemoryVtep::new(
        &format!("vtep{}", n),
        mgmt_ip(n),
        tunnel_ip(n),
        ["eth0", "eth1"],
    ))
}

pub async fn start_broker(
    directory: &Arc<MemoryDirectory>,
    feed: &FloodingProxyFeed,
    tunnel_zone: Uuid,
    device: &Arc<MemoryVtep>,
) -> vxgw_broker::Result<SyncBroker> {
    let overlay = Arc::new(OverlayPeer::new(
        directory.clone(),
        device.mgmt_ip(),
        tunnel_zone,
    ));
    let transport = device.clone();
    let factory = move || Arc::new(VtepControlClient::new(transport.clone()));
    SyncBroker::start(overlay, &factory, device.mgmt_ip(), DEFAULT_MGMT_PORT, feed).await
}

/// A directory entry written by a hypervisor host rather than a VTEP.
pub fn host_entry(network: Uuid, mac: MacAddress, endpoint: Ipv4Addr) -> DirectoryEntry {
    DirectoryEntry {
        network,
        mac: VtepMac::Ieee(mac),
        ip: None,
        endpoint,
        origin: "host-1".to_string(),
    }
}

/// Unicast directory entries, ordered by (network, mac, ip).
pub fn ucast_entries(directory: &MemoryDirectory) -> Vec<DirectoryEntry> {
    directory
        .all_entries()
        .into_iter()
        .filter(|entry| entry.mac.is_ucast())
        .collect()
}

pub fn ucast_remote(device: &MemoryVtep, network: Uuid) -> Vec<UcastMac> {
    let tables = device.tables();
    let Some(id) = tables
        .logical_switch_by_name(&logical_switch_name(network))
        .map(|ls| ls.id)
    else {
        return Vec::new();
    };
    tables
        .ucast_macs_remote
        .into_iter()
        .filter(|row| row.logical_switch == id)
        .collect()
}

pub fn mcast_remote(device: &MemoryVtep, network: Uuid) -> Vec<McastMac> {
    let tables = device.tables();
    let Some(id) = tables
        .logical_switch_by_name(&logical_switch_name(network))
        .map(|ls| ls.id)
    else {
        return Vec::new();
    };
    tables
        .mcast_macs_remote
        .into_iter()
        .filter(|row| row.logical_switch == id)
        .collect()
}

/// Polls `check` until it holds, failing the test after five seconds.
pub async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Lets the spawned tasks run for a while.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
