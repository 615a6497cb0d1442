//! The overlay's forwarding directory.
//!
//! The directory maps (network, mac, ip) to the tunnel endpoint the MAC is
//! reachable through. Every entry carries the origin of its last writer so
//! subscribers can recognise their own writes. The directory is shared by
//! every broker in the process; each broker's overlay peer writes only
//! entries of the networks bound to its VTEP.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;
use vxgw_types::VtepMac;

use crate::error::Result;

/// A directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub network: Uuid,
    pub mac: VtepMac,
    pub ip: Option<Ipv4Addr>,
    pub endpoint: Ipv4Addr,
    /// Writer that produced the entry.
    pub origin: String,
}

/// A change committed to the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryChange {
    /// The entry was created or replaced.
    Put(DirectoryEntry),
    /// The entry was removed.
    Removed(DirectoryEntry),
}

impl DirectoryChange {
    pub fn entry(&self) -> &DirectoryEntry {
        match self {
            DirectoryChange::Put(entry) | DirectoryChange::Removed(entry) => entry,
        }
    }
}

/// Overlay forwarding store.
#[async_trait]
pub trait OverlayDirectory: Send + Sync {
    /// Subscribes to every change committed after this call.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<DirectoryChange>;

    /// Entries of one network.
    async fn entries(&self, network: Uuid) -> Result<Vec<DirectoryEntry>>;

    /// Creates or replaces the entry for (network, mac, ip).
    ///
    /// Writing an identical entry changes nothing and notifies nobody.
    async fn put(&self, entry: DirectoryEntry) -> Result<()>;

    /// Removes the entries for (network, mac) and the given ip, or for every
    /// ip when `ip` is `None`. With an `origin`, only entries last written by
    /// that writer are removed. Returns the number of entries removed.
    async fn remove(
        &self,
        network: Uuid,
        mac: VtepMac,
        ip: Option<Ipv4Addr>,
        origin: Option<&str>,
    ) -> Result<usize>;
}

type EntryKey = (Uuid, VtepMac, Option<Ipv4Addr>);

#[derive(Default)]
struct Store {
    entries: BTreeMap<EntryKey, (Ipv4Addr, String)>,
    subscribers: Vec<mpsc::UnboundedSender<DirectoryChange>>,
}

impl Store {
    fn notify(&mut self, change: DirectoryChange) {
        self.subscribers
            .retain(|subscriber| subscriber.send(change.clone()).is_ok());
    }
}

/// In-process directory.
#[derive(Default)]
pub struct MemoryDirectory {
    store: Mutex<Store>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries, ordered by (network, mac, ip).
    pub fn all_entries(&self) -> Vec<DirectoryEntry> {
        self.store
            .lock()
            .entries
            .iter()
            .map(|(key, value)| to_entry(key, value))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.store.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn to_entry(key: &EntryKey, value: &(Ipv4Addr, String)) -> DirectoryEntry {
    let (network, mac, ip) = *key;
    DirectoryEntry {
        network,
        mac,
        ip,
        endpoint: value.0,
        origin: value.1.clone(),
    }
}

#[async_trait]
impl OverlayDirectory for MemoryDirectory {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<DirectoryChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.store.lock().subscribers.push(tx);
        rx
    }

    async fn entries(&self, network: Uuid) -> Result<Vec<DirectoryEntry>> {
        Ok(self
            .store
            .lock()
            .entries
            .iter()
            .filter(|((n, _, _), _)| *n == network)
            .map(|(key, value)| to_entry(key, value))
            .collect())
    }

    async fn put(&self, entry: DirectoryEntry) -> Result<()> {
        let mut store = self.store.lock();
        let key = (entry.network, entry.mac, entry.ip);
        let value = (entry.endpoint, entry.origin.clone());

        if store.entries.get(&key) == Some(&value) {
            return Ok(());
        }

        debug!(network = %entry.network, mac = %entry.mac, endpoint = %entry.endpoint, "Directory put");
        store.entries.insert(key, value);
        store.notify(DirectoryChange::Put(entry));
        Ok(())
    }

    async fn remove(
        &self,
        network: Uuid,
        mac: VtepMac,
        ip: Option<Ipv4Addr>,
        origin: Option<&str>,
    ) -> Result<usize> {
        let mut store = self.store.lock();
        let keys: Vec<EntryKey> = store
            .entries
            .iter()
            .filter(|((n, m, i), (_, writer))| {
                *n == network
                    && *m == mac
                    && (ip.is_none() || *i == ip)
                    && origin.map_or(true, |origin| writer == origin)
            })
            .map(|(key, _)| *key)
            .collect();

        for key in &keys {
            if let Some(value) = store.entries.remove(key) {
                let entry = to_entry(key, &value);
                store.notify(DirectoryChange::Removed(entry));
            }
        }

        if !keys.is_empty() {
            debug!(%network, %mac, count = keys.len(), "Directory remove");
        }
        Ok(keys.len())
    }
}
