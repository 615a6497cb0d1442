//! Flooding proxy designation per tunnel zone.
//!
//! Unknown-destination traffic entering the overlay from a VTEP is handed to
//! one designated host of the VTEP's tunnel zone, the flooding proxy. The
//! designation is made elsewhere and changes over time; this feed carries
//! the current proxy tunnel IP of every zone to the overlay peers.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

/// Current flooding proxy of every tunnel zone.
pub type FloodingProxies = BTreeMap<Uuid, Ipv4Addr>;

/// Shared, observable flooding proxy state.
#[derive(Clone)]
pub struct FloodingProxyFeed {
    tx: Arc<watch::Sender<FloodingProxies>>,
}

impl Default for FloodingProxyFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl FloodingProxyFeed {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(FloodingProxies::new());
        Self { tx: Arc::new(tx) }
    }

    /// Designates `proxy` for `tunnel_zone`.
    pub fn set_proxy(&self, tunnel_zone: Uuid, proxy: Ipv4Addr) {
        let changed = self
            .tx
            .send_if_modified(|proxies| proxies.insert(tunnel_zone, proxy) != Some(proxy));
        if changed {
            info!(%tunnel_zone, %proxy, "Flooding proxy changed");
        }
    }

    /// Leaves `tunnel_zone` without flooding proxy.
    pub fn clear_proxy(&self, tunnel_zone: Uuid) {
        let changed = self
            .tx
            .send_if_modified(|proxies| proxies.remove(&tunnel_zone).is_some());
        if changed {
            info!(%tunnel_zone, "Flooding proxy cleared");
        }
    }

    pub fn proxy(&self, tunnel_zone: Uuid) -> Option<Ipv4Addr> {
        self.tx.borrow().get(&tunnel_zone).copied()
    }

    pub fn subscribe(&self) -> watch::Receiver<FloodingProxies> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unchanged_proxy_does_not_notify() {
        let feed = FloodingProxyFeed::new();
        let zone = Uuid::new_v4();
        let mut rx = feed.subscribe();

        feed.set_proxy(zone, Ipv4Addr::new(10, 0, 0, 9));
        assert!(rx.has_changed().unwrap());
        let _ = rx.borrow_and_update();

        feed.set_proxy(zone, Ipv4Addr::new(10, 0, 0, 9));
        assert!(!rx.has_changed().unwrap());

        feed.clear_proxy(zone);
        assert!(rx.has_changed().unwrap());
        assert_eq!(feed.proxy(zone), None);
    }
}
