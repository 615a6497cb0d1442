//! Gateway service: one broker per configured VTEP.
//!
//! The service is what the topology layer drives. It starts and stops
//! brokers per device, and when a device connection is lost it terminates
//! only that device's broker and records the device as disconnected.
//! Reconnecting is up to the caller, by starting the VTEP again.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use vxgw_types::{VlanTag, Vni};
use vxgw_vtep::{OpStatus, VtepControlClient};

use crate::broker::{SyncBroker, DEFAULT_TERMINATE_TIMEOUT};
use crate::config::VtepConfig;
use crate::error::{Result, VxgwError};
use crate::flooding_proxy::FloodingProxyFeed;
use crate::overlay::{OverlayDirectory, OverlayPeer};

/// Builds the control client of a configured VTEP.
pub type Connector = Arc<dyn Fn(&VtepConfig) -> Arc<VtepControlClient> + Send + Sync>;

struct VtepEntry {
    broker: Arc<SyncBroker>,
    watcher: JoinHandle<()>,
}

#[derive(Default)]
struct Registry {
    active: HashMap<Ipv4Addr, VtepEntry>,
    /// VTEPs whose broker is being started.
    starting: HashSet<Ipv4Addr>,
    disconnected: BTreeSet<Ipv4Addr>,
}

/// Holds a management address in `Registry::starting` until the start
/// either registers its broker or is abandoned.
struct Reservation {
    registry: Arc<Mutex<Registry>>,
    mgmt_ip: Ipv4Addr,
    armed: bool,
}

impl Reservation {
    fn acquire(registry: &Arc<Mutex<Registry>>, mgmt_ip: Ipv4Addr) -> Result<Self> {
        let mut guard = registry.lock();
        if guard.active.contains_key(&mgmt_ip) || !guard.starting.insert(mgmt_ip) {
            return Err(VxgwError::BrokerExists(mgmt_ip));
        }
        Ok(Self {
            registry: Arc::clone(registry),
            mgmt_ip,
            armed: true,
        })
    }

    /// Replaces the reservation with a running broker.
    fn register(mut self, broker: Arc<SyncBroker>) {
        self.armed = false;
        let mut registry = self.registry.lock();
        registry.starting.remove(&self.mgmt_ip);
        registry.disconnected.remove(&self.mgmt_ip);
        // Spawned under the lock: the watcher cannot look the VTEP up
        // before its entry exists.
        let watcher = tokio::spawn(watch_device(
            Arc::clone(&self.registry),
            Arc::clone(&broker),
        ));
        registry
            .active
            .insert(self.mgmt_ip, VtepEntry { broker, watcher });
        info!(active = registry.active.len(), "VTEP started");
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            self.registry.lock().starting.remove(&self.mgmt_ip);
        }
    }
}

/// Registry of running brokers.
pub struct GatewayService {
    directory: Arc<dyn OverlayDirectory>,
    flooding_proxy: FloodingProxyFeed,
    connector: Connector,
    terminate_timeout: Duration,
    registry: Arc<Mutex<Registry>>,
}

impl GatewayService {
    pub fn new(
        directory: Arc<dyn OverlayDirectory>,
        flooding_proxy: FloodingProxyFeed,
        connector: Connector,
    ) -> Self {
        Self {
            directory,
            flooding_proxy,
            connector,
            terminate_timeout: DEFAULT_TERMINATE_TIMEOUT,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    pub fn with_terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }

    pub fn flooding_proxy(&self) -> &FloodingProxyFeed {
        &self.flooding_proxy
    }

    /// Management addresses of the VTEPs with a running broker.
    pub fn active_vteps(&self) -> Vec<Ipv4Addr> {
        let mut vteps: Vec<_> = self.registry.lock().active.keys().copied().collect();
        vteps.sort();
        vteps
    }

    /// VTEPs whose broker was terminated after losing the device.
    pub fn disconnected_vteps(&self) -> Vec<Ipv4Addr> {
        self.registry.lock().disconnected.iter().copied().collect()
    }

    pub fn broker(&self, mgmt_ip: Ipv4Addr) -> Option<Arc<SyncBroker>> {
        self.registry
            .lock()
            .active
            .get(&mgmt_ip)
            .map(|entry| Arc::clone(&entry.broker))
    }

    /// Starts the broker of a VTEP and applies its configured bindings.
    ///
    /// A binding that fails is logged and skipped. Fails with
    /// [`VxgwError::BrokerExists`] while a broker for the VTEP is running or
    /// being started.
    #[instrument(skip(self, config), fields(mgmt_ip = %config.mgmt_ip))]
    pub async fn start_vtep(&self, config: &VtepConfig) -> Result<()> {
        let reservation = Reservation::acquire(&self.registry, config.mgmt_ip)?;

        let overlay = Arc::new(OverlayPeer::new(
            Arc::clone(&self.directory),
            config.mgmt_ip,
            config.tunnel_zone,
        ));
        let connector = Arc::clone(&self.connector);
        let factory = move || connector(config);
        let broker = Arc::new(
            SyncBroker::start_with_timeout(
                overlay,
                &factory,
                config.mgmt_ip,
                config.mgmt_port,
                &self.flooding_proxy,
                self.terminate_timeout,
            )
            .await?,
        );

        for binding in &config.bindings {
            if let Err(e) = broker
                .bind_network(binding.network, &binding.port, binding.vlan, binding.vni)
                .await
            {
                warn!(network = %binding.network, port = %binding.port, error = %e, "Failed to bind network");
            }
        }

        reservation.register(broker);
        Ok(())
    }

    /// Binds a network on a running VTEP.
    pub async fn bind_network(
        &self,
        mgmt_ip: Ipv4Addr,
        network: Uuid,
        port: &str,
        vlan: VlanTag,
        vni: Vni,
    ) -> Result<()> {
        let broker = self.require_broker(mgmt_ip)?;
        broker.bind_network(network, port, vlan, vni).await
    }

    /// Unbinds a network from a running VTEP.
    pub async fn unbind_network(&self, mgmt_ip: Ipv4Addr, network: Uuid) -> Result<OpStatus> {
        let broker = self.require_broker(mgmt_ip)?;
        broker.unbind_network(network).await
    }

    fn require_broker(&self, mgmt_ip: Ipv4Addr) -> Result<Arc<SyncBroker>> {
        self.broker(mgmt_ip)
            .ok_or_else(|| VxgwError::config(format!("VTEP {} is not running", mgmt_ip)))
    }

    /// Terminates the broker of a VTEP. Returns false if none was running.
    #[instrument(skip(self))]
    pub async fn stop_vtep(&self, mgmt_ip: Ipv4Addr) -> bool {
        let Some(entry) = self.registry.lock().active.remove(&mgmt_ip) else {
            return false;
        };
        entry.watcher.abort();
        entry.broker.terminate().await;
        info!("VTEP stopped");
        true
    }

    /// Terminates every broker.
    pub async fn shutdown(&self) {
        let entries: Vec<VtepEntry> = self
            .registry
            .lock()
            .active
            .drain()
            .map(|(_, entry)| entry)
            .collect();

        info!(count = entries.len(), "Shutting down gateway service");
        for entry in entries {
            entry.watcher.abort();
            entry.broker.terminate().await;
        }
    }
}

/// Terminates `broker` once its device stream completes.
async fn watch_device(registry: Arc<Mutex<Registry>>, broker: Arc<SyncBroker>) {
    broker.device_completed().cancelled().await;

    let mgmt_ip = broker.mgmt_ip();
    warn!(%mgmt_ip, "Lost VTEP connection, terminating its broker");
    {
        let mut registry = registry.lock();
        let ours = registry
            .active
            .get(&mgmt_ip)
            .is_some_and(|entry| Arc::ptr_eq(&entry.broker, &broker));
        if ours {
            registry.active.remove(&mgmt_ip);
            registry.disconnected.insert(mgmt_ip);
        }
    }
    broker.terminate().await;
}
