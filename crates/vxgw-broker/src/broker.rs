//! SyncBroker - pairs the overlay with one VTEP.
//!
//! The broker owns an [`OverlayPeer`] and a [`VtepPeer`] and runs one task
//! per direction. Each task consumes one peer's update stream and applies
//! every record to the other peer, one at a time and in publication order.
//! The two directions are independent of each other.
//!
//! # Lifecycle
//!
//! 1. Both directions are subscribed.
//! 2. The device connection is opened; its baseline flows through the
//!    already running vtep → overlay direction.
//! 3. The overlay peer starts following the flooding proxy.
//!
//! [`SyncBroker::terminate`] undoes this in reverse: it stops both
//! directions (an apply in flight finishes first), disconnects the device,
//! then stops the peers.

use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use vxgw_types::{VlanTag, Vni};
use vxgw_vtep::{ConnectionState, OpStatus, VtepClientFactory, VtepControlClient};

use crate::error::Result;
use crate::flooding_proxy::FloodingProxyFeed;
use crate::mac_location::logical_switch_name;
use crate::overlay::OverlayPeer;
use crate::peer::{PeerEvent, PeerUpdates, VxLanPeer};
use crate::vtep_peer::VtepPeer;

/// Default bound on draining the directions at termination.
pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Broker between the overlay and one VTEP.
pub struct SyncBroker {
    mgmt_ip: Ipv4Addr,
    mgmt_port: u16,
    overlay: Arc<OverlayPeer>,
    vtep: Arc<VtepPeer>,
    client: Arc<VtepControlClient>,
    cancel: CancellationToken,
    device_completed: CancellationToken,
    directions: Mutex<Vec<JoinHandle<()>>>,
    terminated: AtomicBool,
    terminate_timeout: Duration,
}

impl SyncBroker {
    /// Wires a broker for the VTEP at `mgmt_ip:mgmt_port` and connects it.
    ///
    /// On failure everything set up so far is torn down and the error is
    /// returned.
    pub async fn start(
        overlay: Arc<OverlayPeer>,
        client_factory: &dyn VtepClientFactory,
        mgmt_ip: Ipv4Addr,
        mgmt_port: u16,
        flooding_proxy: &FloodingProxyFeed,
    ) -> Result<Self> {
        Self::start_with_timeout(
            overlay,
            client_factory,
            mgmt_ip,
            mgmt_port,
            flooding_proxy,
            DEFAULT_TERMINATE_TIMEOUT,
        )
        .await
    }

    /// Same as [`SyncBroker::start`] with an explicit drain bound for
    /// [`SyncBroker::terminate`].
    #[instrument(skip(overlay, client_factory, flooding_proxy))]
    pub async fn start_with_timeout(
        overlay: Arc<OverlayPeer>,
        client_factory: &dyn VtepClientFactory,
        mgmt_ip: Ipv4Addr,
        mgmt_port: u16,
        flooding_proxy: &FloodingProxyFeed,
        terminate_timeout: Duration,
    ) -> Result<Self> {
        info!("Wiring broker for {}", mgmt_ip);

        let client = client_factory.create();
        let broker = Self {
            mgmt_ip,
            mgmt_port,
            vtep: Arc::new(VtepPeer::new(Arc::clone(&client), mgmt_ip)),
            overlay,
            client,
            cancel: CancellationToken::new(),
            device_completed: CancellationToken::new(),
            directions: Mutex::new(Vec::new()),
            terminated: AtomicBool::new(false),
            terminate_timeout,
        };

        if let Err(e) = broker.wire().await {
            error!(error = %e, "Failed to start broker for {}", mgmt_ip);
            broker.terminate().await;
            return Err(e);
        }

        broker.overlay.subscribe_flooding_proxy(flooding_proxy);
        Ok(broker)
    }

    async fn wire(&self) -> Result<()> {
        let overlay_updates = self.overlay.observable_updates()?;
        self.spawn_direction(
            overlay_updates,
            self.overlay.name().to_string(),
            Arc::clone(&self.vtep) as Arc<dyn VxLanPeer>,
            None,
        );

        let vtep_updates = self.vtep.observable_updates()?;
        self.spawn_direction(
            vtep_updates,
            self.vtep.name().to_string(),
            Arc::clone(&self.overlay) as Arc<dyn VxLanPeer>,
            Some(self.device_completed.clone()),
        );

        self.client.connect(self.mgmt_ip, self.mgmt_port).await?;
        Ok(())
    }

    fn spawn_direction(
        &self,
        updates: PeerUpdates,
        source: String,
        target: Arc<dyn VxLanPeer>,
        completed: Option<CancellationToken>,
    ) {
        let handle = tokio::spawn(run_direction(
            updates,
            source,
            target,
            self.cancel.clone(),
            completed,
        ));
        self.directions.lock().push(handle);
    }

    pub fn mgmt_ip(&self) -> Ipv4Addr {
        self.mgmt_ip
    }

    pub fn mgmt_port(&self) -> u16 {
        self.mgmt_port
    }

    pub fn overlay(&self) -> &Arc<OverlayPeer> {
        &self.overlay
    }

    pub fn client(&self) -> &Arc<VtepControlClient> {
        &self.client
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.client.state()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Cancelled once the device update stream completes on its own, which
    /// happens when the device connection is lost.
    pub fn device_completed(&self) -> CancellationToken {
        self.device_completed.clone()
    }

    /// Binds (port, vlan) to `network` on the device and starts tracking
    /// the network in the overlay.
    #[instrument(skip(self), fields(mgmt_ip = %self.mgmt_ip))]
    pub async fn bind_network(
        &self,
        network: Uuid,
        port: &str,
        vlan: VlanTag,
        vni: Vni,
    ) -> Result<()> {
        let ls = logical_switch_name(network);
        self.client.bind_vlan(&ls, port, vlan, vni, None).await?;
        self.overlay.watch_network(network).await?;
        info!(logical_switch = %ls, "Network bound");
        Ok(())
    }

    /// Stops tracking `network`, withdraws this VTEP's directory entries for
    /// it and removes its logical switch from the device.
    #[instrument(skip(self), fields(mgmt_ip = %self.mgmt_ip))]
    pub async fn unbind_network(&self, network: Uuid) -> Result<OpStatus> {
        self.overlay.forget_network(network).await?;
        let status = self
            .client
            .delete_logical_switch(&logical_switch_name(network))
            .await?;
        info!(?status, "Network unbound");
        Ok(status)
    }

    /// Tears the broker down. Calling it again does nothing.
    pub async fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            debug!(mgmt_ip = %self.mgmt_ip, "Broker already terminated");
            return;
        }
        info!("Terminating broker for {}", self.mgmt_ip);

        self.cancel.cancel();
        let directions = std::mem::take(&mut *self.directions.lock());
        for mut direction in directions {
            if tokio::time::timeout(self.terminate_timeout, &mut direction)
                .await
                .is_err()
            {
                warn!(mgmt_ip = %self.mgmt_ip, "Direction did not drain in time, aborting it");
                direction.abort();
            }
        }

        self.client.disconnect().await;
        self.overlay.stop().await;
        self.vtep.stop().await;
        info!(mgmt_ip = %self.mgmt_ip, "Broker terminated");
    }
}

async fn run_direction(
    mut updates: PeerUpdates,
    source: String,
    target: Arc<dyn VxLanPeer>,
    cancel: CancellationToken,
    completed: Option<CancellationToken>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = updates.recv() => event,
        };

        match event {
            Some(PeerEvent::Update(ml)) => {
                debug!("Apply {} to {}", ml, target.name());
                if let Err(e) = target.apply(&ml).await {
                    error!(peer = target.name(), %ml, error = %e, "Failed to apply update");
                }
            }
            Some(PeerEvent::Error(e)) => {
                error!(peer = %source, error = %e, "Error on VxLanPeer update stream");
            }
            Some(PeerEvent::Completed) | None => {
                info!(peer = %source, "VxLanPeer stream is completed");
                if let Some(completed) = &completed {
                    completed.cancel();
                }
                break;
            }
        }
    }
}
