//! VXLAN gateway synchronization.
//!
//! Keeps the forwarding tables of hardware VTEPs consistent with the
//! overlay's forwarding directory. MAC locations learned on either side are
//! replicated to the other without feedback loops:
//!
//! - [`MacLocation`]: the replicated record (logical switch, mac, ip,
//!   tunnel endpoint; no endpoint means withdrawal)
//! - [`VxLanPeer`]: one side of the exchange, [`OverlayPeer`] or [`VtepPeer`]
//! - [`SyncBroker`]: pairs the two peers of one VTEP
//! - [`FloodingProxyFeed`]: current flooding proxy per tunnel zone
//! - [`GatewayService`]: one broker per configured VTEP
//!
//! # Example
//!
//! ```ignore
//! let directory = Arc::new(MemoryDirectory::new());
//! let feed = FloodingProxyFeed::new();
//! let overlay = Arc::new(OverlayPeer::new(directory, mgmt_ip, tunnel_zone));
//! let factory = move || Arc::new(VtepControlClient::new(device.clone()));
//!
//! let broker = SyncBroker::start(overlay, &factory, mgmt_ip, DEFAULT_MGMT_PORT, &feed).await?;
//! broker.bind_network(network, "eth0", VlanTag::UNTAGGED, vni).await?;
//! // ...
//! broker.terminate().await;
//! ```

mod broker;
pub mod config;
mod error;
mod flooding_proxy;
mod mac_location;
pub mod overlay;
mod peer;
mod service;
mod vtep_peer;

pub use broker::{SyncBroker, DEFAULT_TERMINATE_TIMEOUT};
pub use config::{BindingConfig, BrokerConfig, GatewayConfig, TunnelZoneConfig, VtepConfig};
pub use error::{Result, VxgwError};
pub use flooding_proxy::{FloodingProxies, FloodingProxyFeed};
pub use mac_location::{logical_switch_name, network_id, MacLocation, LOGICAL_SWITCH_PREFIX};
pub use overlay::{DirectoryChange, DirectoryEntry, MemoryDirectory, OverlayDirectory, OverlayPeer};
pub use peer::{PeerEvent, PeerUpdates, VxLanPeer};
pub use service::{Connector, GatewayService};
pub use vtep_peer::VtepPeer;
