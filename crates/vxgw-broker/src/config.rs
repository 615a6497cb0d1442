//! Configuration file support for vxgwd
//!
//! Loads and validates the gateway configuration from TOML files.
//! Default location: /etc/vxgw/vxgwd.toml
//!
//! ```toml
//! [broker]
//! terminate_timeout_secs = 5
//!
//! [[tunnel_zone]]
//! id = "7d0f1a3e-5f26-4c51-9a8e-2a7f3c6b9e10"
//! flooding_proxy = "10.0.0.100"
//!
//! [[vtep]]
//! mgmt_ip = "192.168.1.10"
//! tunnel_ip = "10.1.1.10"
//! tunnel_zone = "7d0f1a3e-5f26-4c51-9a8e-2a7f3c6b9e10"
//! ports = ["eth0", "eth1"]
//!
//! [[vtep.binding]]
//! network = "3b7c4a52-0d7e-4b8e-9a65-0f4b6a1d2c33"
//! port = "eth0"
//! vlan = 10
//! vni = 10010
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;
use vxgw_types::{VlanTag, Vni};
use vxgw_vtep::DEFAULT_MGMT_PORT;

use crate::error::{Result, VxgwError};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vxgw/vxgwd.toml";

/// Broker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Bound on draining a broker's directions at termination, in seconds
    #[serde(default = "default_terminate_timeout")]
    pub terminate_timeout_secs: u64,
}

/// A network bound to a VTEP port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingConfig {
    /// Overlay network id
    pub network: Uuid,

    /// Physical port name
    pub port: String,

    /// VLAN tag on the port, 0 for untagged
    #[serde(default = "default_vlan")]
    pub vlan: VlanTag,

    /// VNI of the network's logical switch
    pub vni: Vni,
}

/// A hardware VTEP
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VtepConfig {
    /// Management address
    pub mgmt_ip: Ipv4Addr,

    /// Management port
    #[serde(default = "default_mgmt_port")]
    pub mgmt_port: u16,

    /// Tunnel endpoint address
    pub tunnel_ip: Ipv4Addr,

    /// Tunnel zone the VTEP belongs to
    pub tunnel_zone: Uuid,

    /// Physical switch name
    #[serde(default = "default_switch_name")]
    pub name: String,

    /// Physical ports
    #[serde(default)]
    pub ports: Vec<String>,

    /// Networks bound at startup
    #[serde(default, rename = "binding")]
    pub bindings: Vec<BindingConfig>,
}

/// A tunnel zone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelZoneConfig {
    /// Zone id
    pub id: Uuid,

    /// Tunnel address of the zone's flooding proxy
    #[serde(default)]
    pub flooding_proxy: Option<Ipv4Addr>,
}

/// Complete vxgwd configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Broker configuration
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Tunnel zones
    #[serde(default, rename = "tunnel_zone")]
    pub tunnel_zones: Vec<TunnelZoneConfig>,

    /// VTEPs
    #[serde(default, rename = "vtep")]
    pub vteps: Vec<VtepConfig>,
}

// Default functions
fn default_terminate_timeout() -> u64 {
    5
}

fn default_mgmt_port() -> u16 {
    DEFAULT_MGMT_PORT
}

fn default_switch_name() -> String {
    "vtep".to_string()
}

fn default_vlan() -> VlanTag {
    VlanTag::UNTAGGED
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            terminate_timeout_secs: default_terminate_timeout(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                VxgwError::config(format!(
                    "Failed to parse config file {}: {}",
                    path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(VxgwError::Io(e)),
        }
    }

    /// Load from default location or defaults
    pub fn load() -> Result<Self> {
        Self::load_or_default(DEFAULT_CONFIG_PATH)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| VxgwError::config(e.to_string()))
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| VxgwError::config(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Get terminate timeout as Duration
    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.broker.terminate_timeout_secs)
    }

    pub fn tunnel_zone(&self, id: Uuid) -> Option<&TunnelZoneConfig> {
        self.tunnel_zones.iter().find(|zone| zone.id == id)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.broker.terminate_timeout_secs == 0 {
            return Err(VxgwError::config("terminate_timeout_secs must be > 0"));
        }

        let mut zones = HashSet::new();
        for zone in &self.tunnel_zones {
            if !zones.insert(zone.id) {
                return Err(VxgwError::config(format!(
                    "duplicate tunnel zone {}",
                    zone.id
                )));
            }
        }

        let mut mgmt_ips = HashSet::new();
        for vtep in &self.vteps {
            if !mgmt_ips.insert(vtep.mgmt_ip) {
                return Err(VxgwError::config(format!(
                    "duplicate VTEP management ip {}",
                    vtep.mgmt_ip
                )));
            }
            if vtep.mgmt_port == 0 {
                return Err(VxgwError::config(format!(
                    "VTEP {}: mgmt_port must be > 0",
                    vtep.mgmt_ip
                )));
            }
            if !zones.contains(&vtep.tunnel_zone) {
                return Err(VxgwError::config(format!(
                    "VTEP {}: unknown tunnel zone {}",
                    vtep.mgmt_ip, vtep.tunnel_zone
                )));
            }
            for binding in &vtep.bindings {
                if !vtep.ports.contains(&binding.port) {
                    return Err(VxgwError::config(format!(
                        "VTEP {}: binding of network {} uses unknown port {}",
                        vtep.mgmt_ip, binding.network, binding.port
                    )));
                }
            }
        }

        Ok(())
    }
}
