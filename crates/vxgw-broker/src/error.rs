//! Error types for the gateway broker.

use std::net::Ipv4Addr;
use thiserror::Error;
use vxgw_vtep::VtepError;

/// Result type alias for broker operations.
pub type Result<T> = std::result::Result<T, VxgwError>;

/// Errors raised by peers, brokers and the gateway service.
#[derive(Debug, Error)]
pub enum VxgwError {
    /// A VTEP control operation failed.
    #[error(transparent)]
    Vtep(#[from] VtepError),

    /// A peer's backing store failed while producing or applying updates.
    #[error("Stream error on {peer}: {message}")]
    Stream { peer: String, message: String },

    /// The update stream of a peer was already handed out.
    #[error("Update stream of {0} was already taken")]
    StreamTaken(String),

    /// A broker for this VTEP is already running.
    #[error("Broker for VTEP {0} is already running")]
    BrokerExists(Ipv4Addr),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VxgwError {
    pub fn stream(peer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Stream {
            peer: peer.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Returns true if the device connection is gone.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, VxgwError::Vtep(e) if e.is_connection_loss())
    }
}
