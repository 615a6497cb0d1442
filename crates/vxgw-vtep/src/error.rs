//! Error types for VTEP control operations.
//!
//! Absent rows are not errors: deletes report them through
//! [`OpStatus::NotFound`](crate::OpStatus) and lookups return `None`.

use std::net::Ipv4Addr;
use thiserror::Error;

/// Result type alias for VTEP control operations.
pub type VtepResult<T> = Result<T, VtepError>;

/// Errors that can occur while managing a VTEP.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VtepError {
    /// The device could not be reached, or the session was lost.
    #[error("Connection to VTEP {mgmt_ip}:{mgmt_port} failed: {message}")]
    Connection {
        /// Management address of the device.
        mgmt_ip: Ipv4Addr,
        /// Management port of the device.
        mgmt_port: u16,
        /// Error message.
        message: String,
    },

    /// A control operation was issued without a live session.
    #[error("Not connected to VTEP")]
    NotConnected,

    /// A create collided with an existing row (name or VNI).
    #[error("{table} already contains {key}")]
    AlreadyExists {
        /// The table holding the conflicting row.
        table: String,
        /// The conflicting key.
        key: String,
    },

    /// The device rejected a well-formed operation.
    #[error("VTEP rejected {operation}: {message}")]
    Device {
        /// The operation that failed (e.g., "add_bindings").
        operation: String,
        /// Error message.
        message: String,
    },
}

impl VtepError {
    /// Creates a connection error.
    pub fn connection(mgmt_ip: Ipv4Addr, mgmt_port: u16, message: impl Into<String>) -> Self {
        Self::Connection {
            mgmt_ip,
            mgmt_port,
            message: message.into(),
        }
    }

    /// Creates an already-exists error.
    pub fn already_exists(table: impl Into<String>, key: impl Into<String>) -> Self {
        Self::AlreadyExists {
            table: table.into(),
            key: key.into(),
        }
    }

    /// Creates a device error.
    pub fn device(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Device {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Returns true if this error means the session is gone.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, VtepError::Connection { .. } | VtepError::NotConnected)
    }
}
