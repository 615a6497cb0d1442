//! Device session abstraction.
//!
//! The management protocol spoken to the VTEP is hidden behind
//! [`VtepTransport`]. The control client only needs four things from it:
//! open a session and receive table updates, read the tables, commit a
//! [`Transaction`] atomically, and close the session.

use async_trait::async_trait;
use std::net::Ipv4Addr;
use tokio::sync::mpsc;

use crate::error::VtepResult;
use crate::transaction::{OpResult, Transaction};
use crate::types::{TableUpdate, VtepSnapshot};

/// Event delivered by an open transport session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A committed change in the device tables.
    Update(TableUpdate),
    /// The session was lost without the client asking for it.
    Disconnected { reason: String },
}

/// Receiving half of a session's event stream.
///
/// The stream ends when the session closes, whether requested or not.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// A management session to one VTEP.
#[async_trait]
pub trait VtepTransport: Send + Sync {
    /// Opens the session.
    ///
    /// Every table change committed after this call returns is delivered on
    /// the returned stream, in commit order.
    async fn open(&self, mgmt_ip: Ipv4Addr, mgmt_port: u16) -> VtepResult<TransportEvents>;

    /// Closes the session; the event stream ends without a
    /// [`TransportEvent::Disconnected`].
    async fn close(&self);

    /// Reads all tables.
    async fn snapshot(&self) -> VtepResult<VtepSnapshot>;

    /// Commits a transaction atomically, returning one result per op.
    async fn transact(&self, txn: Transaction) -> VtepResult<Vec<OpResult>>;
}
