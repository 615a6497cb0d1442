//! VxLanPeer - one side of a MAC location exchange.
//!
//! A peer owns a backing store of [`MacLocation`]s. It publishes changes of
//! that store on an update stream and accepts records from the other side
//! through [`VxLanPeer::apply`]. The broker pairs two peers by feeding each
//! stream into the opposite peer.

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{Result, VxgwError};
use crate::mac_location::MacLocation;

/// Event published on a peer's update stream.
#[derive(Debug)]
pub enum PeerEvent {
    /// The backing store changed.
    Update(MacLocation),
    /// The backing store reported an error; the stream goes on.
    Error(VxgwError),
    /// The stream is over; nothing follows.
    Completed,
}

/// Receiving half of a peer's update stream.
pub type PeerUpdates = mpsc::UnboundedReceiver<PeerEvent>;

/// A participant in MAC location synchronization.
///
/// Implementations must not re-publish a record that is only the echo of
/// one they received through `apply`, and applying a record twice must have
/// no effect beyond the first time.
#[async_trait]
pub trait VxLanPeer: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Hands out the update stream.
    ///
    /// The stream is unbounded and cannot be restarted; a second call fails
    /// with [`VxgwError::StreamTaken`].
    fn observable_updates(&self) -> Result<PeerUpdates>;

    /// Writes a record into the backing store.
    async fn apply(&self, ml: &MacLocation) -> Result<()>;

    /// Releases the peer's resources. The update stream completes.
    async fn stop(&self);
}

/// Single-consumer update stream shared by the peer implementations.
pub(crate) struct UpdateStream {
    peer: String,
    tx: Mutex<Option<mpsc::UnboundedSender<PeerEvent>>>,
    rx: Mutex<Option<PeerUpdates>>,
}

impl UpdateStream {
    pub(crate) fn new(peer: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            peer: peer.into(),
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
        }
    }

    pub(crate) fn take(&self) -> Result<PeerUpdates> {
        self.rx
            .lock()
            .take()
            .ok_or_else(|| VxgwError::StreamTaken(self.peer.clone()))
    }

    pub(crate) fn publish(&self, ml: MacLocation) {
        trace!(peer = %self.peer, %ml, "Publishing update");
        self.send(PeerEvent::Update(ml));
    }

    pub(crate) fn error(&self, error: VxgwError) {
        self.send(PeerEvent::Error(error));
    }

    /// Sends `Completed` and closes the stream. Later events are dropped.
    pub(crate) fn complete(&self) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(PeerEvent::Completed);
        }
    }

    fn send(&self, event: PeerEvent) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vxgw_types::VtepMac;

    #[tokio::test]
    async fn test_stream_is_taken_once() {
        let stream = UpdateStream::new("test");
        assert!(stream.take().is_ok());
        assert!(matches!(stream.take(), Err(VxgwError::StreamTaken(peer)) if peer == "test"));
    }

    #[tokio::test]
    async fn test_complete_closes_stream() {
        let stream = UpdateStream::new("test");
        let mut updates = stream.take().unwrap();

        stream.publish(MacLocation::withdrawal("ls", VtepMac::UnknownDst, None));
        stream.complete();
        stream.publish(MacLocation::withdrawal("ls", VtepMac::UnknownDst, None));

        assert!(matches!(updates.recv().await, Some(PeerEvent::Update(_))));
        assert!(matches!(updates.recv().await, Some(PeerEvent::Completed)));
        assert!(updates.recv().await.is_none());
    }
}
