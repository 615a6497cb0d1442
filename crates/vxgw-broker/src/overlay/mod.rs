//! Overlay side: the forwarding directory and the peer that reads and writes
//! it for one VTEP.

mod directory;
mod peer;

pub use directory::{DirectoryChange, DirectoryEntry, MemoryDirectory, OverlayDirectory};
pub use peer::OverlayPeer;
