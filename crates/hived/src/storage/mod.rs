//! Shared storage for cluster handoff values
//!
//! The primary exports a directory, every other node mounts it. Values also
//! live in substrate config objects and a local cache so a node can keep
//! going when the share is gone.

pub mod backend;
pub mod coordinator;

pub use backend::{NfsBackend, PeerSource, StorageBackend, SwarmConfigPeer};
pub use coordinator::{ReadSource, SharedStorageHandle, StorageCoordinator, StorageState};
