//! snapsync - ship btrfs snapshots incrementally to a peer.
//!
//! The sender lists its local snapshots of a subvolume, asks the peer which
//! of them it already holds, and sends a new snapshot as a delta against the
//! newest shared one (or in full when there is none).

pub mod btrfs;
pub mod catalog;
pub mod config;
pub mod error;
pub mod producer;
pub mod protocol;
pub mod selector;
pub mod send_stream;
pub mod server;
pub mod transport;

pub use catalog::{SnapshotCatalog, SnapshotRecord};
pub use error::{Error, Result};
pub use selector::{ParentSelector, ShipReport};
