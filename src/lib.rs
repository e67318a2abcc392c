//! Dotmesh - Snapshot Volume Replication Node
//!
//! One node of a cluster that replicates copy-on-write snapshot volumes
//! between peers using the native snapshot engine's send/receive streams.
//!
//! # Architecture
//!
//! Every volume is owned by a single actor task that processes events in
//! order. Each volume has one master node; replication requests reaching
//! any other node are proxied to it. Snapshot metadata travels in a
//! prelude ahead of the engine stream, and the whole stream is LZ4 framed
//! on the wire.
//!
//! # Features
//!
//! - Per-volume state machines with id-routed responses
//! - Push and pull transfers with progress polling
//! - Transparent proxying to a volume's master
//! - Copy-on-write cluster cache refreshed from a coordination store
//! - Topic/key notification bus for snapshot and receive events

pub mod api;
pub mod cluster;
pub mod config;
pub mod context;
pub mod error;
pub mod notify;
pub mod replication;
pub mod secrets;
pub mod transfer;
pub mod volume;

#[cfg(test)]
mod test_support;

pub use config::DotmeshConfig;
pub use context::{Collaborators, NodeContext};
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cluster::{ClusterCache, CoordinationStore};
    pub use crate::config::DotmeshConfig;
    pub use crate::context::{Collaborators, NodeContext};
    pub use crate::error::{Error, Result};
    pub use crate::notify::Bus;
    pub use crate::replication::Prelude;
    pub use crate::transfer::{Direction, TransferRequest};
    pub use crate::volume::{Event, Snapshot, VolumeHandle, VolumeState};
}
