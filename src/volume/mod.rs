//! Volume Module
//!
//! Per-volume data model, snapshot metadata persistence and the actor that
//! serializes every operation on one volume.

pub mod actor;
pub mod event;
pub mod metadata;
pub mod registry;
pub mod types;

pub use actor::VolumeHandle;
pub use event::{Event, EventArgs};
pub use metadata::{JsonMetadataStore, MetadataStore};
pub use registry::VolumeRegistry;
pub use types::{Metadata, Origin, Snapshot, Transition, VolumeName, VolumeState};
