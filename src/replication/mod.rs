//! Replication Module
//!
//! Wire-level pieces of a replication stream: the prelude carrying
//! snapshot metadata, LZ4 framing and the relay that moves bytes between
//! the engine, the network and local pipes.

pub mod compress;
pub mod prelude;
pub mod relay;

pub use prelude::Prelude;
pub use relay::{Progress, Relay, RelayHandle, Transform, CHUNK_SIZE};
