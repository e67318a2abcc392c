//! Cluster Module
//!
//! What a node knows about the rest of the cluster: the coordination
//! store, the copy-on-write cache loaded from it, and how peers are
//! addressed.

pub mod cache;
pub mod containers;
pub mod refresh;
pub mod selector;
pub mod store;

pub use cache::{ClusterCache, Container, ContainerInfo, CowMap, DirtyInfo, StateEntry};
pub use containers::{ContainerInventory, NoContainers, StaticInventory};
pub use refresh::CacheRefresher;
pub use selector::{AddressSelector, FirstAddress, RoundRobin};
pub use store::{ClusterFacts, CoordinationStore, MemoryStore};
