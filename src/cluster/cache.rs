//! Cluster State Cache
//!
//! Read-mostly view of the cluster: who masters each volume, where each
//! node can be reached, which snapshots each node holds and what state
//! each volume is in. Every map is an immutable `Arc` swapped whole, so
//! readers never wait on a writer.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cluster::store::ClusterFacts;
use crate::error::{Error, Result};
use crate::volume::{Snapshot, Transition, VolumeState};

/// A map replaced wholesale on every write
pub struct CowMap<K, V> {
    inner: ArcSwap<HashMap<K, V>>,
}

impl<K, V> CowMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            inner: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Current snapshot of the map
    pub fn load(&self) -> Arc<HashMap<K, V>> {
        self.inner.load_full()
    }

    /// Swap in a freshly built map
    pub fn replace(&self, map: HashMap<K, V>) {
        self.inner.store(Arc::new(map));
    }

    /// Copy, modify and swap; `f` reruns if another writer got in first
    pub fn update<F>(&self, mut f: F)
    where
        F: FnMut(&mut HashMap<K, V>),
    {
        self.inner.rcu(|current| {
            let mut next = HashMap::clone(current);
            f(&mut next);
            next
        });
    }
}

impl<K, V> Default for CowMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// State of a volume on one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    pub state: VolumeState,
    pub status: String,
    pub since: DateTime<Utc>,
}

impl From<&Transition> for StateEntry {
    fn from(t: &Transition) -> Self {
        Self {
            state: t.state,
            status: t.status.clone(),
            since: t.at,
        }
    }
}

/// Dirty delta and size reported for a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyInfo {
    pub server: String,
    pub dirty_bytes: u64,
    pub size_bytes: u64,
}

/// A container using a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub name: String,
}

/// Containers using a volume on a server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub server: String,
    pub containers: Vec<Container>,
}

type NodeSnapshots = HashMap<String, Vec<Snapshot>>;

/// Node-local view of the cluster
pub struct ClusterCache {
    node_id: String,
    /// filesystem -> master node
    masters: CowMap<String, String>,
    /// node -> addresses, in preference order
    addresses: CowMap<String, Vec<String>>,
    /// node -> filesystem -> snapshots
    snapshots: CowMap<String, NodeSnapshots>,
    /// filesystem -> node -> state
    states: CowMap<String, HashMap<String, StateEntry>>,
    /// filesystem -> dirty info
    dirty: CowMap<String, DirtyInfo>,
    /// filesystem -> containers
    containers: CowMap<String, ContainerInfo>,
}

impl ClusterCache {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            masters: CowMap::new(),
            addresses: CowMap::new(),
            snapshots: CowMap::new(),
            states: CowMap::new(),
            dirty: CowMap::new(),
            containers: CowMap::new(),
        }
    }

    /// This node's id
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Swap every map for the freshly loaded facts
    pub fn replace(&self, facts: ClusterFacts) {
        self.masters.replace(facts.masters);
        self.addresses.replace(facts.addresses);
        self.snapshots.replace(facts.snapshots);
        self.states.replace(facts.states);
        self.dirty.replace(facts.dirty);
        self.containers.replace(facts.containers);
    }

    // ============ Queries ============

    pub fn master_for(&self, filesystem: &str) -> Option<String> {
        self.masters.load().get(filesystem).cloned()
    }

    pub fn is_master(&self, filesystem: &str) -> bool {
        self.master_for(filesystem).as_deref() == Some(self.node_id.as_str())
    }

    pub fn addresses_for(&self, node: &str) -> Vec<String> {
        self.addresses.load().get(node).cloned().unwrap_or_default()
    }

    pub fn snapshots_for(&self, node: &str, filesystem: &str) -> Vec<Snapshot> {
        self.snapshots
            .load()
            .get(node)
            .and_then(|volumes| volumes.get(filesystem))
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshots held by the volume's master
    pub fn master_snapshots(&self, filesystem: &str) -> Vec<Snapshot> {
        match self.master_for(filesystem) {
            Some(master) => self.snapshots_for(&master, filesystem),
            None => Vec::new(),
        }
    }

    /// State of a volume on this node
    pub fn current_state(&self, filesystem: &str) -> Result<StateEntry> {
        self.states
            .load()
            .get(filesystem)
            .and_then(|nodes| nodes.get(&self.node_id))
            .cloned()
            .ok_or_else(|| Error::UnknownVolume(filesystem.to_string()))
    }

    /// State of a volume on every node that reported one
    pub fn states_for(&self, filesystem: &str) -> HashMap<String, StateEntry> {
        self.states.load().get(filesystem).cloned().unwrap_or_default()
    }

    pub fn dirty_for(&self, filesystem: &str) -> Option<DirtyInfo> {
        self.dirty.load().get(filesystem).cloned()
    }

    pub fn containers_for(&self, filesystem: &str) -> Option<ContainerInfo> {
        self.containers.load().get(filesystem).cloned()
    }

    /// Every volume with a known master, sorted
    pub fn known_volumes(&self) -> Vec<String> {
        let mut volumes: Vec<String> = self.masters.load().keys().cloned().collect();
        volumes.sort();
        volumes
    }

    /// Volumes mastered by this node, sorted
    pub fn mastered_volumes(&self) -> Vec<String> {
        let mut volumes: Vec<String> = self
            .masters
            .load()
            .iter()
            .filter(|(_, master)| **master == self.node_id)
            .map(|(fs, _)| fs.clone())
            .collect();
        volumes.sort();
        volumes
    }

    // ============ Write-through ============

    pub fn record_master(&self, filesystem: &str, node: &str) {
        self.masters.update(|m| {
            m.insert(filesystem.to_string(), node.to_string());
        });
    }

    pub fn record_addresses(&self, node: &str, addresses: Vec<String>) {
        self.addresses.update(|m| {
            m.insert(node.to_string(), addresses.clone());
        });
    }

    /// Record this node's state for a volume
    pub fn record_state(&self, filesystem: &str, entry: StateEntry) {
        self.states.update(|m| {
            m.entry(filesystem.to_string())
                .or_default()
                .insert(self.node_id.clone(), entry.clone());
        });
    }

    /// Record this node's state unless the cache already holds a newer one
    pub fn record_state_if_newer(&self, filesystem: &str, entry: StateEntry) {
        self.states.update(|m| {
            let nodes = m.entry(filesystem.to_string()).or_default();
            match nodes.get(&self.node_id) {
                Some(existing) if existing.since > entry.since => {}
                _ => {
                    nodes.insert(self.node_id.clone(), entry.clone());
                }
            }
        });
    }

    pub fn record_snapshots(&self, node: &str, filesystem: &str, snapshots: Vec<Snapshot>) {
        self.snapshots.update(|m| {
            m.entry(node.to_string())
                .or_default()
                .insert(filesystem.to_string(), snapshots.clone());
        });
    }

    pub fn record_dirty(&self, filesystem: &str, info: DirtyInfo) {
        self.dirty.update(|m| {
            m.insert(filesystem.to_string(), info.clone());
        });
    }

    pub fn record_containers(&self, filesystem: &str, info: ContainerInfo) {
        self.containers.update(|m| {
            m.insert(filesystem.to_string(), info.clone());
        });
    }
}
