//! Coordination Store
//!
//! The cluster-wide record of mastership, addresses, snapshots, states,
//! dirty metrics and containers. Nodes write their own facts through and
//! periodically load everything back into their cache.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::cluster::cache::{ContainerInfo, DirtyInfo, StateEntry};
use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::volume::Snapshot;

/// Everything the store knows, as loaded in one pass
#[derive(Debug, Clone, Default)]
pub struct ClusterFacts {
    pub masters: HashMap<String, String>,
    pub addresses: HashMap<String, Vec<String>>,
    pub snapshots: HashMap<String, HashMap<String, Vec<Snapshot>>>,
    pub states: HashMap<String, HashMap<String, StateEntry>>,
    pub dirty: HashMap<String, DirtyInfo>,
    pub containers: HashMap<String, ContainerInfo>,
}

/// Coordination store client
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Load every fact
    async fn load(&self) -> Result<ClusterFacts>;

    /// Set the master of a volume
    async fn put_master(&self, filesystem: &str, node: &str) -> Result<()>;

    /// Set the master of a volume only if it has none.
    /// Returns the master in effect afterwards.
    async fn claim_master(&self, filesystem: &str, node: &str) -> Result<String>;

    /// Record a node's state for a volume
    async fn put_state(&self, filesystem: &str, node: &str, entry: StateEntry) -> Result<()>;

    /// Record the snapshots a node holds for a volume
    async fn put_snapshots(&self, node: &str, filesystem: &str, snapshots: Vec<Snapshot>) -> Result<()>;

    /// Record dirty metrics for a volume
    async fn put_dirty(&self, filesystem: &str, info: DirtyInfo) -> Result<()>;

    /// Record the containers using a volume
    async fn put_containers(&self, filesystem: &str, info: ContainerInfo) -> Result<()>;
}

/// In-process store, seeded from configuration
#[derive(Default)]
pub struct MemoryStore {
    facts: RwLock<ClusterFacts>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed nodes and volume masters from the cluster configuration
    pub fn from_config(config: &ClusterConfig) -> Result<Self> {
        let mut facts = ClusterFacts::default();
        for node in &config.nodes {
            if facts.addresses.insert(node.id.clone(), node.addresses.clone()).is_some() {
                return Err(Error::Config(format!("cluster node {} listed twice", node.id)));
            }
        }
        for volume in &config.volumes {
            facts.masters.insert(volume.id.clone(), volume.master.clone());
        }
        Ok(Self {
            facts: RwLock::new(facts),
        })
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn load(&self) -> Result<ClusterFacts> {
        Ok(self.facts.read().await.clone())
    }

    async fn put_master(&self, filesystem: &str, node: &str) -> Result<()> {
        self.facts
            .write()
            .await
            .masters
            .insert(filesystem.to_string(), node.to_string());
        Ok(())
    }

    async fn claim_master(&self, filesystem: &str, node: &str) -> Result<String> {
        let mut facts = self.facts.write().await;
        let master = facts
            .masters
            .entry(filesystem.to_string())
            .or_insert_with(|| node.to_string());
        Ok(master.clone())
    }

    async fn put_state(&self, filesystem: &str, node: &str, entry: StateEntry) -> Result<()> {
        self.facts
            .write()
            .await
            .states
            .entry(filesystem.to_string())
            .or_default()
            .insert(node.to_string(), entry);
        Ok(())
    }

    async fn put_snapshots(&self, node: &str, filesystem: &str, snapshots: Vec<Snapshot>) -> Result<()> {
        self.facts
            .write()
            .await
            .snapshots
            .entry(node.to_string())
            .or_default()
            .insert(filesystem.to_string(), snapshots);
        Ok(())
    }

    async fn put_dirty(&self, filesystem: &str, info: DirtyInfo) -> Result<()> {
        self.facts.write().await.dirty.insert(filesystem.to_string(), info);
        Ok(())
    }

    async fn put_containers(&self, filesystem: &str, info: ContainerInfo) -> Result<()> {
        self.facts
            .write()
            .await
            .containers
            .insert(filesystem.to_string(), info);
        Ok(())
    }
}
