//! Node Context
//!
//! Everything a node shares between its HTTP handlers, volume actors and
//! background tasks, built once at startup.

use std::sync::Arc;

use crate::cluster::selector::{self, AddressSelector};
use crate::cluster::{ClusterCache, ContainerInventory, CoordinationStore, MemoryStore, NoContainers};
use crate::config::DotmeshConfig;
use crate::error::{Error, Result};
use crate::notify::Bus;
use crate::secrets::{FileSecretStore, SecretStore};
use crate::transfer::{ProcessRunner, ReceiveLocks, SnapshotEngine, SystemRunner};
use crate::transfer::TransferTable;
use crate::volume::{actor, JsonMetadataStore, MetadataStore, Snapshot, VolumeHandle, VolumeRegistry};

/// External collaborators a node is wired to
pub struct Collaborators {
    pub store: Arc<dyn CoordinationStore>,
    pub runner: Arc<dyn ProcessRunner>,
    pub metadata: Arc<dyn MetadataStore>,
    pub secrets: Arc<dyn SecretStore>,
    pub containers: Arc<dyn ContainerInventory>,
    pub selector: Box<dyn AddressSelector>,
}

impl Collaborators {
    /// Production wiring for a configuration
    pub fn from_config(config: &DotmeshConfig) -> Result<Self> {
        let store = MemoryStore::from_config(&config.cluster)?;
        let metadata = JsonMetadataStore::open(config.metadata_dir())?;

        Ok(Self {
            store: Arc::new(store),
            runner: Arc::new(SystemRunner),
            metadata: Arc::new(metadata),
            secrets: Arc::new(FileSecretStore::new(&config.secrets.file)),
            containers: Arc::new(NoContainers),
            selector: selector::from_config(config.cluster.address_selection),
        })
    }
}

/// Shared node state
pub struct NodeContext {
    pub node_id: String,
    pub config: DotmeshConfig,
    pub cache: ClusterCache,
    pub bus: Bus,
    pub engine: SnapshotEngine,
    pub store: Arc<dyn CoordinationStore>,
    pub runner: Arc<dyn ProcessRunner>,
    pub metadata: Arc<dyn MetadataStore>,
    pub secrets: Arc<dyn SecretStore>,
    pub containers: Arc<dyn ContainerInventory>,
    pub selector: Box<dyn AddressSelector>,
    pub transfers: TransferTable,
    pub receives: ReceiveLocks,
    pub http: reqwest::Client,
    pub volumes: VolumeRegistry,
}

impl NodeContext {
    pub fn new(config: DotmeshConfig, collaborators: Collaborators) -> Result<Arc<Self>> {
        config.validate()?;

        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        let node_id = config.node.id.clone();
        let cache = ClusterCache::new(node_id.clone());
        for seed in &config.cluster.nodes {
            cache.record_addresses(&seed.id, seed.addresses.clone());
        }
        for seed in &config.cluster.volumes {
            cache.record_master(&seed.id, &seed.master);
        }

        Ok(Arc::new(Self {
            node_id,
            cache,
            bus: Bus::new(),
            engine: SnapshotEngine::new(&config.engine),
            store: collaborators.store,
            runner: collaborators.runner,
            metadata: collaborators.metadata,
            secrets: collaborators.secrets,
            containers: collaborators.containers,
            selector: collaborators.selector,
            transfers: TransferTable::new(config.transfer.retained_results),
            receives: ReceiveLocks::new(),
            http,
            volumes: VolumeRegistry::new(),
            config,
        }))
    }

    /// Handle to the actor of a volume, starting it on first use
    pub fn volume(self: &Arc<Self>, filesystem: &str) -> VolumeHandle {
        self.volumes
            .get_or_spawn(filesystem, || actor::spawn(Arc::clone(self), filesystem))
    }

    /// Reload a volume's local snapshots and publish them to the store,
    /// the cache and snapshot subscribers
    pub async fn record_snapshots(&self, filesystem: &str) -> Result<Vec<Snapshot>> {
        let snapshots = self.metadata.snapshots(filesystem).await?;
        self.publish_snapshots(filesystem, snapshots.clone()).await;
        Ok(snapshots)
    }

    /// Publish a known snapshot list for a volume on this node
    pub async fn publish_snapshots(&self, filesystem: &str, snapshots: Vec<Snapshot>) {
        if let Err(e) = self
            .store
            .put_snapshots(&self.node_id, filesystem, snapshots.clone())
            .await
        {
            tracing::warn!("Failed to store snapshots of {}: {}", filesystem, e);
        }
        self.cache
            .record_snapshots(&self.node_id, filesystem, snapshots.clone());
        self.bus.new_snapshots.publish(filesystem, snapshots);
    }

    /// Stop every volume actor
    pub fn shutdown(&self) {
        self.volumes.clear();
    }
}
