//! Container Inventory
//!
//! Which containers on this node are using a volume. The container
//! runtime itself lives outside this crate.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::cluster::cache::Container;
use crate::error::Result;

/// Source of volume-to-container associations
#[async_trait]
pub trait ContainerInventory: Send + Sync {
    async fn containers_using(&self, filesystem: &str) -> Result<Vec<Container>>;
}

/// Node without a container runtime
#[derive(Debug, Default)]
pub struct NoContainers;

#[async_trait]
impl ContainerInventory for NoContainers {
    async fn containers_using(&self, _filesystem: &str) -> Result<Vec<Container>> {
        Ok(Vec::new())
    }
}

/// Fixed associations
#[derive(Debug, Default)]
pub struct StaticInventory {
    by_volume: HashMap<String, Vec<Container>>,
}

impl StaticInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, filesystem: impl Into<String>, container: Container) -> Self {
        self.by_volume.entry(filesystem.into()).or_default().push(container);
        self
    }
}

#[async_trait]
impl ContainerInventory for StaticInventory {
    async fn containers_using(&self, filesystem: &str) -> Result<Vec<Container>> {
        Ok(self.by_volume.get(filesystem).cloned().unwrap_or_default())
    }
}
