//! Cache Refresher
//!
//! Periodically reloads the cluster cache from the coordination store,
//! reports containers for volumes mastered here, and makes sure every
//! known volume has an actor.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::cluster::cache::{ContainerInfo, StateEntry};
use crate::context::NodeContext;
use crate::error::Result;

pub struct CacheRefresher {
    ctx: Arc<NodeContext>,
    interval: Duration,
}

impl CacheRefresher {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        let interval = ctx.config.refresh_interval();
        Self { ctx, interval }
    }

    /// One reload pass
    pub async fn refresh_once(&self) -> Result<()> {
        let facts = self.ctx.store.load().await?;
        self.ctx.cache.replace(facts);

        // Local actors are authoritative for this node's states, unless
        // they moved on since the store was read
        for handle in self.ctx.volumes.handles() {
            self.ctx
                .cache
                .record_state_if_newer(handle.filesystem(), StateEntry::from(&handle.current()));
        }

        for filesystem in self.ctx.cache.mastered_volumes() {
            match self.ctx.containers.containers_using(&filesystem).await {
                Ok(containers) => {
                    let info = ContainerInfo {
                        server: self.ctx.node_id.clone(),
                        containers,
                    };
                    if self.ctx.cache.containers_for(&filesystem).as_ref() != Some(&info) {
                        self.ctx.store.put_containers(&filesystem, info.clone()).await?;
                        self.ctx.cache.record_containers(&filesystem, info);
                    }
                }
                Err(e) => tracing::warn!("Failed to list containers using {}: {}", filesystem, e),
            }
        }

        for filesystem in self.ctx.cache.known_volumes() {
            self.ctx.volume(&filesystem);
        }

        Ok(())
    }

    /// Refresh every interval until cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("Cache refresher stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh_once().await {
                        tracing::warn!("Cluster cache refresh failed: {}", e);
                    }
                }
            }
        }
    }
}
