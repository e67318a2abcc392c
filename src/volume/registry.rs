//! Volume Actor Registry
//!
//! Guarantees one actor per volume id in this process.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::volume::VolumeHandle;

#[derive(Default)]
pub struct VolumeRegistry {
    actors: Mutex<HashMap<String, VolumeHandle>>,
}

impl VolumeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing handle for `filesystem`, or the one `spawn` starts
    pub fn get_or_spawn<F>(&self, filesystem: &str, spawn: F) -> VolumeHandle
    where
        F: FnOnce() -> VolumeHandle,
    {
        self.lock()
            .entry(filesystem.to_string())
            .or_insert_with(spawn)
            .clone()
    }

    pub fn get(&self, filesystem: &str) -> Option<VolumeHandle> {
        self.lock().get(filesystem).cloned()
    }

    pub fn handles(&self) -> Vec<VolumeHandle> {
        self.lock().values().cloned().collect()
    }

    /// Drop every handle; actors stop once their queues drain
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VolumeHandle>> {
        self.actors.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
