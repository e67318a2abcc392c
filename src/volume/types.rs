//! Volume Data Model
//!
//! Snapshots, clone origins, volume names and the closed set of states
//! a volume actor can be in.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque snapshot metadata
pub type Metadata = BTreeMap<String, String>;

/// A point-in-time marker within one lineage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Snapshot {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A clone's pointer to the snapshot it was created from.
///
/// `filesystem_id` is always the direct parent, even when the clone is
/// attributed to a transitive ancestor elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Origin {
    pub filesystem_id: String,
    pub snapshot_id: String,
}

impl Origin {
    /// Parse a `<filesystem>@<snapshot>` reference
    pub fn parse(reference: &str) -> Option<Self> {
        let (fs, snap) = reference.split_once('@')?;
        if fs.is_empty() || snap.is_empty() {
            return None;
        }
        Some(Self {
            filesystem_id: fs.to_string(),
            snapshot_id: snap.to_string(),
        })
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.filesystem_id, self.snapshot_id)
    }
}

/// Namespace-qualified volume name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeName {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for VolumeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// State of a volume actor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeState {
    /// Loading local snapshots and resolving mastership
    Discovering,
    /// This node is master and serving the volume
    Active,
    /// Another node is master
    Inactive,
    /// Master, accepting an external push
    Receiving,
    /// Pushing to a peer
    Pushing,
    /// Pulling from a peer
    Pulling,
    /// A handler failed; waiting for `reset`
    Failed,
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeState::Discovering => write!(f, "discovering"),
            VolumeState::Active => write!(f, "active"),
            VolumeState::Inactive => write!(f, "inactive"),
            VolumeState::Receiving => write!(f, "receiving"),
            VolumeState::Pushing => write!(f, "pushing"),
            VolumeState::Pulling => write!(f, "pulling"),
            VolumeState::Failed => write!(f, "failed"),
        }
    }
}

/// A recorded state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub state: VolumeState,
    pub status: String,
    pub at: chrono::DateTime<chrono::Utc>,
    /// Set while `receiving`; identifies the push the volume is waiting for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receive_id: Option<Uuid>,
}

impl Transition {
    pub fn now(state: VolumeState, status: impl Into<String>) -> Self {
        Self {
            state,
            status: status.into(),
            at: chrono::Utc::now(),
            receive_id: None,
        }
    }

    pub fn with_receive_id(mut self, receive_id: Option<Uuid>) -> Self {
        self.receive_id = receive_id;
        self
    }
}
