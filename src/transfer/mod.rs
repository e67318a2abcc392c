//! Transfer Module
//!
//! Moving snapshot streams between nodes: serving sends and receives,
//! proxying to masters, driving pushes and pulls, and the progress
//! records pollers read.

pub mod client;
pub mod coordinator;
pub mod engine;
pub mod proxy;

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use coordinator::ReceiveLocks;
pub use engine::{EngineCommand, ProcessRunner, SnapshotEngine, SystemRunner, START};

use crate::volume::VolumeName;

/// Direction of a transfer, seen from the requesting node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Push,
    Pull,
}

/// A caller's request to push to or pull from a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub peer: String,
    pub user: String,
    pub api_key: String,
    pub direction: Direction,
    pub local_namespace: String,
    pub local_name: String,
    #[serde(default)]
    pub local_branch: String,
    pub remote_namespace: String,
    pub remote_name: String,
    #[serde(default)]
    pub remote_branch: String,
    #[serde(default)]
    pub target_commit: Option<String>,
}

impl TransferRequest {
    pub fn local_volume(&self) -> VolumeName {
        VolumeName {
            namespace: self.local_namespace.clone(),
            name: self.local_name.clone(),
        }
    }

    pub fn remote_volume(&self) -> VolumeName {
        VolumeName {
            namespace: self.remote_namespace.clone(),
            name: self.remote_name.clone(),
        }
    }
}

/// Lifecycle of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Starting,
    Running,
    Finished,
    Error,
}

/// Progress record for one transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferPollResult {
    pub transfer_request_id: Uuid,
    pub filesystem_id: String,
    pub initiator_node_id: String,
    pub peer_node_id: String,
    pub peer: String,
    pub user: String,
    pub direction: Direction,
    pub local_namespace: String,
    pub local_name: String,
    pub local_branch: String,
    pub remote_namespace: String,
    pub remote_name: String,
    pub remote_branch: String,
    pub starting_commit: String,
    pub target_commit: String,
    pub status: TransferStatus,
    pub index: u32,
    pub total: u32,
    pub size: u64,
    pub sent: u64,
    pub nanoseconds_elapsed: u64,
    pub message: String,
    pub started_at: DateTime<Utc>,
}

impl TransferPollResult {
    fn new(id: Uuid, filesystem: &str, initiator: &str, request: &TransferRequest) -> Self {
        Self {
            transfer_request_id: id,
            filesystem_id: filesystem.to_string(),
            initiator_node_id: initiator.to_string(),
            peer_node_id: String::new(),
            peer: request.peer.clone(),
            user: request.user.clone(),
            direction: request.direction,
            local_namespace: request.local_namespace.clone(),
            local_name: request.local_name.clone(),
            local_branch: request.local_branch.clone(),
            remote_namespace: request.remote_namespace.clone(),
            remote_name: request.remote_name.clone(),
            remote_branch: request.remote_branch.clone(),
            starting_commit: String::new(),
            target_commit: request.target_commit.clone().unwrap_or_default(),
            status: TransferStatus::Starting,
            index: 0,
            total: 0,
            size: 0,
            sent: 0,
            nanoseconds_elapsed: 0,
            message: String::new(),
            started_at: Utc::now(),
        }
    }

    fn touch(&mut self) {
        let elapsed = Utc::now() - self.started_at;
        self.nanoseconds_elapsed = elapsed.num_nanoseconds().unwrap_or(i64::MAX).max(0) as u64;
    }
}

/// Poll results of the transfers this node drove. Results of completed
/// transfers are dropped oldest first once more than `retained` are held.
pub struct TransferTable {
    inner: Mutex<Results>,
    retained: usize,
}

#[derive(Default)]
struct Results {
    by_id: HashMap<Uuid, TransferPollResult>,
    completed: VecDeque<Uuid>,
}

impl TransferTable {
    pub fn new(retained: usize) -> Self {
        Self {
            inner: Mutex::new(Results::default()),
            retained,
        }
    }

    /// Register a transfer in `starting`
    pub fn start(&self, id: Uuid, filesystem: &str, initiator: &str, request: &TransferRequest) -> TransferPollResult {
        let result = TransferPollResult::new(id, filesystem, initiator, request);
        self.lock().by_id.insert(id, result.clone());
        result
    }

    pub fn get(&self, id: &Uuid) -> Option<TransferPollResult> {
        self.lock().by_id.get(id).cloned()
    }

    /// Record the node answering on the other end
    pub fn identify_peer(&self, id: &Uuid, peer_node_id: &str) {
        self.update(id, |r| r.peer_node_id = peer_node_id.to_string());
    }

    /// Mark a transfer running `from..to` in `total` segments
    pub fn running(&self, id: &Uuid, total: u32, from: &str, to: &str, message: impl Into<String>) {
        self.update(id, |r| {
            r.status = TransferStatus::Running;
            r.total = total;
            r.starting_commit = from.to_string();
            r.target_commit = to.to_string();
            r.message = message.into();
        });
    }

    /// Record bytes moved so far
    pub fn progress(&self, id: &Uuid, sent: u64) {
        self.update(id, |r| {
            r.sent = sent;
            r.size = r.size.max(sent);
        });
    }

    /// Finalise a transfer as finished or failed
    pub fn finish(&self, id: &Uuid, outcome: &crate::Result<String>) {
        self.update(id, |r| match outcome {
            Ok(message) => {
                r.status = TransferStatus::Finished;
                r.index = r.total;
                r.message = message.clone();
            }
            Err(e) => {
                r.status = TransferStatus::Error;
                r.message = e.to_string();
            }
        });

        let mut results = self.lock();
        if !results.by_id.contains_key(id) {
            return;
        }
        results.completed.push_back(*id);
        while results.completed.len() > self.retained {
            if let Some(oldest) = results.completed.pop_front() {
                results.by_id.remove(&oldest);
            }
        }
    }

    fn update<F: FnOnce(&mut TransferPollResult)>(&self, id: &Uuid, f: F) {
        if let Some(result) = self.lock().by_id.get_mut(id) {
            f(result);
            result.touch();
        }
    }

    fn lock(&self) -> MutexGuard<'_, Results> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
