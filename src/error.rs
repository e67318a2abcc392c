//! Dotmesh Error Types

use thiserror::Error;

/// Result type alias for dotmesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// Dotmesh error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Protocol errors
    #[error("Malformed prelude: {0}")]
    MalformedPrelude(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // State mismatch errors
    #[error("Not master for filesystem {filesystem} (master is {master:?})")]
    NotMaster {
        filesystem: String,
        master: Option<String>,
    },

    #[error("Filesystem {filesystem} is in state {state}, need {required}")]
    WrongState {
        filesystem: String,
        state: String,
        required: String,
    },

    #[error("Unknown filesystem: {0}")]
    UnknownVolume(String),

    #[error("A receive is already in progress for filesystem {0}")]
    ReceiveInProgress(String),

    #[error("Snapshot {snapshot} not found in filesystem {filesystem}")]
    SnapshotNotFound { filesystem: String, snapshot: String },

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("No addresses known for node {0}")]
    NoAddresses(String),

    #[error("Peer answered {status}: {body}")]
    PeerRejected { status: u16, body: String },

    #[error("Credentials unavailable: {0}")]
    Credentials(String),

    // Engine (native snapshot subprocess) errors
    #[error("{command} exited with {code:?}, stderr: {stderr}")]
    SubprocessFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Failed to start {command}: {reason}")]
    Spawn { command: String, reason: String },

    // Local errors
    #[error("Local failure: {0}")]
    LocalFailure(String),

    #[error("Unable to apply prelude: {0}")]
    PreludeApply(String),

    #[error("Relay {endpoint} failed: {reason}")]
    Relay { endpoint: String, reason: String },

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Volume actor for {0} has stopped")]
    ActorStopped(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if a caller may retry after re-resolving mastership
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::NotMaster { .. }
            | Error::WrongState { .. }
            | Error::ReceiveInProgress(_)
            | Error::Network(_)
            | Error::ConnectionFailed { .. } => true,
            Error::PeerRejected { status, .. } => *status == 404,
            _ => false,
        }
    }

    /// Check if the error means the cached view of the cluster was stale
    pub fn is_state_mismatch(&self) -> bool {
        matches!(
            self,
            Error::NotMaster { .. }
                | Error::WrongState { .. }
                | Error::UnknownVolume(_)
                | Error::ReceiveInProgress(_)
        )
    }
}
