//! Secret Store
//!
//! API keys for the identities this node uses when talking to peers on
//! behalf of callers.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Lookup of API keys by user name
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn api_key(&self, user: &str) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct UserSecret {
    api_key: String,
}

/// JSON file of the form `{"admin": {"api_key": "..."}}`, re-read on
/// every lookup
#[derive(Debug, Clone)]
pub struct FileSecretStore {
    path: PathBuf,
}

impl FileSecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn api_key(&self, user: &str) -> Result<String> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            Error::Credentials(format!("unable to read {}: {}", self.path.display(), e))
        })?;
        let secrets: HashMap<String, UserSecret> = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Credentials(format!("unable to parse {}: {}", self.path.display(), e)))?;

        secrets
            .get(user)
            .map(|s| s.api_key.clone())
            .ok_or_else(|| Error::Credentials(format!("no API key for user {}", user)))
    }
}

/// Keys held in memory
#[derive(Debug, Clone, Default)]
pub struct StaticSecretStore {
    keys: HashMap<String, String>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, user: impl Into<String>, api_key: impl Into<String>) -> Self {
        self.keys.insert(user.into(), api_key.into());
        self
    }
}

#[async_trait]
impl SecretStore for StaticSecretStore {
    async fn api_key(&self, user: &str) -> Result<String> {
        self.keys
            .get(user)
            .cloned()
            .ok_or_else(|| Error::Credentials(format!("no API key for user {}", user)))
    }
}
