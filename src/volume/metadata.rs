//! Snapshot Metadata Store
//!
//! Persists the ordered snapshot list and clone origin of each volume on
//! this node. A prelude is applied all or nothing.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};
use crate::replication::Prelude;
use crate::volume::{Origin, Snapshot};

/// Local snapshot metadata persistence
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Snapshots of a volume in lineage order (empty if unknown)
    async fn snapshots(&self, filesystem: &str) -> Result<Vec<Snapshot>>;

    /// Append a newly taken snapshot
    async fn append(&self, filesystem: &str, snapshot: Snapshot) -> Result<()>;

    /// Merge the records of a received prelude, and the clone origin the
    /// stream was based on if any, returning the resulting snapshot list.
    /// Nothing is written if the prelude is rejected.
    async fn apply_prelude(
        &self,
        filesystem: &str,
        prelude: &Prelude,
        origin: Option<&Origin>,
    ) -> Result<Vec<Snapshot>>;

    /// Clone origin of a volume, if it is a clone
    async fn origin(&self, filesystem: &str) -> Result<Option<Origin>>;
}

/// Everything stored for one volume
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct VolumeRecord {
    #[serde(default)]
    snapshots: Vec<Snapshot>,
    #[serde(default)]
    origin: Option<Origin>,
}

/// Merge prelude records into an existing lineage.
///
/// Known ids get their metadata replaced in place, new ids are appended in
/// prelude order.
pub fn merge_prelude(filesystem: &str, existing: &[Snapshot], prelude: &Prelude) -> Result<Vec<Snapshot>> {
    let mut seen = HashSet::new();
    for snapshot in &prelude.snapshots {
        if snapshot.id.is_empty() {
            return Err(Error::PreludeApply(format!("{}: snapshot with empty id", filesystem)));
        }
        if !seen.insert(snapshot.id.as_str()) {
            return Err(Error::PreludeApply(format!(
                "{}: snapshot {} listed twice",
                filesystem, snapshot.id
            )));
        }
    }

    let mut merged = existing.to_vec();
    for snapshot in &prelude.snapshots {
        match merged.iter_mut().find(|s| s.id == snapshot.id) {
            Some(current) => current.metadata = snapshot.metadata.clone(),
            None => merged.push(snapshot.clone()),
        }
    }
    Ok(merged)
}

/// One JSON file per volume under a metadata directory, replaced through
/// a temporary file and rename on every write
pub struct JsonMetadataStore {
    dir: PathBuf,
    records: RwLock<HashMap<String, VolumeRecord>>,
}

impl JsonMetadataStore {
    /// Open a store rooted at `dir`, creating it if needed
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            records: RwLock::new(HashMap::new()),
        })
    }

    /// Directory holding the volume files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, filesystem: &str) -> Result<PathBuf> {
        if filesystem.is_empty()
            || filesystem.starts_with('.')
            || filesystem.contains(['/', '\\'])
        {
            return Err(Error::LocalFailure(format!("invalid filesystem id {:?}", filesystem)));
        }
        Ok(self.dir.join(format!("{}.json", filesystem)))
    }

    async fn load(&self, filesystem: &str) -> Result<VolumeRecord> {
        let cached = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(filesystem)
            .cloned();
        if let Some(record) = cached {
            return Ok(record);
        }

        let path = self.path_for(filesystem)?;
        let record = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => VolumeRecord::default(),
            Err(e) => return Err(e.into()),
        };

        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(filesystem.to_string())
            .or_insert_with(|| record.clone());
        Ok(record)
    }

    async fn store(&self, filesystem: &str, record: VolumeRecord) -> Result<()> {
        let path = self.path_for(filesystem)?;
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(&record)?;

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;

        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(filesystem.to_string(), record);
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for JsonMetadataStore {
    async fn snapshots(&self, filesystem: &str) -> Result<Vec<Snapshot>> {
        Ok(self.load(filesystem).await?.snapshots)
    }

    async fn append(&self, filesystem: &str, snapshot: Snapshot) -> Result<()> {
        let mut record = self.load(filesystem).await?;
        if record.snapshots.iter().any(|s| s.id == snapshot.id) {
            return Err(Error::LocalFailure(format!(
                "snapshot {} already exists in {}",
                snapshot.id, filesystem
            )));
        }
        record.snapshots.push(snapshot);
        self.store(filesystem, record).await
    }

    async fn apply_prelude(
        &self,
        filesystem: &str,
        prelude: &Prelude,
        origin: Option<&Origin>,
    ) -> Result<Vec<Snapshot>> {
        let mut record = self.load(filesystem).await?;
        let merged = merge_prelude(filesystem, &record.snapshots, prelude)?;
        record.snapshots = merged.clone();
        if let Some(origin) = origin {
            record.origin = Some(origin.clone());
        }
        self.store(filesystem, record)
            .await
            .map_err(|e| Error::PreludeApply(format!("{}: {}", filesystem, e)))?;

        tracing::debug!("Applied prelude of {} snapshots to {}", prelude.snapshots.len(), filesystem);
        Ok(merged)
    }

    async fn origin(&self, filesystem: &str) -> Result<Option<Origin>> {
        Ok(self.load(filesystem).await?.origin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = JsonMetadataStore::open(dir.path()).unwrap();
            store.append("v1", Snapshot::new("s1")).await.unwrap();
            store.append("v1", Snapshot::new("s2").with_meta("message", "hi")).await.unwrap();
            assert!(store.append("v1", Snapshot::new("s1")).await.is_err());
        }

        let reopened = JsonMetadataStore::open(dir.path()).unwrap();
        let snapshots = reopened.snapshots("v1").await.unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[1].metadata.get("message").map(String::as_str), Some("hi"));
        assert!(reopened.snapshots("unknown").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_prelude_merges_in_order() {
        let dir = TempDir::new().unwrap();
        let store = JsonMetadataStore::open(dir.path()).unwrap();
        store.append("v1", Snapshot::new("s1")).await.unwrap();

        let prelude = Prelude::new(vec![
            Snapshot::new("s1").with_meta("message", "first"),
            Snapshot::new("s2").with_meta("message", "second"),
        ]);
        let merged = store.apply_prelude("v1", &prelude, None).await.unwrap();
        assert_eq!(merged, prelude.snapshots);
        assert_eq!(store.snapshots("v1").await.unwrap(), prelude.snapshots);
    }

    #[tokio::test]
    async fn test_rejected_prelude_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = JsonMetadataStore::open(dir.path()).unwrap();
        store.append("v1", Snapshot::new("s1")).await.unwrap();

        let prelude = Prelude::new(vec![Snapshot::new("s2"), Snapshot::new("s2")]);
        let err = store.apply_prelude("v1", &prelude, None).await.unwrap_err();
        assert!(matches!(err, Error::PreludeApply(_)));

        let reopened = JsonMetadataStore::open(dir.path()).unwrap();
        assert_eq!(reopened.snapshots("v1").await.unwrap(), vec![Snapshot::new("s1")]);
    }

    #[tokio::test]
    async fn test_origin_and_invalid_ids() {
        let dir = TempDir::new().unwrap();
        let store = JsonMetadataStore::open(dir.path()).unwrap();

        assert_eq!(store.origin("clone").await.unwrap(), None);
        let origin = Origin::parse("parent@s1").unwrap();
        let prelude = Prelude::new(vec![Snapshot::new("c1")]);
        store.apply_prelude("clone", &prelude, Some(&origin)).await.unwrap();
        assert_eq!(store.origin("clone").await.unwrap(), Some(origin.clone()));

        // Later incremental receives keep the recorded origin
        let prelude = Prelude::new(vec![Snapshot::new("c1"), Snapshot::new("c2")]);
        store.apply_prelude("clone", &prelude, None).await.unwrap();
        assert_eq!(store.origin("clone").await.unwrap(), Some(origin));

        assert!(store.snapshots("../escape").await.is_err());
    }
}
