//! Versioned on-disk state store
//!
//! One store per (operator, partition), one immutable version per committed
//! batch. On disk each partition owns a directory of `<version>.delta` files
//! (the ops committed at that version) and occasional `<version>.snapshot`
//! files coalesced by maintenance. Loading version N reads the newest
//! snapshot at or below N and replays the deltas after it.
//!
//! A [`StateStore`] handle buffers mutations in memory; nothing is visible
//! outside the handle until [`StateStore::commit_updates`] writes the delta
//! file and publishes the new version. Committing consumes the handle, so a
//! committed (or aborted) store cannot be mutated again by construction.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tidemill_core::StreamConfig;
use tracing::{debug, info};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// On-disk formats
// ---------------------------------------------------------------------------

/// One buffered mutation, as persisted in a delta file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum StateOp {
    Put { key: Bytes, value: Bytes },
    Remove { key: Bytes },
}

fn delta_path(dir: &PathBuf, version: u64) -> PathBuf {
    dir.join(format!("{version}.delta"))
}

fn snapshot_path(dir: &PathBuf, version: u64) -> PathBuf {
    dir.join(format!("{version}.snapshot"))
}

/// Write a file atomically: tmp file first, then rename into place.
async fn write_atomic(path: &PathBuf, data: &[u8]) -> Result<()> {
    let mut tmp = path.clone().into_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// StateStoreManager
// ---------------------------------------------------------------------------

type VersionKey = (u64, u32, u64); // (operator, partition, version)
type VersionedMap = Arc<HashMap<Bytes, Bytes>>;

struct ManagerInner {
    root: PathBuf,
    snapshot_every_deltas: u32,
    /// Committed versions already materialized in memory.
    cache: Mutex<HashMap<VersionKey, VersionedMap>>,
}

impl ManagerInner {
    fn partition_dir(&self, operator_id: u64, partition_id: u32) -> PathBuf {
        self.root
            .join(operator_id.to_string())
            .join(partition_id.to_string())
    }

    fn cache_get(&self, key: &VersionKey) -> Option<VersionedMap> {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn cache_put(&self, key: VersionKey, map: VersionedMap) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, map);
    }

    /// Versions present on disk: (snapshot versions, delta versions).
    async fn scan_versions(
        &self,
        operator_id: u64,
        partition_id: u32,
    ) -> Result<(Vec<u64>, Vec<u64>)> {
        let dir = self.partition_dir(operator_id, partition_id);
        let mut snapshots = Vec::new();
        let mut deltas = Vec::new();

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok((snapshots, deltas))
            }
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(v) = name.strip_suffix(".snapshot").and_then(|s| s.parse().ok()) {
                snapshots.push(v);
            } else if let Some(v) = name.strip_suffix(".delta").and_then(|s| s.parse().ok()) {
                deltas.push(v);
            }
        }
        snapshots.sort_unstable();
        deltas.sort_unstable();
        Ok((snapshots, deltas))
    }

    /// Materialize the committed state as of `version`.
    async fn load_version(
        &self,
        operator_id: u64,
        partition_id: u32,
        version: u64,
    ) -> Result<VersionedMap> {
        if version == 0 {
            return Ok(Arc::new(HashMap::new()));
        }
        if let Some(map) = self.cache_get(&(operator_id, partition_id, version)) {
            return Ok(map);
        }

        let dir = self.partition_dir(operator_id, partition_id);
        let (snapshots, _) = self.scan_versions(operator_id, partition_id).await?;
        let snapshot_version = snapshots.iter().copied().filter(|v| *v <= version).max();

        let mut map: HashMap<Bytes, Bytes> = match snapshot_version {
            Some(v) => {
                let data = tokio::fs::read(snapshot_path(&dir, v)).await?;
                let pairs: Vec<(Bytes, Bytes)> = bincode::deserialize(&data)?;
                pairs.into_iter().collect()
            }
            None => HashMap::new(),
        };

        for v in snapshot_version.unwrap_or(0) + 1..=version {
            let path = delta_path(&dir, v);
            let data = match tokio::fs::read(&path).await {
                Ok(data) => data,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(Error::MissingDelta { version: v, path });
                }
                Err(e) => return Err(e.into()),
            };
            let ops: Vec<StateOp> = bincode::deserialize(&data)?;
            for op in ops {
                match op {
                    StateOp::Put { key, value } => {
                        map.insert(key, value);
                    }
                    StateOp::Remove { key } => {
                        map.remove(&key);
                    }
                }
            }
        }

        let map = Arc::new(map);
        self.cache_put((operator_id, partition_id, version), map.clone());
        debug!(
            operator = operator_id,
            partition = partition_id,
            version,
            entries = map.len(),
            "state version loaded"
        );
        Ok(map)
    }
}

/// Opens, caches, and maintains [`StateStore`] versions under one root
/// directory (`<root>/<operator>/<partition>/`).
#[derive(Clone)]
pub struct StateStoreManager {
    inner: Arc<ManagerInner>,
}

impl StateStoreManager {
    pub fn new(root: impl Into<PathBuf>, snapshot_every_deltas: u32) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                root: root.into(),
                snapshot_every_deltas: snapshot_every_deltas.max(1),
                cache: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Manager rooted at `<checkpointDir>/state`, the layout the engine
    /// uses. `None` when the config has no checkpoint directory.
    pub fn from_config(config: &StreamConfig) -> Option<Self> {
        config
            .checkpoint_dir
            .as_ref()
            .map(|dir| Self::new(dir.join("state"), config.snapshot_every_deltas))
    }

    /// Open a store over the committed state of `version`. Version 0 is the
    /// empty state; any other version must have been committed before.
    pub async fn get_store(
        &self,
        operator_id: u64,
        partition_id: u32,
        version: u64,
    ) -> Result<StateStore> {
        let base = self
            .inner
            .load_version(operator_id, partition_id, version)
            .await?;
        Ok(StateStore {
            operator_id,
            partition_id,
            version,
            base,
            updates: HashMap::new(),
            inner: Arc::clone(&self.inner),
        })
    }

    /// Coalesce a snapshot for the latest committed version when enough
    /// deltas have accumulated since the newest snapshot. Callers schedule
    /// this off the hot path.
    pub async fn do_maintenance(&self, operator_id: u64, partition_id: u32) -> Result<()> {
        let (snapshots, deltas) = self.inner.scan_versions(operator_id, partition_id).await?;
        let latest = match snapshots.iter().chain(&deltas).copied().max() {
            Some(v) => v,
            None => return Ok(()),
        };
        let newest_snapshot = snapshots.last().copied().unwrap_or(0);
        if latest <= newest_snapshot
            || latest - newest_snapshot < self.inner.snapshot_every_deltas as u64
        {
            return Ok(());
        }

        let map = self
            .inner
            .load_version(operator_id, partition_id, latest)
            .await?;
        let mut pairs: Vec<(Bytes, Bytes)> =
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        let data = bincode::serialize(&pairs)?;

        let dir = self.inner.partition_dir(operator_id, partition_id);
        write_atomic(&snapshot_path(&dir, latest), &data).await?;
        info!(
            operator = operator_id,
            partition = partition_id,
            version = latest,
            entries = pairs.len(),
            "state snapshot coalesced"
        );
        Ok(())
    }

    /// Evict every cached version. Persistent files are left intact.
    pub fn clear_all(&self) {
        self.inner
            .cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// A handle over one version of one partition's state.
///
/// Reads see the committed state of `version` overlaid with this handle's
/// own buffered mutations. `commit_updates` turns the buffer into
/// `version + 1`; `abort_updates` discards it.
pub struct StateStore {
    operator_id: u64,
    partition_id: u32,
    version: u64,
    base: VersionedMap,
    /// Buffered mutations; `None` marks a removal.
    updates: HashMap<Bytes, Option<Bytes>>,
    inner: Arc<ManagerInner>,
}

impl StateStore {
    pub fn operator_id(&self) -> u64 {
        self.operator_id
    }

    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    /// The committed version this handle reads from.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        if let Some(update) = self.updates.get(key) {
            return update.clone();
        }
        self.base.get(key).cloned()
    }

    pub fn put(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.updates.insert(key.into(), Some(value.into()));
    }

    pub fn remove(&mut self, key: &[u8]) {
        self.updates.insert(Bytes::copy_from_slice(key), None);
    }

    /// Full range scan of the visible state, sorted by key.
    pub fn iter(&self) -> Vec<(Bytes, Bytes)> {
        let mut merged: HashMap<Bytes, Bytes> = (*self.base).clone();
        for (k, update) in &self.updates {
            match update {
                Some(v) => {
                    merged.insert(k.clone(), v.clone());
                }
                None => {
                    merged.remove(k);
                }
            }
        }
        let mut pairs: Vec<(Bytes, Bytes)> = merged.into_iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        pairs
    }

    /// Persist the buffered mutations as `version + 1` and return it.
    ///
    /// Writes the delta file before the new version becomes observable
    /// through the manager. Consumes the handle.
    pub async fn commit_updates(self) -> Result<u64> {
        let new_version = self.version + 1;
        let dir = self.inner.partition_dir(self.operator_id, self.partition_id);
        tokio::fs::create_dir_all(&dir).await?;

        let mut ops: Vec<StateOp> = self
            .updates
            .iter()
            .map(|(k, update)| match update {
                Some(v) => StateOp::Put {
                    key: k.clone(),
                    value: v.clone(),
                },
                None => StateOp::Remove { key: k.clone() },
            })
            .collect();
        ops.sort_by(|a, b| {
            let key = |op: &StateOp| match op {
                StateOp::Put { key, .. } | StateOp::Remove { key } => key.clone(),
            };
            key(a).cmp(&key(b))
        });
        let data = bincode::serialize(&ops)?;
        write_atomic(&delta_path(&dir, new_version), &data).await?;

        // Publish the committed map so the next open is cache-hot.
        let mut map = (*self.base).clone();
        for (k, update) in self.updates {
            match update {
                Some(v) => {
                    map.insert(k, v);
                }
                None => {
                    map.remove(&k);
                }
            }
        }
        self.inner
            .cache_put((self.operator_id, self.partition_id, new_version), Arc::new(map));

        debug!(
            operator = self.operator_id,
            partition = self.partition_id,
            version = new_version,
            ops = ops.len(),
            "state store committed"
        );
        Ok(new_version)
    }

    /// Discard the buffered mutations; the on-disk store is untouched.
    /// Consumes the handle.
    pub fn abort_updates(self) {
        debug!(
            operator = self.operator_id,
            partition = self.partition_id,
            version = self.version,
            dropped = self.updates.len(),
            "state store aborted"
        );
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> StateStoreManager {
        StateStoreManager::new(dir.path(), 10)
    }

    #[tokio::test]
    async fn test_version_zero_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = manager(&dir).get_store(1, 0, 0).await.unwrap();
        assert!(store.iter().is_empty());
        assert_eq!(store.get(b"anything"), None);
    }

    #[tokio::test]
    async fn test_commit_then_reopen_observes_state() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);

        let mut store = mgr.get_store(1, 0, 0).await.unwrap();
        store.put(&b"a"[..], &b"1"[..]);
        let new_version = store.commit_updates().await.unwrap();
        assert_eq!(new_version, 1);

        let reopened = mgr.get_store(1, 0, 1).await.unwrap();
        assert_eq!(reopened.get(b"a"), Some(Bytes::from("1")));
    }

    #[tokio::test]
    async fn test_abort_leaves_disk_untouched() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);

        let mut store = mgr.get_store(1, 0, 0).await.unwrap();
        store.put(&b"a"[..], &b"1"[..]);
        store.commit_updates().await.unwrap();

        let mut store = mgr.get_store(1, 0, 1).await.unwrap();
        store.put(&b"a"[..], &b"2"[..]);
        store.abort_updates();

        let reopened = mgr.get_store(1, 0, 1).await.unwrap();
        assert_eq!(reopened.get(b"a"), Some(Bytes::from("1")));
    }

    #[tokio::test]
    async fn test_buffered_updates_visible_only_through_handle() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);

        let mut store = mgr.get_store(1, 0, 0).await.unwrap();
        store.put(&b"k"[..], &b"v"[..]);
        assert_eq!(store.get(b"k"), Some(Bytes::from("v")));

        // A second handle over the same version sees nothing.
        let other = mgr.get_store(1, 0, 0).await.unwrap();
        assert_eq!(other.get(b"k"), None);
    }

    #[tokio::test]
    async fn test_remove_is_persisted() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);

        let mut store = mgr.get_store(1, 0, 0).await.unwrap();
        store.put(&b"a"[..], &b"1"[..]);
        store.put(&b"b"[..], &b"2"[..]);
        store.commit_updates().await.unwrap();

        let mut store = mgr.get_store(1, 0, 1).await.unwrap();
        store.remove(b"a");
        store.commit_updates().await.unwrap();

        let reopened = mgr.get_store(1, 0, 2).await.unwrap();
        assert_eq!(reopened.get(b"a"), None);
        assert_eq!(reopened.get(b"b"), Some(Bytes::from("2")));
    }

    #[tokio::test]
    async fn test_recovery_replays_deltas_from_disk() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);

        for i in 0u64..5 {
            let mut store = mgr.get_store(1, 0, i).await.unwrap();
            store.put(format!("key-{i}").into_bytes(), format!("val-{i}").into_bytes());
            store.commit_updates().await.unwrap();
        }

        // Drop every cached version, as a fresh process would have.
        mgr.clear_all();

        let store = mgr.get_store(1, 0, 5).await.unwrap();
        assert_eq!(store.iter().len(), 5);
        assert_eq!(store.get(b"key-3"), Some(Bytes::from("val-3")));
    }

    #[tokio::test]
    async fn test_load_intermediate_version() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);

        for i in 0u64..4 {
            let mut store = mgr.get_store(1, 0, i).await.unwrap();
            store.put(&b"counter"[..], i.to_string().into_bytes());
            store.commit_updates().await.unwrap();
        }
        mgr.clear_all();

        let store = mgr.get_store(1, 0, 2).await.unwrap();
        assert_eq!(store.get(b"counter"), Some(Bytes::from("1")));
    }

    #[tokio::test]
    async fn test_missing_delta_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);

        let result = mgr.get_store(1, 0, 3).await;
        assert!(matches!(
            result,
            Err(Error::MissingDelta { version: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_maintenance_coalesces_snapshot_and_recovery_uses_it() {
        let dir = TempDir::new().unwrap();
        let mgr = StateStoreManager::new(dir.path(), 3);

        for i in 0u64..5 {
            let mut store = mgr.get_store(7, 2, i).await.unwrap();
            store.put(format!("k{i}").into_bytes(), format!("v{i}").into_bytes());
            store.commit_updates().await.unwrap();
        }

        mgr.do_maintenance(7, 2).await.unwrap();
        let snapshot = dir.path().join("7").join("2").join("5.snapshot");
        assert!(snapshot.exists(), "maintenance should write 5.snapshot");

        // Deltas before the snapshot can now be deleted; recovery at the
        // snapshot version must still work.
        for v in 1u64..=5 {
            std::fs::remove_file(dir.path().join("7").join("2").join(format!("{v}.delta")))
                .unwrap();
        }
        mgr.clear_all();

        let store = mgr.get_store(7, 2, 5).await.unwrap();
        assert_eq!(store.iter().len(), 5);
    }

    #[tokio::test]
    async fn test_maintenance_below_threshold_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let mgr = StateStoreManager::new(dir.path(), 10);

        let mut store = mgr.get_store(1, 0, 0).await.unwrap();
        store.put(&b"a"[..], &b"1"[..]);
        store.commit_updates().await.unwrap();

        mgr.do_maintenance(1, 0).await.unwrap();
        assert!(!dir.path().join("1").join("0").join("1.snapshot").exists());
    }

    #[tokio::test]
    async fn test_clear_all_keeps_files() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);

        let mut store = mgr.get_store(1, 0, 0).await.unwrap();
        store.put(&b"a"[..], &b"1"[..]);
        store.commit_updates().await.unwrap();

        mgr.clear_all();
        assert!(dir.path().join("1").join("0").join("1.delta").exists());

        let store = mgr.get_store(1, 0, 1).await.unwrap();
        assert_eq!(store.get(b"a"), Some(Bytes::from("1")));
    }

    #[tokio::test]
    async fn test_iter_is_sorted_by_key() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);

        let mut store = mgr.get_store(1, 0, 0).await.unwrap();
        store.put(&b"c"[..], &b"3"[..]);
        store.put(&b"a"[..], &b"1"[..]);
        store.put(&b"b"[..], &b"2"[..]);

        let keys: Vec<Bytes> = store.iter().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")]);
    }

    #[tokio::test]
    async fn test_from_config_roots_under_checkpoint_dir() {
        let dir = TempDir::new().unwrap();
        let config = StreamConfig {
            checkpoint_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };

        let mgr = StateStoreManager::from_config(&config).unwrap();
        let mut store = mgr.get_store(1, 0, 0).await.unwrap();
        store.put(&b"a"[..], &b"1"[..]);
        store.commit_updates().await.unwrap();

        assert!(dir
            .path()
            .join("state")
            .join("1")
            .join("0")
            .join("1.delta")
            .exists());
        assert!(StateStoreManager::from_config(&StreamConfig::default()).is_none());
    }

    #[tokio::test]
    async fn test_partitions_are_isolated() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);

        let mut p0 = mgr.get_store(1, 0, 0).await.unwrap();
        p0.put(&b"k"[..], &b"p0"[..]);
        p0.commit_updates().await.unwrap();

        let p1 = mgr.get_store(1, 1, 0).await.unwrap();
        assert_eq!(p1.get(b"k"), None);
    }
}
