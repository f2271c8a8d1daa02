//! In-process transactional store with optional snapshot durability.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info};

use super::{CommitHook, Store, StoreError, Transaction};

/// An optimistic, versioned key-value store.
///
/// Every committed write bumps a global version and stamps the keys it
/// set. A transaction remembers the version of each key it read (zero for
/// an absent key) and its commit fails with [`StoreError::Conflict`] if any
/// of them moved in the meantime, which serializes concurrent
/// read-modify-write cycles. Deleting a key removes it outright.
///
/// When opened with [`MemoryStore::open`], the live contents are written to
/// a JSON snapshot by [`MemoryStore::flush`] and reloaded on the next open.
/// Commits are not flushed by themselves: whatever was committed after the
/// last flush is lost if the process dies. [`MemoryStore::spawn_flusher`]
/// bounds that window to one flush period.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    snapshot: Option<PathBuf>,
    /// Version last written to the snapshot; also serializes flushes.
    flushed: Mutex<u64>,
}

#[derive(Default)]
struct State {
    entries: HashMap<Vec<u8>, Entry>,
    version: u64,
}

struct Entry {
    value: Vec<u8>,
    version: u64,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    entries: Vec<SnapshotEntry>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotEntry {
    key: Vec<u8>,
    value: Vec<u8>,
}

impl MemoryStore {
    /// Create an empty, purely in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store backed by the snapshot file at `path`.
    ///
    /// A missing file yields an empty store; the file is created by the
    /// first flush that has something to write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut state = State::default();

        if path.exists() {
            let contents = fs::read(&path)?;
            let snapshot: Snapshot = serde_json::from_slice(&contents)?;
            state.version = 1;
            for SnapshotEntry { key, value } in snapshot.entries {
                state.entries.insert(key, Entry { value, version: 1 });
            }
            info!(path = %path.display(), keys = state.entries.len(), "Loaded store snapshot");
        } else if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let version = state.version;
        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                snapshot: Some(path),
                flushed: Mutex::new(version),
            }),
        })
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the live contents to the snapshot file if anything was
    /// committed since the last flush. A no-op for in-memory stores.
    ///
    /// The contents are copied under the state lock and written after it
    /// is released, so commits are never blocked on file I/O.
    pub fn flush(&self) -> Result<(), StoreError> {
        let Some(path) = &self.inner.snapshot else {
            return Ok(());
        };

        let mut flushed = self.inner.flushed.lock();
        let (version, snapshot) = {
            let state = self.inner.state.lock();
            if state.version == *flushed {
                return Ok(());
            }
            (state.version, state.snapshot())
        };

        write_snapshot(path, &snapshot)?;
        *flushed = version;
        debug!(version, keys = snapshot.entries.len(), "Flushed store snapshot");
        Ok(())
    }

    /// Flush the snapshot every `period` on a background task until the
    /// returned handle is aborted.
    ///
    /// # Panics
    ///
    /// Panics if `period` is zero.
    pub fn spawn_flusher(&self, period: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let store = store.clone();
                match tokio::task::spawn_blocking(move || store.flush()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => error!(error = %err, "Snapshot flush failed"),
                    Err(err) => error!(error = %err, "Snapshot flush task failed"),
                }
            }
        })
    }
}

impl Store for MemoryStore {
    type Txn = MemoryTxn;

    fn begin(&self, writable: bool) -> Result<MemoryTxn, StoreError> {
        Ok(MemoryTxn {
            inner: Arc::clone(&self.inner),
            writable,
            reads: HashMap::new(),
            writes: HashMap::new(),
            hooks: Vec::new(),
        })
    }
}

impl State {
    /// Version of a live key, zero when it is absent.
    fn version_of(&self, key: &[u8]) -> u64 {
        self.entries.get(key).map_or(0, |e| e.version)
    }

    fn snapshot(&self) -> Snapshot {
        let entries = self
            .entries
            .iter()
            .map(|(key, entry)| SnapshotEntry {
                key: key.clone(),
                value: entry.value.clone(),
            })
            .collect();
        Snapshot { entries }
    }

    fn apply(&mut self, writes: HashMap<Vec<u8>, Option<Vec<u8>>>) {
        self.version += 1;
        let version = self.version;
        for (key, value) in writes {
            match value {
                Some(value) => {
                    self.entries.insert(key, Entry { value, version });
                }
                None => {
                    self.entries.remove(&key);
                }
            }
        }
    }
}

fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp)?;
    file.write_all(&serde_json::to_vec(snapshot)?)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// A transaction against a [`MemoryStore`].
///
/// Reads see the latest committed value of a key (or this transaction's own
/// pending write to it). Writes are buffered until [`Transaction::commit`].
pub struct MemoryTxn {
    inner: Arc<Inner>,
    writable: bool,
    reads: HashMap<Vec<u8>, u64>,
    writes: HashMap<Vec<u8>, Option<Vec<u8>>>,
    hooks: Vec<CommitHook>,
}

impl Transaction for MemoryTxn {
    fn is_writable(&self) -> bool {
        self.writable
    }

    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(pending) = self.writes.get(key) {
            return Ok(pending.clone());
        }

        let state = self.inner.state.lock();
        let value = state.entries.get(key).map(|e| e.value.clone());
        if self.writable {
            self.reads
                .entry(key.to_vec())
                .or_insert_with(|| state.version_of(key));
        }
        Ok(value)
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), StoreError> {
        if !self.writable {
            return Err(StoreError::ReadOnly);
        }
        self.writes.insert(key.to_vec(), Some(value));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StoreError> {
        if !self.writable {
            return Err(StoreError::ReadOnly);
        }
        self.writes.insert(key.to_vec(), None);
        Ok(())
    }

    fn on_commit(&mut self, hook: CommitHook) {
        self.hooks.push(hook);
    }

    fn commit(self) -> Result<(), StoreError> {
        let mut state = self.inner.state.lock();

        if self.writable && !self.writes.is_empty() {
            let conflicted = self
                .reads
                .iter()
                .any(|(key, seen)| state.version_of(key) != *seen);
            if conflicted {
                debug!(reads = self.reads.len(), "Transaction conflict on commit");
                return Err(StoreError::Conflict);
            }
            state.apply(self.writes);
        }

        // Still under the state lock so hooks observe commit order
        for hook in self.hooks {
            hook();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_snapshot() -> PathBuf {
        std::env::temp_dir()
            .join(format!("sluice-store-{}", uuid::Uuid::new_v4()))
            .join("state.json")
    }

    #[test]
    fn test_missing_key_is_none() {
        let store = MemoryStore::new();
        let mut txn = store.begin(false).unwrap();
        assert_eq!(txn.get(b"nope").unwrap(), None);
    }

    #[test]
    fn test_commit_makes_writes_visible() {
        let store = MemoryStore::new();

        let mut txn = store.begin(true).unwrap();
        txn.set(b"key", b"value".to_vec()).unwrap();
        // Own writes are visible before commit
        assert_eq!(txn.get(b"key").unwrap(), Some(b"value".to_vec()));
        txn.commit().unwrap();

        let mut txn = store.begin(false).unwrap();
        assert_eq!(txn.get(b"key").unwrap(), Some(b"value".to_vec()));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_discard_drops_writes() {
        let store = MemoryStore::new();

        let mut txn = store.begin(true).unwrap();
        txn.set(b"key", b"value".to_vec()).unwrap();
        txn.discard();

        assert!(store.is_empty());
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let store = MemoryStore::new();
        let mut txn = store.begin(false).unwrap();

        assert!(matches!(txn.set(b"key", vec![1]), Err(StoreError::ReadOnly)));
        assert!(matches!(txn.delete(b"key"), Err(StoreError::ReadOnly)));
    }

    #[test]
    fn test_delete_removes_key() {
        let store = MemoryStore::new();
        store
            .update(|txn| txn.set(b"key", vec![1, 2, 3]))
            .unwrap();
        store.update(|txn| txn.delete(b"key")).unwrap();

        let value = store.view(|txn| txn.get(b"key")).unwrap();
        assert_eq!(value, None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_conflicting_writers() {
        let store = MemoryStore::new();

        let mut first = store.begin(true).unwrap();
        let mut second = store.begin(true).unwrap();

        assert_eq!(first.get(b"counter").unwrap(), None);
        assert_eq!(second.get(b"counter").unwrap(), None);

        first.set(b"counter", vec![1]).unwrap();
        second.set(b"counter", vec![1]).unwrap();

        first.commit().unwrap();
        assert!(matches!(second.commit(), Err(StoreError::Conflict)));
    }

    #[test]
    fn test_blind_writes_do_not_conflict() {
        let store = MemoryStore::new();

        let mut first = store.begin(true).unwrap();
        let mut second = store.begin(true).unwrap();
        first.set(b"key", vec![1]).unwrap();
        second.set(b"key", vec![2]).unwrap();

        first.commit().unwrap();
        second.commit().unwrap();

        let value = store.view(|txn| txn.get(b"key")).unwrap();
        assert_eq!(value, Some(vec![2]));
    }

    #[test]
    fn test_snapshot_survives_reopen() {
        let path = temp_snapshot();

        {
            let store = MemoryStore::open(&path).unwrap();
            store
                .update(|txn| {
                    txn.set(b"kept", vec![7])?;
                    txn.set(b"dropped", vec![8])
                })
                .unwrap();
            store.update(|txn| txn.delete(b"dropped")).unwrap();
            store.flush().unwrap();
        }

        let store = MemoryStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);
        let mut txn = store.begin(false).unwrap();
        assert_eq!(txn.get(b"kept").unwrap(), Some(vec![7]));
        assert_eq!(txn.get(b"dropped").unwrap(), None);

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_commits_wait_for_flush() {
        let path = temp_snapshot();

        let store = MemoryStore::open(&path).unwrap();
        // Nothing committed yet, nothing to write
        store.flush().unwrap();
        assert!(!path.exists());

        store.update(|txn| txn.set(b"key", vec![1])).unwrap();
        assert!(!path.exists(), "commits must not write the snapshot");

        store.flush().unwrap();
        assert_eq!(MemoryStore::open(&path).unwrap().len(), 1);

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn test_flusher_writes_periodically() {
        let path = temp_snapshot();
        let store = MemoryStore::open(&path).unwrap();
        let flusher = store.spawn_flusher(Duration::from_millis(10));

        store.update(|txn| txn.set(b"key", vec![1])).unwrap();
        for _ in 0..100 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        flusher.abort();

        assert_eq!(MemoryStore::open(&path).unwrap().len(), 1);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_deleted_keys_are_dropped() {
        let store = MemoryStore::new();

        for i in 0..1_000u32 {
            let key = format!("pending.{i}").into_bytes();
            store.update(|txn| txn.set(&key, vec![1])).unwrap();
            store.update(|txn| txn.delete(&key)).unwrap();
        }

        assert!(store.is_empty());
        assert_eq!(store.inner.state.lock().entries.len(), 0);
    }

    #[test]
    fn test_reads_of_absent_keys_conflict_with_creation() {
        let store = MemoryStore::new();
        store.update(|txn| txn.set(b"key", vec![1])).unwrap();

        let mut reader = store.begin(true).unwrap();
        assert_eq!(reader.get(b"key").unwrap(), Some(vec![1]));

        // Delete then recreate: the key is back, but under a new version
        store.update(|txn| txn.delete(b"key")).unwrap();
        store.update(|txn| txn.set(b"key", vec![1])).unwrap();

        reader.set(b"other", vec![2]).unwrap();
        assert!(matches!(reader.commit(), Err(StoreError::Conflict)));

        let mut absent = store.begin(true).unwrap();
        assert_eq!(absent.get(b"missing").unwrap(), None);
        store.update(|txn| txn.set(b"missing", vec![3])).unwrap();
        absent.set(b"missing", vec![4]).unwrap();
        assert!(matches!(absent.commit(), Err(StoreError::Conflict)));
    }

    #[test]
    fn test_commit_hooks_run_only_on_success() {
        let store = MemoryStore::new();
        let ran = Arc::new(Mutex::new(Vec::new()));

        let mut first = store.begin(true).unwrap();
        let mut second = store.begin(true).unwrap();
        first.get(b"counter").unwrap();
        second.get(b"counter").unwrap();
        first.set(b"counter", vec![1]).unwrap();
        second.set(b"counter", vec![2]).unwrap();

        let log = ran.clone();
        first.on_commit(Box::new(move || log.lock().push("first")));
        let log = ran.clone();
        second.on_commit(Box::new(move || log.lock().push("second")));

        first.commit().unwrap();
        assert!(second.commit().is_err());

        let mut dropped = store.begin(true).unwrap();
        let log = ran.clone();
        dropped.on_commit(Box::new(move || log.lock().push("dropped")));
        dropped.discard();

        assert_eq!(*ran.lock(), vec!["first"]);
    }
}
