//! Persistent per-replica metadata store.
//!
//! The store lives in `<root>/.twinsync/metadata.json` and holds the replica
//! identity, the replica clock and the full item table. It is read once when a
//! session starts, mutated in memory, and replaced atomically on save. Opening
//! a store takes an exclusive advisory lock that is released on drop.

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::sync::error::{Result, SyncError};
use crate::sync::metadata::{ItemId, ItemMetadata};
use crate::sync::path_utils::STATE_DIR;
use crate::sync::version::ReplicaId;

const STORE_FILE: &str = "metadata.json";
const LOCK_FILE: &str = "lock";
const FORMAT_VERSION: u32 = 1;

/// On-disk layout of the store file.
#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    format_version: u32,
    replica_id: ReplicaId,
    tick: u64,
    items: Vec<ItemMetadata>,
}

/// Exclusive lock on a replica's state directory, held for a session.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    /// Try to take the lock without blocking.
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| SyncError::io("opening lock file", &path, e))?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { file, path }),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.raw_os_error() == fs2::lock_contended_error().raw_os_error() =>
            {
                Err(SyncError::StoreLocked {
                    path: state_dir.parent().unwrap_or(state_dir).to_path_buf(),
                })
            }
            Err(e) => Err(SyncError::io("locking metadata store", &path, e)),
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::debug!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

/// In-memory view of one replica's metadata.
#[derive(Debug)]
pub struct MetadataStore {
    root: PathBuf,
    replica_id: ReplicaId,
    tick: u64,
    items: BTreeMap<ItemId, ItemMetadata>,
    /// Live relative path -> item id.
    path_index: HashMap<String, ItemId>,
    _lock: Option<StoreLock>,
}

impl MetadataStore {
    /// Open the store for `replica_root`, taking the session lock.
    ///
    /// A missing or unreadable store file yields an empty store with a fresh
    /// identity, which makes the next detection pass a full rescan.
    pub fn load(replica_root: &Path) -> Result<Self> {
        let state_dir = Self::state_dir_of(replica_root);
        fs::create_dir_all(&state_dir)
            .map_err(|e| SyncError::io("creating state directory", &state_dir, e))?;

        let lock = StoreLock::acquire(&state_dir)?;
        let mut store = Self::read_unlocked(replica_root);
        store._lock = Some(lock);
        Ok(store)
    }

    /// Empty, unlocked store. Used for fresh replicas and in tests.
    pub fn empty(replica_root: &Path) -> Self {
        Self {
            root: replica_root.to_path_buf(),
            replica_id: ReplicaId::generate(),
            tick: 0,
            items: BTreeMap::new(),
            path_index: HashMap::new(),
            _lock: None,
        }
    }

    fn read_unlocked(replica_root: &Path) -> Self {
        let path = Self::state_dir_of(replica_root).join(STORE_FILE);

        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("No metadata store at {}, starting fresh", path.display());
                return Self::empty(replica_root);
            }
            Err(e) => {
                tracing::warn!("Cannot read metadata store {}: {}; rescanning", path.display(), e);
                return Self::empty(replica_root);
            }
        };

        match serde_json::from_slice::<StoreFile>(&content) {
            Ok(file) if file.format_version == FORMAT_VERSION => {
                let mut store = Self {
                    root: replica_root.to_path_buf(),
                    replica_id: file.replica_id,
                    tick: file.tick,
                    items: BTreeMap::new(),
                    path_index: HashMap::new(),
                    _lock: None,
                };
                for item in file.items {
                    store.upsert(item);
                }
                tracing::debug!(
                    "Loaded metadata store for {} ({} items, tick {})",
                    replica_root.display(),
                    store.items.len(),
                    store.tick
                );
                store
            }
            Ok(file) => {
                tracing::warn!(
                    "Unsupported metadata store version {} at {}; rescanning",
                    file.format_version,
                    path.display()
                );
                Self::empty(replica_root)
            }
            Err(e) => {
                tracing::warn!("Metadata store {} is corrupt ({}); rescanning", path.display(), e);
                Self::empty(replica_root)
            }
        }
    }

    /// Write the whole store atomically: temp file in the same directory,
    /// fsync, rename over the previous store.
    pub fn save(&self) -> Result<()> {
        self.stage()?.commit()
    }

    /// Encode and flush the store to a temp file next to the store file
    /// without replacing it yet. Dropping the result discards the temp file.
    pub fn stage(&self) -> Result<StagedStore> {
        let state_dir = self.state_dir();
        fs::create_dir_all(&state_dir)
            .map_err(|e| SyncError::io("creating state directory", &state_dir, e))?;

        let mut items: Vec<&ItemMetadata> = self.items.values().collect();
        items.sort_by(|a, b| a.relative_path.cmp(&b.relative_path).then(a.item_id.cmp(&b.item_id)));

        let file = StoreFileRef {
            format_version: FORMAT_VERSION,
            replica_id: self.replica_id,
            tick: self.tick,
            items,
        };
        let encoded = serde_json::to_vec_pretty(&file)?;

        let mut temp = NamedTempFile::new_in(&state_dir)
            .map_err(|e| SyncError::io("creating temporary store", &state_dir, e))?;
        temp.write_all(&encoded)
            .map_err(|e| SyncError::io("writing temporary store", temp.path(), e))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| SyncError::io("flushing temporary store", temp.path(), e))?;

        Ok(StagedStore {
            temp,
            target: state_dir.join(STORE_FILE),
            items: self.items.len(),
        })
    }

    fn state_dir_of(replica_root: &Path) -> PathBuf {
        replica_root.join(STATE_DIR)
    }

    /// `<root>/.twinsync`
    pub fn state_dir(&self) -> PathBuf {
        Self::state_dir_of(&self.root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// Current value of the replica clock.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Advance the replica clock and return the new tick.
    pub fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    pub fn get(&self, item_id: &ItemId) -> Option<&ItemMetadata> {
        self.items.get(item_id)
    }

    /// Id of the live item currently at `relative_path`.
    pub fn id_at(&self, relative_path: &str) -> Option<ItemId> {
        self.path_index.get(relative_path).copied()
    }

    /// Live item currently at `relative_path`.
    pub fn live_at(&self, relative_path: &str) -> Option<&ItemMetadata> {
        self.id_at(relative_path).and_then(|id| self.items.get(&id))
    }

    /// Insert or replace a record, keeping the path index consistent.
    pub fn upsert(&mut self, item: ItemMetadata) {
        if let Some(previous) = self.items.get(&item.item_id) {
            if self.path_index.get(&previous.relative_path) == Some(&item.item_id) {
                self.path_index.remove(&previous.relative_path);
            }
        }
        if item.is_live() {
            self.path_index.insert(item.relative_path.clone(), item.item_id);
        }
        self.items.insert(item.item_id, item);
    }

    /// Drop a record entirely (used when two ids turn out to name one item).
    pub fn remove(&mut self, item_id: &ItemId) -> Option<ItemMetadata> {
        let removed = self.items.remove(item_id)?;
        if self.path_index.get(&removed.relative_path) == Some(item_id) {
            self.path_index.remove(&removed.relative_path);
        }
        Some(removed)
    }

    pub fn all(&self) -> impl Iterator<Item = &ItemMetadata> {
        self.items.values()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether this store holds the session lock.
    pub fn is_locked(&self) -> bool {
        self._lock.is_some()
    }
}

/// A fully written store waiting to replace the current one.
#[derive(Debug)]
pub struct StagedStore {
    temp: NamedTempFile,
    target: PathBuf,
    items: usize,
}

impl StagedStore {
    /// Rename the staged file over the store.
    pub fn commit(self) -> Result<()> {
        let target = self.target;
        self.temp
            .persist(&target)
            .map_err(|e| SyncError::io("replacing metadata store", &target, e.error))?;
        tracing::debug!("Saved metadata store {} ({} items)", target.display(), self.items);
        Ok(())
    }
}

// Borrowing twin of `StoreFile` so saving does not clone the item table.
#[derive(Serialize)]
struct StoreFileRef<'a> {
    format_version: u32,
    replica_id: ReplicaId,
    tick: u64,
    items: Vec<&'a ItemMetadata>,
}
