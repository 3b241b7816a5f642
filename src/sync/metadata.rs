//! Per-item metadata tracked for every file and directory of a replica.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::Metadata;
use uuid::Uuid;

use crate::sync::version::{ReplicaId, VersionVector};

/// Global item identity. Stable across renames and shared by both replicas
/// once an item has been synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(Uuid);

impl ItemId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of filesystem entry an item is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    File,
    Directory,
}

impl ItemKind {
    pub fn is_dir(&self) -> bool {
        matches!(self, ItemKind::Directory)
    }
}

/// Cheap content identity: size and mtime, plus a BLAKE3 hash for files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl Fingerprint {
    /// Fingerprint from filesystem metadata, without a content hash.
    pub fn from_metadata(metadata: &Metadata) -> Self {
        Self {
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            hash: None,
        }
    }

    pub fn with_hash(mut self, hash: Option<String>) -> Self {
        self.hash = hash;
        self
    }

    /// Fast-path comparison: size and modification time.
    pub fn same_stat(&self, other: &Fingerprint) -> bool {
        self.size == other.size && self.modified == other.modified
    }

    /// Whether both fingerprints describe the same bytes.
    ///
    /// Hashes decide when both are known; otherwise size and mtime do.
    pub fn same_content(&self, other: &Fingerprint) -> bool {
        match (&self.hash, &other.hash) {
            (Some(a), Some(b)) => a == b,
            _ => self.same_stat(other),
        }
    }
}

/// Version-tracked record of one item on one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub item_id: ItemId,
    /// Path relative to the replica root, `/`-separated.
    pub relative_path: String,
    pub kind: ItemKind,
    #[serde(default)]
    pub is_tombstone: bool,
    pub fingerprint: Fingerprint,
    pub version: VersionVector,
    /// When the last mutation happened: the file's mtime for content and
    /// path changes, the scan time for deletions.
    pub detected_at: DateTime<Utc>,
}

impl ItemMetadata {
    /// Record for a newly detected item, first mutated by `replica` at `tick`.
    pub fn created(
        relative_path: impl Into<String>,
        kind: ItemKind,
        fingerprint: Fingerprint,
        replica: ReplicaId,
        tick: u64,
    ) -> Self {
        Self {
            item_id: ItemId::generate(),
            relative_path: relative_path.into(),
            kind,
            is_tombstone: false,
            detected_at: fingerprint.modified.unwrap_or_else(Utc::now),
            fingerprint,
            version: VersionVector::single(replica, tick),
        }
    }

    pub fn is_live(&self) -> bool {
        !self.is_tombstone
    }

    /// Register a local mutation: the own-replica component moves to `tick`.
    ///
    /// The change is dated by the current fingerprint's mtime.
    pub fn touch(&mut self, replica: ReplicaId, tick: u64) {
        self.version.record(replica, tick);
        self.detected_at = self.fingerprint.modified.unwrap_or_else(Utc::now);
    }

    /// Turn this record into a tombstone for a deletion detected at `tick`.
    pub fn mark_deleted(&mut self, replica: ReplicaId, tick: u64) {
        self.is_tombstone = true;
        self.version.record(replica, tick);
        self.detected_at = Utc::now();
    }

    pub fn file_name(&self) -> &str {
        self.relative_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.relative_path)
    }
}
