//! Change records produced by detection and consumed by the engine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use crate::sync::metadata::{ItemId, ItemKind, ItemMetadata};
use crate::sync::version::{ReplicaId, VersionVector};

/// Kind of change detected on (or applied to) an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeType {
    Create,
    Update,
    Delete,
    Rename,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeType::Create => "create",
            ChangeType::Update => "update",
            ChangeType::Delete => "delete",
            ChangeType::Rename => "rename",
        };
        f.write_str(name)
    }
}

/// One detected change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub item_id: ItemId,
    pub change_type: ChangeType,
    pub kind: ItemKind,
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub version: VersionVector,
}

impl ChangeRecord {
    /// Build a record describing `item` after a change of `change_type`.
    /// `previous_path` is the path before a rename.
    pub fn from_item(change_type: ChangeType, item: &ItemMetadata, previous_path: Option<&str>) -> Self {
        let path = Some(item.relative_path.clone());
        let (old_path, new_path) = match change_type {
            ChangeType::Create => (None, path),
            ChangeType::Update => (path.clone(), path),
            ChangeType::Delete => (path, None),
            ChangeType::Rename => (previous_path.map(str::to_string), path),
        };
        Self {
            item_id: item.item_id,
            change_type,
            kind: item.kind,
            old_path,
            new_path,
            version: item.version.clone(),
        }
    }

    /// The path that best identifies the item for display.
    pub fn path(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or_default()
    }
}

/// An item the detector could not read; its prior metadata was kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionSkip {
    pub path: PathBuf,
    pub error: String,
}

/// Ordered output of one detection pass over a replica.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    pub replica_id: ReplicaId,
    changes: Vec<ChangeRecord>,
    index: HashMap<ItemId, usize>,
    pub skipped: Vec<DetectionSkip>,
    /// Entries visited by the walk.
    pub scanned: usize,
}

impl ChangeSet {
    pub fn new(replica_id: ReplicaId) -> Self {
        Self {
            replica_id,
            changes: Vec::new(),
            index: HashMap::new(),
            skipped: Vec::new(),
            scanned: 0,
        }
    }

    /// Append a record. A later record for the same item replaces the earlier
    /// one in place so each item appears once.
    pub fn push(&mut self, record: ChangeRecord) {
        match self.index.get(&record.item_id) {
            Some(&position) => self.changes[position] = record,
            None => {
                self.index.insert(record.item_id, self.changes.len());
                self.changes.push(record);
            }
        }
    }

    pub fn get(&self, item_id: &ItemId) -> Option<&ChangeRecord> {
        self.index.get(item_id).map(|&position| &self.changes[position])
    }

    pub fn contains(&self, item_id: &ItemId) -> bool {
        self.index.contains_key(item_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChangeRecord> {
        self.changes.iter()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Number of records of a given type.
    pub fn count(&self, change_type: ChangeType) -> usize {
        self.changes.iter().filter(|c| c.change_type == change_type).count()
    }
}
