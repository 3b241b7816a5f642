//! Change detection for one replica.
//!
//! The detector walks the replica tree, reconciles what it finds against the
//! metadata store and emits a [`ChangeSet`]. The store is updated in memory as
//! a side effect; persisting it is left to the caller.
//!
//! Files are compared by size and modification time first. When only the
//! mtime moved the file is hashed and an unchanged hash refreshes the stored
//! mtime without emitting a change. A vanished file and a new file with the
//! same size, mtime and hash are paired into a rename.

use jwalk::{Parallelism, WalkDir};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::sync::changes::{ChangeRecord, ChangeSet, ChangeType, DetectionSkip};
use crate::sync::error::{Result, SyncError};
use crate::sync::filter::Filter;
use crate::sync::hash::hash_files;
use crate::sync::metadata::{Fingerprint, ItemId, ItemKind, ItemMetadata};
use crate::sync::path_utils::{self, relative_string};
use crate::sync::store::MetadataStore;

/// An entry found on disk during the walk.
#[derive(Debug)]
struct Observed {
    relative: String,
    native: PathBuf,
    kind: ItemKind,
    fingerprint: Fingerprint,
}

/// Decision for one observed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Unchanged,
    Create,
    Update(ItemId),
    /// Only the mtime moved; the hash decides.
    Verify(ItemId),
    Refresh(ItemId),
    Rename(ItemId),
    /// Could not be hashed; left alone until the next run.
    Skip,
}

impl Verdict {
    fn needs_hash(&self, kind: ItemKind) -> bool {
        match self {
            Verdict::Create => kind == ItemKind::File,
            Verdict::Update(_) | Verdict::Verify(_) => true,
            _ => false,
        }
    }
}

/// Walks one replica and reconciles it with its store.
pub struct ChangeDetector<'a> {
    root: PathBuf,
    filter: &'a Filter,
}

impl<'a> ChangeDetector<'a> {
    pub fn new(replica_root: &Path, filter: &'a Filter) -> Self {
        Self {
            root: replica_root.to_path_buf(),
            filter,
        }
    }

    /// Run a full detection pass, updating `store` in memory.
    pub fn detect(&self, store: &mut MetadataStore) -> Result<ChangeSet> {
        fs::read_dir(&self.root).map_err(|e| SyncError::io("scanning replica", &self.root, e))?;

        let mut changes = ChangeSet::new(store.replica_id());
        let scan = self.walk(&mut changes);
        changes.scanned = scan.observed.len();

        let mut observed = scan.observed;
        let mut verdicts: Vec<Verdict> = observed.iter().map(|entry| classify(entry, store)).collect();
        let mut protected = scan.protected;

        // Hash everything whose content may have changed in one parallel batch
        let to_hash: Vec<usize> = (0..observed.len())
            .filter(|&i| verdicts[i].needs_hash(observed[i].kind))
            .collect();
        let paths: Vec<PathBuf> = to_hash.iter().map(|&i| observed[i].native.clone()).collect();
        for (&index, result) in to_hash.iter().zip(hash_files(&paths)) {
            match result {
                Ok(hash) => {
                    let entry = &mut observed[index];
                    entry.fingerprint.hash = Some(hash);
                }
                Err(e) => {
                    tracing::warn!("Cannot hash {}: {}", observed[index].native.display(), e);
                    changes.skipped.push(DetectionSkip {
                        path: observed[index].native.clone(),
                        error: e.to_string(),
                    });
                    protected.insert(observed[index].relative.clone());
                    verdicts[index] = Verdict::Skip;
                }
            }
        }

        for (verdict, entry) in verdicts.iter_mut().zip(&observed) {
            if let Verdict::Verify(id) = *verdict {
                let same = store
                    .get(&id)
                    .map(|record| record.fingerprint.hash.is_some() && record.fingerprint.same_content(&entry.fingerprint))
                    .unwrap_or(false);
                *verdict = if same { Verdict::Refresh(id) } else { Verdict::Update(id) };
            }
        }

        let claimed: HashSet<ItemId> = verdicts
            .iter()
            .filter_map(|verdict| match verdict {
                Verdict::Unchanged | Verdict::Create | Verdict::Skip => None,
                Verdict::Update(id) | Verdict::Verify(id) | Verdict::Refresh(id) | Verdict::Rename(id) => Some(*id),
            })
            .collect();
        let unchanged_paths: HashSet<&str> = observed
            .iter()
            .zip(&verdicts)
            .filter(|(_, verdict)| matches!(verdict, Verdict::Unchanged))
            .map(|(entry, _)| entry.relative.as_str())
            .collect();

        let mut missing = self.missing_records(store, &claimed, &unchanged_paths, &protected, &scan.unreadable_dirs);
        pair_renames(&observed, &mut verdicts, &mut missing, store);

        // Creates, updates and renames in walk order
        let replica = store.replica_id();
        for (entry, verdict) in observed.into_iter().zip(verdicts) {
            match verdict {
                Verdict::Unchanged | Verdict::Skip | Verdict::Verify(_) => {}
                Verdict::Refresh(id) => {
                    if let Some(mut record) = store.get(&id).cloned() {
                        record.fingerprint.modified = entry.fingerprint.modified;
                        tracing::debug!("Refreshed timestamp of {}", record.relative_path);
                        store.upsert(record);
                    }
                }
                Verdict::Create => {
                    let tick = store.next_tick();
                    let record = ItemMetadata::created(entry.relative, entry.kind, entry.fingerprint, replica, tick);
                    tracing::debug!("Detected create {}", record.relative_path);
                    changes.push(ChangeRecord::from_item(ChangeType::Create, &record, None));
                    store.upsert(record);
                }
                Verdict::Update(id) => {
                    if let Some(mut record) = store.get(&id).cloned() {
                        let tick = store.next_tick();
                        record.fingerprint = entry.fingerprint;
                        record.touch(replica, tick);
                        tracing::debug!("Detected update {}", record.relative_path);
                        changes.push(ChangeRecord::from_item(ChangeType::Update, &record, None));
                        store.upsert(record);
                    }
                }
                Verdict::Rename(id) => {
                    if let Some(mut record) = store.get(&id).cloned() {
                        let tick = store.next_tick();
                        let previous = std::mem::replace(&mut record.relative_path, entry.relative);
                        record.fingerprint = entry.fingerprint;
                        record.touch(replica, tick);
                        tracing::debug!("Detected rename {} -> {}", previous, record.relative_path);
                        changes.push(ChangeRecord::from_item(ChangeType::Rename, &record, Some(&previous)));
                        store.upsert(record);
                    }
                }
            }
        }

        // Then deletes
        for id in missing {
            if let Some(mut record) = store.get(&id).cloned() {
                let tick = store.next_tick();
                record.mark_deleted(replica, tick);
                tracing::debug!("Detected delete {}", record.relative_path);
                changes.push(ChangeRecord::from_item(ChangeType::Delete, &record, None));
                store.upsert(record);
            }
        }

        tracing::info!(
            "Scanned {}: {} entries, {} changes, {} skipped",
            self.root.display(),
            changes.scanned,
            changes.len(),
            changes.skipped.len()
        );
        Ok(changes)
    }

    fn walk(&self, changes: &mut ChangeSet) -> Scan {
        let mut scan = Scan::default();
        let root = self.root.clone();
        let prune_root = self.root.clone();
        let filter = Arc::new(self.filter.clone());

        let walker = WalkDir::new(&root)
            .parallelism(Parallelism::RayonNewPool(0))
            .skip_hidden(false)
            .follow_links(false)
            .sort(true)
            .process_read_dir(move |_depth, _path, _state, children| {
                // Do not descend into the state directory or excluded directories
                children.retain(|child| match child {
                    Ok(entry) if entry.file_type().is_dir() => relative_string(&prune_root, &entry.path())
                        .map(|rel| filter.matches_dir(&rel))
                        .unwrap_or(true),
                    _ => true,
                });
            });

        for entry_result in walker {
            let entry = match entry_result {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                    tracing::warn!("Cannot read {}: {}", path.display(), e);
                    if let Some(rel) = relative_string(&root, &path) {
                        scan.unreadable_dirs.push(rel.clone());
                        scan.protected.insert(rel);
                    }
                    changes.skipped.push(DetectionSkip {
                        path,
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            if entry.depth() == 0 {
                continue;
            }
            let native = entry.path();
            let Some(relative) = relative_string(&root, &native) else {
                // Below the root, so the name itself cannot be represented
                tracing::warn!("Skipping {}: name is not valid UTF-8", native.display());
                changes.skipped.push(DetectionSkip {
                    path: native,
                    error: "file name is not valid UTF-8".to_string(),
                });
                continue;
            };
            if path_utils::is_reserved(&relative) || path_utils::is_staging(&relative) {
                continue;
            }

            let metadata = match fs::symlink_metadata(&native) {
                Ok(metadata) => metadata,
                Err(e) => {
                    tracing::warn!("Cannot stat {}: {}", native.display(), e);
                    changes.skipped.push(DetectionSkip {
                        path: native,
                        error: e.to_string(),
                    });
                    scan.protected.insert(relative);
                    continue;
                }
            };

            if metadata.file_type().is_symlink() {
                tracing::debug!("Skipping symlink {}", relative);
                continue;
            }
            let kind = if metadata.is_dir() { ItemKind::Directory } else { ItemKind::File };
            if !self.filter.matches_entry(&relative, kind.is_dir()) {
                continue;
            }

            scan.observed.push(Observed {
                relative,
                native,
                kind,
                fingerprint: Fingerprint::from_metadata(&metadata),
            });
        }

        scan
    }

    /// Live records with no matching entry on disk.
    fn missing_records(
        &self,
        store: &MetadataStore,
        claimed: &HashSet<ItemId>,
        unchanged_paths: &HashSet<&str>,
        protected: &HashSet<String>,
        unreadable_dirs: &[String],
    ) -> Vec<ItemId> {
        store
            .all()
            .filter(|record| record.is_live())
            .filter(|record| !claimed.contains(&record.item_id))
            .filter(|record| !unchanged_paths.contains(record.relative_path.as_str()))
            .filter(|record| !protected.contains(&record.relative_path))
            .filter(|record| {
                !unreadable_dirs
                    .iter()
                    .any(|dir| path_utils::is_within(&record.relative_path, dir))
            })
            .filter(|record| self.filter.matches_entry(&record.relative_path, record.kind.is_dir()))
            .map(|record| record.item_id)
            .collect()
    }
}

#[derive(Debug, Default)]
struct Scan {
    observed: Vec<Observed>,
    /// Paths whose records must be kept because they could not be read.
    protected: HashSet<String>,
    unreadable_dirs: Vec<String>,
}

fn classify(entry: &Observed, store: &MetadataStore) -> Verdict {
    let Some(record) = store.live_at(&entry.relative) else {
        return Verdict::Create;
    };
    if record.kind != entry.kind {
        // The old item is reported as missing, the new one is created
        return Verdict::Create;
    }
    if entry.kind.is_dir() {
        return Verdict::Unchanged;
    }

    let stored = &record.fingerprint;
    if stored.same_stat(&entry.fingerprint) {
        Verdict::Unchanged
    } else if stored.size != entry.fingerprint.size {
        Verdict::Update(record.item_id)
    } else {
        Verdict::Verify(record.item_id)
    }
}

/// Pair file creates with vanished file records of equal size, mtime and hash.
fn pair_renames(
    observed: &[Observed],
    verdicts: &mut [Verdict],
    missing: &mut Vec<ItemId>,
    store: &MetadataStore,
) {
    let mut candidates: HashMap<(u64, Option<i64>), Vec<ItemId>> = HashMap::new();
    for id in missing.iter() {
        if let Some(record) = store.get(id).filter(|r| r.kind == ItemKind::File) {
            let key = (
                record.fingerprint.size,
                record.fingerprint.modified.map(|m| m.timestamp_nanos_opt().unwrap_or(i64::MAX)),
            );
            candidates.entry(key).or_default().push(*id);
        }
    }
    if candidates.is_empty() {
        return;
    }

    let mut paired = HashSet::new();
    for (entry, verdict) in observed.iter().zip(verdicts.iter_mut()) {
        if *verdict != Verdict::Create || entry.kind != ItemKind::File {
            continue;
        }
        let key = (
            entry.fingerprint.size,
            entry.fingerprint.modified.map(|m| m.timestamp_nanos_opt().unwrap_or(i64::MAX)),
        );
        let Some(ids) = candidates.get_mut(&key) else {
            continue;
        };

        let found = ids.iter().position(|id| {
            store
                .get(id)
                .map(|record| match (&record.fingerprint.hash, &entry.fingerprint.hash) {
                    (Some(stored), Some(current)) => stored == current,
                    (None, _) => true,
                    (Some(_), None) => false,
                })
                .unwrap_or(false)
        });
        if let Some(position) = found {
            let id = ids.remove(position);
            paired.insert(id);
            *verdict = Verdict::Rename(id);
        }
    }

    missing.retain(|id| !paired.contains(id));
}

/// Detect the changes of `replica_root` since the store was last updated.
pub fn detect_changes(replica_root: &Path, filter: &Filter, store: &mut MetadataStore) -> Result<ChangeSet> {
    ChangeDetector::new(replica_root, filter).detect(store)
}
