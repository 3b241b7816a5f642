//! Sync engine: merges one replica's changes into another.
//!
//! A pass runs `Idle -> Merging -> Applying -> Finalizing -> Completed`.
//! Merging builds an ordered plan from the source change set, Applying runs
//! each operation against the destination filesystem and Finalizing commits
//! the collected record updates to both in-memory stores. Per-item failures
//! become skipped changes; only a vanished destination root or cancellation
//! move the pass to `Failed`.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::fs::{LocalFs, ReplicaFs};
use crate::sync::bus::{AppliedChange, NotificationBus, SkipReason, SkippedChange, SyncEvent};
use crate::sync::changes::{ChangeSet, ChangeType};
use crate::sync::conflict::{ConflictRecord, ConflictResolver, ConflictSide, Side};
use crate::sync::error::{Result, SyncError};
use crate::sync::filter::Filter;
use crate::sync::metadata::{Fingerprint, ItemId, ItemKind, ItemMetadata};
use crate::sync::path_utils::to_native;
use crate::sync::plan::{build_plan, Effect, Operation};
use crate::sync::recycle::RecycleBin;
use crate::sync::store::MetadataStore;
use crate::sync::version::{ReplicaId, VectorOrdering};

/// Direction of a session. Two-way sessions run a second, reversed pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncDirection {
    #[default]
    OneWay,
    TwoWay,
}

/// State of a single `synchronize` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    #[default]
    Idle,
    Merging,
    Applying,
    Finalizing,
    Completed,
    Failed,
}

/// One side of a pass: its store and the changes detected on it.
pub struct Replica<'a> {
    pub store: &'a mut MetadataStore,
    pub changes: &'a ChangeSet,
}

impl<'a> Replica<'a> {
    pub fn new(store: &'a mut MetadataStore, changes: &'a ChangeSet) -> Self {
        Self { store, changes }
    }
}

/// Shared cancellation flag, checked between items.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Sync statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub renamed: usize,
    pub skipped: usize,
    pub conflicts: usize,
    /// Items the destination already had under another id.
    pub adopted: usize,
    pub bytes_copied: u64,
    pub duration_ms: u64,
}

impl SyncStats {
    /// Number of applied filesystem changes.
    pub fn applied(&self) -> usize {
        self.created + self.updated + self.deleted + self.renamed
    }

    pub fn absorb(&mut self, other: &SyncStats) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.renamed += other.renamed;
        self.skipped += other.skipped;
        self.conflicts += other.conflicts;
        self.adopted += other.adopted;
        self.bytes_copied += other.bytes_copied;
        self.duration_ms += other.duration_ms;
    }

    fn count(&mut self, change_type: ChangeType) {
        match change_type {
            ChangeType::Create => self.created += 1,
            ChangeType::Update => self.updated += 1,
            ChangeType::Delete => self.deleted += 1,
            ChangeType::Rename => self.renamed += 1,
        }
    }
}

/// Outcome of one pass.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub source_replica: ReplicaId,
    pub destination_replica: ReplicaId,
    pub state: SyncState,
    pub applied: Vec<AppliedChange>,
    pub skipped: Vec<SkippedChange>,
    pub conflicts: Vec<ConflictRecord>,
    /// Items the destination won; a reverse pass has to carry them back.
    pub followups: Vec<ItemId>,
    pub stats: SyncStats,
}

impl SyncReport {
    fn new(source_replica: ReplicaId, destination_replica: ReplicaId) -> Self {
        Self {
            source_replica,
            destination_replica,
            state: SyncState::Idle,
            applied: Vec::new(),
            skipped: Vec::new(),
            conflicts: Vec::new(),
            followups: Vec::new(),
            stats: SyncStats::default(),
        }
    }
}

/// Merges and applies changes between two replicas.
pub struct SyncEngine {
    resolver: ConflictResolver,
    filter: Filter,
    fs: Arc<dyn ReplicaFs>,
    bus: NotificationBus,
    cancel: CancelFlag,
    state: SyncState,
}

impl SyncEngine {
    pub fn new(resolver: ConflictResolver, filter: Filter) -> Self {
        Self {
            resolver,
            filter,
            fs: Arc::new(LocalFs),
            bus: NotificationBus::new(),
            cancel: CancelFlag::new(),
            state: SyncState::Idle,
        }
    }

    /// Route destination mutations through another filesystem.
    pub fn with_fs(mut self, fs: Arc<dyn ReplicaFs>) -> Self {
        self.fs = fs;
        self
    }

    pub fn with_bus(mut self, bus: NotificationBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    fn transition(&mut self, state: SyncState) {
        tracing::debug!("Sync state {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    // Borrows only the state field; a running pass holds the resolver and filter
    fn fail(state: &mut SyncState, error: SyncError) -> SyncError {
        tracing::warn!("Sync pass failed: {}", error);
        tracing::debug!("Sync state {:?} -> {:?}", state, SyncState::Failed);
        *state = SyncState::Failed;
        error
    }

    fn destination_available(&self, root: &Path) -> bool {
        self.fs.metadata(root).map(|m| m.is_dir()).unwrap_or(false)
    }

    /// Bring `destination` up to date with the changes of `source`.
    ///
    /// Items in the source change set are merged in detection order, followed
    /// by source records the destination has not caught up with (earlier
    /// skips). Both stores are updated in memory; saving them is the caller's
    /// job.
    pub fn synchronize(
        &mut self,
        source: Replica<'_>,
        destination: Replica<'_>,
        direction: SyncDirection,
    ) -> Result<SyncReport> {
        let started = Instant::now();
        self.state = SyncState::Idle;
        let mut report = SyncReport::new(source.store.replica_id(), destination.store.replica_id());

        self.transition(SyncState::Merging);
        let destination_root = destination.store.root().to_path_buf();
        if !self.destination_available(&destination_root) {
            return Err(Self::fail(&mut self.state, SyncError::DestinationUnavailable { path: destination_root }));
        }
        let plan = build_plan(
            source.store,
            source.changes,
            destination.store,
            &self.filter,
            &self.resolver,
        );

        self.transition(SyncState::Applying);
        let mut pass = Pass {
            fs: Arc::clone(&self.fs),
            resolver: &self.resolver,
            filter: &self.filter,
            source_root: source.store.root().to_path_buf(),
            destination_root: destination_root.clone(),
            recycle: RecycleBin::new(&destination_root),
            source_replica: source.store.replica_id(),
            destination_replica: destination.store.replica_id(),
            vacated: HashSet::new(),
            displaced: HashSet::new(),
            source_updates: Vec::new(),
            destination_updates: Vec::new(),
            report: &mut report,
        };

        for operation in &plan.operations {
            if self.cancel.is_cancelled() {
                return Err(Self::fail(&mut self.state, SyncError::Cancelled));
            }

            match pass.apply(operation, source.store, destination.store) {
                Ok(Outcome::Applied { change, recycled }) => {
                    tracing::debug!("Applied {} {}", change.change_type, operation.source.relative_path);
                    pass.report.stats.count(change.change_type);
                    pass.confirm_source(operation);
                    pass.note_conflict(operation, recycled);
                    pass.report.applied.push(change.clone());
                    self.bus.publish(&SyncEvent::Applied(change));
                }
                Ok(Outcome::Recorded) => {
                    pass.confirm_source(operation);
                    pass.note_conflict(operation, None);
                }
                Err(skip) => {
                    if skip.reason == SkipReason::Io && !self.destination_available(&destination_root) {
                        let error = SyncError::DestinationUnavailable { path: destination_root };
                        return Err(Self::fail(&mut self.state, error));
                    }
                    if skip.reason == SkipReason::ConflictLoser {
                        pass.note_conflict(operation, None);
                    }
                    let skipped = SkippedChange {
                        item_id: operation.item_id,
                        change_type: operation.change_type,
                        path: operation.destination_path().to_string(),
                        reason: skip.reason,
                        underlying_error: skip.error,
                    };
                    tracing::warn!(
                        "Skipped {} {}: {}{}",
                        skipped.change_type,
                        skipped.path,
                        skipped.reason,
                        skipped
                            .underlying_error
                            .as_deref()
                            .map(|e| format!(" ({})", e))
                            .unwrap_or_default()
                    );
                    pass.report.stats.skipped += 1;
                    pass.report.skipped.push(skipped.clone());
                    self.bus.publish(&SyncEvent::Skipped(skipped));
                }
            }
        }

        let Pass {
            source_updates,
            destination_updates,
            ..
        } = pass;
        self.transition(SyncState::Finalizing);
        commit(source.store, source_updates);
        commit(destination.store, destination_updates);
        if direction == SyncDirection::OneWay {
            report.followups.clear();
        }

        report.stats.duration_ms = started.elapsed().as_millis() as u64;
        self.transition(SyncState::Completed);
        report.state = SyncState::Completed;
        tracing::info!(
            "Pass {} -> {}: {} applied, {} skipped, {} conflicts, {} superseded",
            report.source_replica,
            report.destination_replica,
            report.stats.applied(),
            report.stats.skipped,
            report.stats.conflicts,
            plan.superseded
        );
        Ok(report)
    }
}

/// A record change collected during Applying.
#[derive(Debug)]
enum StoreUpdate {
    Upsert(ItemMetadata),
    Remove(ItemId),
}

fn commit(store: &mut MetadataStore, updates: Vec<StoreUpdate>) {
    for update in updates {
        match update {
            StoreUpdate::Upsert(record) => store.upsert(record),
            StoreUpdate::Remove(id) => {
                store.remove(&id);
            }
        }
    }
}

#[derive(Debug)]
enum Outcome {
    Applied {
        change: AppliedChange,
        recycled: Option<PathBuf>,
    },
    /// Only metadata changed.
    Recorded,
}

#[derive(Debug)]
struct Skip {
    reason: SkipReason,
    error: Option<String>,
}

impl Skip {
    fn new(reason: SkipReason) -> Self {
        Self { reason, error: None }
    }

    fn io(reason: SkipReason, error: &io::Error) -> Self {
        Self {
            reason,
            error: Some(error.to_string()),
        }
    }
}

/// What currently sits at a destination path.
#[derive(Debug)]
enum Occupant {
    Free,
    /// On disk with no live record.
    Untracked { is_dir: bool },
    Tracked { record: ItemMetadata, on_disk: bool },
}

enum Cleared {
    Free,
    Adopted(ItemMetadata),
}

/// Mutable state of one Applying phase.
struct Pass<'a> {
    fs: Arc<dyn ReplicaFs>,
    resolver: &'a ConflictResolver,
    filter: &'a Filter,
    source_root: PathBuf,
    destination_root: PathBuf,
    recycle: RecycleBin,
    source_replica: ReplicaId,
    destination_replica: ReplicaId,
    /// Destination paths emptied earlier in this pass.
    vacated: HashSet<String>,
    /// Destination items already moved out of the way in this pass.
    displaced: HashSet<ItemId>,
    source_updates: Vec<StoreUpdate>,
    destination_updates: Vec<StoreUpdate>,
    report: &'a mut SyncReport,
}

impl Pass<'_> {
    fn source_path(&self, relative: &str) -> PathBuf {
        to_native(&self.source_root, relative)
    }

    fn destination_path(&self, relative: &str) -> PathBuf {
        to_native(&self.destination_root, relative)
    }

    fn apply(
        &mut self,
        op: &Operation,
        source: &MetadataStore,
        destination: &mut MetadataStore,
    ) -> std::result::Result<Outcome, Skip> {
        match &op.effect {
            Effect::CreateDir => self.create_dir(op, source, destination),
            Effect::CreateFile => self.create_file(op, source, destination),
            Effect::Update => self.update(op),
            Effect::Rename { from, content_changed } => {
                self.rename(op, from, *content_changed, source, destination)
            }
            Effect::Delete => self.delete(op),
            Effect::Record => {
                self.record(op);
                Ok(Outcome::Recorded)
            }
            Effect::KeepDestination => {
                if let Some(d) = &op.destination {
                    let mut record = d.clone();
                    record.version = op.merged.clone();
                    self.destination_updates.push(StoreUpdate::Upsert(record));
                }
                self.report.followups.push(op.item_id);
                Err(Skip::new(SkipReason::ConflictLoser))
            }
        }
    }

    /// After a conflict the source won, both sides hold the source content
    /// and share the merged vector.
    fn confirm_source(&mut self, op: &Operation) {
        if op.resolution.as_ref().map(|r| r.winner) == Some(Side::Source) {
            let mut record = op.source.clone();
            record.version = op.merged.clone();
            self.source_updates.push(StoreUpdate::Upsert(record));
        }
    }

    /// Add a conflict record if the operation came out of conflict resolution.
    fn note_conflict(&mut self, op: &Operation, recycled_to: Option<PathBuf>) {
        let (Some(resolution), Some(dest)) = (&op.resolution, &op.destination) else {
            return;
        };
        self.report.stats.conflicts += 1;
        self.report.conflicts.push(ConflictRecord {
            item_id: op.item_id,
            path: op.destination_path().to_string(),
            source_version: op.source.version.clone(),
            destination_version: dest.version.clone(),
            winner: resolution.winner,
            merged_version: resolution.merged.clone(),
            recycled_to,
        });
    }

    /// Write the source record, as now present on the destination.
    fn commit_written(&mut self, op: &Operation, relative: &str) {
        let mut record = op.source.clone();
        record.version = op.merged.clone();
        record.fingerprint = self.destination_fingerprint(&self.destination_path(relative), &op.source.fingerprint);
        self.destination_updates.push(StoreUpdate::Upsert(record));
        self.vacated.remove(relative);
    }

    fn destination_fingerprint(&self, path: &Path, template: &Fingerprint) -> Fingerprint {
        self.fs
            .metadata(path)
            .map(|m| Fingerprint::from_metadata(&m).with_hash(template.hash.clone()))
            .unwrap_or_else(|_| template.clone())
    }

    fn record(&mut self, op: &Operation) {
        let mut record = op.source.clone();
        record.version = op.merged.clone();
        if let Some(d) = op.destination.as_ref().filter(|d| d.is_live() && d.kind == record.kind) {
            if record.is_live() {
                record.fingerprint = d.fingerprint.clone();
            }
        }
        self.destination_updates.push(StoreUpdate::Upsert(record));
    }

    fn applied(op: &Operation, change_type: ChangeType, old_path: Option<&str>, new_path: Option<&str>) -> AppliedChange {
        AppliedChange {
            item_id: op.item_id,
            change_type,
            old_path: old_path.map(str::to_string),
            new_path: new_path.map(str::to_string),
        }
    }

    /// Copy a source file over `target`, mapping failures to skips.
    fn copy_from_source(&mut self, relative: &str, target: &Path) -> std::result::Result<u64, Skip> {
        let from = self.source_path(relative);
        match self.fs.copy_file(&from, target) {
            Ok(bytes) => {
                self.report.stats.bytes_copied += bytes;
                Ok(bytes)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound && !from.exists() => {
                Err(Skip::io(SkipReason::SourceMissing, &e))
            }
            Err(e) => Err(Skip::io(SkipReason::Io, &e)),
        }
    }

    fn ensure_source(&self, relative: &str) -> std::result::Result<(), Skip> {
        match std::fs::symlink_metadata(self.source_path(relative)) {
            Ok(_) => Ok(()),
            Err(e) => Err(Skip::io(SkipReason::SourceMissing, &e)),
        }
    }

    fn preserve(&self, target: &Path, item_id: &ItemId) -> std::result::Result<Option<PathBuf>, Skip> {
        self.recycle
            .preserve(self.fs.as_ref(), target, item_id)
            .map_err(|e| Skip::io(SkipReason::RecycleFailed, &e))
    }

    // Put recycled content back after a failed copy
    fn restore(&self, recycled: Option<PathBuf>, target: &Path) {
        if let Some(recycled) = recycled {
            if let Err(e) = self.fs.rename(&recycled, target) {
                tracing::warn!(
                    "Could not restore {} from {}: {}",
                    target.display(),
                    recycled.display(),
                    e
                );
            }
        }
    }

    fn occupant(&self, destination: &MetadataStore, relative: &str, incoming: ItemId) -> Occupant {
        let metadata = self.fs.metadata(&self.destination_path(relative)).ok();

        if !self.vacated.contains(relative) {
            if let Some(record) = destination.live_at(relative) {
                if record.item_id != incoming && !self.displaced.contains(&record.item_id) {
                    return Occupant::Tracked {
                        record: record.clone(),
                        on_disk: metadata.is_some(),
                    };
                }
                if record.item_id == incoming {
                    return Occupant::Free;
                }
            }
        }

        match metadata {
            Some(metadata) => Occupant::Untracked {
                is_dir: metadata.is_dir(),
            },
            None => Occupant::Free,
        }
    }

    /// Make `relative` available for `op`'s item on the destination.
    fn clear_target(
        &mut self,
        op: &Operation,
        relative: &str,
        allow_adopt: bool,
        source: &MetadataStore,
        destination: &mut MetadataStore,
    ) -> std::result::Result<Cleared, Skip> {
        let target = self.destination_path(relative);
        let incoming = &op.source;

        match self.occupant(destination, relative, op.item_id) {
            Occupant::Free => Ok(Cleared::Free),
            Occupant::Untracked { is_dir } => {
                if is_dir && incoming.kind.is_dir() {
                    return Ok(Cleared::Free);
                }
                if !self.filter.matches_entry(relative, is_dir) {
                    // Excluded content is never touched
                    return Err(Skip::new(SkipReason::Io).with_error("destination path holds excluded content"));
                }
                self.preserve(&target, &op.item_id)?;
                Ok(Cleared::Free)
            }
            Occupant::Tracked { mut record, on_disk: false } => {
                // Stale record: the content is already gone
                record.mark_deleted(self.destination_replica, destination.next_tick());
                self.displaced.insert(record.item_id);
                self.destination_updates.push(StoreUpdate::Upsert(record));
                Ok(Cleared::Free)
            }
            Occupant::Tracked { mut record, on_disk: true } => {
                if allow_adopt && record.kind == incoming.kind {
                    let identical = match record.kind {
                        ItemKind::Directory => true,
                        ItemKind::File => {
                            record.fingerprint.hash.is_some() && record.fingerprint.hash == incoming.fingerprint.hash
                        }
                    };
                    if identical {
                        return Ok(Cleared::Adopted(record));
                    }
                }

                // The occupant is deleted on the source as well: just move it away
                let deleted_on_source = source
                    .get(&record.item_id)
                    .filter(|s| s.is_tombstone)
                    .map(|s| matches!(s.version.compare(&record.version), VectorOrdering::Dominates | VectorOrdering::Equal))
                    .unwrap_or(false);
                if deleted_on_source {
                    self.preserve(&target, &record.item_id)?;
                    self.displaced.insert(record.item_id);
                    return Ok(Cleared::Free);
                }

                let resolution = self.resolver.resolve(
                    ConflictSide {
                        replica: self.source_replica,
                        record: incoming,
                    },
                    ConflictSide {
                        replica: self.destination_replica,
                        record: &record,
                    },
                );
                let mut conflict = ConflictRecord {
                    item_id: op.item_id,
                    path: relative.to_string(),
                    source_version: incoming.version.clone(),
                    destination_version: record.version.clone(),
                    winner: resolution.winner,
                    merged_version: resolution.merged.clone(),
                    recycled_to: None,
                };
                self.report.stats.conflicts += 1;

                if resolution.winner == Side::Destination {
                    self.settle_lost_collision(op, &record);
                    self.report.followups.push(record.item_id);
                    self.report.conflicts.push(conflict);
                    return Err(Skip::new(SkipReason::ConflictLoser).with_error(format!(
                        "{} is occupied by another item that won the conflict",
                        relative
                    )));
                }

                conflict.recycled_to = self.preserve(&target, &record.item_id)?;
                self.report.conflicts.push(conflict);
                record.mark_deleted(self.destination_replica, destination.next_tick());
                self.displaced.insert(record.item_id);
                self.destination_updates.push(StoreUpdate::Upsert(record));
                Ok(Cleared::Free)
            }
        }
    }

    /// Record on the destination that the incoming item lost its target path
    /// to `occupant`, so later passes do not raise the same conflict again.
    ///
    /// An item the destination already tracks stays where it is; an item new
    /// to the destination is written as a tombstone. Either way the record
    /// carries a vector covering the incoming change and the occupant.
    fn settle_lost_collision(&mut self, op: &Operation, occupant: &ItemMetadata) {
        let settled = op.merged.merged(&occupant.version);
        let record = match op.destination.as_ref().filter(|d| d.is_live()) {
            Some(current) => {
                let mut kept = current.clone();
                kept.version = settled;
                // The reverse pass carries the kept state back to the source
                self.report.followups.push(op.item_id);
                kept
            }
            None => {
                let mut lost = op.source.clone();
                lost.is_tombstone = true;
                lost.version = settled;
                lost
            }
        };
        tracing::debug!(
            "{} keeps {}; recording {} as settled",
            record.relative_path,
            occupant.item_id,
            op.item_id
        );
        self.destination_updates.push(StoreUpdate::Upsert(record));
    }

    fn adopt(&mut self, op: &Operation, occupant: ItemMetadata) -> Outcome {
        let merged = op.merged.merged(&occupant.version);
        tracing::debug!(
            "Destination already holds {} as {}, adopting",
            op.source.relative_path,
            occupant.item_id
        );

        let mut record = op.source.clone();
        record.version = merged.clone();
        record.fingerprint = occupant.fingerprint.clone();
        self.destination_updates.push(StoreUpdate::Remove(occupant.item_id));
        self.destination_updates.push(StoreUpdate::Upsert(record));

        let mut source_record = op.source.clone();
        source_record.version = merged;
        self.source_updates.push(StoreUpdate::Upsert(source_record));

        self.report.stats.adopted += 1;
        Outcome::Recorded
    }

    fn create_dir(
        &mut self,
        op: &Operation,
        source: &MetadataStore,
        destination: &mut MetadataStore,
    ) -> std::result::Result<Outcome, Skip> {
        let relative = op.source.relative_path.as_str();
        if let Cleared::Adopted(occupant) = self.clear_target(op, relative, true, source, destination)? {
            return Ok(self.adopt(op, occupant));
        }

        let target = self.destination_path(relative);
        self.fs
            .create_dir(&target)
            .map_err(|e| Skip::io(SkipReason::Io, &e))?;
        self.commit_written(op, relative);

        Ok(Outcome::Applied {
            change: Self::applied(op, ChangeType::Create, None, Some(relative)),
            recycled: None,
        })
    }

    fn create_file(
        &mut self,
        op: &Operation,
        source: &MetadataStore,
        destination: &mut MetadataStore,
    ) -> std::result::Result<Outcome, Skip> {
        let relative = op.source.relative_path.as_str();
        self.ensure_source(relative)?;
        if let Cleared::Adopted(occupant) = self.clear_target(op, relative, true, source, destination)? {
            return Ok(self.adopt(op, occupant));
        }

        let target = self.destination_path(relative);
        self.copy_from_source(relative, &target)?;
        self.commit_written(op, relative);

        Ok(Outcome::Applied {
            change: Self::applied(op, ChangeType::Create, None, Some(relative)),
            recycled: None,
        })
    }

    fn update(&mut self, op: &Operation) -> std::result::Result<Outcome, Skip> {
        let relative = op.source.relative_path.as_str();
        let target = self.destination_path(relative);
        self.ensure_source(relative)?;

        let recycled = self.preserve(&target, &op.item_id)?;
        if let Err(skip) = self.copy_from_source(relative, &target) {
            self.restore(recycled, &target);
            return Err(skip);
        }
        self.commit_written(op, relative);

        Ok(Outcome::Applied {
            change: Self::applied(op, ChangeType::Update, Some(relative), Some(relative)),
            recycled,
        })
    }

    fn rename(
        &mut self,
        op: &Operation,
        from: &str,
        content_changed: bool,
        source: &MetadataStore,
        destination: &mut MetadataStore,
    ) -> std::result::Result<Outcome, Skip> {
        let to = op.source.relative_path.as_str();
        let from_path = self.destination_path(from);
        let to_path = self.destination_path(to);

        if !self.fs.exists(&from_path) {
            tracing::debug!("{} is gone on the destination, copying {} instead", from, to);
            if op.source.kind.is_dir() {
                return self.create_dir(op, source, destination);
            }
            return self.create_file(op, source, destination);
        }
        if !op.source.kind.is_dir() {
            self.ensure_source(to)?;
        }
        self.clear_target(op, to, false, source, destination)?;

        let recycled = if content_changed {
            // The old bytes go to the recycle area, the new ones are copied in
            let recycled = self.preserve(&from_path, &op.item_id)?;
            if let Err(skip) = self.copy_from_source(to, &to_path) {
                self.restore(recycled, &from_path);
                return Err(skip);
            }
            recycled
        } else {
            self.fs
                .rename(&from_path, &to_path)
                .map_err(|e| Skip::io(SkipReason::Io, &e))?;
            None
        };

        self.vacated.insert(from.to_string());
        self.commit_written(op, to);

        Ok(Outcome::Applied {
            change: Self::applied(op, ChangeType::Rename, Some(from), Some(to)),
            recycled,
        })
    }

    fn delete(&mut self, op: &Operation) -> std::result::Result<Outcome, Skip> {
        let relative = op.destination_path().to_string();
        let target = self.destination_path(&relative);
        let kind = op.deleted_kind();

        let on_disk = match self.fs.metadata(&target) {
            Ok(metadata) => Some(metadata.is_dir()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(Skip::io(SkipReason::Io, &e)),
        };

        let gone = self.displaced.contains(&op.item_id) || on_disk.is_none();
        if gone || on_disk != Some(kind.is_dir()) {
            // Nothing of this item left to remove
            self.record(op);
            if !gone {
                return Ok(Outcome::Recorded);
            }
            self.vacated.insert(relative.clone());
            return Ok(Outcome::Applied {
                change: Self::applied(op, ChangeType::Delete, Some(&relative), None),
                recycled: None,
            });
        }

        let recycled = match kind {
            ItemKind::File => self.preserve(&target, &op.item_id)?,
            ItemKind::Directory => {
                let empty = self
                    .fs
                    .is_empty_dir(&target)
                    .map_err(|e| Skip::io(SkipReason::Io, &e))?;
                if !empty {
                    return Err(Skip::new(SkipReason::DirectoryNotEmpty));
                }
                self.fs
                    .remove_dir(&target)
                    .map_err(|e| Skip::io(SkipReason::Io, &e))?;
                None
            }
        };

        self.record(op);
        self.vacated.insert(relative.clone());
        Ok(Outcome::Applied {
            change: Self::applied(op, ChangeType::Delete, Some(&relative), None),
            recycled,
        })
    }
}

impl Skip {
    fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}
