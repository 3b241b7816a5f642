//! Merge phase: turns the source change set into ordered operations.

use crate::sync::changes::{ChangeSet, ChangeType};
use crate::sync::conflict::{ConflictAction, ConflictResolver, ConflictSide, Resolution};
use crate::sync::filter::Filter;
use crate::sync::metadata::{ItemId, ItemKind, ItemMetadata};
use crate::sync::path_utils::depth;
use crate::sync::store::MetadataStore;
use crate::sync::version::{VectorOrdering, VersionVector};

/// What applying an operation does to the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Effect {
    CreateDir,
    CreateFile,
    Update,
    /// Move the destination item from `from`. When the content changed too
    /// the old bytes are recycled and the source content is copied instead.
    Rename { from: String, content_changed: bool },
    Delete,
    /// No filesystem change; only the merged record is written.
    Record,
    /// A conflict the destination won.
    KeepDestination,
}

#[derive(Debug, Clone)]
pub(crate) struct Operation {
    pub item_id: ItemId,
    /// Change type detected on the source.
    pub change_type: ChangeType,
    pub source: ItemMetadata,
    pub destination: Option<ItemMetadata>,
    pub effect: Effect,
    pub resolution: Option<Resolution>,
    /// Vector written back with the item; dominates or equals both inputs.
    pub merged: VersionVector,
    order: usize,
}

impl Operation {
    /// Apply phase: directory creates, renames, file writes, file deletes,
    /// directory deletes.
    fn phase(&self) -> u8 {
        match &self.effect {
            Effect::CreateDir => 0,
            Effect::Rename { .. } => 1,
            Effect::CreateFile | Effect::Update | Effect::Record | Effect::KeepDestination => 2,
            Effect::Delete => {
                if self.deleted_kind().is_dir() {
                    4
                } else {
                    3
                }
            }
        }
    }

    fn sort_key(&self) -> (u8, usize, usize) {
        let depth_key = match self.phase() {
            0 => depth(&self.source.relative_path),
            4 => usize::MAX - depth(self.destination_path()),
            _ => 0,
        };
        (self.phase(), depth_key, self.order)
    }

    /// Kind of the destination item a delete removes.
    pub fn deleted_kind(&self) -> ItemKind {
        self.destination.as_ref().map(|d| d.kind).unwrap_or(self.source.kind)
    }

    /// Current path of the item on the destination.
    pub fn destination_path(&self) -> &str {
        self.destination
            .as_ref()
            .filter(|d| d.is_live())
            .map(|d| d.relative_path.as_str())
            .unwrap_or(&self.source.relative_path)
    }
}

/// Ordered operations for one pass.
#[derive(Debug, Default)]
pub(crate) struct Plan {
    pub operations: Vec<Operation>,
    pub superseded: usize,
    pub filtered: usize,
}

/// Build the operations that bring the destination up to the source's
/// changes. Items that only changed on the destination are not considered.
pub(crate) fn build_plan(
    source: &MetadataStore,
    changes: &ChangeSet,
    destination: &MetadataStore,
    filter: &Filter,
    resolver: &ConflictResolver,
) -> Plan {
    let mut plan = Plan::default();

    // Detected changes first, then records a previous pass failed to apply
    let carried = source
        .all()
        .filter(|src| !changes.contains(&src.item_id))
        .filter(|src| behind(src, destination.get(&src.item_id)))
        .map(|src| (src.item_id, carried_change_type(src, destination.get(&src.item_id))));
    let candidates: Vec<(ItemId, ChangeType)> = changes
        .iter()
        .map(|change| (change.item_id, change.change_type))
        .chain(carried)
        .collect();

    for (order, (item_id, change_type)) in candidates.into_iter().enumerate() {
        let Some(src) = source.get(&item_id) else {
            tracing::debug!("No source record for {}, skipping", item_id);
            continue;
        };
        if !filter.matches_entry(&src.relative_path, src.kind.is_dir()) {
            plan.filtered += 1;
            continue;
        }

        let dest = destination.get(&item_id);
        let (effect, resolution) = match dest {
            None if src.is_tombstone => (Effect::Record, None),
            None => (create_effect(src), None),
            Some(d) => match src.version.compare(&d.version) {
                VectorOrdering::Equal | VectorOrdering::DominatedBy => {
                    tracing::debug!("{} is superseded on the destination", src.relative_path);
                    plan.superseded += 1;
                    continue;
                }
                VectorOrdering::Dominates => (dominating_effect(src, d), None),
                VectorOrdering::Concurrent if src.is_tombstone && d.is_tombstone => (Effect::Record, None),
                VectorOrdering::Concurrent if converged(src, d) => {
                    tracing::debug!("{} changed on both sides to the same content", src.relative_path);
                    (Effect::Record, None)
                }
                VectorOrdering::Concurrent => {
                    let resolution = resolver.resolve(
                        ConflictSide {
                            replica: source.replica_id(),
                            record: src,
                        },
                        ConflictSide {
                            replica: destination.replica_id(),
                            record: d,
                        },
                    );
                    let effect = match resolution.action {
                        ConflictAction::OverwriteDestination => dominating_effect(src, d),
                        ConflictAction::KeepDestination => Effect::KeepDestination,
                    };
                    (effect, Some(resolution))
                }
            },
        };

        let merged = match dest {
            Some(d) => src.version.merged(&d.version),
            None => src.version.clone(),
        };
        plan.operations.push(Operation {
            item_id,
            change_type,
            source: src.clone(),
            destination: dest.cloned(),
            effect,
            resolution,
            merged,
            order,
        });
    }

    plan.operations.sort_by_key(Operation::sort_key);
    tracing::debug!(
        "Planned {} operations ({} superseded, {} filtered)",
        plan.operations.len(),
        plan.superseded,
        plan.filtered
    );
    plan
}

/// Whether the destination lacks a source state that was never applied.
fn behind(src: &ItemMetadata, dest: Option<&ItemMetadata>) -> bool {
    match dest {
        None => src.is_live(),
        Some(d) => matches!(
            src.version.compare(&d.version),
            VectorOrdering::Dominates | VectorOrdering::Concurrent
        ),
    }
}

fn carried_change_type(src: &ItemMetadata, dest: Option<&ItemMetadata>) -> ChangeType {
    if src.is_tombstone {
        ChangeType::Delete
    } else if dest.map(|d| d.is_live()).unwrap_or(false) {
        ChangeType::Update
    } else {
        ChangeType::Create
    }
}

/// Concurrent changes that left both replicas with the same item at the same
/// path; only the vectors need merging.
fn converged(src: &ItemMetadata, dest: &ItemMetadata) -> bool {
    if !src.is_live() || !dest.is_live() || src.kind != dest.kind || src.relative_path != dest.relative_path {
        return false;
    }
    match src.kind {
        ItemKind::Directory => true,
        ItemKind::File => src.fingerprint.hash.is_some() && src.fingerprint.hash == dest.fingerprint.hash,
    }
}

fn create_effect(src: &ItemMetadata) -> Effect {
    match src.kind {
        ItemKind::Directory => Effect::CreateDir,
        ItemKind::File => Effect::CreateFile,
    }
}

/// Effect of applying `src` over a destination record it replaces.
fn dominating_effect(src: &ItemMetadata, dest: &ItemMetadata) -> Effect {
    if src.is_tombstone {
        return if dest.is_tombstone { Effect::Record } else { Effect::Delete };
    }
    if dest.is_tombstone || dest.kind != src.kind {
        return create_effect(src);
    }

    let content_changed = src.kind == ItemKind::File && !src.fingerprint.same_content(&dest.fingerprint);
    if dest.relative_path != src.relative_path {
        Effect::Rename {
            from: dest.relative_path.clone(),
            content_changed,
        }
    } else if content_changed {
        Effect::Update
    } else {
        Effect::Record
    }
}
