//! Conflict resolution for concurrent changes.
//!
//! A conflict exists when the source and destination records of one item
//! carry concurrent version vectors. The resolver picks a winner through a
//! [`ConflictPolicy`] and returns the merged vector to write back with it, so
//! the resolved item never shows up as a conflict again.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::sync::metadata::{ItemId, ItemMetadata};
use crate::sync::version::{ReplicaId, VersionVector};

/// Strategy for choosing the winner of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// The most recent change wins (file mtime, or scan time for deletions);
    /// ties go to the lower replica id.
    #[default]
    LastDetectedWins,
    /// Always prefer the source of the pass.
    SourceWins,
    /// Always prefer the destination of the pass.
    DestinationWins,
    /// The larger file wins; equal sizes fall back to the detection time.
    LargestWins,
}

impl ConflictStrategy {
    /// Get a human-readable description of the strategy.
    pub fn description(&self) -> &'static str {
        match self {
            Self::LastDetectedWins => "Use the most recent change",
            Self::SourceWins => "Always use source",
            Self::DestinationWins => "Always use destination",
            Self::LargestWins => "Use the larger file",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::LastDetectedWins => "last-detected-wins",
            Self::SourceWins => "source-wins",
            Self::DestinationWins => "destination-wins",
            Self::LargestWins => "largest-wins",
        }
    }

    pub fn all() -> [ConflictStrategy; 4] {
        [
            Self::LastDetectedWins,
            Self::SourceWins,
            Self::DestinationWins,
            Self::LargestWins,
        ]
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .into_iter()
            .find(|strategy| strategy.name() == s)
            .ok_or_else(|| {
                let names: Vec<&str> = Self::all().iter().map(|s| s.name()).collect();
                format!("unknown conflict strategy '{}' (expected one of: {})", s, names.join(", "))
            })
    }
}

/// Which side of a pass an outcome refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Source,
    Destination,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Source => Side::Destination,
            Side::Destination => Side::Source,
        }
    }
}

/// One side of a conflict: the replica and its record of the item.
#[derive(Debug, Clone, Copy)]
pub struct ConflictSide<'a> {
    pub replica: ReplicaId,
    pub record: &'a ItemMetadata,
}

/// Decides which side of a conflict wins.
///
/// Implementations must be deterministic so that both passes of a two-way
/// session reach the same decision when sides are swapped.
pub trait ConflictPolicy: Send + Sync {
    fn choose(&self, source: &ConflictSide<'_>, destination: &ConflictSide<'_>) -> Side;
}

impl ConflictPolicy for ConflictStrategy {
    fn choose(&self, source: &ConflictSide<'_>, destination: &ConflictSide<'_>) -> Side {
        match self {
            Self::LastDetectedWins => last_detected(source, destination),
            Self::SourceWins => Side::Source,
            Self::DestinationWins => Side::Destination,
            Self::LargestWins => {
                let source_size = source.record.fingerprint.size;
                let destination_size = destination.record.fingerprint.size;
                if source_size == destination_size {
                    last_detected(source, destination)
                } else if source_size > destination_size {
                    Side::Source
                } else {
                    Side::Destination
                }
            }
        }
    }
}

fn last_detected(source: &ConflictSide<'_>, destination: &ConflictSide<'_>) -> Side {
    use std::cmp::Ordering;

    match source.record.detected_at.cmp(&destination.record.detected_at) {
        Ordering::Greater => Side::Source,
        Ordering::Less => Side::Destination,
        Ordering::Equal if source.replica <= destination.replica => Side::Source,
        Ordering::Equal => Side::Destination,
    }
}

/// What the engine has to do on the destination after a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictAction {
    /// Recycle the destination content and apply the source change.
    OverwriteDestination,
    /// Keep the destination content; only the merged vector is recorded.
    KeepDestination,
}

/// Outcome of resolving one conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub winner: Side,
    pub loser: Side,
    /// Component-wise max of both vectors; dominates each input.
    pub merged: VersionVector,
    pub action: ConflictAction,
}

/// A resolved conflict, as listed in the sync report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRecord {
    pub item_id: ItemId,
    pub path: String,
    pub source_version: VersionVector,
    pub destination_version: VersionVector,
    pub winner: Side,
    pub merged_version: VersionVector,
    /// Where the losing content was preserved, if it had to be moved.
    pub recycled_to: Option<PathBuf>,
}

/// Applies a [`ConflictPolicy`] to concurrent records.
pub struct ConflictResolver {
    policy: Box<dyn ConflictPolicy>,
}

impl fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictResolver").finish_non_exhaustive()
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(ConflictStrategy::default())
    }
}

impl ConflictResolver {
    /// Resolver for one of the built-in strategies.
    pub fn new(strategy: ConflictStrategy) -> Self {
        Self::with_policy(strategy)
    }

    /// Resolver for a custom policy.
    pub fn with_policy(policy: impl ConflictPolicy + 'static) -> Self {
        Self {
            policy: Box::new(policy),
        }
    }

    /// Resolve a conflict between the source and destination records.
    pub fn resolve(&self, source: ConflictSide<'_>, destination: ConflictSide<'_>) -> Resolution {
        let winner = self.policy.choose(&source, &destination);
        let merged = source.record.version.merged(&destination.record.version);
        let action = match winner {
            Side::Source => ConflictAction::OverwriteDestination,
            Side::Destination => ConflictAction::KeepDestination,
        };

        tracing::debug!(
            "Conflict on {}: source {} vs destination {}, {:?} wins",
            destination.record.relative_path,
            source.record.version,
            destination.record.version,
            winner
        );

        Resolution {
            winner,
            loser: winner.other(),
            merged,
            action,
        }
    }
}
