//! Two-way replica synchronization.
//!
//! Detection turns each replica's filesystem into version-tracked metadata;
//! the engine merges one replica's changes into the other and reports every
//! item on the notification bus.

pub mod bus;
pub mod changes;
pub mod conflict;
pub mod detector;
pub mod engine;
pub mod error;
pub mod filter;
pub mod hash;
pub mod metadata;
pub mod path_utils;
mod plan;
pub mod recycle;
pub mod session;
pub mod store;
pub mod version;

pub use bus::{AppliedChange, NotificationBus, SkipReason, SkippedChange, Subscription, SyncEvent};
pub use changes::{ChangeRecord, ChangeSet, ChangeType, DetectionSkip};
pub use conflict::{ConflictPolicy, ConflictRecord, ConflictResolver, ConflictStrategy, Side};
pub use detector::{detect_changes, ChangeDetector};
pub use engine::{CancelFlag, Replica, SyncDirection, SyncEngine, SyncReport, SyncState, SyncStats};
pub use error::{Result, SyncError};
pub use filter::Filter;
pub use metadata::{Fingerprint, ItemId, ItemKind, ItemMetadata};
pub use recycle::RecycleBin;
pub use session::{SessionReport, SyncOptions, SyncSession};
pub use store::{MetadataStore, StagedStore};
pub use version::{ReplicaId, VectorOrdering, VersionVector};
