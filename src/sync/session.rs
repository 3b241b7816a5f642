//! One synchronization session between two replica roots.
//!
//! A session validates the roots, opens and locks both stores, detects the
//! changes of both replicas, runs one pass (or two for `bothways`) and saves
//! both stores once at the end. A failed or cancelled session saves nothing.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::config::SyncConfig;
use crate::fs::{LocalFs, ReplicaFs};
use crate::sync::bus::NotificationBus;
use crate::sync::changes::{ChangeRecord, ChangeSet, ChangeType, DetectionSkip};
use crate::sync::conflict::ConflictResolver;
use crate::sync::detector::detect_changes;
use crate::sync::engine::{CancelFlag, Replica, SyncDirection, SyncEngine, SyncReport, SyncStats};
use crate::sync::error::{Result, SyncError};
use crate::sync::filter::Filter;
use crate::sync::metadata::ItemId;
use crate::sync::path_utils::try_canonicalize;
use crate::sync::store::MetadataStore;

/// What the caller asked for.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub from: PathBuf,
    pub to: PathBuf,
    pub bothways: bool,
    pub include: Option<String>,
    pub exclude: Option<String>,
}

impl SyncOptions {
    pub fn new(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            ..Self::default()
        }
    }

    pub fn bothways(mut self, bothways: bool) -> Self {
        self.bothways = bothways;
        self
    }

    pub fn include(mut self, pattern: impl Into<String>) -> Self {
        self.include = Some(pattern.into());
        self
    }

    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude = Some(pattern.into());
        self
    }

    pub fn direction(&self) -> SyncDirection {
        if self.bothways {
            SyncDirection::TwoWay
        } else {
            SyncDirection::OneWay
        }
    }
}

/// Result of a whole session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    /// One report per pass, in execution order.
    pub passes: Vec<SyncReport>,
    /// Detection problems on the source and destination replicas.
    pub detection_skips: Vec<DetectionSkip>,
    pub source_changes: usize,
    pub destination_changes: usize,
    pub stats: SyncStats,
}

impl SessionReport {
    pub fn conflicts(&self) -> usize {
        self.passes.iter().map(|p| p.conflicts.len()).sum()
    }
}

pub struct SyncSession {
    options: SyncOptions,
    filter: Filter,
    config: SyncConfig,
    fs: Arc<dyn ReplicaFs>,
    bus: NotificationBus,
    cancel: CancelFlag,
}

impl SyncSession {
    /// Build a session. Patterns from the options are added to those of the
    /// configuration.
    pub fn new(options: SyncOptions, config: SyncConfig) -> Result<Self> {
        let include = config.include.iter().cloned().chain(options.include.clone());
        let exclude = config.exclude.iter().cloned().chain(options.exclude.clone());
        let filter = Filter::from_patterns(include, exclude)?;

        Ok(Self {
            options,
            filter,
            config,
            fs: Arc::new(LocalFs),
            bus: NotificationBus::new(),
            cancel: CancelFlag::new(),
        })
    }

    /// Route destination mutations through another filesystem.
    pub fn with_fs(mut self, fs: Arc<dyn ReplicaFs>) -> Self {
        self.fs = fs;
        self
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Check both roots before any work is done.
    pub fn validate(&self) -> Result<()> {
        for root in [&self.options.from, &self.options.to] {
            check_root(root)?;
        }

        let from = try_canonicalize(&self.options.from);
        let to = try_canonicalize(&self.options.to);
        if from == to {
            return Err(SyncError::SameRoot { path: from });
        }
        Ok(())
    }

    fn engine(&self) -> SyncEngine {
        SyncEngine::new(ConflictResolver::new(self.config.conflict_strategy), self.filter.clone())
            .with_fs(Arc::clone(&self.fs))
            .with_bus(self.bus.clone())
            .with_cancel_flag(self.cancel.clone())
    }

    /// Run the session to completion.
    pub fn run(&self) -> Result<SessionReport> {
        let started = Instant::now();
        self.validate()?;
        let (from, to) = (&self.options.from, &self.options.to);

        let mut source = MetadataStore::load(from)?;
        let mut destination = MetadataStore::load(to)?;

        // Both replicas are scanned before anything is applied
        let source_changes = detect_changes(from, &self.filter, &mut source)?;
        let mut destination_changes = detect_changes(to, &self.filter, &mut destination)?;
        let mut report = SessionReport {
            passes: Vec::new(),
            detection_skips: source_changes
                .skipped
                .iter()
                .chain(&destination_changes.skipped)
                .cloned()
                .collect(),
            source_changes: source_changes.len(),
            destination_changes: destination_changes.len(),
            stats: SyncStats::default(),
        };

        let direction = self.options.direction();
        let mut engine = self.engine();
        let forward = engine.synchronize(
            Replica::new(&mut source, &source_changes),
            Replica::new(&mut destination, &destination_changes),
            direction,
        )?;

        if direction == SyncDirection::TwoWay {
            queue_followups(&mut destination_changes, &destination, &forward.followups);
            report.passes.push(forward);

            let backward = engine.synchronize(
                Replica::new(&mut destination, &destination_changes),
                Replica::new(&mut source, &source_changes),
                direction,
            )?;
            report.passes.push(backward);
        } else {
            report.passes.push(forward);
        }

        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        // Both stores are written out before either replaces its old file
        let staged = [source.stage()?, destination.stage()?];
        for store in staged {
            store.commit()?;
        }

        for pass in &report.passes {
            report.stats.absorb(&pass.stats);
        }
        report.stats.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            "Session {} -> {} finished: {} applied, {} skipped, {} conflicts",
            from.display(),
            to.display(),
            report.stats.applied(),
            report.stats.skipped,
            report.conflicts()
        );
        Ok(report)
    }
}

fn check_root(root: &Path) -> Result<()> {
    match std::fs::metadata(root) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(SyncError::NotADirectory {
            path: root.to_path_buf(),
        }),
        Err(_) => Err(SyncError::RootNotFound {
            path: root.to_path_buf(),
        }),
    }
}

/// Make the reverse pass carry items the destination won.
fn queue_followups(changes: &mut ChangeSet, store: &MetadataStore, followups: &[ItemId]) {
    for id in followups {
        if changes.contains(id) {
            continue;
        }
        if let Some(record) = store.get(id) {
            let change_type = if record.is_tombstone {
                ChangeType::Delete
            } else {
                ChangeType::Update
            };
            changes.push(ChangeRecord::from_item(change_type, record, None));
        }
    }
}
