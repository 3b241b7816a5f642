use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use tempfile::TempDir;
use twinsync::config::SyncConfig;
use twinsync::sync::{ConflictStrategy, SessionReport, SyncEvent, SyncOptions, SyncSession};

pub struct Replicas {
    pub a: TempDir,
    pub b: TempDir,
}

impl Replicas {
    pub fn new() -> Self {
        Self {
            a: tempfile::tempdir().unwrap(),
            b: tempfile::tempdir().unwrap(),
        }
    }

    pub fn a(&self) -> &Path {
        self.a.path()
    }

    pub fn b(&self) -> &Path {
        self.b.path()
    }

    pub fn options(&self, bothways: bool) -> SyncOptions {
        SyncOptions::new(self.a(), self.b()).bothways(bothways)
    }

    pub fn one_way(&self) -> SessionReport {
        run(self.options(false), SyncConfig::default())
    }

    pub fn two_way(&self) -> SessionReport {
        run(self.options(true), SyncConfig::default())
    }
}

pub fn config(strategy: ConflictStrategy) -> SyncConfig {
    SyncConfig {
        conflict_strategy: strategy,
        ..SyncConfig::default()
    }
}

pub fn run(options: SyncOptions, config: SyncConfig) -> SessionReport {
    SyncSession::new(options, config).unwrap().run().unwrap()
}

/// Run a session and collect every event it published.
pub fn run_collecting(options: SyncOptions, config: SyncConfig) -> (SessionReport, Vec<SyncEvent>) {
    let session = SyncSession::new(options, config).unwrap();
    let (subscription, events) = session.bus().subscribe_channel();
    let report = session.run().unwrap();
    drop(subscription);
    (report, events.try_iter().collect())
}

/// Write a file with a fixed mtime so size/mtime comparisons are deterministic.
pub fn write_at(path: &Path, content: &str, secs: u64) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000 + secs))
        .unwrap();
}

pub fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap()
}
