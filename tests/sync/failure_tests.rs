// Tests for per-item failures, subscriptions and cancellation

use std::fs::{self, Metadata};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::common::{read, write_at, Replicas};
use twinsync::config::SyncConfig;
use twinsync::fs::{LocalFs, ReplicaFs};
use twinsync::sync::{ChangeType, SkipReason, SyncEvent, SyncSession};

/// Local filesystem that refuses to copy files whose name contains `poison`.
struct FailingFs {
    inner: LocalFs,
    poison: &'static str,
}

impl ReplicaFs for FailingFs {
    fn copy_file(&self, from: &Path, to: &Path) -> io::Result<u64> {
        let name = to.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        if name.contains(self.poison) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "injected failure"));
        }
        self.inner.copy_file(from, to)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.inner.rename(from, to)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.inner.remove_file(path)
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        self.inner.create_dir(path)
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        self.inner.remove_dir(path)
    }

    fn metadata(&self, path: &Path) -> io::Result<Metadata> {
        self.inner.metadata(path)
    }

    fn is_empty_dir(&self, path: &Path) -> io::Result<bool> {
        self.inner.is_empty_dir(path)
    }
}

fn failing_session(replicas: &Replicas) -> SyncSession {
    SyncSession::new(replicas.options(false), SyncConfig::default())
        .unwrap()
        .with_fs(Arc::new(FailingFs {
            inner: LocalFs,
            poison: "bad",
        }))
}

#[test]
fn test_copy_failure_is_skipped_and_reported() {
    let replicas = Replicas::new();
    write_at(&replicas.a().join("good.txt"), "good", 1);
    write_at(&replicas.a().join("bad.txt"), "bad", 2);

    let session = failing_session(&replicas);
    let (subscription, events) = session.bus().subscribe_channel();
    let report = session.run().unwrap();
    drop(subscription);

    assert_eq!(read(&replicas.b().join("good.txt")), "good");
    assert!(!replicas.b().join("bad.txt").exists());
    assert_eq!(report.stats.created, 1);
    assert_eq!(report.stats.skipped, 1);

    let skipped: Vec<_> = events
        .try_iter()
        .filter_map(|e| match e {
            SyncEvent::Skipped(skip) => Some(skip),
            SyncEvent::Applied(_) => None,
        })
        .collect();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].path, "bad.txt");
    assert_eq!(skipped[0].change_type, ChangeType::Create);
    assert_eq!(skipped[0].reason, SkipReason::Io);
    assert!(skipped[0].underlying_error.as_deref().unwrap().contains("injected failure"));
}

#[test]
fn test_skipped_item_is_retried_next_session() {
    let replicas = Replicas::new();
    write_at(&replicas.a().join("bad.txt"), "eventually", 1);
    failing_session(&replicas).run().unwrap();
    assert!(!replicas.b().join("bad.txt").exists());

    let report = replicas.one_way();

    assert_eq!(report.stats.created, 1);
    assert_eq!(read(&replicas.b().join("bad.txt")), "eventually");
}

#[test]
fn test_failed_update_restores_destination() {
    let replicas = Replicas::new();
    write_at(&replicas.a().join("bad.txt"), "v1", 1);
    replicas.one_way();

    write_at(&replicas.a().join("bad.txt"), "v2 bigger", 2);
    let report = failing_session(&replicas).run().unwrap();

    assert_eq!(report.stats.skipped, 1);
    assert_eq!(read(&replicas.b().join("bad.txt")), "v1");
}

#[test]
fn test_subscription_dropped_after_session() {
    let replicas = Replicas::new();
    write_at(&replicas.a().join("a.txt"), "a", 1);
    let session = SyncSession::new(replicas.options(false), SyncConfig::default()).unwrap();
    let seen = Arc::new(AtomicUsize::new(0));

    {
        let seen = Arc::clone(&seen);
        let _subscription = session.bus().subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(session.bus().subscriber_count(), 1);
        session.run().unwrap();
    }

    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(session.bus().subscriber_count(), 0);
}

#[test]
fn test_cancel_from_handler_stops_session() {
    let replicas = Replicas::new();
    for i in 0..5 {
        write_at(&replicas.a().join(format!("file{i}.txt")), "x", i);
    }
    let session = SyncSession::new(replicas.options(false), SyncConfig::default()).unwrap();
    let cancel = session.cancel_flag();
    let _subscription = session.bus().subscribe(move |_| cancel.cancel());

    assert!(session.run().is_err());
    let copied = fs::read_dir(replicas.b())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with("file"))
        .count();
    assert_eq!(copied, 1);
    assert!(!replicas.b().join(".twinsync/metadata.json").exists());
}
