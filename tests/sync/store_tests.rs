// Tests for store persistence, corruption and locking

use std::fs;

use crate::common::{read, write_at, Replicas};
use twinsync::config::SyncConfig;
use twinsync::sync::{MetadataStore, SyncError, SyncSession};

#[test]
fn test_identity_survives_sessions() {
    let replicas = Replicas::new();
    write_at(&replicas.a().join("a.txt"), "a", 1);
    replicas.one_way();
    let before = MetadataStore::load(replicas.a()).unwrap().replica_id();

    replicas.one_way();
    let after = MetadataStore::load(replicas.a()).unwrap();

    assert_eq!(before, after.replica_id());
    assert_eq!(after.len(), 1);
}

#[test]
fn test_corrupt_store_is_rebuilt() {
    let replicas = Replicas::new();
    write_at(&replicas.a().join("a.txt"), "a", 1);
    replicas.one_way();

    fs::write(replicas.b().join(".twinsync/metadata.json"), "{ not json").unwrap();
    let report = replicas.one_way();

    // The file is already there with the same bytes, so it is adopted
    assert_eq!(report.stats.skipped, 0);
    assert_eq!(read(&replicas.b().join("a.txt")), "a");
    let a = MetadataStore::load(replicas.a()).unwrap();
    let b = MetadataStore::load(replicas.b()).unwrap();
    assert_eq!(a.id_at("a.txt"), b.id_at("a.txt"));
}

#[test]
fn test_locked_store_fails_session() {
    let replicas = Replicas::new();
    let _held = MetadataStore::load(replicas.b()).unwrap();

    let session = SyncSession::new(replicas.options(false), SyncConfig::default()).unwrap();
    let err = session.run().unwrap_err();

    assert!(matches!(err, SyncError::StoreLocked { .. }));
}

#[test]
fn test_failed_session_saves_nothing() {
    let replicas = Replicas::new();
    write_at(&replicas.a().join("a.txt"), "a", 1);

    let session = SyncSession::new(replicas.options(false), SyncConfig::default()).unwrap();
    session.cancel_flag().cancel();
    let err = session.run().unwrap_err();

    assert!(matches!(err, SyncError::Cancelled));
    assert!(!replicas.a().join(".twinsync/metadata.json").exists());
    assert!(!replicas.b().join(".twinsync/metadata.json").exists());
}
