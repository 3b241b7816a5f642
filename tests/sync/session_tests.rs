// Tests for one-way and two-way sessions

use std::fs;

use crate::common::{read, run_collecting, write_at, Replicas};
use twinsync::config::SyncConfig;
use twinsync::sync::{ChangeType, MetadataStore, SyncEvent, VectorOrdering};

#[test]
fn test_one_way_copies_tree() {
    let replicas = Replicas::new();
    write_at(&replicas.a().join("top.txt"), "top", 1);
    write_at(&replicas.a().join("docs/guide/intro.md"), "# intro", 2);
    fs::create_dir(replicas.a().join("empty")).unwrap();

    let report = replicas.one_way();

    assert_eq!(read(&replicas.b().join("top.txt")), "top");
    assert_eq!(read(&replicas.b().join("docs/guide/intro.md")), "# intro");
    assert!(replicas.b().join("empty").is_dir());
    // top.txt, docs, docs/guide, intro.md, empty
    assert_eq!(report.stats.created, 5);
    assert_eq!(report.stats.skipped, 0);
}

#[test]
fn test_second_run_is_idempotent() {
    let replicas = Replicas::new();
    write_at(&replicas.a().join("a.txt"), "one", 1);
    write_at(&replicas.a().join("dir/b.txt"), "two", 2);
    replicas.one_way();

    let (report, events) = run_collecting(replicas.options(false), SyncConfig::default());

    assert_eq!(report.stats.applied(), 0);
    assert_eq!(report.source_changes, 0);
    assert_eq!(report.destination_changes, 0);
    assert!(events.is_empty());
}

#[test]
fn test_one_way_leaves_source_alone() {
    let replicas = Replicas::new();
    write_at(&replicas.a().join("a.txt"), "source", 1);
    write_at(&replicas.b().join("only-here.txt"), "destination", 2);

    replicas.one_way();

    assert!(!replicas.a().join("only-here.txt").exists());
    assert_eq!(read(&replicas.b().join("only-here.txt")), "destination");
    assert_eq!(read(&replicas.b().join("a.txt")), "source");
}

#[test]
fn test_two_way_converges() {
    let replicas = Replicas::new();
    write_at(&replicas.a().join("from-a.txt"), "a", 1);
    write_at(&replicas.b().join("nested/from-b.txt"), "b", 2);

    let report = replicas.two_way();

    assert_eq!(report.passes.len(), 2);
    for root in [replicas.a(), replicas.b()] {
        assert_eq!(read(&root.join("from-a.txt")), "a");
        assert_eq!(read(&root.join("nested/from-b.txt")), "b");
    }

    let again = replicas.two_way();
    assert_eq!(again.stats.applied(), 0);
}

#[test]
fn test_update_propagates() {
    let replicas = Replicas::new();
    write_at(&replicas.a().join("a.txt"), "v1", 1);
    replicas.one_way();

    write_at(&replicas.a().join("a.txt"), "v2 longer", 2);
    let (report, events) = run_collecting(replicas.options(false), SyncConfig::default());

    assert_eq!(report.stats.updated, 1);
    assert_eq!(read(&replicas.b().join("a.txt")), "v2 longer");
    assert!(matches!(
        events.as_slice(),
        [SyncEvent::Applied(change)] if change.change_type == ChangeType::Update
            && change.new_path.as_deref() == Some("a.txt")
    ));
}

#[test]
fn test_rename_moves_destination_file() {
    let replicas = Replicas::new();
    write_at(&replicas.a().join("old.txt"), "content", 1);
    replicas.one_way();

    fs::rename(replicas.a().join("old.txt"), replicas.a().join("new.txt")).unwrap();
    let (report, events) = run_collecting(replicas.options(false), SyncConfig::default());

    assert_eq!(report.stats.renamed, 1);
    assert_eq!(report.stats.bytes_copied, 0);
    assert!(!replicas.b().join("old.txt").exists());
    assert_eq!(read(&replicas.b().join("new.txt")), "content");
    match events.as_slice() {
        [SyncEvent::Applied(change)] => {
            assert_eq!(change.change_type, ChangeType::Rename);
            assert_eq!(change.old_path.as_deref(), Some("old.txt"));
            assert_eq!(change.new_path.as_deref(), Some("new.txt"));
        }
        other => panic!("unexpected events: {:?}", other),
    }
}

#[test]
fn test_delete_propagates_and_recycles() {
    let replicas = Replicas::new();
    write_at(&replicas.a().join("gone.txt"), "bye", 1);
    replicas.one_way();

    fs::remove_file(replicas.a().join("gone.txt")).unwrap();
    let report = replicas.one_way();

    assert_eq!(report.stats.deleted, 1);
    assert!(!replicas.b().join("gone.txt").exists());
    let recycle = replicas.b().join(".twinsync/recycle");
    let kept: Vec<_> = walk_files(&recycle);
    assert_eq!(kept.len(), 1);
    assert_eq!(read(&kept[0]), "bye");
}

#[test]
fn test_two_way_delete_from_destination() {
    let replicas = Replicas::new();
    write_at(&replicas.a().join("shared.txt"), "shared", 1);
    replicas.two_way();

    fs::remove_file(replicas.b().join("shared.txt")).unwrap();
    let report = replicas.two_way();

    assert_eq!(report.stats.deleted, 1);
    assert!(!replicas.a().join("shared.txt").exists());
}

#[test]
fn test_versions_only_grow() {
    let replicas = Replicas::new();
    let file = replicas.a().join("a.txt");
    write_at(&file, "1", 1);
    replicas.one_way();
    let first = version_of(replicas.a(), "a.txt");

    write_at(&file, "22", 2);
    replicas.one_way();
    let second = version_of(replicas.a(), "a.txt");

    write_at(&file, "333", 3);
    replicas.one_way();
    let third = version_of(replicas.a(), "a.txt");

    assert_eq!(second.compare(&first), VectorOrdering::Dominates);
    assert_eq!(third.compare(&second), VectorOrdering::Dominates);
    assert_eq!(version_of(replicas.b(), "a.txt"), third);
}

fn version_of(root: &std::path::Path, relative: &str) -> twinsync::sync::VersionVector {
    let store = MetadataStore::load(root).unwrap();
    store.live_at(relative).unwrap().version.clone()
}

fn walk_files(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            files.extend(walk_files(&path));
        } else {
            files.push(path);
        }
    }
    files
}
