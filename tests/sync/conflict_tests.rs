// Tests for concurrent changes and the recycle area

use crate::common::{config, read, run, run_collecting, write_at, Replicas};
use twinsync::sync::{
    ChangeType, ConflictStrategy, MetadataStore, RecycleBin, SkipReason, Side, SyncEvent,
};

#[test]
fn test_create_update_then_concurrent_conflict() {
    let replicas = Replicas::new();
    let strategy = config(ConflictStrategy::SourceWins);
    let file_a = replicas.a().join("a.txt");
    let file_b = replicas.b().join("a.txt");

    write_at(&file_a, "v1", 1);
    let (_, events) = run_collecting(replicas.options(false), strategy.clone());
    assert!(matches!(
        events.as_slice(),
        [SyncEvent::Applied(change)] if change.change_type == ChangeType::Create
    ));
    assert_eq!(read(&file_b), "v1");

    write_at(&file_a, "v2!", 2);
    let (_, events) = run_collecting(replicas.options(false), strategy.clone());
    assert!(matches!(
        events.as_slice(),
        [SyncEvent::Applied(change)] if change.change_type == ChangeType::Update
    ));
    assert_eq!(read(&file_b), "v2!");

    write_at(&file_a, "v3 from a", 3);
    write_at(&file_b, "v3 from b, longer", 4);
    let report = run(replicas.options(false), strategy);

    assert_eq!(report.conflicts(), 1);
    let conflict = &report.passes[0].conflicts[0];
    assert_eq!(conflict.winner, Side::Source);
    assert_eq!(read(&file_b), "v3 from a");

    let recycled = conflict.recycled_to.as_ref().expect("loser recycled");
    assert_eq!(read(recycled), "v3 from b, longer");
    let bin = RecycleBin::new(replicas.b());
    assert!(bin.versions(&conflict.item_id).unwrap().contains(recycled));

    // Both sides now share one merged version
    let store_a = MetadataStore::load(replicas.a()).unwrap();
    let store_b = MetadataStore::load(replicas.b()).unwrap();
    assert_eq!(
        store_a.get(&conflict.item_id).unwrap().version,
        store_b.get(&conflict.item_id).unwrap().version
    );
    assert_eq!(conflict.merged_version, store_a.get(&conflict.item_id).unwrap().version);
}

#[test]
fn test_destination_win_travels_back_in_two_way() {
    let replicas = Replicas::new();
    let strategy = config(ConflictStrategy::DestinationWins);
    write_at(&replicas.a().join("doc.txt"), "base", 1);
    run(replicas.options(true), strategy.clone());

    write_at(&replicas.a().join("doc.txt"), "edit on a", 2);
    write_at(&replicas.b().join("doc.txt"), "edit on b", 3);
    let (report, events) = run_collecting(replicas.options(true), strategy.clone());

    assert_eq!(report.conflicts(), 1);
    assert_eq!(read(&replicas.a().join("doc.txt")), "edit on b");
    assert_eq!(read(&replicas.b().join("doc.txt")), "edit on b");
    assert!(events.iter().any(|e| matches!(
        e,
        SyncEvent::Skipped(skip) if skip.reason == SkipReason::ConflictLoser
    )));

    // The losing edit is kept on the replica it was overwritten on
    let id = MetadataStore::load(replicas.a()).unwrap().id_at("doc.txt").unwrap();
    let kept: Vec<String> = RecycleBin::new(replicas.a())
        .versions(&id)
        .unwrap()
        .iter()
        .map(|p| read(p))
        .collect();
    assert!(kept.contains(&"edit on a".to_string()));

    let again = run(replicas.options(true), strategy);
    assert_eq!(again.stats.applied(), 0);
    assert_eq!(again.conflicts(), 0);
}

#[test]
fn test_largest_wins() {
    let replicas = Replicas::new();
    let strategy = config(ConflictStrategy::LargestWins);
    write_at(&replicas.a().join("x.txt"), "base", 1);
    run(replicas.options(false), strategy.clone());

    write_at(&replicas.a().join("x.txt"), "s", 2);
    write_at(&replicas.b().join("x.txt"), "the bigger edit", 3);
    let report = run(replicas.options(false), strategy);

    assert_eq!(report.passes[0].conflicts[0].winner, Side::Destination);
    assert_eq!(read(&replicas.b().join("x.txt")), "the bigger edit");
    assert_eq!(read(&replicas.a().join("x.txt")), "s");
}

#[test]
fn test_same_name_created_on_both_sides() {
    let replicas = Replicas::new();
    write_at(&replicas.a().join("notes.txt"), "from a", 1);
    write_at(&replicas.b().join("notes.txt"), "from b!", 2);

    let report = run(replicas.options(false), config(ConflictStrategy::SourceWins));

    assert_eq!(report.conflicts(), 1);
    assert_eq!(read(&replicas.b().join("notes.txt")), "from a");
    let recycled = report.passes[0].conflicts[0].recycled_to.clone().unwrap();
    assert_eq!(read(&recycled), "from b!");
}

#[test]
fn test_default_policy_conflict_is_settled_once() {
    let replicas = Replicas::new();
    let file_a = replicas.a().join("a.txt");
    let file_b = replicas.b().join("a.txt");

    write_at(&file_a, "v1", 1);
    replicas.one_way();
    write_at(&file_a, "v2!", 2);
    replicas.one_way();
    assert_eq!(read(&file_b), "v2!");

    write_at(&file_b, "v3 from b", 3);
    write_at(&file_a, "v3 from a, newer", 4);
    let report = replicas.one_way();

    assert_eq!(report.conflicts(), 1);
    assert_eq!(report.passes[0].conflicts[0].winner, Side::Source);
    assert_eq!(read(&file_b), "v3 from a, newer");

    let again = replicas.one_way();
    assert_eq!(again.conflicts(), 0);
    assert_eq!(again.stats.skipped, 0);
    assert_eq!(again.stats.applied(), 0);
}

#[test]
fn test_newest_edit_wins_whichever_side_is_source() {
    for (a_secs, b_secs, expected) in [(500, 2, "edit on a"), (2, 500, "edit on b")] {
        let replicas = Replicas::new();
        write_at(&replicas.a().join("doc.txt"), "base", 1);
        replicas.two_way();

        write_at(&replicas.b().join("doc.txt"), "edit on b", b_secs);
        write_at(&replicas.a().join("doc.txt"), "edit on a", a_secs);
        let report = replicas.two_way();

        assert_eq!(report.conflicts(), 1);
        assert_eq!(read(&replicas.a().join("doc.txt")), expected);
        assert_eq!(read(&replicas.b().join("doc.txt")), expected);
    }
}

#[test]
fn test_lost_name_collision_is_not_redetected() {
    let replicas = Replicas::new();
    write_at(&replicas.a().join("notes.txt"), "from a", 1);
    write_at(&replicas.b().join("notes.txt"), "from b!", 2);

    let first = replicas.one_way();
    assert_eq!(first.conflicts(), 1);
    assert_eq!(first.passes[0].conflicts[0].winner, Side::Destination);
    assert_eq!(first.stats.skipped, 1);
    assert_eq!(read(&replicas.b().join("notes.txt")), "from b!");
    assert_eq!(read(&replicas.a().join("notes.txt")), "from a");

    let second = replicas.one_way();
    assert_eq!(second.conflicts(), 0);
    assert_eq!(second.stats.skipped, 0);
    assert_eq!(read(&replicas.b().join("notes.txt")), "from b!");
}

#[test]
fn test_lost_name_collision_converges_in_two_way() {
    let replicas = Replicas::new();
    write_at(&replicas.a().join("notes.txt"), "from a", 1);
    write_at(&replicas.b().join("notes.txt"), "from b!", 2);

    let first = replicas.two_way();
    assert_eq!(first.passes[0].conflicts.len(), 1);
    assert_eq!(read(&replicas.a().join("notes.txt")), "from b!");
    assert_eq!(read(&replicas.b().join("notes.txt")), "from b!");

    let second = replicas.two_way();
    assert_eq!(second.conflicts(), 0);
    assert_eq!(second.stats.skipped, 0);
}
