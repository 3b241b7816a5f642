// Tests for include/exclude filtering across a session

use crate::common::{read, run, write_at, Replicas};
use twinsync::config::SyncConfig;
use twinsync::sync::MetadataStore;

#[test]
fn test_excluded_files_are_not_copied() {
    let replicas = Replicas::new();
    write_at(&replicas.a().join("keep.txt"), "keep", 1);
    write_at(&replicas.a().join("debug.log"), "noise", 2);
    write_at(&replicas.a().join("sub/trace.log"), "noise", 3);

    let report = run(replicas.options(false).exclude("*.log"), SyncConfig::default());

    assert_eq!(read(&replicas.b().join("keep.txt")), "keep");
    assert!(!replicas.b().join("debug.log").exists());
    assert!(!replicas.b().join("sub/trace.log").exists());
    assert_eq!(report.stats.skipped, 0);

    let store = MetadataStore::load(replicas.a()).unwrap();
    assert!(store.live_at("debug.log").is_none());
    assert!(store.live_at("sub/trace.log").is_none());
}

#[test]
fn test_excluded_destination_content_is_untouched() {
    let replicas = Replicas::new();
    write_at(&replicas.a().join("a.txt"), "a", 1);
    write_at(&replicas.b().join("local.log"), "mine", 2);

    run(replicas.options(true).exclude("*.log"), SyncConfig::default());

    assert_eq!(read(&replicas.b().join("local.log")), "mine");
    assert!(!replicas.a().join("local.log").exists());
    assert_eq!(read(&replicas.b().join("a.txt")), "a");
}

#[test]
fn test_include_limits_files_but_not_directories() {
    let replicas = Replicas::new();
    write_at(&replicas.a().join("docs/readme.md"), "# docs", 1);
    write_at(&replicas.a().join("docs/build.sh"), "make", 2);

    run(replicas.options(false).include("*.md"), SyncConfig::default());

    assert_eq!(read(&replicas.b().join("docs/readme.md")), "# docs");
    assert!(!replicas.b().join("docs/build.sh").exists());
}

#[test]
fn test_config_patterns_combine_with_options() {
    let replicas = Replicas::new();
    write_at(&replicas.a().join("target/out.bin"), "bin", 1);
    write_at(&replicas.a().join("scratch.tmp"), "tmp", 2);
    write_at(&replicas.a().join("src.rs"), "fn main() {}", 3);
    let config = SyncConfig {
        exclude: vec!["target".to_string()],
        ..SyncConfig::default()
    };

    run(replicas.options(false).exclude("*.tmp"), config);

    assert!(!replicas.b().join("target").exists());
    assert!(!replicas.b().join("scratch.tmp").exists());
    assert_eq!(read(&replicas.b().join("src.rs")), "fn main() {}");
}
