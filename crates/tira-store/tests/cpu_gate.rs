use std::path::Path;

use tempfile::tempdir;
use tira_store::{Outcome, StoreOptions, TiraError, TiraStore};

fn options(cpu: &str, slurm: &str) -> StoreOptions {
    StoreOptions {
        source_project: "gate_test".into(),
        cpu_model: Some(cpu.into()),
        slurm_cpus: Some(slurm.into()),
        ..StoreOptions::default()
    }
}

fn create_db(dir: &Path, cpu: &str, slurm: &str) -> TiraStore {
    let store = TiraStore::open(dir.join("test.db"), options(cpu, slurm)).expect("create");
    store
        .record("p", "src", "", &Outcome::illegal(), false)
        .expect("seed record");
    store
}

#[test]
fn cpu_mismatch_blocks_writes_but_not_reads() {
    let dir = tempdir().expect("tempdir");
    create_db(dir.path(), "Intel Xeon Gold 6248", "8");

    let store = TiraStore::open(dir.path().join("test.db"), options("AMD EPYC 7742", "8"))
        .expect("open mismatched");
    assert!(!store.writes_allowed());

    let found = store.lookup("p", "src", "").expect("lookup");
    assert!(found.is_some());
    assert_eq!(store.count().expect("count"), 1);

    let err = store
        .record("p2", "src2", "", &Outcome::illegal(), false)
        .expect_err("gated write");
    assert!(matches!(err, TiraError::ReadOnlyConnection(_)));
}

#[test]
fn delete_is_gated_too() {
    let dir = tempdir().expect("tempdir");
    create_db(dir.path(), "CPU_A", "4");

    let store =
        TiraStore::open(dir.path().join("test.db"), options("CPU_B", "4")).expect("open");
    let key = store.keys(0, 0).expect("keys")[0].clone();
    let err = store.delete(&key).expect_err("gated delete");
    assert!(matches!(err, TiraError::ReadOnlyConnection(_)));
}

#[test]
fn slurm_mismatch_alone_closes_the_gate() {
    let dir = tempdir().expect("tempdir");
    create_db(dir.path(), "CPU_A", "8");

    let store =
        TiraStore::open(dir.path().join("test.db"), options("CPU_A", "16")).expect("open");
    assert!(!store.writes_allowed());
}

#[test]
fn stored_na_slurm_matches_anything() {
    let dir = tempdir().expect("tempdir");
    create_db(dir.path(), "CPU_A", "N/A");

    let store =
        TiraStore::open(dir.path().join("test.db"), options("CPU_A", "32")).expect("open");
    assert!(store.writes_allowed());
}

#[test]
fn allow_cpu_mismatch_overrides_the_gate() {
    let dir = tempdir().expect("tempdir");
    create_db(dir.path(), "CPU_A", "4");

    let store = TiraStore::open(
        dir.path().join("test.db"),
        StoreOptions {
            allow_cpu_mismatch: true,
            ..options("CPU_B", "4")
        },
    )
    .expect("open with override");
    assert!(store.writes_allowed());
    store
        .record("p2", "src2", "", &Outcome::illegal(), false)
        .expect("override write");
}

#[test]
fn matching_profile_keeps_writes_enabled() {
    let dir = tempdir().expect("tempdir");
    create_db(dir.path(), "CPU_A", "4");

    let store =
        TiraStore::open(dir.path().join("test.db"), options("CPU_A", "4")).expect("open");
    assert!(store.writes_allowed());
    assert_eq!(store.cpu_model(), "CPU_A");
    assert_eq!(store.slurm_cpus(), "4");
}

#[test]
fn foreign_schema_version_is_rejected() {
    let dir = tempdir().expect("tempdir");
    create_db(dir.path(), "CPU_A", "4");

    let conn = rusqlite::Connection::open(dir.path().join("test.db")).expect("raw open");
    conn.execute(
        "UPDATE db_meta SET value = '99' WHERE key = 'schema_version'",
        [],
    )
    .expect("tamper version");
    drop(conn);

    let err = TiraStore::open(dir.path().join("test.db"), options("CPU_A", "4"))
        .expect_err("incompatible schema");
    assert!(matches!(err, TiraError::SchemaIncompatible(_)));
}
