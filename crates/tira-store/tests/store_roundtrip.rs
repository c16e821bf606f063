use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use tempfile::tempdir;
use tira_store::{
    program_hash, record_key, Outcome, ScheduleOutcome, StoreOptions, TiraError, TiraStore,
};

fn test_options() -> StoreOptions {
    StoreOptions {
        source_project: "test_project".into(),
        cpu_model: Some("TestCPU".into()),
        slurm_cpus: Some("4".into()),
        ..StoreOptions::default()
    }
}

fn open_store(dir: &Path) -> TiraStore {
    TiraStore::open(dir.join("test.db"), test_options()).expect("open store")
}

#[test]
fn record_and_lookup_round_trip() {
    let dir = tempdir().expect("tempdir");
    let store = open_store(dir.path());

    let wrote = store
        .record(
            "blur",
            "void blur() {}",
            "",
            &Outcome::legal(vec![0.042, 0.039, 0.041]),
            false,
        )
        .expect("record");
    assert!(wrote);

    let found = store
        .lookup("blur", "void blur() {}", "")
        .expect("lookup")
        .expect("record present");
    assert!(found.is_legal);
    assert_eq!(found.execution_times.as_deref(), Some(&[0.042, 0.039, 0.041][..]));
    assert_eq!(found.source_project, "test_project");
    assert!(!found.hostname.is_empty());
    assert!(!found.username.is_empty());
    assert_eq!(found.creation_date, found.update_date);
}

#[test]
fn lookup_missing_returns_none() {
    let dir = tempdir().expect("tempdir");
    let store = open_store(dir.path());
    let found = store
        .lookup("nonexistent", "code", "R(L0,comps=['c'])")
        .expect("lookup");
    assert!(found.is_none());
}

#[test]
fn illegal_outcome_needs_no_times() {
    let dir = tempdir().expect("tempdir");
    let store = open_store(dir.path());

    let wrote = store
        .record("bad", "code", "I(L0,L1,comps=['c'])", &Outcome::illegal(), false)
        .expect("record illegal");
    assert!(wrote);

    let found = store
        .lookup("bad", "code", "I(L0,L1,comps=['c'])")
        .expect("lookup")
        .expect("present");
    assert!(!found.is_legal);
    assert!(found.execution_times.is_none());
}

#[test]
fn legal_outcome_requires_nonempty_times() {
    let dir = tempdir().expect("tempdir");
    let store = open_store(dir.path());

    let missing = Outcome {
        is_legal: true,
        execution_times: None,
    };
    let err = store
        .record("p", "c", "", &missing, false)
        .expect_err("legal without times");
    assert!(matches!(err, TiraError::InvalidArgument(_)));

    let empty = Outcome::legal(vec![]);
    let err = store
        .record("p", "c", "", &empty, false)
        .expect_err("legal with empty times");
    assert!(matches!(err, TiraError::InvalidArgument(_)));
}

#[test]
fn non_finite_and_negative_times_are_rejected() {
    let dir = tempdir().expect("tempdir");
    let store = open_store(dir.path());
    for times in [vec![f64::NAN], vec![f64::INFINITY], vec![-0.5]] {
        let err = store
            .record("p", "c", "", &Outcome::legal(times), false)
            .expect_err("bad execution time");
        assert!(matches!(err, TiraError::InvalidArgument(_)));
    }
}

#[test]
fn invalid_schedule_fails_before_any_io() {
    let dir = tempdir().expect("tempdir");
    let store = TiraStore::open(
        dir.path().join("test.db"),
        StoreOptions {
            acquire_deadline: Some(Duration::from_secs(1)),
            ..test_options()
        },
    )
    .expect("open store");
    // A fresh foreign lock file would stall any envelope operation, so an
    // InvalidArgument (rather than LockUnavailable) proves validation ran
    // before locking.
    let lock_path = dir.path().join("test.db.lock");
    fs::write(&lock_path, b"{}").expect("foreign lock");

    let err = store
        .record("p", "c", "X(1)", &Outcome::illegal(), false)
        .expect_err("invalid schedule");
    assert!(matches!(err, TiraError::InvalidArgument(_)));
    fs::remove_file(&lock_path).expect("cleanup foreign lock");
    assert_eq!(store.count().expect("count"), 0);
}

#[test]
fn duplicate_record_is_not_overwritten_by_default() {
    let dir = tempdir().expect("tempdir");
    let store = open_store(dir.path());

    assert!(store
        .record("p", "c", "", &Outcome::illegal(), false)
        .expect("first"));
    let wrote = store
        .record("p", "c", "", &Outcome::legal(vec![0.1]), false)
        .expect("second");
    assert!(!wrote);

    let found = store.lookup("p", "c", "").expect("lookup").expect("present");
    assert!(!found.is_legal);
    assert_eq!(store.count().expect("count"), 1);
}

#[test]
fn overwrite_keeps_creation_date_and_refreshes_update_date() {
    let dir = tempdir().expect("tempdir");
    let store = open_store(dir.path());

    store
        .record("p", "src", "", &Outcome::legal(vec![0.1]), false)
        .expect("first write");
    let key = record_key(&program_hash("src"), "").expect("key");
    let before = store.get(&key).expect("row before");

    // Timestamps have second precision; make the refresh observable.
    thread::sleep(Duration::from_millis(1100));
    let wrote = store
        .record("p", "src", "", &Outcome::legal(vec![0.2]), true)
        .expect("overwrite");
    assert!(wrote);

    let after = store.get(&key).expect("row after");
    assert_eq!(after.creation_date, before.creation_date);
    assert!(after.update_date > after.creation_date);
    assert_eq!(after.result.execution_times.as_deref(), Some(&[0.2][..]));
    assert_eq!(store.count().expect("count"), 1);
}

#[test]
fn programs_are_deduplicated_by_normalized_source() {
    let dir = tempdir().expect("tempdir");
    let store = open_store(dir.path());

    // Cosmetically different spellings of one program.
    store
        .record("blur", "void blur() { }", "R(L0,comps=['a'])", &Outcome::illegal(), false)
        .expect("first");
    store
        .record(
            "blur",
            "// v2\nvoid blur() { }",
            "R(L0,comps=['b'])",
            &Outcome::illegal(),
            false,
        )
        .expect("second");

    assert_eq!(store.count().expect("count"), 2);
    assert_eq!(store.program_count().expect("programs"), 1);
}

#[test]
fn keys_are_sorted_and_paginated() {
    let dir = tempdir().expect("tempdir");
    let store = open_store(dir.path());

    for factor in 1..=5u64 {
        let schedule = format!("U(L0,{factor},comps=['c'])");
        store
            .record("p", "src", &schedule, &Outcome::illegal(), false)
            .expect("record");
    }

    let all = store.keys(0, 0).expect("all keys");
    assert_eq!(all.len(), 5);
    let mut sorted = all.clone();
    sorted.sort();
    assert_eq!(all, sorted);
    for key in &all {
        assert_eq!(key.len(), 64);
    }

    let page_one = store.keys(3, 0).expect("first page");
    let page_two = store.keys(3, 3).expect("second page");
    assert_eq!(page_one.len(), 3);
    assert_eq!(page_two.len(), 2);
    assert_eq!([&page_one[..], &page_two[..]].concat(), all);
}

#[test]
fn get_returns_the_joined_row() {
    let dir = tempdir().expect("tempdir");
    let store = open_store(dir.path());

    store
        .record("blur", "void blur() {}", "P(L0,comps=['c0'])", &Outcome::legal(vec![0.5]), false)
        .expect("record");
    let key = record_key(&program_hash("void blur() {}"), "P(L0,comps=['c0'])").expect("key");

    let row = store.get(&key).expect("get");
    assert_eq!(row.key, key);
    assert_eq!(row.program_name, "blur");
    assert_eq!(row.source_code, "void blur() {}");
    assert_eq!(row.schedule, "P(L0,comps=['c0'])");
    assert!(row.result.is_legal);
    assert_eq!(row.source_project, "test_project");
}

#[test]
fn get_missing_key_is_not_found() {
    let dir = tempdir().expect("tempdir");
    let store = open_store(dir.path());
    let err = store.get("0000").expect_err("missing key");
    assert!(matches!(err, TiraError::NotFound(_)));
}

#[test]
fn delete_removes_the_record_once() {
    let dir = tempdir().expect("tempdir");
    let store = open_store(dir.path());

    store
        .record("p", "c", "", &Outcome::illegal(), false)
        .expect("record");
    let key = store.keys(0, 0).expect("keys")[0].clone();

    store.delete(&key).expect("delete");
    assert_eq!(store.count().expect("count"), 0);
    let err = store.delete(&key).expect_err("already gone");
    assert!(matches!(err, TiraError::NotFound(_)));
    // Deleting the record leaves the program row in place.
    assert_eq!(store.program_count().expect("programs"), 1);
}

#[test]
fn contains_tracks_recorded_inputs() {
    let dir = tempdir().expect("tempdir");
    let store = open_store(dir.path());

    assert!(!store.contains("p", "c", "").expect("before"));
    store
        .record("p", "c", "", &Outcome::illegal(), false)
        .expect("record");
    assert!(store.contains("p", "c", "").expect("after"));
    // Equivalent schedule spelling hits the same record.
    assert!(store.contains("p", "c", "  ").expect("spelling"));
}

#[test]
fn stats_aggregate_outcomes_and_meta() {
    let dir = tempdir().expect("tempdir");
    let store = open_store(dir.path());

    store
        .record("p1", "c1", "R(L0,comps=['a'])", &Outcome::legal(vec![0.1]), false)
        .expect("legal record");
    store
        .record("p2", "c2", "R(L0,comps=['b'])", &Outcome::illegal(), false)
        .expect("illegal record");

    let stats = store.stats().expect("stats");
    assert_eq!(stats.total_records, 2);
    assert_eq!(stats.legal_records, 1);
    assert_eq!(stats.illegal_records, 1);
    assert_eq!(stats.total_programs, 2);
    assert_eq!(stats.source_projects, vec!["test_project".to_string()]);
    assert_eq!(stats.users.len(), 1);
    assert_eq!(stats.cpu_model.as_deref(), Some("TestCPU"));
    assert_eq!(stats.slurm_cpus.as_deref(), Some("4"));
}

#[test]
fn record_many_writes_a_batch() {
    let dir = tempdir().expect("tempdir");
    let store = open_store(dir.path());

    let entries = vec![
        ScheduleOutcome {
            schedule: "R(L0,comps=['a'])".into(),
            outcome: Outcome::legal(vec![0.1]),
        },
        ScheduleOutcome {
            schedule: "R(L0,comps=['b'])".into(),
            outcome: Outcome::illegal(),
        },
        ScheduleOutcome {
            schedule: "R(L0,comps=['c'])".into(),
            outcome: Outcome::legal(vec![0.3]),
        },
    ];
    let written = store
        .record_many("blur", "void blur() {}", &entries, false)
        .expect("batch");
    assert_eq!(written, 3);
    assert_eq!(store.count().expect("count"), 3);
    assert_eq!(store.program_count().expect("programs"), 1);
}

#[test]
fn record_many_skips_existing_keys_without_overwrite() {
    let dir = tempdir().expect("tempdir");
    let store = open_store(dir.path());

    store
        .record("blur", "src", "R(L0,comps=['a'])", &Outcome::illegal(), false)
        .expect("pre-existing");
    let entries = vec![
        ScheduleOutcome {
            schedule: "R(L0,comps=['a'])".into(),
            outcome: Outcome::legal(vec![0.9]),
        },
        ScheduleOutcome {
            schedule: "R(L0,comps=['b'])".into(),
            outcome: Outcome::illegal(),
        },
    ];
    let written = store
        .record_many("blur", "src", &entries, false)
        .expect("batch");
    assert_eq!(written, 1);
    assert_eq!(store.count().expect("count"), 2);

    let kept = store
        .lookup("blur", "src", "R(L0,comps=['a'])")
        .expect("lookup")
        .expect("present");
    assert!(!kept.is_legal);
}

#[test]
fn record_many_validates_everything_before_writing() {
    let dir = tempdir().expect("tempdir");
    let store = open_store(dir.path());

    let entries = vec![
        ScheduleOutcome {
            schedule: "R(L0,comps=['a'])".into(),
            outcome: Outcome::illegal(),
        },
        ScheduleOutcome {
            schedule: "X(L0)".into(),
            outcome: Outcome::illegal(),
        },
    ];
    let err = store
        .record_many("blur", "src", &entries, false)
        .expect_err("invalid entry");
    assert!(matches!(err, TiraError::InvalidArgument(_)));
    assert_eq!(store.count().expect("count"), 0);
}

#[test]
fn program_sources_and_records_by_program() {
    let dir = tempdir().expect("tempdir");
    let store = open_store(dir.path());

    store
        .record("blur", "void blur_v1() {}", "R(L0,comps=['a'])", &Outcome::illegal(), false)
        .expect("v1");
    store
        .record("blur", "void blur_v2() {}", "R(L0,comps=['a'])", &Outcome::illegal(), false)
        .expect("v2");
    store
        .record("edge", "void edge() {}", "R(L0,comps=['a'])", &Outcome::illegal(), false)
        .expect("edge");

    let sources = store.program_sources("blur").expect("sources");
    assert_eq!(sources.len(), 2);

    store
        .record("blur", "void blur_v1() {}", "R(L1,comps=['b'])", &Outcome::illegal(), false)
        .expect("second schedule");
    let records = store.program_records("void blur_v1() {}").expect("records");
    assert_eq!(records.len(), 2);
}

#[test]
fn two_instances_race_on_one_key() {
    let dir = tempdir().expect("tempdir");
    let first = open_store(dir.path());
    let second = TiraStore::open(dir.path().join("test.db"), test_options()).expect("second open");

    let a = first
        .record("p", "src", "", &Outcome::legal(vec![0.1]), false)
        .expect("first record");
    let b = second
        .record("p", "src", "", &Outcome::legal(vec![0.1]), false)
        .expect("second record");
    assert!(a);
    assert!(!b);
    assert_eq!(first.count().expect("count"), 1);
}

#[test]
fn concurrent_writers_produce_exactly_one_insert() {
    let dir = tempdir().expect("tempdir");
    // Create the database up front so workers only contend on the record.
    drop(open_store(dir.path()));

    let mut handles = Vec::new();
    for _ in 0..6 {
        let db_path = dir.path().join("test.db");
        handles.push(thread::spawn(move || {
            let store = TiraStore::open(db_path, test_options()).expect("open");
            store
                .record("p", "src", "", &Outcome::legal(vec![0.1]), false)
                .expect("record")
        }));
    }
    let outcomes: Vec<bool> = handles
        .into_iter()
        .map(|handle| handle.join().expect("worker"))
        .collect();

    assert_eq!(outcomes.iter().filter(|&&wrote| wrote).count(), 1);
    let store = open_store(dir.path());
    assert_eq!(store.count().expect("count"), 1);
}
