//! The `TiraStore` handle and its per-operation transactional envelope.
//!
//! Engine-level locking cannot be trusted on the target filesystem, so no
//! connection outlives a single call. Every public operation validates its
//! arguments, consults the CPU gate when it mutates, takes the hard-link
//! mutex, opens a fresh connection, runs exactly one transaction, and
//! releases everything — in that order, on every exit path. The instance
//! itself is only configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tira_core::canon::{CanonObject, CanonValue};
use tira_core::errors::{ErrorInfo, TiraError};
use tira_core::provenance::MachineProfile;
use tira_schedule::normalize_schedule;
use tracing::warn;

use crate::export::{write_export, ExportFormat};
use crate::keys;
use crate::lock::{HardLinkMutex, LockGuard, DEFAULT_STALE_LOCK_TIMEOUT};
use crate::meta::{self, DbMeta};
use crate::schema::{self, NewRecord, ProgramSource, RawRecord, StoreStats};

/// Default bound on lock acquisition; generous enough that any stale lock
/// is reclaimed well within it.
pub const DEFAULT_ACQUIRE_DEADLINE: Duration = Duration::from_secs(600);

/// Configuration for [`TiraStore::open`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Project label stamped onto every record this instance writes.
    pub source_project: String,
    /// CPU model override; auto-detected when `None`.
    pub cpu_model: Option<String>,
    /// `SLURM_CPUS_PER_TASK` override; read from the environment when `None`.
    pub slurm_cpus: Option<String>,
    /// Allow writes even when the local CPU profile differs from the
    /// database's.
    pub allow_cpu_mismatch: bool,
    /// Age after which a lock file is assumed abandoned.
    pub stale_lock_timeout: Duration,
    /// Bound on every lock acquisition; `None` blocks indefinitely.
    pub acquire_deadline: Option<Duration>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            source_project: String::new(),
            cpu_model: None,
            slurm_cpus: None,
            allow_cpu_mismatch: false,
            stale_lock_timeout: DEFAULT_STALE_LOCK_TIMEOUT,
            acquire_deadline: Some(DEFAULT_ACQUIRE_DEADLINE),
        }
    }
}

/// One measurement outcome for a (program, schedule) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    /// Whether the scheduled program passed legality checking.
    pub is_legal: bool,
    /// Measured wall times in seconds. Required and non-empty when
    /// `is_legal` is true.
    #[serde(default)]
    pub execution_times: Option<Vec<f64>>,
}

impl Outcome {
    /// A legal outcome with the given execution times.
    pub fn legal(execution_times: Vec<f64>) -> Self {
        Self {
            is_legal: true,
            execution_times: Some(execution_times),
        }
    }

    /// An illegal outcome (no measurements).
    pub fn illegal() -> Self {
        Self {
            is_legal: false,
            execution_times: None,
        }
    }
}

/// One schedule with its outcome, for [`TiraStore::record_many`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleOutcome {
    /// Raw schedule string; normalised before storage.
    pub schedule: String,
    /// Measurement outcome for that schedule.
    pub outcome: Outcome,
}

/// A found record, as returned by [`TiraStore::lookup`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupResult {
    /// Whether the scheduled program passed legality checking.
    pub is_legal: bool,
    /// Measured wall times, when legal.
    pub execution_times: Option<Vec<f64>>,
    /// Normalised schedule string as stored.
    pub schedule: String,
    /// Node that wrote the record.
    pub hostname: String,
    /// User that wrote the record.
    pub username: String,
    /// First write timestamp.
    pub creation_date: String,
    /// Last write timestamp.
    pub update_date: String,
    /// Project label of the writer.
    pub source_project: String,
}

/// A full records×programs join row with the outcome decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordRow {
    /// Content-addressed record key.
    pub key: String,
    /// Hash of the normalised program source.
    pub program_hash: String,
    /// Program label.
    pub program_name: String,
    /// Verbatim program source.
    pub source_code: String,
    /// Normalised schedule string.
    pub schedule: String,
    /// Decoded measurement outcome.
    pub result: Outcome,
    /// Node that wrote the record.
    pub hostname: String,
    /// User that wrote the record.
    pub username: String,
    /// First write timestamp.
    pub creation_date: String,
    /// Last write timestamp.
    pub update_date: String,
    /// Project label of the writer.
    pub source_project: String,
}

/// Shared content-addressed lookup table for autoscheduler measurements.
///
/// One database file is used concurrently by many processes on many nodes;
/// see the module documentation for the locking discipline. Instances are
/// cheap: they hold configuration and the machine profile, never an open
/// connection.
#[derive(Debug)]
pub struct TiraStore {
    db_path: PathBuf,
    mutex: HardLinkMutex,
    source_project: String,
    acquire_deadline: Option<Duration>,
    profile: MachineProfile,
    db_meta: DbMeta,
    writes_allowed: bool,
}

impl TiraStore {
    /// Opens (creating if necessary) the database at `db_path`.
    ///
    /// A new database records the local CPU profile; an existing one is
    /// checked against it, and a mismatch demotes this instance to
    /// read-only unless `allow_cpu_mismatch` is set. An existing database
    /// with a foreign schema version fails with `SchemaIncompatible`.
    pub fn open(db_path: impl AsRef<Path>, options: StoreOptions) -> Result<Self, TiraError> {
        let db_path = db_path.as_ref().to_path_buf();
        ensure_parent_dir(&db_path)?;
        let mutex = HardLinkMutex::new(lock_path_for(&db_path), options.stale_lock_timeout);
        let profile = MachineProfile::capture(options.cpu_model, options.slurm_cpus);

        let (db_meta, created) = {
            let _guard = mutex.acquire(options.acquire_deadline)?;
            let mut conn = schema::open_connection(&db_path)?;
            let tx = begin(&mut conn)?;
            let (db_meta, created) = match meta::read_meta(&tx)? {
                Some(existing) => (existing, false),
                None => {
                    schema::create_tables(&tx)?;
                    let fresh = DbMeta::initial(&profile);
                    meta::write_meta(&tx, &fresh)?;
                    (fresh, true)
                }
            };
            commit(tx)?;
            (db_meta, created)
        };
        if created {
            set_world_writable(&db_path);
        }

        let gate = meta::evaluate_gate(&db_meta, &profile);
        let writes_allowed = gate.matches() || options.allow_cpu_mismatch;
        if !writes_allowed {
            warn!(
                db = %db_path.display(),
                mismatches = %gate.mismatches.join("; "),
                "CPU profile differs from database metadata; writes disabled \
                 (set allow_cpu_mismatch to override)"
            );
        }

        Ok(Self {
            db_path,
            mutex,
            source_project: options.source_project,
            acquire_deadline: options.acquire_deadline,
            profile,
            db_meta,
            writes_allowed,
        })
    }

    /// Stores one measurement. Returns whether a write occurred (`false`
    /// when the key already exists and `overwrite` is unset).
    pub fn record(
        &self,
        program_name: &str,
        program_source: &str,
        schedule: &str,
        outcome: &Outcome,
        overwrite: bool,
    ) -> Result<bool, TiraError> {
        let result_json = encode_outcome(outcome)?;
        let normalized = normalize_schedule(schedule)?;
        self.ensure_writable()?;
        let program_hash = keys::program_hash(program_source);
        let key = keys::record_key_from_normalized(&program_hash, &normalized)?;
        self.with_transaction(|conn| {
            schema::upsert_program(conn, &program_hash, program_name, program_source)?;
            schema::upsert_record(
                conn,
                &NewRecord {
                    key: &key,
                    program_hash: &program_hash,
                    schedule: &normalized,
                    result_json: &result_json,
                    hostname: &self.profile.hostname,
                    username: &self.profile.username,
                    source_project: &self.source_project,
                },
                overwrite,
            )
        })
    }

    /// Stores many schedules for one program in a single transaction.
    ///
    /// Every entry is validated before anything is written; one bad entry
    /// fails the whole batch without touching the filesystem. Returns the
    /// number of records actually written.
    pub fn record_many(
        &self,
        program_name: &str,
        program_source: &str,
        entries: &[ScheduleOutcome],
        overwrite: bool,
    ) -> Result<usize, TiraError> {
        let program_hash = keys::program_hash(program_source);
        let mut prepared = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            let result_json = encode_outcome(&entry.outcome).map_err(|err| {
                TiraError::InvalidArgument(
                    ErrorInfo::new("tira_store.record_many", err.info().message.clone())
                        .with("entry", index.to_string()),
                )
            })?;
            let normalized = normalize_schedule(&entry.schedule).map_err(|err| {
                TiraError::InvalidArgument(
                    ErrorInfo::new("tira_store.record_many", err.info().message.clone())
                        .with("entry", index.to_string()),
                )
            })?;
            let key = keys::record_key_from_normalized(&program_hash, &normalized)?;
            prepared.push((key, normalized, result_json));
        }
        self.ensure_writable()?;
        self.with_transaction(|conn| {
            schema::upsert_program(conn, &program_hash, program_name, program_source)?;
            let mut written = 0;
            for (key, normalized, result_json) in &prepared {
                let wrote = schema::upsert_record(
                    conn,
                    &NewRecord {
                        key,
                        program_hash: &program_hash,
                        schedule: normalized,
                        result_json,
                        hostname: &self.profile.hostname,
                        username: &self.profile.username,
                        source_project: &self.source_project,
                    },
                    overwrite,
                )?;
                if wrote {
                    written += 1;
                }
            }
            Ok(written)
        })
    }

    /// Looks up a previously recorded measurement, or `None`.
    pub fn lookup(
        &self,
        _program_name: &str,
        program_source: &str,
        schedule: &str,
    ) -> Result<Option<LookupResult>, TiraError> {
        let program_hash = keys::program_hash(program_source);
        let key = keys::record_key(&program_hash, schedule)?;
        let row = self.with_transaction(|conn| schema::get_record(conn, &key))?;
        row.map(lookup_result_from_raw).transpose()
    }

    /// Whether a record exists for the given inputs.
    pub fn contains(
        &self,
        _program_name: &str,
        program_source: &str,
        schedule: &str,
    ) -> Result<bool, TiraError> {
        let program_hash = keys::program_hash(program_source);
        let key = keys::record_key(&program_hash, schedule)?;
        self.with_transaction(|conn| schema::record_exists(conn, &key))
    }

    /// Fetches the full joined row for a raw record key.
    pub fn get(&self, key: &str) -> Result<RecordRow, TiraError> {
        let row = self.with_transaction(|conn| schema::get_record(conn, key))?;
        match row {
            Some(raw) => record_row_from_raw(raw),
            None => Err(not_found(key)),
        }
    }

    /// Low-level insert/update by raw key (admin use). The referenced
    /// program must already exist in the programs table.
    pub fn put(
        &self,
        key: &str,
        program_hash: &str,
        schedule: &str,
        outcome: &Outcome,
        overwrite: bool,
    ) -> Result<bool, TiraError> {
        let result_json = encode_outcome(outcome)?;
        self.ensure_writable()?;
        self.with_transaction(|conn| {
            schema::upsert_record(
                conn,
                &NewRecord {
                    key,
                    program_hash,
                    schedule,
                    result_json: &result_json,
                    hostname: &self.profile.hostname,
                    username: &self.profile.username,
                    source_project: &self.source_project,
                },
                overwrite,
            )
        })
    }

    /// Deletes a record by key. Orphaned program rows are left in place;
    /// the workload is append-heavy and compaction is an offline concern.
    pub fn delete(&self, key: &str) -> Result<(), TiraError> {
        self.ensure_writable()?;
        let deleted = self.with_transaction(|conn| schema::delete_record(conn, key))?;
        if deleted {
            Ok(())
        } else {
            Err(not_found(key))
        }
    }

    /// Total number of records.
    pub fn count(&self) -> Result<u64, TiraError> {
        self.with_transaction(schema::count_records)
    }

    /// Total number of distinct programs.
    pub fn program_count(&self) -> Result<u64, TiraError> {
        self.with_transaction(schema::count_programs)
    }

    /// Summary statistics for the whole database.
    pub fn stats(&self) -> Result<StoreStats, TiraError> {
        self.with_transaction(schema::stats)
    }

    /// Record keys ordered ascending; `limit = 0` means all.
    pub fn keys(&self, limit: u64, offset: u64) -> Result<Vec<String>, TiraError> {
        self.with_transaction(|conn| schema::record_keys(conn, limit, offset))
    }

    /// Every stored source version carrying the given program name.
    pub fn program_sources(&self, program_name: &str) -> Result<Vec<ProgramSource>, TiraError> {
        self.with_transaction(|conn| schema::programs_by_name(conn, program_name))
    }

    /// Every record stored for the given program source.
    pub fn program_records(&self, program_source: &str) -> Result<Vec<LookupResult>, TiraError> {
        let program_hash = keys::program_hash(program_source);
        let rows = self.with_transaction(|conn| schema::records_by_program(conn, &program_hash))?;
        rows.into_iter().map(lookup_result_from_raw).collect()
    }

    /// Copies the database file while holding the lock.
    ///
    /// Without an explicit destination a timestamped sibling of the
    /// database file is created. Returns the backup path.
    pub fn backup(&self, backup_path: Option<&Path>) -> Result<PathBuf, TiraError> {
        let dest = match backup_path {
            Some(path) => path.to_path_buf(),
            None => {
                let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
                let stem = self
                    .db_path
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "store".to_string());
                self.db_path.with_file_name(format!("{stem}_{stamp}.db"))
            }
        };
        let _guard = self.acquire()?;
        fs::copy(&self.db_path, &dest).map_err(|err| {
            TiraError::Io(
                ErrorInfo::new("tira_store.backup", "failed to copy database file")
                    .with("from", self.db_path.display().to_string())
                    .with("to", dest.display().to_string())
                    .hint(err.to_string()),
            )
        })?;
        Ok(dest)
    }

    /// Exports every program with its records to `out_path`.
    pub fn export(&self, out_path: &Path, format: ExportFormat) -> Result<(), TiraError> {
        let programs = self.with_transaction(schema::all_programs_with_records)?;
        write_export(out_path, format, &programs)
    }

    /// Whether this instance may write (the CPU gate is open or overridden).
    pub fn writes_allowed(&self) -> bool {
        self.writes_allowed
    }

    /// CPU model recorded in the database metadata.
    pub fn cpu_model(&self) -> &str {
        &self.db_meta.cpu_model
    }

    /// `SLURM_CPUS_PER_TASK` recorded in the database metadata.
    pub fn slurm_cpus(&self) -> &str {
        &self.db_meta.slurm_cpus
    }

    /// Path of the database file.
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Project label stamped onto records written by this instance.
    pub fn source_project(&self) -> &str {
        &self.source_project
    }

    fn ensure_writable(&self) -> Result<(), TiraError> {
        if self.writes_allowed {
            Ok(())
        } else {
            Err(TiraError::ReadOnlyConnection(
                ErrorInfo::new(
                    "tira_store.cpu_gate",
                    "write operations are disabled: CPU profile differs from database metadata",
                )
                .hint("open with allow_cpu_mismatch to override"),
            ))
        }
    }

    fn acquire(&self) -> Result<LockGuard, TiraError> {
        self.mutex.acquire(self.acquire_deadline)
    }

    /// The envelope core: lock, fresh connection, one transaction, unlock.
    /// The guard is dropped last, so the lock is released on every path,
    /// including panics inside the closure.
    fn with_transaction<T>(
        &self,
        op: impl FnOnce(&Connection) -> Result<T, TiraError>,
    ) -> Result<T, TiraError> {
        let _guard = self.acquire()?;
        let mut conn = schema::open_connection(&self.db_path)?;
        let tx = begin(&mut conn)?;
        let value = op(&tx)?;
        commit(tx)?;
        Ok(value)
    }
}

fn begin(conn: &mut Connection) -> Result<rusqlite::Transaction<'_>, TiraError> {
    conn.transaction().map_err(|err| {
        TiraError::Storage(ErrorInfo::new(
            "tira_store.transaction",
            format!("failed to start transaction: {err}"),
        ))
    })
}

fn commit(tx: rusqlite::Transaction<'_>) -> Result<(), TiraError> {
    tx.commit().map_err(|err| {
        TiraError::Storage(ErrorInfo::new(
            "tira_store.transaction",
            format!("failed to commit transaction: {err}"),
        ))
    })
}

fn not_found(key: &str) -> TiraError {
    TiraError::NotFound(
        ErrorInfo::new("tira_store.not_found", "no record with this key")
            .with("key", key.to_string()),
    )
}

/// Validates an outcome and encodes it as canonical JSON.
fn encode_outcome(outcome: &Outcome) -> Result<String, TiraError> {
    if outcome.is_legal {
        match &outcome.execution_times {
            Some(times) if !times.is_empty() => {}
            _ => {
                return Err(TiraError::InvalidArgument(ErrorInfo::new(
                    "tira_store.execution_times",
                    "execution_times must be a non-empty list when is_legal is true",
                )));
            }
        }
    }
    if let Some(times) = &outcome.execution_times {
        for &time in times {
            if !time.is_finite() || time < 0.0 {
                return Err(TiraError::InvalidArgument(
                    ErrorInfo::new(
                        "tira_store.execution_times",
                        "execution times must be finite and non-negative",
                    )
                    .with("value", time.to_string()),
                ));
            }
        }
    }
    let times_value = match &outcome.execution_times {
        Some(times) => CanonValue::Array(times.iter().copied().map(CanonValue::Float).collect()),
        None => CanonValue::Null,
    };
    CanonObject::new()
        .field("is_legal", CanonValue::Bool(outcome.is_legal))
        .field("execution_times", times_value)
        .to_string()
}

fn decode_outcome(result_json: &str) -> Result<Outcome, TiraError> {
    serde_json::from_str(result_json).map_err(|err| {
        TiraError::Storage(
            ErrorInfo::new("tira_store.result_json", "stored result payload is not valid")
                .hint(err.to_string()),
        )
    })
}

fn lookup_result_from_raw(raw: RawRecord) -> Result<LookupResult, TiraError> {
    let outcome = decode_outcome(&raw.result_json)?;
    Ok(LookupResult {
        is_legal: outcome.is_legal,
        execution_times: outcome.execution_times,
        schedule: raw.schedule,
        hostname: raw.hostname,
        username: raw.username,
        creation_date: raw.creation_date,
        update_date: raw.update_date,
        source_project: raw.source_project,
    })
}

fn record_row_from_raw(raw: RawRecord) -> Result<RecordRow, TiraError> {
    let result = decode_outcome(&raw.result_json)?;
    Ok(RecordRow {
        key: raw.key,
        program_hash: raw.program_hash,
        program_name: raw.program_name,
        source_code: raw.source_code,
        schedule: raw.schedule,
        result,
        hostname: raw.hostname,
        username: raw.username,
        creation_date: raw.creation_date,
        update_date: raw.update_date,
        source_project: raw.source_project,
    })
}

/// `<db>.lock`, a sibling of the database file.
fn lock_path_for(db_path: &Path) -> PathBuf {
    let mut name = db_path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| "store.db".into());
    name.push(".lock");
    db_path.with_file_name(name)
}

fn ensure_parent_dir(db_path: &Path) -> Result<(), TiraError> {
    let Some(parent) = db_path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    fs::create_dir_all(parent).map_err(|err| {
        TiraError::Io(
            ErrorInfo::new("tira_store.create_dir", "failed to create database directory")
                .with("path", parent.display().to_string())
                .hint(err.to_string()),
        )
    })?;
    // World-writable with sticky bit, so workers under any user identity
    // can create lock and journal files next to the database.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o1777));
    }
    Ok(())
}

fn set_world_writable(db_path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(db_path, fs::Permissions::from_mode(0o666));
    }
    #[cfg(not(unix))]
    {
        let _ = db_path;
    }
}
