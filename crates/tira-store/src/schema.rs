//! SQLite storage backend.
//!
//! Every function here assumes the caller already holds the hard-link mutex
//! and runs inside the envelope's transaction; none of them lock or commit
//! on their own.

use std::path::Path;

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tira_core::errors::{ErrorInfo, TiraError};

/// Current on-disk schema version.
pub const SCHEMA_VERSION: i64 = 2;

const CREATE_TABLES: &str = "\
CREATE TABLE IF NOT EXISTS db_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS programs (
    program_hash TEXT PRIMARY KEY,
    program_name TEXT NOT NULL,
    source_code  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS records (
    key            TEXT PRIMARY KEY,
    program_hash   TEXT NOT NULL,
    schedule       TEXT NOT NULL,
    result_json    TEXT NOT NULL,
    hostname       TEXT NOT NULL,
    username       TEXT NOT NULL,
    creation_date  TEXT NOT NULL,
    update_date    TEXT NOT NULL,
    source_project TEXT NOT NULL DEFAULT ''
);";

const RECORD_COLUMNS: &str = "\
r.key, r.program_hash, p.program_name, p.source_code, r.schedule, r.result_json, \
r.hostname, r.username, r.creation_date, r.update_date, r.source_project";

fn storage_error(code: &str, err: impl ToString) -> TiraError {
    TiraError::Storage(ErrorInfo::new(code, err.to_string()))
}

/// ISO-8601 UTC timestamp at second precision.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Opens a connection configured for a parallel network filesystem.
///
/// WAL needs shared memory that Lustre cannot provide, so the journal stays
/// in rollback mode; the busy handler is disabled because mutual exclusion
/// comes from the hard-link mutex and a second writer should fail loudly.
pub fn open_connection(db_path: &Path) -> Result<Connection, TiraError> {
    let conn = Connection::open(db_path).map_err(|err| {
        TiraError::Storage(
            ErrorInfo::new("tira_store.open", "failed to open database")
                .with("path", db_path.display().to_string())
                .hint(err.to_string()),
        )
    })?;
    conn.query_row("PRAGMA journal_mode = DELETE", [], |_row| Ok(()))
        .map_err(|err| storage_error("tira_store.pragma", err))?;
    conn.query_row("PRAGMA busy_timeout = 0", [], |_row| Ok(()))
        .map_err(|err| storage_error("tira_store.pragma", err))?;
    conn.pragma_update(None, "synchronous", "FULL")
        .map_err(|err| storage_error("tira_store.pragma", err))?;
    Ok(conn)
}

/// Creates the three tables if they do not exist.
pub fn create_tables(conn: &Connection) -> Result<(), TiraError> {
    conn.execute_batch(CREATE_TABLES)
        .map_err(|err| storage_error("tira_store.create_tables", err))
}

/// Reads one `db_meta` value.
pub fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>, TiraError> {
    conn.query_row(
        "SELECT value FROM db_meta WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
    .map_err(|err| storage_error("tira_store.meta", err))
}

/// Writes one `db_meta` value unless the key already exists.
pub fn insert_meta(conn: &Connection, key: &str, value: &str) -> Result<(), TiraError> {
    conn.execute(
        "INSERT OR IGNORE INTO db_meta (key, value) VALUES (?1, ?2)",
        params![key, value],
    )
    .map_err(|err| storage_error("tira_store.meta", err))?;
    Ok(())
}

/// Inserts a program unless its hash is already present.
///
/// Program text is immutable under its hash; a second insert with the same
/// hash (even under a different name) is ignored. Returns whether a row was
/// inserted.
pub fn upsert_program(
    conn: &Connection,
    program_hash: &str,
    program_name: &str,
    source_code: &str,
) -> Result<bool, TiraError> {
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO programs (program_hash, program_name, source_code) \
             VALUES (?1, ?2, ?3)",
            params![program_hash, program_name, source_code],
        )
        .map_err(|err| storage_error("tira_store.upsert_program", err))?;
    Ok(inserted > 0)
}

/// Row data for a record write; provenance comes from the writing process.
#[derive(Debug, Clone)]
pub struct NewRecord<'a> {
    /// Content-addressed record key.
    pub key: &'a str,
    /// Hash of the normalised program source.
    pub program_hash: &'a str,
    /// Normalised schedule string.
    pub schedule: &'a str,
    /// Canonical JSON of the measurement outcome.
    pub result_json: &'a str,
    /// Writing node.
    pub hostname: &'a str,
    /// Writing user.
    pub username: &'a str,
    /// Project label of the writing store instance.
    pub source_project: &'a str,
}

/// Inserts or updates one record.
///
/// An existing key with `overwrite` unset is left untouched and reported as
/// `false`. Overwrites keep `creation_date` and refresh `update_date`.
pub fn upsert_record(
    conn: &Connection,
    record: &NewRecord<'_>,
    overwrite: bool,
) -> Result<bool, TiraError> {
    let now = now_iso();
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM records WHERE key = ?1",
            params![record.key],
            |row| row.get(0),
        )
        .optional()
        .map_err(|err| storage_error("tira_store.upsert_record", err))?;
    if exists.is_some() {
        if !overwrite {
            return Ok(false);
        }
        conn.execute(
            "UPDATE records
                SET program_hash   = ?2,
                    schedule       = ?3,
                    result_json    = ?4,
                    hostname       = ?5,
                    username       = ?6,
                    update_date    = ?7,
                    source_project = ?8
              WHERE key = ?1",
            params![
                record.key,
                record.program_hash,
                record.schedule,
                record.result_json,
                record.hostname,
                record.username,
                now,
                record.source_project,
            ],
        )
        .map_err(|err| storage_error("tira_store.upsert_record", err))?;
    } else {
        conn.execute(
            "INSERT INTO records
                 (key, program_hash, schedule, result_json, hostname, username,
                  creation_date, update_date, source_project)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.key,
                record.program_hash,
                record.schedule,
                record.result_json,
                record.hostname,
                record.username,
                now,
                now,
                record.source_project,
            ],
        )
        .map_err(|err| storage_error("tira_store.upsert_record", err))?;
    }
    Ok(true)
}

/// Existence check on the records table.
pub fn record_exists(conn: &Connection, key: &str) -> Result<bool, TiraError> {
    let row: Option<i64> = conn
        .query_row("SELECT 1 FROM records WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()
        .map_err(|err| storage_error("tira_store.contains", err))?;
    Ok(row.is_some())
}

/// A records×programs join row as stored, before result decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Content-addressed record key.
    pub key: String,
    /// Hash of the normalised program source.
    pub program_hash: String,
    /// Program label; empty when the program row is missing.
    pub program_name: String,
    /// Verbatim program source; empty when the program row is missing.
    pub source_code: String,
    /// Normalised schedule string.
    pub schedule: String,
    /// Canonical JSON of the measurement outcome.
    pub result_json: String,
    /// Writing node.
    pub hostname: String,
    /// Writing user.
    pub username: String,
    /// First write timestamp.
    pub creation_date: String,
    /// Last write timestamp.
    pub update_date: String,
    /// Project label recorded at write time.
    pub source_project: String,
}

fn raw_record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        key: row.get(0)?,
        program_hash: row.get(1)?,
        program_name: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        source_code: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        schedule: row.get(4)?,
        result_json: row.get(5)?,
        hostname: row.get(6)?,
        username: row.get(7)?,
        creation_date: row.get(8)?,
        update_date: row.get(9)?,
        source_project: row.get(10)?,
    })
}

/// Fetches one record joined with its program, or `None`.
pub fn get_record(conn: &Connection, key: &str) -> Result<Option<RawRecord>, TiraError> {
    conn.query_row(
        &format!(
            "SELECT {RECORD_COLUMNS} FROM records r \
             LEFT JOIN programs p ON p.program_hash = r.program_hash \
             WHERE r.key = ?1"
        ),
        params![key],
        raw_record_from_row,
    )
    .optional()
    .map_err(|err| storage_error("tira_store.get", err))
}

/// Deletes one record. Returns whether it existed.
pub fn delete_record(conn: &Connection, key: &str) -> Result<bool, TiraError> {
    let deleted = conn
        .execute("DELETE FROM records WHERE key = ?1", params![key])
        .map_err(|err| storage_error("tira_store.delete", err))?;
    Ok(deleted > 0)
}

/// Total number of records.
pub fn count_records(conn: &Connection) -> Result<u64, TiraError> {
    conn.query_row("SELECT COUNT(*) FROM records", [], |row| {
        row.get::<_, i64>(0)
    })
    .map(|count| count as u64)
    .map_err(|err| storage_error("tira_store.count", err))
}

/// Total number of distinct programs.
pub fn count_programs(conn: &Connection) -> Result<u64, TiraError> {
    conn.query_row("SELECT COUNT(*) FROM programs", [], |row| {
        row.get::<_, i64>(0)
    })
    .map(|count| count as u64)
    .map_err(|err| storage_error("tira_store.count", err))
}

/// Summary statistics over the whole database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Total record rows.
    pub total_records: u64,
    /// Records whose outcome has `is_legal = true`.
    pub legal_records: u64,
    /// Records whose outcome has `is_legal = false`.
    pub illegal_records: u64,
    /// Total program rows.
    pub total_programs: u64,
    /// Distinct writing users.
    pub users: Vec<String>,
    /// Distinct source projects.
    pub source_projects: Vec<String>,
    /// CPU model recorded at database creation.
    pub cpu_model: Option<String>,
    /// `SLURM_CPUS_PER_TASK` recorded at database creation.
    pub slurm_cpus: Option<String>,
}

fn distinct_column(conn: &Connection, sql: &str) -> Result<Vec<String>, TiraError> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|err| storage_error("tira_store.stats", err))?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|err| storage_error("tira_store.stats", err))?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|err| storage_error("tira_store.stats", err))
}

fn count_where(conn: &Connection, sql: &str) -> Result<u64, TiraError> {
    conn.query_row(sql, [], |row| row.get::<_, i64>(0))
        .map(|count| count as u64)
        .map_err(|err| storage_error("tira_store.stats", err))
}

/// Aggregates record and program counts plus the stored CPU profile.
pub fn stats(conn: &Connection) -> Result<StoreStats, TiraError> {
    Ok(StoreStats {
        total_records: count_records(conn)?,
        legal_records: count_where(
            conn,
            "SELECT COUNT(*) FROM records WHERE json_extract(result_json, '$.is_legal') = 1",
        )?,
        illegal_records: count_where(
            conn,
            "SELECT COUNT(*) FROM records WHERE json_extract(result_json, '$.is_legal') = 0",
        )?,
        total_programs: count_programs(conn)?,
        users: distinct_column(conn, "SELECT DISTINCT username FROM records ORDER BY username")?,
        source_projects: distinct_column(
            conn,
            "SELECT DISTINCT source_project FROM records ORDER BY source_project",
        )?,
        cpu_model: get_meta(conn, "cpu_model")?,
        slurm_cpus: get_meta(conn, "slurm_cpus")?,
    })
}

/// Record keys ordered ascending; `limit = 0` means unbounded.
pub fn record_keys(conn: &Connection, limit: u64, offset: u64) -> Result<Vec<String>, TiraError> {
    let limit = if limit == 0 { -1 } else { limit as i64 };
    let mut stmt = conn
        .prepare("SELECT key FROM records ORDER BY key ASC LIMIT ?1 OFFSET ?2")
        .map_err(|err| storage_error("tira_store.keys", err))?;
    let rows = stmt
        .query_map(params![limit, offset as i64], |row| row.get::<_, String>(0))
        .map_err(|err| storage_error("tira_store.keys", err))?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|err| storage_error("tira_store.keys", err))
}

/// One stored source version of a named program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramSource {
    /// Hash of the normalised source.
    pub program_hash: String,
    /// Verbatim source text.
    pub source_code: String,
}

/// All source versions stored under one program name.
pub fn programs_by_name(conn: &Connection, name: &str) -> Result<Vec<ProgramSource>, TiraError> {
    let mut stmt = conn
        .prepare(
            "SELECT program_hash, source_code FROM programs \
             WHERE program_name = ?1 ORDER BY program_hash",
        )
        .map_err(|err| storage_error("tira_store.programs", err))?;
    let rows = stmt
        .query_map(params![name], |row| {
            Ok(ProgramSource {
                program_hash: row.get(0)?,
                source_code: row.get(1)?,
            })
        })
        .map_err(|err| storage_error("tira_store.programs", err))?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|err| storage_error("tira_store.programs", err))
}

/// All records for one program hash, joined, ordered by key.
pub fn records_by_program(
    conn: &Connection,
    program_hash: &str,
) -> Result<Vec<RawRecord>, TiraError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM records r \
             LEFT JOIN programs p ON p.program_hash = r.program_hash \
             WHERE r.program_hash = ?1 ORDER BY r.key"
        ))
        .map_err(|err| storage_error("tira_store.records", err))?;
    let rows = stmt
        .query_map(params![program_hash], raw_record_from_row)
        .map_err(|err| storage_error("tira_store.records", err))?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|err| storage_error("tira_store.records", err))
}

/// One program together with all of its records, as used by export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramRecords {
    /// Hash of the normalised source.
    pub program_hash: String,
    /// Program label.
    pub program_name: String,
    /// Verbatim source text.
    pub source_code: String,
    /// Every record referencing this program.
    pub records: Vec<RawRecord>,
}

/// The full database grouped per program, ordered by name then hash.
pub fn all_programs_with_records(conn: &Connection) -> Result<Vec<ProgramRecords>, TiraError> {
    let mut stmt = conn
        .prepare(
            "SELECT program_hash, program_name, source_code FROM programs \
             ORDER BY program_name, program_hash",
        )
        .map_err(|err| storage_error("tira_store.export", err))?;
    let programs = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })
        .map_err(|err| storage_error("tira_store.export", err))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| storage_error("tira_store.export", err))?;
    let mut out = Vec::with_capacity(programs.len());
    for (program_hash, program_name, source_code) in programs {
        let records = records_by_program(conn, &program_hash)?;
        out.push(ProgramRecords {
            program_hash,
            program_name,
            source_code,
            records,
        });
    }
    Ok(out)
}
