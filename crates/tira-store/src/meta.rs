//! Database metadata and the CPU profile gate.
//!
//! The profile of the machine that creates a database is frozen into
//! `db_meta`; execution times recorded on different hardware would not be
//! comparable, so a mismatching connection is demoted to read-only unless
//! the caller overrides the gate.

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tira_core::errors::{ErrorInfo, TiraError};
use tira_core::provenance::{MachineProfile, SLURM_CPUS_UNSET};

use crate::schema::{self, SCHEMA_VERSION};

/// One-shot configuration captured when the database file is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbMeta {
    /// On-disk schema version.
    pub schema_version: i64,
    /// CPU model of the creating machine.
    pub cpu_model: String,
    /// `SLURM_CPUS_PER_TASK` of the creating job, or `"N/A"`.
    pub slurm_cpus: String,
    /// Creation timestamp, ISO-8601 UTC.
    pub created_at: String,
}

impl DbMeta {
    /// Metadata for a freshly created database.
    pub fn initial(profile: &MachineProfile) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            cpu_model: profile.cpu_model.clone(),
            slurm_cpus: profile.slurm_cpus.clone(),
            created_at: schema::now_iso(),
        }
    }
}

/// Writes the initial metadata rows. Existing keys are never overwritten.
pub fn write_meta(conn: &Connection, meta: &DbMeta) -> Result<(), TiraError> {
    schema::insert_meta(conn, "schema_version", &meta.schema_version.to_string())?;
    schema::insert_meta(conn, "cpu_model", &meta.cpu_model)?;
    schema::insert_meta(conn, "slurm_cpus", &meta.slurm_cpus)?;
    schema::insert_meta(conn, "created_at", &meta.created_at)?;
    Ok(())
}

/// Reads the stored metadata, or `None` when the database is uninitialised.
///
/// Fails with `SchemaIncompatible` when a version stamp exists and differs
/// from [`SCHEMA_VERSION`]; up- and downgrades are not supported.
pub fn read_meta(conn: &Connection) -> Result<Option<DbMeta>, TiraError> {
    let has_table: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'db_meta'",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(|err| TiraError::Storage(ErrorInfo::new("tira_store.meta", err.to_string())))?;
    if has_table.is_none() {
        return Ok(None);
    }
    let version = match schema::get_meta(conn, "schema_version")? {
        Some(version) => version,
        None => return Ok(None),
    };
    let parsed = version.parse::<i64>().unwrap_or(-1);
    if parsed != SCHEMA_VERSION {
        return Err(TiraError::SchemaIncompatible(
            ErrorInfo::new(
                "tira_store.schema_version",
                format!("database schema {version} incompatible with expected {SCHEMA_VERSION}"),
            )
            .hint("downgrade and upgrade are not supported"),
        ));
    }
    Ok(Some(DbMeta {
        schema_version: parsed,
        cpu_model: schema::get_meta(conn, "cpu_model")?.unwrap_or_default(),
        slurm_cpus: schema::get_meta(conn, "slurm_cpus")?
            .unwrap_or_else(|| SLURM_CPUS_UNSET.to_string()),
        created_at: schema::get_meta(conn, "created_at")?.unwrap_or_default(),
    }))
}

/// Outcome of comparing the stored profile against the local machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GateReport {
    /// Human-readable descriptions of each differing field.
    pub mismatches: Vec<String>,
}

impl GateReport {
    /// Whether the stored and local profiles agree.
    pub fn matches(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Compares the stored CPU profile with the local one.
///
/// An empty stored CPU model and a stored `"N/A"` Slurm value compare equal
/// to anything.
pub fn evaluate_gate(meta: &DbMeta, local: &MachineProfile) -> GateReport {
    let mut mismatches = Vec::new();
    if !meta.cpu_model.is_empty() && meta.cpu_model != local.cpu_model {
        mismatches.push(format!(
            "cpu_model: db={:?} local={:?}",
            meta.cpu_model, local.cpu_model
        ));
    }
    if meta.slurm_cpus != SLURM_CPUS_UNSET && meta.slurm_cpus != local.slurm_cpus {
        mismatches.push(format!(
            "slurm_cpus: db={:?} local={:?}",
            meta.slurm_cpus, local.slurm_cpus
        ));
    }
    GateReport { mismatches }
}
