//! Whole-database export to JSON and JSON-lines files.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tira_core::errors::{ErrorInfo, TiraError};

use crate::schema::ProgramRecords;

/// Output layout for [`crate::TiraStore::export`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// One pretty-printed JSON array of program objects.
    Json,
    /// One compact JSON program object per line.
    JsonLines,
}

/// One exported schedule with its stored outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleExport {
    /// Normalised schedule string.
    pub schedule: String,
    /// Whether the schedule was legal.
    pub is_legal: bool,
    /// Measured wall times, when present.
    pub execution_times: Option<Vec<f64>>,
}

/// One exported program with all of its schedules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramExport {
    /// Program label.
    pub program_name: String,
    /// Hash of the normalised source.
    pub program_hash: String,
    /// Verbatim source text.
    pub source_code: String,
    /// Every recorded schedule for this program.
    pub schedules: Vec<ScheduleExport>,
}

fn export_error(code: &str, path: &Path, err: impl ToString) -> TiraError {
    TiraError::Io(
        ErrorInfo::new(code, "export failed")
            .with("path", path.display().to_string())
            .hint(err.to_string()),
    )
}

fn program_export(program: &ProgramRecords) -> Result<ProgramExport, TiraError> {
    let mut schedules = Vec::with_capacity(program.records.len());
    for record in &program.records {
        let payload: Value = serde_json::from_str(&record.result_json).map_err(|err| {
            TiraError::Storage(
                ErrorInfo::new("tira_store.result_json", "stored result payload is not valid")
                    .with("key", record.key.clone())
                    .hint(err.to_string()),
            )
        })?;
        schedules.push(ScheduleExport {
            schedule: record.schedule.clone(),
            is_legal: payload
                .get("is_legal")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            execution_times: payload
                .get("execution_times")
                .and_then(Value::as_array)
                .map(|times| times.iter().filter_map(Value::as_f64).collect()),
        });
    }
    Ok(ProgramExport {
        program_name: program.program_name.clone(),
        program_hash: program.program_hash.clone(),
        source_code: program.source_code.clone(),
        schedules,
    })
}

/// Writes the grouped database contents to `out_path`.
pub fn write_export(
    out_path: &Path,
    format: ExportFormat,
    programs: &[ProgramRecords],
) -> Result<(), TiraError> {
    let exports = programs
        .iter()
        .map(program_export)
        .collect::<Result<Vec<_>, _>>()?;
    match format {
        ExportFormat::Json => {
            let mut bytes = serde_json::to_vec_pretty(&exports)
                .map_err(|err| export_error("tira_store.export", out_path, err))?;
            bytes.push(b'\n');
            fs::write(out_path, bytes)
                .map_err(|err| export_error("tira_store.export", out_path, err))
        }
        ExportFormat::JsonLines => {
            let mut out = String::new();
            for export in &exports {
                let line = serde_json::to_string(export)
                    .map_err(|err| export_error("tira_store.export", out_path, err))?;
                out.push_str(&line);
                out.push('\n');
            }
            fs::write(out_path, out)
                .map_err(|err| export_error("tira_store.export", out_path, err))
        }
    }
}
