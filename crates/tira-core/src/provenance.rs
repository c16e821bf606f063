//! Machine identity captured for record provenance and the CPU profile gate.

use std::env;
use std::fs;

use serde::{Deserialize, Serialize};

/// Value stored when `SLURM_CPUS_PER_TASK` is not set. A stored `"N/A"`
/// compares equal to any local value during gate checks.
pub const SLURM_CPUS_UNSET: &str = "N/A";

/// Identity of the writing process, captured once per store instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineProfile {
    /// Node name as reported by the OS.
    pub hostname: String,
    /// Effective user, from `USER`/`LOGNAME`.
    pub username: String,
    /// CPU model string, auto-detected or supplied by the caller.
    pub cpu_model: String,
    /// `SLURM_CPUS_PER_TASK`, or [`SLURM_CPUS_UNSET`].
    pub slurm_cpus: String,
}

impl MachineProfile {
    /// Captures the local profile, honouring caller overrides for the CPU
    /// fields.
    pub fn capture(cpu_model: Option<String>, slurm_cpus: Option<String>) -> Self {
        Self {
            hostname: local_hostname(),
            username: local_username(),
            cpu_model: cpu_model.unwrap_or_else(detect_cpu_model),
            slurm_cpus: slurm_cpus.unwrap_or_else(slurm_cpus_per_task),
        }
    }
}

/// Returns the node's hostname, or `"unknown"` when it cannot be determined.
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Returns the effective username from the environment, or `"unknown"`.
pub fn local_username() -> String {
    env::var("USER")
        .or_else(|_| env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Returns `SLURM_CPUS_PER_TASK`, or [`SLURM_CPUS_UNSET`] outside Slurm jobs.
pub fn slurm_cpus_per_task() -> String {
    env::var("SLURM_CPUS_PER_TASK").unwrap_or_else(|_| SLURM_CPUS_UNSET.to_string())
}

/// Best-effort CPU model detection from `/proc/cpuinfo`.
///
/// Execution times are only comparable between identical CPUs, so the exact
/// brand string matters more than a structured descriptor. Returns
/// `"unknown"` on non-Linux hosts or when the field is absent.
pub fn detect_cpu_model() -> String {
    if let Ok(text) = fs::read_to_string("/proc/cpuinfo") {
        for line in text.lines() {
            if line.starts_with("model name") {
                if let Some((_, value)) = line.split_once(':') {
                    return value.trim().to_string();
                }
            }
        }
    }
    "unknown".to_string()
}
