//! Content-addressed key derivation.
//!
//! Identical logical inputs must always hash to the same key regardless of
//! cosmetic differences (whitespace, comment style, quote style), so both
//! hash inputs are normalised forms and the key material is canonical JSON.

use sha2::{Digest, Sha256};
use tira_core::canon::{CanonObject, CanonValue};
use tira_core::errors::TiraError;
use tira_schedule::{normalize_program, normalize_schedule};

/// SHA-256 hex hash of the normalised program source.
pub fn program_hash(program_source: &str) -> String {
    let normalized = normalize_program(program_source);
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

/// Record key for a program hash and a raw schedule string.
///
/// The schedule is normalised first, so equivalent spellings derive the same
/// key; a schedule that does not parse fails with `InvalidArgument`.
pub fn record_key(program_hash: &str, schedule: &str) -> Result<String, TiraError> {
    let normalized = normalize_schedule(schedule)?;
    record_key_from_normalized(program_hash, &normalized)
}

/// Record key when the schedule is already in canonical form.
pub(crate) fn record_key_from_normalized(
    program_hash: &str,
    normalized_schedule: &str,
) -> Result<String, TiraError> {
    let blob = CanonObject::new()
        .field("program_hash", CanonValue::Str(program_hash.to_string()))
        .field("schedule", CanonValue::Str(normalized_schedule.to_string()))
        .to_bytes()?;
    Ok(hex::encode(Sha256::digest(&blob)))
}
