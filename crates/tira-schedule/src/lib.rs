#![deny(missing_docs)]
#![doc = "Schedule grammar for TiraStore. A schedule string is a `|`-separated \
sequence of loop-transformation atoms; this crate parses it into tagged \
variants, re-emits the canonical form used for storage and hashing, and \
normalises program source for hash computation."]

/// Transformation atoms and canonical emission.
pub mod atom;
/// Lexer and recursive-descent parser.
pub mod parse;
/// Program source normalisation.
pub mod program;

pub use atom::{emit_schedule, Atom, LoopId};
pub use parse::parse_schedule;
pub use program::normalize_program;

use tira_core::TiraError;

/// Normalises a schedule string to its canonical form.
///
/// Whitespace outside quoted comp identifiers is dropped, comp identifiers
/// are re-emitted single-quoted, and atom order is preserved. The empty
/// string normalises to itself. Fails with `InvalidArgument` when the input
/// does not parse.
pub fn normalize_schedule(schedule: &str) -> Result<String, TiraError> {
    let atoms = parse_schedule(schedule)?;
    Ok(emit_schedule(&atoms))
}

/// Checks a schedule string against the grammar.
///
/// Validity is defined as successful parsing; the returned error carries the
/// reason and the byte offset of the failure.
pub fn validate_schedule(schedule: &str) -> Result<(), TiraError> {
    parse_schedule(schedule).map(|_| ())
}
