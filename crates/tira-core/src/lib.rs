#![deny(missing_docs)]
#![doc = "Shared substrate for the TiraStore lookup table: structured errors, \
the canonical JSON encoder used for hashed payloads, and machine identity \
helpers for record provenance."]

pub mod canon;
pub mod errors;
pub mod provenance;

pub use canon::{CanonObject, CanonValue};
pub use errors::{ErrorInfo, ErrorKind, TiraError};
pub use provenance::{MachineProfile, SLURM_CPUS_UNSET};
