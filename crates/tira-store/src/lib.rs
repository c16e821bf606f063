//! Shared lookup table for autoscheduler measurements on HPC clusters.
//!
//! One SQLite file on a shared parallel filesystem serves dozens of worker
//! processes across nodes and user identities, with no coordinator. Mutual
//! exclusion comes from a hard-link lock file (`lock`), identity from
//! content-addressed keys (`keys`), and every public call runs as its own
//! short transaction against a fresh connection (`store`).
//!
//! ```no_run
//! use tira_store::{Outcome, StoreOptions, TiraStore};
//!
//! # fn main() -> Result<(), tira_store::TiraError> {
//! let store = TiraStore::open(
//!     "/shared/measurements.db",
//!     StoreOptions {
//!         source_project: "autoscheduler-v2".into(),
//!         ..StoreOptions::default()
//!     },
//! )?;
//! store.record(
//!     "blur",
//!     "void blur() {}",
//!     "P(L0,comps=['c0'])",
//!     &Outcome::legal(vec![0.042, 0.039]),
//!     false,
//! )?;
//! if let Some(found) = store.lookup("blur", "void blur() {}", "P(L0,comps=['c0'])")? {
//!     println!("{:?}", found.execution_times);
//! }
//! # Ok(())
//! # }
//! ```

pub mod export;
pub mod keys;
pub mod lock;
pub mod meta;
pub mod schema;
pub mod store;

pub use export::{ExportFormat, ProgramExport, ScheduleExport};
pub use keys::{program_hash, record_key};
pub use lock::{HardLinkMutex, LockGuard, DEFAULT_STALE_LOCK_TIMEOUT};
pub use meta::DbMeta;
pub use schema::{ProgramSource, StoreStats, SCHEMA_VERSION};
pub use store::{
    LookupResult, Outcome, RecordRow, ScheduleOutcome, StoreOptions, TiraStore,
    DEFAULT_ACQUIRE_DEADLINE,
};
pub use tira_core::{ErrorInfo, ErrorKind, TiraError};
