//! Durable record store for the TAIA federation.
//!
//! One SQLite database holds every federation record, one row per id:
//! - **Registry store**: agents, skills and permission grants
//! - **Task store**: active tasks, the task archive, responses, review links, batches
//! - **Approval store**: human-in-the-loop decision records
//!
//! All three share a single connection behind a mutex, so every mutation is
//! a whole-record read-modify-write under one lock.

pub mod approvals;
pub mod migration;
pub mod registry;
pub mod tasks;

mod substrate;
pub use substrate::FederationStore;

use taia_types::error::TaiaError;

/// Map a SQLite error into the shared storage error.
pub(crate) fn storage_err(e: rusqlite::Error) -> TaiaError {
    TaiaError::Storage(e.to_string())
}

/// Map a poisoned lock into the shared internal error.
pub(crate) fn lock_err<T>(e: std::sync::PoisonError<T>) -> TaiaError {
    TaiaError::Internal(e.to_string())
}
