//! The federation store: one SQLite connection, three repositories.

use crate::approvals::ApprovalStore;
use crate::migration::run_migrations;
use crate::registry::RegistryStore;
use crate::tasks::TaskStore;
use crate::storage_err;
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use taia_types::error::TaiaResult;
use tracing::info;

/// Owns the database connection and hands out the record repositories.
///
/// Constructed once at boot and passed by reference to the registry and
/// the bus; there is no process-wide store.
#[derive(Clone)]
pub struct FederationStore {
    registry: RegistryStore,
    tasks: TaskStore,
    approvals: ApprovalStore,
}

impl FederationStore {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> TaiaResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(storage_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
            .map_err(storage_err)?;
        run_migrations(&conn).map_err(storage_err)?;
        info!(path = %path.display(), "Federation store opened");
        Ok(Self::from_connection(conn))
    }

    /// An in-memory store, for tests and ephemeral runs.
    pub fn open_in_memory() -> TaiaResult<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        run_migrations(&conn).map_err(storage_err)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        let conn = Arc::new(Mutex::new(conn));
        Self {
            registry: RegistryStore::new(Arc::clone(&conn)),
            tasks: TaskStore::new(Arc::clone(&conn)),
            approvals: ApprovalStore::new(conn),
        }
    }

    pub fn registry(&self) -> &RegistryStore {
        &self.registry
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    pub fn approvals(&self) -> &ApprovalStore {
        &self.approvals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taia_types::approval::Approval;

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("federation.db");

        let approval = Approval::waiting("grant", serde_json::Value::Null);
        {
            let store = FederationStore::open(&path).unwrap();
            store.approvals().insert(&approval).unwrap();
        }

        let reopened = FederationStore::open(&path).unwrap();
        assert!(reopened.approvals().get(approval.id).unwrap().is_some());
    }
}
