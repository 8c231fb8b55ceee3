//! Approval record persistence.

use crate::{lock_err, storage_err};
use rusqlite::{Connection, OptionalExtension};
use std::sync::{Arc, Mutex};
use taia_types::approval::{Approval, ApprovalId, ApprovalStatus};
use taia_types::error::{TaiaError, TaiaResult};

/// Approval store backed by SQLite.
#[derive(Clone)]
pub struct ApprovalStore {
    conn: Arc<Mutex<Connection>>,
}

impl ApprovalStore {
    /// Create a new approval store wrapping the given connection.
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    pub fn insert(&self, approval: &Approval) -> TaiaResult<()> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let record = serde_json::to_string(approval)?;
        conn.execute(
            "INSERT INTO approvals (id, status, created_us, record) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                approval.id.to_string(),
                approval.status.as_str(),
                approval.created_at.timestamp_micros(),
                record,
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    pub fn get(&self, id: ApprovalId) -> TaiaResult<Option<Approval>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let record: Option<String> = conn
            .query_row(
                "SELECT record FROM approvals WHERE id = ?1",
                rusqlite::params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?;
        Ok(record.map(|r| serde_json::from_str(&r)).transpose()?)
    }

    /// Read-modify-write one approval under the store lock.
    pub fn update<F>(&self, id: ApprovalId, mutate: F) -> TaiaResult<Approval>
    where
        F: FnOnce(&mut Approval) -> TaiaResult<()>,
    {
        let mut conn = self.conn.lock().map_err(lock_err)?;
        let tx = conn.transaction().map_err(storage_err)?;
        let record: Option<String> = tx
            .query_row(
                "SELECT record FROM approvals WHERE id = ?1",
                rusqlite::params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?;
        let mut approval: Approval = match record {
            Some(r) => serde_json::from_str(&r)?,
            None => return Err(TaiaError::ApprovalNotFound(id.to_string())),
        };

        mutate(&mut approval)?;

        tx.execute(
            "UPDATE approvals SET status = ?2, record = ?3 WHERE id = ?1",
            rusqlite::params![
                id.to_string(),
                approval.status.as_str(),
                serde_json::to_string(&approval)?,
            ],
        )
        .map_err(storage_err)?;
        tx.commit().map_err(storage_err)?;
        Ok(approval)
    }

    /// List approvals, oldest first, optionally filtered by status.
    pub fn list(&self, status: Option<ApprovalStatus>) -> TaiaResult<Vec<Approval>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let (sql, params): (&str, Vec<String>) = match status {
            Some(s) => (
                "SELECT record FROM approvals WHERE status = ?1 ORDER BY created_us",
                vec![s.as_str().to_string()],
            ),
            None => ("SELECT record FROM approvals ORDER BY created_us", vec![]),
        };
        let mut stmt = conn.prepare(sql).map_err(storage_err)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                row.get::<_, String>(0)
            })
            .map_err(storage_err)?;
        let mut approvals: Vec<Approval> = Vec::new();
        for row in rows {
            approvals.push(serde_json::from_str(&row.map_err(storage_err)?)?);
        }
        Ok(approvals)
    }

    pub fn count_waiting(&self) -> TaiaResult<u64> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM approvals WHERE status = ?1",
                rusqlite::params![ApprovalStatus::WaitingForApproval.as_str()],
                |row| row.get(0),
            )
            .map_err(storage_err)?;
        Ok(n as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::run_migrations;

    fn setup() -> ApprovalStore {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        ApprovalStore::new(Arc::new(Mutex::new(conn)))
    }

    #[test]
    fn test_insert_get_update() {
        let store = setup();
        let approval = Approval::waiting("orchestration", serde_json::json!({"n": 1}));
        store.insert(&approval).unwrap();
        assert_eq!(store.count_waiting().unwrap(), 1);

        let updated = store
            .update(approval.id, |a| {
                a.status = ApprovalStatus::Approved;
                a.actor = Some("operator".to_string());
                Ok(())
            })
            .unwrap();
        assert_eq!(updated.status, ApprovalStatus::Approved);
        assert_eq!(store.count_waiting().unwrap(), 0);
        assert_eq!(
            store.get(approval.id).unwrap().unwrap().actor.as_deref(),
            Some("operator")
        );
    }

    #[test]
    fn test_list_filter() {
        let store = setup();
        let a = Approval::waiting("a", serde_json::Value::Null);
        let mut b = Approval::waiting("b", serde_json::Value::Null);
        b.status = ApprovalStatus::Rejected;
        store.insert(&a).unwrap();
        store.insert(&b).unwrap();

        assert_eq!(store.list(None).unwrap().len(), 2);
        let waiting = store.list(Some(ApprovalStatus::WaitingForApproval)).unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].id, a.id);
    }

    #[test]
    fn test_update_missing() {
        let store = setup();
        let err = store.update(ApprovalId::new(), |_| Ok(())).unwrap_err();
        assert!(matches!(err, TaiaError::ApprovalNotFound(_)));
    }
}
