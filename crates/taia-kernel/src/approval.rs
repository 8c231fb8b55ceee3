//! Human-in-the-loop approval lifecycle.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use taia_memory::approvals::ApprovalStore;
use taia_runtime::audit::{AuditAction, AuditLog};
use taia_types::approval::{Approval, ApprovalId, ApprovalStatus};
use taia_types::error::{TaiaError, TaiaResult};
use tracing::{debug, info};

/// Creates, resolves and waits on approval records.
///
/// Decisions come from outside the process (an operator using the CLI),
/// so waiting is done by polling the store rather than an in-memory signal.
pub struct ApprovalManager {
    store: ApprovalStore,
    audit: Arc<AuditLog>,
}

impl ApprovalManager {
    pub fn new(store: ApprovalStore, audit: Arc<AuditLog>) -> Self {
        Self { store, audit }
    }

    /// Open a new approval awaiting a human decision.
    pub fn request(&self, kind: &str, payload: serde_json::Value) -> TaiaResult<Approval> {
        let approval = Approval::waiting(kind, payload);
        self.store.insert(&approval)?;
        self.audit.record_correlated(
            "approvals",
            AuditAction::ApprovalRequested,
            kind,
            ApprovalStatus::WaitingForApproval.as_str(),
            approval.id.to_string(),
        );
        info!(approval_id = %approval.id, kind = %kind, "Approval requested");
        Ok(approval)
    }

    /// Record a decision. An approval can be resolved exactly once.
    pub fn resolve(
        &self,
        id: ApprovalId,
        approved: bool,
        actor: &str,
        note: Option<String>,
    ) -> TaiaResult<Approval> {
        let status = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        let approval = self.store.update(id, |a| {
            if a.status.is_resolved() {
                return Err(TaiaError::ApprovalAlreadyResolved {
                    id: id.to_string(),
                    status: a.status.to_string(),
                });
            }
            a.status = status;
            a.decided_at = Some(Utc::now());
            a.actor = Some(actor.to_string());
            a.note = note;
            Ok(())
        })?;
        self.audit.record_correlated(
            actor,
            AuditAction::ApprovalResolved,
            approval.kind.as_str(),
            status.as_str(),
            id.to_string(),
        );
        info!(approval_id = %id, actor = %actor, status = %status, "Approval resolved");
        Ok(approval)
    }

    pub fn get(&self, id: ApprovalId) -> TaiaResult<Approval> {
        self.store
            .get(id)?
            .ok_or_else(|| TaiaError::ApprovalNotFound(id.to_string()))
    }

    pub fn list(&self, status: Option<ApprovalStatus>) -> TaiaResult<Vec<Approval>> {
        self.store.list(status)
    }

    pub fn count_waiting(&self) -> TaiaResult<u64> {
        self.store.count_waiting()
    }

    /// Poll until the approval is resolved or `timeout` elapses.
    ///
    /// Returns the resolved record (approved or rejected); the caller
    /// decides what a rejection means. Elapsed time raises `ApprovalTimeout`.
    pub async fn wait_for_decision(
        &self,
        id: ApprovalId,
        timeout: Duration,
        poll_interval: Duration,
    ) -> TaiaResult<Approval> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let approval = self.get(id)?;
            if approval.status.is_resolved() {
                return Ok(approval);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(TaiaError::ApprovalTimeout {
                    id: id.to_string(),
                    secs: timeout.as_secs(),
                });
            }
            debug!(approval_id = %id, "Waiting for approval decision");
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taia_memory::FederationStore;

    fn manager() -> ApprovalManager {
        let store = FederationStore::open_in_memory().unwrap();
        ApprovalManager::new(store.approvals().clone(), Arc::new(AuditLog::new()))
    }

    #[test]
    fn test_resolve_exactly_once() {
        let mgr = manager();
        let approval = mgr.request("grant", serde_json::json!({"skill": "GIT_PUSH"})).unwrap();
        assert_eq!(mgr.count_waiting().unwrap(), 1);

        let resolved = mgr
            .resolve(approval.id, true, "operator", Some("looks fine".to_string()))
            .unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Approved);
        assert_eq!(resolved.actor.as_deref(), Some("operator"));
        assert!(resolved.decided_at.is_some());

        let err = mgr.resolve(approval.id, false, "someone-else", None).unwrap_err();
        assert!(matches!(err, TaiaError::ApprovalAlreadyResolved { .. }));
        assert_eq!(mgr.get(approval.id).unwrap().status, ApprovalStatus::Approved);
    }

    #[test]
    fn test_unknown_approval() {
        let mgr = manager();
        assert!(matches!(
            mgr.get(ApprovalId::new()).unwrap_err(),
            TaiaError::ApprovalNotFound(_)
        ));
        assert!(matches!(
            mgr.resolve(ApprovalId::new(), true, "op", None).unwrap_err(),
            TaiaError::ApprovalNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let mgr = manager();
        let approval = mgr.request("orchestration", serde_json::Value::Null).unwrap();
        let err = mgr
            .wait_for_decision(
                approval.id,
                Duration::from_millis(60),
                Duration::from_millis(10),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TaiaError::ApprovalTimeout { .. }));
    }

    #[tokio::test]
    async fn test_wait_sees_decision() {
        let mgr = Arc::new(manager());
        let approval = mgr.request("orchestration", serde_json::Value::Null).unwrap();

        let decider = mgr.clone();
        let id = approval.id;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            decider.resolve(id, false, "operator", None).unwrap();
        });

        let decided = mgr
            .wait_for_decision(id, Duration::from_secs(5), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(decided.status, ApprovalStatus::Rejected);
        assert_eq!(mgr.list(Some(ApprovalStatus::Rejected)).unwrap().len(), 1);
    }
}
