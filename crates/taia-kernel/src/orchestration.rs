//! Approval-gated orchestration of a development plan.
//!
//! Nothing is delegated until a human approves the plan. Once approved the
//! plan fans out as one batch and the call waits for every task to settle,
//! bounded by the completion timeout.

use crate::bus::{BatchOptions, TaskBus};
use crate::error::KernelResult;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use taia_types::agent::AgentId;
use taia_types::approval::{ApprovalId, ApprovalStatus};
use taia_types::error::TaiaError;
use taia_types::task::{OrchestrationSummary, TaskId, TaskSpec, TaskStatus};
use tokio::time::Instant;
use tracing::{info, warn};

/// A multi-step plan submitted for approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevelopmentPlan {
    pub origin: AgentId,
    pub description: String,
    pub tasks: Vec<TaskSpec>,
    /// Parent token for the batch; generated from the batch id when absent.
    #[serde(default)]
    pub parent: Option<String>,
}

/// Overrides for the configured waits.
#[derive(Debug, Clone, Default)]
pub struct OrchestrateOptions {
    /// Reuse an existing approval instead of requesting a new one.
    pub approval_id: Option<ApprovalId>,
    pub approval_timeout: Option<Duration>,
    pub completion_timeout: Option<Duration>,
    pub poll_interval: Option<Duration>,
}

#[derive(Default)]
struct Tally {
    succeeded: u64,
    failed: u64,
    cancelled: u64,
    unresolved: u64,
}

impl TaskBus {
    /// Request approval for `plan`, then delegate and await it.
    ///
    /// Fails with `ApprovalTimeout` or `ApprovalRejected` before any task is
    /// created. A completion timeout is not an error: the summary reports
    /// the unresolved tasks with `timed_out` set.
    pub async fn orchestrate_development_task(
        &self,
        plan: DevelopmentPlan,
        options: OrchestrateOptions,
    ) -> KernelResult<OrchestrationSummary> {
        if plan.tasks.is_empty() {
            return Err(TaiaError::InvalidInput("plan has no tasks".to_string()).into());
        }
        let poll = options
            .poll_interval
            .unwrap_or(Duration::from_millis(self.config.approval_poll_interval_ms));
        let approval_timeout = options
            .approval_timeout
            .unwrap_or(Duration::from_secs(self.config.approval_timeout_secs));
        let completion_timeout = options
            .completion_timeout
            .unwrap_or(Duration::from_secs(self.config.completion_timeout_secs));

        let approval = match options.approval_id {
            Some(id) => self.approvals.get(id)?,
            None => self.approvals.request(
                "orchestration",
                serde_json::json!({
                    "origin": plan.origin,
                    "description": plan.description,
                    "tasks": plan.tasks,
                }),
            )?,
        };
        let approval = if approval.status.is_resolved() {
            approval
        } else {
            info!(approval_id = %approval.id, "Plan waiting for human approval");
            self.approvals
                .wait_for_decision(approval.id, approval_timeout, poll)
                .await?
        };
        if approval.status == ApprovalStatus::Rejected {
            warn!(approval_id = %approval.id, "Plan rejected, nothing delegated");
            return Err(TaiaError::ApprovalRejected(approval.id.to_string()).into());
        }

        let dispatched = self.delegate_batch(
            &plan.origin,
            plan.tasks,
            BatchOptions {
                parent: plan.parent,
                approval_id: Some(approval.id),
                quota: None,
            },
        )?;
        let ids: Vec<TaskId> = dispatched.tasks.iter().map(|t| t.id).collect();

        let deadline = Instant::now() + completion_timeout;
        let (tally, timed_out) = loop {
            let tally = self.tally(&ids)?;
            if tally.unresolved == 0 {
                break (tally, false);
            }
            let now = Instant::now();
            if now >= deadline {
                break (tally, true);
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        };

        let summary = OrchestrationSummary {
            approval_id: approval.id,
            batch_id: dispatched.batch.id,
            total: ids.len() as u64,
            succeeded: tally.succeeded,
            failed: tally.failed,
            cancelled: tally.cancelled,
            unresolved: tally.unresolved,
            rejected_at_admission: dispatched.rejected.len() as u64,
            timed_out,
        };
        info!(
            batch_id = %summary.batch_id,
            succeeded = summary.succeeded,
            failed = summary.failed,
            unresolved = summary.unresolved,
            timed_out,
            "Orchestration finished"
        );
        Ok(summary)
    }

    fn tally(&self, ids: &[TaskId]) -> KernelResult<Tally> {
        let mut tally = Tally::default();
        for id in ids {
            match self.tasks.get_task(*id)?.map(|t| t.status) {
                Some(TaskStatus::Success) => tally.succeeded += 1,
                Some(TaskStatus::Failed) => tally.failed += 1,
                Some(TaskStatus::Cancelled) => tally.cancelled += 1,
                _ => tally.unresolved += 1,
            }
        }
        Ok(tally)
    }
}
