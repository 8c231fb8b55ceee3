//! The task bus: delegation, responses, the quality gate, cancellation,
//! crash recovery and stats.
//!
//! Task records are the only shared mutable state. Every change goes through
//! [`TaskStore::update_task`], a whole-record read-modify-write under the
//! store lock, and every status change is checked against
//! [`TaskStatus::can_transition_to`]. Crash recovery is the one exception:
//! it moves orphaned tasks back to `PENDING`.

use crate::approval::ApprovalManager;
use crate::error::KernelResult;
use crate::registry::AgentRegistry;
use crate::supervisor::Supervisor;
use crate::worker::WorkerSlot;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use taia_memory::tasks::TaskStore;
use taia_runtime::audit::{AuditAction, AuditLog};
use taia_runtime::bridge::SerializationBridge;
use taia_types::agent::{AgentId, AgentStatus};
use taia_types::approval::{Approval, ApprovalId, ApprovalStatus};
use taia_types::config::BusConfig;
use taia_types::error::TaiaError;
use taia_types::finding::{SecurityFinding, Severity};
use taia_types::skill::{Skill, SkillId};
use taia_types::task::{
    Batch, BatchId, BatchResult, BatchStatus, BusStats, RecoverySummary, ReviewLink,
    ReviewOutcome, ReviewResult, Task, TaskId, TaskMetadata, TaskQuota, TaskResponse,
    TaskResult, TaskSpec, TaskStatus,
};
use tracing::{debug, info, warn};

/// Options for a single delegation.
#[derive(Debug, Clone, Default)]
pub struct DelegateOptions {
    pub quota: Option<TaskQuota>,
    /// Correlation token shared by the sub-tasks of one plan.
    pub parent: Option<String>,
    pub batch_id: Option<BatchId>,
    /// Approved decision that admits a critical skill.
    pub approval_id: Option<ApprovalId>,
    /// Set on review tasks: the task under review.
    pub review_of: Option<TaskId>,
}

/// Options for a batch delegation.
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    pub parent: Option<String>,
    pub approval_id: Option<ApprovalId>,
    /// Quota for specs that do not carry their own.
    pub quota: Option<TaskQuota>,
}

/// Options for a task response.
#[derive(Debug, Clone, Default)]
pub struct RespondOptions {
    /// Responding agent; defaults to the task's target.
    pub agent_id: Option<AgentId>,
    /// Measured handler time; derived from `started_at` when absent.
    pub execution_time_ms: Option<u64>,
    /// Settle a code-producing result directly, without review.
    pub skip_quality_gate: bool,
}

/// Apply a checked status transition.
pub(crate) fn transition(task: &mut Task, next: TaskStatus) -> Result<(), TaiaError> {
    if !task.status.can_transition_to(next) {
        return Err(TaiaError::InvalidTransition {
            task: task.id.to_string(),
            from: task.status.to_string(),
            to: next.to_string(),
        });
    }
    task.status = next;
    Ok(())
}

/// The task orchestrator.
pub struct TaskBus {
    pub(crate) config: BusConfig,
    pub(crate) tasks: TaskStore,
    pub(crate) registry: Arc<AgentRegistry>,
    pub(crate) approvals: Arc<ApprovalManager>,
    pub(crate) bridge: Option<Arc<SerializationBridge>>,
    pub(crate) audit: Arc<AuditLog>,
    pub(crate) supervisor: Arc<Supervisor>,
    pub(crate) workers: DashMap<AgentId, WorkerSlot>,
    pub(crate) cycle_guards: DashMap<AgentId, Arc<AtomicBool>>,
}

impl TaskBus {
    pub fn new(
        config: BusConfig,
        tasks: TaskStore,
        registry: Arc<AgentRegistry>,
        approvals: Arc<ApprovalManager>,
        audit: Arc<AuditLog>,
        supervisor: Arc<Supervisor>,
    ) -> Self {
        Self {
            config,
            tasks,
            registry,
            approvals,
            bridge: None,
            audit,
            supervisor,
            workers: DashMap::new(),
            cycle_guards: DashMap::new(),
        }
    }

    /// Route mutating skills through `bridge` and express the critical-skill
    /// gate as a security finding.
    pub fn with_bridge(mut self, bridge: Arc<SerializationBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn approvals(&self) -> &Arc<ApprovalManager> {
        &self.approvals
    }

    fn is_code_producing(&self, skill: &SkillId) -> bool {
        self.config
            .code_producing_skills
            .iter()
            .any(|s| s == skill.as_str())
    }

    // -----------------------------------------------------------------------
    // Delegation
    // -----------------------------------------------------------------------

    /// Admit and persist a task addressed to `target`.
    ///
    /// All checks run before the task is written: both agents must exist,
    /// the target must hold the skill, and a critical skill needs an
    /// approved decision naming that skill and target. Refused without an
    /// approval id, a `delegation` decision is opened for the operator and
    /// its id is given in the error.
    pub fn delegate_task(
        &self,
        origin: &AgentId,
        target: &AgentId,
        skill: &SkillId,
        payload: serde_json::Value,
        options: DelegateOptions,
    ) -> KernelResult<Task> {
        if self.supervisor.is_shutting_down() {
            return Err(TaiaError::ShuttingDown.into());
        }
        if self.registry.get_agent(origin).is_none() {
            return Err(TaiaError::AgentNotFound(origin.to_string()).into());
        }
        let target_agent = self
            .registry
            .get_agent(target)
            .ok_or_else(|| TaiaError::AgentNotFound(target.to_string()))?;
        if target_agent.status == AgentStatus::Disabled {
            return Err(TaiaError::InvalidInput(format!("agent '{target}' is disabled")).into());
        }
        let skill_def = self
            .registry
            .get_skill(skill)
            .ok_or_else(|| TaiaError::SkillNotFound(skill.to_string()))?;
        if !self.registry.can_use_skill(target, skill) {
            return Err(TaiaError::PermissionDenied {
                agent: target.to_string(),
                skill: skill.to_string(),
            }
            .into());
        }
        if skill_def.is_critical() {
            self.check_critical_gate(origin, target, &skill_def, options.approval_id)?;
        }

        let task = Task {
            id: TaskId::new(),
            timestamp: Utc::now(),
            origin: origin.clone(),
            target: target.clone(),
            skill: skill.clone(),
            payload,
            quota: options.quota.unwrap_or_default(),
            parent: options.parent,
            status: TaskStatus::Pending,
            metadata: TaskMetadata {
                batch_id: options.batch_id,
                review_of: options.review_of,
                approval_id: options.approval_id,
                ..Default::default()
            },
        };
        self.tasks.insert_task(&task)?;

        for agent in [origin, target] {
            if let Err(e) = self.registry.touch_agent(agent, AgentStatus::Active) {
                warn!(agent = %agent, "Cannot record agent activity: {e}");
            }
        }
        self.audit.record_correlated(
            origin.as_str(),
            AuditAction::TaskDelegated,
            format!("{skill} -> {target}"),
            "ok",
            task.id.to_string(),
        );
        info!(task_id = %task.id, origin = %origin, target = %target, skill = %skill, "Task delegated");
        Ok(task)
    }

    fn check_critical_gate(
        &self,
        origin: &AgentId,
        target: &AgentId,
        skill: &Skill,
        approval_id: Option<ApprovalId>,
    ) -> KernelResult<()> {
        if let Some(id) = approval_id {
            let approval = self.approvals.get(id)?;
            match approval.status {
                ApprovalStatus::Approved if approval_covers(&approval, target, &skill.id) => {
                    debug!(skill = %skill.id, approval_id = %id, "Critical skill admitted by approval");
                    return Ok(());
                }
                ApprovalStatus::Approved => {
                    let reason = format!(
                        "approval {id} ({}) does not cover {} for {target}",
                        approval.kind, skill.id
                    );
                    warn!(origin = %origin, "Critical delegation refused: {reason}");
                    self.audit.record(
                        origin.as_str(),
                        AuditAction::PermissionDenied,
                        format!("{} -> {target}", skill.id),
                        reason.as_str(),
                    );
                    return Err(TaiaError::ApprovalRequired(reason).into());
                }
                ApprovalStatus::Rejected => {
                    return Err(TaiaError::ApprovalRejected(id.to_string()).into())
                }
                ApprovalStatus::WaitingForApproval => {}
            }
        }

        let reason = match &self.bridge {
            Some(bridge) => {
                let mut finding = SecurityFinding::new(
                    Severity::Critical,
                    format!("critical skill {} delegated to {target}", skill.id),
                )
                .with_target(skill.id.as_str());
                finding.description = format!("requested by {origin} without an approved decision");
                let verdict = bridge.handle_security_finding(&finding);
                if verdict.is_allowed() {
                    return Ok(());
                }
                verdict.reason
            }
            None => format!(
                "delegating critical skill '{}' needs an approved approval id",
                skill.id
            ),
        };
        if approval_id.is_some() {
            return Err(TaiaError::ApprovalRequired(reason).into());
        }

        // Open a decision the operator can approve and pass back in.
        let approval = self.approvals.request(
            "delegation",
            serde_json::json!({
                "origin": origin,
                "target": target,
                "skill": skill.id,
            }),
        )?;
        Err(TaiaError::ApprovalRequired(format!("{reason}; approval {} requested", approval.id)).into())
    }

    /// Delegate several tasks under one batch id and parent token.
    ///
    /// Specs that fail admission are reported in `rejected` and do not stop
    /// the rest. Does not wait for completion.
    pub fn delegate_batch(
        &self,
        origin: &AgentId,
        specs: Vec<TaskSpec>,
        options: BatchOptions,
    ) -> KernelResult<BatchResult> {
        if specs.is_empty() {
            return Err(TaiaError::InvalidInput("batch has no tasks".to_string()).into());
        }
        let batch_id = BatchId::new();
        let parent = options
            .parent
            .unwrap_or_else(|| format!("batch-{batch_id}"));

        let mut tasks = Vec::new();
        let mut rejected = Vec::new();
        for (idx, spec) in specs.into_iter().enumerate() {
            let delegated = self.delegate_task(
                origin,
                &spec.target,
                &spec.skill,
                spec.payload,
                DelegateOptions {
                    quota: spec.quota.or_else(|| options.quota.clone()),
                    parent: Some(parent.clone()),
                    batch_id: Some(batch_id),
                    approval_id: options.approval_id,
                    review_of: None,
                },
            );
            match delegated {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    warn!(batch_id = %batch_id, index = idx, "Batch task rejected: {e}");
                    rejected.push((idx, e.to_string()));
                }
            }
        }

        let batch = Batch {
            id: batch_id,
            parent,
            origin: origin.clone(),
            task_ids: tasks.iter().map(|t| t.id).collect(),
            created_at: Utc::now(),
            status: if tasks.is_empty() {
                BatchStatus::Completed
            } else {
                BatchStatus::Dispatched
            },
        };
        self.tasks.save_batch(&batch)?;
        info!(
            batch_id = %batch_id,
            dispatched = tasks.len(),
            rejected = rejected.len(),
            "Batch delegated"
        );
        Ok(BatchResult {
            batch,
            tasks,
            rejected,
        })
    }

    // -----------------------------------------------------------------------
    // Responses and the quality gate
    // -----------------------------------------------------------------------

    /// Record the outcome of a running task.
    ///
    /// A successful code-producing result goes to `REVIEW_PENDING` and a
    /// review task is delegated to the reviewer; everything else settles
    /// directly. A task can be responded to once: a second call, or a call
    /// for a cancelled task, is rejected.
    pub fn respond_to_task(
        &self,
        request_id: TaskId,
        result: TaskResult,
        options: RespondOptions,
    ) -> KernelResult<TaskResponse> {
        let task = self
            .tasks
            .get_task(request_id)?
            .ok_or_else(|| TaiaError::TaskNotFound(request_id.to_string()))?;
        let direct = if result.success {
            TaskStatus::Success
        } else {
            TaskStatus::Failed
        };
        match task.status {
            TaskStatus::Running => {}
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::ReviewPending => {
                return Err(TaiaError::AlreadyResponded(request_id.to_string()).into())
            }
            TaskStatus::Pending | TaskStatus::Cancelled => {
                return Err(TaiaError::InvalidTransition {
                    task: request_id.to_string(),
                    from: task.status.to_string(),
                    to: direct.to_string(),
                }
                .into())
            }
        }

        let gated =
            result.success && !options.skip_quality_gate && self.is_code_producing(&task.skill);
        let next = if gated {
            TaskStatus::ReviewPending
        } else {
            direct
        };
        let finished = Utc::now();
        let settled = self.tasks.update_task(request_id, |t| {
            if t.status != TaskStatus::Running {
                return Err(TaiaError::AlreadyResponded(request_id.to_string()));
            }
            transition(t, next)?;
            t.metadata.finished_at = Some(finished);
            Ok(())
        })?;

        let mut status = next;
        let mut error = result.error.clone();
        if gated {
            match self.delegate_review(&settled, &result) {
                Ok(review) => {
                    self.link_review(request_id, review.id)?;
                    debug!(task_id = %request_id, review_id = %review.id, "Quality gate triggered");
                }
                Err(e) => {
                    warn!(task_id = %request_id, "Quality gate unavailable: {e}");
                    let note = format!("quality gate unavailable: {e}");
                    self.tasks.update_task(request_id, |t| {
                        transition(t, TaskStatus::Failed)?;
                        t.metadata.recovery_note = Some(note.clone());
                        Ok(())
                    })?;
                    status = TaskStatus::Failed;
                    error = Some(note);
                }
            }
        }

        let execution_time_ms = options.execution_time_ms.unwrap_or_else(|| {
            settled
                .metadata
                .started_at
                .map(|s| (finished - s).num_milliseconds().max(0) as u64)
                .unwrap_or(0)
        });
        let response = TaskResponse {
            request_id,
            timestamp: finished,
            agent_id: options.agent_id.unwrap_or_else(|| task.target.clone()),
            status,
            result: result.output.clone(),
            error,
            execution_time_ms,
            qa_triggered: gated,
            requires_approval: status == TaskStatus::ReviewPending,
        };
        self.tasks.save_response(&response)?;
        self.audit.record_correlated(
            response.agent_id.as_str(),
            AuditAction::TaskResponded,
            task.skill.as_str(),
            status.as_str(),
            request_id.to_string(),
        );
        info!(task_id = %request_id, status = %status, "Task responded");

        if task.metadata.review_of.is_some() {
            if let Some(review) = review_from_result(&result) {
                if let Err(e) = self.submit_qa_review(request_id, review) {
                    warn!(review_id = %request_id, "Automatic review settlement failed: {e}");
                }
            }
        }
        Ok(response)
    }

    fn delegate_review(&self, original: &Task, result: &TaskResult) -> KernelResult<Task> {
        let payload = serde_json::json!({
            "review_of": original.id,
            "skill": original.skill,
            "payload": original.payload,
            "result": result.output,
        });
        self.delegate_task(
            &original.target,
            &AgentId::new(self.config.reviewer_agent.as_str()),
            &SkillId::new(self.config.review_skill.as_str()),
            payload,
            DelegateOptions {
                parent: original.parent.clone(),
                review_of: Some(original.id),
                ..Default::default()
            },
        )
    }

    /// Record `review` as the review task of `original`, both in the link
    /// table and on the original's record. Missing halves are filled in.
    fn link_review(&self, original: TaskId, review: TaskId) -> KernelResult<()> {
        if self.tasks.get_review_link(review)?.is_none() {
            self.tasks.insert_review_link(&ReviewLink {
                original_request_id: original,
                qa_request_id: review,
                created_at: Utc::now(),
            })?;
        }
        self.tasks.update_task(original, |t| {
            t.metadata.review_task_id = Some(review);
            Ok(())
        })?;
        Ok(())
    }

    /// Settle the task under review from the reviewer's verdict.
    ///
    /// Approval settles it `SUCCESS`; rejection settles it `FAILED` with the
    /// feedback and issues kept on the record, and recommends a retry.
    pub fn submit_qa_review(
        &self,
        review_request_id: TaskId,
        review: ReviewResult,
    ) -> KernelResult<ReviewOutcome> {
        // The review task's own record names its original when the link row
        // was never written.
        let original_id = match self.tasks.get_review_link(review_request_id)? {
            Some(link) => link.original_request_id,
            None => self
                .tasks
                .get_task(review_request_id)?
                .and_then(|t| t.metadata.review_of)
                .ok_or_else(|| TaiaError::ReviewLinkNotFound(review_request_id.to_string()))?,
        };
        let original = self
            .tasks
            .get_task(original_id)?
            .ok_or_else(|| TaiaError::TaskNotFound(original_id.to_string()))?;
        if original.status != TaskStatus::ReviewPending {
            return Err(TaiaError::AlreadyResponded(original_id.to_string()).into());
        }

        let next = if review.approved {
            TaskStatus::Success
        } else {
            TaskStatus::Failed
        };
        let now = Utc::now();
        self.tasks.update_task(original_id, |t| {
            if t.status != TaskStatus::ReviewPending {
                return Err(TaiaError::AlreadyResponded(original_id.to_string()));
            }
            transition(t, next)?;
            t.metadata.review = Some(review.clone());
            t.metadata.finished_at = Some(now);
            Ok(())
        })?;

        let mut response = self
            .tasks
            .get_response(original_id)?
            .unwrap_or_else(|| TaskResponse {
                request_id: original_id,
                timestamp: now,
                agent_id: original.target.clone(),
                status: next,
                result: serde_json::Value::Null,
                error: None,
                execution_time_ms: 0,
                qa_triggered: true,
                requires_approval: false,
            });
        response.status = next;
        response.timestamp = now;
        response.requires_approval = false;
        if !review.approved {
            response.error = Some(
                review
                    .feedback
                    .clone()
                    .unwrap_or_else(|| "rejected by review".to_string()),
            );
        }
        self.tasks.save_response(&response)?;
        self.retire_review_task(review_request_id);

        self.audit.record_correlated(
            self.config.reviewer_agent.as_str(),
            AuditAction::ReviewSubmitted,
            format!("review {review_request_id}"),
            next.as_str(),
            original_id.to_string(),
        );
        info!(task_id = %original_id, review_id = %review_request_id, status = %next, "Review settled");

        Ok(ReviewOutcome {
            original_request_id: original_id,
            review_request_id,
            status: next,
            retry_recommended: !review.approved,
            feedback: review.feedback,
            issues: review.issues,
        })
    }

    /// A verdict submitted directly leaves the review task unclaimed;
    /// cancel it so no reviewer picks it up afterwards.
    fn retire_review_task(&self, review_request_id: TaskId) {
        let pending = matches!(
            self.tasks.get_active(review_request_id),
            Ok(Some(t)) if t.status == TaskStatus::Pending
        );
        if !pending {
            return;
        }
        let retired = self.tasks.update_task(review_request_id, |t| {
            transition(t, TaskStatus::Cancelled)?;
            t.metadata.cancelled_by = Some(self.config.reviewer_agent.clone());
            t.metadata.cancel_reason = Some("verdict submitted directly".to_string());
            t.metadata.finished_at = Some(Utc::now());
            Ok(())
        });
        if let Err(e) = retired {
            warn!(review_id = %review_request_id, "Cannot retire review task: {e}");
        }
    }

    // -----------------------------------------------------------------------
    // Cancellation and recovery
    // -----------------------------------------------------------------------

    /// Mark a pending or running task cancelled and archive it.
    ///
    /// A running handler is not interrupted; its late response is rejected.
    pub fn cancel_task(
        &self,
        id: TaskId,
        actor: &str,
        reason: Option<String>,
    ) -> KernelResult<Task> {
        let current = self
            .tasks
            .get_task(id)?
            .ok_or_else(|| TaiaError::TaskNotFound(id.to_string()))?;
        if !current.status.can_transition_to(TaskStatus::Cancelled) {
            return Err(TaiaError::InvalidTransition {
                task: id.to_string(),
                from: current.status.to_string(),
                to: TaskStatus::Cancelled.to_string(),
            }
            .into());
        }

        let now = Utc::now();
        let message = reason
            .clone()
            .unwrap_or_else(|| format!("cancelled by {actor}"));
        let cancelled = self.tasks.update_task(id, |t| {
            transition(t, TaskStatus::Cancelled)?;
            t.metadata.cancelled_by = Some(actor.to_string());
            t.metadata.cancel_reason = reason;
            t.metadata.finished_at = Some(now);
            Ok(())
        })?;
        self.tasks.save_response(&TaskResponse {
            request_id: id,
            timestamp: now,
            agent_id: cancelled.target.clone(),
            status: TaskStatus::Cancelled,
            result: serde_json::Value::Null,
            error: Some(message),
            execution_time_ms: 0,
            qa_triggered: false,
            requires_approval: false,
        })?;
        self.audit.record_correlated(
            actor,
            AuditAction::TaskCancelled,
            cancelled.skill.as_str(),
            "cancelled",
            id.to_string(),
        );
        info!(task_id = %id, actor = %actor, "Task cancelled");
        Ok(cancelled)
    }

    /// Recover tasks orphaned by a crash.
    ///
    /// Each `RUNNING` task is reset to `PENDING` with its retry counter
    /// incremented, unless the counter has reached the configured maximum,
    /// in which case it is failed permanently with a recovery note.
    ///
    /// `REVIEW_PENDING` tasks interrupted inside the quality gate are then
    /// relinked to their review task, given a new one, or re-run.
    pub fn initialize_bus_recovery(&self) -> KernelResult<RecoverySummary> {
        let running = self.tasks.list_active(Some(TaskStatus::Running))?;
        let mut summary = RecoverySummary {
            scanned: running.len() as u64,
            ..Default::default()
        };
        for task in &running {
            self.recover_orphan(task, &mut summary)?;
        }

        let awaiting = self.tasks.list_active(Some(TaskStatus::ReviewPending))?;
        if !awaiting.is_empty() {
            let mut reviews: HashMap<TaskId, Task> = self
                .tasks
                .list_active(None)?
                .into_iter()
                .filter_map(|t| t.metadata.review_of.map(|of| (of, t)))
                .collect();
            for task in &awaiting {
                let review = match task.metadata.review_task_id {
                    Some(id) => self.tasks.get_task(id)?,
                    None => reviews.remove(&task.id),
                };
                self.recover_review(task, review, &mut summary)?;
            }
        }

        self.supervisor.record_recovery(summary.reset);
        if summary.scanned > 0 {
            info!(
                scanned = summary.scanned,
                reset = summary.reset,
                failed = summary.failed,
                relinked = summary.reviews_relinked,
                redelegated = summary.reviews_redelegated,
                "Bus recovery complete"
            );
        }
        Ok(summary)
    }

    /// Reset an orphaned task to `PENDING`, or fail it once its retries are
    /// spent.
    fn recover_orphan(&self, task: &Task, summary: &mut RecoverySummary) -> KernelResult<()> {
        let retries = task.metadata.retry_count;
        let max = self.config.max_retries;
        if retries >= max {
            let note = format!("abandoned by worker after {retries} recoveries (max {max})");
            if self.fail_recovered(task, note)? {
                summary.failed += 1;
                summary.failed_ids.push(task.id);
            }
            return Ok(());
        }

        let attempt = retries + 1;
        let from = task.status;
        let reset = self.tasks.update_task(task.id, |t| {
            if t.status != from {
                return Err(TaiaError::InvalidTransition {
                    task: t.id.to_string(),
                    from: t.status.to_string(),
                    to: TaskStatus::Pending.to_string(),
                });
            }
            t.status = TaskStatus::Pending;
            t.metadata.retry_count = attempt;
            t.metadata.worker_id = None;
            t.metadata.started_at = None;
            t.metadata.finished_at = None;
            t.metadata.review_task_id = None;
            t.metadata.recovery_note =
                Some(format!("reset after restart (retry {attempt} of {max})"));
            Ok(())
        });
        if let Err(e) = reset {
            warn!(task_id = %task.id, "Recovery could not reset task: {e}");
            return Ok(());
        }
        self.audit.record_correlated(
            "recovery",
            AuditAction::TaskRecovered,
            task.skill.as_str(),
            format!("reset retry={attempt}"),
            task.id.to_string(),
        );
        summary.reset += 1;
        summary.reset_ids.push(task.id);
        Ok(())
    }

    /// Fail a task found during recovery. Returns false when its record
    /// could not be moved.
    fn fail_recovered(&self, task: &Task, note: String) -> KernelResult<bool> {
        let failed = self.tasks.update_task(task.id, |t| {
            transition(t, TaskStatus::Failed)?;
            t.metadata.recovery_note = Some(note.clone());
            t.metadata.finished_at = Some(Utc::now());
            Ok(())
        });
        if let Err(e) = failed {
            warn!(task_id = %task.id, "Recovery could not fail task: {e}");
            return Ok(false);
        }
        self.tasks.save_response(&TaskResponse {
            request_id: task.id,
            timestamp: Utc::now(),
            agent_id: task.target.clone(),
            status: TaskStatus::Failed,
            result: serde_json::Value::Null,
            error: Some(note),
            execution_time_ms: 0,
            qa_triggered: task.status == TaskStatus::ReviewPending,
            requires_approval: false,
        })?;
        self.audit.record_correlated(
            "recovery",
            AuditAction::TaskRecovered,
            task.skill.as_str(),
            "failed",
            task.id.to_string(),
        );
        Ok(true)
    }

    /// Repair one `REVIEW_PENDING` task given the review task found for it.
    ///
    /// - A live or settled review task is linked back to the original, and
    ///   a settled one's verdict is applied.
    /// - With no usable review task, the review is delegated again from the
    ///   saved response.
    /// - When no response was saved the result is lost, and the task is
    ///   re-run like an orphaned `RUNNING` task.
    fn recover_review(
        &self,
        task: &Task,
        review: Option<Task>,
        summary: &mut RecoverySummary,
    ) -> KernelResult<()> {
        if let Some(review) = review.filter(|r| r.status != TaskStatus::Cancelled) {
            let linked = task.metadata.review_task_id == Some(review.id)
                && self.tasks.get_review_link(review.id)?.is_some();
            let verdict = if review.status.is_terminal() {
                self.tasks.get_response(review.id)?.and_then(|r| {
                    review_from_result(&TaskResult {
                        success: r.status == TaskStatus::Success,
                        output: r.result,
                        error: r.error,
                    })
                })
            } else {
                None
            };
            if linked && verdict.is_none() {
                return Ok(());
            }

            summary.scanned += 1;
            self.link_review(task.id, review.id)?;
            if let Some(verdict) = verdict {
                self.submit_qa_review(review.id, verdict)?;
            }
            self.audit.record_correlated(
                "recovery",
                AuditAction::TaskRecovered,
                task.skill.as_str(),
                format!("review {} relinked", review.id),
                task.id.to_string(),
            );
            summary.reviews_relinked += 1;
            return Ok(());
        }

        summary.scanned += 1;
        let Some(response) = self.tasks.get_response(task.id)? else {
            warn!(task_id = %task.id, "Result under review was lost; re-running task");
            return self.recover_orphan(task, summary);
        };
        let result = TaskResult::success(response.result);
        match self.delegate_review(task, &result) {
            Ok(review) => {
                self.link_review(task.id, review.id)?;
                self.audit.record_correlated(
                    "recovery",
                    AuditAction::TaskRecovered,
                    task.skill.as_str(),
                    format!("review re-delegated as {}", review.id),
                    task.id.to_string(),
                );
                summary.reviews_redelegated += 1;
            }
            Err(e) => {
                let note = format!("quality gate unavailable after restart: {e}");
                if self.fail_recovered(task, note)? {
                    summary.failed += 1;
                    summary.failed_ids.push(task.id);
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get_stats(&self) -> KernelResult<BusStats> {
        let counts = self.tasks.count_by_status()?;
        let count = |s: TaskStatus| counts.by_status.get(&s).copied().unwrap_or(0);
        Ok(BusStats {
            pending: count(TaskStatus::Pending),
            running: count(TaskStatus::Running),
            review_pending: count(TaskStatus::ReviewPending),
            success: count(TaskStatus::Success),
            failed: count(TaskStatus::Failed),
            cancelled: count(TaskStatus::Cancelled),
            archived: counts.archived,
            approvals_waiting: self.approvals.count_waiting()?,
            active_workers: self.workers.len() as u64,
        })
    }

    pub fn get_task(&self, id: TaskId) -> KernelResult<Task> {
        Ok(self
            .tasks
            .get_task(id)?
            .ok_or_else(|| TaiaError::TaskNotFound(id.to_string()))?)
    }

    pub fn get_response(&self, id: TaskId) -> KernelResult<Option<TaskResponse>> {
        Ok(self.tasks.get_response(id)?)
    }

    pub fn is_archived(&self, id: TaskId) -> KernelResult<bool> {
        Ok(self.tasks.is_archived(id)?)
    }

    /// Batch bookkeeping; marked completed once every task has settled.
    pub fn get_batch(&self, id: BatchId) -> KernelResult<Batch> {
        let mut batch = self
            .tasks
            .get_batch(id)?
            .ok_or_else(|| TaiaError::BatchNotFound(id.to_string()))?;
        if batch.status == BatchStatus::Dispatched {
            let mut settled = true;
            for task_id in &batch.task_ids {
                if !self.tasks.is_archived(*task_id)? {
                    settled = false;
                    break;
                }
            }
            if settled {
                batch.status = BatchStatus::Completed;
                self.tasks.save_batch(&batch)?;
            }
        }
        Ok(batch)
    }

    /// Tasks in `status` (queue or archive), or the whole queue plus the
    /// `limit` most recently archived tasks.
    pub fn list_tasks(&self, status: Option<TaskStatus>, limit: usize) -> KernelResult<Vec<Task>> {
        let tasks = match status {
            Some(s) if s.is_terminal() => self.tasks.list_archived(Some(s), limit)?,
            Some(s) => self.tasks.list_active(Some(s))?,
            None => {
                let mut all = self.tasks.list_active(None)?;
                all.extend(self.tasks.list_archived(None, limit)?);
                all
            }
        };
        Ok(tasks)
    }
}

/// Whether an approved decision was granted for `skill` on `target`.
///
/// A delegation approval must name both; an orchestration approval must
/// list them as one of its plan's tasks.
fn approval_covers(approval: &Approval, target: &AgentId, skill: &SkillId) -> bool {
    let names = |v: &serde_json::Value| {
        v.get("skill").and_then(|s| s.as_str()) == Some(skill.as_str())
            && v.get("target").and_then(|t| t.as_str()) == Some(target.as_str())
    };
    match approval.kind.as_str() {
        "delegation" => names(&approval.payload),
        "orchestration" => approval
            .payload
            .get("tasks")
            .and_then(|t| t.as_array())
            .is_some_and(|tasks| tasks.iter().any(names)),
        _ => false,
    }
}

/// A reviewer's verdict carried in a review task's result, if any.
///
/// A failed review task counts as a rejection so the original does not
/// wait forever.
fn review_from_result(result: &TaskResult) -> Option<ReviewResult> {
    if !result.success {
        return Some(ReviewResult {
            approved: false,
            feedback: Some(format!(
                "review failed: {}",
                result.error.as_deref().unwrap_or("unknown error")
            )),
            issues: vec![],
        });
    }
    match result.output.get("approved") {
        Some(v) if v.is_boolean() => serde_json::from_value(result.output.clone()).ok(),
        _ => None,
    }
}
