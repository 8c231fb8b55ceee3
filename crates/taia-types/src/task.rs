//! Task (delegation request) records, responses, review links and batches.

use crate::agent::AgentId;
use crate::approval::ApprovalId;
use crate::skill::SkillId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Unique identifier for a batch of delegated tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(pub Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for BatchId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

/// Task lifecycle status.
///
/// `PENDING -> RUNNING -> {REVIEW_PENDING -> {SUCCESS|FAILED}} | SUCCESS | FAILED`,
/// with `CANCELLED` reachable from `PENDING` or `RUNNING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    ReviewPending,
    Success,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// All statuses, in state-machine order.
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::ReviewPending,
        TaskStatus::Success,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    /// Terminal statuses trigger archival.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether `next` is a legal forward move from `self`.
    ///
    /// Crash recovery (`RUNNING -> PENDING`) is not a forward move and is
    /// applied by the recovery path only.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, ReviewPending)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Cancelled)
                | (ReviewPending, Success)
                | (ReviewPending, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::ReviewPending => "REVIEW_PENDING",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| format!("unknown task status '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// Task record
// ---------------------------------------------------------------------------

/// Advisory execution quota. Recorded on the task, not enforced as a hard limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskQuota {
    /// Maximum wall-clock time in seconds.
    pub max_duration_secs: u64,
    /// Maximum number of invocations.
    pub max_invocations: u32,
}

impl Default for TaskQuota {
    fn default() -> Self {
        Self {
            max_duration_secs: 300,
            max_invocations: 10,
        }
    }
}

/// Human review verdict for a code-producing task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewResult {
    pub approved: bool,
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default)]
    pub issues: Vec<String>,
}

/// Mutable bookkeeping attached to a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub batch_id: Option<BatchId>,
    /// Number of times crash recovery has reset this task.
    #[serde(default)]
    pub retry_count: u32,
    /// Set on a review task: the task under review.
    #[serde(default)]
    pub review_of: Option<TaskId>,
    /// Set on a code-producing task: its review task.
    #[serde(default)]
    pub review_task_id: Option<TaskId>,
    /// Review verdict once settled.
    #[serde(default)]
    pub review: Option<ReviewResult>,
    #[serde(default)]
    pub recovery_note: Option<String>,
    #[serde(default)]
    pub cancelled_by: Option<String>,
    #[serde(default)]
    pub cancel_reason: Option<String>,
    /// Approval under which a critical skill was delegated.
    #[serde(default)]
    pub approval_id: Option<ApprovalId>,
}

/// A durable delegation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub timestamp: DateTime<Utc>,
    pub origin: AgentId,
    pub target: AgentId,
    pub skill: SkillId,
    pub payload: serde_json::Value,
    pub quota: TaskQuota,
    /// Correlation token shared by sub-tasks of one plan/batch.
    pub parent: Option<String>,
    pub status: TaskStatus,
    pub metadata: TaskMetadata,
}

/// The outcome a handler returns for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl TaskResult {
    pub fn success(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            error: Some(error.into()),
        }
    }
}

/// The single response record written for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    pub request_id: TaskId,
    pub timestamp: DateTime<Utc>,
    pub agent_id: AgentId,
    pub status: TaskStatus,
    pub result: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
    pub execution_time_ms: u64,
    pub qa_triggered: bool,
    pub requires_approval: bool,
}

/// Link from a review task back to the task under review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewLink {
    pub original_request_id: TaskId,
    pub qa_request_id: TaskId,
    pub created_at: DateTime<Utc>,
}

/// Result of settling a review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewOutcome {
    pub original_request_id: TaskId,
    pub review_request_id: TaskId,
    pub status: TaskStatus,
    /// Set when the review rejected the work.
    pub retry_recommended: bool,
    pub feedback: Option<String>,
    pub issues: Vec<String>,
}

// ---------------------------------------------------------------------------
// Batches
// ---------------------------------------------------------------------------

/// One entry of a batch or plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub target: AgentId,
    pub skill: SkillId,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub quota: Option<TaskQuota>,
}

/// Batch bookkeeping status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Dispatched,
    Completed,
}

/// A grouping of tasks delegated together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub parent: String,
    pub origin: AgentId,
    pub task_ids: Vec<TaskId>,
    pub created_at: DateTime<Utc>,
    pub status: BatchStatus,
}

/// Result of a batched fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch: Batch,
    pub tasks: Vec<Task>,
    /// Specs that were rejected at admission, by position, with the reason.
    pub rejected: Vec<(usize, String)>,
}

// ---------------------------------------------------------------------------
// Summaries
// ---------------------------------------------------------------------------

/// Aggregate counts for observability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusStats {
    pub pending: u64,
    pub running: u64,
    pub review_pending: u64,
    pub success: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Tasks moved to the archive.
    pub archived: u64,
    pub approvals_waiting: u64,
    pub active_workers: u64,
}

/// Result of a startup recovery scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoverySummary {
    /// Orphaned records found: every `RUNNING` task, plus `REVIEW_PENDING`
    /// tasks that needed repair.
    pub scanned: u64,
    /// Orphaned tasks reset to `PENDING`.
    pub reset: u64,
    /// Orphaned tasks that exhausted their retries, or could not be
    /// reviewed, and were failed.
    pub failed: u64,
    pub reset_ids: Vec<TaskId>,
    pub failed_ids: Vec<TaskId>,
    /// Reviews whose link to the task under review was restored.
    #[serde(default)]
    pub reviews_relinked: u64,
    /// Reviews delegated again because the review task was lost.
    #[serde(default)]
    pub reviews_redelegated: u64,
}

/// Aggregated result of an approval-gated orchestration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationSummary {
    pub approval_id: ApprovalId,
    pub batch_id: BatchId,
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Tasks still unresolved when the wait ended.
    pub unresolved: u64,
    pub rejected_at_admission: u64,
    pub timed_out: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(ReviewPending));
        assert!(ReviewPending.can_transition_to(Success));
        assert!(ReviewPending.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Cancelled));
    }

    #[test]
    fn test_no_skipping_running() {
        use TaskStatus::*;
        assert!(!Pending.can_transition_to(Success));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(ReviewPending));
        assert!(!ReviewPending.can_transition_to(Cancelled));
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [TaskStatus::Success, TaskStatus::Failed, TaskStatus::Cancelled] {
            assert!(terminal.is_terminal());
            for next in TaskStatus::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_status_wire_format() {
        let json = serde_json::to_string(&TaskStatus::ReviewPending).unwrap();
        assert_eq!(json, "\"REVIEW_PENDING\"");
        assert_eq!(
            "review_pending".parse::<TaskStatus>().unwrap(),
            TaskStatus::ReviewPending
        );
    }

    #[test]
    fn test_metadata_defaults_on_old_records() {
        let meta: TaskMetadata = serde_json::from_str(r#"{"worker_id":"w1"}"#).unwrap();
        assert_eq!(meta.worker_id.as_deref(), Some("w1"));
        assert_eq!(meta.retry_count, 0);
        assert!(meta.review.is_none());
    }
}
