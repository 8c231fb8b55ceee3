//! Shared error types for the TAIA federation.

use thiserror::Error;

/// Top-level error type for the federation core.
#[derive(Error, Debug)]
pub enum TaiaError {
    /// The requested agent is not registered.
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// An agent with this ID already exists.
    #[error("Agent already exists: {0}")]
    AgentAlreadyExists(String),

    /// The requested skill is not registered.
    #[error("Skill not found: {0}")]
    SkillNotFound(String),

    /// A skill with this ID already exists.
    #[error("Skill already exists: {0}")]
    SkillAlreadyExists(String),

    /// The agent does not hold the permission for the skill.
    #[error("Permission denied: agent '{agent}' may not use skill '{skill}'")]
    PermissionDenied {
        /// The agent that was checked.
        agent: String,
        /// The skill that was requested.
        skill: String,
    },

    /// A critical operation needs a human decision before it can proceed.
    #[error("Human approval required: {0}")]
    ApprovalRequired(String),

    /// The requested task does not exist (neither active nor archived).
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// The requested batch does not exist.
    #[error("Batch not found: {0}")]
    BatchNotFound(String),

    /// A task status transition that the state machine does not allow.
    #[error("Invalid task transition for {task}: {from} -> {to}")]
    InvalidTransition {
        /// Task identifier.
        task: String,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// A response was already recorded for this task.
    #[error("Task {0} has already been responded to")]
    AlreadyResponded(String),

    /// No review link exists for the given review task.
    #[error("No review link for review task {0}")]
    ReviewLinkNotFound(String),

    /// The requested approval record does not exist.
    #[error("Approval not found: {0}")]
    ApprovalNotFound(String),

    /// The approval has already been decided.
    #[error("Approval {id} is already {status}")]
    ApprovalAlreadyResolved {
        /// Approval identifier.
        id: String,
        /// The status it was resolved to.
        status: String,
    },

    /// A human rejected the approval.
    #[error("Approval {0} was rejected")]
    ApprovalRejected(String),

    /// Waiting for a human decision exceeded the configured bound.
    #[error("Timed out after {secs}s waiting for approval {id}")]
    ApprovalTimeout {
        /// Approval identifier.
        id: String,
        /// How long the wait lasted.
        secs: u64,
    },

    /// A record store error occurred.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid caller input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The kernel is shutting down.
    #[error("Shutdown in progress")]
    ShuttingDown,

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for TaiaError {
    fn from(e: serde_json::Error) -> Self {
        TaiaError::Serialization(e.to_string())
    }
}

/// Alias for Result with TaiaError.
pub type TaiaResult<T> = Result<T, TaiaError>;
