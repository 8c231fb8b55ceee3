//! Clap CLI definitions for TAIA.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
Examples:
  taia status                          Queue, approval and worker counts
  taia agent register doc-sentinel     Register an agent (prints its token once)
  taia skill grant doc-sentinel WRITE_DOCS
  taia delegate doc-sentinel WRITE_DOCS --payload '{\"target\":\"README.md\"}'
  taia approval list --waiting         Decisions waiting for a human
  taia approval approve <id>           Approve a plan or critical delegation
  taia audit verify                    Check the audit hash chain";

/// TAIA: a federation of agents with permissioned skills and a serialized
/// mutation bridge.
#[derive(Parser)]
#[command(name = "taia", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Print machine-readable JSON instead of tables.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show bus counts, supervisor health and audit chain state.
    Status,
    /// Reset tasks orphaned in RUNNING by a crash.
    Recover,
    /// Manage agents [*].
    #[command(subcommand)]
    Agent(AgentCommands),
    /// Manage skills and grants [*].
    #[command(subcommand)]
    Skill(SkillCommands),
    /// Delegate a task to an agent.
    Delegate {
        /// Target agent.
        target: String,
        /// Skill to invoke.
        skill: String,
        /// JSON payload for the handler.
        #[arg(long, default_value = "{}")]
        payload: String,
        /// Delegating agent.
        #[arg(long, default_value = "taia-core")]
        origin: String,
        /// Parent correlation token.
        #[arg(long)]
        parent: Option<String>,
        /// Approved decision admitting a critical skill.
        #[arg(long)]
        approval: Option<String>,
    },
    /// Inspect and cancel tasks [*].
    #[command(subcommand)]
    Task(TaskCommands),
    /// Settle a review task by hand.
    Review {
        /// The review task id.
        review_id: String,
        /// Approve the reviewed work (omit to reject).
        #[arg(long)]
        approve: bool,
        #[arg(long)]
        feedback: Option<String>,
        /// Issue found by the reviewer (repeatable).
        #[arg(long = "issue")]
        issues: Vec<String>,
    },
    /// Submit a development plan for approval and wait for it to run.
    Orchestrate {
        /// JSON file with `origin`, `description`, `tasks` and optional `parent`.
        plan: PathBuf,
        /// Reuse an existing approval instead of requesting one.
        #[arg(long)]
        approval: Option<String>,
    },
    /// Human-in-the-loop approvals [*].
    #[command(subcommand)]
    Approval(ApprovalCommands),
    /// Audit chain tools [*].
    #[command(subcommand)]
    Audit(AuditCommands),
}

#[derive(Subcommand)]
pub enum AgentCommands {
    /// List registered agents.
    List,
    /// Register a new agent.
    Register {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Disable an agent so it receives no new tasks.
    Disable { id: String },
    /// Re-enable a disabled agent.
    Enable { id: String },
    /// Show the skills an agent holds.
    Skills { id: String },
}

#[derive(Subcommand)]
pub enum SkillCommands {
    /// List registered skills.
    List,
    /// Grant a skill to an agent.
    Grant {
        agent: String,
        skill: String,
        /// Approval token, required for critical skills.
        #[arg(long)]
        token: Option<String>,
    },
    /// Revoke a granted skill.
    Revoke { agent: String, skill: String },
}

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Show a task and its response.
    Show { id: String },
    /// List tasks.
    List {
        /// Filter by status (PENDING, RUNNING, REVIEW_PENDING, SUCCESS, FAILED, CANCELLED).
        #[arg(long)]
        status: Option<String>,
        /// Maximum archived tasks to include.
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Cancel a pending or running task.
    Cancel {
        id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Show a batch and whether all its tasks have settled.
    Batch { id: String },
}

#[derive(Subcommand)]
pub enum ApprovalCommands {
    /// List approvals.
    List {
        /// Only those waiting for a decision.
        #[arg(long)]
        waiting: bool,
    },
    /// Approve a waiting decision.
    Approve {
        id: String,
        #[arg(long)]
        note: Option<String>,
    },
    /// Reject a waiting decision.
    Reject {
        id: String,
        #[arg(long)]
        note: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum AuditCommands {
    /// Verify the hash chain of the audit log.
    Verify,
    /// Print the most recent audit entries.
    Tail {
        #[arg(long, default_value = "20")]
        lines: usize,
    },
}
