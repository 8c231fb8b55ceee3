//! TAIA CLI: operator interface for the agent federation.
//!
//! Every command boots an in-process kernel over the configured record
//! store, performs one operation and exits. Crash recovery only runs when
//! asked for (`taia recover`), so the CLI can be used next to running
//! workers without resetting their tasks.

mod cli;
mod cmd;

use crate::cli::*;
use clap::Parser;

fn init_tracing_stderr(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr(cli.log_json);

    let ctx = cmd::Context {
        config: cli.config,
        json: cli.json,
    };
    match cli.command {
        Commands::Status => cmd::system::cmd_status(&ctx),
        Commands::Recover => cmd::system::cmd_recover(&ctx),
        Commands::Agent(sub) => match sub {
            AgentCommands::List => cmd::agent::cmd_agent_list(&ctx),
            AgentCommands::Register {
                id,
                name,
                description,
            } => cmd::agent::cmd_agent_register(&ctx, &id, name, description),
            AgentCommands::Disable { id } => cmd::agent::cmd_agent_enable(&ctx, &id, false),
            AgentCommands::Enable { id } => cmd::agent::cmd_agent_enable(&ctx, &id, true),
            AgentCommands::Skills { id } => cmd::agent::cmd_agent_skills(&ctx, &id),
        },
        Commands::Skill(sub) => match sub {
            SkillCommands::List => cmd::agent::cmd_skill_list(&ctx),
            SkillCommands::Grant {
                agent,
                skill,
                token,
            } => cmd::agent::cmd_skill_grant(&ctx, &agent, &skill, token.as_deref()),
            SkillCommands::Revoke { agent, skill } => {
                cmd::agent::cmd_skill_revoke(&ctx, &agent, &skill)
            }
        },
        Commands::Delegate {
            target,
            skill,
            payload,
            origin,
            parent,
            approval,
        } => cmd::task::cmd_delegate(
            &ctx,
            cmd::task::DelegateArgs {
                origin,
                target,
                skill,
                payload,
                parent,
                approval,
            },
        ),
        Commands::Task(sub) => match sub {
            TaskCommands::Show { id } => cmd::task::cmd_task_show(&ctx, &id),
            TaskCommands::List { status, limit } => {
                cmd::task::cmd_task_list(&ctx, status.as_deref(), limit)
            }
            TaskCommands::Cancel { id, reason } => cmd::task::cmd_task_cancel(&ctx, &id, reason),
            TaskCommands::Batch { id } => cmd::task::cmd_batch_show(&ctx, &id),
        },
        Commands::Review {
            review_id,
            approve,
            feedback,
            issues,
        } => cmd::task::cmd_review(&ctx, &review_id, approve, feedback, issues),
        Commands::Orchestrate { plan, approval } => {
            cmd::task::cmd_orchestrate(&ctx, &plan, approval.as_deref())
        }
        Commands::Approval(sub) => match sub {
            ApprovalCommands::List { waiting } => cmd::approval::cmd_approval_list(&ctx, waiting),
            ApprovalCommands::Approve { id, note } => {
                cmd::approval::cmd_approval_resolve(&ctx, &id, true, note)
            }
            ApprovalCommands::Reject { id, note } => {
                cmd::approval::cmd_approval_resolve(&ctx, &id, false, note)
            }
        },
        Commands::Audit(sub) => match sub {
            AuditCommands::Verify => cmd::system::cmd_audit_verify(&ctx),
            AuditCommands::Tail { lines } => cmd::system::cmd_audit_tail(&ctx, lines),
        },
    }
}
