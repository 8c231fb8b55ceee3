//! Task commands: delegate, show, list, cancel, batches, reviews and
//! approval-gated orchestration.

use super::{boot_kernel, fail, parse_uuid, print_json, Context};
use std::path::Path;
use std::time::Duration;
use taia_kernel::bus::DelegateOptions;
use taia_kernel::orchestration::{DevelopmentPlan, OrchestrateOptions};
use taia_types::agent::AgentId;
use taia_types::approval::ApprovalId;
use taia_types::skill::SkillId;
use taia_types::task::{BatchId, ReviewResult, Task, TaskId, TaskStatus};

pub struct DelegateArgs {
    pub origin: String,
    pub target: String,
    pub skill: String,
    pub payload: String,
    pub parent: Option<String>,
    pub approval: Option<String>,
}

pub fn cmd_delegate(ctx: &Context, args: DelegateArgs) {
    let payload: serde_json::Value = serde_json::from_str(&args.payload)
        .unwrap_or_else(|e| fail(format!("Payload is not valid JSON: {e}")));
    let approval_id = args
        .approval
        .as_deref()
        .map(|raw| ApprovalId(parse_uuid("approval", raw)));

    let kernel = boot_kernel(ctx, false);
    let task = kernel
        .bus
        .delegate_task(
            &AgentId::new(args.origin),
            &AgentId::new(args.target),
            &SkillId::new(args.skill),
            payload,
            DelegateOptions {
                parent: args.parent,
                approval_id,
                ..Default::default()
            },
        )
        .unwrap_or_else(|e| fail(format!("Delegation rejected: {e}")));

    if ctx.json {
        print_json(&task);
    } else {
        println!("Task delegated.");
        println!("  ID:     {}", task.id);
        println!("  Target: {}", task.target);
        println!("  Skill:  {}", task.skill);
    }
}

pub fn cmd_task_show(ctx: &Context, id: &str) {
    let id = TaskId(parse_uuid("task", id));
    let kernel = boot_kernel(ctx, false);
    let task = kernel
        .bus
        .get_task(id)
        .unwrap_or_else(|e| fail(format!("{e}")));
    let response = kernel
        .bus
        .get_response(id)
        .unwrap_or_else(|e| fail(format!("Failed to read response: {e}")));

    if ctx.json {
        print_json(&serde_json::json!({"task": task, "response": response}));
        return;
    }
    println!("Task {}", task.id);
    println!("  Status:  {}", task.status);
    println!("  Origin:  {}", task.origin);
    println!("  Target:  {}", task.target);
    println!("  Skill:   {}", task.skill);
    if let Some(parent) = &task.parent {
        println!("  Parent:  {parent}");
    }
    if let Some(worker) = &task.metadata.worker_id {
        println!("  Worker:  {worker}");
    }
    if task.metadata.retry_count > 0 {
        println!("  Retries: {}", task.metadata.retry_count);
    }
    if let Some(note) = &task.metadata.recovery_note {
        println!("  Note:    {note}");
    }
    if let Some(review) = &task.metadata.review {
        let verdict = if review.approved { "approved" } else { "rejected" };
        println!("  Review:  {verdict}");
        if let Some(feedback) = &review.feedback {
            println!("           {feedback}");
        }
        for issue in &review.issues {
            println!("           - {issue}");
        }
    }
    println!(
        "  Payload: {}",
        serde_json::to_string(&task.payload).unwrap_or_default()
    );
    match response {
        Some(r) => {
            println!("Response ({} ms)", r.execution_time_ms);
            println!("  Status:  {}", r.status);
            if let Some(error) = &r.error {
                println!("  Error:   {error}");
            }
            println!(
                "  Result:  {}",
                serde_json::to_string(&r.result).unwrap_or_default()
            );
        }
        None => println!("No response yet."),
    }
}

fn print_task_rows(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("No tasks.");
        return;
    }
    println!(
        "{:<38} {:<15} {:<16} {:<16} CREATED",
        "ID", "STATUS", "TARGET", "SKILL"
    );
    println!("{}", "-".repeat(108));
    for t in tasks {
        println!(
            "{:<38} {:<15} {:<16} {:<16} {}",
            t.id.to_string(),
            t.status.as_str(),
            t.target.as_str(),
            t.skill.as_str(),
            t.timestamp.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

pub fn cmd_task_list(ctx: &Context, status: Option<&str>, limit: usize) {
    let status = status.map(|s| s.parse::<TaskStatus>().unwrap_or_else(|e| fail(e)));
    let kernel = boot_kernel(ctx, false);
    let tasks = kernel
        .bus
        .list_tasks(status, limit)
        .unwrap_or_else(|e| fail(format!("Failed to list tasks: {e}")));
    if ctx.json {
        print_json(&tasks);
    } else {
        print_task_rows(&tasks);
    }
}

pub fn cmd_task_cancel(ctx: &Context, id: &str, reason: Option<String>) {
    let id = TaskId(parse_uuid("task", id));
    let kernel = boot_kernel(ctx, false);
    match kernel.bus.cancel_task(id, "operator", reason) {
        Ok(task) => println!("Task {} cancelled.", task.id),
        Err(e) => fail(format!("Cannot cancel task: {e}")),
    }
}

pub fn cmd_batch_show(ctx: &Context, id: &str) {
    let id = BatchId(parse_uuid("batch", id));
    let kernel = boot_kernel(ctx, false);
    let batch = kernel
        .bus
        .get_batch(id)
        .unwrap_or_else(|e| fail(format!("{e}")));
    let tasks: Vec<Task> = batch
        .task_ids
        .iter()
        .filter_map(|t| kernel.bus.get_task(*t).ok())
        .collect();
    if ctx.json {
        print_json(&serde_json::json!({"batch": batch, "tasks": tasks}));
        return;
    }
    println!("Batch {} ({:?})", batch.id, batch.status);
    println!("  Parent: {}", batch.parent);
    println!("  Origin: {}", batch.origin);
    print_task_rows(&tasks);
}

pub fn cmd_review(
    ctx: &Context,
    review_id: &str,
    approve: bool,
    feedback: Option<String>,
    issues: Vec<String>,
) {
    let review_id = TaskId(parse_uuid("review task", review_id));
    let kernel = boot_kernel(ctx, false);
    let outcome = kernel
        .bus
        .submit_qa_review(
            review_id,
            ReviewResult {
                approved: approve,
                feedback,
                issues,
            },
        )
        .unwrap_or_else(|e| fail(format!("Review not recorded: {e}")));
    if ctx.json {
        print_json(&outcome);
        return;
    }
    println!(
        "Task {} settled {}.",
        outcome.original_request_id, outcome.status
    );
    if outcome.retry_recommended {
        println!("  Rejected by review; delegate the task again once addressed.");
    }
}

pub fn cmd_orchestrate(ctx: &Context, plan_path: &Path, approval: Option<&str>) {
    let contents = std::fs::read_to_string(plan_path)
        .unwrap_or_else(|e| fail(format!("Cannot read plan {}: {e}", plan_path.display())));
    let plan: DevelopmentPlan = serde_json::from_str(&contents)
        .unwrap_or_else(|e| fail(format!("Invalid plan: {e}")));
    let approval_id = approval.map(|raw| ApprovalId(parse_uuid("approval", raw)));

    let kernel = boot_kernel(ctx, false);
    let waits = &kernel.config.bus;
    println!(
        "Waiting up to {}s for a decision (see `taia approval list --waiting`)...",
        waits.approval_timeout_secs
    );
    let options = OrchestrateOptions {
        approval_id,
        approval_timeout: Some(Duration::from_secs(waits.approval_timeout_secs)),
        completion_timeout: Some(Duration::from_secs(waits.completion_timeout_secs)),
        poll_interval: Some(Duration::from_millis(waits.approval_poll_interval_ms)),
    };

    let rt = tokio::runtime::Runtime::new()
        .unwrap_or_else(|e| fail(format!("Failed to start runtime: {e}")));
    let summary = rt
        .block_on(kernel.bus.orchestrate_development_task(plan, options))
        .unwrap_or_else(|e| fail(format!("Orchestration stopped: {e}")));

    if ctx.json {
        print_json(&summary);
        return;
    }
    println!("Batch {} (approval {})", summary.batch_id, summary.approval_id);
    println!("  Delegated:  {}", summary.total);
    println!("  Succeeded:  {}", summary.succeeded);
    println!("  Failed:     {}", summary.failed);
    println!("  Cancelled:  {}", summary.cancelled);
    if summary.rejected_at_admission > 0 {
        println!("  Rejected:   {}", summary.rejected_at_admission);
    }
    if summary.timed_out {
        println!(
            "  Still open: {} (run `taia task batch {}` to follow up)",
            summary.unresolved, summary.batch_id
        );
    }
}
