//! Approval commands: list, approve, reject.

use super::{boot_kernel, fail, parse_uuid, print_json, Context};
use taia_types::approval::{ApprovalId, ApprovalStatus};

pub fn cmd_approval_list(ctx: &Context, waiting: bool) {
    let kernel = boot_kernel(ctx, false);
    let filter = waiting.then_some(ApprovalStatus::WaitingForApproval);
    let approvals = kernel
        .approvals
        .list(filter)
        .unwrap_or_else(|e| fail(format!("Failed to list approvals: {e}")));
    if ctx.json {
        print_json(&approvals);
        return;
    }
    if approvals.is_empty() {
        println!("No approvals.");
        return;
    }
    println!(
        "{:<38} {:<14} {:<22} {:<20} ACTOR",
        "ID", "KIND", "STATUS", "CREATED"
    );
    println!("{}", "-".repeat(104));
    for a in approvals {
        println!(
            "{:<38} {:<14} {:<22} {:<20} {}",
            a.id.to_string(),
            a.kind,
            a.status.as_str(),
            a.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            a.actor.as_deref().unwrap_or("-")
        );
    }
}

pub fn cmd_approval_resolve(ctx: &Context, id: &str, approve: bool, note: Option<String>) {
    let id = ApprovalId(parse_uuid("approval", id));
    let kernel = boot_kernel(ctx, false);
    match kernel.approvals.resolve(id, approve, "operator", note) {
        Ok(approval) => {
            if ctx.json {
                print_json(&approval);
            } else {
                println!("Approval {} is now {}.", approval.id, approval.status);
            }
        }
        Err(e) => fail(format!("Cannot resolve approval: {e}")),
    }
}
