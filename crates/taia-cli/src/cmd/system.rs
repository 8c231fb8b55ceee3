//! System commands: status, recover, audit verify and tail.

use super::{boot_kernel, fail, print_json, Context};

pub fn cmd_status(ctx: &Context) {
    let kernel = boot_kernel(ctx, false);
    let stats = kernel
        .bus
        .get_stats()
        .unwrap_or_else(|e| fail(format!("Failed to read stats: {e}")));
    let health = kernel.supervisor.health();
    let lane = kernel.bridge.lane().occupancy();
    let integrity = kernel.audit.verify_integrity();

    if ctx.json {
        print_json(&serde_json::json!({
            "bus": stats,
            "supervisor": health,
            "agents": kernel.registry.list_agents().len(),
            "skills": kernel.registry.list_skills().len(),
            "audit": {
                "entries": kernel.audit.len(),
                "tip": kernel.audit.tip_hash(),
                "valid": integrity.is_ok(),
            },
            "lane": {
                "active": lane.active,
                "queued": lane.queued,
                "completed": lane.completed,
            },
        }));
        return;
    }

    println!("TAIA federation");
    println!("  Home:      {}", kernel.config.home_dir.display());
    println!("  Database:  {}", kernel.config.database_path().display());
    println!(
        "  Registry:  {} agents, {} skills",
        kernel.registry.list_agents().len(),
        kernel.registry.list_skills().len()
    );
    println!();
    println!("Tasks");
    println!("  Pending:        {}", stats.pending);
    println!("  Running:        {}", stats.running);
    println!("  Review pending: {}", stats.review_pending);
    println!("  Succeeded:      {}", stats.success);
    println!("  Failed:         {}", stats.failed);
    println!("  Cancelled:      {}", stats.cancelled);
    println!("  Archived:       {}", stats.archived);
    println!();
    println!("Approvals waiting: {}", stats.approvals_waiting);
    match integrity {
        Ok(()) => println!("Audit chain:       ok ({} entries)", kernel.audit.len()),
        Err(e) => println!("Audit chain:       BROKEN ({e})"),
    }
}

pub fn cmd_recover(ctx: &Context) {
    let kernel = boot_kernel(ctx, true);
    let summary = &kernel.recovery;
    if ctx.json {
        print_json(summary);
        return;
    }
    if summary.scanned == 0 {
        println!("No orphaned tasks.");
        return;
    }
    println!("Recovered {} orphaned task(s):", summary.scanned);
    for id in &summary.reset_ids {
        println!("  reset   {id}");
    }
    for id in &summary.failed_ids {
        println!("  failed  {id}");
    }
    if summary.reviews_relinked + summary.reviews_redelegated > 0 {
        println!(
            "Reviews: {} relinked, {} re-delegated",
            summary.reviews_relinked, summary.reviews_redelegated
        );
    }
}

pub fn cmd_audit_verify(ctx: &Context) {
    let kernel = boot_kernel(ctx, false);
    match kernel.audit.verify_integrity() {
        Ok(()) => {
            let sink = kernel
                .audit
                .sink_path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "memory".to_string());
            println!(
                "Audit chain intact: {} entries, tip {} ({sink})",
                kernel.audit.len(),
                kernel.audit.tip_hash()
            );
        }
        Err(e) => fail(format!("Audit chain verification failed: {e}")),
    }
}

pub fn cmd_audit_tail(ctx: &Context, lines: usize) {
    let kernel = boot_kernel(ctx, false);
    let entries = kernel.audit.recent(lines);
    if ctx.json {
        print_json(&entries);
        return;
    }
    for e in entries {
        println!(
            "{:>6} {} {:<12} {:<18} {} -> {}",
            e.seq,
            e.timestamp,
            e.agent_id,
            e.action.to_string(),
            e.detail,
            e.outcome
        );
    }
}
