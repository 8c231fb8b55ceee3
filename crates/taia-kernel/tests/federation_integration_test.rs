//! End-to-end tests: a booted kernel with real worker loops, the bridge
//! and a temporary workspace.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taia_kernel::bus::DelegateOptions;
use taia_kernel::worker::{TaskHandler, WorkerOptions};
use taia_kernel::TaiaKernel;
use taia_runtime::audit::AuditAction;
use taia_types::agent::{AgentConfig, AgentId};
use taia_types::config::FederationConfig;
use taia_types::error::TaiaError;
use taia_types::skill::SkillId;
use taia_types::task::{Task, TaskId, TaskResult, TaskStatus};

fn test_config(dir: &Path) -> FederationConfig {
    let workspace = dir.join("workspace");
    std::fs::create_dir_all(workspace.join("src")).unwrap();
    let mut config = FederationConfig {
        home_dir: dir.to_path_buf(),
        data_dir: dir.join("data"),
        ..Default::default()
    };
    config.bus.poll_interval_ms = 20;
    config.bus.handler_timeout_secs = 5;
    config.bridge.workspace_root = workspace;
    config.bridge.checkpoints_enabled = false;
    config
}

fn worker_options() -> WorkerOptions {
    WorkerOptions {
        poll_interval: Duration::from_millis(20),
        handler_timeout: Duration::from_secs(5),
        worker_id: None,
    }
}

fn add_agent(kernel: &TaiaKernel, agent: &str, skills: &[&str]) -> AgentId {
    let id = AgentId::new(agent);
    kernel
        .registry
        .register_agent(id.clone(), AgentConfig::default())
        .unwrap();
    for skill in skills {
        kernel
            .registry
            .assign_skill(&id, &SkillId::new(*skill), Some("integration-ticket"))
            .unwrap();
    }
    id
}

fn delegate(kernel: &TaiaKernel, target: &AgentId, skill: &str, payload: serde_json::Value) -> Task {
    kernel
        .bus
        .delegate_task(
            &AgentId::new("taia-core"),
            target,
            &SkillId::new(skill),
            payload,
            DelegateOptions::default(),
        )
        .unwrap()
}

async fn wait_until_settled(kernel: &TaiaKernel, id: TaskId) -> Task {
    for _ in 0..250 {
        let task = kernel.bus.get_task(id).unwrap();
        if task.status.is_terminal() {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("task {id} did not settle");
}

/// Writes the payload's `content` to the payload's `target` in the workspace.
fn doc_writer(root: PathBuf) -> Arc<dyn TaskHandler> {
    Arc::new(move |task: Task| {
        let root = root.clone();
        async move {
            let target = task.payload["target"].as_str().unwrap_or("README.md").to_string();
            let content = task.payload["content"].as_str().unwrap_or_default().to_string();
            match tokio::fs::write(root.join(&target), content).await {
                Ok(()) => TaskResult::success(serde_json::json!({"updated": target})),
                Err(e) => TaskResult::failure(e.to_string()),
            }
        }
    })
}

#[tokio::test]
async fn test_doc_update_runs_through_the_lane() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let root = config.bridge.workspace_root.clone();
    let kernel = TaiaKernel::boot(config).unwrap();
    let docs = add_agent(&kernel, "doc-sentinel", &["READ_CODE", "WRITE_DOCS"]);

    kernel
        .bus
        .start_worker(docs.clone(), doc_writer(root.clone()), worker_options())
        .unwrap();
    let task = delegate(
        &kernel,
        &docs,
        "WRITE_DOCS",
        serde_json::json!({"target": "README.md", "content": "# TAIA\n"}),
    );

    let settled = wait_until_settled(&kernel, task.id).await;
    assert_eq!(settled.status, TaskStatus::Success);
    assert_eq!(std::fs::read_to_string(root.join("README.md")).unwrap(), "# TAIA\n");

    let response = kernel.bus.get_response(task.id).unwrap().unwrap();
    assert_eq!(response.agent_id, docs);
    assert!(!response.qa_triggered);
    assert_eq!(response.result["updated"], "README.md");

    let actions: Vec<AuditAction> = kernel
        .audit
        .recent(usize::MAX)
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert!(actions.contains(&AuditAction::TaskDelegated));
    assert!(actions.contains(&AuditAction::ToolSucceeded));
    assert!(actions.contains(&AuditAction::TaskResponded));
    assert!(kernel.audit.verify_integrity().is_ok());
    assert_eq!(kernel.bridge.lane().occupancy().completed, 1);

    kernel.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_writers_never_overlap() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = TaiaKernel::boot(test_config(dir.path())).unwrap();
    let in_flight = Arc::new(AtomicUsize::new(0));
    let overlapped = Arc::new(AtomicBool::new(false));

    let mut ids = Vec::new();
    for name in ["writer-a", "writer-b", "writer-c"] {
        let agent = add_agent(&kernel, name, &["READ_CODE", "WRITE_DOCS"]);
        let counter = Arc::clone(&in_flight);
        let flag = Arc::clone(&overlapped);
        let handler: Arc<dyn TaskHandler> = Arc::new(move |_task: Task| {
            let counter = Arc::clone(&counter);
            let flag = Arc::clone(&flag);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) > 0 {
                    flag.store(true, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(30)).await;
                counter.fetch_sub(1, Ordering::SeqCst);
                TaskResult::success(serde_json::Value::Null)
            }
        });
        for _ in 0..2 {
            ids.push(delegate(&kernel, &agent, "WRITE_DOCS", serde_json::json!({})).id);
        }
        kernel.bus.start_worker(agent, handler, worker_options()).unwrap();
    }

    for id in ids {
        assert_eq!(wait_until_settled(&kernel, id).await.status, TaskStatus::Success);
    }
    assert!(!overlapped.load(Ordering::SeqCst));
    assert_eq!(kernel.bridge.lane().occupancy().completed, 6);
    kernel.shutdown().await;
}

async fn run_reviewed_change(approve: bool) -> (Task, TaiaKernel, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let kernel = TaiaKernel::boot(test_config(dir.path())).unwrap();
    let coder = add_agent(&kernel, "coder", &["READ_CODE", "MODIFY_CODE"]);

    let coder_handler: Arc<dyn TaskHandler> = Arc::new(|_task: Task| async move {
        TaskResult::success(serde_json::json!({"diff": "+pub fn answer() -> u32 { 42 }"}))
    });
    let reviewer_handler: Arc<dyn TaskHandler> = Arc::new(move |task: Task| async move {
        assert!(task.payload["result"]["diff"].is_string());
        TaskResult::success(serde_json::json!({
            "approved": approve,
            "feedback": if approve { "ok" } else { "needs tests" },
            "issues": if approve { vec![] } else { vec!["no test for answer()"] },
        }))
    });
    kernel
        .bus
        .start_worker(coder.clone(), coder_handler, worker_options())
        .unwrap();
    kernel
        .bus
        .start_worker(AgentId::new("qa-sentinel"), reviewer_handler, worker_options())
        .unwrap();

    let task = delegate(&kernel, &coder, "MODIFY_CODE", serde_json::json!({"file": "lib.rs"}));
    let settled = wait_until_settled(&kernel, task.id).await;
    kernel.shutdown().await;
    (settled, kernel, dir)
}

#[tokio::test]
async fn test_approved_review_settles_success() {
    let (task, kernel, _dir) = run_reviewed_change(true).await;
    assert_eq!(task.status, TaskStatus::Success);
    assert!(task.metadata.review.as_ref().unwrap().approved);

    let review_id = task.metadata.review_task_id.unwrap();
    let review = kernel.bus.get_task(review_id).unwrap();
    assert_eq!(review.metadata.review_of, Some(task.id));
    assert_eq!(review.target, AgentId::new("qa-sentinel"));

    let response = kernel.bus.get_response(task.id).unwrap().unwrap();
    assert!(response.qa_triggered);
    assert!(!response.requires_approval);
    assert_eq!(response.status, TaskStatus::Success);
}

#[tokio::test]
async fn test_rejected_review_fails_with_feedback() {
    let (task, kernel, _dir) = run_reviewed_change(false).await;
    assert_eq!(task.status, TaskStatus::Failed);
    let review = task.metadata.review.unwrap();
    assert_eq!(review.feedback.as_deref(), Some("needs tests"));
    assert_eq!(review.issues, vec!["no test for answer()".to_string()]);

    let response = kernel.bus.get_response(task.id).unwrap().unwrap();
    assert_eq!(response.error.as_deref(), Some("needs tests"));
}

#[tokio::test]
async fn test_protected_delete_never_reaches_handler() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = TaiaKernel::boot(test_config(dir.path())).unwrap();
    let cleaner = add_agent(&kernel, "cleaner", &["DELETE_CODE"]);

    let err = kernel
        .bus
        .delegate_task(
            &AgentId::new("taia-core"),
            &cleaner,
            &SkillId::new("DELETE_CODE"),
            serde_json::json!({"target": "src"}),
            DelegateOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err.as_taia(), Some(TaiaError::ApprovalRequired(_))));
    assert!(kernel
        .audit
        .recent(usize::MAX)
        .iter()
        .any(|e| e.action == AuditAction::SecurityFinding));

    let approval = kernel
        .approvals
        .request(
            "delegation",
            serde_json::json!({"target": "cleaner", "skill": "DELETE_CODE"}),
        )
        .unwrap();
    kernel
        .approvals
        .resolve(approval.id, true, "operator", None)
        .unwrap();
    let task = kernel
        .bus
        .delegate_task(
            &AgentId::new("taia-core"),
            &cleaner,
            &SkillId::new("DELETE_CODE"),
            serde_json::json!({"target": "src"}),
            DelegateOptions {
                approval_id: Some(approval.id),
                ..Default::default()
            },
        )
        .unwrap();

    let invoked = Arc::new(AtomicBool::new(false));
    let seen = Arc::clone(&invoked);
    let handler: Arc<dyn TaskHandler> = Arc::new(move |_task: Task| {
        let seen = Arc::clone(&seen);
        async move {
            seen.store(true, Ordering::SeqCst);
            TaskResult::success(serde_json::Value::Null)
        }
    });
    kernel.bus.start_worker(cleaner, handler, worker_options()).unwrap();

    let settled = wait_until_settled(&kernel, task.id).await;
    assert_eq!(settled.status, TaskStatus::Failed);
    assert!(!invoked.load(Ordering::SeqCst));
    let response = kernel.bus.get_response(task.id).unwrap().unwrap();
    assert!(response.error.unwrap().contains("protected"));
    assert!(dir.path().join("workspace").join("src").exists());
    kernel.shutdown().await;
}

#[tokio::test]
async fn test_blacklisted_command_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = TaiaKernel::boot(test_config(dir.path())).unwrap();
    let shell = add_agent(&kernel, "shell-runner", &["EXECUTE_SHELL"]);
    let invoked = Arc::new(AtomicBool::new(false));
    let seen = Arc::clone(&invoked);
    let handler: Arc<dyn TaskHandler> = Arc::new(move |_task: Task| {
        let seen = Arc::clone(&seen);
        async move {
            seen.store(true, Ordering::SeqCst);
            TaskResult::success(serde_json::Value::Null)
        }
    });
    kernel.bus.start_worker(shell.clone(), handler, worker_options()).unwrap();

    let task = delegate(
        &kernel,
        &shell,
        "EXECUTE_SHELL",
        serde_json::json!({"command": "cd /tmp && rm -r  -f / --no-preserve-root"}),
    );
    let settled = wait_until_settled(&kernel, task.id).await;
    assert_eq!(settled.status, TaskStatus::Failed);
    assert!(!invoked.load(Ordering::SeqCst));
    assert!(kernel
        .audit
        .recent(usize::MAX)
        .iter()
        .any(|e| e.action == AuditAction::CommandBlocked));
    kernel.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_running_task_stays_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = TaiaKernel::boot(test_config(dir.path())).unwrap();
    let reader = add_agent(&kernel, "reader", &["READ_CODE"]);
    let handler: Arc<dyn TaskHandler> = Arc::new(|_task: Task| async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        TaskResult::success(serde_json::json!({"lines": 10}))
    });
    kernel.bus.start_worker(reader.clone(), handler, worker_options()).unwrap();
    let task = delegate(&kernel, &reader, "READ_CODE", serde_json::json!({"file": "lib.rs"}));

    let mut running = false;
    for _ in 0..100 {
        if kernel.bus.get_task(task.id).unwrap().status == TaskStatus::Running {
            running = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(running);

    kernel
        .bus
        .cancel_task(task.id, "operator", Some("no longer needed".to_string()))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    let task = kernel.bus.get_task(task.id).unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    let response = kernel.bus.get_response(task.id).unwrap().unwrap();
    assert_eq!(response.status, TaskStatus::Cancelled);
    kernel.shutdown().await;
}

#[tokio::test]
async fn test_reboot_recovers_orphaned_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let (fresh, exhausted) = {
        let kernel = TaiaKernel::boot(test_config(dir.path())).unwrap();
        let docs = add_agent(&kernel, "doc-sentinel", &["READ_CODE", "WRITE_DOCS"]);
        let fresh = delegate(&kernel, &docs, "WRITE_DOCS", serde_json::json!({}));
        let exhausted = delegate(&kernel, &docs, "WRITE_DOCS", serde_json::json!({}));
        // Simulate a crash mid-execution.
        for (id, retries) in [(fresh.id, 0), (exhausted.id, 3)] {
            kernel
                .store
                .tasks()
                .update_task(id, |t| {
                    t.status = TaskStatus::Running;
                    t.metadata.worker_id = Some("lost-worker".to_string());
                    t.metadata.retry_count = retries;
                    Ok(())
                })
                .unwrap();
        }
        (fresh.id, exhausted.id)
    };

    let kernel = TaiaKernel::boot(test_config(dir.path())).unwrap();
    assert_eq!(kernel.recovery.reset_ids, vec![fresh]);
    assert_eq!(kernel.recovery.failed_ids, vec![exhausted]);

    let reset = kernel.bus.get_task(fresh).unwrap();
    assert_eq!(reset.status, TaskStatus::Pending);
    assert_eq!(reset.metadata.retry_count, 1);
    assert!(reset.metadata.worker_id.is_none());
    assert_eq!(kernel.bus.get_task(exhausted).unwrap().status, TaskStatus::Failed);
    assert_eq!(kernel.supervisor.recovered_count(), 1);

    // The recovered task runs normally once a worker picks it up.
    let root = kernel.config.bridge.workspace_root.clone();
    kernel
        .bus
        .start_worker(AgentId::new("doc-sentinel"), doc_writer(root), worker_options())
        .unwrap();
    assert_eq!(wait_until_settled(&kernel, fresh).await.status, TaskStatus::Success);
    kernel.shutdown().await;
}
