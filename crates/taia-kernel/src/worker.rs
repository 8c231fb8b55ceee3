//! Polling worker loops.
//!
//! A worker polls the queue for one agent, claims each pending task
//! (`PENDING -> RUNNING`), runs the agent's handler and records the
//! response. Cycles for the same agent never overlap. A handler that panics
//! or exceeds its timeout yields a failed result and never takes the loop
//! down with it.

use crate::bus::{transition, RespondOptions, TaskBus};
use crate::error::KernelResult;
use async_trait::async_trait;
use chrono::Utc;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use taia_types::agent::{AgentId, AgentStatus};
use taia_types::config::BusConfig;
use taia_types::error::TaiaError;
use taia_types::task::{Task, TaskResult, TaskStatus};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

/// Executes tasks for one agent.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, task: Task) -> TaskResult;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult> + Send + 'static,
{
    async fn handle(&self, task: Task) -> TaskResult {
        (self)(task).await
    }
}

/// Per-worker tuning.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub poll_interval: Duration,
    pub handler_timeout: Duration,
    /// Recorded on claimed tasks; generated when absent.
    pub worker_id: Option<String>,
}

impl WorkerOptions {
    pub fn from_config(config: &BusConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            handler_timeout: Duration::from_secs(config.handler_timeout_secs),
            worker_id: None,
        }
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from_config(&BusConfig::default())
    }
}

/// What one poll cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Tasks claimed and run.
    pub processed: u32,
    pub succeeded: u32,
    pub failed: u32,
    /// The previous cycle for this agent was still running.
    pub skipped: bool,
}

/// Identifies a running worker loop.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub agent_id: AgentId,
    pub worker_id: String,
}

pub(crate) struct WorkerSlot {
    worker_id: String,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Clears the per-agent busy flag when a cycle ends, however it ends.
struct CycleGuard(Arc<AtomicBool>);

impl Drop for CycleGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Aborts the handler task if the invocation is dropped on timeout.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl TaskBus {
    /// Spawn a polling loop for `agent_id`.
    ///
    /// The loop runs a cycle, then sleeps for the poll interval; it exits on
    /// supervisor shutdown or [`TaskBus::stop_worker`]. One loop per agent.
    pub fn start_worker(
        self: &Arc<Self>,
        agent_id: AgentId,
        handler: Arc<dyn TaskHandler>,
        options: WorkerOptions,
    ) -> KernelResult<WorkerHandle> {
        if self.registry.get_agent(&agent_id).is_none() {
            return Err(TaiaError::AgentNotFound(agent_id.to_string()).into());
        }
        if self.supervisor.is_shutting_down() {
            return Err(TaiaError::ShuttingDown.into());
        }

        let slot = match self.workers.entry(agent_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                return Err(TaiaError::InvalidInput(format!(
                    "worker '{}' is already running for agent '{agent_id}'",
                    existing.get().worker_id
                ))
                .into())
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => slot,
        };

        let worker_id = options.worker_id.clone().unwrap_or_else(|| {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            format!("{agent_id}-{}", &suffix[..8])
        });
        let options = WorkerOptions {
            worker_id: Some(worker_id.clone()),
            ..options
        };
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let mut shutdown_rx = self.supervisor.subscribe();
        let bus = Arc::clone(self);
        let agent = agent_id.clone();

        let handle = tokio::spawn(async move {
            info!(
                agent = %agent,
                worker_id = ?options.worker_id,
                poll_ms = options.poll_interval.as_millis() as u64,
                "Worker started"
            );
            loop {
                if *shutdown_rx.borrow() || *stop_rx.borrow() {
                    break;
                }
                match bus.run_worker_cycle(&agent, &handler, &options).await {
                    Ok(report) if report.processed > 0 => {
                        debug!(
                            agent = %agent,
                            processed = report.processed,
                            failed = report.failed,
                            "Worker cycle complete"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!(agent = %agent, "Worker cycle failed: {e}"),
                }
                tokio::select! {
                    _ = tokio::time::sleep(options.poll_interval) => {}
                    _ = shutdown_rx.changed() => break,
                    _ = stop_rx.changed() => break,
                }
            }
            info!(agent = %agent, "Worker stopped");
        });

        slot.insert(WorkerSlot {
            worker_id: worker_id.clone(),
            stop_tx,
            handle,
        });
        Ok(WorkerHandle {
            agent_id,
            worker_id,
        })
    }

    /// Signal the worker for `agent_id` to stop after its current cycle.
    ///
    /// Returns the loop's join handle, or `None` if no worker was running.
    pub fn stop_worker(&self, agent_id: &AgentId) -> Option<JoinHandle<()>> {
        let (_, slot) = self.workers.remove(agent_id)?;
        let _ = slot.stop_tx.send(true);
        debug!(agent = %agent_id, worker_id = %slot.worker_id, "Worker stop requested");
        Some(slot.handle)
    }

    pub fn stop_all_workers(&self) -> Vec<JoinHandle<()>> {
        let agents: Vec<AgentId> = self.workers.iter().map(|e| e.key().clone()).collect();
        agents
            .iter()
            .filter_map(|agent| self.stop_worker(agent))
            .collect()
    }

    pub fn is_worker_running(&self, agent_id: &AgentId) -> bool {
        self.workers.contains_key(agent_id)
    }

    pub fn active_workers(&self) -> Vec<WorkerHandle> {
        self.workers
            .iter()
            .map(|e| WorkerHandle {
                agent_id: e.key().clone(),
                worker_id: e.value().worker_id.clone(),
            })
            .collect()
    }

    /// Claim and run every pending task for `agent_id` once.
    ///
    /// Returns a skipped report if a cycle for this agent is already in
    /// flight. A claim that loses a race (the task was cancelled or taken)
    /// is skipped quietly.
    pub async fn run_worker_cycle(
        &self,
        agent_id: &AgentId,
        handler: &Arc<dyn TaskHandler>,
        options: &WorkerOptions,
    ) -> KernelResult<CycleReport> {
        let busy = self
            .cycle_guards
            .entry(agent_id.clone())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone();
        if busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(agent = %agent_id, "Previous cycle still running, skipping");
            return Ok(CycleReport {
                skipped: true,
                ..Default::default()
            });
        }
        let _guard = CycleGuard(busy);

        let mut report = CycleReport::default();
        let pending = self.tasks.list_pending_for(agent_id)?;
        if pending.is_empty() {
            return Ok(report);
        }
        let worker_id = options
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("{agent_id}-worker"));

        for task in pending {
            if self.supervisor.is_shutting_down() {
                break;
            }
            let claimed = self.tasks.update_task(task.id, |t| {
                if t.status != TaskStatus::Pending {
                    return Err(TaiaError::InvalidTransition {
                        task: t.id.to_string(),
                        from: t.status.to_string(),
                        to: TaskStatus::Running.to_string(),
                    });
                }
                transition(t, TaskStatus::Running)?;
                t.metadata.worker_id = Some(worker_id.clone());
                t.metadata.started_at = Some(Utc::now());
                Ok(())
            });
            let task = match claimed {
                Ok(task) => task,
                Err(e) => {
                    debug!(task_id = %task.id, "Task no longer claimable: {e}");
                    continue;
                }
            };
            if let Err(e) = self.registry.touch_agent(agent_id, AgentStatus::Busy) {
                warn!(agent = %agent_id, "Cannot record agent activity: {e}");
            }

            report.processed += 1;
            let clock = Instant::now();
            let result = self
                .execute_task(&task, handler, options.handler_timeout)
                .await;
            let elapsed = clock.elapsed().as_millis() as u64;
            if result.success {
                report.succeeded += 1;
            } else {
                report.failed += 1;
            }

            let responded = self.respond_to_task(
                task.id,
                result,
                RespondOptions {
                    agent_id: Some(agent_id.clone()),
                    execution_time_ms: Some(elapsed),
                    skip_quality_gate: false,
                },
            );
            if let Err(e) = responded {
                warn!(task_id = %task.id, "Response rejected: {e}");
            }
        }

        if let Err(e) = self.registry.touch_agent(agent_id, AgentStatus::Idle) {
            warn!(agent = %agent_id, "Cannot record agent activity: {e}");
        }
        Ok(report)
    }

    /// Run the handler in its own task under the handler timeout.
    ///
    /// Mutating skills go through the bridge when one is wired in, so their
    /// side effects are serialized, checkpointed and audited.
    async fn execute_task(
        &self,
        task: &Task,
        handler: &Arc<dyn TaskHandler>,
        timeout: Duration,
    ) -> TaskResult {
        let handler = Arc::clone(handler);
        let input = task.clone();
        let supervisor = Arc::clone(&self.supervisor);
        // Spawned only once the bridge admits the call, so a rejected action
        // never reaches the handler.
        let invocation = async move {
            let join = tokio::spawn(async move { handler.handle(input).await });
            let _abort = AbortOnDrop(join.abort_handle());
            join.await.map_err(|e| {
                if e.is_panic() {
                    supervisor.record_panic();
                    "handler panicked".to_string()
                } else {
                    format!("handler cancelled: {e}")
                }
            })
        };

        let skill = self.registry.get_skill(&task.skill);
        let run = async {
            match (&self.bridge, skill) {
                (Some(bridge), Some(skill)) if skill.mutating => bridge
                    .safe_execute_tool(skill.action, skill.id.as_str(), &task.payload, invocation)
                    .await
                    .map_err(|e| e.to_string()),
                _ => invocation.await,
            }
        };

        match tokio::time::timeout(timeout, run).await {
            Ok(Ok(result)) => result,
            Ok(Err(message)) => {
                warn!(task_id = %task.id, skill = %task.skill, "Handler failed: {message}");
                TaskResult::failure(message)
            }
            Err(_) => {
                warn!(task_id = %task.id, timeout = ?timeout, "Handler timed out");
                TaskResult::failure(format!("handler timed out after {timeout:?}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ApprovalManager;
    use crate::bus::DelegateOptions;
    use crate::registry::AgentRegistry;
    use crate::supervisor::Supervisor;
    use taia_memory::FederationStore;
    use taia_runtime::audit::AuditLog;
    use taia_types::agent::AgentConfig;
    use taia_types::skill::SkillId;

    fn bus() -> Arc<TaskBus> {
        let store = FederationStore::open_in_memory().unwrap();
        let audit = Arc::new(AuditLog::new());
        let registry =
            Arc::new(AgentRegistry::load(store.registry().clone(), audit.clone()).unwrap());
        registry
            .bootstrap_defaults(
                &AgentId::new("taia-core"),
                &AgentId::new("qa-sentinel"),
                &SkillId::new("REVIEW_CODE"),
            )
            .unwrap();
        let agent = AgentId::new("doc-sentinel");
        registry
            .register_agent(agent.clone(), AgentConfig::default())
            .unwrap();
        registry
            .assign_skill(&agent, &SkillId::new("WRITE_DOCS"), None)
            .unwrap();
        let approvals = Arc::new(ApprovalManager::new(store.approvals().clone(), audit.clone()));
        Arc::new(TaskBus::new(
            BusConfig::default(),
            store.tasks().clone(),
            registry,
            approvals,
            audit,
            Arc::new(Supervisor::new()),
        ))
    }

    fn delegate(bus: &TaskBus) -> Task {
        bus.delegate_task(
            &AgentId::new("taia-core"),
            &AgentId::new("doc-sentinel"),
            &SkillId::new("WRITE_DOCS"),
            serde_json::json!({"target": "README.md"}),
            DelegateOptions::default(),
        )
        .unwrap()
    }

    fn options(timeout: Duration) -> WorkerOptions {
        WorkerOptions {
            poll_interval: Duration::from_millis(20),
            handler_timeout: timeout,
            worker_id: Some("w-1".to_string()),
        }
    }

    #[tokio::test]
    async fn test_cycle_runs_pending_tasks() {
        let bus = bus();
        let first = delegate(&bus);
        let second = delegate(&bus);
        let handler: Arc<dyn TaskHandler> = Arc::new(|task: Task| async move {
            TaskResult::success(serde_json::json!({"handled": task.id}))
        });

        let report = bus
            .run_worker_cycle(&AgentId::new("doc-sentinel"), &handler, &options(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.succeeded, 2);

        for id in [first.id, second.id] {
            let task = bus.get_task(id).unwrap();
            assert_eq!(task.status, TaskStatus::Success);
            assert_eq!(task.metadata.worker_id.as_deref(), Some("w-1"));
            assert!(task.metadata.started_at.is_some());
        }
        let agent = bus.registry.get_agent(&AgentId::new("doc-sentinel")).unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn test_panicking_handler_fails_task() {
        let bus = bus();
        let task = delegate(&bus);
        let handler: Arc<dyn TaskHandler> = Arc::new(|_task: Task| async move {
            if true {
                panic!("handler exploded");
            }
            TaskResult::success(serde_json::Value::Null)
        });

        let report = bus
            .run_worker_cycle(&AgentId::new("doc-sentinel"), &handler, &options(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(bus.supervisor.panic_count(), 1);

        let response = bus.get_response(task.id).unwrap().unwrap();
        assert_eq!(response.status, TaskStatus::Failed);
        assert_eq!(response.error.as_deref(), Some("handler panicked"));
    }

    #[tokio::test]
    async fn test_slow_handler_times_out() {
        let bus = bus();
        let task = delegate(&bus);
        let handler: Arc<dyn TaskHandler> = Arc::new(|_task: Task| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            TaskResult::success(serde_json::Value::Null)
        });

        let report = bus
            .run_worker_cycle(
                &AgentId::new("doc-sentinel"),
                &handler,
                &options(Duration::from_millis(50)),
            )
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        let response = bus.get_response(task.id).unwrap().unwrap();
        assert!(response.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_overlapping_cycle_skipped() {
        let bus = bus();
        delegate(&bus);
        let handler: Arc<dyn TaskHandler> = Arc::new(|_task: Task| async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            TaskResult::success(serde_json::Value::Null)
        });
        let agent = AgentId::new("doc-sentinel");

        let slow_bus = Arc::clone(&bus);
        let slow_handler = Arc::clone(&handler);
        let slow_agent = agent.clone();
        let slow = tokio::spawn(async move {
            slow_bus
                .run_worker_cycle(&slow_agent, &slow_handler, &options(Duration::from_secs(5)))
                .await
        });
        tokio::time::sleep(Duration::from_millis(40)).await;

        let overlapping = bus
            .run_worker_cycle(&agent, &handler, &options(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(overlapping.skipped);
        assert_eq!(slow.await.unwrap().unwrap().processed, 1);

        // The guard is released once the slow cycle ends.
        let after = bus
            .run_worker_cycle(&agent, &handler, &options(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(!after.skipped);
    }

    #[tokio::test]
    async fn test_worker_loop_lifecycle() {
        let bus = bus();
        let agent = AgentId::new("doc-sentinel");
        let handler: Arc<dyn TaskHandler> =
            Arc::new(|_task: Task| async move { TaskResult::success(serde_json::Value::Null) });

        let handle = bus
            .start_worker(agent.clone(), Arc::clone(&handler), options(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(handle.worker_id, "w-1");
        assert!(bus
            .start_worker(agent.clone(), Arc::clone(&handler), options(Duration::from_secs(5)))
            .is_err());
        assert_eq!(bus.get_stats().unwrap().active_workers, 1);

        let task = delegate(&bus);
        let mut settled = false;
        for _ in 0..100 {
            if bus.get_task(task.id).unwrap().status == TaskStatus::Success {
                settled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(settled);

        let join = bus.stop_worker(&agent).unwrap();
        tokio::time::timeout(Duration::from_secs(5), join)
            .await
            .unwrap()
            .unwrap();
        assert!(!bus.is_worker_running(&agent));
        assert!(bus.stop_worker(&agent).is_none());
    }

    #[tokio::test]
    async fn test_shutdown_stops_loops() {
        let bus = bus();
        let handler: Arc<dyn TaskHandler> =
            Arc::new(|_task: Task| async move { TaskResult::success(serde_json::Value::Null) });
        bus.start_worker(AgentId::new("doc-sentinel"), handler, options(Duration::from_secs(5)))
            .unwrap();

        bus.supervisor.shutdown();
        for join in bus.stop_all_workers() {
            tokio::time::timeout(Duration::from_secs(5), join)
                .await
                .unwrap()
                .unwrap();
        }
        assert!(bus.active_workers().is_empty());
    }
}
