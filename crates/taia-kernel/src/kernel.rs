//! TaiaKernel: assembles the federation subsystems and owns their lifecycle.

use crate::approval::ApprovalManager;
use crate::bus::TaskBus;
use crate::error::{KernelError, KernelResult};
use crate::registry::AgentRegistry;
use crate::supervisor::Supervisor;
use crate::worker::{TaskHandler, WorkerHandle, WorkerOptions};
use std::sync::Arc;
use std::time::Duration;
use taia_memory::FederationStore;
use taia_runtime::audit::AuditLog;
use taia_runtime::bridge::SerializationBridge;
use taia_types::agent::AgentId;
use taia_types::config::FederationConfig;
use taia_types::skill::SkillId;
use taia_types::task::RecoverySummary;
use tracing::{info, warn};

/// How long shutdown waits for each worker loop to exit.
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Boot-time switches.
#[derive(Debug, Clone, Copy)]
pub struct BootOptions {
    /// Run crash recovery over orphaned `RUNNING` tasks.
    pub run_recovery: bool,
    /// Keep records in memory instead of the configured database.
    pub in_memory: bool,
}

impl Default for BootOptions {
    fn default() -> Self {
        Self {
            run_recovery: true,
            in_memory: false,
        }
    }
}

/// The federation kernel.
///
/// Every subsystem is constructed here once and shared by `Arc`; there are
/// no process-wide singletons.
pub struct TaiaKernel {
    pub config: FederationConfig,
    pub store: FederationStore,
    pub audit: Arc<AuditLog>,
    pub bridge: Arc<SerializationBridge>,
    pub registry: Arc<AgentRegistry>,
    pub approvals: Arc<ApprovalManager>,
    pub supervisor: Arc<Supervisor>,
    pub bus: Arc<TaskBus>,
    /// What crash recovery did at boot (empty when recovery was skipped).
    pub recovery: RecoverySummary,
}

impl TaiaKernel {
    /// Boot with the configured database and crash recovery.
    pub fn boot(config: FederationConfig) -> KernelResult<Self> {
        Self::boot_with_options(config, BootOptions::default())
    }

    pub fn boot_with_options(config: FederationConfig, options: BootOptions) -> KernelResult<Self> {
        info!(home = %config.home_dir.display(), "Booting TAIA kernel");

        let store = if options.in_memory {
            FederationStore::open_in_memory()
        } else {
            FederationStore::open(&config.database_path())
        }
        .map_err(|e| KernelError::BootFailed(format!("record store: {e}")))?;

        let audit_path = match (&config.bridge.audit_log_path, options.in_memory) {
            (Some(path), _) => Some(path.clone()),
            (None, false) => Some(config.home_dir.join("audit.jsonl")),
            (None, true) => None,
        };
        let audit = Arc::new(match audit_path {
            Some(path) => AuditLog::with_sink(path),
            None => AuditLog::new(),
        });
        if let Err(e) = audit.verify_integrity() {
            warn!("Audit chain failed verification at boot: {e}");
        }

        let registry = Arc::new(AgentRegistry::load(store.registry().clone(), Arc::clone(&audit))?);
        if config.registry.bootstrap {
            registry.bootstrap_defaults(
                &AgentId::new(config.bus.coordinator_agent.as_str()),
                &AgentId::new(config.bus.reviewer_agent.as_str()),
                &SkillId::new(config.bus.review_skill.as_str()),
            )?;
        }

        let bridge = Arc::new(SerializationBridge::new(
            config.bridge.clone(),
            Arc::clone(&audit),
        ));
        let approvals = Arc::new(ApprovalManager::new(
            store.approvals().clone(),
            Arc::clone(&audit),
        ));
        let supervisor = Arc::new(Supervisor::new());
        let bus = Arc::new(
            TaskBus::new(
                config.bus.clone(),
                store.tasks().clone(),
                Arc::clone(&registry),
                Arc::clone(&approvals),
                Arc::clone(&audit),
                Arc::clone(&supervisor),
            )
            .with_bridge(Arc::clone(&bridge)),
        );

        let recovery = if options.run_recovery {
            bus.initialize_bus_recovery()?
        } else {
            RecoverySummary::default()
        };

        info!(
            agents = registry.list_agents().len(),
            skills = registry.list_skills().len(),
            recovered = recovery.reset,
            "TAIA kernel booted"
        );
        Ok(Self {
            config,
            store,
            audit,
            bridge,
            registry,
            approvals,
            supervisor,
            bus,
            recovery,
        })
    }

    /// Start a worker loop for `agent_id` with the configured intervals.
    pub fn start_worker(
        &self,
        agent_id: AgentId,
        handler: Arc<dyn TaskHandler>,
    ) -> KernelResult<WorkerHandle> {
        self.bus
            .start_worker(agent_id, handler, WorkerOptions::from_config(&self.config.bus))
    }

    /// Stop every worker loop, wait for them to exit, and close the lane.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown();
        for join in self.bus.stop_all_workers() {
            if tokio::time::timeout(WORKER_JOIN_TIMEOUT, join).await.is_err() {
                warn!("Worker loop did not exit within {WORKER_JOIN_TIMEOUT:?}");
            }
        }
        self.bridge.lane().close();
        info!("TAIA kernel shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taia_types::task::TaskStatus;

    fn config(dir: &std::path::Path) -> FederationConfig {
        let mut config = FederationConfig {
            home_dir: dir.to_path_buf(),
            data_dir: dir.join("data"),
            ..Default::default()
        };
        config.bridge.workspace_root = dir.to_path_buf();
        config.bridge.checkpoints_enabled = false;
        config
    }

    #[test]
    fn test_boot_bootstraps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = TaiaKernel::boot(config(dir.path())).unwrap();
        assert!(kernel.registry.get_agent(&AgentId::new("taia-core")).is_some());
        assert!(kernel
            .registry
            .can_use_skill(&AgentId::new("qa-sentinel"), &SkillId::new("REVIEW_CODE")));
        assert!(dir.path().join("data").join("federation.db").exists());
        assert!(kernel.audit.sink_path().is_some());
        assert!(kernel.audit.verify_integrity().is_ok());
    }

    #[test]
    fn test_in_memory_without_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.registry.bootstrap = false;
        let kernel = TaiaKernel::boot_with_options(
            config,
            BootOptions {
                in_memory: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(kernel.registry.list_agents().is_empty());
        assert!(kernel.audit.sink_path().is_none());
    }

    #[test]
    fn test_reboot_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        let task_id = {
            let kernel = TaiaKernel::boot(config(dir.path())).unwrap();
            kernel
                .bus
                .delegate_task(
                    &AgentId::new("taia-core"),
                    &AgentId::new("qa-sentinel"),
                    &SkillId::new("REVIEW_CODE"),
                    serde_json::Value::Null,
                    Default::default(),
                )
                .unwrap()
                .id
        };

        let kernel = TaiaKernel::boot(config(dir.path())).unwrap();
        assert_eq!(kernel.bus.get_task(task_id).unwrap().status, TaskStatus::Pending);
        assert!(kernel.audit.len() > 1);
        assert!(kernel.audit.verify_integrity().is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_work() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = TaiaKernel::boot(config(dir.path())).unwrap();
        kernel.shutdown().await;
        assert!(kernel.bridge.lane().is_closed());
        assert!(kernel
            .bus
            .delegate_task(
                &AgentId::new("taia-core"),
                &AgentId::new("qa-sentinel"),
                &SkillId::new("REVIEW_CODE"),
                serde_json::Value::Null,
                Default::default(),
            )
            .is_err());
    }
}
