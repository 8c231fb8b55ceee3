//! Agent registry: identities, skills and permission grants.
//!
//! State is loaded from the record store once at startup and every mutation
//! is persisted before it becomes visible in the in-memory maps, so a
//! restart never loses authorization state.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use taia_memory::registry::RegistryStore;
use taia_runtime::audit::{AuditAction, AuditLog};
use taia_types::agent::{Agent, AgentConfig, AgentId, AgentStatus};
use taia_types::error::{TaiaError, TaiaResult};
use taia_types::skill::{
    ActionKind, Grant, GrantResult, GrantState, Skill, SkillCategory, SkillConfig, SkillId,
};
use tracing::{debug, info, warn};

const REGISTRY_ACTOR: &str = "registry";

/// Generate a fresh agent identity token: 32 random bytes, hex-encoded.
fn generate_token() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

struct BuiltinSkill {
    id: &'static str,
    category: SkillCategory,
    risk_level: u8,
    prerequisites: &'static [&'static str],
    action: Option<ActionKind>,
    description: &'static str,
}

const BUILTIN_SKILLS: &[BuiltinSkill] = &[
    BuiltinSkill {
        id: "READ_CODE",
        category: SkillCategory::Read,
        risk_level: 1,
        prerequisites: &[],
        action: None,
        description: "Read source files in the workspace",
    },
    BuiltinSkill {
        id: "WRITE_DOCS",
        category: SkillCategory::Write,
        risk_level: 3,
        prerequisites: &["READ_CODE"],
        action: None,
        description: "Create or update documentation files",
    },
    BuiltinSkill {
        id: "GENERATE_CODE",
        category: SkillCategory::Write,
        risk_level: 5,
        prerequisites: &["READ_CODE"],
        action: None,
        description: "Write new source files",
    },
    BuiltinSkill {
        id: "MODIFY_CODE",
        category: SkillCategory::Write,
        risk_level: 6,
        prerequisites: &["READ_CODE"],
        action: None,
        description: "Edit existing source files",
    },
    BuiltinSkill {
        id: "REFACTOR_CODE",
        category: SkillCategory::Write,
        risk_level: 6,
        prerequisites: &["READ_CODE", "MODIFY_CODE"],
        action: None,
        description: "Restructure code without changing behavior",
    },
    BuiltinSkill {
        id: "REVIEW_CODE",
        category: SkillCategory::Read,
        risk_level: 2,
        prerequisites: &["READ_CODE"],
        action: None,
        description: "Review a change and approve or reject it",
    },
    BuiltinSkill {
        id: "RUN_TESTS",
        category: SkillCategory::Execute,
        risk_level: 4,
        prerequisites: &["READ_CODE"],
        action: None,
        description: "Run the project's test suite",
    },
    BuiltinSkill {
        id: "EXECUTE_SHELL",
        category: SkillCategory::Execute,
        risk_level: 7,
        prerequisites: &[],
        action: None,
        description: "Run arbitrary shell commands",
    },
    BuiltinSkill {
        id: "DELETE_CODE",
        category: SkillCategory::Critical,
        risk_level: 9,
        prerequisites: &["READ_CODE"],
        action: Some(ActionKind::Delete),
        description: "Remove files or directories",
    },
    BuiltinSkill {
        id: "GIT_PUSH",
        category: SkillCategory::Critical,
        risk_level: 9,
        prerequisites: &[],
        action: Some(ActionKind::Execute),
        description: "Publish commits to a remote",
    },
];

/// The registry of agents, skills and who may use what.
pub struct AgentRegistry {
    store: RegistryStore,
    audit: Arc<AuditLog>,
    agents: DashMap<AgentId, Agent>,
    skills: DashMap<SkillId, Skill>,
    grants: DashMap<(AgentId, SkillId), Grant>,
}

impl AgentRegistry {
    /// Load every agent, skill and grant from the store.
    pub fn load(store: RegistryStore, audit: Arc<AuditLog>) -> TaiaResult<Self> {
        let agents = DashMap::new();
        for agent in store.load_agents()? {
            agents.insert(agent.id.clone(), agent);
        }
        let skills = DashMap::new();
        for skill in store.load_skills()? {
            skills.insert(skill.id.clone(), skill);
        }
        let grants = DashMap::new();
        for grant in store.load_grants()? {
            grants.insert((grant.agent_id.clone(), grant.skill_id.clone()), grant);
        }
        info!(
            agents = agents.len(),
            skills = skills.len(),
            grants = grants.len(),
            "Registry loaded"
        );
        Ok(Self {
            store,
            audit,
            agents,
            skills,
            grants,
        })
    }

    /// Register a new agent with a fresh identity token.
    pub fn register_agent(&self, id: AgentId, config: AgentConfig) -> TaiaResult<Agent> {
        if id.as_str().trim().is_empty() {
            return Err(TaiaError::InvalidInput("agent id must not be empty".to_string()));
        }
        let now = Utc::now();
        let agent = Agent {
            name: if config.name.is_empty() {
                id.to_string()
            } else {
                config.name
            },
            id: id.clone(),
            description: config.description,
            capabilities: config.capabilities,
            token: generate_token(),
            status: AgentStatus::Idle,
            created_at: now,
            last_active: now,
            skill_count: 0,
        };

        match self.agents.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(TaiaError::AgentAlreadyExists(id.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                self.store.save_agent(&agent)?;
                slot.insert(agent.clone());
            }
        }

        self.audit.record(
            REGISTRY_ACTOR,
            AuditAction::AgentRegistered,
            format!("{id} token={}...", agent.token_prefix()),
            "ok",
        );
        info!(agent = %id, token_prefix = %agent.token_prefix(), "Agent registered");
        Ok(agent)
    }

    /// Register a new skill definition.
    pub fn register_skill(&self, id: SkillId, config: SkillConfig) -> TaiaResult<Skill> {
        if id.as_str().trim().is_empty() {
            return Err(TaiaError::InvalidInput("skill id must not be empty".to_string()));
        }
        let skill = Skill::from_config(id.clone(), config);
        match self.skills.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(TaiaError::SkillAlreadyExists(id.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                self.store.save_skill(&skill)?;
                slot.insert(skill.clone());
            }
        }
        self.audit.record(
            REGISTRY_ACTOR,
            AuditAction::SkillRegistered,
            format!("{id} risk={} critical={}", skill.risk_level, skill.is_critical()),
            "ok",
        );
        debug!(skill = %id, "Skill registered");
        Ok(skill)
    }

    /// Grant `skill_id` to `agent_id`.
    ///
    /// Critical skills need a non-empty approval token; without one this
    /// fails with `ApprovalRequired` and nothing is written. Missing
    /// prerequisites are reported, not enforced.
    pub fn assign_skill(
        &self,
        agent_id: &AgentId,
        skill_id: &SkillId,
        approval_token: Option<&str>,
    ) -> TaiaResult<GrantResult> {
        if !self.agents.contains_key(agent_id) {
            return Err(TaiaError::AgentNotFound(agent_id.to_string()));
        }
        let skill = self
            .get_skill(skill_id)
            .ok_or_else(|| TaiaError::SkillNotFound(skill_id.to_string()))?;
        let critical = skill.is_critical();

        let has_token = approval_token.is_some_and(|t| !t.trim().is_empty());
        if critical && !has_token {
            self.audit.record(
                agent_id.as_str(),
                AuditAction::SkillGranted,
                skill_id.as_str(),
                "approval required",
            );
            warn!(agent = %agent_id, skill = %skill_id, "Critical skill grant without approval token");
            return Err(TaiaError::ApprovalRequired(format!(
                "skill '{skill_id}' is critical; an approval token is required to grant it to '{agent_id}'"
            )));
        }

        let missing_prerequisites: Vec<SkillId> = skill
            .prerequisites
            .iter()
            .filter(|p| !self.is_granted(agent_id, p))
            .cloned()
            .collect();
        if !missing_prerequisites.is_empty() {
            warn!(
                agent = %agent_id,
                skill = %skill_id,
                missing = ?missing_prerequisites,
                "Granting skill with missing prerequisites"
            );
        }

        let already_granted = self.is_granted(agent_id, skill_id);
        if !already_granted {
            let grant = Grant {
                agent_id: agent_id.clone(),
                skill_id: skill_id.clone(),
                state: GrantState::Granted,
                critical,
                granted_at: Utc::now(),
                revoked_at: None,
            };
            self.store.save_grant(&grant)?;
            self.grants
                .insert((agent_id.clone(), skill_id.clone()), grant);
            self.refresh_skill_count(agent_id)?;
        }

        self.audit.record(
            agent_id.as_str(),
            AuditAction::SkillGranted,
            skill_id.as_str(),
            format!("ok critical={critical}"),
        );
        info!(agent = %agent_id, skill = %skill_id, critical, "Skill granted");

        Ok(GrantResult {
            agent_id: agent_id.clone(),
            skill_id: skill_id.clone(),
            critical,
            already_granted,
            missing_prerequisites,
        })
    }

    /// Revoke a grant. Returns `false` when the skill was not granted.
    pub fn revoke_skill(&self, agent_id: &AgentId, skill_id: &SkillId) -> TaiaResult<bool> {
        if !self.agents.contains_key(agent_id) {
            return Err(TaiaError::AgentNotFound(agent_id.to_string()));
        }
        if !self.skills.contains_key(skill_id) {
            return Err(TaiaError::SkillNotFound(skill_id.to_string()));
        }
        if !self.is_granted(agent_id, skill_id) {
            return Ok(false);
        }

        let key = (agent_id.clone(), skill_id.clone());
        let revoked = match self.grants.get(&key) {
            Some(grant) => Grant {
                state: GrantState::Revoked,
                revoked_at: Some(Utc::now()),
                ..grant.clone()
            },
            None => return Ok(false),
        };
        self.store.save_grant(&revoked)?;
        self.grants.insert(key, revoked);
        self.refresh_skill_count(agent_id)?;

        self.audit.record(
            agent_id.as_str(),
            AuditAction::SkillRevoked,
            skill_id.as_str(),
            "ok",
        );
        info!(agent = %agent_id, skill = %skill_id, "Skill revoked");
        Ok(true)
    }

    /// The tri-state grant fact for a pair.
    pub fn grant_state(&self, agent_id: &AgentId, skill_id: &SkillId) -> GrantState {
        self.grants
            .get(&(agent_id.clone(), skill_id.clone()))
            .map(|g| g.state)
            .unwrap_or(GrantState::NeverGranted)
    }

    fn is_granted(&self, agent_id: &AgentId, skill_id: &SkillId) -> bool {
        self.grant_state(agent_id, skill_id) == GrantState::Granted
    }

    /// Whether the agent currently holds the skill. Denials are audited.
    pub fn can_use_skill(&self, agent_id: &AgentId, skill_id: &SkillId) -> bool {
        let allowed = self.is_granted(agent_id, skill_id);
        if !allowed {
            self.audit.record(
                agent_id.as_str(),
                AuditAction::PermissionDenied,
                skill_id.as_str(),
                "denied",
            );
            debug!(agent = %agent_id, skill = %skill_id, "Skill use denied");
        }
        allowed
    }

    /// Skills currently granted to an agent, sorted by id.
    pub fn get_agent_skills(&self, agent_id: &AgentId) -> TaiaResult<Vec<Skill>> {
        if !self.agents.contains_key(agent_id) {
            return Err(TaiaError::AgentNotFound(agent_id.to_string()));
        }
        let mut skills: Vec<Skill> = self
            .grants
            .iter()
            .filter(|g| &g.agent_id == agent_id && g.state == GrantState::Granted)
            .filter_map(|g| self.get_skill(&g.skill_id))
            .collect();
        skills.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(skills)
    }

    /// Constant-time comparison of a presented token with the agent's.
    pub fn verify_agent_token(&self, agent_id: &AgentId, token: &str) -> bool {
        use subtle::ConstantTimeEq;
        match self.agents.get(agent_id) {
            Some(agent) => {
                let stored = agent.token.as_bytes();
                let provided = token.as_bytes();
                stored.len() == provided.len() && bool::from(stored.ct_eq(provided))
            }
            None => false,
        }
    }

    /// Record activity: set the lifecycle status and bump `last_active`.
    pub fn touch_agent(&self, agent_id: &AgentId, status: AgentStatus) -> TaiaResult<()> {
        self.update_agent(agent_id, |agent| {
            if agent.status != AgentStatus::Disabled {
                agent.status = status;
            }
            agent.last_active = Utc::now();
        })
        .map(|_| ())
    }

    /// Disable or re-enable an agent.
    pub fn set_agent_status(&self, agent_id: &AgentId, status: AgentStatus) -> TaiaResult<Agent> {
        self.update_agent(agent_id, |agent| agent.status = status)
    }

    pub fn get_agent(&self, agent_id: &AgentId) -> Option<Agent> {
        self.agents.get(agent_id).map(|a| a.clone())
    }

    pub fn get_skill(&self, skill_id: &SkillId) -> Option<Skill> {
        self.skills.get(skill_id).map(|s| s.clone())
    }

    pub fn list_agents(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self.agents.iter().map(|a| a.clone()).collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    pub fn list_skills(&self) -> Vec<Skill> {
        let mut skills: Vec<Skill> = self.skills.iter().map(|s| s.clone()).collect();
        skills.sort_by(|a, b| a.id.cmp(&b.id));
        skills
    }

    /// Create the built-in agents and skills that are missing, and grant
    /// the review skill to the reviewer.
    pub fn bootstrap_defaults(
        &self,
        coordinator: &AgentId,
        reviewer: &AgentId,
        review_skill: &SkillId,
    ) -> TaiaResult<()> {
        for builtin in BUILTIN_SKILLS {
            let id = SkillId::new(builtin.id);
            if self.skills.contains_key(&id) {
                continue;
            }
            self.register_skill(
                id,
                SkillConfig {
                    name: builtin.id.to_string(),
                    category: builtin.category,
                    risk_level: builtin.risk_level,
                    prerequisites: builtin
                        .prerequisites
                        .iter()
                        .map(|p| SkillId::new(*p))
                        .collect(),
                    description: builtin.description.to_string(),
                    critical: false,
                    action: builtin.action,
                },
            )?;
        }

        let defaults = [
            (coordinator, "Coordinator", "Plans work and delegates it"),
            (reviewer, "QA Sentinel", "Reviews code-producing results"),
        ];
        for (id, name, description) in defaults {
            if self.agents.contains_key(id) {
                continue;
            }
            self.register_agent(
                id.clone(),
                AgentConfig {
                    name: name.to_string(),
                    description: description.to_string(),
                    capabilities: vec![],
                },
            )?;
        }

        if self.skills.contains_key(review_skill) && !self.is_granted(reviewer, review_skill) {
            self.assign_skill(reviewer, review_skill, None)?;
        }
        Ok(())
    }

    fn refresh_skill_count(&self, agent_id: &AgentId) -> TaiaResult<()> {
        let count = self
            .grants
            .iter()
            .filter(|g| &g.agent_id == agent_id && g.state == GrantState::Granted)
            .count() as u32;
        self.update_agent(agent_id, |agent| agent.skill_count = count)
            .map(|_| ())
    }

    fn update_agent<F>(&self, agent_id: &AgentId, mutate: F) -> TaiaResult<Agent>
    where
        F: FnOnce(&mut Agent),
    {
        let snapshot = {
            let mut entry = self
                .agents
                .get_mut(agent_id)
                .ok_or_else(|| TaiaError::AgentNotFound(agent_id.to_string()))?;
            mutate(&mut entry);
            entry.clone()
        };
        self.store.save_agent(&snapshot)?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taia_memory::FederationStore;

    fn setup() -> (FederationStore, AgentRegistry) {
        let store = FederationStore::open_in_memory().unwrap();
        let registry =
            AgentRegistry::load(store.registry().clone(), Arc::new(AuditLog::new())).unwrap();
        registry
            .bootstrap_defaults(
                &AgentId::new("taia-core"),
                &AgentId::new("qa-sentinel"),
                &SkillId::new("REVIEW_CODE"),
            )
            .unwrap();
        (store, registry)
    }

    #[test]
    fn test_register_agent_rejects_duplicates() {
        let (_store, registry) = setup();
        let agent = registry
            .register_agent(AgentId::new("doc-sentinel"), AgentConfig::default())
            .unwrap();
        assert_eq!(agent.token.len(), 64);
        assert_eq!(agent.name, "doc-sentinel");

        let err = registry
            .register_agent(AgentId::new("doc-sentinel"), AgentConfig::default())
            .unwrap_err();
        assert!(matches!(err, TaiaError::AgentAlreadyExists(_)));
    }

    #[test]
    fn test_audit_never_holds_full_token() {
        let (_store, registry) = setup();
        let agent = registry
            .register_agent(AgentId::new("doc-sentinel"), AgentConfig::default())
            .unwrap();
        for entry in registry.audit.recent(100) {
            assert!(!entry.detail.contains(&agent.token));
        }
        assert!(registry
            .audit
            .recent(1)[0]
            .detail
            .contains(agent.token_prefix()));
    }

    #[test]
    fn test_critical_skill_needs_token() {
        let (_store, registry) = setup();
        let agent = AgentId::new("agentX");
        let skill = SkillId::new("DELETE_CODE");
        registry
            .register_agent(agent.clone(), AgentConfig::default())
            .unwrap();

        let err = registry.assign_skill(&agent, &skill, None).unwrap_err();
        assert!(matches!(err, TaiaError::ApprovalRequired(_)));
        assert!(!registry.can_use_skill(&agent, &skill));

        let err = registry.assign_skill(&agent, &skill, Some("   ")).unwrap_err();
        assert!(matches!(err, TaiaError::ApprovalRequired(_)));

        let result = registry
            .assign_skill(&agent, &skill, Some("ticket-4711"))
            .unwrap();
        assert!(result.critical);
        assert!(registry.can_use_skill(&agent, &skill));
    }

    #[test]
    fn test_assign_unknown_agent_or_skill() {
        let (_store, registry) = setup();
        assert!(matches!(
            registry
                .assign_skill(&AgentId::new("ghost"), &SkillId::new("READ_CODE"), None)
                .unwrap_err(),
            TaiaError::AgentNotFound(_)
        ));
        assert!(matches!(
            registry
                .assign_skill(&AgentId::new("taia-core"), &SkillId::new("FLY"), None)
                .unwrap_err(),
            TaiaError::SkillNotFound(_)
        ));
    }

    #[test]
    fn test_prerequisites_are_advisory() {
        let (_store, registry) = setup();
        let agent = AgentId::new("doc-sentinel");
        registry
            .register_agent(agent.clone(), AgentConfig::default())
            .unwrap();
        let result = registry
            .assign_skill(&agent, &SkillId::new("WRITE_DOCS"), None)
            .unwrap();
        assert_eq!(result.missing_prerequisites, vec![SkillId::new("READ_CODE")]);
        assert!(registry.can_use_skill(&agent, &SkillId::new("WRITE_DOCS")));
    }

    #[test]
    fn test_skill_count_and_regrant() {
        let (_store, registry) = setup();
        let agent = AgentId::new("coder");
        registry
            .register_agent(agent.clone(), AgentConfig::default())
            .unwrap();
        registry
            .assign_skill(&agent, &SkillId::new("READ_CODE"), None)
            .unwrap();
        let again = registry
            .assign_skill(&agent, &SkillId::new("READ_CODE"), None)
            .unwrap();
        assert!(again.already_granted);
        assert_eq!(registry.get_agent(&agent).unwrap().skill_count, 1);

        assert!(registry
            .revoke_skill(&agent, &SkillId::new("READ_CODE"))
            .unwrap());
        assert_eq!(
            registry.grant_state(&agent, &SkillId::new("READ_CODE")),
            GrantState::Revoked
        );
        assert_eq!(registry.get_agent(&agent).unwrap().skill_count, 0);
        assert!(!registry
            .revoke_skill(&agent, &SkillId::new("READ_CODE"))
            .unwrap());

        registry
            .assign_skill(&agent, &SkillId::new("READ_CODE"), None)
            .unwrap();
        assert_eq!(
            registry.grant_state(&agent, &SkillId::new("READ_CODE")),
            GrantState::Granted
        );
        assert_eq!(
            registry.grant_state(&agent, &SkillId::new("MODIFY_CODE")),
            GrantState::NeverGranted
        );
    }

    #[test]
    fn test_denials_are_audited() {
        let (_store, registry) = setup();
        let before = registry.audit.len();
        assert!(!registry.can_use_skill(&AgentId::new("taia-core"), &SkillId::new("GIT_PUSH")));
        let last = &registry.audit.recent(1)[0];
        assert_eq!(registry.audit.len(), before + 1);
        assert_eq!(last.action, AuditAction::PermissionDenied);
    }

    #[test]
    fn test_state_survives_reload() {
        let (store, registry) = setup();
        let agent = AgentId::new("agentX");
        let created = registry
            .register_agent(agent.clone(), AgentConfig::default())
            .unwrap();
        registry
            .assign_skill(&agent, &SkillId::new("DELETE_CODE"), Some("approved-by-ops"))
            .unwrap();
        drop(registry);

        let reloaded =
            AgentRegistry::load(store.registry().clone(), Arc::new(AuditLog::new())).unwrap();
        assert!(reloaded.can_use_skill(&agent, &SkillId::new("DELETE_CODE")));
        assert!(reloaded.verify_agent_token(&agent, &created.token));
        assert!(!reloaded.verify_agent_token(&agent, "not-the-token"));
        assert_eq!(reloaded.get_agent_skills(&agent).unwrap().len(), 1);
    }

    #[test]
    fn test_bootstrap_catalogue() {
        let (_store, registry) = setup();
        assert_eq!(registry.list_skills().len(), BUILTIN_SKILLS.len());
        assert!(registry.get_skill(&SkillId::new("DELETE_CODE")).unwrap().is_critical());
        assert!(registry.get_skill(&SkillId::new("GIT_PUSH")).unwrap().is_critical());
        assert!(!registry.get_skill(&SkillId::new("REVIEW_CODE")).unwrap().mutating);
        assert!(registry.get_skill(&SkillId::new("WRITE_DOCS")).unwrap().mutating);
        assert!(registry.can_use_skill(&AgentId::new("qa-sentinel"), &SkillId::new("REVIEW_CODE")));

        // A second bootstrap is a no-op.
        registry
            .bootstrap_defaults(
                &AgentId::new("taia-core"),
                &AgentId::new("qa-sentinel"),
                &SkillId::new("REVIEW_CODE"),
            )
            .unwrap();
        assert_eq!(registry.list_agents().len(), 2);
    }
}
