//! Skill definitions and permission grants.

use crate::agent::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Risk level at or above which a skill is critical regardless of category.
pub const CRITICAL_RISK_LEVEL: u8 = 9;

/// Highest accepted risk level.
pub const MAX_RISK_LEVEL: u8 = 10;

/// Identifier of a skill (e.g. `WRITE_DOCS`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SkillId(pub String);

impl SkillId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SkillId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SkillId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SkillId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Skill category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillCategory {
    #[default]
    Read,
    Write,
    Execute,
    Critical,
}

/// The kind of side effect an invocation has, as seen by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// No side effect.
    Read,
    /// Creates or edits files.
    Write,
    /// Runs commands.
    Execute,
    /// Removes files or directories.
    Delete,
}

impl ActionKind {
    /// Whether this action changes external state.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, ActionKind::Read)
    }

    /// Parse a loose action name (`rm`, `unlink`, `edit`, `shell`, ...).
    pub fn from_action_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "delete" | "remove" | "unlink" | "rm" | "rmdir" => ActionKind::Delete,
            "write" | "edit" | "create" | "modify" | "patch" => ActionKind::Write,
            "execute" | "exec" | "shell" | "run" | "git" => ActionKind::Execute,
            _ => ActionKind::Read,
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActionKind::Read => "read",
            ActionKind::Write => "write",
            ActionKind::Execute => "execute",
            ActionKind::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Caller-supplied settings for registering a skill.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub category: SkillCategory,
    #[serde(default)]
    pub risk_level: u8,
    #[serde(default)]
    pub prerequisites: Vec<SkillId>,
    #[serde(default)]
    pub description: String,
    /// Explicit critical flag (critical also follows from risk or category).
    #[serde(default)]
    pub critical: bool,
    /// Side-effect kind. Defaults from the category when omitted.
    #[serde(default)]
    pub action: Option<ActionKind>,
}

/// A registered skill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skill {
    pub id: SkillId,
    pub name: String,
    pub category: SkillCategory,
    pub risk_level: u8,
    pub prerequisites: Vec<SkillId>,
    pub description: String,
    pub critical: bool,
    /// Fixed at registration: whether invocations are routed through the
    /// serialization lane.
    pub mutating: bool,
    pub action: ActionKind,
}

impl Skill {
    /// Build a skill from its registration settings.
    pub fn from_config(id: SkillId, config: SkillConfig) -> Self {
        let action = config.action.unwrap_or(match config.category {
            SkillCategory::Read => ActionKind::Read,
            SkillCategory::Write => ActionKind::Write,
            SkillCategory::Execute => ActionKind::Execute,
            SkillCategory::Critical => ActionKind::Delete,
        });
        let name = if config.name.is_empty() {
            id.0.clone()
        } else {
            config.name
        };
        Self {
            id,
            name,
            category: config.category,
            risk_level: config.risk_level.min(MAX_RISK_LEVEL),
            prerequisites: config.prerequisites,
            description: config.description,
            critical: config.critical,
            mutating: action.is_mutating(),
            action,
        }
    }

    /// Critical skills need an approval token to be granted and an approved
    /// decision to be delegated.
    pub fn is_critical(&self) -> bool {
        self.critical
            || self.category == SkillCategory::Critical
            || self.risk_level >= CRITICAL_RISK_LEVEL
    }
}

/// Tri-state grant fact for an (agent, skill) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantState {
    Granted,
    Revoked,
    NeverGranted,
}

/// A persisted permission grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grant {
    pub agent_id: AgentId,
    pub skill_id: SkillId,
    pub state: GrantState,
    pub critical: bool,
    pub granted_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Outcome of a successful skill assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantResult {
    pub agent_id: AgentId,
    pub skill_id: SkillId,
    pub critical: bool,
    /// Whether the grant already existed before this call.
    pub already_granted: bool,
    /// Prerequisites the agent does not hold (advisory).
    pub missing_prerequisites: Vec<SkillId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_critical_by_risk() {
        let skill = Skill::from_config(
            SkillId::new("GIT_PUSH"),
            SkillConfig {
                category: SkillCategory::Execute,
                risk_level: 9,
                ..Default::default()
            },
        );
        assert!(skill.is_critical());
        assert!(skill.mutating);
    }

    #[test]
    fn test_critical_by_category_and_flag() {
        let by_category = Skill::from_config(
            SkillId::new("DELETE_CODE"),
            SkillConfig {
                category: SkillCategory::Critical,
                ..Default::default()
            },
        );
        assert!(by_category.is_critical());
        assert_eq!(by_category.action, ActionKind::Delete);

        let by_flag = Skill::from_config(
            SkillId::new("X"),
            SkillConfig {
                critical: true,
                ..Default::default()
            },
        );
        assert!(by_flag.is_critical());
    }

    #[test]
    fn test_read_skill_not_mutating() {
        let skill = Skill::from_config(SkillId::new("READ_CODE"), SkillConfig::default());
        assert!(!skill.mutating);
        assert!(!skill.is_critical());
        assert_eq!(skill.name, "READ_CODE");
    }

    #[test]
    fn test_explicit_action_overrides_category() {
        let skill = Skill::from_config(
            SkillId::new("REVIEW_CODE"),
            SkillConfig {
                category: SkillCategory::Write,
                action: Some(ActionKind::Read),
                ..Default::default()
            },
        );
        assert!(!skill.mutating);
    }

    #[test]
    fn test_risk_level_clamped() {
        let skill = Skill::from_config(
            SkillId::new("X"),
            SkillConfig {
                risk_level: 42,
                ..Default::default()
            },
        );
        assert_eq!(skill.risk_level, MAX_RISK_LEVEL);
    }

    #[test]
    fn test_action_name_parsing() {
        assert_eq!(ActionKind::from_action_name("unlink"), ActionKind::Delete);
        assert_eq!(ActionKind::from_action_name("EDIT"), ActionKind::Write);
        assert_eq!(ActionKind::from_action_name("shell"), ActionKind::Execute);
        assert_eq!(ActionKind::from_action_name("stat"), ActionKind::Read);
    }
}
