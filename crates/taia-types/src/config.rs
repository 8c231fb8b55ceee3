//! Federation configuration types.
//!
//! Every field has a default so a partial `config.toml` (or none at all)
//! yields a working configuration.

use crate::finding::Severity;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for the federation core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    /// Federation home directory (defaults to `~/.taia`).
    pub home_dir: PathBuf,
    /// Directory for the record database (defaults to `<home>/data`).
    pub data_dir: PathBuf,
    /// Log filter used when `RUST_LOG` is not set.
    pub log_level: String,
    pub bus: BusConfig,
    pub bridge: BridgeConfig,
    pub registry: RegistryConfig,
}

impl Default for FederationConfig {
    fn default() -> Self {
        let home_dir = dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".taia");
        Self {
            data_dir: home_dir.join("data"),
            home_dir,
            log_level: "info".to_string(),
            bus: BusConfig::default(),
            bridge: BridgeConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

impl FederationConfig {
    /// Path of the SQLite record database.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("federation.db")
    }
}

/// Task bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Worker poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Hard timeout for one handler invocation, in seconds.
    pub handler_timeout_secs: u64,
    /// How long orchestration waits for a human decision, in seconds.
    pub approval_timeout_secs: u64,
    /// Poll interval while waiting for a decision, in milliseconds.
    pub approval_poll_interval_ms: u64,
    /// How long orchestration waits for its tasks to settle, in seconds.
    pub completion_timeout_secs: u64,
    /// Recovery resets before a crashed task is failed permanently.
    pub max_retries: u32,
    /// Skills whose successful results go through the quality gate.
    pub code_producing_skills: Vec<String>,
    /// Agent that receives review tasks.
    pub reviewer_agent: String,
    /// Skill delegated for reviews.
    pub review_skill: String,
    /// Coordinating agent created at bootstrap.
    pub coordinator_agent: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3000,
            handler_timeout_secs: 60,
            approval_timeout_secs: 300,
            approval_poll_interval_ms: 1000,
            completion_timeout_secs: 600,
            max_retries: 3,
            code_producing_skills: vec![
                "GENERATE_CODE".to_string(),
                "MODIFY_CODE".to_string(),
                "REFACTOR_CODE".to_string(),
            ],
            reviewer_agent: "qa-sentinel".to_string(),
            review_skill: "REVIEW_CODE".to_string(),
            coordinator_agent: "taia-core".to_string(),
        }
    }
}

/// Serialization bridge settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Root that relative targets and protected zones resolve against.
    pub workspace_root: PathBuf,
    /// Paths (relative to the root) that destructive actions may not touch.
    pub protected_paths: Vec<String>,
    /// Substrings that reject a shell command outright.
    pub command_blacklist: Vec<String>,
    /// Finding severities that need a human decision.
    pub escalation_severities: Vec<Severity>,
    /// Optional JSON-lines mirror of the audit chain.
    pub audit_log_path: Option<PathBuf>,
    /// Write checkpoint markers before mutating operations.
    pub checkpoints_enabled: bool,
    /// Maximum length of result/error summaries in audit entries.
    pub summary_max_len: usize,
    /// Files larger than this are verified without a content hash.
    pub max_proof_bytes: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            protected_paths: vec![
                ".git".to_string(),
                "src".to_string(),
                "Cargo.toml".to_string(),
                ".env".to_string(),
            ],
            command_blacklist: vec![
                "rm -rf".to_string(),
                "rm -fr".to_string(),
                "git reset --hard".to_string(),
                "git clean -fd".to_string(),
                "git push --force".to_string(),
                "mkfs".to_string(),
                "format c:".to_string(),
                "dd if=".to_string(),
                "del /s".to_string(),
                "chmod -r 777".to_string(),
                ":(){ :|:& };:".to_string(),
                "sudo".to_string(),
            ],
            escalation_severities: vec![Severity::Critical, Severity::Blocker],
            audit_log_path: None,
            checkpoints_enabled: true,
            summary_max_len: 200,
            max_proof_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Registry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Create the built-in agents and skills when missing.
    pub bootstrap: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { bootstrap: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FederationConfig::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.bus.poll_interval_ms, 3000);
        assert_eq!(config.bus.handler_timeout_secs, 60);
        assert_eq!(config.bus.approval_timeout_secs, 300);
        assert_eq!(config.bus.max_retries, 3);
        assert!(config.database_path().ends_with("federation.db"));
    }

    #[test]
    fn test_partial_toml() {
        let config: FederationConfig = toml::from_str(
            r#"
            log_level = "debug"
            [bus]
            max_retries = 5
            [bridge]
            escalation_severities = ["blocker"]
            "#,
        )
        .unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.bus.max_retries, 5);
        assert_eq!(config.bus.poll_interval_ms, 3000);
        assert_eq!(config.bridge.escalation_severities, vec![Severity::Blocker]);
        assert!(config.bridge.checkpoints_enabled);
    }
}
