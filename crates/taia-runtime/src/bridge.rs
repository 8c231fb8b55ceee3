//! The serialization bridge: the single sanctioned path for side effects.

use crate::audit::{AuditAction, AuditLog};
use crate::error::{BridgeError, BridgeResult};
use crate::lane::MutationLane;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Display;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use taia_types::config::BridgeConfig;
use taia_types::finding::{ApprovalDecision, FindingVerdict, SecurityFinding, Verdict};
use taia_types::skill::ActionKind;
use tracing::{debug, info, warn};
use uuid::Uuid;

const BRIDGE_ACTOR: &str = "bridge";

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Outcome of a target check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// Target exists and the action is permitted.
    Verified,
    /// Destructive action against a protected zone.
    Blocked,
    /// Target does not exist.
    Missing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub status: VerificationStatus,
    pub action: ActionKind,
    pub target: String,
    /// SHA-256 of the file contents, when the target is a file small enough
    /// to hash.
    pub proof: Option<String>,
    pub reason: Option<String>,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
}

impl VerificationResult {
    pub fn is_verified(&self) -> bool {
        self.status == VerificationStatus::Verified
    }

    /// Turn a failed check into its typed rejection.
    pub fn into_result(self) -> BridgeResult<Self> {
        match self.status {
            VerificationStatus::Verified => Ok(self),
            VerificationStatus::Blocked => Err(BridgeError::ProtectedZone {
                action: self.action.to_string(),
                path: self.target,
            }),
            VerificationStatus::Missing => Err(BridgeError::TargetMissing(self.target)),
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Created,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointResult {
    pub status: CheckpointStatus,
    pub description: String,
    /// Commit the workspace was at when the marker was written.
    pub head: Option<String>,
    /// Why the checkpoint was skipped.
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// Funnels mutating work through the lane and audits every operation.
pub struct SerializationBridge {
    config: BridgeConfig,
    root: PathBuf,
    audit: Arc<AuditLog>,
    lane: MutationLane,
}

impl SerializationBridge {
    pub fn new(config: BridgeConfig, audit: Arc<AuditLog>) -> Self {
        let root = if config.workspace_root.is_absolute() {
            config.workspace_root.clone()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&config.workspace_root))
                .unwrap_or_else(|_| config.workspace_root.clone())
        };
        Self {
            root: normalize(&root),
            config,
            audit,
            lane: MutationLane::new(),
        }
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn lane(&self) -> &MutationLane {
        &self.lane
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Resolve `target` against the workspace root without touching the
    /// filesystem.
    fn resolve(&self, target: &str) -> PathBuf {
        let path = Path::new(target);
        if path.is_absolute() {
            normalize(path)
        } else {
            normalize(&self.root.join(path))
        }
    }

    /// Whether `path` is inside a protected zone, or is an ancestor of one.
    fn is_protected(&self, path: &Path) -> bool {
        self.config.protected_paths.iter().any(|zone| {
            let zone = self.resolve(zone);
            path.starts_with(&zone) || zone.starts_with(path)
        })
    }

    /// Check that `action` may proceed against `target`.
    ///
    /// Destructive actions on protected zones are blocked on the path alone.
    /// Otherwise the target must exist; a file target also gets a content
    /// hash as proof. Every check is audited.
    pub async fn verify_action(&self, action: &str, target: &str) -> VerificationResult {
        let kind = ActionKind::from_action_name(action);
        let correlation_id = Uuid::new_v4().to_string();
        let resolved = self.resolve(target);

        let (status, proof, reason) = if kind == ActionKind::Delete && self.is_protected(&resolved)
        {
            (
                VerificationStatus::Blocked,
                None,
                Some(format!("'{target}' is inside a protected zone")),
            )
        } else {
            match tokio::fs::metadata(&resolved).await {
                Ok(meta) => {
                    let proof = if meta.is_file() && meta.len() <= self.config.max_proof_bytes {
                        match tokio::fs::read(&resolved).await {
                            Ok(bytes) => Some(hex::encode(Sha256::digest(&bytes))),
                            Err(e) => {
                                debug!(target = %target, "No proof collected: {e}");
                                None
                            }
                        }
                    } else {
                        None
                    };
                    (VerificationStatus::Verified, proof, None)
                }
                Err(_) => (
                    VerificationStatus::Missing,
                    None,
                    Some(format!("'{target}' does not exist")),
                ),
            }
        };

        let outcome = match status {
            VerificationStatus::Verified => "verified",
            VerificationStatus::Blocked => "blocked",
            VerificationStatus::Missing => "missing",
        };
        self.audit.record_correlated(
            BRIDGE_ACTOR,
            AuditAction::IntegrityCheck,
            format!("{kind} {target}"),
            outcome,
            correlation_id.as_str(),
        );
        if status != VerificationStatus::Verified {
            warn!(action = %kind, target = %target, "Verification {outcome}");
        }

        VerificationResult {
            status,
            action: kind,
            target: target.to_string(),
            proof,
            reason,
            correlation_id,
            timestamp: Utc::now(),
        }
    }

    /// Run one tool invocation with start/finish audit entries.
    ///
    /// Mutating calls wait for the lane; read-only calls run immediately.
    /// A failing tool yields `ToolFailed` and leaves the lane free for the
    /// next operation.
    pub async fn wrap_tool_call<T, E, F>(
        &self,
        tool: &str,
        args: &serde_json::Value,
        mutating: bool,
        work: F,
    ) -> BridgeResult<T>
    where
        F: Future<Output = Result<T, E>>,
        T: Serialize,
        E: Display,
    {
        let correlation_id = Uuid::new_v4().to_string();
        self.audit.record_correlated(
            BRIDGE_ACTOR,
            AuditAction::ToolStarted,
            format!("{tool} {}", self.summarize(&args.to_string())),
            if mutating { "queued" } else { "immediate" },
            correlation_id.as_str(),
        );

        let outcome = if mutating {
            self.lane.submit(work).await?
        } else {
            work.await
        };

        match outcome {
            Ok(value) => {
                let summary = serde_json::to_string(&value)
                    .map(|s| self.summarize(&s))
                    .unwrap_or_default();
                self.audit.record_correlated(
                    BRIDGE_ACTOR,
                    AuditAction::ToolSucceeded,
                    tool,
                    summary,
                    correlation_id.as_str(),
                );
                Ok(value)
            }
            Err(e) => {
                let message = e.to_string();
                self.audit.record_correlated(
                    BRIDGE_ACTOR,
                    AuditAction::ToolFailed,
                    tool,
                    self.summarize(&message),
                    correlation_id.as_str(),
                );
                warn!(tool = %tool, "Tool call failed: {message}");
                Err(BridgeError::ToolFailed {
                    tool: tool.to_string(),
                    message,
                })
            }
        }
    }

    /// Write a checkpoint marker before a risky change.
    ///
    /// The marker records the current `HEAD` of the workspace. When
    /// checkpoints are disabled or git is unavailable the result is
    /// `Skipped`; this never fails the caller.
    pub async fn git_checkpoint(&self, description: &str) -> CheckpointResult {
        let (status, head, reason) = if !self.config.checkpoints_enabled {
            (
                CheckpointStatus::Skipped,
                None,
                Some("checkpoints disabled".to_string()),
            )
        } else {
            match current_head(&self.root).await {
                Ok(head) => (CheckpointStatus::Created, Some(head), None),
                Err(reason) => (CheckpointStatus::Skipped, None, Some(reason)),
            }
        };

        let outcome = match (&status, &head, &reason) {
            (CheckpointStatus::Created, Some(h), _) => format!("created at {h}"),
            (_, _, Some(r)) => format!("skipped: {r}"),
            _ => "skipped".to_string(),
        };
        self.audit
            .record(BRIDGE_ACTOR, AuditAction::Checkpoint, description, outcome);
        debug!(description = %description, status = ?status, "Checkpoint");

        CheckpointResult {
            status,
            description: description.to_string(),
            head,
            reason,
            timestamp: Utc::now(),
        }
    }

    /// Whether `finding` needs a human decision before anything proceeds.
    pub fn require_human_approval(&self, finding: &SecurityFinding) -> ApprovalDecision {
        if self.config.escalation_severities.contains(&finding.severity) {
            ApprovalDecision::BlockedPendingApproval
        } else {
            ApprovalDecision::NotRequired
        }
    }

    /// Log and audit a finding, then reach an allow/block verdict.
    pub fn handle_security_finding(&self, finding: &SecurityFinding) -> FindingVerdict {
        let decision = self.require_human_approval(finding);
        let target = finding.target.as_deref().unwrap_or("-");
        warn!(
            severity = %finding.severity,
            target = %target,
            "Security finding: {}",
            finding.title
        );

        let (verdict, reason) = if decision.is_blocked() {
            (
                Verdict::Block,
                format!(
                    "{} finding '{}' requires human approval",
                    finding.severity, finding.title
                ),
            )
        } else {
            (
                Verdict::Allow,
                format!("{} finding below escalation threshold", finding.severity),
            )
        };
        self.audit.record(
            BRIDGE_ACTOR,
            AuditAction::SecurityFinding,
            format!("[{}] {} ({target})", finding.severity, finding.title),
            if decision.is_blocked() { "blocked" } else { "allowed" },
        );

        FindingVerdict {
            verdict,
            reason,
            decision,
        }
    }

    /// Reject `command` if any of its chained segments is destructive.
    ///
    /// Each segment is split into words, so flag spelling and spacing do not
    /// matter for the built-in rules. Configured patterns are then matched
    /// against the whitespace-collapsed segment text.
    pub fn check_command(&self, command: &str) -> BridgeResult<()> {
        let lowered = command.to_lowercase();
        let segments = command_segments(&lowered);
        let pattern = segments
            .iter()
            .find_map(|words| destructive_rule(words).map(str::to_string))
            .or_else(|| {
                let collapsed: Vec<String> = segments.iter().map(|w| w.join(" ")).collect();
                let whole = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
                self.config
                    .command_blacklist
                    .iter()
                    .find(|p| {
                        let p = p.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ");
                        !p.is_empty()
                            && (whole.contains(&p) || collapsed.iter().any(|s| s.contains(&p)))
                    })
                    .cloned()
            });

        if let Some(pattern) = pattern {
            self.audit.record(
                BRIDGE_ACTOR,
                AuditAction::CommandBlocked,
                self.summarize(command),
                format!("matches '{pattern}'"),
            );
            warn!(pattern = %pattern, "Blacklisted command rejected");
            return Err(BridgeError::CommandBlacklisted {
                command: command.to_string(),
                pattern,
            });
        }
        Ok(())
    }

    /// Execute worker-driven work according to its action kind.
    ///
    /// - `Read`: runs immediately.
    /// - `Delete`: every payload target is verified first; a protected or
    ///   missing target, or a payload naming none, is rejected before the
    ///   lane is entered. Verified deletes are checkpointed.
    /// - `Write`: checkpoint, run through the lane, then record whether the
    ///   payload target now exists.
    /// - `Execute`: checkpoint, reject blacklisted payload commands, run
    ///   through the lane.
    pub async fn safe_execute_tool<T, E, F>(
        &self,
        kind: ActionKind,
        tool: &str,
        payload: &serde_json::Value,
        work: F,
    ) -> BridgeResult<T>
    where
        F: Future<Output = Result<T, E>>,
        T: Serialize,
        E: Display,
    {
        let target = payload_str(payload, &["target", "path", "file"]);
        match kind {
            ActionKind::Read => self.wrap_tool_call(tool, payload, false, work).await,
            ActionKind::Delete => {
                let targets = payload_targets(payload);
                if targets.is_empty() {
                    warn!(tool = %tool, "Delete named no target");
                    self.audit.record(
                        BRIDGE_ACTOR,
                        AuditAction::IntegrityCheck,
                        format!("delete via {tool}"),
                        "unresolved",
                    );
                    return Err(BridgeError::TargetUnresolved(tool.to_string()));
                }
                for target in targets {
                    self.verify_action("delete", target).await.into_result()?;
                }
                self.git_checkpoint(&format!("before {tool}")).await;
                self.wrap_tool_call(tool, payload, true, work).await
            }
            ActionKind::Write => {
                self.git_checkpoint(&format!("before {tool}")).await;
                let out = self.wrap_tool_call(tool, payload, true, work).await?;
                if let Some(target) = target {
                    let check = self.verify_action("write", target).await;
                    if !check.is_verified() {
                        info!(tool = %tool, target = %target, "Write reported no file at target");
                    }
                }
                Ok(out)
            }
            ActionKind::Execute => {
                self.git_checkpoint(&format!("before {tool}")).await;
                if let Some(command) = payload_str(payload, &["command", "cmd"]) {
                    self.check_command(command)?;
                }
                self.wrap_tool_call(tool, payload, true, work).await
            }
        }
    }

    fn summarize(&self, s: &str) -> String {
        let max = self.config.summary_max_len;
        if s.chars().count() <= max {
            return s.to_string();
        }
        let mut out: String = s.chars().take(max).collect();
        out.push_str("...");
        out
    }
}

fn payload_str<'a>(payload: &'a serde_json::Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| payload.get(*k).and_then(|v| v.as_str()))
        .filter(|s| !s.trim().is_empty())
}

/// Every target a payload names, from string or array `target`, `path` and
/// `file` keys and their plurals.
fn payload_targets(payload: &serde_json::Value) -> Vec<&str> {
    let mut out = Vec::new();
    for key in ["target", "path", "file", "targets", "paths", "files"] {
        match payload.get(key) {
            Some(serde_json::Value::String(s)) => out.push(s.as_str()),
            Some(serde_json::Value::Array(items)) => {
                out.extend(items.iter().filter_map(|v| v.as_str()));
            }
            _ => {}
        }
    }
    out.retain(|s| !s.trim().is_empty());
    out
}

/// Split a shell command on `&&`, `||`, `|`, `;` and newlines, then each
/// segment into unquoted words.
fn command_segments(command: &str) -> Vec<Vec<&str>> {
    let mut segments = Vec::new();
    let mut rest = command;
    loop {
        let separators: &[&str] = &["&&", "||", "|", ";", "\n", "&"];
        let mut earliest_pos = rest.len();
        let mut earliest_len = 0;
        for sep in separators {
            if let Some(pos) = rest.find(sep) {
                if pos < earliest_pos {
                    earliest_pos = pos;
                    earliest_len = sep.len();
                }
            }
        }
        let words: Vec<&str> = rest[..earliest_pos]
            .split_whitespace()
            .map(|w| w.trim_matches(|c| c == '"' || c == '\''))
            .filter(|w| !w.is_empty())
            .collect();
        if !words.is_empty() {
            segments.push(words);
        }
        if earliest_pos + earliest_len >= rest.len() {
            break;
        }
        rest = &rest[earliest_pos + earliest_len..];
    }
    segments
}

/// Which built-in destructive rule a lowercased segment trips, if any.
fn destructive_rule(words: &[&str]) -> Option<&'static str> {
    let mut words = words;
    // Leading environment assignments, e.g. `LANG=C rm -rf x`.
    while let Some((first, rest)) = words.split_first() {
        if first.contains('=') && !first.starts_with('-') {
            words = rest;
        } else {
            break;
        }
    }
    let (&program, args) = words.split_first()?;
    let program = program.rsplit(['/', '\\']).next().unwrap_or(program);
    let has_short = |c: char| {
        args.iter()
            .any(|a| a.starts_with('-') && !a.starts_with("--") && a[1..].contains(c))
    };
    let has = |flag: &str| args.iter().any(|a| *a == flag);

    match program {
        "sudo" | "doas" => Some("sudo"),
        "rm" => {
            let recursive = has_short('r') || has("--recursive");
            let force = has_short('f') || has("--force");
            (recursive && force).then_some("rm -rf")
        }
        "git" => {
            let sub = args.iter().position(|a| !a.starts_with('-'))?;
            let rest = &args[sub + 1..];
            let short = |c: char| {
                rest.iter()
                    .any(|a| a.starts_with('-') && !a.starts_with("--") && a[1..].contains(c))
            };
            match args[sub] {
                "reset" if rest.contains(&"--hard") => Some("git reset --hard"),
                "clean" if (short('f') || rest.contains(&"--force")) && short('d') => {
                    Some("git clean -fd")
                }
                "push"
                    if short('f')
                        || rest
                            .iter()
                            .any(|a| a.starts_with("--force") || a.starts_with('+')) =>
                {
                    Some("git push --force")
                }
                _ => None,
            }
        }
        p if p == "mkfs" || p.starts_with("mkfs.") => Some("mkfs"),
        "dd" if args.iter().any(|a| a.starts_with("if=")) => Some("dd if="),
        "chmod" if (has_short('r') || has("--recursive")) && has("777") => Some("chmod -r 777"),
        "format" if args.first().is_some_and(|a| a.ends_with(':')) => Some("format c:"),
        "del" | "rd" | "rmdir" if has("/s") => Some("del /s"),
        _ => None,
    }
}

/// Lexically normalize a path: drop `.`, fold `..` into its parent.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

async fn current_head(root: &Path) -> Result<String, String> {
    let output = tokio::process::Command::new("git")
        .arg("-C")
        .arg(root)
        .args(["rev-parse", "HEAD"])
        .output()
        .await
        .map_err(|e| format!("git unavailable: {e}"))?;
    if !output.status.success() {
        return Err(format!(
            "not a git workspace: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
