//! Append-only audit chain for federation events.
//!
//! Each entry carries the SHA-256 of its own fields concatenated with the hash
//! of the previous entry, so rewriting any recorded entry breaks every hash
//! after it. The chain can be mirrored to a JSON-lines file; a log opened on
//! an existing file resumes the chain where it left off.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

const GENESIS: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Categories of auditable federation events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    AgentRegistered,
    SkillRegistered,
    SkillGranted,
    SkillRevoked,
    PermissionDenied,
    TaskDelegated,
    TaskResponded,
    TaskCancelled,
    TaskRecovered,
    ReviewSubmitted,
    ToolStarted,
    ToolSucceeded,
    ToolFailed,
    IntegrityCheck,
    Checkpoint,
    CommandBlocked,
    SecurityFinding,
    ApprovalRequested,
    ApprovalResolved,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A single entry in the audit chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Monotonically increasing sequence number (0-indexed).
    pub seq: u64,
    /// RFC 3339 timestamp of when this entry was recorded.
    pub timestamp: String,
    /// The agent (or component) that triggered the event.
    pub agent_id: String,
    pub action: AuditAction,
    /// Free-form detail (skill, task id, path, command).
    pub detail: String,
    /// Outcome such as `ok`, `denied`, `blocked`, or an error summary.
    pub outcome: String,
    /// Opaque id linking entries that belong to one operation.
    #[serde(default)]
    pub correlation_id: String,
    /// Hash of the previous entry (all zeros for the first one).
    pub prev_hash: String,
    /// Hash of this entry's fields concatenated with `prev_hash`.
    pub hash: String,
}

#[allow(clippy::too_many_arguments)]
fn compute_entry_hash(
    seq: u64,
    timestamp: &str,
    agent_id: &str,
    action: &AuditAction,
    detail: &str,
    outcome: &str,
    correlation_id: &str,
    prev_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seq.to_string().as_bytes());
    hasher.update(timestamp.as_bytes());
    hasher.update(agent_id.as_bytes());
    hasher.update(action.to_string().as_bytes());
    hasher.update(detail.as_bytes());
    hasher.update(outcome.as_bytes());
    hasher.update(correlation_id.as_bytes());
    hasher.update(prev_hash.as_bytes());
    hex::encode(hasher.finalize())
}

struct Chain {
    entries: Vec<AuditEntry>,
    tip: String,
}

/// Tamper-evident, append-only audit log.
///
/// Recording never fails: a mirror file that cannot be written is reported
/// through `warn!` and the in-memory chain still advances.
pub struct AuditLog {
    chain: Mutex<Chain>,
    sink: Option<PathBuf>,
}

impl AuditLog {
    /// An empty, memory-only log.
    pub fn new() -> Self {
        Self {
            chain: Mutex::new(Chain {
                entries: Vec::new(),
                tip: GENESIS.to_string(),
            }),
            sink: None,
        }
    }

    /// A log mirrored to `path` as JSON lines.
    ///
    /// Entries already in the file are loaded and the chain continues from
    /// the last one. Lines that do not parse are skipped with a warning;
    /// [`AuditLog::verify_integrity`] will then report the gap.
    pub fn with_sink(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut entries = Vec::new();
        match std::fs::File::open(&path) {
            Ok(file) => {
                for (lineno, line) in std::io::BufReader::new(file).lines().enumerate() {
                    let Ok(line) = line else { break };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<AuditEntry>(&line) {
                        Ok(entry) => entries.push(entry),
                        Err(e) => warn!(
                            path = %path.display(),
                            line = lineno + 1,
                            "Skipping unreadable audit entry: {e}"
                        ),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), "Cannot read audit log: {e}"),
        }
        let tip = entries
            .last()
            .map(|e| e.hash.clone())
            .unwrap_or_else(|| GENESIS.to_string());
        Self {
            chain: Mutex::new(Chain { entries, tip }),
            sink: Some(path),
        }
    }

    /// The mirror file, if any.
    pub fn sink_path(&self) -> Option<&Path> {
        self.sink.as_deref()
    }

    /// Records an event and returns the hash of the new entry.
    pub fn record(
        &self,
        agent_id: impl Into<String>,
        action: AuditAction,
        detail: impl Into<String>,
        outcome: impl Into<String>,
    ) -> String {
        self.record_correlated(agent_id, action, detail, outcome, String::new())
    }

    /// Records an event tied to an operation's correlation id.
    pub fn record_correlated(
        &self,
        agent_id: impl Into<String>,
        action: AuditAction,
        detail: impl Into<String>,
        outcome: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> String {
        let agent_id = agent_id.into();
        let detail = detail.into();
        let outcome = outcome.into();
        let correlation_id = correlation_id.into();
        let timestamp = Utc::now().to_rfc3339();

        let mut chain = self.chain.lock().unwrap_or_else(|e| e.into_inner());
        let seq = chain.entries.len() as u64;
        let prev_hash = chain.tip.clone();
        let hash = compute_entry_hash(
            seq,
            &timestamp,
            &agent_id,
            &action,
            &detail,
            &outcome,
            &correlation_id,
            &prev_hash,
        );
        let entry = AuditEntry {
            seq,
            timestamp,
            agent_id,
            action,
            detail,
            outcome,
            correlation_id,
            prev_hash,
            hash: hash.clone(),
        };
        if let Some(path) = &self.sink {
            append_line(path, &entry);
        }
        chain.entries.push(entry);
        chain.tip = hash.clone();
        hash
    }

    /// Walks the chain and recomputes every hash.
    ///
    /// Returns `Err` describing the first inconsistency found.
    pub fn verify_integrity(&self) -> Result<(), String> {
        let chain = self.chain.lock().unwrap_or_else(|e| e.into_inner());
        let mut expected_prev = GENESIS.to_string();

        for (idx, entry) in chain.entries.iter().enumerate() {
            if entry.seq != idx as u64 {
                return Err(format!(
                    "sequence gap at position {idx}: found seq {}",
                    entry.seq
                ));
            }
            if entry.prev_hash != expected_prev {
                return Err(format!(
                    "chain break at seq {}: expected prev_hash {} but found {}",
                    entry.seq, expected_prev, entry.prev_hash
                ));
            }
            let recomputed = compute_entry_hash(
                entry.seq,
                &entry.timestamp,
                &entry.agent_id,
                &entry.action,
                &entry.detail,
                &entry.outcome,
                &entry.correlation_id,
                &entry.prev_hash,
            );
            if recomputed != entry.hash {
                return Err(format!(
                    "hash mismatch at seq {}: expected {} but found {}",
                    entry.seq, recomputed, entry.hash
                ));
            }
            expected_prev = entry.hash.clone();
        }
        Ok(())
    }

    /// Hash of the most recent entry, or the genesis sentinel.
    pub fn tip_hash(&self) -> String {
        self.chain
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .tip
            .clone()
    }

    pub fn len(&self) -> usize {
        self.chain
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Up to the `n` most recent entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<AuditEntry> {
        let chain = self.chain.lock().unwrap_or_else(|e| e.into_inner());
        let start = chain.entries.len().saturating_sub(n);
        chain.entries[start..].to_vec()
    }

    /// Entries sharing one correlation id, in chain order.
    pub fn correlated(&self, correlation_id: &str) -> Vec<AuditEntry> {
        let chain = self.chain.lock().unwrap_or_else(|e| e.into_inner());
        chain
            .entries
            .iter()
            .filter(|e| e.correlation_id == correlation_id)
            .cloned()
            .collect()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

fn append_line(path: &Path, entry: &AuditEntry) {
    let line = match serde_json::to_string(entry) {
        Ok(line) => line,
        Err(e) => {
            warn!("Cannot encode audit entry {}: {e}", entry.seq);
            return;
        }
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| writeln!(f, "{line}"));
    if let Err(e) = result {
        warn!(path = %path.display(), "Audit mirror write failed: {e}");
    }
}
