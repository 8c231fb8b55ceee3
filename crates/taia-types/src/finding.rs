//! Security findings and the escalation verdicts produced for them.

use serde::{Deserialize, Serialize};

/// Severity of a security finding, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
    Blocker,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Info => "INFO",
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
            Severity::Blocker => "BLOCKER",
        };
        f.write_str(s)
    }
}

/// Something the bridge or a caller flagged as risky.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityFinding {
    pub severity: Severity,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Path, command or skill the finding is about.
    #[serde(default)]
    pub target: Option<String>,
}

impl SecurityFinding {
    pub fn new(severity: Severity, title: impl Into<String>) -> Self {
        Self {
            severity,
            title: title.into(),
            description: String::new(),
            target: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

/// Result of the synchronous escalation check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    /// Severity is below the escalation set.
    NotRequired,
    /// Must not be treated as resolved until a human decides.
    BlockedPendingApproval,
}

impl ApprovalDecision {
    pub fn is_blocked(&self) -> bool {
        matches!(self, ApprovalDecision::BlockedPendingApproval)
    }
}

/// Allow/block verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Allow,
    Block,
}

/// Verdict plus the reason it was reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindingVerdict {
    pub verdict: Verdict,
    pub reason: String,
    pub decision: ApprovalDecision,
}

impl FindingVerdict {
    pub fn is_allowed(&self) -> bool {
        self.verdict == Verdict::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Blocker > Severity::Critical);
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Info < Severity::Low);
    }

    #[test]
    fn test_severity_serde() {
        let s: Severity = serde_json::from_str("\"critical\"").unwrap();
        assert_eq!(s, Severity::Critical);
        assert_eq!(s.to_string(), "CRITICAL");
    }
}
