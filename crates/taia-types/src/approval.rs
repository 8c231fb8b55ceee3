//! Human-in-the-loop approval records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApprovalId(pub Uuid);

impl ApprovalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ApprovalId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ApprovalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ApprovalId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Approval decision state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    WaitingForApproval,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::WaitingForApproval => "WAITING_FOR_APPROVAL",
            ApprovalStatus::Approved => "APPROVED",
            ApprovalStatus::Rejected => "REJECTED",
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, ApprovalStatus::WaitingForApproval)
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "WAITING_FOR_APPROVAL" | "WAITING" => Ok(ApprovalStatus::WaitingForApproval),
            "APPROVED" => Ok(ApprovalStatus::Approved),
            "REJECTED" => Ok(ApprovalStatus::Rejected),
            other => Err(format!("unknown approval status '{other}'")),
        }
    }
}

/// A decision record created when a critical action needs human sign-off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    pub id: ApprovalId,
    /// Short label of what is being approved (e.g. `orchestration`).
    pub kind: String,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    /// Who decided.
    pub actor: Option<String>,
    pub note: Option<String>,
    /// What is being approved.
    pub payload: serde_json::Value,
}

impl Approval {
    /// A fresh approval awaiting a decision.
    pub fn waiting(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: ApprovalId::new(),
            kind: kind.into(),
            status: ApprovalStatus::WaitingForApproval,
            created_at: Utc::now(),
            decided_at: None,
            actor: None,
            note: None,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_waiting_approval() {
        let approval = Approval::waiting("orchestration", serde_json::json!({"tasks": 2}));
        assert_eq!(approval.status, ApprovalStatus::WaitingForApproval);
        assert!(!approval.status.is_resolved());
        assert!(approval.decided_at.is_none());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(
            "approved".parse::<ApprovalStatus>().unwrap(),
            ApprovalStatus::Approved
        );
        assert_eq!(
            "waiting".parse::<ApprovalStatus>().unwrap(),
            ApprovalStatus::WaitingForApproval
        );
        assert!("maybe".parse::<ApprovalStatus>().is_err());
    }
}
