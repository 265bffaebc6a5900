use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::policy::ActionKind;
use crate::domain::tenant::{SessionId, StudioId, UserId};
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProposalId(pub String);

impl ProposalId {
    pub fn generate() -> Self {
        Self(format!("prop_{}", Uuid::new_v4().simple()))
    }
}

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn can_transition_to(&self, next: ProposalStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Approved) | (Self::Pending, Self::Rejected)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }

    /// Monetary actions are medium risk, high when there is no configured
    /// threshold or the amount is ten times over it. Other writes are low.
    pub fn classify(amount: Option<Decimal>, threshold: Option<Decimal>) -> Self {
        let Some(amount) = amount else {
            return Self::Low;
        };
        match threshold {
            Some(threshold) if amount < threshold * Decimal::TEN => Self::Medium,
            _ => Self::High,
        }
    }
}

/// A deferred write awaiting a human decision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: ProposalId,
    pub studio_id: StudioId,
    pub proposed_by: UserId,
    pub session_id: Option<SessionId>,
    pub tool_name: String,
    pub action_kind: ActionKind,
    /// Validated tool arguments, replayed through the tool on approval.
    pub payload: Value,
    pub risk: RiskLevel,
    pub status: ProposalStatus,
    pub resolved_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Proposal {
    #[allow(clippy::too_many_arguments)]
    pub fn pending(
        studio_id: StudioId,
        proposed_by: UserId,
        session_id: Option<SessionId>,
        tool_name: impl Into<String>,
        action_kind: ActionKind,
        payload: Value,
        risk: RiskLevel,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ProposalId::generate(),
            studio_id,
            proposed_by,
            session_id,
            tool_name: tool_name.into(),
            action_kind,
            payload,
            risk,
            status: ProposalStatus::Pending,
            resolved_by: None,
            created_at: now,
            updated_at: now,
            resolved_at: None,
        }
    }

    pub fn resolve(
        &mut self,
        next: ProposalStatus,
        reviewer: UserId,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::InvalidProposalTransition { from: self.status, to: next });
        }
        self.status = next;
        self.resolved_by = Some(reviewer);
        self.resolved_at = Some(now);
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;
    use serde_json::json;

    use super::{Proposal, ProposalStatus, RiskLevel};
    use crate::domain::policy::ActionKind;
    use crate::domain::tenant::{StudioId, UserId};
    use crate::errors::DomainError;

    fn proposal() -> Proposal {
        Proposal::pending(
            StudioId("studio-a".to_string()),
            UserId("user-1".to_string()),
            None,
            "create_lead",
            ActionKind::CreateLead,
            json!({"name": "Ana"}),
            RiskLevel::Low,
            Utc::now(),
        )
    }

    #[test]
    fn pending_resolves_once() {
        let mut proposal = proposal();
        proposal
            .resolve(ProposalStatus::Approved, UserId("owner".to_string()), Utc::now())
            .expect("pending -> approved");
        assert_eq!(proposal.status, ProposalStatus::Approved);
        assert!(proposal.resolved_at.is_some());

        let error = proposal
            .resolve(ProposalStatus::Rejected, UserId("owner".to_string()), Utc::now())
            .expect_err("approved is terminal");
        assert_eq!(
            error,
            DomainError::InvalidProposalTransition {
                from: ProposalStatus::Approved,
                to: ProposalStatus::Rejected
            }
        );
        assert_eq!(proposal.status, ProposalStatus::Approved);
    }

    #[test]
    fn pending_to_pending_is_not_a_transition() {
        let mut proposal = proposal();
        assert!(proposal
            .resolve(ProposalStatus::Pending, UserId("owner".to_string()), Utc::now())
            .is_err());
        assert_eq!(proposal.status, ProposalStatus::Pending);
        assert!(proposal.resolved_by.is_none());
    }

    #[test]
    fn risk_scales_with_amount_over_threshold() {
        assert_eq!(RiskLevel::classify(None, None), RiskLevel::Low);
        assert_eq!(
            RiskLevel::classify(Some(Decimal::new(500, 0)), Some(Decimal::new(100, 0))),
            RiskLevel::Medium
        );
        assert_eq!(
            RiskLevel::classify(Some(Decimal::new(1000, 0)), Some(Decimal::new(100, 0))),
            RiskLevel::High
        );
        assert_eq!(RiskLevel::classify(Some(Decimal::ONE), None), RiskLevel::High);
    }
}
