use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Deny,
    Propose,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::Propose => "propose",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "allow" => Some(Self::Allow),
            "deny" => Some(Self::Deny),
            "propose" => Some(Self::Propose),
            _ => None,
        }
    }
}

/// Stable, machine-branchable reason attached to every decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    NotAuthorized,
    RestrictedField,
    DomainNotAllowed,
    NonMutating,
    UnderAutoApproveThreshold,
    FullWrite,
    RequiresApproval,
    PolicyDefaultDeny,
    ProposalRejected,
    ProposalApproved,
}

impl ReasonCode {
    pub const ALL: [ReasonCode; 10] = [
        Self::NotAuthorized,
        Self::RestrictedField,
        Self::DomainNotAllowed,
        Self::NonMutating,
        Self::UnderAutoApproveThreshold,
        Self::FullWrite,
        Self::RequiresApproval,
        Self::PolicyDefaultDeny,
        Self::ProposalRejected,
        Self::ProposalApproved,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotAuthorized => "not_authorized",
            Self::RestrictedField => "restricted_field",
            Self::DomainNotAllowed => "domain_not_allowed",
            Self::NonMutating => "non_mutating",
            Self::UnderAutoApproveThreshold => "under_auto_approve_threshold",
            Self::FullWrite => "full_write",
            Self::RequiresApproval => "requires_approval",
            Self::PolicyDefaultDeny => "policy_default_deny",
            Self::ProposalRejected => "proposal_rejected",
            Self::ProposalApproved => "proposal_approved",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|code| code.as_str() == normalized)
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub verdict: Verdict,
    pub reason: ReasonCode,
    /// Offending field, domain, or threshold, when the rule has one.
    pub detail: Option<String>,
}

impl Decision {
    pub fn allow(reason: ReasonCode) -> Self {
        Self { verdict: Verdict::Allow, reason, detail: None }
    }

    pub fn deny(reason: ReasonCode) -> Self {
        Self { verdict: Verdict::Deny, reason, detail: None }
    }

    pub fn propose(reason: ReasonCode) -> Self {
        Self { verdict: Verdict::Propose, reason, detail: None }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn is_allow(&self) -> bool {
        self.verdict == Verdict::Allow
    }

    pub fn explanation(&self) -> String {
        let base = match self.reason {
            ReasonCode::NotAuthorized => "the acting user is not granted this action",
            ReasonCode::RestrictedField => "the request sets a field that agents may not modify",
            ReasonCode::DomainNotAllowed => "the email domain is not permitted for this studio",
            ReasonCode::NonMutating => "the action does not modify studio records",
            ReasonCode::UnderAutoApproveThreshold => "the amount is under the auto-approve limit",
            ReasonCode::FullWrite => "the studio allows direct agent writes",
            ReasonCode::RequiresApproval => "a studio member must approve this change",
            ReasonCode::PolicyDefaultDeny => "the studio policy does not permit this action",
            ReasonCode::ProposalRejected => "a reviewer rejected the proposed change",
            ReasonCode::ProposalApproved => "a reviewer approved the proposed change",
        };
        match &self.detail {
            Some(detail) => format!("{base} ({detail})"),
            None => base.to_string(),
        }
    }
}
