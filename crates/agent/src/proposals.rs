use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use shutterdesk_core::audit::{AuditContext, AuditEntry, AuditOutcome};
use shutterdesk_core::domain::decision::{Decision, ReasonCode, Verdict};
use shutterdesk_core::domain::proposal::{Proposal, ProposalId, ProposalStatus};
use shutterdesk_core::domain::tenant::{StudioId, UserId};
use shutterdesk_core::errors::DomainError;
use shutterdesk_db::{AgentStores, RepositoryError};

use crate::context::PolicyProvider;
use crate::executor::{approved_decision, ActionExecutor, AllowedCall, ToolCallOutcome};
use crate::guardrails;
use crate::tools::{ToolRegistry, ValidationError};

#[derive(Debug, Error)]
pub enum ProposalError {
    #[error("proposal `{0}` was not found")]
    NotFound(ProposalId),
    #[error(transparent)]
    InvalidTransition(DomainError),
    #[error("tool `{0}` is no longer registered")]
    ToolRetired(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("approval blocked: {}", .0.explanation())]
    ApprovalBlocked(Decision),
    #[error(transparent)]
    AuditWrite(RepositoryError),
    #[error(transparent)]
    Repository(RepositoryError),
}

impl ProposalError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "proposal_not_found",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::ToolRetired(_) => "tool_retired",
            Self::Validation(_) => "validation_error",
            Self::ApprovalBlocked(_) => "approval_blocked",
            Self::AuditWrite(_) => "audit_write_failure",
            Self::Repository(_) => "store_error",
        }
    }
}

impl From<RepositoryError> for ProposalError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::Domain(domain @ DomainError::InvalidProposalTransition { .. }) => {
                Self::InvalidTransition(domain)
            }
            error @ RepositoryError::AuditWrite(_) => Self::AuditWrite(error),
            other => Self::Repository(other),
        }
    }
}

/// An approved proposal and what happened when its action ran.
#[derive(Clone, Debug, Serialize)]
pub struct Approval {
    pub proposal: Proposal,
    pub execution: ToolCallOutcome,
}

/// Human review of deferred writes.
pub struct ProposalWorkflow {
    registry: Arc<ToolRegistry>,
    policies: Arc<dyn PolicyProvider>,
    executor: ActionExecutor,
}

impl ProposalWorkflow {
    pub fn new(
        registry: Arc<ToolRegistry>,
        policies: Arc<dyn PolicyProvider>,
        stores: AgentStores,
    ) -> Self {
        Self { registry, policies, executor: ActionExecutor::new(stores) }
    }

    pub async fn list(
        &self,
        studio_id: &StudioId,
        status: Option<ProposalStatus>,
        limit: u32,
    ) -> Result<Vec<Proposal>, ProposalError> {
        Ok(self.executor.stores().proposals.list(studio_id, status, limit).await?)
    }

    pub async fn get(&self, studio_id: &StudioId, id: &ProposalId) -> Result<Proposal, ProposalError> {
        self.executor
            .stores()
            .proposals
            .find(studio_id, id)
            .await?
            .ok_or_else(|| ProposalError::NotFound(id.clone()))
    }

    /// Re-checks the stored action against the current registry and the
    /// proposer's current policy, marks the proposal approved, then runs it.
    /// Any check failure leaves the proposal pending.
    pub async fn approve(
        &self,
        studio_id: &StudioId,
        id: &ProposalId,
        reviewer: &UserId,
    ) -> Result<Approval, ProposalError> {
        let proposal = self.pending(studio_id, id, ProposalStatus::Approved).await?;

        let tool = self
            .registry
            .resolve(&proposal.tool_name)
            .map_err(|_| ProposalError::ToolRetired(proposal.tool_name.clone()))?;
        let payload = tool.validate(&proposal.payload)?;

        let policy = self.policies.policy_for(studio_id, &proposal.proposed_by);
        let decision = guardrails::decide(&policy, tool.action_kind(), &payload);
        let audit = AuditContext::new(
            studio_id.clone(),
            reviewer.clone(),
            proposal.session_id.clone(),
        );

        if decision.verdict == Verdict::Deny {
            let mut entry =
                AuditEntry::new(&audit, proposal.action_kind, &decision, AuditOutcome::Denied)
                    .with_tool(proposal.tool_name.clone())
                    .with_proposal(proposal.id.clone());
            if let Some(detail) = &decision.detail {
                entry = entry.with_error(detail.clone());
            }
            self.executor.stores().audit.append(&entry).await?;
            tracing::warn!(
                event_name = "agent.proposal.blocked",
                studio_id = %studio_id,
                proposal_id = %proposal.id,
                reason_code = decision.reason.as_str(),
                "approval blocked by current policy"
            );
            return Err(ProposalError::ApprovalBlocked(decision));
        }

        let decision = approved_decision();
        let entry = AuditEntry::new(&audit, proposal.action_kind, &decision, AuditOutcome::Approved)
            .with_tool(proposal.tool_name.clone())
            .with_proposal(proposal.id.clone());
        let approved = self
            .executor
            .stores()
            .proposals
            .resolve(studio_id, id, ProposalStatus::Approved, reviewer, &entry)
            .await?;
        tracing::info!(
            event_name = "agent.proposal.approved",
            studio_id = %studio_id,
            proposal_id = %approved.id,
            reviewer = %reviewer,
            "proposal approved"
        );

        let execution = self
            .executor
            .run(AllowedCall {
                audit: &audit,
                tool,
                payload: &payload,
                decision: &decision,
                proposal_id: Some(&approved.id),
            })
            .await;
        Ok(Approval { proposal: approved, execution })
    }

    pub async fn reject(
        &self,
        studio_id: &StudioId,
        id: &ProposalId,
        reviewer: &UserId,
    ) -> Result<Proposal, ProposalError> {
        let proposal = self.pending(studio_id, id, ProposalStatus::Rejected).await?;
        let audit = AuditContext::new(
            studio_id.clone(),
            reviewer.clone(),
            proposal.session_id.clone(),
        );
        let decision = Decision::deny(ReasonCode::ProposalRejected);
        let entry = AuditEntry::new(&audit, proposal.action_kind, &decision, AuditOutcome::Rejected)
            .with_tool(proposal.tool_name.clone())
            .with_proposal(proposal.id.clone());

        let rejected = self
            .executor
            .stores()
            .proposals
            .resolve(studio_id, id, ProposalStatus::Rejected, reviewer, &entry)
            .await?;
        tracing::info!(
            event_name = "agent.proposal.rejected",
            studio_id = %studio_id,
            proposal_id = %rejected.id,
            reviewer = %reviewer,
            "proposal rejected"
        );
        Ok(rejected)
    }

    async fn pending(
        &self,
        studio_id: &StudioId,
        id: &ProposalId,
        next: ProposalStatus,
    ) -> Result<Proposal, ProposalError> {
        let proposal = self.get(studio_id, id).await?;
        if !proposal.status.can_transition_to(next) {
            return Err(ProposalError::InvalidTransition(DomainError::InvalidProposalTransition {
                from: proposal.status,
                to: next,
            }));
        }
        Ok(proposal)
    }
}
