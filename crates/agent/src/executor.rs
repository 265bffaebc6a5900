use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use shutterdesk_core::audit::{AuditContext, AuditEntry, AuditEntryId, AuditOutcome};
use shutterdesk_core::domain::decision::{Decision, ReasonCode};
use shutterdesk_core::domain::memory::{MemoryPatch, WorkingMemory};
use shutterdesk_core::domain::policy::Policy;
use shutterdesk_core::domain::proposal::{Proposal, ProposalId, ProposalStatus, RiskLevel};
use shutterdesk_core::domain::record::Mutation;
use shutterdesk_db::{AgentStores, RepositoryError};

use crate::memory::WorkingMemoryStore;
use crate::tools::{ActionPayload, Tool, ToolEffect, ToolEnv};

/// One tool invocation requested by the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCallRequest {
    pub fn new(call_id: impl Into<String>, tool_name: impl Into<String>, arguments: Value) -> Self {
        Self { call_id: call_id.into(), tool_name: tool_name.into(), arguments }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolCallResult {
    pub call_id: String,
    pub tool_name: String,
    pub outcome: ToolCallOutcome,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolCallOutcome {
    Executed { output: Value, audit_entry_id: AuditEntryId },
    Proposed { proposal_id: ProposalId, proposal_status: ProposalStatus, risk: RiskLevel },
    Failed { error: ToolCallError },
}

impl ToolCallOutcome {
    pub fn is_executed(&self) -> bool {
        matches!(self, Self::Executed { .. })
    }

    pub fn error(&self) -> Option<&ToolCallError> {
        match self {
            Self::Failed { error } => Some(error),
            _ => None,
        }
    }
}

/// Structured failure returned to the model in place of a tool result.
#[derive(Clone, Debug, Error, PartialEq, Serialize)]
#[serde(tag = "reason_code", rename_all = "snake_case")]
pub enum ToolCallError {
    #[error("unknown tool `{tool}`")]
    UnknownTool { tool: String },
    #[error("validation failed: {message}")]
    ValidationError { message: String },
    #[error("denied by policy: {}", decision.explanation())]
    PolicyDenied { decision: Decision },
    #[error("tool failed: {message}")]
    HandlerExecutionError { message: String },
    #[error("audit write failed: {message}")]
    AuditWriteFailure { message: String },
    #[error("turn allows at most {limit} tool calls")]
    CallLimitExceeded { limit: usize },
}

impl ToolCallError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::UnknownTool { .. } => "unknown_tool",
            Self::ValidationError { .. } => "validation_error",
            Self::PolicyDenied { .. } => "policy_denied",
            Self::HandlerExecutionError { .. } => "handler_execution_error",
            Self::AuditWriteFailure { .. } => "audit_write_failure",
            Self::CallLimitExceeded { .. } => "call_limit_exceeded",
        }
    }

    fn audit(error: RepositoryError) -> Self {
        Self::AuditWriteFailure { message: error.to_string() }
    }
}

/// Carries a decided action through to its audited effect. Shared by the
/// turn runtime and proposal approval so both paths commit identically.
#[derive(Clone)]
pub(crate) struct ActionExecutor {
    stores: AgentStores,
    memory: WorkingMemoryStore,
}

impl ActionExecutor {
    pub(crate) fn new(stores: AgentStores) -> Self {
        let memory = WorkingMemoryStore::new(stores.memory.clone());
        Self { stores, memory }
    }

    pub(crate) fn stores(&self) -> &AgentStores {
        &self.stores
    }

    pub(crate) fn memory(&self) -> &WorkingMemoryStore {
        &self.memory
    }

    pub(crate) async fn deny(
        &self,
        audit: &AuditContext,
        tool: &dyn Tool,
        payload: &ActionPayload,
        decision: Decision,
    ) -> ToolCallOutcome {
        let mut entry = AuditEntry::new(audit, tool.action_kind(), &decision, AuditOutcome::Denied)
            .with_tool(tool.name());
        if let Some(target) = &payload.target {
            entry = entry.with_target(target.clone());
        }
        if let Some(detail) = &decision.detail {
            entry = entry.with_error(detail.clone());
        }

        if let Err(error) = self.stores.audit.append(&entry).await {
            return self.audit_failed(audit, tool.name(), error);
        }
        tracing::info!(
            event_name = "agent.tool_call.denied",
            studio_id = %audit.studio_id,
            tool = tool.name(),
            reason_code = decision.reason.as_str(),
            audit_entry_id = %entry.id,
            "tool call denied by policy"
        );
        ToolCallOutcome::Failed { error: ToolCallError::PolicyDenied { decision } }
    }

    pub(crate) async fn propose(
        &self,
        audit: &AuditContext,
        policy: &Policy,
        tool: &dyn Tool,
        payload: &ActionPayload,
        decision: &Decision,
    ) -> ToolCallOutcome {
        let kind = tool.action_kind();
        let risk = RiskLevel::classify(payload.amount, policy.threshold_for(kind));
        let proposal = Proposal::pending(
            audit.studio_id.clone(),
            audit.actor.clone(),
            audit.session_id.clone(),
            tool.name(),
            kind,
            payload.arguments.clone(),
            risk,
            Utc::now(),
        );
        let entry = |outcome| {
            let entry = AuditEntry::new(audit, kind, decision, outcome).with_tool(tool.name());
            match &payload.target {
                Some(target) => entry.with_target(target.clone()),
                None => entry,
            }
        };

        let proposed = entry(AuditOutcome::Proposed).with_proposal(proposal.id.clone());
        match self.stores.proposals.submit(&proposal, &proposed).await {
            Ok(()) => {}
            Err(error @ RepositoryError::AuditWrite(_)) => {
                return self.audit_failed(audit, tool.name(), error);
            }
            Err(error) => {
                let message = error.to_string();
                let failed = entry(AuditOutcome::Failed).with_error(message.clone());
                return self.failed(audit, tool.name(), failed, message).await;
            }
        }
        tracing::info!(
            event_name = "agent.proposal.created",
            studio_id = %audit.studio_id,
            tool = tool.name(),
            proposal_id = %proposal.id,
            risk = risk.as_str(),
            "write deferred for human approval"
        );
        ToolCallOutcome::Proposed {
            proposal_id: proposal.id,
            proposal_status: proposal.status,
            risk,
        }
    }

    /// Runs an allowed action. Writes are committed together with their audit
    /// entry; memory is merged only when a session is known.
    pub(crate) async fn run(&self, call: AllowedCall<'_>) -> ToolCallOutcome {
        let env = ToolEnv {
            studio_id: call.audit.studio_id.clone(),
            records: self.stores.records.clone(),
        };
        let effect = match call.tool.execute(call.payload, &env).await {
            Ok(effect) => effect,
            Err(error) => return self.fail(&call, error.to_string()).await,
        };

        match effect {
            ToolEffect::Read { output, memory: Some(patch) } if call.audit.session_id.is_some() => {
                let entry = call.entry(AuditOutcome::Read);
                match self.merge_memory(&call, patch, entry).await {
                    Ok((_, entry)) => self.executed(&call, entry, output),
                    Err(outcome) => outcome,
                }
            }
            ToolEffect::Read { output, .. } => {
                let entry = call.entry(AuditOutcome::Read);
                self.record(&call, entry, output).await
            }
            ToolEffect::Remember { patch } => {
                let entry = call.entry(AuditOutcome::Executed);
                match self.merge_memory(&call, patch, entry).await {
                    Ok((memory, entry)) => {
                        let output = serde_json::to_value(&memory).unwrap_or(Value::Null);
                        self.executed(&call, entry, output)
                    }
                    Err(outcome) => outcome,
                }
            }
            ToolEffect::Write { mutation } => self.commit(&call, mutation).await,
        }
    }

    async fn commit(&self, call: &AllowedCall<'_>, mutation: Mutation) -> ToolCallOutcome {
        let records = self.stores.records.clone();
        let studio_id = call.audit.studio_id.clone();
        let entry = call.entry(AuditOutcome::Executed);
        // The commit runs to completion even if the turn future is dropped.
        let task =
            tokio::spawn(async move { records.apply_audited(&studio_id, &mutation, entry).await });

        match task.await {
            Ok(Ok((applied, entry))) => {
                tracing::info!(
                    event_name = "agent.tool_call.executed",
                    studio_id = %call.audit.studio_id,
                    tool = call.tool.name(),
                    target_id = %applied.after.id,
                    audit_entry_id = %entry.id,
                    "write committed"
                );
                ToolCallOutcome::Executed {
                    output: applied.after.snapshot(),
                    audit_entry_id: entry.id,
                }
            }
            Ok(Err(error)) => self.rejected(call, error).await,
            Err(join_error) => self.fail(call, join_error.to_string()).await,
        }
    }

    /// Merges working memory together with the call's audit entry on a task
    /// that outlives the turn.
    async fn merge_memory(
        &self,
        call: &AllowedCall<'_>,
        patch: MemoryPatch,
        entry: AuditEntry,
    ) -> Result<(WorkingMemory, AuditEntry), ToolCallOutcome> {
        let Some(session_id) = call.audit.session_id.clone() else {
            return Err(self.fail(call, "no conversation session to remember into".into()).await);
        };
        let memory = self.memory.clone();
        let studio_id = call.audit.studio_id.clone();
        let task = tokio::spawn(async move {
            memory.update_audited(&studio_id, &session_id, &patch, entry).await
        });

        match task.await {
            Ok(Ok(merged)) => Ok(merged),
            Ok(Err(error)) => Err(self.rejected(call, error).await),
            Err(join_error) => Err(self.fail(call, join_error.to_string()).await),
        }
    }

    async fn record(
        &self,
        call: &AllowedCall<'_>,
        entry: AuditEntry,
        output: Value,
    ) -> ToolCallOutcome {
        if let Err(error) = self.stores.audit.append(&entry).await {
            return self.audit_failed(call.audit, call.tool.name(), error);
        }
        self.executed(call, entry, output)
    }

    fn executed(&self, call: &AllowedCall<'_>, entry: AuditEntry, output: Value) -> ToolCallOutcome {
        tracing::info!(
            event_name = "agent.tool_call.executed",
            studio_id = %call.audit.studio_id,
            tool = call.tool.name(),
            outcome = entry.outcome.as_str(),
            audit_entry_id = %entry.id,
            "tool call executed"
        );
        ToolCallOutcome::Executed { output, audit_entry_id: entry.id }
    }

    /// A store error from an audited unit of work. Only a failed audit insert
    /// is an audit failure; anything else is the action failing, recorded as
    /// such.
    async fn rejected(&self, call: &AllowedCall<'_>, error: RepositoryError) -> ToolCallOutcome {
        match error {
            error @ RepositoryError::AuditWrite(_) => {
                self.audit_failed(call.audit, call.tool.name(), error)
            }
            other => self.fail(call, other.to_string()).await,
        }
    }

    fn audit_failed(&self, audit: &AuditContext, tool: &str, error: RepositoryError) -> ToolCallOutcome {
        tracing::error!(
            event_name = "agent.audit.write_failed",
            studio_id = %audit.studio_id,
            tool,
            error = %error,
            "audited unit of work rolled back"
        );
        ToolCallOutcome::Failed { error: ToolCallError::audit(error) }
    }

    async fn fail(&self, call: &AllowedCall<'_>, message: String) -> ToolCallOutcome {
        let entry = call.entry(AuditOutcome::Failed).with_error(message.clone());
        self.failed(call.audit, call.tool.name(), entry, message).await
    }

    async fn failed(
        &self,
        audit: &AuditContext,
        tool: &str,
        entry: AuditEntry,
        message: String,
    ) -> ToolCallOutcome {
        if let Err(error) = self.stores.audit.append(&entry).await {
            return self.audit_failed(audit, tool, error);
        }
        tracing::warn!(
            event_name = "agent.tool_call.failed",
            studio_id = %audit.studio_id,
            tool,
            error = %message,
            "tool call failed"
        );
        ToolCallOutcome::Failed { error: ToolCallError::HandlerExecutionError { message } }
    }
}

/// An action the guardrails allowed, with everything its audit entry needs.
pub(crate) struct AllowedCall<'a> {
    pub audit: &'a AuditContext,
    pub tool: Arc<dyn Tool>,
    pub payload: &'a ActionPayload,
    pub decision: &'a Decision,
    pub proposal_id: Option<&'a ProposalId>,
}

impl AllowedCall<'_> {
    fn entry(&self, outcome: AuditOutcome) -> AuditEntry {
        let mut entry = AuditEntry::new(self.audit, self.tool.action_kind(), self.decision, outcome)
            .with_tool(self.tool.name());
        if let Some(target) = &self.payload.target {
            entry = entry.with_target(target.clone());
        }
        if let Some(id) = self.proposal_id {
            entry = entry.with_proposal(id.clone());
        }
        entry
    }
}

/// Decision attached to the entry written when an approved proposal executes.
pub(crate) fn approved_decision() -> Decision {
    Decision::allow(ReasonCode::ProposalApproved)
}
