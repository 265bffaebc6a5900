use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::decision::{Decision, ReasonCode, Verdict};
use crate::domain::memory::WorkingMemory;
use crate::domain::policy::ActionKind;
use crate::domain::proposal::ProposalId;
use crate::domain::record::{AppliedMutation, RecordId};
use crate::domain::tenant::{SessionId, StudioId, UserId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuditEntryId(pub String);

impl fmt::Display for AuditEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Executed,
    Read,
    Denied,
    Proposed,
    Failed,
    Approved,
    Rejected,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Executed => "executed",
            Self::Read => "read",
            Self::Denied => "denied",
            Self::Proposed => "proposed",
            Self::Failed => "failed",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "executed" => Some(Self::Executed),
            "read" => Some(Self::Read),
            "denied" => Some(Self::Denied),
            "proposed" => Some(Self::Proposed),
            "failed" => Some(Self::Failed),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// Who acted, for whom, in which conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditContext {
    pub studio_id: StudioId,
    pub actor: UserId,
    pub session_id: Option<SessionId>,
}

impl AuditContext {
    pub fn new(studio_id: StudioId, actor: UserId, session_id: Option<SessionId>) -> Self {
        Self { studio_id, actor, session_id }
    }
}

/// Immutable record of one attempted or executed agent action.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: AuditEntryId,
    pub studio_id: StudioId,
    pub actor: UserId,
    pub session_id: Option<SessionId>,
    pub tool_name: Option<String>,
    pub action_kind: ActionKind,
    pub decision: Verdict,
    pub reason_code: ReasonCode,
    pub outcome: AuditOutcome,
    pub target_id: Option<RecordId>,
    pub proposal_id: Option<ProposalId>,
    pub before_state: Option<Value>,
    pub after_state: Option<Value>,
    pub error: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        context: &AuditContext,
        action_kind: ActionKind,
        decision: &Decision,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            id: AuditEntryId(Uuid::new_v4().to_string()),
            studio_id: context.studio_id.clone(),
            actor: context.actor.clone(),
            session_id: context.session_id.clone(),
            tool_name: None,
            action_kind,
            decision: decision.verdict,
            reason_code: decision.reason,
            outcome,
            target_id: None,
            proposal_id: None,
            before_state: None,
            after_state: None,
            error: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    pub fn with_target(mut self, target_id: RecordId) -> Self {
        self.target_id = Some(target_id);
        self
    }

    pub fn with_proposal(mut self, proposal_id: ProposalId) -> Self {
        self.proposal_id = Some(proposal_id);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Fills target and both snapshots from a committed write.
    pub fn with_applied(mut self, applied: &AppliedMutation) -> Self {
        self.target_id = Some(applied.after.id.clone());
        self.before_state = applied.before.as_ref().map(|record| record.snapshot());
        self.after_state = Some(applied.after.snapshot());
        self
    }

    /// Records merged working memory as the after-state of a memory write.
    /// Reads that also touched memory keep no snapshot.
    pub fn with_memory(mut self, memory: &WorkingMemory) -> Self {
        if self.outcome == AuditOutcome::Executed {
            self.after_state = serde_json::to_value(memory).ok();
        }
        self
    }
}

/// Time-range query for review tooling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditQuery {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: u32,
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self { since: None, until: None, limit: 100 }
    }
}

impl AuditQuery {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.since.map_or(true, |since| at >= since) && self.until.map_or(true, |until| at < until)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::{json, Map};

    use crate::audit::{AuditContext, AuditEntry, AuditOutcome, AuditQuery};
    use crate::domain::decision::{Decision, ReasonCode, Verdict};
    use crate::domain::memory::{MemoryPatch, WorkingMemory};
    use crate::domain::policy::ActionKind;
    use crate::domain::record::{AppliedMutation, Record, RecordId, Table};
    use crate::domain::tenant::{SessionId, StudioId, UserId};

    fn context() -> AuditContext {
        AuditContext::new(
            StudioId("studio-a".to_owned()),
            UserId("user-1".to_owned()),
            Some(SessionId("sess-1".to_owned())),
        )
    }

    #[test]
    fn denial_entry_has_no_snapshots() {
        let entry = AuditEntry::new(
            &context(),
            ActionKind::CreateLead,
            &Decision::deny(ReasonCode::NotAuthorized),
            AuditOutcome::Denied,
        )
        .with_tool("create_lead");

        assert_eq!(entry.decision, Verdict::Deny);
        assert_eq!(entry.reason_code, ReasonCode::NotAuthorized);
        assert!(entry.before_state.is_none());
        assert!(entry.after_state.is_none());
        assert_eq!(entry.session_id.as_ref().map(|id| id.0.as_str()), Some("sess-1"));
    }

    #[test]
    fn applied_update_captures_before_and_after() {
        let now = Utc::now();
        let mut fields = Map::new();
        fields.insert("name".to_owned(), json!("Ana"));
        let before = Record {
            id: RecordId("client_1".to_owned()),
            studio_id: StudioId("studio-a".to_owned()),
            table: Table::Clients,
            fields: fields.clone(),
            version: 1,
            created_at: now,
            updated_at: now,
        };
        let mut after = before.clone();
        after.fields.insert("name".to_owned(), json!("Ana Lima"));
        after.version = 2;

        let entry = AuditEntry::new(
            &context(),
            ActionKind::UpdateClient,
            &Decision::allow(ReasonCode::FullWrite),
            AuditOutcome::Executed,
        )
        .with_applied(&AppliedMutation { before: Some(before), after });

        assert_eq!(entry.target_id.as_ref().map(|id| id.0.as_str()), Some("client_1"));
        assert_eq!(entry.before_state.as_ref().map(|s| s["name"].clone()), Some(json!("Ana")));
        assert_eq!(
            entry.after_state.as_ref().map(|s| s["name"].clone()),
            Some(json!("Ana Lima"))
        );
    }

    #[test]
    fn memory_snapshot_is_kept_only_for_memory_writes() {
        let now = Utc::now();
        let mut memory = WorkingMemory::empty(
            StudioId("studio-a".to_owned()),
            SessionId("sess-1".to_owned()),
            now,
        );
        memory.merge(&MemoryPatch::goal("book a newborn shoot"), now);
        let allow = Decision::allow(ReasonCode::NonMutating);

        let write = AuditEntry::new(&context(), ActionKind::UpdateMemory, &allow, AuditOutcome::Executed)
            .with_memory(&memory);
        assert_eq!(
            write.after_state.as_ref().map(|s| s["currentGoal"].clone()),
            Some(json!("book a newborn shoot"))
        );

        let read = AuditEntry::new(&context(), ActionKind::ReadClients, &allow, AuditOutcome::Read)
            .with_memory(&memory);
        assert!(read.after_state.is_none());
    }

    #[test]
    fn query_range_is_half_open() {
        let now = Utc::now();
        let query = AuditQuery { since: Some(now), until: Some(now + Duration::hours(1)), limit: 10 };
        assert!(query.contains(now));
        assert!(!query.contains(now + Duration::hours(1)));
        assert!(!query.contains(now - Duration::seconds(1)));
    }
}
