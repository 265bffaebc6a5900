use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use shutterdesk_core::audit::{AuditEntry, AuditQuery};
use shutterdesk_core::domain::memory::{MemoryPatch, WorkingMemory};
use shutterdesk_core::domain::proposal::{Proposal, ProposalId, ProposalStatus};
use shutterdesk_core::domain::record::{
    AppliedMutation, Mutation, Record, RecordFilter, RecordId, Table,
};
use shutterdesk_core::domain::tenant::{SessionId, StudioId, UserId};

use super::{
    merge_patch, AuditLogRepository, ProposalRepository, RecordRepository, RepositoryError,
    WorkingMemoryRepository,
};

/// Append-only log. `set_unavailable(true)` makes every write fail, which
/// lets callers exercise their audit-failure paths.
#[derive(Default)]
pub struct InMemoryAuditLogRepository {
    entries: RwLock<Vec<AuditEntry>>,
    unavailable: AtomicBool,
}

impl InMemoryAuditLogRepository {
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn entry_count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Every entry across studios, oldest first.
    pub async fn snapshot(&self) -> Vec<AuditEntry> {
        self.entries.read().await.clone()
    }

    fn ensure_available(&self) -> Result<(), RepositoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RepositoryError::AuditWrite("audit log rejected the write".to_string()));
        }
        Ok(())
    }

    async fn push(&self, entry: AuditEntry) -> Result<(), RepositoryError> {
        self.ensure_available()?;
        self.entries.write().await.push(entry);
        Ok(())
    }
}

#[async_trait::async_trait]
impl AuditLogRepository for InMemoryAuditLogRepository {
    async fn append(&self, entry: &AuditEntry) -> Result<(), RepositoryError> {
        self.push(entry.clone()).await
    }

    async fn list(
        &self,
        studio_id: &StudioId,
        query: &AuditQuery,
    ) -> Result<Vec<AuditEntry>, RepositoryError> {
        let entries = self.entries.read().await;
        let mut matching: Vec<AuditEntry> = entries
            .iter()
            .filter(|entry| &entry.studio_id == studio_id && query.contains(entry.occurred_at))
            .cloned()
            .collect();
        matching.reverse();
        matching.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        matching.truncate(query.limit as usize);
        Ok(matching)
    }
}

type RecordKey = (StudioId, Table, RecordId);

pub struct InMemoryRecordRepository {
    records: RwLock<HashMap<RecordKey, Record>>,
    audit: Arc<InMemoryAuditLogRepository>,
}

impl InMemoryRecordRepository {
    pub fn new(audit: Arc<InMemoryAuditLogRepository>) -> Self {
        Self { records: RwLock::new(HashMap::new()), audit }
    }

    fn new_record(studio_id: &StudioId, table: Table, fields: Map<String, Value>) -> Record {
        let now = Utc::now();
        Record {
            id: RecordId::generate(table),
            studio_id: studio_id.clone(),
            table,
            fields,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    fn patched(
        records: &HashMap<RecordKey, Record>,
        studio_id: &StudioId,
        table: Table,
        id: &RecordId,
        patch: &Map<String, Value>,
    ) -> Result<AppliedMutation, RepositoryError> {
        let before = records
            .get(&(studio_id.clone(), table, id.clone()))
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound { table: table.as_str(), id: id.0.clone() })?;
        let mut after = before.clone();
        merge_patch(&mut after.fields, patch);
        after.version = before.version + 1;
        after.updated_at = Utc::now();
        Ok(AppliedMutation { before: Some(before), after })
    }
}

#[async_trait::async_trait]
impl RecordRepository for InMemoryRecordRepository {
    async fn select(
        &self,
        studio_id: &StudioId,
        table: Table,
        filter: &RecordFilter,
        limit: u32,
    ) -> Result<Vec<Record>, RepositoryError> {
        let records = self.records.read().await;
        let mut matching: Vec<Record> = records
            .values()
            .filter(|record| {
                &record.studio_id == studio_id && record.table == table && filter.matches(record)
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        matching.truncate(limit as usize);
        Ok(matching)
    }

    async fn find(
        &self,
        studio_id: &StudioId,
        table: Table,
        id: &RecordId,
    ) -> Result<Option<Record>, RepositoryError> {
        let records = self.records.read().await;
        Ok(records.get(&(studio_id.clone(), table, id.clone())).cloned())
    }

    async fn insert(
        &self,
        studio_id: &StudioId,
        table: Table,
        fields: Map<String, Value>,
    ) -> Result<Record, RepositoryError> {
        let record = Self::new_record(studio_id, table, fields);
        let mut records = self.records.write().await;
        records.insert((studio_id.clone(), table, record.id.clone()), record.clone());
        Ok(record)
    }

    async fn update(
        &self,
        studio_id: &StudioId,
        table: Table,
        id: &RecordId,
        patch: Map<String, Value>,
    ) -> Result<AppliedMutation, RepositoryError> {
        let mut records = self.records.write().await;
        let applied = Self::patched(&records, studio_id, table, id, &patch)?;
        records.insert((studio_id.clone(), table, id.clone()), applied.after.clone());
        Ok(applied)
    }

    async fn apply_audited(
        &self,
        studio_id: &StudioId,
        mutation: &Mutation,
        entry: AuditEntry,
    ) -> Result<(AppliedMutation, AuditEntry), RepositoryError> {
        let mut records = self.records.write().await;

        let applied = match mutation {
            Mutation::Insert { table, fields } => AppliedMutation {
                before: None,
                after: Self::new_record(studio_id, *table, fields.clone()),
            },
            Mutation::Update { table, id, patch } => {
                Self::patched(&records, studio_id, *table, id, patch)?
            }
        };

        // The record lock is still held, so nothing observes the write before
        // the entry is stored.
        let entry = entry.with_applied(&applied);
        self.audit.push(entry.clone()).await?;

        let after = &applied.after;
        records.insert((studio_id.clone(), after.table, after.id.clone()), after.clone());
        Ok((applied, entry))
    }
}

pub struct InMemoryProposalRepository {
    proposals: RwLock<HashMap<(StudioId, ProposalId), Proposal>>,
    audit: Arc<InMemoryAuditLogRepository>,
}

impl InMemoryProposalRepository {
    pub fn new(audit: Arc<InMemoryAuditLogRepository>) -> Self {
        Self { proposals: RwLock::new(HashMap::new()), audit }
    }
}

#[async_trait::async_trait]
impl ProposalRepository for InMemoryProposalRepository {
    async fn submit(&self, proposal: &Proposal, entry: &AuditEntry) -> Result<(), RepositoryError> {
        let mut proposals = self.proposals.write().await;
        self.audit.push(entry.clone()).await?;
        proposals.insert((proposal.studio_id.clone(), proposal.id.clone()), proposal.clone());
        Ok(())
    }

    async fn find(
        &self,
        studio_id: &StudioId,
        id: &ProposalId,
    ) -> Result<Option<Proposal>, RepositoryError> {
        let proposals = self.proposals.read().await;
        Ok(proposals.get(&(studio_id.clone(), id.clone())).cloned())
    }

    async fn list(
        &self,
        studio_id: &StudioId,
        status: Option<ProposalStatus>,
        limit: u32,
    ) -> Result<Vec<Proposal>, RepositoryError> {
        let proposals = self.proposals.read().await;
        let mut matching: Vec<Proposal> = proposals
            .values()
            .filter(|proposal| {
                &proposal.studio_id == studio_id
                    && status.map_or(true, |status| proposal.status == status)
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.0.cmp(&b.id.0)));
        matching.truncate(limit as usize);
        Ok(matching)
    }

    async fn resolve(
        &self,
        studio_id: &StudioId,
        id: &ProposalId,
        next: ProposalStatus,
        reviewer: &UserId,
        entry: &AuditEntry,
    ) -> Result<Proposal, RepositoryError> {
        let mut proposals = self.proposals.write().await;
        let key = (studio_id.clone(), id.clone());
        let mut proposal = proposals
            .get(&key)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound { table: "proposals", id: id.0.clone() })?;

        proposal.resolve(next, reviewer.clone(), Utc::now())?;
        self.audit.push(entry.clone()).await?;
        proposals.insert(key, proposal.clone());
        Ok(proposal)
    }
}

#[derive(Default)]
pub struct InMemoryWorkingMemoryRepository {
    sessions: RwLock<HashMap<(StudioId, SessionId), WorkingMemory>>,
    audit: Arc<InMemoryAuditLogRepository>,
}

impl InMemoryWorkingMemoryRepository {
    pub fn new(audit: Arc<InMemoryAuditLogRepository>) -> Self {
        Self { sessions: RwLock::new(HashMap::new()), audit }
    }

    fn merged(
        sessions: &HashMap<(StudioId, SessionId), WorkingMemory>,
        studio_id: &StudioId,
        session_id: &SessionId,
        patch: &MemoryPatch,
    ) -> WorkingMemory {
        let now = Utc::now();
        let mut memory = sessions
            .get(&(studio_id.clone(), session_id.clone()))
            .cloned()
            .unwrap_or_else(|| WorkingMemory::empty(studio_id.clone(), session_id.clone(), now));
        memory.merge(patch, now);
        memory
    }
}

#[async_trait::async_trait]
impl WorkingMemoryRepository for InMemoryWorkingMemoryRepository {
    async fn merge(
        &self,
        studio_id: &StudioId,
        session_id: &SessionId,
        patch: &MemoryPatch,
    ) -> Result<WorkingMemory, RepositoryError> {
        let mut sessions = self.sessions.write().await;
        let memory = Self::merged(&sessions, studio_id, session_id, patch);
        sessions.insert((studio_id.clone(), session_id.clone()), memory.clone());
        Ok(memory)
    }

    async fn merge_audited(
        &self,
        studio_id: &StudioId,
        session_id: &SessionId,
        patch: &MemoryPatch,
        entry: AuditEntry,
    ) -> Result<(WorkingMemory, AuditEntry), RepositoryError> {
        let mut sessions = self.sessions.write().await;
        let memory = Self::merged(&sessions, studio_id, session_id, patch);

        let entry = entry.with_memory(&memory);
        self.audit.push(entry.clone()).await?;

        sessions.insert((studio_id.clone(), session_id.clone()), memory.clone());
        Ok((memory, entry))
    }

    async fn get(
        &self,
        studio_id: &StudioId,
        session_id: &SessionId,
    ) -> Result<Option<WorkingMemory>, RepositoryError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(&(studio_id.clone(), session_id.clone())).cloned())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{json, Map, Value};

    use shutterdesk_core::audit::{AuditContext, AuditEntry, AuditOutcome, AuditQuery};
    use shutterdesk_core::domain::decision::{Decision, ReasonCode};
    use shutterdesk_core::domain::memory::MemoryPatch;
    use shutterdesk_core::domain::policy::ActionKind;
    use shutterdesk_core::domain::record::{Mutation, RecordFilter, Table};
    use shutterdesk_core::domain::tenant::{SessionId, StudioId, UserId};

    use super::{InMemoryAuditLogRepository, InMemoryRecordRepository, InMemoryWorkingMemoryRepository};
    use crate::repositories::{
        AuditLogRepository, RecordRepository, RepositoryError, WorkingMemoryRepository,
    };

    fn studio() -> StudioId {
        StudioId("studio-a".to_string())
    }

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object literal")
    }

    fn entry() -> AuditEntry {
        AuditEntry::new(
            &AuditContext::new(studio(), UserId("user-1".to_string()), None),
            ActionKind::CreateLead,
            &Decision::allow(ReasonCode::FullWrite),
            AuditOutcome::Executed,
        )
    }

    #[tokio::test]
    async fn apply_audited_rolls_back_when_audit_is_unavailable() {
        let audit = Arc::new(InMemoryAuditLogRepository::default());
        let records = InMemoryRecordRepository::new(audit.clone());
        audit.set_unavailable(true);

        let mutation =
            Mutation::Insert { table: Table::Leads, fields: fields(json!({"name": "Ana"})) };
        let error = records
            .apply_audited(&studio(), &mutation, entry())
            .await
            .expect_err("audit outage should fail the write");
        assert!(matches!(error, RepositoryError::AuditWrite(_)));

        let stored = records
            .select(&studio(), Table::Leads, &RecordFilter::all(), 10)
            .await
            .expect("select");
        assert!(stored.is_empty());
        assert_eq!(audit.entry_count().await, 0);
    }

    #[tokio::test]
    async fn apply_audited_records_snapshots() {
        let audit = Arc::new(InMemoryAuditLogRepository::default());
        let records = InMemoryRecordRepository::new(audit.clone());

        let mutation =
            Mutation::Insert { table: Table::Leads, fields: fields(json!({"name": "Ana"})) };
        let (applied, stored) =
            records.apply_audited(&studio(), &mutation, entry()).await.expect("apply");

        assert!(stored.before_state.is_none());
        assert_eq!(stored.after_state.as_ref().map(|s| s["name"].clone()), Some(json!("Ana")));
        assert_eq!(stored.target_id, Some(applied.after.id.clone()));

        let listed = audit.list(&studio(), &AuditQuery::default()).await.expect("list");
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn merge_audited_keeps_nothing_when_audit_is_unavailable() {
        let audit = Arc::new(InMemoryAuditLogRepository::default());
        let memory = InMemoryWorkingMemoryRepository::new(audit.clone());
        let session = SessionId("session-1".to_string());
        let entry = AuditEntry::new(
            &AuditContext::new(studio(), UserId("user-1".to_string()), Some(session.clone())),
            ActionKind::UpdateMemory,
            &Decision::allow(ReasonCode::NonMutating),
            AuditOutcome::Executed,
        );
        audit.set_unavailable(true);

        let error = memory
            .merge_audited(&studio(), &session, &MemoryPatch::goal("deliver proofs"), entry.clone())
            .await
            .expect_err("audit outage");
        assert!(matches!(error, RepositoryError::AuditWrite(_)));
        assert!(memory.get(&studio(), &session).await.expect("get").is_none());

        audit.set_unavailable(false);
        let (merged, stored) = memory
            .merge_audited(&studio(), &session, &MemoryPatch::goal("deliver proofs"), entry)
            .await
            .expect("merge");
        assert_eq!(merged.current_goal.as_deref(), Some("deliver proofs"));
        assert!(stored.after_state.is_some());
        assert_eq!(audit.entry_count().await, 1);
    }
}
