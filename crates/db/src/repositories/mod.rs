use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite};
use thiserror::Error;

use shutterdesk_core::audit::{AuditEntry, AuditQuery};
use shutterdesk_core::domain::memory::{MemoryPatch, WorkingMemory};
use shutterdesk_core::domain::proposal::{Proposal, ProposalId, ProposalStatus};
use shutterdesk_core::domain::record::{
    AppliedMutation, Mutation, Record, RecordFilter, RecordId, Table,
};
use shutterdesk_core::domain::tenant::{SessionId, StudioId, UserId};
use shutterdesk_core::errors::DomainError;

use crate::DbPool;

pub mod audit;
pub mod memory;
pub mod proposal;
pub mod record;
pub mod working_memory;

pub use audit::SqlAuditLogRepository;
pub use memory::{
    InMemoryAuditLogRepository, InMemoryProposalRepository, InMemoryRecordRepository,
    InMemoryWorkingMemoryRepository,
};
pub use proposal::SqlProposalRepository;
pub use record::SqlRecordRepository;
pub use working_memory::SqlWorkingMemoryRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("{table} record `{id}` was not found")]
    NotFound { table: &'static str, id: String },
    #[error("{table} record `{id}` changed concurrently")]
    Conflict { table: &'static str, id: String },
    #[error(transparent)]
    Domain(#[from] DomainError),
    /// The audit entry itself could not be stored; the enclosing write was
    /// rolled back.
    #[error("audit log write failed: {0}")]
    AuditWrite(String),
}

#[async_trait]
pub trait RecordRepository: Send + Sync {
    /// Newest first, scoped to one studio and table.
    async fn select(
        &self,
        studio_id: &StudioId,
        table: Table,
        filter: &RecordFilter,
        limit: u32,
    ) -> Result<Vec<Record>, RepositoryError>;

    async fn find(
        &self,
        studio_id: &StudioId,
        table: Table,
        id: &RecordId,
    ) -> Result<Option<Record>, RepositoryError>;

    async fn insert(
        &self,
        studio_id: &StudioId,
        table: Table,
        fields: Map<String, Value>,
    ) -> Result<Record, RepositoryError>;

    async fn update(
        &self,
        studio_id: &StudioId,
        table: Table,
        id: &RecordId,
        patch: Map<String, Value>,
    ) -> Result<AppliedMutation, RepositoryError>;

    /// Applies `mutation` and appends `entry` (completed with the snapshots)
    /// as one unit. Neither is visible unless both are stored.
    async fn apply_audited(
        &self,
        studio_id: &StudioId,
        mutation: &Mutation,
        entry: AuditEntry,
    ) -> Result<(AppliedMutation, AuditEntry), RepositoryError>;
}

#[async_trait]
pub trait AuditLogRepository: Send + Sync {
    async fn append(&self, entry: &AuditEntry) -> Result<(), RepositoryError>;

    /// Newest first.
    async fn list(
        &self,
        studio_id: &StudioId,
        query: &AuditQuery,
    ) -> Result<Vec<AuditEntry>, RepositoryError>;
}

#[async_trait]
pub trait ProposalRepository: Send + Sync {
    /// Stores a new pending proposal together with its audit entry.
    async fn submit(&self, proposal: &Proposal, entry: &AuditEntry) -> Result<(), RepositoryError>;

    async fn find(
        &self,
        studio_id: &StudioId,
        id: &ProposalId,
    ) -> Result<Option<Proposal>, RepositoryError>;

    async fn list(
        &self,
        studio_id: &StudioId,
        status: Option<ProposalStatus>,
        limit: u32,
    ) -> Result<Vec<Proposal>, RepositoryError>;

    /// Moves a pending proposal to a terminal status and appends `entry`.
    /// Fails with `DomainError::InvalidProposalTransition` when the stored
    /// status is no longer pending.
    async fn resolve(
        &self,
        studio_id: &StudioId,
        id: &ProposalId,
        next: ProposalStatus,
        reviewer: &UserId,
        entry: &AuditEntry,
    ) -> Result<Proposal, RepositoryError>;
}

#[async_trait]
pub trait WorkingMemoryRepository: Send + Sync {
    /// Creates the session on first use and upserts only the patched fields.
    async fn merge(
        &self,
        studio_id: &StudioId,
        session_id: &SessionId,
        patch: &MemoryPatch,
    ) -> Result<WorkingMemory, RepositoryError>;

    /// Merges `patch` and appends `entry` (completed with the merged memory)
    /// as one unit.
    async fn merge_audited(
        &self,
        studio_id: &StudioId,
        session_id: &SessionId,
        patch: &MemoryPatch,
        entry: AuditEntry,
    ) -> Result<(WorkingMemory, AuditEntry), RepositoryError>;

    async fn get(
        &self,
        studio_id: &StudioId,
        session_id: &SessionId,
    ) -> Result<Option<WorkingMemory>, RepositoryError>;
}

/// The persistent collaborators the agent layer needs, built once at start-up.
#[derive(Clone)]
pub struct AgentStores {
    pub records: Arc<dyn RecordRepository>,
    pub audit: Arc<dyn AuditLogRepository>,
    pub proposals: Arc<dyn ProposalRepository>,
    pub memory: Arc<dyn WorkingMemoryRepository>,
}

impl AgentStores {
    pub fn sql(pool: DbPool) -> Self {
        Self {
            records: Arc::new(SqlRecordRepository::new(pool.clone())),
            audit: Arc::new(SqlAuditLogRepository::new(pool.clone())),
            proposals: Arc::new(SqlProposalRepository::new(pool.clone())),
            memory: Arc::new(SqlWorkingMemoryRepository::new(pool)),
        }
    }

    /// In-memory stores sharing one audit log; returns the log handle for
    /// inspection and outage simulation.
    pub fn in_memory() -> (Self, Arc<InMemoryAuditLogRepository>) {
        let audit = Arc::new(InMemoryAuditLogRepository::default());
        let stores = Self {
            records: Arc::new(InMemoryRecordRepository::new(audit.clone())),
            audit: audit.clone(),
            proposals: Arc::new(InMemoryProposalRepository::new(audit.clone())),
            memory: Arc::new(InMemoryWorkingMemoryRepository::new(audit.clone())),
        };
        (stores, audit)
    }
}

pub(crate) fn timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("invalid timestamp `{value}`: {e}")))
}

pub(crate) fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, RepositoryError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name).map_err(|e| RepositoryError::Decode(format!("{name}: {e}")))
}

pub(crate) fn parse_json(value: &str) -> Result<Value, RepositoryError> {
    serde_json::from_str(value).map_err(|e| RepositoryError::Decode(e.to_string()))
}

pub(crate) fn parse_object(value: &str) -> Result<Map<String, Value>, RepositoryError> {
    match parse_json(value)? {
        Value::Object(map) => Ok(map),
        other => Err(RepositoryError::Decode(format!("expected JSON object, found {other}"))),
    }
}

/// Shallow merge used by every update path.
pub(crate) fn merge_patch(fields: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        fields.insert(key.clone(), value.clone());
    }
}
