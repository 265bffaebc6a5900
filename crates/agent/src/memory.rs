use std::sync::Arc;

use thiserror::Error;

use shutterdesk_core::audit::AuditEntry;
use shutterdesk_core::domain::memory::{MemoryPatch, WorkingMemory};
use shutterdesk_core::domain::tenant::{SessionId, StudioId};
use shutterdesk_db::{RepositoryError, WorkingMemoryRepository};

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("no working memory for session `{0}`")]
    SessionNotFound(SessionId),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl MemoryError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "session_not_found",
            Self::Repository(_) => "memory_store_error",
        }
    }
}

/// Per-conversation state, merged field by field across turns.
#[derive(Clone)]
pub struct WorkingMemoryStore {
    repository: Arc<dyn WorkingMemoryRepository>,
}

impl WorkingMemoryStore {
    pub fn new(repository: Arc<dyn WorkingMemoryRepository>) -> Self {
        Self { repository }
    }

    /// An empty patch still creates the session.
    pub async fn update(
        &self,
        studio_id: &StudioId,
        session_id: &SessionId,
        patch: &MemoryPatch,
    ) -> Result<WorkingMemory, MemoryError> {
        let memory = self.repository.merge(studio_id, session_id, patch).await?;
        tracing::debug!(
            event_name = "agent.memory.updated",
            studio_id = %studio_id,
            session_id = %session_id,
            fields = patch.fields().len(),
            "working memory updated"
        );
        Ok(memory)
    }

    /// Merges `patch` and stores `entry` in the same unit of work. Nothing is
    /// kept unless both land.
    pub async fn update_audited(
        &self,
        studio_id: &StudioId,
        session_id: &SessionId,
        patch: &MemoryPatch,
        entry: AuditEntry,
    ) -> Result<(WorkingMemory, AuditEntry), RepositoryError> {
        let (memory, entry) =
            self.repository.merge_audited(studio_id, session_id, patch, entry).await?;
        tracing::debug!(
            event_name = "agent.memory.updated",
            studio_id = %studio_id,
            session_id = %session_id,
            fields = patch.fields().len(),
            audit_entry_id = %entry.id,
            "working memory updated"
        );
        Ok((memory, entry))
    }

    pub async fn get(
        &self,
        studio_id: &StudioId,
        session_id: &SessionId,
    ) -> Result<WorkingMemory, MemoryError> {
        self.repository
            .get(studio_id, session_id)
            .await?
            .ok_or_else(|| MemoryError::SessionNotFound(session_id.clone()))
    }
}
