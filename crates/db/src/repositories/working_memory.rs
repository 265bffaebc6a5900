use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::SqliteConnection;

use shutterdesk_core::audit::AuditEntry;
use shutterdesk_core::domain::memory::{MemoryField, MemoryPatch, WorkingMemory};
use shutterdesk_core::domain::tenant::{SessionId, StudioId};

use super::audit::insert_entry;
use super::{column, parse_json, parse_timestamp, timestamp, RepositoryError, WorkingMemoryRepository};
use crate::DbPool;

/// One row per session plus one row per populated field, so concurrent
/// patches touching different fields never overwrite each other.
pub struct SqlWorkingMemoryRepository {
    pool: DbPool,
}

impl SqlWorkingMemoryRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

async fn load_in(
    conn: &mut SqliteConnection,
    studio_id: &StudioId,
    session_id: &SessionId,
) -> Result<Option<WorkingMemory>, RepositoryError> {
    let session = sqlx::query(
        "SELECT updated_at FROM working_memory_session WHERE studio_id = ? AND session_id = ?",
    )
    .bind(&studio_id.0)
    .bind(&session_id.0)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(session) = session else {
        return Ok(None);
    };
    let updated_at: String = column(&session, "updated_at")?;
    let mut memory =
        WorkingMemory::empty(studio_id.clone(), session_id.clone(), parse_timestamp(&updated_at)?);

    let rows: Vec<SqliteRow> = sqlx::query(
        "SELECT field, value_json FROM working_memory_field
         WHERE studio_id = ? AND session_id = ?",
    )
    .bind(&studio_id.0)
    .bind(&session_id.0)
    .fetch_all(&mut *conn)
    .await?;

    for row in &rows {
        let field: String = column(row, "field")?;
        let value_json: String = column(row, "value_json")?;
        let field = MemoryField::parse(&field)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown memory field `{field}`")))?;
        memory.apply_field(field, parse_json(&value_json)?);
    }

    Ok(Some(memory))
}

async fn merge_in(
    conn: &mut SqliteConnection,
    studio_id: &StudioId,
    session_id: &SessionId,
    patch: &MemoryPatch,
) -> Result<WorkingMemory, RepositoryError> {
    let now = timestamp(Utc::now());

    sqlx::query(
        "INSERT INTO working_memory_session (studio_id, session_id, created_at, updated_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(studio_id, session_id) DO UPDATE SET updated_at = excluded.updated_at",
    )
    .bind(&studio_id.0)
    .bind(&session_id.0)
    .bind(&now)
    .bind(&now)
    .execute(&mut *conn)
    .await?;

    for (field, value) in patch.fields() {
        sqlx::query(
            "INSERT INTO working_memory_field (studio_id, session_id, field, value_json,
                                               updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(studio_id, session_id, field) DO UPDATE SET
                 value_json = excluded.value_json,
                 updated_at = excluded.updated_at",
        )
        .bind(&studio_id.0)
        .bind(&session_id.0)
        .bind(field.key())
        .bind(value.to_string())
        .bind(&now)
        .execute(&mut *conn)
        .await?;
    }

    load_in(conn, studio_id, session_id).await?.ok_or_else(|| {
        RepositoryError::Decode(format!("session `{session_id}` vanished during merge"))
    })
}

#[async_trait::async_trait]
impl WorkingMemoryRepository for SqlWorkingMemoryRepository {
    async fn merge(
        &self,
        studio_id: &StudioId,
        session_id: &SessionId,
        patch: &MemoryPatch,
    ) -> Result<WorkingMemory, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let memory = merge_in(&mut tx, studio_id, session_id, patch).await?;
        tx.commit().await?;
        Ok(memory)
    }

    async fn merge_audited(
        &self,
        studio_id: &StudioId,
        session_id: &SessionId,
        patch: &MemoryPatch,
        entry: AuditEntry,
    ) -> Result<(WorkingMemory, AuditEntry), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let memory = merge_in(&mut tx, studio_id, session_id, patch).await?;

        let entry = entry.with_memory(&memory);
        insert_entry(&mut tx, &entry).await?;
        tx.commit().await?;

        Ok((memory, entry))
    }

    async fn get(
        &self,
        studio_id: &StudioId,
        session_id: &SessionId,
    ) -> Result<Option<WorkingMemory>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        load_in(&mut conn, studio_id, session_id).await
    }
}
