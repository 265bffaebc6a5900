use sqlx::sqlite::SqliteRow;
use sqlx::SqliteConnection;

use shutterdesk_core::audit::{AuditEntry, AuditEntryId, AuditOutcome, AuditQuery};
use shutterdesk_core::domain::decision::{ReasonCode, Verdict};
use shutterdesk_core::domain::policy::ActionKind;
use shutterdesk_core::domain::proposal::ProposalId;
use shutterdesk_core::domain::record::RecordId;
use shutterdesk_core::domain::tenant::{SessionId, StudioId, UserId};

use super::{column, parse_json, parse_timestamp, timestamp, AuditLogRepository, RepositoryError};
use crate::DbPool;

pub struct SqlAuditLogRepository {
    pool: DbPool,
}

impl SqlAuditLogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Shared by every repository that must append an entry inside its own
/// transaction.
pub(crate) async fn insert_entry(
    conn: &mut SqliteConnection,
    entry: &AuditEntry,
) -> Result<(), RepositoryError> {
    let before_json = entry.before_state.as_ref().map(|value| value.to_string());
    let after_json = entry.after_state.as_ref().map(|value| value.to_string());

    sqlx::query(
        "INSERT INTO audit_log_entry (id, studio_id, actor, session_id, tool_name, action_kind,
                                      decision, reason_code, outcome, target_id, proposal_id,
                                      before_json, after_json, error, occurred_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&entry.id.0)
    .bind(&entry.studio_id.0)
    .bind(&entry.actor.0)
    .bind(entry.session_id.as_ref().map(|id| id.0.as_str()))
    .bind(entry.tool_name.as_deref())
    .bind(entry.action_kind.as_str())
    .bind(entry.decision.as_str())
    .bind(entry.reason_code.as_str())
    .bind(entry.outcome.as_str())
    .bind(entry.target_id.as_ref().map(|id| id.0.as_str()))
    .bind(entry.proposal_id.as_ref().map(|id| id.0.as_str()))
    .bind(before_json)
    .bind(after_json)
    .bind(entry.error.as_deref())
    .bind(timestamp(entry.occurred_at))
    .execute(&mut *conn)
    .await
    .map_err(|error| RepositoryError::AuditWrite(error.to_string()))?;

    Ok(())
}

fn row_to_entry(row: &SqliteRow) -> Result<AuditEntry, RepositoryError> {
    let action_kind: String = column(row, "action_kind")?;
    let decision: String = column(row, "decision")?;
    let reason_code: String = column(row, "reason_code")?;
    let outcome: String = column(row, "outcome")?;
    let before_json: Option<String> = column(row, "before_json")?;
    let after_json: Option<String> = column(row, "after_json")?;
    let occurred_at: String = column(row, "occurred_at")?;

    Ok(AuditEntry {
        id: AuditEntryId(column(row, "id")?),
        studio_id: StudioId(column(row, "studio_id")?),
        actor: UserId(column(row, "actor")?),
        session_id: column::<Option<String>>(row, "session_id")?.map(SessionId),
        tool_name: column(row, "tool_name")?,
        action_kind: ActionKind::parse(&action_kind).ok_or_else(|| {
            RepositoryError::Decode(format!("unknown action kind `{action_kind}`"))
        })?,
        decision: Verdict::parse(&decision)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown decision `{decision}`")))?,
        reason_code: ReasonCode::parse(&reason_code).ok_or_else(|| {
            RepositoryError::Decode(format!("unknown reason code `{reason_code}`"))
        })?,
        outcome: AuditOutcome::parse(&outcome)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown outcome `{outcome}`")))?,
        target_id: column::<Option<String>>(row, "target_id")?.map(RecordId),
        proposal_id: column::<Option<String>>(row, "proposal_id")?.map(ProposalId),
        before_state: before_json.as_deref().map(parse_json).transpose()?,
        after_state: after_json.as_deref().map(parse_json).transpose()?,
        error: column(row, "error")?,
        occurred_at: parse_timestamp(&occurred_at)?,
    })
}

#[async_trait::async_trait]
impl AuditLogRepository for SqlAuditLogRepository {
    async fn append(&self, entry: &AuditEntry) -> Result<(), RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        insert_entry(&mut conn, entry).await
    }

    async fn list(
        &self,
        studio_id: &StudioId,
        query: &AuditQuery,
    ) -> Result<Vec<AuditEntry>, RepositoryError> {
        let rows: Vec<SqliteRow> = sqlx::query(
            "SELECT id, studio_id, actor, session_id, tool_name, action_kind, decision,
                    reason_code, outcome, target_id, proposal_id, before_json, after_json,
                    error, occurred_at
             FROM audit_log_entry
             WHERE studio_id = ?
               AND (? IS NULL OR occurred_at >= ?)
               AND (? IS NULL OR occurred_at < ?)
             ORDER BY occurred_at DESC, id DESC
             LIMIT ?",
        )
        .bind(&studio_id.0)
        .bind(query.since.map(timestamp))
        .bind(query.since.map(timestamp))
        .bind(query.until.map(timestamp))
        .bind(query.until.map(timestamp))
        .bind(query.limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_entry).collect::<Result<Vec<_>, _>>()
    }
}
