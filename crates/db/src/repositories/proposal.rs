use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::SqliteConnection;

use shutterdesk_core::audit::AuditEntry;
use shutterdesk_core::domain::policy::ActionKind;
use shutterdesk_core::domain::proposal::{Proposal, ProposalId, ProposalStatus, RiskLevel};
use shutterdesk_core::domain::tenant::{SessionId, StudioId, UserId};

use super::audit::insert_entry;
use super::{
    column, parse_json, parse_timestamp, timestamp, ProposalRepository, RepositoryError,
};
use crate::DbPool;

const PROPOSAL_COLUMNS: &str = "id, studio_id, proposed_by, session_id, tool_name, action_kind,
        payload_json, risk, status, resolved_by, created_at, updated_at, resolved_at";

pub struct SqlProposalRepository {
    pool: DbPool,
}

impl SqlProposalRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_proposal(row: &SqliteRow) -> Result<Proposal, RepositoryError> {
    let action_kind: String = column(row, "action_kind")?;
    let payload_json: String = column(row, "payload_json")?;
    let risk: String = column(row, "risk")?;
    let status: String = column(row, "status")?;
    let created_at: String = column(row, "created_at")?;
    let updated_at: String = column(row, "updated_at")?;
    let resolved_at: Option<String> = column(row, "resolved_at")?;

    Ok(Proposal {
        id: ProposalId(column(row, "id")?),
        studio_id: StudioId(column(row, "studio_id")?),
        proposed_by: UserId(column(row, "proposed_by")?),
        session_id: column::<Option<String>>(row, "session_id")?.map(SessionId),
        tool_name: column(row, "tool_name")?,
        action_kind: ActionKind::parse(&action_kind).ok_or_else(|| {
            RepositoryError::Decode(format!("unknown action kind `{action_kind}`"))
        })?,
        payload: parse_json(&payload_json)?,
        risk: RiskLevel::parse(&risk)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown risk `{risk}`")))?,
        status: ProposalStatus::parse(&status)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown status `{status}`")))?,
        resolved_by: column::<Option<String>>(row, "resolved_by")?.map(UserId),
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        resolved_at: resolved_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

async fn find_in(
    conn: &mut SqliteConnection,
    studio_id: &StudioId,
    id: &ProposalId,
) -> Result<Option<Proposal>, RepositoryError> {
    let row = sqlx::query(&format!(
        "SELECT {PROPOSAL_COLUMNS} FROM agent_proposal WHERE id = ? AND studio_id = ?"
    ))
    .bind(&id.0)
    .bind(&studio_id.0)
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(row_to_proposal).transpose()
}

#[async_trait::async_trait]
impl ProposalRepository for SqlProposalRepository {
    async fn submit(&self, proposal: &Proposal, entry: &AuditEntry) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO agent_proposal (id, studio_id, proposed_by, session_id, tool_name,
                                         action_kind, payload_json, risk, status, resolved_by,
                                         created_at, updated_at, resolved_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&proposal.id.0)
        .bind(&proposal.studio_id.0)
        .bind(&proposal.proposed_by.0)
        .bind(proposal.session_id.as_ref().map(|id| id.0.as_str()))
        .bind(&proposal.tool_name)
        .bind(proposal.action_kind.as_str())
        .bind(proposal.payload.to_string())
        .bind(proposal.risk.as_str())
        .bind(proposal.status.as_str())
        .bind(proposal.resolved_by.as_ref().map(|id| id.0.as_str()))
        .bind(timestamp(proposal.created_at))
        .bind(timestamp(proposal.updated_at))
        .bind(proposal.resolved_at.map(timestamp))
        .execute(&mut *tx)
        .await?;

        insert_entry(&mut tx, entry).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find(
        &self,
        studio_id: &StudioId,
        id: &ProposalId,
    ) -> Result<Option<Proposal>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        find_in(&mut conn, studio_id, id).await
    }

    async fn list(
        &self,
        studio_id: &StudioId,
        status: Option<ProposalStatus>,
        limit: u32,
    ) -> Result<Vec<Proposal>, RepositoryError> {
        let rows: Vec<SqliteRow> = sqlx::query(&format!(
            "SELECT {PROPOSAL_COLUMNS}
             FROM agent_proposal
             WHERE studio_id = ? AND (? IS NULL OR status = ?)
             ORDER BY created_at ASC, id ASC
             LIMIT ?"
        ))
        .bind(&studio_id.0)
        .bind(status.map(|s| s.as_str()))
        .bind(status.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_proposal).collect::<Result<Vec<_>, _>>()
    }

    async fn resolve(
        &self,
        studio_id: &StudioId,
        id: &ProposalId,
        next: ProposalStatus,
        reviewer: &UserId,
        entry: &AuditEntry,
    ) -> Result<Proposal, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let mut proposal = find_in(&mut tx, studio_id, id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound { table: "proposals", id: id.0.clone() })?;
        let from = proposal.status;
        proposal.resolve(next, reviewer.clone(), Utc::now())?;

        let result = sqlx::query(
            "UPDATE agent_proposal
             SET status = ?, resolved_by = ?, resolved_at = ?, updated_at = ?
             WHERE id = ? AND studio_id = ? AND status = ?",
        )
        .bind(proposal.status.as_str())
        .bind(&reviewer.0)
        .bind(proposal.resolved_at.map(timestamp))
        .bind(timestamp(proposal.updated_at))
        .bind(&id.0)
        .bind(&studio_id.0)
        .bind(from.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict { table: "proposals", id: id.0.clone() });
        }

        insert_entry(&mut tx, entry).await?;
        tx.commit().await?;
        Ok(proposal)
    }
}
