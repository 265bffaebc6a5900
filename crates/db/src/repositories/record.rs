use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::SqliteConnection;

use shutterdesk_core::audit::AuditEntry;
use shutterdesk_core::domain::record::{
    AppliedMutation, Mutation, Record, RecordFilter, RecordId, Table,
};
use shutterdesk_core::domain::tenant::StudioId;

use super::audit::insert_entry;
use super::{
    column, merge_patch, parse_object, parse_timestamp, timestamp, RecordRepository,
    RepositoryError,
};
use crate::DbPool;

pub struct SqlRecordRepository {
    pool: DbPool,
}

impl SqlRecordRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_record(row: &SqliteRow) -> Result<Record, RepositoryError> {
    let table_name: String = column(row, "table_name")?;
    let fields_json: String = column(row, "fields_json")?;
    let version: i64 = column(row, "version")?;
    let created_at: String = column(row, "created_at")?;
    let updated_at: String = column(row, "updated_at")?;

    Ok(Record {
        id: RecordId(column(row, "id")?),
        studio_id: StudioId(column(row, "studio_id")?),
        table: Table::parse(&table_name)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown table `{table_name}`")))?,
        fields: parse_object(&fields_json)?,
        version: u32::try_from(version)
            .map_err(|_| RepositoryError::Decode(format!("invalid version {version}")))?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

async fn find_in(
    conn: &mut SqliteConnection,
    studio_id: &StudioId,
    table: Table,
    id: &RecordId,
) -> Result<Option<Record>, RepositoryError> {
    let row = sqlx::query(
        "SELECT id, studio_id, table_name, fields_json, version, created_at, updated_at
         FROM crm_record WHERE id = ? AND studio_id = ? AND table_name = ?",
    )
    .bind(&id.0)
    .bind(&studio_id.0)
    .bind(table.as_str())
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(row_to_record).transpose()
}

async fn insert_in(
    conn: &mut SqliteConnection,
    studio_id: &StudioId,
    table: Table,
    fields: Map<String, Value>,
) -> Result<Record, RepositoryError> {
    let now = Utc::now();
    let record = Record {
        id: RecordId::generate(table),
        studio_id: studio_id.clone(),
        table,
        fields,
        version: 1,
        created_at: now,
        updated_at: now,
    };

    sqlx::query(
        "INSERT INTO crm_record (id, studio_id, table_name, fields_json, version, created_at,
                                 updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&record.id.0)
    .bind(&record.studio_id.0)
    .bind(table.as_str())
    .bind(Value::Object(record.fields.clone()).to_string())
    .bind(i64::from(record.version))
    .bind(timestamp(record.created_at))
    .bind(timestamp(record.updated_at))
    .execute(&mut *conn)
    .await?;

    Ok(record)
}

/// Compare-and-swap on the version read inside the same transaction.
async fn update_in(
    conn: &mut SqliteConnection,
    studio_id: &StudioId,
    table: Table,
    id: &RecordId,
    patch: &Map<String, Value>,
) -> Result<AppliedMutation, RepositoryError> {
    let before = find_in(conn, studio_id, table, id)
        .await?
        .ok_or_else(|| RepositoryError::NotFound { table: table.as_str(), id: id.0.clone() })?;

    let mut after = before.clone();
    merge_patch(&mut after.fields, patch);
    after.version = before.version + 1;
    after.updated_at = Utc::now();

    let result = sqlx::query(
        "UPDATE crm_record SET fields_json = ?, version = ?, updated_at = ?
         WHERE id = ? AND studio_id = ? AND table_name = ? AND version = ?",
    )
    .bind(Value::Object(after.fields.clone()).to_string())
    .bind(i64::from(after.version))
    .bind(timestamp(after.updated_at))
    .bind(&id.0)
    .bind(&studio_id.0)
    .bind(table.as_str())
    .bind(i64::from(before.version))
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(RepositoryError::Conflict { table: table.as_str(), id: id.0.clone() });
    }

    Ok(AppliedMutation { before: Some(before), after })
}

#[async_trait::async_trait]
impl RecordRepository for SqlRecordRepository {
    async fn select(
        &self,
        studio_id: &StudioId,
        table: Table,
        filter: &RecordFilter,
        limit: u32,
    ) -> Result<Vec<Record>, RepositoryError> {
        let rows: Vec<SqliteRow> = if filter.equals.is_empty() {
            sqlx::query(
                "SELECT id, studio_id, table_name, fields_json, version, created_at, updated_at
                 FROM crm_record
                 WHERE studio_id = ? AND table_name = ?
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?",
            )
            .bind(&studio_id.0)
            .bind(table.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT id, studio_id, table_name, fields_json, version, created_at, updated_at
                 FROM crm_record
                 WHERE studio_id = ? AND table_name = ?
                 ORDER BY created_at DESC, id DESC",
            )
            .bind(&studio_id.0)
            .bind(table.as_str())
            .fetch_all(&self.pool)
            .await?
        };

        let mut records = Vec::new();
        for row in &rows {
            let record = row_to_record(row)?;
            if filter.matches(&record) {
                records.push(record);
                if records.len() >= limit as usize {
                    break;
                }
            }
        }
        Ok(records)
    }

    async fn find(
        &self,
        studio_id: &StudioId,
        table: Table,
        id: &RecordId,
    ) -> Result<Option<Record>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        find_in(&mut conn, studio_id, table, id).await
    }

    async fn insert(
        &self,
        studio_id: &StudioId,
        table: Table,
        fields: Map<String, Value>,
    ) -> Result<Record, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        insert_in(&mut conn, studio_id, table, fields).await
    }

    async fn update(
        &self,
        studio_id: &StudioId,
        table: Table,
        id: &RecordId,
        patch: Map<String, Value>,
    ) -> Result<AppliedMutation, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let applied = update_in(&mut tx, studio_id, table, id, &patch).await?;
        tx.commit().await?;
        Ok(applied)
    }

    async fn apply_audited(
        &self,
        studio_id: &StudioId,
        mutation: &Mutation,
        entry: AuditEntry,
    ) -> Result<(AppliedMutation, AuditEntry), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let applied = match mutation {
            Mutation::Insert { table, fields } => {
                let after = insert_in(&mut tx, studio_id, *table, fields.clone()).await?;
                AppliedMutation { before: None, after }
            }
            Mutation::Update { table, id, patch } => {
                update_in(&mut tx, studio_id, *table, id, patch).await?
            }
        };

        let entry = entry.with_applied(&applied);
        insert_entry(&mut tx, &entry).await?;
        tx.commit().await?;

        Ok((applied, entry))
    }
}
