use std::time::Duration;

use sqlx::sqlite::SqlitePoolOptions;
use thiserror::Error;

use crate::migrations;

pub type DbPool = sqlx::SqlitePool;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("could not open database: {0}")]
    Connect(#[from] sqlx::Error),
    #[error("could not apply migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub async fn connect(database_url: &str) -> Result<DbPool, sqlx::Error> {
    connect_with_settings(database_url, 5, 30).await
}

pub async fn connect_with_settings(
    database_url: &str,
    max_connections: u32,
    timeout_secs: u64,
) -> Result<DbPool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(timeout_secs.max(1)))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                sqlx::query("PRAGMA busy_timeout = 5000").execute(&mut *conn).await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await
}

/// Opens the pool and brings the schema up to date before handing it out.
pub async fn connect_and_migrate(
    database_url: &str,
    max_connections: u32,
    timeout_secs: u64,
) -> Result<DbPool, ConnectError> {
    let pool = connect_with_settings(database_url, max_connections, timeout_secs).await?;
    migrations::run_pending(&pool).await?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use sqlx::Row;

    use super::connect_and_migrate;

    #[tokio::test]
    async fn connect_and_migrate_enables_foreign_keys() {
        let pool = connect_and_migrate("sqlite::memory:", 1, 30).await.expect("connect");

        let enabled = sqlx::query("PRAGMA foreign_keys")
            .fetch_one(&pool)
            .await
            .expect("read pragma")
            .get::<i64, _>(0);
        assert_eq!(enabled, 1);

        let orphan = sqlx::query(
            "INSERT INTO working_memory_field (studio_id, session_id, field, value_json, updated_at)
             VALUES ('studio-a', 'missing', 'currentGoal', '\"x\"', '2026-01-01T00:00:00Z')",
        )
        .execute(&pool)
        .await;
        assert!(orphan.is_err(), "fields require an owning session row");
    }
}
