//! Build log persistence
//!
//! Postgres helpers shared by [`super::PgBuildStore`]. Entries keep their
//! insertion order through the `BIGSERIAL` key.

use cygni_core::domain::log::{LogEntry, LogLevel};
use sqlx::PgPool;
use uuid::Uuid;

/// Appends entries for a build in a single transaction
pub async fn append(pool: &PgPool, build_id: Uuid, entries: &[LogEntry]) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    for entry in entries {
        sqlx::query(
            r#"
            INSERT INTO build_logs (build_id, timestamp, level, message)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(build_id)
        .bind(entry.timestamp)
        .bind(level_to_string(entry.level))
        .bind(&entry.message)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await
}

/// All entries of a build in arrival order
pub async fn find_by_build(pool: &PgPool, build_id: Uuid) -> Result<Vec<LogEntry>, sqlx::Error> {
    let rows = sqlx::query_as::<_, LogRow>(
        r#"
        SELECT timestamp, level, message
        FROM build_logs
        WHERE build_id = $1
        ORDER BY id ASC
        "#,
    )
    .bind(build_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

// =============================================================================
// Helper Functions
// =============================================================================

fn level_to_string(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warning => "warning",
        LogLevel::Error => "error",
    }
}

fn string_to_level(s: &str) -> LogLevel {
    match s {
        "debug" => LogLevel::Debug,
        "warning" => LogLevel::Warning,
        "error" => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct LogRow {
    timestamp: chrono::DateTime<chrono::Utc>,
    level: String,
    message: String,
}

impl From<LogRow> for LogEntry {
    fn from(row: LogRow) -> Self {
        LogEntry {
            timestamp: row.timestamp,
            level: string_to_level(&row.level),
            message: row.message,
        }
    }
}
