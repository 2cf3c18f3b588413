//! Build Repository
//!
//! The `builds` table doubles as the job queue. Claiming, lease renewal and
//! every status change are single conditional `UPDATE ... RETURNING`
//! statements, so concurrent workers and API calls never observe a
//! half-applied transition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cygni_core::domain::build::{Build, BuildJob, BuildStatus};
use cygni_core::domain::log::LogEntry;
use sqlx::PgPool;
use uuid::Uuid;

use super::{StoreError, StoreResult, log};

/// Terminal status write applied by [`BuildStore::finish`]
#[derive(Debug, Clone)]
pub struct Finish {
    pub status: BuildStatus,
    pub image_ref: Option<String>,
    pub failure_reason: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl Finish {
    pub fn success(image_ref: String) -> Self {
        Self {
            status: BuildStatus::Success,
            image_ref: Some(image_ref),
            failure_reason: None,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: BuildStatus::Failed,
            image_ref: None,
            failure_reason: Some(reason.into()),
            completed_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait BuildStore: Send + Sync {
    async fn insert(&self, build: &Build) -> StoreResult<()>;

    async fn find(&self, id: Uuid) -> StoreResult<Option<Build>>;

    async fn list_by_project(&self, project_id: &str) -> StoreResult<Vec<Build>>;

    /// Leases the oldest available build to `worker_id`.
    ///
    /// Available means pending with `available_at <= now`, or running with a
    /// lease that expired before `now`. The attempt counter is incremented and
    /// a fresh lease token issued.
    async fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> StoreResult<Option<Build>>;

    /// Extends the lease held by `lease_token` on a running build
    async fn renew_lease(
        &self,
        id: Uuid,
        lease_token: Uuid,
        lease_until: DateTime<Utc>,
    ) -> StoreResult<Option<Build>>;

    /// Moves a pending or running build to a terminal status.
    /// With `lease_token` set, only the current lease holder may finish it.
    async fn finish(
        &self,
        id: Uuid,
        lease_token: Option<Uuid>,
        finish: Finish,
    ) -> StoreResult<Option<Build>>;

    /// Returns a running build to the queue, not claimable before `available_at`
    async fn requeue(
        &self,
        id: Uuid,
        lease_token: Uuid,
        available_at: DateTime<Utc>,
        reason: &str,
    ) -> StoreResult<Option<Build>>;

    /// Cancels a pending or running build. A running build keeps its lease
    /// token and gets `cancel_requested` so its worker can acknowledge.
    async fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<Option<Build>>;

    /// Clears the cancellation flag once the worker acknowledged it
    async fn clear_cancel_request(&self, id: Uuid, lease_token: Uuid) -> StoreResult<Option<Build>>;

    /// Clears flags on builds cancelled before `cancelled_before` whose worker
    /// never acknowledged; returns their ids
    async fn expire_cancel_requests(&self, cancelled_before: DateTime<Utc>) -> StoreResult<Vec<Uuid>>;

    async fn delete(&self, id: Uuid) -> StoreResult<bool>;

    async fn append_logs(&self, id: Uuid, entries: &[LogEntry]) -> StoreResult<()>;

    async fn logs(&self, id: Uuid) -> StoreResult<Vec<LogEntry>>;
}

// =============================================================================
// Postgres
// =============================================================================

const BUILD_COLUMNS: &str = r#"
    id, project_id, repository, commit_sha, branch, context_location,
    manifest_path, build_args, environment_id, canary_policy, status,
    image_ref, failure_reason, attempts, worker_id, lease_token,
    lease_expires_at, available_at, cancel_requested, requested_at,
    started_at, completed_at
"#;

pub struct PgBuildStore {
    pool: PgPool,
}

impl PgBuildStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_one_returning(
        &self,
        query: sqlx::query::QueryAs<'_, sqlx::Postgres, BuildRow, sqlx::postgres::PgArguments>,
    ) -> StoreResult<Option<Build>> {
        query
            .fetch_optional(&self.pool)
            .await?
            .map(Build::try_from)
            .transpose()
    }
}

#[async_trait]
impl BuildStore for PgBuildStore {
    async fn insert(&self, build: &Build) -> StoreResult<()> {
        let build_args = serde_json::to_value(&build.job.build_args)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let canary_policy = build
            .canary
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO builds (
                id, project_id, repository, commit_sha, branch, context_location,
                manifest_path, build_args, environment_id, canary_policy, status,
                attempts, available_at, cancel_requested, requested_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(build.id)
        .bind(&build.job.project_id)
        .bind(&build.job.repository)
        .bind(&build.job.commit_sha)
        .bind(&build.job.branch)
        .bind(&build.job.context_location)
        .bind(&build.job.manifest_path)
        .bind(build_args)
        .bind(&build.environment_id)
        .bind(canary_policy)
        .bind(build.status.as_str())
        .bind(build.attempts as i32)
        .bind(build.available_at)
        .bind(build.cancel_requested)
        .bind(build.requested_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find(&self, id: Uuid) -> StoreResult<Option<Build>> {
        let sql = format!("SELECT {} FROM builds WHERE id = $1", BUILD_COLUMNS);
        self.fetch_one_returning(sqlx::query_as::<_, BuildRow>(&sql).bind(id))
            .await
    }

    async fn list_by_project(&self, project_id: &str) -> StoreResult<Vec<Build>> {
        let sql = format!(
            "SELECT {} FROM builds WHERE project_id = $1 ORDER BY requested_at DESC",
            BUILD_COLUMNS
        );
        let rows = sqlx::query_as::<_, BuildRow>(&sql)
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Build::try_from).collect()
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> StoreResult<Option<Build>> {
        // SKIP LOCKED lets concurrent claimers pass over rows another
        // transaction is already taking
        let sql = format!(
            r#"
            UPDATE builds
            SET status = 'running',
                worker_id = $1,
                lease_token = $2,
                lease_expires_at = $3,
                attempts = attempts + 1,
                started_at = COALESCE(started_at, $4),
                cancel_requested = FALSE
            WHERE id = (
                SELECT id FROM builds
                WHERE (status = 'pending' AND available_at <= $4)
                   OR (status = 'running' AND lease_expires_at < $4)
                ORDER BY requested_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            BUILD_COLUMNS
        );

        self.fetch_one_returning(
            sqlx::query_as::<_, BuildRow>(&sql)
                .bind(worker_id)
                .bind(Uuid::new_v4())
                .bind(lease_until)
                .bind(now),
        )
        .await
    }

    async fn renew_lease(
        &self,
        id: Uuid,
        lease_token: Uuid,
        lease_until: DateTime<Utc>,
    ) -> StoreResult<Option<Build>> {
        let sql = format!(
            r#"
            UPDATE builds SET lease_expires_at = $3
            WHERE id = $1 AND lease_token = $2 AND status = 'running'
            RETURNING {}
            "#,
            BUILD_COLUMNS
        );

        self.fetch_one_returning(
            sqlx::query_as::<_, BuildRow>(&sql)
                .bind(id)
                .bind(lease_token)
                .bind(lease_until),
        )
        .await
    }

    async fn finish(
        &self,
        id: Uuid,
        lease_token: Option<Uuid>,
        finish: Finish,
    ) -> StoreResult<Option<Build>> {
        let sql = format!(
            r#"
            UPDATE builds
            SET status = $2,
                image_ref = COALESCE($3, image_ref),
                failure_reason = $4,
                completed_at = $5,
                lease_expires_at = NULL
            WHERE id = $1
              AND status IN ('pending', 'running')
              AND ($6::uuid IS NULL OR lease_token = $6)
            RETURNING {}
            "#,
            BUILD_COLUMNS
        );

        self.fetch_one_returning(
            sqlx::query_as::<_, BuildRow>(&sql)
                .bind(id)
                .bind(finish.status.as_str())
                .bind(finish.image_ref)
                .bind(finish.failure_reason)
                .bind(finish.completed_at)
                .bind(lease_token),
        )
        .await
    }

    async fn requeue(
        &self,
        id: Uuid,
        lease_token: Uuid,
        available_at: DateTime<Utc>,
        reason: &str,
    ) -> StoreResult<Option<Build>> {
        let sql = format!(
            r#"
            UPDATE builds
            SET status = 'pending',
                available_at = $3,
                failure_reason = $4,
                worker_id = NULL,
                lease_token = NULL,
                lease_expires_at = NULL
            WHERE id = $1 AND status = 'running' AND lease_token = $2
            RETURNING {}
            "#,
            BUILD_COLUMNS
        );

        self.fetch_one_returning(
            sqlx::query_as::<_, BuildRow>(&sql)
                .bind(id)
                .bind(lease_token)
                .bind(available_at)
                .bind(reason),
        )
        .await
    }

    async fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<Option<Build>> {
        // SET expressions see the pre-update row, so `status = 'running'`
        // reflects whether a worker holds the build
        let sql = format!(
            r#"
            UPDATE builds
            SET status = 'cancelled',
                cancel_requested = (status = 'running'),
                failure_reason = COALESCE(failure_reason, 'cancelled by request'),
                completed_at = $2,
                lease_expires_at = NULL
            WHERE id = $1 AND status IN ('pending', 'running')
            RETURNING {}
            "#,
            BUILD_COLUMNS
        );

        self.fetch_one_returning(sqlx::query_as::<_, BuildRow>(&sql).bind(id).bind(now))
            .await
    }

    async fn clear_cancel_request(&self, id: Uuid, lease_token: Uuid) -> StoreResult<Option<Build>> {
        let sql = format!(
            r#"
            UPDATE builds SET cancel_requested = FALSE
            WHERE id = $1 AND lease_token = $2 AND status = 'cancelled'
            RETURNING {}
            "#,
            BUILD_COLUMNS
        );

        self.fetch_one_returning(
            sqlx::query_as::<_, BuildRow>(&sql)
                .bind(id)
                .bind(lease_token),
        )
        .await
    }

    async fn expire_cancel_requests(&self, cancelled_before: DateTime<Utc>) -> StoreResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE builds SET cancel_requested = FALSE
            WHERE status = 'cancelled' AND cancel_requested AND completed_at < $1
            RETURNING id
            "#,
        )
        .bind(cancelled_before)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn delete(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM builds WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn append_logs(&self, id: Uuid, entries: &[LogEntry]) -> StoreResult<()> {
        Ok(log::append(&self.pool, id, entries).await?)
    }

    async fn logs(&self, id: Uuid) -> StoreResult<Vec<LogEntry>> {
        Ok(log::find_by_build(&self.pool, id).await?)
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct BuildRow {
    id: Uuid,
    project_id: String,
    repository: String,
    commit_sha: String,
    branch: Option<String>,
    context_location: String,
    manifest_path: String,
    build_args: serde_json::Value,
    environment_id: String,
    canary_policy: Option<serde_json::Value>,
    status: String,
    image_ref: Option<String>,
    failure_reason: Option<String>,
    attempts: i32,
    worker_id: Option<String>,
    lease_token: Option<Uuid>,
    lease_expires_at: Option<DateTime<Utc>>,
    available_at: DateTime<Utc>,
    cancel_requested: bool,
    requested_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<BuildRow> for Build {
    type Error = StoreError;

    fn try_from(row: BuildRow) -> Result<Self, Self::Error> {
        let status = row.status.parse::<BuildStatus>().map_err(StoreError::Corrupt)?;
        let build_args = serde_json::from_value(row.build_args)
            .map_err(|e| StoreError::Corrupt(format!("build_args: {}", e)))?;
        let canary = row
            .canary_policy
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| StoreError::Corrupt(format!("canary_policy: {}", e)))?;

        Ok(Build {
            id: row.id,
            job: BuildJob {
                project_id: row.project_id,
                repository: row.repository,
                commit_sha: row.commit_sha,
                branch: row.branch,
                context_location: row.context_location,
                manifest_path: row.manifest_path,
                build_args,
            },
            environment_id: row.environment_id,
            canary,
            status,
            image_ref: row.image_ref,
            failure_reason: row.failure_reason,
            attempts: row.attempts.max(0) as u32,
            worker_id: row.worker_id,
            lease_token: row.lease_token,
            lease_expires_at: row.lease_expires_at,
            available_at: row.available_at,
            cancel_requested: row.cancel_requested,
            requested_at: row.requested_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}
