//! Canary Repository
//!
//! Canary releases and their append-only metric sample history.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cygni_core::domain::canary::{CanaryMetricSample, CanaryRelease, CanaryStatus};
use sqlx::PgPool;
use uuid::Uuid;

use super::{StoreError, StoreResult};

#[async_trait]
pub trait CanaryStore: Send + Sync {
    /// Fails with [`StoreError::Conflict`] when the deployment already has an
    /// active (running or paused) release
    async fn insert(&self, release: &CanaryRelease) -> StoreResult<()>;

    async fn find(&self, id: Uuid) -> StoreResult<Option<CanaryRelease>>;

    /// Newest first
    async fn list_by_deployment(&self, deployment_id: Uuid) -> StoreResult<Vec<CanaryRelease>>;

    /// Releases in `running` status, for resuming control loops after a restart
    async fn list_running(&self) -> StoreResult<Vec<CanaryRelease>>;

    /// Sets `to` only when the current status is one of `from`
    async fn transition(
        &self,
        id: Uuid,
        from: &[CanaryStatus],
        to: CanaryStatus,
        reason: Option<&str>,
        completed_at: Option<DateTime<Utc>>,
    ) -> StoreResult<Option<CanaryRelease>>;

    /// Records a new canary percentage on a non-terminal release
    async fn set_traffic(&self, id: Uuid, traffic_percentage: f64) -> StoreResult<Option<CanaryRelease>>;

    async fn append_sample(&self, sample: &CanaryMetricSample) -> StoreResult<()>;

    /// Up to `limit` samples, newest first
    async fn recent_samples(&self, canary_id: Uuid, limit: usize) -> StoreResult<Vec<CanaryMetricSample>>;

    async fn count_samples(&self, canary_id: Uuid) -> StoreResult<usize>;
}

// =============================================================================
// Postgres
// =============================================================================

const RELEASE_COLUMNS: &str = r#"
    id, deployment_id, project_id, stable_deployment_id, traffic_percentage,
    policy, status, reason, started_at, scheduled_end_at, completed_at
"#;

pub struct PgCanaryStore {
    pool: PgPool,
}

impl PgCanaryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CanaryStore for PgCanaryStore {
    async fn insert(&self, release: &CanaryRelease) -> StoreResult<()> {
        let policy =
            serde_json::to_value(&release.policy).map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO canary_releases (
                id, deployment_id, project_id, stable_deployment_id, traffic_percentage,
                policy, status, reason, started_at, scheduled_end_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(release.id)
        .bind(release.deployment_id)
        .bind(&release.project_id)
        .bind(release.stable_deployment_id)
        .bind(release.traffic_percentage)
        .bind(policy)
        .bind(release.status.as_str())
        .bind(&release.reason)
        .bind(release.started_at)
        .bind(release.scheduled_end_at)
        .bind(release.completed_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(StoreError::Conflict(
                format!("deployment {} already has an active canary", release.deployment_id),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn find(&self, id: Uuid) -> StoreResult<Option<CanaryRelease>> {
        let sql = format!("SELECT {} FROM canary_releases WHERE id = $1", RELEASE_COLUMNS);
        sqlx::query_as::<_, ReleaseRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(CanaryRelease::try_from)
            .transpose()
    }

    async fn list_by_deployment(&self, deployment_id: Uuid) -> StoreResult<Vec<CanaryRelease>> {
        let sql = format!(
            "SELECT {} FROM canary_releases WHERE deployment_id = $1 ORDER BY started_at DESC",
            RELEASE_COLUMNS
        );
        let rows = sqlx::query_as::<_, ReleaseRow>(&sql)
            .bind(deployment_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(CanaryRelease::try_from).collect()
    }

    async fn list_running(&self) -> StoreResult<Vec<CanaryRelease>> {
        let sql = format!(
            "SELECT {} FROM canary_releases WHERE status = 'running' ORDER BY started_at ASC",
            RELEASE_COLUMNS
        );
        let rows = sqlx::query_as::<_, ReleaseRow>(&sql)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(CanaryRelease::try_from).collect()
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[CanaryStatus],
        to: CanaryStatus,
        reason: Option<&str>,
        completed_at: Option<DateTime<Utc>>,
    ) -> StoreResult<Option<CanaryRelease>> {
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let sql = format!(
            r#"
            UPDATE canary_releases
            SET status = $3,
                reason = COALESCE($4, reason),
                completed_at = COALESCE($5, completed_at)
            WHERE id = $1 AND status = ANY($2)
            RETURNING {}
            "#,
            RELEASE_COLUMNS
        );

        sqlx::query_as::<_, ReleaseRow>(&sql)
            .bind(id)
            .bind(from)
            .bind(to.as_str())
            .bind(reason)
            .bind(completed_at)
            .fetch_optional(&self.pool)
            .await?
            .map(CanaryRelease::try_from)
            .transpose()
    }

    async fn set_traffic(&self, id: Uuid, traffic_percentage: f64) -> StoreResult<Option<CanaryRelease>> {
        let sql = format!(
            r#"
            UPDATE canary_releases SET traffic_percentage = $2
            WHERE id = $1 AND status IN ('running', 'paused')
            RETURNING {}
            "#,
            RELEASE_COLUMNS
        );

        sqlx::query_as::<_, ReleaseRow>(&sql)
            .bind(id)
            .bind(traffic_percentage)
            .fetch_optional(&self.pool)
            .await?
            .map(CanaryRelease::try_from)
            .transpose()
    }

    async fn append_sample(&self, sample: &CanaryMetricSample) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO canary_samples (
                canary_id, timestamp, success_rate, error_rate,
                latency_p50_ms, latency_p95_ms, latency_p99_ms, request_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(sample.canary_id)
        .bind(sample.timestamp)
        .bind(sample.success_rate)
        .bind(sample.error_rate)
        .bind(sample.latency_p50_ms)
        .bind(sample.latency_p95_ms)
        .bind(sample.latency_p99_ms)
        .bind(i64::try_from(sample.request_count).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recent_samples(&self, canary_id: Uuid, limit: usize) -> StoreResult<Vec<CanaryMetricSample>> {
        let rows = sqlx::query_as::<_, SampleRow>(
            r#"
            SELECT canary_id, timestamp, success_rate, error_rate,
                   latency_p50_ms, latency_p95_ms, latency_p99_ms, request_count
            FROM canary_samples
            WHERE canary_id = $1
            ORDER BY id DESC
            LIMIT $2
            "#,
        )
        .bind(canary_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn count_samples(&self, canary_id: Uuid) -> StoreResult<usize> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM canary_samples WHERE canary_id = $1")
            .bind(canary_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.0.max(0) as usize)
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct ReleaseRow {
    id: Uuid,
    deployment_id: Uuid,
    project_id: String,
    stable_deployment_id: Uuid,
    traffic_percentage: f64,
    policy: serde_json::Value,
    status: String,
    reason: Option<String>,
    started_at: DateTime<Utc>,
    scheduled_end_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<ReleaseRow> for CanaryRelease {
    type Error = StoreError;

    fn try_from(row: ReleaseRow) -> Result<Self, Self::Error> {
        Ok(CanaryRelease {
            id: row.id,
            deployment_id: row.deployment_id,
            project_id: row.project_id,
            stable_deployment_id: row.stable_deployment_id,
            traffic_percentage: row.traffic_percentage,
            policy: serde_json::from_value(row.policy)
                .map_err(|e| StoreError::Corrupt(format!("policy: {}", e)))?,
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            reason: row.reason,
            started_at: row.started_at,
            scheduled_end_at: row.scheduled_end_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SampleRow {
    canary_id: Uuid,
    timestamp: DateTime<Utc>,
    success_rate: f64,
    error_rate: f64,
    latency_p50_ms: f64,
    latency_p95_ms: f64,
    latency_p99_ms: f64,
    request_count: i64,
}

impl From<SampleRow> for CanaryMetricSample {
    fn from(row: SampleRow) -> Self {
        CanaryMetricSample {
            canary_id: row.canary_id,
            timestamp: row.timestamp,
            success_rate: row.success_rate,
            error_rate: row.error_rate,
            latency_p50_ms: row.latency_p50_ms,
            latency_p95_ms: row.latency_p95_ms,
            latency_p99_ms: row.latency_p99_ms,
            request_count: row.request_count.max(0) as u64,
        }
    }
}
