//! Deployment Repository

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cygni_core::domain::deployment::{Deployment, DeploymentStatus};
use sqlx::PgPool;
use uuid::Uuid;

use super::{StoreError, StoreResult};

#[async_trait]
pub trait DeploymentStore: Send + Sync {
    async fn insert(&self, deployment: &Deployment) -> StoreResult<()>;

    async fn find(&self, id: Uuid) -> StoreResult<Option<Deployment>>;

    /// Newest first
    async fn list_by_project(&self, project_id: &str) -> StoreResult<Vec<Deployment>>;

    async fn list_by_build(&self, build_id: Uuid) -> StoreResult<Vec<Deployment>>;

    /// Most recent active deployment of a project environment, other than `exclude`
    async fn latest_active(
        &self,
        project_id: &str,
        environment_id: &str,
        exclude: Uuid,
    ) -> StoreResult<Option<Deployment>>;

    /// Sets `to` only when the current status is one of `from`
    async fn transition(
        &self,
        id: Uuid,
        from: &[DeploymentStatus],
        to: DeploymentStatus,
        reason: Option<&str>,
    ) -> StoreResult<Option<Deployment>>;

    /// Removes every deployment of a build, with their canary releases
    async fn delete_by_build(&self, build_id: Uuid) -> StoreResult<u64>;
}

// =============================================================================
// Postgres
// =============================================================================

const DEPLOYMENT_COLUMNS: &str =
    "id, project_id, environment_id, build_id, image_ref, status, reason, metadata, created_at, updated_at";

pub struct PgDeploymentStore {
    pool: PgPool,
}

impl PgDeploymentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeploymentStore for PgDeploymentStore {
    async fn insert(&self, deployment: &Deployment) -> StoreResult<()> {
        let metadata = serde_json::to_value(&deployment.metadata)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO deployments (
                id, project_id, environment_id, build_id, image_ref,
                status, reason, metadata, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(deployment.id)
        .bind(&deployment.project_id)
        .bind(&deployment.environment_id)
        .bind(deployment.build_id)
        .bind(&deployment.image_ref)
        .bind(deployment.status.as_str())
        .bind(&deployment.reason)
        .bind(metadata)
        .bind(deployment.created_at)
        .bind(deployment.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find(&self, id: Uuid) -> StoreResult<Option<Deployment>> {
        let sql = format!("SELECT {} FROM deployments WHERE id = $1", DEPLOYMENT_COLUMNS);
        sqlx::query_as::<_, DeploymentRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Deployment::try_from)
            .transpose()
    }

    async fn list_by_project(&self, project_id: &str) -> StoreResult<Vec<Deployment>> {
        let sql = format!(
            "SELECT {} FROM deployments WHERE project_id = $1 ORDER BY created_at DESC",
            DEPLOYMENT_COLUMNS
        );
        let rows = sqlx::query_as::<_, DeploymentRow>(&sql)
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Deployment::try_from).collect()
    }

    async fn list_by_build(&self, build_id: Uuid) -> StoreResult<Vec<Deployment>> {
        let sql = format!(
            "SELECT {} FROM deployments WHERE build_id = $1 ORDER BY created_at DESC",
            DEPLOYMENT_COLUMNS
        );
        let rows = sqlx::query_as::<_, DeploymentRow>(&sql)
            .bind(build_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Deployment::try_from).collect()
    }

    async fn latest_active(
        &self,
        project_id: &str,
        environment_id: &str,
        exclude: Uuid,
    ) -> StoreResult<Option<Deployment>> {
        let sql = format!(
            r#"
            SELECT {} FROM deployments
            WHERE project_id = $1 AND environment_id = $2 AND status = 'active' AND id <> $3
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            DEPLOYMENT_COLUMNS
        );
        sqlx::query_as::<_, DeploymentRow>(&sql)
            .bind(project_id)
            .bind(environment_id)
            .bind(exclude)
            .fetch_optional(&self.pool)
            .await?
            .map(Deployment::try_from)
            .transpose()
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[DeploymentStatus],
        to: DeploymentStatus,
        reason: Option<&str>,
    ) -> StoreResult<Option<Deployment>> {
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let sql = format!(
            r#"
            UPDATE deployments
            SET status = $3, reason = COALESCE($4, reason), updated_at = $5
            WHERE id = $1 AND status = ANY($2)
            RETURNING {}
            "#,
            DEPLOYMENT_COLUMNS
        );

        sqlx::query_as::<_, DeploymentRow>(&sql)
            .bind(id)
            .bind(from)
            .bind(to.as_str())
            .bind(reason)
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await?
            .map(Deployment::try_from)
            .transpose()
    }

    async fn delete_by_build(&self, build_id: Uuid) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM deployments WHERE build_id = $1")
            .bind(build_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct DeploymentRow {
    id: Uuid,
    project_id: String,
    environment_id: String,
    build_id: Uuid,
    image_ref: String,
    status: String,
    reason: Option<String>,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DeploymentRow> for Deployment {
    type Error = StoreError;

    fn try_from(row: DeploymentRow) -> Result<Self, Self::Error> {
        Ok(Deployment {
            id: row.id,
            project_id: row.project_id,
            environment_id: row.environment_id,
            build_id: row.build_id,
            image_ref: row.image_ref,
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            reason: row.reason,
            metadata: serde_json::from_value(row.metadata).unwrap_or_default(),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
