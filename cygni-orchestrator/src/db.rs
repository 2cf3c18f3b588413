use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Create builds table (also the job queue)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS builds (
            id UUID PRIMARY KEY,
            project_id VARCHAR(255) NOT NULL,
            repository TEXT NOT NULL,
            commit_sha VARCHAR(255) NOT NULL,
            branch VARCHAR(255),
            context_location TEXT NOT NULL,
            manifest_path TEXT NOT NULL,
            build_args JSONB NOT NULL DEFAULT '{}',
            environment_id VARCHAR(255) NOT NULL,
            canary_policy JSONB,
            status VARCHAR(50) NOT NULL,
            image_ref TEXT,
            failure_reason TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            worker_id VARCHAR(255),
            lease_token UUID,
            lease_expires_at TIMESTAMPTZ,
            available_at TIMESTAMPTZ NOT NULL,
            cancel_requested BOOLEAN NOT NULL DEFAULT FALSE,
            requested_at TIMESTAMPTZ NOT NULL,
            started_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create logs table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS build_logs (
            id BIGSERIAL PRIMARY KEY,
            build_id UUID NOT NULL REFERENCES builds(id) ON DELETE CASCADE,
            timestamp TIMESTAMPTZ NOT NULL,
            level VARCHAR(20) NOT NULL,
            message TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Deployments keep their build; RESTRICT makes the service delete them first
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS deployments (
            id UUID PRIMARY KEY,
            project_id VARCHAR(255) NOT NULL,
            environment_id VARCHAR(255) NOT NULL,
            build_id UUID NOT NULL REFERENCES builds(id) ON DELETE RESTRICT,
            image_ref TEXT NOT NULL,
            status VARCHAR(50) NOT NULL,
            reason TEXT,
            metadata JSONB NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS canary_releases (
            id UUID PRIMARY KEY,
            deployment_id UUID NOT NULL REFERENCES deployments(id) ON DELETE CASCADE,
            project_id VARCHAR(255) NOT NULL,
            stable_deployment_id UUID NOT NULL,
            traffic_percentage DOUBLE PRECISION NOT NULL,
            policy JSONB NOT NULL,
            status VARCHAR(50) NOT NULL,
            reason TEXT,
            started_at TIMESTAMPTZ NOT NULL,
            scheduled_end_at TIMESTAMPTZ NOT NULL,
            completed_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS canary_samples (
            id BIGSERIAL PRIMARY KEY,
            canary_id UUID NOT NULL REFERENCES canary_releases(id) ON DELETE CASCADE,
            timestamp TIMESTAMPTZ NOT NULL,
            success_rate DOUBLE PRECISION NOT NULL,
            error_rate DOUBLE PRECISION NOT NULL,
            latency_p50_ms DOUBLE PRECISION NOT NULL,
            latency_p95_ms DOUBLE PRECISION NOT NULL,
            latency_p99_ms DOUBLE PRECISION NOT NULL,
            request_count BIGINT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes for better query performance
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_builds_queue ON builds(status, available_at, requested_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_builds_project_id ON builds(project_id)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_build_logs_build_id ON build_logs(build_id, id)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_deployments_project ON deployments(project_id, environment_id, created_at DESC)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_deployments_build_id ON deployments(build_id)")
        .execute(pool)
        .await?;

    // At most one running or paused canary per deployment
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_canary_one_active
        ON canary_releases(deployment_id)
        WHERE status IN ('running', 'paused')
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_canary_samples_canary ON canary_samples(canary_id, timestamp DESC)",
    )
    .execute(pool)
    .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
