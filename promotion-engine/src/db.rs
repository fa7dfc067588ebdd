use sqlx::{PgPool, postgres::PgPoolOptions};

use crate::config::Config;

pub async fn create_pool(config: &Config) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(&config.database_url)
        .await
}

/// Creates the tables owned by the engine.
///
/// Workflow, pipeline, environment, artifact, deployment and policy tables
/// belong to other services and are only read.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Status: 0=Promoted, 1=Canceled, 2=AwaitingApproval, 3=Superseded
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS artifact_promotion_approval_request (
            id SERIAL PRIMARY KEY,
            source_type INTEGER NOT NULL,
            source_pipeline_id INTEGER NOT NULL,
            destination_pipeline_id INTEGER NOT NULL,
            artifact_id INTEGER NOT NULL,
            status INTEGER NOT NULL,
            active BOOLEAN NOT NULL DEFAULT TRUE,
            policy_id INTEGER NOT NULL,
            policy_evaluation_audit_id INTEGER,
            created_by INTEGER NOT NULL,
            created_on TIMESTAMPTZ NOT NULL,
            updated_by INTEGER NOT NULL,
            updated_on TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one pending request per destination and artifact
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS uq_promotion_request_awaiting
        ON artifact_promotion_approval_request (destination_pipeline_id, artifact_id)
        WHERE active AND status = 2
        "#,
    )
    .execute(pool)
    .await?;

    // At most one promotion per destination and artifact
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS uq_promotion_request_promoted
        ON artifact_promotion_approval_request (destination_pipeline_id, artifact_id)
        WHERE status = 0
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_promotion_request_artifact ON artifact_promotion_approval_request(artifact_id, status)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_promotion_request_policy ON artifact_promotion_approval_request(policy_id, status)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS deployment_approval_user_data (
            id SERIAL PRIMARY KEY,
            request_id INTEGER NOT NULL REFERENCES artifact_promotion_approval_request(id) ON DELETE CASCADE,
            user_id INTEGER NOT NULL,
            created_on TIMESTAMPTZ NOT NULL,
            UNIQUE (request_id, user_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
