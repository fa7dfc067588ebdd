//! Artifact repository
//!
//! Read-only view of build artifacts and their deployment history.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use promotion_core::domain::artifact::Artifact;
use promotion_core::domain::{ArtifactId, PipelineId, UserId};
use sqlx::PgPool;

use crate::error::StoreResult;

/// Read access to artifacts and deployments
#[async_trait]
pub trait ArtifactRepository: Send + Sync {
    async fn get_artifact(&self, artifact_id: ArtifactId) -> StoreResult<Option<Artifact>>;

    /// Whether the artifact was successfully deployed by the CD pipeline
    async fn was_deployed_at(
        &self,
        artifact_id: ArtifactId,
        pipeline_id: PipelineId,
    ) -> StoreResult<bool>;
}

/// Postgres implementation of ArtifactRepository
#[derive(Clone)]
pub struct PgArtifactRepository {
    pool: PgPool,
}

impl PgArtifactRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ArtifactRepository for PgArtifactRepository {
    async fn get_artifact(&self, artifact_id: ArtifactId) -> StoreResult<Option<Artifact>> {
        // Webhook artifacts carry their producer in external_ci_pipeline_id
        let row = sqlx::query_as::<_, ArtifactRow>(
            r#"
            SELECT id, pipeline_id, external_ci_pipeline_id, created_by, created_on
            FROM ci_artifact
            WHERE id = $1
            "#,
        )
        .bind(artifact_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn was_deployed_at(
        &self,
        artifact_id: ArtifactId,
        pipeline_id: PipelineId,
    ) -> StoreResult<bool> {
        let deployed = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM cd_workflow cw
                JOIN cd_workflow_runner cwr ON cwr.cd_workflow_id = cw.id
                WHERE cw.ci_artifact_id = $1
                  AND cw.pipeline_id = $2
                  AND cwr.workflow_type = 'DEPLOY'
                  AND cwr.status IN ('Succeeded', 'Healthy')
            )
            "#,
        )
        .bind(artifact_id)
        .bind(pipeline_id)
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(
            "Artifact {} deployed at pipeline {}: {}",
            artifact_id,
            pipeline_id,
            deployed
        );
        Ok(deployed)
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct ArtifactRow {
    id: ArtifactId,
    pipeline_id: Option<PipelineId>,
    external_ci_pipeline_id: Option<PipelineId>,
    created_by: UserId,
    created_on: DateTime<Utc>,
}

impl From<ArtifactRow> for Artifact {
    fn from(row: ArtifactRow) -> Self {
        let origin_pipeline_id = row
            .pipeline_id
            .filter(|id| *id > 0)
            .or(row.external_ci_pipeline_id)
            .unwrap_or_default();

        Artifact {
            id: row.id,
            origin_pipeline_id,
            created_by: row.created_by,
            created_on: row.created_on,
        }
    }
}
