//! Promotion request repository
//!
//! Owns the `artifact_promotion_approval_request` table. Two partial unique
//! indexes back the invariants: one pending request and one promotion per
//! (destination pipeline, artifact).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use promotion_core::domain::promotion::{
    NewPromotionRequest, PromotionRequest, PromotionStatus, SourceType,
};
use promotion_core::domain::{ArtifactId, PipelineId, PolicyId, RequestId, UserId};
use sqlx::PgPool;

use crate::error::{StoreError, StoreResult};

/// Persistence of promotion requests
#[async_trait]
pub trait RequestRepository: Send + Sync {
    /// The active AwaitingApproval request for a destination and artifact
    async fn find_awaited(
        &self,
        destination_pipeline_id: PipelineId,
        artifact_id: ArtifactId,
    ) -> StoreResult<Option<PromotionRequest>>;

    /// The Promoted request for a destination and artifact
    async fn find_promoted(
        &self,
        destination_pipeline_id: PipelineId,
        artifact_id: ArtifactId,
    ) -> StoreResult<Option<PromotionRequest>>;

    /// Inserts a new request
    ///
    /// Fails with `StoreError::Conflict` when a pending or promoted record for
    /// the same key already exists.
    async fn create(&self, request: NewPromotionRequest) -> StoreResult<PromotionRequest>;

    /// Compare-and-set on the current status
    ///
    /// Moving to Canceled or Superseded also clears the active flag.
    /// Fails with `StoreError::StaleStatus` if the stored status is not `from`.
    async fn update_status(
        &self,
        request_id: RequestId,
        from: PromotionStatus,
        to: PromotionStatus,
        actor: UserId,
        at: DateTime<Utc>,
    ) -> StoreResult<PromotionRequest>;

    async fn find_by_id(&self, request_id: RequestId) -> StoreResult<Option<PromotionRequest>>;

    /// Supersedes pending requests for the same key older than `keep_id`
    async fn supersede_older(
        &self,
        destination_pipeline_id: PipelineId,
        artifact_id: ArtifactId,
        keep_id: RequestId,
        actor: UserId,
        at: DateTime<Utc>,
    ) -> StoreResult<u64>;

    /// Supersedes every pending request raised under a policy
    async fn supersede_by_policy(
        &self,
        policy_id: PolicyId,
        actor: UserId,
        at: DateTime<Utc>,
    ) -> StoreResult<u64>;

    /// Pending requests for an artifact across all destinations
    async fn list_awaited_for_artifact(
        &self,
        artifact_id: ArtifactId,
    ) -> StoreResult<Vec<PromotionRequest>>;
}

pub(crate) const REQUEST_COLUMNS: &str = r#"
    id, source_type, source_pipeline_id, destination_pipeline_id, artifact_id, status,
    active, policy_id, policy_evaluation_audit_id, created_by, created_on, updated_by, updated_on
"#;

/// Postgres implementation of RequestRepository
#[derive(Clone)]
pub struct PgRequestRepository {
    pool: PgPool,
}

impl PgRequestRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RequestRepository for PgRequestRepository {
    async fn find_awaited(
        &self,
        destination_pipeline_id: PipelineId,
        artifact_id: ArtifactId,
    ) -> StoreResult<Option<PromotionRequest>> {
        let row = sqlx::query_as::<_, RequestRow>(&format!(
            r#"
            SELECT {REQUEST_COLUMNS}
            FROM artifact_promotion_approval_request
            WHERE destination_pipeline_id = $1 AND artifact_id = $2
              AND status = $3 AND active = true
            "#
        ))
        .bind(destination_pipeline_id)
        .bind(artifact_id)
        .bind(PromotionStatus::AwaitingApproval.as_db())
        .fetch_optional(&self.pool)
        .await?;

        row.map(PromotionRequest::try_from).transpose()
    }

    async fn find_promoted(
        &self,
        destination_pipeline_id: PipelineId,
        artifact_id: ArtifactId,
    ) -> StoreResult<Option<PromotionRequest>> {
        let row = sqlx::query_as::<_, RequestRow>(&format!(
            r#"
            SELECT {REQUEST_COLUMNS}
            FROM artifact_promotion_approval_request
            WHERE destination_pipeline_id = $1 AND artifact_id = $2 AND status = $3
            "#
        ))
        .bind(destination_pipeline_id)
        .bind(artifact_id)
        .bind(PromotionStatus::Promoted.as_db())
        .fetch_optional(&self.pool)
        .await?;

        row.map(PromotionRequest::try_from).transpose()
    }

    async fn create(&self, request: NewPromotionRequest) -> StoreResult<PromotionRequest> {
        if !PromotionStatus::can_transition(None, request.status) {
            return Err(StoreError::corrupt(format!(
                "requests cannot be created as {}",
                request.status
            )));
        }

        let result = sqlx::query_scalar::<_, RequestId>(
            r#"
            INSERT INTO artifact_promotion_approval_request (
                source_type, source_pipeline_id, destination_pipeline_id, artifact_id, status,
                active, policy_id, policy_evaluation_audit_id, created_by, created_on,
                updated_by, updated_on
            )
            VALUES ($1, $2, $3, $4, $5, true, $6, $7, $8, $9, $8, $9)
            RETURNING id
            "#,
        )
        .bind(request.source_type.as_db())
        .bind(request.source_pipeline_id)
        .bind(request.destination_pipeline_id)
        .bind(request.artifact_id)
        .bind(request.status.as_db())
        .bind(request.policy_id)
        .bind(request.policy_evaluation_audit_id)
        .bind(request.created_by)
        .bind(request.created_on)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(id) => Ok(request.into_record(id)),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::Conflict(format!(
                    "request for artifact {} on pipeline {} already exists",
                    request.artifact_id, request.destination_pipeline_id
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_status(
        &self,
        request_id: RequestId,
        from: PromotionStatus,
        to: PromotionStatus,
        actor: UserId,
        at: DateTime<Utc>,
    ) -> StoreResult<PromotionRequest> {
        if !PromotionStatus::can_transition(Some(from), to) {
            return Err(StoreError::InvalidTransition { from, to });
        }
        let deactivate = matches!(to, PromotionStatus::Canceled | PromotionStatus::Superseded);

        let row = sqlx::query_as::<_, RequestRow>(&format!(
            r#"
            UPDATE artifact_promotion_approval_request
            SET status = $1,
                active = CASE WHEN $2 THEN false ELSE active END,
                updated_by = $3,
                updated_on = $4
            WHERE id = $5 AND status = $6 AND active = true
            RETURNING {REQUEST_COLUMNS}
            "#
        ))
        .bind(to.as_db())
        .bind(deactivate)
        .bind(actor)
        .bind(at)
        .bind(request_id)
        .bind(from.as_db())
        .fetch_optional(&self.pool)
        .await;

        match row {
            Ok(Some(row)) => row.try_into(),
            Ok(None) => match self.find_by_id(request_id).await? {
                Some(_) => Err(StoreError::StaleStatus {
                    id: request_id,
                    expected: from,
                }),
                None => Err(StoreError::NotFound(format!("promotion request {request_id}"))),
            },
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(StoreError::Conflict(
                format!("request {request_id} collides with an existing promotion"),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_by_id(&self, request_id: RequestId) -> StoreResult<Option<PromotionRequest>> {
        let row = sqlx::query_as::<_, RequestRow>(&format!(
            "SELECT {REQUEST_COLUMNS} FROM artifact_promotion_approval_request WHERE id = $1"
        ))
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PromotionRequest::try_from).transpose()
    }

    async fn supersede_older(
        &self,
        destination_pipeline_id: PipelineId,
        artifact_id: ArtifactId,
        keep_id: RequestId,
        actor: UserId,
        at: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE artifact_promotion_approval_request
            SET status = $1, active = false, updated_by = $2, updated_on = $3
            WHERE destination_pipeline_id = $4 AND artifact_id = $5
              AND status = $6 AND active = true AND id < $7
            "#,
        )
        .bind(PromotionStatus::Superseded.as_db())
        .bind(actor)
        .bind(at)
        .bind(destination_pipeline_id)
        .bind(artifact_id)
        .bind(PromotionStatus::AwaitingApproval.as_db())
        .bind(keep_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn supersede_by_policy(
        &self,
        policy_id: PolicyId,
        actor: UserId,
        at: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE artifact_promotion_approval_request
            SET status = $1, active = false, updated_by = $2, updated_on = $3
            WHERE policy_id = $4 AND status = $5 AND active = true
            "#,
        )
        .bind(PromotionStatus::Superseded.as_db())
        .bind(actor)
        .bind(at)
        .bind(policy_id)
        .bind(PromotionStatus::AwaitingApproval.as_db())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn list_awaited_for_artifact(
        &self,
        artifact_id: ArtifactId,
    ) -> StoreResult<Vec<PromotionRequest>> {
        let rows = sqlx::query_as::<_, RequestRow>(&format!(
            r#"
            SELECT {REQUEST_COLUMNS}
            FROM artifact_promotion_approval_request
            WHERE artifact_id = $1 AND status = $2 AND active = true
            ORDER BY id ASC
            "#
        ))
        .bind(artifact_id)
        .bind(PromotionStatus::AwaitingApproval.as_db())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PromotionRequest::try_from).collect()
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
pub(crate) struct RequestRow {
    id: RequestId,
    source_type: i32,
    source_pipeline_id: PipelineId,
    destination_pipeline_id: PipelineId,
    artifact_id: ArtifactId,
    status: i32,
    active: bool,
    policy_id: PolicyId,
    policy_evaluation_audit_id: Option<i32>,
    created_by: UserId,
    created_on: DateTime<Utc>,
    updated_by: UserId,
    updated_on: DateTime<Utc>,
}

impl TryFrom<RequestRow> for PromotionRequest {
    type Error = StoreError;

    fn try_from(row: RequestRow) -> Result<Self, Self::Error> {
        let status = PromotionStatus::try_from(row.status)
            .map_err(|e| StoreError::corrupt(format!("request {}: {e}", row.id)))?;
        let source_type = SourceType::try_from(row.source_type)
            .map_err(|e| StoreError::corrupt(format!("request {}: {e}", row.id)))?;

        Ok(PromotionRequest {
            id: row.id,
            source_type,
            source_pipeline_id: row.source_pipeline_id,
            destination_pipeline_id: row.destination_pipeline_id,
            artifact_id: row.artifact_id,
            status,
            active: row.active,
            policy_id: row.policy_id,
            policy_evaluation_audit_id: row.policy_evaluation_audit_id,
            created_by: row.created_by,
            created_on: row.created_on,
            updated_by: row.updated_by,
            updated_on: row.updated_on,
        })
    }
}
