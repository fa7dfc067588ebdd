//! Approval ledger
//!
//! Owns `deployment_approval_user_data`. The composite `record_and_promote`
//! writes the approval, counts the ledger and flips the request to Promoted
//! inside one transaction holding a row lock on the request.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use promotion_core::domain::approval::{Approval, ApprovalProgress, ApprovalRecord};
use promotion_core::domain::policy::PromotionPolicy;
use promotion_core::domain::promotion::{PromotionRequest, PromotionStatus};
use promotion_core::domain::{RequestId, UserId};
use sqlx::{PgPool, Postgres, Transaction};

use super::request::{REQUEST_COLUMNS, RequestRow};
use crate::error::{StoreError, StoreResult};

/// Record of who approved which promotion request
#[async_trait]
pub trait ApprovalLedger: Send + Sync {
    /// Records an approval
    ///
    /// Returns `Ineligible` when the request is no longer pending and
    /// `Duplicate` when the user already approved it.
    async fn record(
        &self,
        request_id: RequestId,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> StoreResult<ApprovalRecord>;

    /// Number of distinct approvers
    async fn count(&self, request_id: RequestId) -> StoreResult<u64>;

    /// All approvals of a request, oldest first
    async fn approvals(&self, request_id: RequestId) -> StoreResult<Vec<Approval>>;

    async fn quorum_reached(
        &self,
        request_id: RequestId,
        policy: &PromotionPolicy,
    ) -> StoreResult<bool> {
        let count = self.count(request_id).await?;
        Ok(policy.quorum_reached(count))
    }

    /// Records an approval and, once `required_approvers` distinct approvals
    /// exist, moves the request from AwaitingApproval to Promoted.
    ///
    /// All steps commit together or not at all.
    async fn record_and_promote(
        &self,
        request_id: RequestId,
        user_id: UserId,
        at: DateTime<Utc>,
        required_approvers: u32,
    ) -> StoreResult<ApprovalProgress>;
}

/// Postgres implementation of ApprovalLedger
#[derive(Clone)]
pub struct PgApprovalLedger {
    pool: PgPool,
}

impl PgApprovalLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock_request(
        tx: &mut Transaction<'_, Postgres>,
        request_id: RequestId,
    ) -> StoreResult<PromotionRequest> {
        let row = sqlx::query_as::<_, RequestRow>(&format!(
            "SELECT {REQUEST_COLUMNS} FROM artifact_promotion_approval_request WHERE id = $1 FOR UPDATE"
        ))
        .bind(request_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("promotion request {request_id}")))?;

        row.try_into()
    }

    async fn insert_approval(
        tx: &mut Transaction<'_, Postgres>,
        request_id: RequestId,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> StoreResult<ApprovalRecord> {
        let result = sqlx::query(
            r#"
            INSERT INTO deployment_approval_user_data (request_id, user_id, created_on)
            VALUES ($1, $2, $3)
            ON CONFLICT (request_id, user_id) DO NOTHING
            "#,
        )
        .bind(request_id)
        .bind(user_id)
        .bind(at)
        .execute(&mut **tx)
        .await?;

        Ok(if result.rows_affected() == 0 {
            ApprovalRecord::Duplicate
        } else {
            ApprovalRecord::Added
        })
    }

    async fn count_in(tx: &mut Transaction<'_, Postgres>, request_id: RequestId) -> StoreResult<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM deployment_approval_user_data WHERE request_id = $1",
        )
        .bind(request_id)
        .fetch_one(&mut **tx)
        .await?;

        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl ApprovalLedger for PgApprovalLedger {
    async fn record(
        &self,
        request_id: RequestId,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> StoreResult<ApprovalRecord> {
        let mut tx = self.pool.begin().await?;
        let request = Self::lock_request(&mut tx, request_id).await?;
        if !request.is_awaiting() {
            return Ok(ApprovalRecord::Ineligible);
        }
        let record = Self::insert_approval(&mut tx, request_id, user_id, at).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn count(&self, request_id: RequestId) -> StoreResult<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM deployment_approval_user_data WHERE request_id = $1",
        )
        .bind(request_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as u64)
    }

    async fn approvals(&self, request_id: RequestId) -> StoreResult<Vec<Approval>> {
        let rows = sqlx::query_as::<_, ApprovalRow>(
            r#"
            SELECT request_id, user_id, created_on
            FROM deployment_approval_user_data
            WHERE request_id = $1
            ORDER BY created_on ASC, id ASC
            "#,
        )
        .bind(request_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn record_and_promote(
        &self,
        request_id: RequestId,
        user_id: UserId,
        at: DateTime<Utc>,
        required_approvers: u32,
    ) -> StoreResult<ApprovalProgress> {
        let mut tx = self.pool.begin().await?;

        let request = Self::lock_request(&mut tx, request_id).await?;
        if !request.is_awaiting() {
            let approvals = Self::count_in(&mut tx, request_id).await?;
            return Ok(ApprovalProgress {
                record: ApprovalRecord::Ineligible,
                approvals,
                status: request.status,
            });
        }

        let record = Self::insert_approval(&mut tx, request_id, user_id, at).await?;
        let approvals = Self::count_in(&mut tx, request_id).await?;

        let mut status = request.status;
        if approvals >= u64::from(required_approvers) {
            let promoted = sqlx::query(
                r#"
                UPDATE artifact_promotion_approval_request
                SET status = $1, updated_by = $2, updated_on = $3
                WHERE id = $4 AND status = $5 AND active = true
                "#,
            )
            .bind(PromotionStatus::Promoted.as_db())
            .bind(user_id)
            .bind(at)
            .bind(request_id)
            .bind(PromotionStatus::AwaitingApproval.as_db())
            .execute(&mut *tx)
            .await;

            match promoted {
                Ok(result) if result.rows_affected() == 1 => status = PromotionStatus::Promoted,
                Ok(_) => {
                    return Err(StoreError::StaleStatus {
                        id: request_id,
                        expected: PromotionStatus::AwaitingApproval,
                    });
                }
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    return Err(StoreError::Conflict(format!(
                        "artifact {} is already promoted on pipeline {}",
                        request.artifact_id, request.destination_pipeline_id
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }

        tx.commit().await?;

        Ok(ApprovalProgress {
            record,
            approvals,
            status,
        })
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct ApprovalRow {
    request_id: RequestId,
    user_id: UserId,
    created_on: DateTime<Utc>,
}

impl From<ApprovalRow> for Approval {
    fn from(row: ApprovalRow) -> Self {
        Approval {
            request_id: row.request_id,
            user_id: row.user_id,
            created_on: row.created_on,
        }
    }
}
