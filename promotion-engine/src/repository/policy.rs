//! Policy oracle
//!
//! Resolves the promotion policy governing an (application, environment)
//! pair. Policies are stored as JSON documents by the policy service and
//! attached to scopes through qualifier mappings.

use async_trait::async_trait;
use promotion_core::domain::policy::{PolicyDocument, PromotionPolicy};
use promotion_core::domain::{AppId, EnvironmentId, PolicyId};
use sqlx::PgPool;

use crate::error::{StoreError, StoreResult};

/// Resource type of promotion policies in the qualifier mapping table
const PROMOTION_POLICY_RESOURCE_TYPE: i32 = 6;

/// Lookup of the policy governing a destination
#[async_trait]
pub trait PolicyOracle: Send + Sync {
    /// Returns `None` when no policy is configured for the destination
    async fn policy_for(
        &self,
        app_id: AppId,
        environment_id: EnvironmentId,
    ) -> StoreResult<Option<PromotionPolicy>>;
}

/// Postgres implementation of PolicyOracle
#[derive(Clone)]
pub struct PgPolicyOracle {
    pool: PgPool,
}

impl PgPolicyOracle {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PolicyOracle for PgPolicyOracle {
    async fn policy_for(
        &self,
        app_id: AppId,
        environment_id: EnvironmentId,
    ) -> StoreResult<Option<PromotionPolicy>> {
        let row = sqlx::query_as::<_, PolicyRow>(
            r#"
            SELECT gp.id, gp.name, gp.policy_json
            FROM resource_qualifier_mapping rqm
            JOIN global_policy gp ON gp.id = rqm.resource_id
            WHERE rqm.resource_type = $1
              AND rqm.app_id = $2
              AND rqm.environment_id = $3
              AND rqm.active = true
              AND gp.deleted = false
            ORDER BY rqm.id DESC
            LIMIT 1
            "#,
        )
        .bind(PROMOTION_POLICY_RESOURCE_TYPE)
        .bind(app_id)
        .bind(environment_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            tracing::debug!(
                "No promotion policy for app {} env {}",
                app_id,
                environment_id
            );
            return Ok(None);
        };

        let document: PolicyDocument = serde_json::from_str(&row.policy_json).map_err(|e| {
            StoreError::corrupt(format!("policy {} has an invalid document: {e}", row.id))
        })?;

        Ok(Some(document.into_policy(row.id, row.name, None)))
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct PolicyRow {
    id: PolicyId,
    name: String,
    policy_json: String,
}
