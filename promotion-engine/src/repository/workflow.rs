//! Workflow repository
//!
//! Loads workflow DAGs from the flat mapping table kept by the pipeline
//! configuration service. Every call returns a fresh snapshot.

use async_trait::async_trait;
use promotion_core::domain::workflow::{
    EnvironmentRef, PipelineKind, PipelineNode, PipelinePlacement, WorkflowEdge, WorkflowGraph,
};
use promotion_core::domain::{AppId, EnvironmentId, PipelineId, WorkflowId};
use sqlx::PgPool;
use std::collections::HashMap;

use crate::error::{StoreError, StoreResult};

/// Read access to workflow graphs and CD pipeline placement
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    /// Loads an immutable snapshot of a workflow
    ///
    /// Returns `None` when the workflow does not exist.
    async fn load_graph(&self, workflow_id: WorkflowId) -> StoreResult<Option<WorkflowGraph>>;

    /// Finds the application, environment and workflow of a CD pipeline
    async fn find_placement(&self, pipeline_id: PipelineId)
    -> StoreResult<Option<PipelinePlacement>>;
}

/// Postgres implementation of WorkflowRepository
#[derive(Clone)]
pub struct PgWorkflowRepository {
    pool: PgPool,
}

impl PgWorkflowRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkflowRepository for PgWorkflowRepository {
    async fn load_graph(&self, workflow_id: WorkflowId) -> StoreResult<Option<WorkflowGraph>> {
        let app_id = sqlx::query_scalar::<_, AppId>(
            "SELECT app_id FROM app_workflow WHERE id = $1 AND active = true",
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(app_id) = app_id else {
            return Ok(None);
        };

        let rows = sqlx::query_as::<_, MappingRow>(
            r#"
            SELECT component_id, type, parent_id, parent_type
            FROM app_workflow_mapping
            WHERE app_workflow_id = $1 AND active = true
            ORDER BY id ASC
            "#,
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

        let cd_ids: Vec<PipelineId> = rows
            .iter()
            .filter(|row| row.component_type == "CD_PIPELINE")
            .map(|row| row.component_id)
            .collect();

        let environments: HashMap<PipelineId, EnvironmentRef> =
            sqlx::query_as::<_, PipelineEnvironmentRow>(
                r#"
                SELECT p.id AS pipeline_id, e.id AS environment_id, e.environment_name
                FROM pipeline p
                JOIN environment e ON e.id = p.environment_id
                WHERE p.id = ANY($1) AND p.deleted = false
                "#,
            )
            .bind(&cd_ids)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|row| {
                (
                    row.pipeline_id,
                    EnvironmentRef {
                        id: row.environment_id,
                        name: row.environment_name,
                    },
                )
            })
            .collect();

        let mut nodes = Vec::with_capacity(rows.len());
        let mut edges = Vec::new();
        for row in &rows {
            let kind = mapping_kind(&row.component_type)?;
            let node = match kind {
                PipelineKind::Cd => {
                    let environment = environments.get(&row.component_id).cloned().ok_or_else(
                        || StoreError::corrupt(format!("CD pipeline {} has no environment", row.component_id)),
                    )?;
                    PipelineNode {
                        id: row.component_id,
                        kind,
                        environment: Some(environment),
                        workflow_id,
                    }
                }
                _ => PipelineNode::producer(row.component_id, kind, workflow_id),
            };
            nodes.push(node);

            // parent_id 0 marks the workflow root
            if row.parent_id != 0 {
                let parent_kind = row
                    .parent_type
                    .as_deref()
                    .map(mapping_kind)
                    .transpose()?
                    .ok_or_else(|| {
                        StoreError::corrupt(format!(
                            "mapping for component {} has a parent without a type",
                            row.component_id
                        ))
                    })?;
                edges.push(WorkflowEdge {
                    parent_id: row.parent_id,
                    parent_kind,
                    child_id: row.component_id,
                    child_kind: kind,
                });
            }
        }

        let graph = WorkflowGraph::build(workflow_id, app_id, nodes, &edges)?;
        tracing::debug!(
            "Loaded workflow {} with {} CD pipelines",
            workflow_id,
            graph.cd_nodes().count()
        );
        Ok(Some(graph))
    }

    async fn find_placement(
        &self,
        pipeline_id: PipelineId,
    ) -> StoreResult<Option<PipelinePlacement>> {
        let row = sqlx::query_as::<_, PlacementRow>(
            r#"
            SELECT p.id AS pipeline_id, p.app_id, e.id AS environment_id, e.environment_name,
                   awm.app_workflow_id
            FROM pipeline p
            JOIN environment e ON e.id = p.environment_id
            JOIN app_workflow_mapping awm
              ON awm.component_id = p.id AND awm.type = 'CD_PIPELINE' AND awm.active = true
            WHERE p.id = $1 AND p.deleted = false
            "#,
        )
        .bind(pipeline_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn mapping_kind(value: &str) -> StoreResult<PipelineKind> {
    PipelineKind::from_mapping_type(value)
        .ok_or_else(|| StoreError::corrupt(format!("unknown workflow component type '{value}'")))
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct MappingRow {
    component_id: PipelineId,
    #[sqlx(rename = "type")]
    component_type: String,
    parent_id: PipelineId,
    parent_type: Option<String>,
}

#[derive(sqlx::FromRow)]
struct PipelineEnvironmentRow {
    pipeline_id: PipelineId,
    environment_id: EnvironmentId,
    environment_name: String,
}

#[derive(sqlx::FromRow)]
struct PlacementRow {
    pipeline_id: PipelineId,
    app_id: AppId,
    environment_id: EnvironmentId,
    environment_name: String,
    app_workflow_id: WorkflowId,
}

impl From<PlacementRow> for PipelinePlacement {
    fn from(row: PlacementRow) -> Self {
        PipelinePlacement {
            pipeline_id: row.pipeline_id,
            app_id: row.app_id,
            environment: EnvironmentRef {
                id: row.environment_id,
                name: row.environment_name,
            },
            workflow_id: row.app_workflow_id,
        }
    }
}
