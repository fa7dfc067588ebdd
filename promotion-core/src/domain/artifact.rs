//! Artifact domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ArtifactId, PipelineId, UserId};

/// Immutable build output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    /// CI or webhook pipeline that produced the artifact
    pub origin_pipeline_id: PipelineId,
    /// User who triggered the build; may never approve its promotion
    pub created_by: UserId,
    pub created_on: DateTime<Utc>,
}

/// One deployment of an artifact on a CD pipeline
///
/// Append-only, written by the deployment subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub artifact_id: ArtifactId,
    pub pipeline_id: PipelineId,
    pub deployed_at: DateTime<Utc>,
}
