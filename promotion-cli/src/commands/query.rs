//! Query command handlers
//!
//! Read-only views over promotion state.

use std::collections::BTreeMap;

use anyhow::Result;
use promotion_core::domain::{ArtifactId, EnvironmentId, RequestId, UserId, WorkflowId};

use crate::config::Config;
use crate::output;

pub async fn show(config: &Config, request_id: RequestId) -> Result<()> {
    let dispatcher = config.connect().await?;
    let details = dispatcher.coordinator().get_request(request_id).await?;
    output::print_request(&details, config.json)
}

pub async fn targets(
    config: &Config,
    workflow_id: WorkflowId,
    artifact_id: Option<ArtifactId>,
    authorized: &BTreeMap<String, EnvironmentId>,
) -> Result<()> {
    let dispatcher = config.connect().await?;
    let targets = dispatcher
        .coordinator()
        .promotion_targets(workflow_id, artifact_id, authorized)
        .await?;
    output::print_targets(&targets, config.json)
}

pub async fn eligibility(
    config: &Config,
    artifact_id: ArtifactId,
    environment: Option<&str>,
    user_id: UserId,
) -> Result<()> {
    let dispatcher = config.connect().await?;
    let eligibility = dispatcher
        .coordinator()
        .approval_eligibility(artifact_id, environment, user_id)
        .await?;
    output::print_eligibility(&eligibility, config.json)
}
