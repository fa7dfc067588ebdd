//! Read-only views over promotion state
//!
//! These never write. They back the promote dialog (which environments can
//! an artifact go to) and the approval inbox (which pending requests may the
//! caller approve).

use std::collections::BTreeMap;

use promotion_core::domain::outcome::PromotionOutcome;
use promotion_core::domain::{ArtifactId, EnvironmentId, RequestId, UserId, WorkflowId};
use promotion_core::dto::promotion::{ApprovalEligibility, PromotionTarget, RequestDetails};

use super::Coordinator;
use crate::error::{PromotionError, Result};

impl Coordinator {
    /// Evaluates every CD environment of a workflow as a promotion target
    ///
    /// Without an artifact only authorization and policy are checked.
    pub async fn promotion_targets(
        &self,
        workflow_id: WorkflowId,
        artifact_id: Option<ArtifactId>,
        authorized: &BTreeMap<String, EnvironmentId>,
    ) -> Result<Vec<PromotionTarget>> {
        let graph = self
            .repos
            .workflows
            .load_graph(workflow_id)
            .await?
            .ok_or_else(|| PromotionError::NotFound(format!("workflow {workflow_id}")))?;

        let artifact = match artifact_id {
            Some(id) => Some(self.load_artifact(id).await?),
            None => None,
        };

        let mut targets = Vec::new();
        for node_id in graph.cd_nodes() {
            let node = graph.node(node_id);
            let Some(environment) = node.environment.as_ref() else {
                continue;
            };

            let mut target = PromotionTarget {
                environment: environment.name.clone(),
                environment_id: environment.id,
                pipeline_id: node.id,
                policy_id: None,
                required_approvers: None,
                outcome: PromotionOutcome::Empty,
                message: String::new(),
                promotion_possible: false,
            };

            if !authorized.values().any(|&id| id == environment.id) {
                target.outcome = PromotionOutcome::NoPermission;
            } else {
                match self
                    .repos
                    .policies
                    .policy_for(graph.app_id(), environment.id)
                    .await?
                {
                    None => target.outcome = PromotionOutcome::PolicyNotConfigured,
                    Some(policy) => {
                        target.policy_id = Some(policy.id);
                        target.required_approvers = Some(policy.required_approvers);
                    }
                }
            }

            if let (PromotionOutcome::Empty, Some(artifact)) = (target.outcome, artifact.as_ref()) {
                let requests = &self.repos.requests;
                if requests.find_promoted(node.id, artifact.id).await?.is_some() {
                    target.outcome = PromotionOutcome::ArtifactAlreadyPromoted;
                } else if requests.find_awaited(node.id, artifact.id).await?.is_some() {
                    target.outcome = PromotionOutcome::AlreadyRequestRaised;
                }
            }

            target.message = target.outcome.default_message().to_string();
            target.promotion_possible = target.outcome == PromotionOutcome::Empty;
            targets.push(target);
        }

        Ok(targets)
    }

    /// Pending requests of an artifact and whether `user_id` may approve each
    pub async fn approval_eligibility(
        &self,
        artifact_id: ArtifactId,
        environment: Option<&str>,
        user_id: UserId,
    ) -> Result<Vec<ApprovalEligibility>> {
        let artifact = self.load_artifact(artifact_id).await?;
        let pending = self
            .repos
            .requests
            .list_awaited_for_artifact(artifact_id)
            .await?;

        let mut eligibility = Vec::new();
        for request in pending {
            let Some(placement) = self
                .repos
                .workflows
                .find_placement(request.destination_pipeline_id)
                .await?
            else {
                tracing::debug!(
                    "Skipping request {}: pipeline {} has no placement",
                    request.id,
                    request.destination_pipeline_id
                );
                continue;
            };
            if environment.is_some_and(|name| name != placement.environment.name) {
                continue;
            }

            let policy = self
                .repos
                .policies
                .policy_for(placement.app_id, placement.environment.id)
                .await?;
            let Some(policy) = policy.filter(|p| p.id == request.policy_id) else {
                tracing::debug!("Skipping request {}: governing policy changed", request.id);
                continue;
            };

            let reasons =
                policy.approval_blocks(user_id, artifact.created_by, request.created_by);
            eligibility.push(ApprovalEligibility {
                environment: placement.environment.name,
                request_id: request.id,
                approval_allowed: reasons.is_empty(),
                reasons,
            });
        }

        Ok(eligibility)
    }

    /// A request with its destination and approval ledger
    pub async fn get_request(&self, request_id: RequestId) -> Result<RequestDetails> {
        let request = self
            .repos
            .requests
            .find_by_id(request_id)
            .await?
            .ok_or_else(|| PromotionError::NotFound(format!("promotion request {request_id}")))?;

        let environment = self
            .repos
            .workflows
            .find_placement(request.destination_pipeline_id)
            .await?
            .map(|p| p.environment.name);
        let approvals = self.repos.approvals.approvals(request_id).await?;

        Ok(RequestDetails {
            request,
            environment,
            approvals,
        })
    }
}
