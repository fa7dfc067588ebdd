//! Promotion Coordinator
//!
//! Business logic for raising, approving and canceling promotions.
//!
//! Promote validates the source once, then evaluates each destination
//! independently: a failure on one destination is captured in its outcome
//! and never aborts the others. Approve and Cancel are all-or-nothing.

use std::collections::HashSet;

use chrono::Utc;
use promotion_core::domain::ancestry::is_proper_ancestor;
use promotion_core::domain::approval::ApprovalRecord;
use promotion_core::domain::artifact::Artifact;
use promotion_core::domain::outcome::PromotionOutcome;
use promotion_core::domain::promotion::{NewPromotionRequest, PromotionStatus, SourceType};
use promotion_core::domain::workflow::{NodeId, PipelineKind, PipelineNode, WorkflowGraph};
use promotion_core::domain::{AppId, PipelineId, PolicyId, UserId};
use promotion_core::dto::promotion::{
    ApproveRequest, ApproveResponse, CancelRequest, CancelResponse, PromoteRequest,
    PromoteResponse, PromotionSource,
};

use crate::error::{PromotionError, Result, StoreError};
use crate::repository::Repositories;

/// Orchestrates the promotion state machine over the repositories
#[derive(Clone)]
pub struct Coordinator {
    pub(crate) repos: Repositories,
}

/// Source pipeline of a promote, resolved against the workflow
struct ResolvedSource {
    node: NodeId,
    pipeline_id: PipelineId,
    source_type: SourceType,
}

impl Coordinator {
    pub fn new(repos: Repositories) -> Self {
        Self { repos }
    }

    // =========================================================================
    // Promote
    // =========================================================================

    /// Raises a promotion of one artifact into each destination environment
    pub async fn promote(&self, request: &PromoteRequest) -> Result<PromoteResponse> {
        if request.destinations.is_empty() {
            return Err(PromotionError::Input(
                "at least one destination environment is required".to_string(),
            ));
        }

        let mut response =
            PromoteResponse::seeded(&request.destinations, PromotionOutcome::PipelineNotFound);

        let graph = self
            .repos
            .workflows
            .load_graph(request.workflow_id)
            .await?
            .ok_or_else(|| PromotionError::NotFound(format!("workflow {}", request.workflow_id)))?;
        if graph.app_id() != request.app_id {
            return Err(PromotionError::Input(format!(
                "workflow {} does not belong to app {}",
                request.workflow_id, request.app_id
            )));
        }

        let source = resolve_source(&graph, &request.source)?;

        let artifact = self.load_artifact(request.artifact_id).await?;

        if source.source_type == SourceType::Cd {
            let deployed = self
                .repos
                .artifacts
                .was_deployed_at(artifact.id, source.pipeline_id)
                .await?;
            if !deployed {
                return Err(PromotionError::Conflict(format!(
                    "artifact is not deployed on the source environment {}",
                    environment_name(graph.node(source.node))
                )));
            }
        }

        // Resolve names through the authorized set; duplicates collapse
        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for name in &request.destinations {
            if !seen.insert(name.as_str()) {
                continue;
            }
            let Some(&environment_id) = request.authorized.get(name) else {
                continue;
            };
            let Some(node) = graph.cd_node_by_environment_id(environment_id) else {
                continue;
            };
            response.set(name, PromotionOutcome::Empty);
            targets.push((name.as_str(), node));
        }

        if source.source_type == SourceType::Cd {
            for &(name, node) in &targets {
                if !is_proper_ancestor(&graph, source.node, node) {
                    response.set(name, PromotionOutcome::SourceDestinationMismatch);
                }
            }
        }

        for &(name, node) in &targets {
            if response.outcome(name) != Some(PromotionOutcome::Empty) {
                continue;
            }
            let destination = graph.node(node);
            match self
                .promote_to(&artifact, &source, destination, graph.app_id(), request.user_id)
                .await
            {
                Ok(outcome) => {
                    response.set(name, outcome);
                }
                Err(err) => {
                    tracing::error!(
                        "Promotion of artifact {} to {} failed: {}",
                        artifact.id,
                        name,
                        err
                    );
                    response
                        .set(name, PromotionOutcome::Errored)
                        .message = err.to_string();
                }
            }
        }

        tracing::info!(
            "Artifact {} promote from pipeline {} by user {}: {} promoted, {} sent for approval",
            artifact.id,
            source.pipeline_id,
            request.user_id,
            response.count(PromotionOutcome::PromotionSuccessful),
            response.count(PromotionOutcome::SentForApproval)
        );

        Ok(response)
    }

    async fn promote_to(
        &self,
        artifact: &Artifact,
        source: &ResolvedSource,
        destination: &PipelineNode,
        app_id: AppId,
        user_id: UserId,
    ) -> Result<PromotionOutcome> {
        if let Some(existing) = self.existing_outcome(destination.id, artifact).await? {
            return Ok(existing);
        }

        let environment = destination.environment.as_ref().ok_or_else(|| {
            PromotionError::Internal(format!("CD pipeline {} has no environment", destination.id))
        })?;

        let Some(policy) = self
            .repos
            .policies
            .policy_for(app_id, environment.id)
            .await?
        else {
            return Ok(PromotionOutcome::PolicyNotConfigured);
        };

        let status = if policy.is_auto_promote() {
            PromotionStatus::Promoted
        } else {
            PromotionStatus::AwaitingApproval
        };
        let now = Utc::now();
        let new = NewPromotionRequest {
            source_type: source.source_type,
            source_pipeline_id: source.pipeline_id,
            destination_pipeline_id: destination.id,
            artifact_id: artifact.id,
            status,
            policy_id: policy.id,
            policy_evaluation_audit_id: policy.evaluation_audit_id,
            created_by: user_id,
            created_on: now,
        };

        match self.repos.requests.create(new).await {
            Ok(record) => {
                if record.status == PromotionStatus::AwaitingApproval {
                    let superseded = self
                        .repos
                        .requests
                        .supersede_older(destination.id, artifact.id, record.id, user_id, now)
                        .await?;
                    if superseded > 0 {
                        tracing::warn!(
                            "Superseded {} older requests for artifact {} on pipeline {}",
                            superseded,
                            artifact.id,
                            destination.id
                        );
                    }
                }
                tracing::info!(
                    "Promotion request {} for artifact {} to {} created as {}",
                    record.id,
                    artifact.id,
                    environment.name,
                    record.status
                );
                Ok(if record.status == PromotionStatus::Promoted {
                    PromotionOutcome::PromotionSuccessful
                } else {
                    PromotionOutcome::SentForApproval
                })
            }
            Err(StoreError::Conflict(msg)) => {
                // Lost the race: report what the winner left behind
                tracing::warn!("Concurrent promotion to {}: {}", environment.name, msg);
                Ok(self
                    .existing_outcome(destination.id, artifact)
                    .await?
                    .unwrap_or(PromotionOutcome::AlreadyRequestRaised))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn existing_outcome(
        &self,
        destination_pipeline_id: PipelineId,
        artifact: &Artifact,
    ) -> Result<Option<PromotionOutcome>> {
        let requests = &self.repos.requests;
        if requests
            .find_promoted(destination_pipeline_id, artifact.id)
            .await?
            .is_some()
        {
            return Ok(Some(PromotionOutcome::ArtifactAlreadyPromoted));
        }
        if requests
            .find_awaited(destination_pipeline_id, artifact.id)
            .await?
            .is_some()
        {
            return Ok(Some(PromotionOutcome::AlreadyRequestRaised));
        }
        Ok(None)
    }

    // =========================================================================
    // Approve
    // =========================================================================

    /// Records an approval and promotes once the policy quorum is reached
    pub async fn approve(&self, request: ApproveRequest) -> Result<ApproveResponse> {
        let ApproveRequest {
            request_id,
            user_id,
        } = request;

        let record = self
            .repos
            .requests
            .find_by_id(request_id)
            .await?
            .ok_or_else(|| PromotionError::NotFound(format!("promotion request {request_id}")))?;
        if !record.is_awaiting() {
            return Err(PromotionError::InvalidState(format!(
                "promotion request {request_id} is {}",
                record.status
            )));
        }

        let placement = self
            .repos
            .workflows
            .find_placement(record.destination_pipeline_id)
            .await?
            .ok_or_else(|| {
                PromotionError::NotFound(format!(
                    "destination pipeline {}",
                    record.destination_pipeline_id
                ))
            })?;

        let now = Utc::now();
        let policy = self
            .repos
            .policies
            .policy_for(placement.app_id, placement.environment.id)
            .await?;
        let policy = match policy {
            Some(policy) if policy.id == record.policy_id => policy,
            _ => {
                self.supersede_stale(request_id, user_id, now).await?;
                return Err(PromotionError::InvalidState(format!(
                    "policy governing {} changed, promotion request {request_id} is superseded",
                    placement.environment.name
                )));
            }
        };

        let artifact = self.load_artifact(record.artifact_id).await?;
        let blocks = policy.approval_blocks(user_id, artifact.created_by, record.created_by);
        if !blocks.is_empty() {
            let reasons: Vec<String> = blocks.iter().map(ToString::to_string).collect();
            return Err(PromotionError::forbidden(user_id, reasons.join("; ")));
        }

        let progress = self
            .repos
            .approvals
            .record_and_promote(request_id, user_id, now, policy.required_approvers)
            .await?;

        match progress.record {
            ApprovalRecord::Ineligible if progress.status == PromotionStatus::Promoted => {
                tracing::debug!("Request {} was promoted by a concurrent approval", request_id);
            }
            ApprovalRecord::Ineligible => {
                return Err(PromotionError::InvalidState(format!(
                    "promotion request {request_id} is {}",
                    progress.status
                )));
            }
            ApprovalRecord::Duplicate => {
                tracing::debug!("User {} already approved request {}", user_id, request_id);
            }
            ApprovalRecord::Added => {
                tracing::info!(
                    "User {} approved request {} ({}/{})",
                    user_id,
                    request_id,
                    progress.approvals,
                    policy.required_approvers
                );
            }
        }

        let outcome = if progress.is_promoted() {
            tracing::info!(
                "Artifact {} promoted to {} via request {}",
                record.artifact_id,
                placement.environment.name,
                request_id
            );
            PromotionOutcome::PromotionSuccessful
        } else {
            PromotionOutcome::SentForApproval
        };

        Ok(ApproveResponse {
            request_id,
            environment: placement.environment.name,
            outcome,
            approvals: progress.approvals,
            required_approvers: policy.required_approvers,
            status: progress.status,
        })
    }

    async fn supersede_stale(
        &self,
        request_id: i32,
        actor: UserId,
        at: chrono::DateTime<Utc>,
    ) -> Result<()> {
        match self
            .repos
            .requests
            .update_status(
                request_id,
                PromotionStatus::AwaitingApproval,
                PromotionStatus::Superseded,
                actor,
                at,
            )
            .await
        {
            Ok(_) => {
                tracing::warn!("Request {} superseded after its policy changed", request_id);
                Ok(())
            }
            // Someone else moved it first; nothing left to supersede
            Err(StoreError::StaleStatus { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    // =========================================================================
    // Cancel
    // =========================================================================

    /// Cancels a pending request; only its creator may do so
    pub async fn cancel(&self, request: CancelRequest) -> Result<CancelResponse> {
        let CancelRequest {
            request_id,
            user_id,
        } = request;

        let record = self
            .repos
            .requests
            .find_by_id(request_id)
            .await?
            .ok_or_else(|| PromotionError::NotFound(format!("promotion request {request_id}")))?;

        if record.created_by != user_id {
            return Err(PromotionError::forbidden(
                user_id,
                format!("did not raise promotion request {request_id}"),
            ));
        }

        if !record.is_awaiting() {
            return Err(PromotionError::InvalidState(format!(
                "promotion request {request_id} is {}",
                record.status
            )));
        }

        let updated = self
            .repos
            .requests
            .update_status(
                request_id,
                PromotionStatus::AwaitingApproval,
                PromotionStatus::Canceled,
                user_id,
                Utc::now(),
            )
            .await
            .map_err(|err| match err {
                StoreError::StaleStatus { .. } => PromotionError::InvalidState(format!(
                    "promotion request {request_id} changed state concurrently"
                )),
                other => other.into(),
            })?;

        tracing::info!("Request {} canceled by user {}", request_id, user_id);

        Ok(CancelResponse {
            request_id,
            status: updated.status,
        })
    }

    // =========================================================================
    // Policy lifecycle
    // =========================================================================

    /// Supersedes every pending request raised under a deleted policy
    pub async fn on_policy_removed(&self, policy_id: PolicyId, actor: UserId) -> Result<u64> {
        let superseded = self
            .repos
            .requests
            .supersede_by_policy(policy_id, actor, Utc::now())
            .await?;

        tracing::info!(
            "Policy {} removed, {} pending requests superseded",
            policy_id,
            superseded
        );
        Ok(superseded)
    }

    pub(crate) async fn load_artifact(&self, artifact_id: i32) -> Result<Artifact> {
        self.repos
            .artifacts
            .get_artifact(artifact_id)
            .await?
            .ok_or_else(|| PromotionError::NotFound(format!("artifact {artifact_id}")))
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn resolve_source(graph: &WorkflowGraph, source: &PromotionSource) -> Result<ResolvedSource> {
    if source.kind.is_producer() {
        let root = graph.root();
        let node = graph.node(root);
        if node.kind != source.kind {
            return Err(PromotionError::Input(format!(
                "workflow {} is sourced by a {} pipeline, not {}",
                graph.workflow_id(),
                node.kind,
                source.kind
            )));
        }
        if source.pipeline_id.is_some_and(|id| id != node.id) {
            return Err(PromotionError::Input(format!(
                "pipeline {} is not the source of workflow {}",
                source.pipeline_id.unwrap_or_default(),
                graph.workflow_id()
            )));
        }
        return Ok(ResolvedSource {
            node: root,
            pipeline_id: node.id,
            source_type: SourceType::from(node.kind),
        });
    }

    let by_id = source
        .pipeline_id
        .and_then(|id| graph.node_by_pipeline_id(id))
        .filter(|&node| graph.node_kind(node) == PipelineKind::Cd);
    let by_name = || {
        source
            .name
            .as_deref()
            .and_then(|name| graph.cd_node_by_environment_name(name))
    };

    let node = by_id.or_else(by_name).ok_or_else(|| {
        PromotionError::Input(format!(
            "no pipeline found against given source environment {}",
            source.name.as_deref().unwrap_or_default()
        ))
    })?;

    Ok(ResolvedSource {
        node,
        pipeline_id: graph.node(node).id,
        source_type: SourceType::Cd,
    })
}

fn environment_name(node: &PipelineNode) -> &str {
    node.environment
        .as_ref()
        .map(|env| env.name.as_str())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{ApprovalLedger, RequestRepository};
    use crate::service::fixtures::*;

    // Scenario: CI(1) -> CD(10) -> CD(20), policy on env20 needs no approvals
    #[tokio::test]
    async fn test_auto_promote_from_cd_source() {
        let fx = Fixture::linear();
        fx.policy(ENV_PROD, 0);

        let response = fx
            .coordinator
            .promote(&fx.promote(PromotionSource::environment("dev"), &["prod"]))
            .await
            .unwrap();

        assert_eq!(
            response.outcome("prod"),
            Some(PromotionOutcome::PromotionSuccessful)
        );
        let requests = fx.store.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].status, PromotionStatus::Promoted);
        assert_eq!(requests[0].source_type, SourceType::Cd);
        assert_eq!(requests[0].source_pipeline_id, CD_DEV);
        assert_eq!(requests[0].destination_pipeline_id, CD_PROD);
    }

    #[tokio::test]
    async fn test_repeat_promote_after_promotion_is_idempotent() {
        let fx = Fixture::linear();
        fx.policy(ENV_PROD, 0);
        let request = fx.promote(PromotionSource::environment("dev"), &["prod"]);

        fx.coordinator.promote(&request).await.unwrap();
        let again = fx.coordinator.promote(&request).await.unwrap();

        assert_eq!(
            again.outcome("prod"),
            Some(PromotionOutcome::ArtifactAlreadyPromoted)
        );
        assert_eq!(fx.store.requests().len(), 1);
    }

    // Scenario: CI(1) -> CD(10), CI(1) -> CD(11)
    #[tokio::test]
    async fn test_sibling_destination_is_a_mismatch() {
        let fx = Fixture::forked();
        fx.policy(ENV_DEV_EU, 0);

        let response = fx
            .coordinator
            .promote(&fx.promote(PromotionSource::environment("dev"), &["dev-eu"]))
            .await
            .unwrap();

        assert_eq!(
            response.outcome("dev-eu"),
            Some(PromotionOutcome::SourceDestinationMismatch)
        );
        assert!(fx.store.requests().is_empty());
    }

    #[tokio::test]
    async fn test_source_equal_to_destination_is_a_mismatch() {
        let fx = Fixture::linear();
        fx.policy(ENV_DEV, 0);

        let response = fx
            .coordinator
            .promote(&fx.promote(PromotionSource::environment("dev"), &["dev"]))
            .await
            .unwrap();

        assert_eq!(
            response.outcome("dev"),
            Some(PromotionOutcome::SourceDestinationMismatch)
        );
    }

    #[tokio::test]
    async fn test_concurrent_promotes_create_one_request() {
        let fx = Fixture::linear();
        fx.policy(ENV_PROD, 1);
        let request = fx.promote(PromotionSource::environment("dev"), &["prod"]);

        let (left, right) = tokio::join!(
            fx.coordinator.promote(&request),
            fx.coordinator.promote(&request)
        );
        let mut outcomes = vec![
            left.unwrap().outcome("prod").unwrap(),
            right.unwrap().outcome("prod").unwrap(),
        ];
        outcomes.sort_by_key(|o| o.to_string());

        assert_eq!(
            outcomes,
            vec![
                PromotionOutcome::AlreadyRequestRaised,
                PromotionOutcome::SentForApproval
            ]
        );
        assert_eq!(fx.store.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_lost_create_race_reports_winner_state() {
        let fx = Fixture::linear();
        fx.policy(ENV_PROD, 1);
        let mut repos = fx.coordinator.repos.clone();
        repos.requests = std::sync::Arc::new(RacingReads::blind_once(fx.store.clone()));
        let coordinator = Coordinator::new(repos);

        // Winner commits first; the loser's pre-check misses it
        fx.coordinator
            .promote(&fx.promote(PromotionSource::environment("dev"), &["prod"]))
            .await
            .unwrap();
        let response = coordinator
            .promote(&fx.promote(PromotionSource::environment("dev"), &["prod"]))
            .await
            .unwrap();

        assert_eq!(
            response.outcome("prod"),
            Some(PromotionOutcome::AlreadyRequestRaised)
        );
        assert_eq!(fx.store.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_producer_source_reaches_any_cd() {
        let fx = Fixture::linear();
        fx.policy(ENV_DEV, 1);
        fx.policy(ENV_PROD, 0);

        let response = fx
            .coordinator
            .promote(&fx.promote(PromotionSource::producer(PipelineKind::Ci), &["dev", "prod"]))
            .await
            .unwrap();

        assert_eq!(response.outcome("dev"), Some(PromotionOutcome::SentForApproval));
        assert_eq!(
            response.outcome("prod"),
            Some(PromotionOutcome::PromotionSuccessful)
        );
        assert!(
            fx.store
                .requests()
                .iter()
                .all(|r| r.source_type == SourceType::Ci && r.source_pipeline_id == CI)
        );
    }

    #[tokio::test]
    async fn test_producer_kind_must_match_workflow_root() {
        let fx = Fixture::linear();
        fx.policy(ENV_PROD, 0);

        let err = fx
            .coordinator
            .promote(&fx.promote(PromotionSource::producer(PipelineKind::Webhook), &["prod"]))
            .await
            .unwrap_err();

        assert!(matches!(err, PromotionError::Input(_)));
        assert!(err.to_string().contains("sourced by a CI pipeline"));
        assert!(fx.store.requests().is_empty());
    }

    #[tokio::test]
    async fn test_request_keeps_policy_evaluation_audit() {
        let fx = Fixture::linear();
        let mut audited = policy(POLICY_BASE + ENV_PROD, 1);
        audited.evaluation_audit_id = Some(31);
        fx.store.set_policy(APP, ENV_PROD, audited);

        let request_id = fx.raise_prod_request().await;

        let stored = fx.store.find_by_id(request_id).await.unwrap().unwrap();
        assert_eq!(stored.policy_evaluation_audit_id, Some(31));
        assert_eq!(stored.policy_id, POLICY_BASE + ENV_PROD);
    }

    #[tokio::test]
    async fn test_per_destination_outcomes() {
        let fx = Fixture::linear();
        fx.policy(ENV_PROD, 2);
        let mut request = fx.promote(
            PromotionSource::producer(PipelineKind::Ci),
            &["dev", "prod", "staging", "prod"],
        );
        request.authorized.insert("staging".into(), 999);

        let response = fx.coordinator.promote(&request).await.unwrap();

        assert_eq!(response.outcomes.len(), 3);
        assert_eq!(
            response.outcome("dev"),
            Some(PromotionOutcome::PolicyNotConfigured)
        );
        assert_eq!(response.outcome("prod"), Some(PromotionOutcome::SentForApproval));
        assert_eq!(
            response.outcome("staging"),
            Some(PromotionOutcome::PipelineNotFound)
        );
    }

    #[tokio::test]
    async fn test_unauthorized_destination_stays_not_found() {
        let fx = Fixture::linear();
        fx.policy(ENV_PROD, 0);
        let mut request = fx.promote(PromotionSource::environment("dev"), &["prod"]);
        request.authorized.clear();

        let response = fx.coordinator.promote(&request).await.unwrap();
        assert_eq!(
            response.outcome("prod"),
            Some(PromotionOutcome::PipelineNotFound)
        );
    }

    #[tokio::test]
    async fn test_write_failure_is_scoped_to_one_destination() {
        let fx = Fixture::linear();
        fx.policy(ENV_DEV, 0);
        fx.policy(ENV_PROD, 0);
        fx.store.fail_writes_for(CD_DEV);

        let response = fx
            .coordinator
            .promote(&fx.promote(PromotionSource::producer(PipelineKind::Ci), &["dev", "prod"]))
            .await
            .unwrap();

        let dev = response.get("dev").unwrap();
        assert_eq!(dev.outcome, PromotionOutcome::Errored);
        assert!(dev.message.starts_with("Transient failure"));
        assert_eq!(
            response.outcome("prod"),
            Some(PromotionOutcome::PromotionSuccessful)
        );
    }

    #[tokio::test]
    async fn test_whole_request_failures() {
        let fx = Fixture::linear();
        fx.policy(ENV_PROD, 0);

        let empty = fx.promote(PromotionSource::environment("dev"), &[]);
        assert!(matches!(
            fx.coordinator.promote(&empty).await,
            Err(PromotionError::Input(_))
        ));

        let unknown_source = fx.promote(PromotionSource::environment("nowhere"), &["prod"]);
        let err = fx.coordinator.promote(&unknown_source).await.unwrap_err();
        assert!(err.to_string().contains("no pipeline found against given source environment"));

        let mut missing_artifact = fx.promote(PromotionSource::environment("dev"), &["prod"]);
        missing_artifact.artifact_id = 404;
        assert!(matches!(
            fx.coordinator.promote(&missing_artifact).await,
            Err(PromotionError::NotFound(_))
        ));

        let mut missing_workflow = fx.promote(PromotionSource::environment("dev"), &["prod"]);
        missing_workflow.workflow_id = 404;
        assert!(matches!(
            fx.coordinator.promote(&missing_workflow).await,
            Err(PromotionError::NotFound(_))
        ));

        // Deployed on dev only, so prod cannot be a source
        let not_deployed = fx.promote(PromotionSource::environment("prod"), &["dev"]);
        assert!(matches!(
            fx.coordinator.promote(&not_deployed).await,
            Err(PromotionError::Conflict(_))
        ));
        assert!(fx.store.requests().is_empty());
    }

    // Scenario: quorum of two distinct approvers
    #[tokio::test]
    async fn test_approval_quorum_of_two() {
        let fx = Fixture::linear();
        fx.policy(ENV_PROD, 2);
        let request_id = fx.raise_prod_request().await;

        let first = fx.coordinator.approve(fx.approve(request_id, U1)).await.unwrap();
        assert_eq!(first.outcome, PromotionOutcome::SentForApproval);
        assert_eq!(first.status, PromotionStatus::AwaitingApproval);
        assert_eq!(first.approvals, 1);

        let second = fx.coordinator.approve(fx.approve(request_id, U2)).await.unwrap();
        assert_eq!(second.outcome, PromotionOutcome::PromotionSuccessful);
        assert_eq!(second.status, PromotionStatus::Promoted);
        assert_eq!(second.approvals, 2);
        assert_eq!(second.environment, "prod");
    }

    #[tokio::test]
    async fn test_duplicate_approval_is_idempotent() {
        let fx = Fixture::linear();
        fx.policy(ENV_PROD, 2);
        let request_id = fx.raise_prod_request().await;

        fx.coordinator.approve(fx.approve(request_id, U1)).await.unwrap();
        let again = fx.coordinator.approve(fx.approve(request_id, U1)).await.unwrap();

        assert_eq!(again.approvals, 1);
        assert_eq!(again.status, PromotionStatus::AwaitingApproval);
    }

    // Scenario: the requester tries to approve
    #[tokio::test]
    async fn test_requester_cannot_approve() {
        let fx = Fixture::linear();
        fx.policy(ENV_PROD, 1);
        let request_id = fx.raise_prod_request().await;

        let err = fx
            .coordinator
            .approve(fx.approve(request_id, REQUESTER))
            .await
            .unwrap_err();
        assert!(matches!(err, PromotionError::Forbidden { user: REQUESTER, .. }));

        let stored = fx.store.find_by_id(request_id).await.unwrap().unwrap();
        assert_eq!(stored.status, PromotionStatus::AwaitingApproval);
        assert_eq!(fx.store.count(request_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_builder_cannot_approve() {
        let fx = Fixture::linear();
        fx.policy(ENV_PROD, 1);
        let request_id = fx.raise_prod_request().await;

        let err = fx
            .coordinator
            .approve(fx.approve(request_id, BUILDER))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("built the image"));
    }

    #[tokio::test]
    async fn test_approval_losing_race_to_promotion_succeeds() {
        let fx = Fixture::linear();
        fx.policy(ENV_PROD, 1);
        let request_id = fx.raise_prod_request().await;

        // The second approver read the request while it was still pending
        let snapshot = fx.store.find_by_id(request_id).await.unwrap().unwrap();
        let mut repos = fx.coordinator.repos.clone();
        repos.requests = std::sync::Arc::new(RacingReads::frozen(fx.store.clone(), snapshot));
        let late = Coordinator::new(repos);

        let winner = fx.coordinator.approve(fx.approve(request_id, U1)).await.unwrap();
        let loser = late.approve(fx.approve(request_id, U2)).await.unwrap();

        assert_eq!(winner.status, PromotionStatus::Promoted);
        assert_eq!(winner.outcome, PromotionOutcome::PromotionSuccessful);
        assert_eq!(loser.status, PromotionStatus::Promoted);
        assert_eq!(loser.outcome, PromotionOutcome::PromotionSuccessful);

        // Only the winning approval lands in the ledger
        assert_eq!(fx.store.count(request_id).await.unwrap(), 1);
        let promoted = fx
            .store
            .requests()
            .into_iter()
            .filter(|r| r.status == PromotionStatus::Promoted)
            .count();
        assert_eq!(promoted, 1);
    }

    #[tokio::test]
    async fn test_approve_after_promotion_is_invalid() {
        let fx = Fixture::linear();
        fx.policy(ENV_PROD, 1);
        let request_id = fx.raise_prod_request().await;
        fx.coordinator.approve(fx.approve(request_id, U1)).await.unwrap();

        let err = fx
            .coordinator
            .approve(fx.approve(request_id, U2))
            .await
            .unwrap_err();
        assert!(matches!(err, PromotionError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_approve_after_policy_change_supersedes() {
        let fx = Fixture::linear();
        fx.policy(ENV_PROD, 1);
        let request_id = fx.raise_prod_request().await;
        fx.store.set_policy(APP, ENV_PROD, policy(77, 1));

        let err = fx
            .coordinator
            .approve(fx.approve(request_id, U1))
            .await
            .unwrap_err();
        assert!(matches!(err, PromotionError::InvalidState(_)));

        let stored = fx.store.find_by_id(request_id).await.unwrap().unwrap();
        assert_eq!(stored.status, PromotionStatus::Superseded);
        assert!(!stored.active);
    }

    #[tokio::test]
    async fn test_approve_after_policy_detached_supersedes() {
        let fx = Fixture::linear();
        fx.policy(ENV_PROD, 1);
        let request_id = fx.raise_prod_request().await;
        fx.store.remove_policy(APP, ENV_PROD);

        let err = fx
            .coordinator
            .approve(fx.approve(request_id, U1))
            .await
            .unwrap_err();
        assert!(matches!(err, PromotionError::InvalidState(_)));

        let stored = fx.store.find_by_id(request_id).await.unwrap().unwrap();
        assert_eq!(stored.status, PromotionStatus::Superseded);
    }

    #[tokio::test]
    async fn test_approve_missing_request() {
        let fx = Fixture::linear();
        let err = fx.coordinator.approve(fx.approve(42, U1)).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_cancel_by_creator() {
        let fx = Fixture::linear();
        fx.policy(ENV_PROD, 1);
        let request_id = fx.raise_prod_request().await;

        let response = fx
            .coordinator
            .cancel(CancelRequest {
                request_id,
                user_id: REQUESTER,
            })
            .await
            .unwrap();
        assert_eq!(response.status, PromotionStatus::Canceled);

        // The key is free again for a new request
        let again = fx
            .coordinator
            .promote(&fx.promote(PromotionSource::environment("dev"), &["prod"]))
            .await
            .unwrap();
        assert_eq!(again.outcome("prod"), Some(PromotionOutcome::SentForApproval));
    }

    #[tokio::test]
    async fn test_cancel_by_someone_else_is_forbidden() {
        let fx = Fixture::linear();
        fx.policy(ENV_PROD, 1);
        let request_id = fx.raise_prod_request().await;

        let err = fx
            .coordinator
            .cancel(CancelRequest {
                request_id,
                user_id: U1,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PromotionError::Forbidden { .. }));
    }

    // Scenario: cancel after the request was promoted
    #[tokio::test]
    async fn test_cancel_after_promote_is_invalid() {
        let fx = Fixture::linear();
        fx.policy(ENV_PROD, 1);
        let request_id = fx.raise_prod_request().await;
        fx.coordinator.approve(fx.approve(request_id, U1)).await.unwrap();

        let err = fx
            .coordinator
            .cancel(CancelRequest {
                request_id,
                user_id: REQUESTER,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PromotionError::InvalidState(_)));

        let stored = fx.store.find_by_id(request_id).await.unwrap().unwrap();
        assert_eq!(stored.status, PromotionStatus::Promoted);
    }

    #[tokio::test]
    async fn test_approve_after_cancel_is_invalid() {
        let fx = Fixture::linear();
        fx.policy(ENV_PROD, 1);
        let request_id = fx.raise_prod_request().await;
        fx.coordinator
            .cancel(CancelRequest {
                request_id,
                user_id: REQUESTER,
            })
            .await
            .unwrap();

        let err = fx
            .coordinator
            .approve(fx.approve(request_id, U1))
            .await
            .unwrap_err();
        assert!(matches!(err, PromotionError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_policy_removal_supersedes_pending() {
        let fx = Fixture::linear();
        fx.policy(ENV_PROD, 1);
        let request_id = fx.raise_prod_request().await;

        let superseded = fx.coordinator.on_policy_removed(POLICY_BASE + ENV_PROD, 0).await.unwrap();
        assert_eq!(superseded, 1);

        let stored = fx.store.find_by_id(request_id).await.unwrap().unwrap();
        assert_eq!(stored.status, PromotionStatus::Superseded);
    }
}
