//! Action dispatcher
//!
//! Entry point for the single action envelope. Parses the verb, narrows
//! promote destinations to what the caller may touch, and bounds every call
//! with a deadline.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use promotion_core::domain::outcome::PromotionOutcome;
use promotion_core::domain::{EnvironmentId, UserId};
use promotion_core::dto::action::{Action, ActionRequest, ActionResponse, UnknownAction};
use promotion_core::dto::promotion::{
    ApproveRequest, ApproveResponse, CancelRequest, CancelResponse, PromoteRequest,
    PromoteResponse, PromotionSource,
};

use super::Coordinator;
use crate::config::Config;
use crate::error::{PromotionError, Result};

/// Routes action requests to the coordinator
#[derive(Clone)]
pub struct Dispatcher {
    coordinator: Coordinator,
    promote_deadline: Duration,
    action_deadline: Duration,
}

impl Dispatcher {
    pub fn new(coordinator: Coordinator, promote_deadline: Duration, action_deadline: Duration) -> Self {
        Self {
            coordinator,
            promote_deadline,
            action_deadline,
        }
    }

    pub fn from_config(coordinator: Coordinator, config: &Config) -> Self {
        Self::new(coordinator, config.promote_deadline, config.action_deadline)
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Dispatches one action on behalf of `user_id`
    ///
    /// `authorized` maps the environment names the caller may act on to
    /// their ids.
    pub async fn dispatch(
        &self,
        request: ActionRequest,
        user_id: UserId,
        authorized: &BTreeMap<String, EnvironmentId>,
    ) -> Result<ActionResponse> {
        let action: Action = request
            .action
            .parse()
            .map_err(|e: UnknownAction| PromotionError::Input(e.to_string()))?;

        tracing::debug!("Dispatching {} for user {}", action, user_id);

        match action {
            Action::Promote => {
                let promote = promote_request(request, user_id, authorized)?;
                self.promote(promote).await.map(ActionResponse::Promote)
            }
            Action::Approve => {
                let request_id = require(request.promotion_request_id, "promotionRequestId")?;
                self.approve(ApproveRequest {
                    request_id,
                    user_id,
                })
                .await
                .map(ActionResponse::Approve)
            }
            Action::Cancel => {
                let request_id = require(request.promotion_request_id, "promotionRequestId")?;
                self.cancel(CancelRequest {
                    request_id,
                    user_id,
                })
                .await
                .map(ActionResponse::Cancel)
            }
        }
    }

    /// Promotes after marking destinations outside the authorized set
    pub async fn promote(&self, request: PromoteRequest) -> Result<PromoteResponse> {
        if request.destinations.is_empty() {
            return Err(PromotionError::Input(
                "destinationObjectNames must not be empty".to_string(),
            ));
        }

        let (allowed, denied): (Vec<String>, Vec<String>) = request
            .destinations
            .iter()
            .cloned()
            .partition(|name| request.authorized.contains_key(name));

        let mut response = PromoteResponse::seeded(&denied, PromotionOutcome::NoPermission);
        if allowed.is_empty() {
            tracing::warn!(
                "User {} has no permission on any of {:?}",
                request.user_id,
                request.destinations
            );
            return Ok(response);
        }

        let request = PromoteRequest {
            destinations: allowed,
            ..request
        };
        let evaluated = with_deadline(self.promote_deadline, self.coordinator.promote(&request)).await?;
        response.merge(evaluated);
        Ok(response)
    }

    pub async fn approve(&self, request: ApproveRequest) -> Result<ApproveResponse> {
        with_deadline(self.action_deadline, self.coordinator.approve(request)).await
    }

    pub async fn cancel(&self, request: CancelRequest) -> Result<CancelResponse> {
        with_deadline(self.action_deadline, self.coordinator.cancel(request)).await
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

async fn with_deadline<T>(deadline: Duration, call: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => {
            tracing::error!("Action exceeded its deadline of {:?}", deadline);
            Err(PromotionError::DeadlineExceeded(deadline))
        }
    }
}

fn require<T>(value: Option<T>, field: &str) -> Result<T> {
    value.ok_or_else(|| PromotionError::Input(format!("{field} is required")))
}

fn promote_request(
    request: ActionRequest,
    user_id: UserId,
    authorized: &BTreeMap<String, EnvironmentId>,
) -> Result<PromoteRequest> {
    let kind = require(request.source_type, "sourceType")?;
    let source = PromotionSource {
        kind,
        name: request.source_name,
        pipeline_id: request.source_pipeline_id,
    };

    Ok(PromoteRequest {
        artifact_id: require(request.artifact_id, "artifactId")?,
        source,
        workflow_id: require(request.workflow_id, "workflowId")?,
        app_id: require(request.app_id, "appId")?,
        destinations: request.destination_object_names,
        authorized: authorized.clone(),
        user_id,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use promotion_core::domain::promotion::PromotionStatus;
    use promotion_core::domain::workflow::{PipelineKind, PipelinePlacement, WorkflowGraph};
    use promotion_core::domain::{PipelineId, WorkflowId};

    use super::*;
    use crate::error::StoreResult;
    use crate::repository::{InMemoryStore, WorkflowRepository};
    use crate::service::fixtures::*;

    fn dispatcher(fx: &Fixture) -> Dispatcher {
        Dispatcher::new(
            fx.coordinator.clone(),
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
    }

    fn promote_action(destinations: &[&str]) -> ActionRequest {
        ActionRequest {
            action: "PROMOTE".into(),
            source_name: Some("dev".into()),
            source_type: Some(PipelineKind::Cd),
            artifact_id: Some(ARTIFACT),
            destination_object_names: destinations.iter().map(|d| d.to_string()).collect(),
            workflow_id: Some(WORKFLOW),
            app_id: Some(APP),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_unknown_verb_is_input_error() {
        let fx = Fixture::linear();
        let request = ActionRequest {
            action: "DEPLOY".into(),
            ..Default::default()
        };

        let err = dispatcher(&fx)
            .dispatch(request, REQUESTER, &fx.authorized)
            .await
            .unwrap_err();
        assert!(matches!(err, PromotionError::Input(_)));
    }

    #[tokio::test]
    async fn test_unauthorized_destinations_are_merged() {
        let fx = Fixture::linear();
        fx.policy(ENV_PROD, 0);
        let response = dispatcher(&fx)
            .dispatch(promote_action(&["prod", "staging"]), REQUESTER, &fx.authorized)
            .await
            .unwrap();

        let ActionResponse::Promote(response) = response else {
            panic!("expected a promote response");
        };
        assert_eq!(
            response.outcome("prod"),
            Some(PromotionOutcome::PromotionSuccessful)
        );
        assert_eq!(
            response.outcome("staging"),
            Some(PromotionOutcome::NoPermission)
        );
    }

    #[tokio::test]
    async fn test_all_destinations_denied() {
        let fx = Fixture::linear();
        fx.policy(ENV_PROD, 0);

        let response = dispatcher(&fx)
            .dispatch(promote_action(&["prod"]), REQUESTER, &BTreeMap::new())
            .await
            .unwrap();

        let ActionResponse::Promote(response) = response else {
            panic!("expected a promote response");
        };
        assert_eq!(response.outcome("prod"), Some(PromotionOutcome::NoPermission));
        assert!(fx.store.requests().is_empty());
    }

    #[tokio::test]
    async fn test_missing_promote_fields() {
        let fx = Fixture::linear();
        let mut request = promote_action(&["prod"]);
        request.artifact_id = None;

        let err = dispatcher(&fx)
            .dispatch(request, REQUESTER, &fx.authorized)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("artifactId"));
    }

    #[tokio::test]
    async fn test_approve_and_cancel_need_request_id() {
        let fx = Fixture::linear();
        for verb in ["APPROVE", "CANCEL"] {
            let request = ActionRequest {
                action: verb.into(),
                ..Default::default()
            };
            let err = dispatcher(&fx)
                .dispatch(request, U1, &fx.authorized)
                .await
                .unwrap_err();
            assert!(err.to_string().contains("promotionRequestId"));
        }
    }

    #[tokio::test]
    async fn test_approve_through_envelope() {
        let fx = Fixture::linear();
        fx.policy(ENV_PROD, 1);
        let request_id = fx.raise_prod_request().await;

        let response = dispatcher(&fx)
            .dispatch(
                ActionRequest {
                    action: "APPROVE".into(),
                    promotion_request_id: Some(request_id),
                    ..Default::default()
                },
                U1,
                &fx.authorized,
            )
            .await
            .unwrap();

        let ActionResponse::Approve(response) = response else {
            panic!("expected an approve response");
        };
        assert_eq!(response.status, PromotionStatus::Promoted);
    }

    struct SlowWorkflows(InMemoryStore);

    #[async_trait]
    impl WorkflowRepository for SlowWorkflows {
        async fn load_graph(&self, workflow_id: WorkflowId) -> StoreResult<Option<WorkflowGraph>> {
            tokio::time::sleep(Duration::from_secs(2)).await;
            self.0.load_graph(workflow_id).await
        }

        async fn find_placement(
            &self,
            pipeline_id: PipelineId,
        ) -> StoreResult<Option<PipelinePlacement>> {
            self.0.find_placement(pipeline_id).await
        }
    }

    #[tokio::test]
    async fn test_promote_deadline() {
        let fx = Fixture::linear();
        fx.policy(ENV_PROD, 0);
        let mut repos = fx.coordinator.repos.clone();
        repos.workflows = Arc::new(SlowWorkflows(fx.store.clone()));
        let dispatcher = Dispatcher::new(
            Coordinator::new(repos),
            Duration::from_millis(20),
            Duration::from_millis(20),
        );

        let err = dispatcher
            .dispatch(promote_action(&["prod"]), REQUESTER, &fx.authorized)
            .await
            .unwrap_err();
        assert!(matches!(err, PromotionError::DeadlineExceeded(_)));
        assert!(fx.store.requests().is_empty());
    }
}
