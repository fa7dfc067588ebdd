//! Shared in-memory world for service tests
//!
//! Workflow 1 of app 7: CI(1) -> CD(10, dev) -> CD(20, prod).
//! The forked variant replaces prod with a sibling CI(1) -> CD(11, dev-eu).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use promotion_core::domain::artifact::Artifact;
use promotion_core::domain::outcome::PromotionOutcome;
use promotion_core::domain::policy::PromotionPolicy;
use promotion_core::domain::promotion::{NewPromotionRequest, PromotionRequest, PromotionStatus};
use promotion_core::domain::workflow::{PipelineKind, PipelineNode, WorkflowEdge, WorkflowGraph};
use promotion_core::domain::{
    ArtifactId, EnvironmentId, PipelineId, PolicyId, RequestId, UserId,
};
use promotion_core::dto::promotion::{ApproveRequest, PromoteRequest, PromotionSource};

use super::Coordinator;
use crate::error::StoreResult;
use crate::repository::{InMemoryStore, Repositories, RequestRepository};

pub const APP: i32 = 7;
pub const WORKFLOW: i32 = 1;
pub const ARTIFACT: ArtifactId = 5;

pub const CI: PipelineId = 1;
pub const CD_DEV: PipelineId = 10;
pub const CD_DEV_EU: PipelineId = 11;
pub const CD_PROD: PipelineId = 20;

pub const ENV_DEV: EnvironmentId = 100;
pub const ENV_DEV_EU: EnvironmentId = 101;
pub const ENV_PROD: EnvironmentId = 200;

pub const POLICY_BASE: PolicyId = 1000;

pub const BUILDER: UserId = 50;
pub const REQUESTER: UserId = 60;
pub const U1: UserId = 1;
pub const U2: UserId = 2;

pub struct Fixture {
    pub store: InMemoryStore,
    pub coordinator: Coordinator,
    pub authorized: BTreeMap<String, EnvironmentId>,
}

impl Fixture {
    pub fn linear() -> Self {
        Self::with_graph(
            vec![
                PipelineNode::producer(CI, PipelineKind::Ci, WORKFLOW),
                PipelineNode::cd(CD_DEV, ENV_DEV, "dev", WORKFLOW),
                PipelineNode::cd(CD_PROD, ENV_PROD, "prod", WORKFLOW),
            ],
            vec![edge(CI, PipelineKind::Ci, CD_DEV), edge(CD_DEV, PipelineKind::Cd, CD_PROD)],
        )
    }

    pub fn forked() -> Self {
        Self::with_graph(
            vec![
                PipelineNode::producer(CI, PipelineKind::Ci, WORKFLOW),
                PipelineNode::cd(CD_DEV, ENV_DEV, "dev", WORKFLOW),
                PipelineNode::cd(CD_DEV_EU, ENV_DEV_EU, "dev-eu", WORKFLOW),
            ],
            vec![edge(CI, PipelineKind::Ci, CD_DEV), edge(CI, PipelineKind::Ci, CD_DEV_EU)],
        )
    }

    fn with_graph(nodes: Vec<PipelineNode>, edges: Vec<WorkflowEdge>) -> Self {
        let store = InMemoryStore::new();
        let authorized = nodes
            .iter()
            .filter_map(|n| n.environment.as_ref())
            .map(|env| (env.name.clone(), env.id))
            .collect();

        let graph = WorkflowGraph::build(WORKFLOW, APP, nodes, &edges).unwrap();
        store.insert_graph(graph);
        store.insert_artifact(Artifact {
            id: ARTIFACT,
            origin_pipeline_id: CI,
            created_by: BUILDER,
            created_on: Utc::now(),
        });
        store.record_deployment(ARTIFACT, CD_DEV, Utc::now());

        let coordinator = Coordinator::new(Repositories::in_memory(store.clone()));
        Self {
            store,
            coordinator,
            authorized,
        }
    }

    /// Policy `POLICY_BASE + environment_id` requiring `approvers` approvals
    pub fn policy(&self, environment_id: EnvironmentId, approvers: u32) {
        self.store.set_policy(
            APP,
            environment_id,
            policy(POLICY_BASE + environment_id, approvers),
        );
    }

    pub fn promote(&self, source: PromotionSource, destinations: &[&str]) -> PromoteRequest {
        PromoteRequest {
            artifact_id: ARTIFACT,
            source,
            workflow_id: WORKFLOW,
            app_id: APP,
            destinations: destinations.iter().map(|d| d.to_string()).collect(),
            authorized: self.authorized.clone(),
            user_id: REQUESTER,
        }
    }

    pub fn approve(&self, request_id: RequestId, user_id: UserId) -> ApproveRequest {
        ApproveRequest {
            request_id,
            user_id,
        }
    }

    /// Raises dev -> prod and returns the pending request id
    pub async fn raise_prod_request(&self) -> RequestId {
        let response = self
            .coordinator
            .promote(&self.promote(PromotionSource::environment("dev"), &["prod"]))
            .await
            .unwrap();
        assert_eq!(response.outcome("prod"), Some(PromotionOutcome::SentForApproval));

        self.store
            .find_awaited(CD_PROD, ARTIFACT)
            .await
            .unwrap()
            .map(|r| r.id)
            .unwrap()
    }
}

pub fn policy(id: PolicyId, approvers: u32) -> PromotionPolicy {
    PromotionPolicy {
        id,
        name: format!("policy-{id}"),
        required_approvers: approvers,
        approvers: None,
        evaluation_audit_id: None,
    }
}

fn edge(parent_id: PipelineId, parent_kind: PipelineKind, child_id: PipelineId) -> WorkflowEdge {
    WorkflowEdge {
        parent_id,
        parent_kind,
        child_id,
        child_kind: PipelineKind::Cd,
    }
}

/// Request store that serves reads from before a concurrent writer
/// committed, so tests can reach the lost-race branches deterministically
pub struct RacingReads {
    inner: InMemoryStore,
    blind_awaited: AtomicBool,
    frozen: Option<PromotionRequest>,
}

impl RacingReads {
    /// The first pending lookup misses, as if the winner committed between
    /// the check and the insert
    pub fn blind_once(inner: InMemoryStore) -> Self {
        Self {
            inner,
            blind_awaited: AtomicBool::new(true),
            frozen: None,
        }
    }

    /// `find_by_id` keeps returning `snapshot`, as if read just before the
    /// winner's write
    pub fn frozen(inner: InMemoryStore, snapshot: PromotionRequest) -> Self {
        Self {
            inner,
            blind_awaited: AtomicBool::new(false),
            frozen: Some(snapshot),
        }
    }
}

#[async_trait]
impl RequestRepository for RacingReads {
    async fn find_awaited(
        &self,
        destination_pipeline_id: PipelineId,
        artifact_id: ArtifactId,
    ) -> StoreResult<Option<PromotionRequest>> {
        if self.blind_awaited.swap(false, Ordering::SeqCst) {
            return Ok(None);
        }
        self.inner.find_awaited(destination_pipeline_id, artifact_id).await
    }

    async fn find_promoted(
        &self,
        destination_pipeline_id: PipelineId,
        artifact_id: ArtifactId,
    ) -> StoreResult<Option<PromotionRequest>> {
        self.inner.find_promoted(destination_pipeline_id, artifact_id).await
    }

    async fn create(&self, request: NewPromotionRequest) -> StoreResult<PromotionRequest> {
        self.inner.create(request).await
    }

    async fn update_status(
        &self,
        request_id: RequestId,
        from: PromotionStatus,
        to: PromotionStatus,
        actor: UserId,
        at: DateTime<Utc>,
    ) -> StoreResult<PromotionRequest> {
        self.inner.update_status(request_id, from, to, actor, at).await
    }

    async fn find_by_id(&self, request_id: RequestId) -> StoreResult<Option<PromotionRequest>> {
        match &self.frozen {
            Some(snapshot) if snapshot.id == request_id => Ok(Some(snapshot.clone())),
            _ => self.inner.find_by_id(request_id).await,
        }
    }

    async fn supersede_older(
        &self,
        destination_pipeline_id: PipelineId,
        artifact_id: ArtifactId,
        keep_id: RequestId,
        actor: UserId,
        at: DateTime<Utc>,
    ) -> StoreResult<u64> {
        self.inner
            .supersede_older(destination_pipeline_id, artifact_id, keep_id, actor, at)
            .await
    }

    async fn supersede_by_policy(
        &self,
        policy_id: PolicyId,
        actor: UserId,
        at: DateTime<Utc>,
    ) -> StoreResult<u64> {
        self.inner.supersede_by_policy(policy_id, actor, at).await
    }

    async fn list_awaited_for_artifact(
        &self,
        artifact_id: ArtifactId,
    ) -> StoreResult<Vec<PromotionRequest>> {
        self.inner.list_awaited_for_artifact(artifact_id).await
    }
}

