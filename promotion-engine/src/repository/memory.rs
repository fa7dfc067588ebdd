//! In-memory store
//!
//! Implements every repository trait over a single mutex-guarded state.
//! Each call takes the lock once, which gives the same all-or-nothing
//! behaviour as one serializable transaction. Used by tests and local runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use promotion_core::domain::approval::{Approval, ApprovalProgress, ApprovalRecord};
use promotion_core::domain::artifact::{Artifact, DeploymentRecord};
use promotion_core::domain::policy::PromotionPolicy;
use promotion_core::domain::promotion::{NewPromotionRequest, PromotionRequest, PromotionStatus};
use promotion_core::domain::workflow::{PipelinePlacement, WorkflowGraph};
use promotion_core::domain::{
    AppId, ArtifactId, EnvironmentId, PipelineId, PolicyId, RequestId, UserId, WorkflowId,
};

use super::{ApprovalLedger, ArtifactRepository, PolicyOracle, RequestRepository, WorkflowRepository};
use crate::error::{StoreError, StoreResult};

#[derive(Default)]
struct State {
    graphs: HashMap<WorkflowId, WorkflowGraph>,
    placements: HashMap<PipelineId, PipelinePlacement>,
    artifacts: HashMap<ArtifactId, Artifact>,
    deployments: Vec<DeploymentRecord>,
    policies: HashMap<(AppId, EnvironmentId), PromotionPolicy>,
    requests: BTreeMap<RequestId, PromotionRequest>,
    last_request_id: RequestId,
    approvals: BTreeMap<RequestId, Vec<Approval>>,
    failing_destinations: HashSet<PipelineId>,
}

impl State {
    // Mirrors the two partial unique indexes
    fn collides(&self, candidate: &PromotionRequest) -> bool {
        self.requests.values().any(|existing| {
            existing.id != candidate.id
                && existing.destination_pipeline_id == candidate.destination_pipeline_id
                && existing.artifact_id == candidate.artifact_id
                && match candidate.status {
                    PromotionStatus::AwaitingApproval => candidate.active && existing.is_awaiting(),
                    PromotionStatus::Promoted => existing.status == PromotionStatus::Promoted,
                    _ => false,
                }
        })
    }

    fn find_by_key(
        &self,
        destination_pipeline_id: PipelineId,
        artifact_id: ArtifactId,
        matches: impl Fn(&PromotionRequest) -> bool,
    ) -> Option<PromotionRequest> {
        self.requests
            .values()
            .find(|r| {
                r.destination_pipeline_id == destination_pipeline_id
                    && r.artifact_id == artifact_id
                    && matches(r)
            })
            .cloned()
    }

    fn transition(
        &mut self,
        request_id: RequestId,
        from: PromotionStatus,
        to: PromotionStatus,
        actor: UserId,
        at: DateTime<Utc>,
    ) -> StoreResult<PromotionRequest> {
        if !PromotionStatus::can_transition(Some(from), to) {
            return Err(StoreError::InvalidTransition { from, to });
        }

        let current = self
            .requests
            .get(&request_id)
            .ok_or_else(|| StoreError::NotFound(format!("promotion request {request_id}")))?;
        if current.status != from || !current.active {
            return Err(StoreError::StaleStatus {
                id: request_id,
                expected: from,
            });
        }

        let mut updated = current.clone();
        updated.status = to;
        updated.updated_by = actor;
        updated.updated_on = at;
        if matches!(to, PromotionStatus::Canceled | PromotionStatus::Superseded) {
            updated.active = false;
        }
        if self.collides(&updated) {
            return Err(StoreError::Conflict(format!(
                "request {request_id} collides with an existing promotion"
            )));
        }

        self.requests.insert(request_id, updated.clone());
        Ok(updated)
    }

    fn supersede_where(
        &mut self,
        actor: UserId,
        at: DateTime<Utc>,
        predicate: impl Fn(&PromotionRequest) -> bool,
    ) -> u64 {
        let mut touched = 0;
        for request in self.requests.values_mut() {
            if request.is_awaiting() && predicate(request) {
                request.status = PromotionStatus::Superseded;
                request.active = false;
                request.updated_by = actor;
                request.updated_on = at;
                touched += 1;
            }
        }
        touched
    }

    fn approval_count(&self, request_id: RequestId) -> u64 {
        self.approvals.get(&request_id).map_or(0, |a| a.len() as u64)
    }

    fn add_approval(&mut self, request_id: RequestId, user_id: UserId, at: DateTime<Utc>) -> ApprovalRecord {
        let ledger = self.approvals.entry(request_id).or_default();
        if ledger.iter().any(|a| a.user_id == user_id) {
            return ApprovalRecord::Duplicate;
        }
        ledger.push(Approval {
            request_id,
            user_id,
            created_on: at,
        });
        ApprovalRecord::Added
    }
}

/// Shared in-memory store implementing every repository trait
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic in another test thread must not poison the remaining assertions
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a workflow and indexes its CD pipelines
    pub fn insert_graph(&self, graph: WorkflowGraph) {
        let mut state = self.state();
        for placement in graph.placements() {
            state.placements.insert(placement.pipeline_id, placement);
        }
        state.graphs.insert(graph.workflow_id(), graph);
    }

    pub fn insert_artifact(&self, artifact: Artifact) {
        self.state().artifacts.insert(artifact.id, artifact);
    }

    pub fn record_deployment(&self, artifact_id: ArtifactId, pipeline_id: PipelineId, at: DateTime<Utc>) {
        self.state().deployments.push(DeploymentRecord {
            artifact_id,
            pipeline_id,
            deployed_at: at,
        });
    }

    pub fn set_policy(&self, app_id: AppId, environment_id: EnvironmentId, policy: PromotionPolicy) {
        self.state().policies.insert((app_id, environment_id), policy);
    }

    pub fn remove_policy(&self, app_id: AppId, environment_id: EnvironmentId) -> Option<PromotionPolicy> {
        self.state().policies.remove(&(app_id, environment_id))
    }

    /// Makes every write for a destination fail as if the database were down
    pub fn fail_writes_for(&self, destination_pipeline_id: PipelineId) {
        self.state().failing_destinations.insert(destination_pipeline_id);
    }

    /// Snapshot of all stored requests, ordered by id
    pub fn requests(&self) -> Vec<PromotionRequest> {
        self.state().requests.values().cloned().collect()
    }
}

#[async_trait]
impl WorkflowRepository for InMemoryStore {
    async fn load_graph(&self, workflow_id: WorkflowId) -> StoreResult<Option<WorkflowGraph>> {
        Ok(self.state().graphs.get(&workflow_id).cloned())
    }

    async fn find_placement(
        &self,
        pipeline_id: PipelineId,
    ) -> StoreResult<Option<PipelinePlacement>> {
        Ok(self.state().placements.get(&pipeline_id).cloned())
    }
}

#[async_trait]
impl ArtifactRepository for InMemoryStore {
    async fn get_artifact(&self, artifact_id: ArtifactId) -> StoreResult<Option<Artifact>> {
        Ok(self.state().artifacts.get(&artifact_id).cloned())
    }

    async fn was_deployed_at(
        &self,
        artifact_id: ArtifactId,
        pipeline_id: PipelineId,
    ) -> StoreResult<bool> {
        Ok(self
            .state()
            .deployments
            .iter()
            .any(|d| d.artifact_id == artifact_id && d.pipeline_id == pipeline_id))
    }
}

#[async_trait]
impl RequestRepository for InMemoryStore {
    async fn find_awaited(
        &self,
        destination_pipeline_id: PipelineId,
        artifact_id: ArtifactId,
    ) -> StoreResult<Option<PromotionRequest>> {
        Ok(self
            .state()
            .find_by_key(destination_pipeline_id, artifact_id, PromotionRequest::is_awaiting))
    }

    async fn find_promoted(
        &self,
        destination_pipeline_id: PipelineId,
        artifact_id: ArtifactId,
    ) -> StoreResult<Option<PromotionRequest>> {
        Ok(self.state().find_by_key(destination_pipeline_id, artifact_id, |r| {
            r.status == PromotionStatus::Promoted
        }))
    }

    async fn create(&self, request: NewPromotionRequest) -> StoreResult<PromotionRequest> {
        if !PromotionStatus::can_transition(None, request.status) {
            return Err(StoreError::corrupt(format!(
                "requests cannot be created as {}",
                request.status
            )));
        }

        let mut state = self.state();
        if state.failing_destinations.contains(&request.destination_pipeline_id) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }

        let record = request.into_record(state.last_request_id + 1);
        if state.collides(&record) {
            return Err(StoreError::Conflict(format!(
                "request for artifact {} on pipeline {} already exists",
                record.artifact_id, record.destination_pipeline_id
            )));
        }

        state.last_request_id = record.id;
        state.requests.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_status(
        &self,
        request_id: RequestId,
        from: PromotionStatus,
        to: PromotionStatus,
        actor: UserId,
        at: DateTime<Utc>,
    ) -> StoreResult<PromotionRequest> {
        self.state().transition(request_id, from, to, actor, at)
    }

    async fn find_by_id(&self, request_id: RequestId) -> StoreResult<Option<PromotionRequest>> {
        Ok(self.state().requests.get(&request_id).cloned())
    }

    async fn supersede_older(
        &self,
        destination_pipeline_id: PipelineId,
        artifact_id: ArtifactId,
        keep_id: RequestId,
        actor: UserId,
        at: DateTime<Utc>,
    ) -> StoreResult<u64> {
        Ok(self.state().supersede_where(actor, at, |r| {
            r.destination_pipeline_id == destination_pipeline_id
                && r.artifact_id == artifact_id
                && r.id < keep_id
        }))
    }

    async fn supersede_by_policy(
        &self,
        policy_id: PolicyId,
        actor: UserId,
        at: DateTime<Utc>,
    ) -> StoreResult<u64> {
        Ok(self
            .state()
            .supersede_where(actor, at, |r| r.policy_id == policy_id))
    }

    async fn list_awaited_for_artifact(
        &self,
        artifact_id: ArtifactId,
    ) -> StoreResult<Vec<PromotionRequest>> {
        Ok(self
            .state()
            .requests
            .values()
            .filter(|r| r.artifact_id == artifact_id && r.is_awaiting())
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PolicyOracle for InMemoryStore {
    async fn policy_for(
        &self,
        app_id: AppId,
        environment_id: EnvironmentId,
    ) -> StoreResult<Option<PromotionPolicy>> {
        Ok(self.state().policies.get(&(app_id, environment_id)).cloned())
    }
}

#[async_trait]
impl ApprovalLedger for InMemoryStore {
    async fn record(
        &self,
        request_id: RequestId,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> StoreResult<ApprovalRecord> {
        let mut state = self.state();
        let request = state
            .requests
            .get(&request_id)
            .ok_or_else(|| StoreError::NotFound(format!("promotion request {request_id}")))?;
        if !request.is_awaiting() {
            return Ok(ApprovalRecord::Ineligible);
        }
        Ok(state.add_approval(request_id, user_id, at))
    }

    async fn count(&self, request_id: RequestId) -> StoreResult<u64> {
        Ok(self.state().approval_count(request_id))
    }

    async fn approvals(&self, request_id: RequestId) -> StoreResult<Vec<Approval>> {
        Ok(self
            .state()
            .approvals
            .get(&request_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn record_and_promote(
        &self,
        request_id: RequestId,
        user_id: UserId,
        at: DateTime<Utc>,
        required_approvers: u32,
    ) -> StoreResult<ApprovalProgress> {
        let mut state = self.state();
        let request = state
            .requests
            .get(&request_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("promotion request {request_id}")))?;

        if !request.is_awaiting() {
            return Ok(ApprovalProgress {
                record: ApprovalRecord::Ineligible,
                approvals: state.approval_count(request_id),
                status: request.status,
            });
        }

        // Transition first so a rejected promotion leaves the ledger untouched
        let approvals_before = state.approval_count(request_id);
        let already_approved = state
            .approvals
            .get(&request_id)
            .is_some_and(|a| a.iter().any(|x| x.user_id == user_id));
        let approvals = if already_approved {
            approvals_before
        } else {
            approvals_before + 1
        };

        let mut status = request.status;
        if approvals >= u64::from(required_approvers) {
            status = state
                .transition(
                    request_id,
                    PromotionStatus::AwaitingApproval,
                    PromotionStatus::Promoted,
                    user_id,
                    at,
                )?
                .status;
        }
        let record = state.add_approval(request_id, user_id, at);

        Ok(ApprovalProgress {
            record,
            approvals,
            status,
        })
    }
}
