//! Promotion DTOs

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::approval::Approval;
use crate::domain::outcome::{EnvironmentOutcome, PromotionOutcome};
use crate::domain::policy::ApprovalBlock;
use crate::domain::promotion::{PromotionRequest, PromotionStatus};
use crate::domain::workflow::PipelineKind;
use crate::domain::{
    AppId, ArtifactId, EnvironmentId, PipelineId, PolicyId, RequestId, UserId, WorkflowId,
};

/// Pipeline a promotion is raised from
///
/// Producers are identified by the workflow root; a CD source is identified by
/// its pipeline id or by the name of the environment it deploys to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionSource {
    pub kind: PipelineKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub pipeline_id: Option<PipelineId>,
}

impl PromotionSource {
    pub fn producer(kind: PipelineKind) -> Self {
        Self {
            kind,
            name: None,
            pipeline_id: None,
        }
    }

    pub fn environment(name: impl Into<String>) -> Self {
        Self {
            kind: PipelineKind::Cd,
            name: Some(name.into()),
            pipeline_id: None,
        }
    }
}

/// Request to promote one artifact into several environments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoteRequest {
    pub artifact_id: ArtifactId,
    pub source: PromotionSource,
    pub workflow_id: WorkflowId,
    pub app_id: AppId,
    /// Destination environment names
    pub destinations: Vec<String>,
    /// Environments the caller may promote into, by name
    pub authorized: BTreeMap<String, EnvironmentId>,
    pub user_id: UserId,
}

/// Outcome per destination environment name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoteResponse {
    pub outcomes: BTreeMap<String, EnvironmentOutcome>,
}

impl PromoteResponse {
    /// Seeds every name with the same outcome
    pub fn seeded<'a>(
        names: impl IntoIterator<Item = &'a String>,
        outcome: PromotionOutcome,
    ) -> Self {
        let outcomes = names
            .into_iter()
            .map(|name| (name.clone(), EnvironmentOutcome::new(name.clone(), outcome)))
            .collect();
        Self { outcomes }
    }

    pub fn get(&self, environment: &str) -> Option<&EnvironmentOutcome> {
        self.outcomes.get(environment)
    }

    pub fn outcome(&self, environment: &str) -> Option<PromotionOutcome> {
        self.outcomes.get(environment).map(|o| o.outcome)
    }

    /// Sets an outcome in place, inserting the environment if absent
    pub fn set(&mut self, environment: &str, outcome: PromotionOutcome) -> &mut EnvironmentOutcome {
        let entry = self
            .outcomes
            .entry(environment.to_string())
            .or_insert_with(|| EnvironmentOutcome::new(environment, outcome));
        entry.set(outcome);
        entry
    }

    /// Merges another response; entries of `other` win
    pub fn merge(&mut self, other: PromoteResponse) {
        self.outcomes.extend(other.outcomes);
    }

    pub fn count(&self, outcome: PromotionOutcome) -> usize {
        self.outcomes.values().filter(|o| o.outcome == outcome).count()
    }
}

/// Request to approve a promotion request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproveRequest {
    pub request_id: RequestId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproveResponse {
    pub request_id: RequestId,
    pub environment: String,
    /// `PromotionSuccessful` once quorum is reached, else `SentForApproval`
    pub outcome: PromotionOutcome,
    pub approvals: u64,
    pub required_approvers: u32,
    pub status: PromotionStatus,
}

/// Request to cancel a pending promotion request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub request_id: RequestId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelResponse {
    pub request_id: RequestId,
    pub status: PromotionStatus,
}

/// A CD environment of a workflow as a promotion target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionTarget {
    pub environment: String,
    pub environment_id: EnvironmentId,
    pub pipeline_id: PipelineId,
    pub policy_id: Option<PolicyId>,
    pub required_approvers: Option<u32>,
    pub outcome: PromotionOutcome,
    pub message: String,
    pub promotion_possible: bool,
}

/// Whether a user may approve the pending request for one environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalEligibility {
    pub environment: String,
    pub request_id: RequestId,
    pub approval_allowed: bool,
    pub reasons: Vec<ApprovalBlock>,
}

/// A promotion request with its approvals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDetails {
    pub request: PromotionRequest,
    pub environment: Option<String>,
    pub approvals: Vec<Approval>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_and_set() {
        let names = vec!["dev".to_string(), "prod".to_string()];
        let mut response = PromoteResponse::seeded(&names, PromotionOutcome::PipelineNotFound);
        assert_eq!(response.count(PromotionOutcome::PipelineNotFound), 2);

        response.set("prod", PromotionOutcome::Empty);
        assert_eq!(response.outcome("prod"), Some(PromotionOutcome::Empty));
        assert_eq!(response.outcome("dev"), Some(PromotionOutcome::PipelineNotFound));
    }

    #[test]
    fn test_merge_prefers_other() {
        let names = vec!["qa".to_string()];
        let mut left = PromoteResponse::seeded(&names, PromotionOutcome::NoPermission);
        let right = PromoteResponse::seeded(&names, PromotionOutcome::SentForApproval);
        left.merge(right);
        assert_eq!(left.outcome("qa"), Some(PromotionOutcome::SentForApproval));
    }
}
