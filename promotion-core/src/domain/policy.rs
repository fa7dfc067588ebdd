//! Promotion policy domain types

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::{PolicyId, UserId};

/// Policy governing promotions into one destination environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionPolicy {
    pub id: PolicyId,
    pub name: String,
    /// Distinct approvals needed; zero means auto-promotion
    pub required_approvers: u32,
    /// Users allowed to approve; `None` lets any user approve
    pub approvers: Option<BTreeSet<UserId>>,
    /// Audit row of the policy evaluation that matched this destination
    pub evaluation_audit_id: Option<i32>,
}

/// Why a user may not approve a promotion request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalBlock {
    /// The user triggered the build that produced the artifact
    ImageBuilder,
    /// The user raised the promotion request
    Requester,
    /// The policy does not list the user as an approver
    NotAnApprover,
}

impl fmt::Display for ApprovalBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalBlock::ImageBuilder => write!(f, "user built the image"),
            ApprovalBlock::Requester => write!(f, "user raised the promotion request"),
            ApprovalBlock::NotAnApprover => write!(f, "user is not an approver for this environment"),
        }
    }
}

impl PromotionPolicy {
    /// Auto-promotion applies when no approvals are required
    pub fn is_auto_promote(&self) -> bool {
        self.required_approvers == 0
    }

    /// All reasons `user` is barred from approving, empty when allowed
    pub fn approval_blocks(
        &self,
        user: UserId,
        artifact_producer: UserId,
        requester: UserId,
    ) -> Vec<ApprovalBlock> {
        let mut blocks = Vec::new();
        if user == artifact_producer {
            blocks.push(ApprovalBlock::ImageBuilder);
        }
        if user == requester {
            blocks.push(ApprovalBlock::Requester);
        }
        if self
            .approvers
            .as_ref()
            .is_some_and(|approvers| !approvers.contains(&user))
        {
            blocks.push(ApprovalBlock::NotAnApprover);
        }
        blocks
    }

    /// Eligibility predicate; always rejects the requester and the producer
    pub fn may_approve(&self, user: UserId, artifact_producer: UserId, requester: UserId) -> bool {
        self.approval_blocks(user, artifact_producer, requester).is_empty()
    }

    /// Quorum check for an approval count
    pub fn quorum_reached(&self, approvals: u64) -> bool {
        approvals >= u64::from(self.required_approvers)
    }
}

/// JSON document stored alongside a policy
///
/// Only the approval section is read; other keys are ignored. The approver
/// count is mandatory so a truncated document never reads as auto-promote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDocument {
    pub approval_metadata: ApprovalMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalMetadata {
    pub approver_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approvers: Option<BTreeSet<UserId>>,
}

impl PolicyDocument {
    pub fn into_policy(
        self,
        id: PolicyId,
        name: impl Into<String>,
        evaluation_audit_id: Option<i32>,
    ) -> PromotionPolicy {
        PromotionPolicy {
            id,
            name: name.into(),
            required_approvers: self.approval_metadata.approver_count,
            approvers: self.approval_metadata.approvers,
            evaluation_audit_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(approvers: Option<&[UserId]>) -> PromotionPolicy {
        PromotionPolicy {
            id: 1,
            name: "prod-gate".into(),
            required_approvers: 2,
            approvers: approvers.map(|a| a.iter().copied().collect()),
            evaluation_audit_id: None,
        }
    }

    #[test]
    fn test_requester_and_builder_are_blocked() {
        let p = policy(None);
        assert!(p.may_approve(5, 1, 2));
        assert_eq!(p.approval_blocks(1, 1, 2), vec![ApprovalBlock::ImageBuilder]);
        assert_eq!(p.approval_blocks(2, 1, 2), vec![ApprovalBlock::Requester]);
        assert_eq!(
            p.approval_blocks(3, 3, 3),
            vec![ApprovalBlock::ImageBuilder, ApprovalBlock::Requester]
        );
    }

    #[test]
    fn test_explicit_approver_list() {
        let p = policy(Some(&[7, 8]));
        assert!(p.may_approve(7, 1, 2));
        assert_eq!(p.approval_blocks(9, 1, 2), vec![ApprovalBlock::NotAnApprover]);
    }

    #[test]
    fn test_quorum() {
        let p = policy(None);
        assert!(!p.quorum_reached(1));
        assert!(p.quorum_reached(2));
        assert!(!p.is_auto_promote());
    }

    #[test]
    fn test_document_parsing() {
        let raw = r#"{"approvalMetadata":{"approverCount":3},"conditions":[]}"#;
        let doc: PolicyDocument = serde_json::from_str(raw).unwrap();
        let p = doc.into_policy(4, "qa", Some(11));
        assert_eq!(p.required_approvers, 3);
        assert_eq!(p.approvers, None);
        assert_eq!(p.evaluation_audit_id, Some(11));

        let auto: PolicyDocument =
            serde_json::from_str(r#"{"approvalMetadata":{"approverCount":0}}"#).unwrap();
        assert!(auto.into_policy(5, "dev", None).is_auto_promote());
    }

    #[test]
    fn test_document_without_approver_count_is_rejected() {
        assert!(serde_json::from_str::<PolicyDocument>("{}").is_err());
        assert!(serde_json::from_str::<PolicyDocument>(r#"{"approvalMetadata":{}}"#).is_err());
        assert!(
            serde_json::from_str::<PolicyDocument>(r#"{"approvalMetadata":{"approvers":[1]}}"#)
                .is_err()
        );
    }
}
