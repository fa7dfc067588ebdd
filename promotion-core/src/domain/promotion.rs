//! Promotion request domain types
//!
//! A promotion request moves one artifact onto one destination CD pipeline.
//! Its status follows a small state machine:
//!
//! ```text
//!            (quorum = 0)
//!   ∅ ─────────────────────────────► Promoted
//!   ∅ ──► AwaitingApproval ─────────► Promoted   (quorum reached)
//!                 │ └───────────────► Canceled   (by requester)
//!                 └─────────────────► Superseded (newer request / policy change)
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::workflow::PipelineKind;
use super::{ArtifactId, PipelineId, PolicyId, RequestId, UserId};

/// Status of a promotion request
///
/// Discriminants match the integers already stored in the database and must
/// not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum PromotionStatus {
    Promoted = 0,
    Canceled = 1,
    AwaitingApproval = 2,
    Superseded = 3,
}

impl PromotionStatus {
    pub fn as_db(self) -> i32 {
        self as i32
    }

    /// Terminal statuses never transition again
    pub fn is_terminal(self) -> bool {
        !matches!(self, PromotionStatus::AwaitingApproval)
    }

    /// Checks a transition against the state machine; `None` is a record
    /// that does not exist yet.
    pub fn can_transition(from: Option<Self>, to: Self) -> bool {
        use PromotionStatus::*;
        match from {
            None => matches!(to, AwaitingApproval | Promoted),
            Some(AwaitingApproval) => matches!(to, Promoted | Canceled | Superseded),
            Some(_) => false,
        }
    }
}

impl TryFrom<i32> for PromotionStatus {
    type Error = UnknownStatus;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PromotionStatus::Promoted),
            1 => Ok(PromotionStatus::Canceled),
            2 => Ok(PromotionStatus::AwaitingApproval),
            3 => Ok(PromotionStatus::Superseded),
            other => Err(UnknownStatus(other)),
        }
    }
}

impl fmt::Display for PromotionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PromotionStatus::Promoted => "PROMOTED",
            PromotionStatus::Canceled => "CANCELED",
            PromotionStatus::AwaitingApproval => "AWAITING_APPROVAL",
            PromotionStatus::Superseded => "SUPERSEDED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unknown promotion status value {0}")]
pub struct UnknownStatus(pub i32);

/// Kind of pipeline a promotion was raised from, persisted as an integer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum SourceType {
    Ci = 0,
    Webhook = 1,
    Cd = 2,
}

impl SourceType {
    pub fn as_db(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for SourceType {
    type Error = UnknownSourceType;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SourceType::Ci),
            1 => Ok(SourceType::Webhook),
            2 => Ok(SourceType::Cd),
            other => Err(UnknownSourceType(other)),
        }
    }
}

impl From<PipelineKind> for SourceType {
    fn from(kind: PipelineKind) -> Self {
        match kind {
            PipelineKind::Ci => SourceType::Ci,
            PipelineKind::Webhook => SourceType::Webhook,
            PipelineKind::Cd => SourceType::Cd,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unknown source type value {0}")]
pub struct UnknownSourceType(pub i32);

/// Persisted promotion request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionRequest {
    pub id: RequestId,
    pub source_type: SourceType,
    pub source_pipeline_id: PipelineId,
    pub destination_pipeline_id: PipelineId,
    pub artifact_id: ArtifactId,
    pub status: PromotionStatus,
    pub active: bool,
    pub policy_id: PolicyId,
    pub policy_evaluation_audit_id: Option<i32>,
    pub created_by: UserId,
    pub created_on: DateTime<Utc>,
    pub updated_by: UserId,
    pub updated_on: DateTime<Utc>,
}

impl PromotionRequest {
    pub fn is_awaiting(&self) -> bool {
        self.active && self.status == PromotionStatus::AwaitingApproval
    }
}

/// Data needed to insert a new promotion request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPromotionRequest {
    pub source_type: SourceType,
    pub source_pipeline_id: PipelineId,
    pub destination_pipeline_id: PipelineId,
    pub artifact_id: ArtifactId,
    /// `AwaitingApproval`, or `Promoted` for auto-promotion
    pub status: PromotionStatus,
    pub policy_id: PolicyId,
    pub policy_evaluation_audit_id: Option<i32>,
    pub created_by: UserId,
    pub created_on: DateTime<Utc>,
}

impl NewPromotionRequest {
    /// Materializes the stored record once the store assigned an id
    pub fn into_record(self, id: RequestId) -> PromotionRequest {
        PromotionRequest {
            id,
            source_type: self.source_type,
            source_pipeline_id: self.source_pipeline_id,
            destination_pipeline_id: self.destination_pipeline_id,
            artifact_id: self.artifact_id,
            status: self.status,
            active: true,
            policy_id: self.policy_id,
            policy_evaluation_audit_id: self.policy_evaluation_audit_id,
            created_by: self.created_by,
            created_on: self.created_on,
            updated_by: self.created_by,
            updated_on: self.created_on,
        }
    }
}
