//! Approval ledger domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::promotion::PromotionStatus;
use super::{RequestId, UserId};

/// One user's approval of a promotion request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub request_id: RequestId,
    pub user_id: UserId,
    pub created_on: DateTime<Utc>,
}

/// Result of writing an approval to the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalRecord {
    Added,
    /// The user had already approved this request
    Duplicate,
    /// The request no longer accepts approvals
    Ineligible,
}

/// Ledger state after an approval was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalProgress {
    pub record: ApprovalRecord,
    pub approvals: u64,
    /// Request status once the write committed
    pub status: PromotionStatus,
}

impl ApprovalProgress {
    /// True when this write performed the AwaitingApproval -> Promoted move
    /// or found it already done.
    pub fn is_promoted(&self) -> bool {
        self.status == PromotionStatus::Promoted
    }
}
