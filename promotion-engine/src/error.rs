//! Error types for the promotion engine

use promotion_core::domain::promotion::PromotionStatus;
use promotion_core::domain::workflow::GraphError;
use promotion_core::domain::{RequestId, UserId};
use thiserror::Error;

/// Result type alias for repository operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type alias for service operations
pub type Result<T> = std::result::Result<T, PromotionError>;

/// Errors raised by the repository layer
#[derive(Debug, Error)]
pub enum StoreError {
    /// Row not present
    #[error("Not found: {0}")]
    NotFound(String),

    /// A unique index rejected the write
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Compare-and-set lost: the stored status differs from the expected one
    #[error("Request {id} is no longer {expected}")]
    StaleStatus {
        id: RequestId,
        expected: PromotionStatus,
    },

    /// The state machine does not allow the transition
    #[error("Transition {from} -> {to} is not allowed")]
    InvalidTransition {
        from: PromotionStatus,
        to: PromotionStatus,
    },

    /// Persistence unavailable or query failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Stored data could not be mapped to domain types
    #[error("Corrupt data: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt(message.into())
    }
}

impl From<GraphError> for StoreError {
    fn from(err: GraphError) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

/// Errors surfaced by the coordinator and dispatcher
#[derive(Debug, Error)]
pub enum PromotionError {
    /// Malformed verb, unresolved source, empty destinations
    #[error("Invalid request: {0}")]
    Input(String),

    /// Artifact, request or workflow not present
    #[error("Not found: {0}")]
    NotFound(String),

    /// Actor may not perform this action
    #[error("Forbidden: user {user} {reason}")]
    Forbidden { user: UserId, reason: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Transition not permitted from the current status
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Compare-and-set lost
    #[error("Stale: {0}")]
    Stale(String),

    /// Persistence unavailable; safe to retry
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Deadline of {0:?} exceeded")]
    DeadlineExceeded(std::time::Duration),

    /// Stored data violates a domain invariant
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PromotionError {
    pub fn forbidden(user: UserId, reason: impl Into<String>) -> Self {
        Self::Forbidden {
            user,
            reason: reason.into(),
        }
    }

    /// Check if the caller may safely repeat the operation
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Stale(_))
    }

    /// Check if this error is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<StoreError> for PromotionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => PromotionError::NotFound(msg),
            StoreError::Conflict(msg) => PromotionError::Conflict(msg),
            err @ StoreError::StaleStatus { .. } => PromotionError::Stale(err.to_string()),
            err @ StoreError::InvalidTransition { .. } => {
                PromotionError::InvalidState(err.to_string())
            }
            StoreError::Database(err) => PromotionError::Transient(err.to_string()),
            StoreError::Corrupt(msg) => PromotionError::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_mapping() {
        let stale: PromotionError = StoreError::StaleStatus {
            id: 3,
            expected: PromotionStatus::AwaitingApproval,
        }
        .into();
        assert!(matches!(stale, PromotionError::Stale(_)));
        assert!(stale.is_retryable());

        let transient: PromotionError = StoreError::Database(sqlx::Error::PoolTimedOut).into();
        assert!(matches!(transient, PromotionError::Transient(_)));
        assert!(transient.is_retryable());

        let missing: PromotionError = StoreError::NotFound("request 9".into()).into();
        assert!(missing.is_not_found());
        assert!(!missing.is_retryable());
    }

    #[test]
    fn test_display() {
        let err = PromotionError::forbidden(4, "raised the promotion request");
        assert_eq!(
            err.to_string(),
            "Forbidden: user 4 raised the promotion request"
        );
    }
}
