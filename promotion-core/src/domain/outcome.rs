//! Per-destination promotion outcomes

use std::fmt;

use serde::{Deserialize, Serialize};

/// Result of evaluating one destination environment of a promote action
///
/// This set is closed; callers match on it exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PromotionOutcome {
    /// No CD pipeline deploys to this environment in the workflow
    PipelineNotFound,
    /// Resolved but not yet evaluated
    Empty,
    /// The source is not a proper ancestor of the destination
    SourceDestinationMismatch,
    ArtifactAlreadyPromoted,
    AlreadyRequestRaised,
    NoPermission,
    PolicyNotConfigured,
    PromotionSuccessful,
    SentForApproval,
    Errored,
}

impl PromotionOutcome {
    pub fn default_message(self) -> &'static str {
        match self {
            PromotionOutcome::PipelineNotFound => "pipeline not found",
            PromotionOutcome::Empty => "",
            PromotionOutcome::SourceDestinationMismatch => {
                "source and destination pipeline order mismatch"
            }
            PromotionOutcome::ArtifactAlreadyPromoted => "artifact is already promoted",
            PromotionOutcome::AlreadyRequestRaised => "promotion request already raised",
            PromotionOutcome::NoPermission => "user does not have permission",
            PromotionOutcome::PolicyNotConfigured => "promotion policy not configured",
            PromotionOutcome::PromotionSuccessful => "image promoted",
            PromotionOutcome::SentForApproval => "sent for approval",
            PromotionOutcome::Errored => "error occurred",
        }
    }

    /// Whether a record was written for this destination
    pub fn is_success(self) -> bool {
        matches!(
            self,
            PromotionOutcome::PromotionSuccessful | PromotionOutcome::SentForApproval
        )
    }
}

impl fmt::Display for PromotionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PromotionOutcome::PipelineNotFound => "PIPELINE_NOT_FOUND",
            PromotionOutcome::Empty => "EMPTY",
            PromotionOutcome::SourceDestinationMismatch => "SOURCE_DESTINATION_MISMATCH",
            PromotionOutcome::ArtifactAlreadyPromoted => "ARTIFACT_ALREADY_PROMOTED",
            PromotionOutcome::AlreadyRequestRaised => "ALREADY_REQUEST_RAISED",
            PromotionOutcome::NoPermission => "NO_PERMISSION",
            PromotionOutcome::PolicyNotConfigured => "POLICY_NOT_CONFIGURED",
            PromotionOutcome::PromotionSuccessful => "PROMOTION_SUCCESSFUL",
            PromotionOutcome::SentForApproval => "SENT_FOR_APPROVAL",
            PromotionOutcome::Errored => "ERRORED",
        };
        f.write_str(label)
    }
}

/// Outcome reported for one destination environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentOutcome {
    pub environment: String,
    pub outcome: PromotionOutcome,
    pub message: String,
}

impl EnvironmentOutcome {
    pub fn new(environment: impl Into<String>, outcome: PromotionOutcome) -> Self {
        Self {
            environment: environment.into(),
            outcome,
            message: outcome.default_message().to_string(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Moves to a new outcome with its default message
    pub fn set(&mut self, outcome: PromotionOutcome) {
        self.outcome = outcome;
        self.message = outcome.default_message().to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_names_match_display() {
        let json = serde_json::to_string(&PromotionOutcome::SourceDestinationMismatch).unwrap();
        assert_eq!(json, "\"SOURCE_DESTINATION_MISMATCH\"");
        assert_eq!(
            PromotionOutcome::SourceDestinationMismatch.to_string(),
            "SOURCE_DESTINATION_MISMATCH"
        );
    }

    #[test]
    fn test_set_replaces_message() {
        let mut outcome = EnvironmentOutcome::new("prod", PromotionOutcome::Errored)
            .with_message("connection reset");
        outcome.set(PromotionOutcome::SentForApproval);
        assert_eq!(outcome.message, "sent for approval");
        assert!(outcome.outcome.is_success());
    }
}
