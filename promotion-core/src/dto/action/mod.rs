//! Action DTOs
//!
//! A single action envelope carries any of the three verbs. The JSON field
//! names follow the shape callers already send.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::promotion::{ApproveResponse, CancelResponse, PromoteResponse};
use crate::domain::workflow::PipelineKind;
use crate::domain::{AppId, ArtifactId, PipelineId, RequestId, WorkflowId};

/// Verb of an action request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Promote,
    Approve,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown action '{0}', expected PROMOTE, APPROVE or CANCEL")]
pub struct UnknownAction(pub String);

impl FromStr for Action {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PROMOTE" => Ok(Action::Promote),
            "APPROVE" => Ok(Action::Approve),
            "CANCEL" => Ok(Action::Cancel),
            other => Err(UnknownAction(other.to_string())),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Promote => write!(f, "PROMOTE"),
            Action::Approve => write!(f, "APPROVE"),
            Action::Cancel => write!(f, "CANCEL"),
        }
    }
}

/// Raw action envelope
///
/// `action` stays a string so unknown verbs reach the dispatcher and are
/// rejected there with an input error instead of a parse failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub action: String,
    #[serde(default)]
    pub source_name: Option<String>,
    #[serde(default)]
    pub source_type: Option<PipelineKind>,
    #[serde(default)]
    pub source_pipeline_id: Option<PipelineId>,
    #[serde(default)]
    pub promotion_request_id: Option<RequestId>,
    #[serde(default)]
    pub artifact_id: Option<ArtifactId>,
    #[serde(default)]
    pub destination_object_names: Vec<String>,
    #[serde(default)]
    pub workflow_id: Option<WorkflowId>,
    #[serde(default)]
    pub app_id: Option<AppId>,
}

/// Response to a dispatched action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "result", rename_all = "UPPERCASE")]
pub enum ActionResponse {
    Promote(PromoteResponse),
    Approve(ApproveResponse),
    Cancel(CancelResponse),
}
