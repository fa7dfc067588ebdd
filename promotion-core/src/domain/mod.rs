//! Core domain types
//!
//! This module contains the domain structures the promotion engine reasons about.
//! Pipelines, workflows, artifacts and policies are owned by external services and
//! only read here; promotion requests and approvals are owned by the engine.

pub mod ancestry;
pub mod approval;
pub mod artifact;
pub mod outcome;
pub mod policy;
pub mod promotion;
pub mod workflow;

/// Identifier of a CI, webhook or CD pipeline.
pub type PipelineId = i32;

/// Identifier of a workflow (a DAG of pipelines).
pub type WorkflowId = i32;

/// Identifier of an application owning workflows.
pub type AppId = i32;

/// Identifier of a deployment environment.
pub type EnvironmentId = i32;

/// Identifier of a build artifact.
pub type ArtifactId = i32;

/// Identifier of a promotion request record.
pub type RequestId = i32;

/// Identifier of a promotion policy.
pub type PolicyId = i32;

/// Identifier of a user.
pub type UserId = i32;
