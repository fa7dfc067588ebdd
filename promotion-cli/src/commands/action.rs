//! Action command handlers
//!
//! Commands that change promotion state. Everything goes through the
//! dispatcher so deadlines and authorization apply as for any caller.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use colored::*;
use promotion_core::domain::workflow::PipelineKind;
use promotion_core::domain::{
    AppId, ArtifactId, EnvironmentId, PipelineId, PolicyId, RequestId, UserId, WorkflowId,
};
use promotion_core::dto::action::{ActionRequest, ActionResponse};
use promotion_core::dto::promotion::{ApproveRequest, CancelRequest, PromoteRequest, PromotionSource};
use promotion_engine::db;

use crate::config::Config;
use crate::output;

/// Arguments of the promote command
pub struct PromoteArgs {
    pub app_id: AppId,
    pub workflow_id: WorkflowId,
    pub artifact_id: ArtifactId,
    pub source_type: PipelineKind,
    pub source_name: Option<String>,
    pub source_pipeline_id: Option<PipelineId>,
    pub destinations: Vec<String>,
    pub authorized: BTreeMap<String, EnvironmentId>,
    pub user_id: UserId,
}

pub async fn migrate(config: &Config) -> Result<()> {
    let pool = db::create_pool(&config.engine)
        .await
        .context("Failed to create database pool")?;
    db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;

    println!("{}", "✓ Migrations applied".green());
    Ok(())
}

pub async fn promote(config: &Config, args: PromoteArgs) -> Result<()> {
    let dispatcher = config.connect().await?;

    let request = PromoteRequest {
        artifact_id: args.artifact_id,
        source: PromotionSource {
            kind: args.source_type,
            name: args.source_name,
            pipeline_id: args.source_pipeline_id,
        },
        workflow_id: args.workflow_id,
        app_id: args.app_id,
        destinations: args.destinations,
        authorized: args.authorized,
        user_id: args.user_id,
    };

    let response = dispatcher.promote(request).await?;
    output::print_promote(&response, config.json)
}

pub async fn approve(config: &Config, request_id: RequestId, user_id: UserId) -> Result<()> {
    let dispatcher = config.connect().await?;
    let response = dispatcher
        .approve(ApproveRequest {
            request_id,
            user_id,
        })
        .await?;
    output::print_approve(&response, config.json)
}

pub async fn cancel(config: &Config, request_id: RequestId, user_id: UserId) -> Result<()> {
    let dispatcher = config.connect().await?;
    let response = dispatcher
        .cancel(CancelRequest {
            request_id,
            user_id,
        })
        .await?;
    output::print_cancel(&response, config.json)
}

/// Dispatches a raw action envelope
pub async fn apply(
    config: &Config,
    raw: &str,
    authorized: &BTreeMap<String, EnvironmentId>,
    user_id: UserId,
) -> Result<()> {
    let request = parse_action(raw)?;
    let dispatcher = config.connect().await?;

    match dispatcher.dispatch(request, user_id, authorized).await? {
        ActionResponse::Promote(response) => output::print_promote(&response, config.json),
        ActionResponse::Approve(response) => output::print_approve(&response, config.json),
        ActionResponse::Cancel(response) => output::print_cancel(&response, config.json),
    }
}

pub async fn policy_removed(config: &Config, policy_id: PolicyId, user_id: UserId) -> Result<()> {
    let dispatcher = config.connect().await?;
    let superseded = dispatcher
        .coordinator()
        .on_policy_removed(policy_id, user_id)
        .await?;

    if config.json {
        println!("{}", serde_json::json!({ "policyId": policy_id, "superseded": superseded }));
    } else {
        println!(
            "{}",
            format!("Superseded {} pending request(s) of policy {}", superseded, policy_id).bold()
        );
    }
    Ok(())
}

fn parse_action(raw: &str) -> Result<ActionRequest> {
    serde_json::from_str(raw).context("Invalid action request JSON")
}
