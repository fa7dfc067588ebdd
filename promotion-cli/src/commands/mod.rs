//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod action;
mod query;

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;
use promotion_core::domain::workflow::PipelineKind;
use promotion_core::domain::{EnvironmentId, UserId};

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Create the tables owned by the engine
    Migrate,
    /// Promote an artifact to one or more environments
    Promote {
        /// Application ID
        #[arg(long)]
        app: i32,

        /// Workflow ID
        #[arg(long)]
        workflow: i32,

        /// Artifact ID
        #[arg(long)]
        artifact: i32,

        /// Kind of the source pipeline: CI, WEBHOOK or CD
        #[arg(long, value_parser = parse_source_type)]
        source_type: PipelineKind,

        /// Source environment name (CD sources)
        #[arg(long)]
        source: Option<String>,

        /// Source pipeline ID
        #[arg(long)]
        source_pipeline: Option<i32>,

        /// Destination environment names
        #[arg(long = "dest", required = true)]
        destinations: Vec<String>,

        /// Environments the user may act on, as name=id
        #[arg(long = "authorized", value_parser = parse_authorized)]
        authorized: Vec<(String, EnvironmentId)>,

        /// Acting user ID
        #[arg(long)]
        user: UserId,
    },
    /// Approve a pending promotion request
    Approve {
        /// Promotion request ID
        #[arg(long)]
        request: i32,

        /// Acting user ID
        #[arg(long)]
        user: UserId,
    },
    /// Cancel a pending promotion request
    Cancel {
        /// Promotion request ID
        #[arg(long)]
        request: i32,

        /// Acting user ID
        #[arg(long)]
        user: UserId,
    },
    /// Dispatch a raw action request from a JSON file
    Apply {
        /// Path to the action JSON
        #[arg(long)]
        file: PathBuf,

        /// Environments the user may act on, as name=id
        #[arg(long = "authorized", value_parser = parse_authorized)]
        authorized: Vec<(String, EnvironmentId)>,

        /// Acting user ID
        #[arg(long)]
        user: UserId,
    },
    /// Show a promotion request with its approvals
    Show {
        /// Promotion request ID
        #[arg(long)]
        request: i32,
    },
    /// List the environments of a workflow as promotion targets
    Targets {
        /// Workflow ID
        #[arg(long)]
        workflow: i32,

        /// Evaluate against this artifact
        #[arg(long)]
        artifact: Option<i32>,

        /// Environments the user may act on, as name=id
        #[arg(long = "authorized", value_parser = parse_authorized)]
        authorized: Vec<(String, EnvironmentId)>,
    },
    /// List pending requests of an artifact the user could approve
    Eligibility {
        /// Artifact ID
        #[arg(long)]
        artifact: i32,

        /// Only this environment
        #[arg(long)]
        env: Option<String>,

        /// Acting user ID
        #[arg(long)]
        user: UserId,
    },
    /// Supersede pending requests raised under a deleted policy
    PolicyRemoved {
        /// Policy ID
        #[arg(long)]
        policy: i32,

        /// Acting user ID
        #[arg(long)]
        user: UserId,
    },
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler module.
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Migrate => action::migrate(config).await,
        Commands::Promote {
            app,
            workflow,
            artifact,
            source_type,
            source,
            source_pipeline,
            destinations,
            authorized,
            user,
        } => {
            let request = action::PromoteArgs {
                app_id: app,
                workflow_id: workflow,
                artifact_id: artifact,
                source_type,
                source_name: source,
                source_pipeline_id: source_pipeline,
                destinations,
                authorized: into_map(authorized),
                user_id: user,
            };
            action::promote(config, request).await
        }
        Commands::Approve { request, user } => action::approve(config, request, user).await,
        Commands::Cancel { request, user } => action::cancel(config, request, user).await,
        Commands::Apply {
            file,
            authorized,
            user,
        } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            action::apply(config, &raw, &into_map(authorized), user).await
        }
        Commands::PolicyRemoved { policy, user } => {
            action::policy_removed(config, policy, user).await
        }
        Commands::Show { request } => query::show(config, request).await,
        Commands::Targets {
            workflow,
            artifact,
            authorized,
        } => query::targets(config, workflow, artifact, &into_map(authorized)).await,
        Commands::Eligibility {
            artifact,
            env,
            user,
        } => query::eligibility(config, artifact, env.as_deref(), user).await,
    }
}

// =============================================================================
// Argument Parsers
// =============================================================================

/// Parses a `name=id` pair
fn parse_authorized(value: &str) -> Result<(String, EnvironmentId), String> {
    let (name, id) = value
        .split_once('=')
        .ok_or_else(|| format!("expected name=id, got '{value}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("environment name missing in '{value}'"));
    }
    let id = id
        .trim()
        .parse::<EnvironmentId>()
        .map_err(|e| format!("invalid environment id in '{value}': {e}"))?;
    Ok((name.to_string(), id))
}

fn parse_source_type(value: &str) -> Result<PipelineKind, String> {
    match value.to_ascii_uppercase().as_str() {
        "CI" => Ok(PipelineKind::Ci),
        "WEBHOOK" => Ok(PipelineKind::Webhook),
        "CD" => Ok(PipelineKind::Cd),
        _ => Err(format!("unknown source type '{value}', expected CI, WEBHOOK or CD")),
    }
}

fn into_map(pairs: Vec<(String, EnvironmentId)>) -> BTreeMap<String, EnvironmentId> {
    pairs.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_authorized() {
        assert_eq!(parse_authorized("prod=200"), Ok(("prod".to_string(), 200)));
        assert_eq!(parse_authorized(" qa = 7 "), Ok(("qa".to_string(), 7)));
        assert!(parse_authorized("prod").is_err());
        assert!(parse_authorized("=3").is_err());
        assert!(parse_authorized("prod=abc").is_err());
    }

    #[test]
    fn test_parse_source_type() {
        assert_eq!(parse_source_type("cd"), Ok(PipelineKind::Cd));
        assert_eq!(parse_source_type("Webhook"), Ok(PipelineKind::Webhook));
        assert!(parse_source_type("DEPLOY").is_err());
    }

    #[test]
    fn test_later_authorized_pair_wins() {
        let map = into_map(vec![("prod".into(), 1), ("prod".into(), 2)]);
        assert_eq!(map.get("prod"), Some(&2));
    }
}
