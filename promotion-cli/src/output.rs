//! Terminal output
//!
//! Colored tables for humans, pretty JSON for scripts.

use anyhow::Result;
use colored::*;
use promotion_core::domain::outcome::PromotionOutcome;
use promotion_core::domain::promotion::PromotionStatus;
use promotion_core::dto::promotion::{
    ApprovalEligibility, ApproveResponse, CancelResponse, PromoteResponse, PromotionTarget,
    RequestDetails,
};
use serde::Serialize;

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn print_promote(response: &PromoteResponse, json: bool) -> Result<()> {
    if json {
        return print_json(response);
    }

    println!("{}", "Promotion results:".bold());
    println!("{}", "─".repeat(80).dimmed());
    for (environment, outcome) in &response.outcomes {
        println!(
            "  {:<24} {:<30} {}",
            environment.cyan(),
            colorize_outcome(outcome.outcome),
            outcome.message.dimmed()
        );
    }
    println!("{}", "─".repeat(80).dimmed());
    Ok(())
}

pub fn print_approve(response: &ApproveResponse, json: bool) -> Result<()> {
    if json {
        return print_json(response);
    }

    println!("{}", "Approval recorded:".bold());
    println!("  Request:     {}", response.request_id.to_string().cyan());
    println!("  Environment: {}", response.environment);
    println!(
        "  Approvals:   {}/{}",
        response.approvals, response.required_approvers
    );
    println!("  Status:      {}", colorize_status(response.status));
    println!("  Outcome:     {}", colorize_outcome(response.outcome));
    Ok(())
}

pub fn print_cancel(response: &CancelResponse, json: bool) -> Result<()> {
    if json {
        return print_json(response);
    }

    println!(
        "{} Request {} is {}",
        "✓".green(),
        response.request_id.to_string().cyan(),
        colorize_status(response.status)
    );
    Ok(())
}

pub fn print_request(details: &RequestDetails, json: bool) -> Result<()> {
    if json {
        return print_json(details);
    }

    let request = &details.request;
    println!("{}", "Promotion Request:".bold());
    println!("  ID:           {}", request.id.to_string().cyan());
    println!("  Artifact:     {}", request.artifact_id);
    println!(
        "  Source:       pipeline {} ({:?})",
        request.source_pipeline_id, request.source_type
    );
    println!(
        "  Destination:  pipeline {} ({})",
        request.destination_pipeline_id,
        details.environment.as_deref().unwrap_or("unknown")
    );
    println!("  Status:       {}", colorize_status(request.status));
    println!("  Active:       {}", request.active);
    println!("  Policy:       {}", request.policy_id);
    println!(
        "  Created:      {} by user {}",
        request.created_on.format("%Y-%m-%d %H:%M:%S"),
        request.created_by
    );
    println!(
        "  Updated:      {} by user {}",
        request.updated_on.format("%Y-%m-%d %H:%M:%S"),
        request.updated_by
    );

    if details.approvals.is_empty() {
        println!("\n{}", "No approvals yet.".yellow());
    } else {
        println!("\n{}", "Approvals:".bold());
        for approval in &details.approvals {
            println!(
                "  {} user {} at {}",
                "▸".cyan(),
                approval.user_id,
                approval
                    .created_on
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string()
                    .dimmed()
            );
        }
    }
    Ok(())
}

pub fn print_targets(targets: &[PromotionTarget], json: bool) -> Result<()> {
    if json {
        return print_json(&targets);
    }

    if targets.is_empty() {
        println!("{}", "No CD environments in this workflow.".yellow());
        return Ok(());
    }

    println!("{}", format!("Found {} environment(s):", targets.len()).bold());
    println!();
    for target in targets {
        let marker = if target.promotion_possible {
            "✓".green()
        } else {
            "✗".red()
        };
        println!("  {} {}", marker, target.environment.cyan());
        println!("    Pipeline:  {}", target.pipeline_id.to_string().dimmed());
        if let Some(required) = target.required_approvers {
            println!("    Approvers: {}", required);
        }
        if target.outcome != PromotionOutcome::Empty {
            println!("    State:     {}", colorize_outcome(target.outcome));
        }
        println!();
    }
    Ok(())
}

pub fn print_eligibility(entries: &[ApprovalEligibility], json: bool) -> Result<()> {
    if json {
        return print_json(&entries);
    }

    if entries.is_empty() {
        println!("{}", "No pending requests found.".yellow());
        return Ok(());
    }

    for entry in entries {
        let marker = if entry.approval_allowed {
            "✓".green()
        } else {
            "✗".red()
        };
        println!(
            "  {} {} (request {})",
            marker,
            entry.environment.cyan(),
            entry.request_id
        );
        for reason in &entry.reasons {
            println!("    {}", reason.to_string().dimmed());
        }
    }
    Ok(())
}

fn colorize_outcome(outcome: PromotionOutcome) -> ColoredString {
    let label = outcome.to_string();
    match outcome {
        PromotionOutcome::PromotionSuccessful => label.green(),
        PromotionOutcome::SentForApproval => label.yellow(),
        PromotionOutcome::Errored => label.red().bold(),
        PromotionOutcome::NoPermission
        | PromotionOutcome::PipelineNotFound
        | PromotionOutcome::SourceDestinationMismatch
        | PromotionOutcome::PolicyNotConfigured => label.red(),
        PromotionOutcome::ArtifactAlreadyPromoted
        | PromotionOutcome::AlreadyRequestRaised
        | PromotionOutcome::Empty => label.dimmed(),
    }
}

fn colorize_status(status: PromotionStatus) -> ColoredString {
    let label = status.to_string();
    match status {
        PromotionStatus::Promoted => label.green(),
        PromotionStatus::AwaitingApproval => label.yellow(),
        PromotionStatus::Canceled => label.dimmed(),
        PromotionStatus::Superseded => label.red(),
    }
}
