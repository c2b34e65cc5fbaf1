use std::path::Path;

use anyhow::bail;

use asiaq_rollout::{DeployFilter, DeployOutcome};
use asiaq_state::{DeploymentAttempt, TestOutcome};

use super::context::{App, load_pipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Test,
    Update,
}

pub async fn deploy(app: &App, mode: Mode, pipeline: &Path, filter: DeployFilter) -> anyhow::Result<()> {
    let env = app.environment()?;
    let pipeline = load_pipeline(pipeline, &[])?;
    let orchestrator = app.orchestrator()?;
    let outcome = match mode {
        Mode::Test => orchestrator.deploy_test(&env, &pipeline, &filter).await?,
        Mode::Update => orchestrator.deploy_update(&env, &pipeline, &filter).await?,
    };

    match outcome {
        DeployOutcome::Nothing => {
            println!("Nothing to deploy in {env}.");
            Ok(())
        }
        DeployOutcome::Planned { hostclass, image_id } => {
            println!("Would deploy {image_id} to {hostclass} in {env}");
            Ok(())
        }
        DeployOutcome::Attempted(attempt) => {
            print_attempt(&attempt);
            if !attempt.phase.is_success() {
                bail!(
                    "deployment {} of {} ended {}",
                    attempt.id,
                    attempt.hostclass,
                    attempt.phase
                );
            }
            Ok(())
        }
    }
}

pub async fn recover(app: &App) -> anyhow::Result<()> {
    let env = app.environment()?;
    let recovered = app.orchestrator()?.recover(&env).await?;
    if recovered.is_empty() {
        println!("No interrupted deployments in {env}.");
    }
    for attempt in &recovered {
        print_attempt(attempt);
    }
    Ok(())
}

pub fn history(app: &App, json: bool) -> anyhow::Result<()> {
    let env = app.environment()?;
    let attempts = app.store.list_attempts(&env)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&attempts)?);
        return Ok(());
    }
    println!(
        "{:<18} {:<16} {:<11} {:<24} {}",
        "ATTEMPT", "HOSTCLASS", "STRATEGY", "IMAGE", "PHASE"
    );
    for a in &attempts {
        println!(
            "{:<18} {:<16} {:<11} {:<24} {}",
            a.id,
            a.hostclass,
            a.strategy.to_string(),
            a.image_id,
            a.phase
        );
    }
    Ok(())
}

fn outcome(outcome: Option<&TestOutcome>) -> String {
    match outcome {
        None => "-".to_string(),
        Some(TestOutcome::Passed) => "passed".to_string(),
        Some(TestOutcome::Skipped) => "skipped".to_string(),
        Some(TestOutcome::Failed { reason }) => format!("failed ({reason})"),
    }
}

fn print_attempt(attempt: &DeploymentAttempt) {
    let mark = if attempt.phase.is_success() { "✓" } else { "✗" };
    println!(
        "{mark} {} {} {} → {} ({})",
        attempt.id, attempt.strategy, attempt.hostclass, attempt.image_id, attempt.phase
    );
    if let Some(group) = &attempt.stable_group {
        println!("  Stable group: {group}");
    }
    if let Some(group) = &attempt.new_group {
        println!("  New group:    {group}");
    }
    println!("  Smoke:        {}", outcome(attempt.smoke.as_ref()));
    println!("  Integration:  {}", outcome(attempt.integration.as_ref()));
    if let Some(error) = &attempt.error {
        println!("  Error:        {error}");
    }
}
