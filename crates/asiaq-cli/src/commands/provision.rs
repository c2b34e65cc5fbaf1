use std::path::Path;

use anyhow::bail;

use asiaq_autoscale::CapacitySchedule;
use asiaq_config::PipelineEntry;
use asiaq_scheduler::{LaunchReport, RunOptions};
use asiaq_state::TestOutcome;

use super::context::{App, load_pipeline};

/// Size and image overrides for a single `provision`.
#[derive(Debug, Default)]
pub struct Overrides {
    pub min_size: Option<String>,
    pub desired_size: Option<String>,
    pub max_size: Option<String>,
    pub ami: Option<String>,
    pub instance_type: Option<String>,
    pub extra_disk: Option<u32>,
    pub iops: Option<u32>,
}

fn schedule(value: Option<&str>) -> anyhow::Result<Option<CapacitySchedule>> {
    Ok(value.map(CapacitySchedule::parse).transpose()?)
}

pub async fn provision(
    app: &App,
    hostclass: &str,
    overrides: Overrides,
    options: RunOptions,
) -> anyhow::Result<()> {
    let env = app.environment()?;
    let mut entry = PipelineEntry::new(hostclass);
    entry.min_size = schedule(overrides.min_size.as_deref())?;
    entry.desired_size = schedule(overrides.desired_size.as_deref())?;
    entry.max_size = schedule(overrides.max_size.as_deref())?;
    entry.ami = overrides.ami;
    entry.instance_type = overrides.instance_type;
    entry.extra_disk = overrides.extra_disk;
    entry.iops = overrides.iops;

    let launch = app.scheduler()?.provision(entry, &env, options).await?;
    print_launch(&launch);
    Ok(())
}

pub async fn spinup(
    app: &App,
    pipeline: &Path,
    hostclasses: &[String],
    options: RunOptions,
) -> anyhow::Result<()> {
    let env = app.environment()?;
    let pipeline = load_pipeline(pipeline, hostclasses)?;
    if pipeline.is_empty() {
        bail!("pipeline has no entries");
    }
    let report = app.scheduler()?.run(&pipeline, &env, options).await?;
    println!("✓ Environment {} provisioned", report.environment);
    for launch in &report.launches {
        print_launch(launch);
    }
    Ok(())
}

pub async fn spindown(app: &App, pipeline: &Path, hostclasses: &[String]) -> anyhow::Result<()> {
    let env = app.environment()?;
    let pipeline = load_pipeline(pipeline, hostclasses)?;
    let removed = app.scheduler()?.spindown(&pipeline, &env).await?;
    if removed.is_empty() {
        println!("Nothing to spin down in {env}.");
    }
    for group in removed {
        println!("✓ Destroyed {group}");
    }
    Ok(())
}

fn print_launch(launch: &LaunchReport) {
    let smoke = match &launch.smoke {
        TestOutcome::Passed => "smoke passed".to_string(),
        TestOutcome::Skipped => "smoke skipped".to_string(),
        TestOutcome::Failed { reason } => format!("smoke failed: {reason}"),
    };
    println!(
        "  [{}] {:<16} {:<24} {:<16} x{} ({}{})",
        launch.sequence,
        launch.hostclass,
        launch.group,
        launch.image_id,
        launch.desired_size,
        if launch.created { "created, " } else { "" },
        smoke,
    );
}
