use anyhow::bail;

use asiaq_chaos::ChaosSelector;
use asiaq_core::StdRandom;

use super::context::App;

pub async fn chaos(app: &App, level: f64, retainage: f64, dry_run: bool) -> anyhow::Result<()> {
    let env = app.environment()?;
    let selector = ChaosSelector::new(level, retainage)?;
    let report = asiaq_chaos::run(
        app.cloud.as_ref(),
        &env,
        selector,
        &mut StdRandom::from_os(),
        dry_run,
    )
    .await?;

    for victim in &report.victims {
        println!("{:<20} {}", victim.hostclass, victim.instance);
    }
    if dry_run {
        println!("Dry run: {} of {} instance(s) selected", report.victims.len(), report.eligible);
        return Ok(());
    }
    if report.terminated as usize != report.victims.len() {
        bail!(
            "terminated {} of {} selected instance(s)",
            report.terminated,
            report.victims.len()
        );
    }
    println!("✓ Terminated {} of {} instance(s)", report.terminated, report.eligible);
    Ok(())
}
