use asiaq_core::StdRandom;
use asiaq_state::Environment;

use super::context::App;

pub fn create(app: &App, name: &str, env_type: Option<&str>, dry_run: bool) -> anyhow::Result<()> {
    let env = app
        .manager()
        .create(name, env_type, &mut StdRandom::from_os(), dry_run)?;
    if dry_run {
        println!("Would create environment {name}:");
    } else {
        println!("✓ Environment {name} created ({})", env.id);
    }
    print_layout(&env);
    Ok(())
}

pub fn update(app: &App, name: &str, dry_run: bool) -> anyhow::Result<()> {
    let env = app.manager().update(name, &mut StdRandom::from_os(), dry_run)?;
    if dry_run {
        println!("Would update environment {name}:");
    } else {
        println!("✓ Environment {name} updated");
    }
    print_layout(&env);
    Ok(())
}

pub async fn destroy(app: &App, name: &str, dry_run: bool) -> anyhow::Result<()> {
    let groups = app.manager().destroy(name, dry_run).await?;
    if dry_run {
        println!("Would destroy environment {name} and {groups} group(s)");
    } else {
        println!("✓ Environment {name} destroyed ({groups} group(s) removed)");
    }
    Ok(())
}

pub fn list(app: &App, json: bool) -> anyhow::Result<()> {
    let envs = app.manager().list()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&envs)?);
        return Ok(());
    }
    if envs.is_empty() {
        println!("No environments.");
        return Ok(());
    }
    println!("{:<20} {:<12} {:<18} {}", "NAME", "TYPE", "RANGE", "ID");
    for env in &envs {
        println!("{:<20} {:<12} {:<18} {}", env.name, env.env_type, env.range.to_string(), env.id);
    }
    Ok(())
}

fn print_layout(env: &Environment) {
    println!("  Range: {} (from {})", env.range, env.parent_space);
    for meta in &env.metanetworks {
        println!("  {:<12} {:<18} {} subnet(s)", meta.name.to_string(), meta.range.to_string(), meta.subnets.len());
    }
}
