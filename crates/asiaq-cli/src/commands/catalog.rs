//! Image and snapshot catalog commands.

use asiaq_core::{ImageStage, epoch_secs};
use asiaq_state::{Image, Snapshot};

use super::context::App;

pub fn register_image(app: &App, hostclass: &str, id: &str, stage: ImageStage) -> anyhow::Result<()> {
    let image = Image {
        id: id.to_string(),
        hostclass: hostclass.to_string(),
        stage,
        created_at: epoch_secs(),
    };
    app.store.put_image(&image)?;
    println!("✓ Registered {id} for {hostclass} ({stage})");
    Ok(())
}

pub fn list_images(app: &App, hostclass: Option<&str>, json: bool) -> anyhow::Result<()> {
    let images = app.store.list_images(hostclass)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&images)?);
        return Ok(());
    }
    println!("{:<24} {:<16} {:<10} {}", "IMAGE", "HOSTCLASS", "STAGE", "CREATED");
    for image in &images {
        println!(
            "{:<24} {:<16} {:<10} {}",
            image.id,
            image.hostclass,
            image.stage.to_string(),
            image.created_at
        );
    }
    Ok(())
}

pub fn register_snapshot(app: &App, hostclass: &str, id: &str, size_gb: u32) -> anyhow::Result<()> {
    app.store.put_snapshot(&Snapshot {
        id: id.to_string(),
        hostclass: hostclass.to_string(),
        size_gb,
        created_at: epoch_secs(),
    })?;
    println!("✓ Registered snapshot {id} for {hostclass} ({size_gb} GB)");
    Ok(())
}

pub fn list_snapshots(app: &App, hostclass: &str, json: bool) -> anyhow::Result<()> {
    let snapshots = app.store.list_snapshots(hostclass)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshots)?);
        return Ok(());
    }
    println!("{:<24} {:<16} {:>8} {}", "SNAPSHOT", "HOSTCLASS", "SIZE_GB", "CREATED");
    for snapshot in &snapshots {
        println!(
            "{:<24} {:<16} {:>8} {}",
            snapshot.id, snapshot.hostclass, snapshot.size_gb, snapshot.created_at
        );
    }
    Ok(())
}
