//! Offload every camera card mounted under a directory.
//!
//! ```text
//! cargo run -p core-service --example offload_demo -- /media/jo ~/Pictures Trip
//! ```
//!
//! Set `RUST_LOG=core_offload=debug` for per-file logs.

use anyhow::{bail, Context};
use bridge_traits::LogLevel;
use core_runtime::logging::{init_logging, LogFormat, LoggingConfig};
use core_service::{bootstrap_desktop, CoreEvent, TaskStatus};
use std::path::PathBuf;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let (Some(mounts), Some(destination)) = (args.next(), args.next()) else {
        bail!("usage: offload_demo <mount root> <destination> [prefix]");
    };
    let prefix = args.next().unwrap_or_default();

    let logging = LoggingConfig::default()
        .with_format(LogFormat::Compact)
        .with_level(LogLevel::Info);
    let logging = match std::env::var("RUST_LOG") {
        Ok(filter) => logging.with_filter(filter),
        Err(_) => logging,
    };
    init_logging(logging).context("failed to initialize logging")?;

    let service = bootstrap_desktop(vec![PathBuf::from(mounts)], |builder| {
        builder
            .write_manifest(true)
            .stall_timeout(Duration::from_secs(120))
    })?;

    let mut events = service.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match &event {
                CoreEvent::Transfer(_) => {}
                _ => println!("{}: {:?}", event.description(), event),
            }
        }
    });

    service.start_discovery().await?;
    // Discovery reports through callbacks; give the scan a moment
    tokio::time::sleep(Duration::from_millis(500)).await;

    let devices = service.devices();
    if devices.is_empty() {
        bail!("no camera cards found");
    }

    for device in devices {
        println!("Queueing {} ({})", device.display_name(), device.id);
        service.select_device(&device).await?;
        service
            .enqueue(device, PathBuf::from(&destination), prefix.clone())
            .await?;
    }

    service.start().await?;
    let snapshot = service.wait_until_idle().await?;

    for task in &snapshot.tasks {
        match task.status {
            TaskStatus::Done => println!(
                "{}: {} files into {}",
                task.device.display_name(),
                task.progress.files_completed,
                task.subdirectory().display()
            ),
            _ => println!(
                "{}: {} ({})",
                task.device.display_name(),
                task.status,
                task.error_detail.as_deref().unwrap_or("no detail")
            ),
        }
    }

    service.shutdown().await;
    Ok(())
}
