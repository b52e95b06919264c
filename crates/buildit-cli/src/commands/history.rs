//! Build history command.

use anyhow::Result;
use buildit_api::state::local_toolchain;
use buildit_core::security::AllowAll;
use buildit_scheduler::{ProjectScheduler, SchedulerOptions};
use std::path::Path;
use std::sync::Arc;

pub async fn show(root: &Path, project: &str, log: Option<u32>) -> Result<()> {
    let scheduler = ProjectScheduler::open(
        SchedulerOptions::new(root).with_executors(Vec::new()),
        local_toolchain(),
        Arc::new(AllowAll),
    )?;

    if let Some(number) = log {
        print!("{}", scheduler.log(project, number).await?);
        return Ok(());
    }

    let history = scheduler.history(project)?;
    let pointers = scheduler.pointers(project)?;
    if history.is_empty() {
        println!("{project} has no builds");
        return Ok(());
    }

    println!("{:>6}  {:<10}  {:<20}  {:>8}  CAUSE", "BUILD", "RESULT", "STARTED", "DURATION");
    for build in history.all() {
        let result = build
            .result
            .map_or_else(|| "BUILDING".to_string(), |r| r.to_string());
        let duration = build
            .finished_at
            .map(|end| format!("{}s", (end - build.started_at).num_seconds()))
            .unwrap_or_default();
        let cause = build.causes.first().map(ToString::to_string).unwrap_or_default();
        println!(
            "{:>6}  {:<10}  {:<20}  {:>8}  {}",
            build.number,
            result,
            build.started_at.format("%Y-%m-%d %H:%M:%S"),
            duration,
            cause
        );
    }

    if let Some(number) = pointers.last_successful {
        println!("Last successful: #{number}");
    }
    if let Some(number) = pointers.last_stable {
        println!("Last stable: #{number}");
    }
    Ok(())
}
