//! Local one-shot build command.

use anyhow::{Context, Result};
use buildit_api::state::local_toolchain;
use buildit_config::{ItemBody, ItemDefinition};
use buildit_core::security::AllowAll;
use buildit_core::{Cause, ItemKind};
use buildit_scheduler::{ProjectScheduler, SchedulerOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Register every item in `config_path`, build one project and print its log.
pub async fn run_local(config_path: &Path, project: Option<&str>, root: Option<PathBuf>) -> Result<()> {
    let content = std::fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;
    let items = buildit_config::parse_items(&content)
        .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
    let target = pick_project(&items, project)?;

    // Keep the temporary root alive until the build is done.
    let temp = match root {
        Some(_) => None,
        None => Some(tempfile::tempdir().context("Failed to create a temporary build root")?),
    };
    let root = match (&root, &temp) {
        (Some(root), _) => root.clone(),
        (None, Some(temp)) => temp.path().to_path_buf(),
        (None, None) => anyhow::bail!("no build root"),
    };
    info!(root = %root.display(), "Using build root");

    let scheduler = ProjectScheduler::open(SchedulerOptions::new(&root), local_toolchain(), Arc::new(AllowAll))?;
    for item in items {
        register(&scheduler, item)?;
    }

    scheduler.start();
    let outcome = build_once(&scheduler, &target).await;
    scheduler.shutdown().await;
    outcome
}

async fn build_once(scheduler: &ProjectScheduler, project: &str) -> Result<()> {
    let mut handle = scheduler
        .schedule_build(project, Cause::Cli)?
        .with_context(|| format!("{project} is disabled"))?;
    let number = handle.started().await?;
    println!("Building {project} #{number}");

    let build = handle.wait().await?;
    print!("{}", scheduler.log(project, build.number).await?);

    match build.result {
        Some(result) if result.is_successful() => {
            println!("Finished: {result}");
            Ok(())
        }
        Some(result) => anyhow::bail!("Finished: {result}"),
        None => anyhow::bail!("Build #{number} did not finish"),
    }
}

fn pick_project(items: &[ItemDefinition], wanted: Option<&str>) -> Result<String> {
    let mut projects = items
        .iter()
        .filter(|item| matches!(item.body, ItemBody::Project(_)))
        .map(|item| item.name.as_str());
    match wanted {
        Some(wanted) => projects
            .find(|name| *name == wanted)
            .map(str::to_string)
            .with_context(|| format!("No project named {wanted} in the file")),
        None => {
            let first = projects.next().context("The file defines no project")?;
            if projects.next().is_some() {
                anyhow::bail!("The file defines several projects; pick one with --project");
            }
            Ok(first.to_string())
        }
    }
}

/// Create the item or bring an existing project up to date.
fn register(scheduler: &ProjectScheduler, item: ItemDefinition) -> Result<()> {
    let existing = scheduler.resolve(&item.name).ok().map(|record| record.kind);
    match (item.body, existing) {
        (ItemBody::Folder { .. }, None) => {
            scheduler.create_folder(&item.name)?;
        }
        (ItemBody::Folder { .. }, Some(ItemKind::Folder)) => {}
        (ItemBody::Project(config), None) => {
            scheduler.create_project(&item.name, *config)?;
        }
        (ItemBody::Project(config), Some(ItemKind::Project)) => {
            scheduler.update_config(&item.name, *config)?;
        }
        (_, Some(kind)) => {
            anyhow::bail!("{} already exists as a {kind:?}", item.name);
        }
    }
    Ok(())
}
