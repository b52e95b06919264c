//! CLI command implementations.

pub mod build;
pub mod history;

use anyhow::{Context, Result};
use buildit_config::ItemBody;
use std::path::Path;

pub fn validate(path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    match buildit_config::parse_items(&content) {
        Ok(items) => {
            for item in &items {
                match &item.body {
                    ItemBody::Project(config) => println!(
                        "project {} ({} steps, {} triggers)",
                        item.name,
                        config.steps.len(),
                        config.triggers.list().len()
                    ),
                    ItemBody::Folder { .. } => println!("folder {}", item.name),
                }
            }
            println!("Configuration is valid");
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}
