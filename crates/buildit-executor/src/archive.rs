//! Artifact archiving publisher.

use async_trait::async_trait;
use buildit_core::executor::{BuildContext, LogSender, Publisher, log_system};
use buildit_core::{BuildResult, Error, PublisherConfig, Result};
use std::path::Path;
use tracing::{debug, info};

/// Directory under a build's storage that receives archived files.
pub const ARCHIVE_DIR: &str = "archive";

/// Copies workspace files matching a comma-separated list of glob patterns
/// into the build's archive directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArtifactArchiver;

#[async_trait]
impl Publisher for ArtifactArchiver {
    async fn publish(
        &self,
        ctx: &BuildContext,
        config: &PublisherConfig,
        result: BuildResult,
        log: &LogSender,
    ) -> Result<BuildResult> {
        let PublisherConfig::ArchiveArtifacts {
            pattern,
            allow_empty,
            only_if_successful,
        } = config;

        if *only_if_successful && !result.is_successful() {
            log_system(log, "Skipped archiving because build is not successful");
            return Ok(result);
        }

        log_system(log, "Archiving artifacts");
        let workspace = ctx.workspace.clone();
        let target = ctx.build_dir.join(ARCHIVE_DIR);
        let patterns = pattern.clone();
        let archived = tokio::task::spawn_blocking(move || archive(&workspace, &patterns, &target))
            .await
            .map_err(|e| Error::Internal(format!("archive task failed: {e}")))??;

        if archived > 0 {
            info!(project = %ctx.project, build = ctx.number, archived, "Archived artifacts");
            return Ok(result);
        }
        if *allow_empty {
            log_system(log, format!("No artifacts found that match the file pattern \"{pattern}\""));
            return Ok(result);
        }
        log_system(
            log,
            format!(
                "No artifacts found that match the file pattern \"{pattern}\". Configuration error?"
            ),
        );
        Ok(result.combine(BuildResult::Failure))
    }
}

/// Copy matching regular files, keeping their workspace-relative paths.
fn archive(workspace: &Path, patterns: &str, target: &Path) -> Result<usize> {
    if !workspace.is_dir() {
        return Ok(0);
    }
    let base = workspace
        .to_str()
        .ok_or_else(|| Error::InvalidInput("workspace path is not valid UTF-8".to_string()))?;
    let base = glob::Pattern::escape(base);

    let mut archived = 0;
    for pattern in patterns.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let full = format!("{base}/{pattern}");
        let paths = glob::glob(&full)
            .map_err(|e| Error::InvalidInput(format!("bad artifact pattern '{pattern}': {}", e.msg)))?;
        for path in paths {
            let path = path.map_err(|e| Error::Storage(e.into_error()))?;
            if !path.is_file() {
                continue;
            }
            let Ok(relative) = path.strip_prefix(workspace) else {
                continue;
            };
            let dest = target.join(relative);
            if dest.exists() {
                continue;
            }
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&path, &dest)?;
            debug!(file = %relative.display(), "Archived file");
            archived += 1;
        }
    }
    Ok(archived)
}
