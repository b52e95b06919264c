//! Source control seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::executor::LogSender;
use crate::Result;

/// Where a project's sources come from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScmConfig {
    /// No sources; polling never reports changes.
    #[default]
    None,
    /// A local directory mirrored into the workspace.
    Directory { path: PathBuf },
}

/// Result of a change-detection pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollOutcome {
    NoChanges,
    Changes { summary: String },
}

impl PollOutcome {
    pub fn has_changes(&self) -> bool {
        matches!(self, PollOutcome::Changes { .. })
    }
}

/// Source control operations used by polling and builds.
#[async_trait]
pub trait Scm: Send + Sync {
    fn name(&self) -> &'static str;

    /// When true, polling holds the workspace lease exclusively.
    fn requires_workspace_for_polling(&self) -> bool {
        true
    }

    /// Compare the remote state against what was last seen.
    async fn poll_changes(&self, workspace: &Path) -> Result<PollOutcome>;

    /// Bring the workspace up to date before the steps run.
    async fn checkout(&self, _workspace: &Path, _log: &LogSender) -> Result<()> {
        Ok(())
    }
}

/// Creates [`Scm`] instances from configuration.
pub trait ScmProvider: Send + Sync {
    fn for_config(&self, config: &ScmConfig) -> std::sync::Arc<dyn Scm>;
}

/// SCM used for projects without sources.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullScm;

#[async_trait]
impl Scm for NullScm {
    fn name(&self) -> &'static str {
        "none"
    }

    fn requires_workspace_for_polling(&self) -> bool {
        false
    }

    async fn poll_changes(&self, _workspace: &Path) -> Result<PollOutcome> {
        Ok(PollOutcome::NoChanges)
    }
}
