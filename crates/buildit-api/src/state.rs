//! Application state.

use buildit_config::SystemConfig;
use buildit_core::Result;
use buildit_core::security::Authorizer;
use buildit_executor::{ArtifactArchiver, LocalScmProvider, ShellStepRunner};
use buildit_scheduler::{ProjectScheduler, SchedulerOptions, Toolchain};
use std::sync::Arc;
use tracing::warn;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: ProjectScheduler,
}

impl AppState {
    pub fn new(scheduler: ProjectScheduler) -> Self {
        Self { scheduler }
    }

    /// Open the scheduler described by `config` with the local backends,
    /// checking permissions against its `authorization` block.
    pub fn open(config: &SystemConfig) -> Result<Self> {
        if config.authorization.allow_all {
            warn!("Permission checks are disabled");
        }
        Self::with_authorizer(config, config.authorization.authorizer())
    }

    pub fn with_authorizer(config: &SystemConfig, authorizer: Arc<dyn Authorizer>) -> Result<Self> {
        let scheduler =
            ProjectScheduler::open(SchedulerOptions::from_system(config), local_toolchain(), authorizer)?;
        Ok(Self::new(scheduler))
    }
}

/// Shell steps, artifact archiving and local-directory sources.
pub fn local_toolchain() -> Toolchain {
    Toolchain {
        steps: Arc::new(ShellStepRunner::default()),
        publisher: Arc::new(ArtifactArchiver),
        scm: Arc::new(LocalScmProvider),
    }
}
