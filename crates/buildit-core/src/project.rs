//! Project and folder configuration.

use serde::{Deserialize, Serialize};

use crate::label::LabelExpr;
use crate::scm::ScmConfig;
use crate::trigger::TriggerSet;

/// Kind of an item in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Project,
    Folder,
}

/// Persisted configuration of a project.
///
/// Every field has a default so that replacing a configuration with a
/// partial definition resets whatever the definition leaves out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub description: Option<String>,
    pub disabled: bool,
    pub concurrent_build: bool,
    pub assigned_label: Option<LabelExpr>,
    /// Hold queued builds while an upstream project is queued or building.
    pub block_when_upstream_building: bool,
    pub scm: ScmConfig,
    pub triggers: TriggerSet,
    pub steps: Vec<Step>,
    pub publishers: Vec<PublisherConfig>,
}

impl ProjectConfig {
    /// Names of upstream projects from the upstream trigger, if any.
    pub fn upstream_names(&self) -> Vec<&str> {
        match self.triggers.get(crate::TriggerKind::Upstream) {
            Some(crate::Trigger::Upstream { projects, .. }) => {
                projects.iter().map(String::as_str).collect()
            }
            _ => Vec::new(),
        }
    }
}

/// A build step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    /// Run a command with `sh -c` inside the workspace.
    Shell { command: String },
}

/// A post-build action. Publishers run after the steps and may make the
/// result worse, never better.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PublisherConfig {
    /// Copy workspace files matching `pattern` into the build's archive.
    ArchiveArtifacts {
        pattern: String,
        #[serde(default)]
        allow_empty: bool,
        #[serde(default)]
        only_if_successful: bool,
    },
}
