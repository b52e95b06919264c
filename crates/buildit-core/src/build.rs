//! Build records, results and causes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::{Error, ResourceId};

/// Terminal result of a build, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildResult {
    Success,
    Unstable,
    Failure,
    NotBuilt,
    Aborted,
}

impl BuildResult {
    /// Combine two results, keeping the worse one.
    pub fn combine(self, other: BuildResult) -> BuildResult {
        self.max(other)
    }

    /// Success or unstable.
    pub fn is_successful(self) -> bool {
        self <= BuildResult::Unstable
    }

    /// Unambiguously successful.
    pub fn is_stable(self) -> bool {
        self == BuildResult::Success
    }

    pub fn is_better_or_equal(self, threshold: BuildResult) -> bool {
        self <= threshold
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BuildResult::Success => "SUCCESS",
            BuildResult::Unstable => "UNSTABLE",
            BuildResult::Failure => "FAILURE",
            BuildResult::NotBuilt => "NOT_BUILT",
            BuildResult::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for BuildResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BuildResult {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "SUCCESS" => Ok(BuildResult::Success),
            "UNSTABLE" => Ok(BuildResult::Unstable),
            "FAILURE" => Ok(BuildResult::Failure),
            "NOT_BUILT" => Ok(BuildResult::NotBuilt),
            "ABORTED" => Ok(BuildResult::Aborted),
            _ => Err(Error::InvalidInput(format!("unknown build result: {s}"))),
        }
    }
}

/// Why a build was requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Cause {
    /// Started by a user through the API.
    User { user: String },
    /// A timer trigger fired.
    Timer,
    /// Polling detected a change.
    ScmChange,
    /// An upstream project finished a build.
    Upstream { project: String, number: u32 },
    /// Started from the command line.
    Cli,
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::User { user } => write!(f, "Started by user {user}"),
            Cause::Timer => f.write_str("Started by timer"),
            Cause::ScmChange => f.write_str("Started by an SCM change"),
            Cause::Upstream { project, number } => {
                write!(f, "Started by upstream project \"{project}\" build number {number}")
            }
            Cause::Cli => f.write_str("Started from command line"),
        }
    }
}

/// One numbered execution of a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    /// Stable id of the owning project.
    pub project: ResourceId,
    /// Build number, unique per project and never reused.
    pub number: u32,
    /// Queue item this build was started from.
    pub queue_id: ResourceId,
    pub causes: Vec<Cause>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// `None` while the build is in progress.
    pub result: Option<BuildResult>,
    /// Workspace the build ran in.
    pub workspace: PathBuf,
    /// Executor that ran the build.
    pub executor: String,
}

impl Build {
    pub fn is_building(&self) -> bool {
        self.result.is_none()
    }
}
