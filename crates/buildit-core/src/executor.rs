//! Build execution seams.
//!
//! The scheduler owns the build lifecycle; steps and publishers are run
//! through the [`StepRunner`] and [`Publisher`] traits and stream their
//! output into the build log through a [`LogSender`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::channel::mpsc::UnboundedSender;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::project::{PublisherConfig, Step};
use crate::{BuildResult, FullName, ResourceId, Result};

/// Everything a step or publisher needs to know about the running build.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub project: FullName,
    pub project_id: ResourceId,
    pub number: u32,
    /// Shared workspace of the project.
    pub workspace: PathBuf,
    /// Storage directory of this build (`builds/<n>`).
    pub build_dir: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl BuildContext {
    pub fn new(
        project: FullName,
        project_id: ResourceId,
        number: u32,
        workspace: PathBuf,
        build_dir: PathBuf,
    ) -> Self {
        let mut env = BTreeMap::new();
        env.insert("BUILD_NUMBER".to_string(), number.to_string());
        env.insert("JOB_NAME".to_string(), project.to_string());
        env.insert("WORKSPACE".to_string(), workspace.display().to_string());
        Self {
            project,
            project_id,
            number,
            workspace,
            build_dir,
            env,
        }
    }
}

/// A line of log output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub content: String,
}

impl LogLine {
    pub fn new(stream: LogStream, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(LogStream::System, content)
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stream {
            LogStream::System => write!(f, "[buildit] {}", self.content),
            LogStream::Stdout | LogStream::Stderr => f.write_str(&self.content),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

/// Sink for build log lines. Sending never blocks; a closed log drops lines.
pub type LogSender = UnboundedSender<LogLine>;

/// Send a system line, ignoring a closed log.
pub fn log_system(log: &LogSender, content: impl Into<String>) {
    let _ = log.unbounded_send(LogLine::system(content));
}

/// Runs build steps.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Run one step; the returned result is combined into the build result.
    async fn run(&self, ctx: &BuildContext, step: &Step, log: &LogSender) -> Result<BuildResult>;
}

/// Runs post-build actions.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Run one publisher against the result so far and return the result
    /// the build should end with.
    async fn publish(
        &self,
        ctx: &BuildContext,
        config: &PublisherConfig,
        result: BuildResult,
        log: &LogSender,
    ) -> Result<BuildResult>;
}
