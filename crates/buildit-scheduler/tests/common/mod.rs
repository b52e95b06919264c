#![allow(dead_code)]

use async_trait::async_trait;
use buildit_core::executor::{BuildContext, LogLine, LogSender, LogStream, Publisher, StepRunner};
use buildit_core::scm::{PollOutcome, Scm, ScmConfig, ScmProvider};
use buildit_core::security::{AllowAll, Authorizer};
use buildit_core::{BuildResult, Error, ProjectConfig, PublisherConfig, Result, Step};
use buildit_scheduler::{ExecutorSpec, ProjectScheduler, SchedulerOptions, Toolchain};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

/// Interprets shell commands as instructions: `ok`, `unstable`, `fail`,
/// `error` and `sleep <ms>`.
pub struct ScriptedSteps;

#[async_trait]
impl StepRunner for ScriptedSteps {
    async fn run(&self, _ctx: &BuildContext, step: &Step, log: &LogSender) -> Result<BuildResult> {
        let Step::Shell { command } = step;
        let _ = log.unbounded_send(LogLine::new(LogStream::Stdout, format!("+ {command}")));
        match command.split_whitespace().collect::<Vec<_>>().as_slice() {
            ["ok"] => Ok(BuildResult::Success),
            ["unstable"] => Ok(BuildResult::Unstable),
            ["fail"] => Ok(BuildResult::Failure),
            ["sleep", ms] => {
                let ms: u64 = ms.parse().map_err(|_| Error::InvalidInput(command.clone()))?;
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(BuildResult::Success)
            }
            _ => Err(Error::ExecutionFailed(format!("unknown command {command}"))),
        }
    }
}

/// Fails the build when the archive pattern is `fail`.
pub struct ScriptedPublisher;

#[async_trait]
impl Publisher for ScriptedPublisher {
    async fn publish(
        &self,
        _ctx: &BuildContext,
        config: &PublisherConfig,
        result: BuildResult,
        _log: &LogSender,
    ) -> Result<BuildResult> {
        let PublisherConfig::ArchiveArtifacts { pattern, .. } = config;
        if pattern == "fail" {
            return Ok(BuildResult::Failure);
        }
        Ok(result)
    }
}

/// A remote repository whose state the test controls.
#[derive(Default)]
pub struct FakeRemote {
    pub changed: AtomicBool,
    pub poll_delay_ms: AtomicU64,
    pub polls: AtomicUsize,
}

impl FakeRemote {
    pub fn push(&self) {
        self.changed.store(true, Ordering::SeqCst);
    }

    pub fn slow_polls(&self, delay: Duration) {
        self.poll_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

struct FakeScm(Arc<FakeRemote>);

#[async_trait]
impl Scm for FakeScm {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn poll_changes(&self, _workspace: &Path) -> Result<PollOutcome> {
        self.0.polls.fetch_add(1, Ordering::SeqCst);
        let delay = self.0.poll_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.0.changed.swap(false, Ordering::SeqCst) {
            return Ok(PollOutcome::Changes {
                summary: "new commit".to_string(),
            });
        }
        Ok(PollOutcome::NoChanges)
    }
}

pub struct FakeProvider(pub Arc<FakeRemote>);

impl ScmProvider for FakeProvider {
    fn for_config(&self, _config: &ScmConfig) -> Arc<dyn Scm> {
        Arc::new(FakeScm(self.0.clone()))
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub remote: Arc<FakeRemote>,
    pub scheduler: ProjectScheduler,
}

impl Harness {
    pub fn new(executors: usize) -> Self {
        Self::with_authorizer(executors, Arc::new(AllowAll))
    }

    pub fn with_authorizer(executors: usize, authorizer: Arc<dyn Authorizer>) -> Self {
        let executors = (1..=executors)
            .map(|n| ExecutorSpec::new(format!("executor-{n}"), Vec::<String>::new()))
            .collect();
        Self::build(executors, authorizer)
    }

    /// Executors with the given labels.
    pub fn with_executors(executors: Vec<ExecutorSpec>) -> Self {
        Self::build(executors, Arc::new(AllowAll))
    }

    fn build(executors: Vec<ExecutorSpec>, authorizer: Arc<dyn Authorizer>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(FakeRemote::default());
        let scheduler = open(dir.path(), executors, remote.clone(), authorizer);
        Self {
            dir,
            remote,
            scheduler,
        }
    }

    /// Open a second scheduler over the same storage.
    pub fn reopen(&self) -> ProjectScheduler {
        open(self.dir.path(), Vec::new(), self.remote.clone(), Arc::new(AllowAll))
    }
}

fn open(
    root: &Path,
    executors: Vec<ExecutorSpec>,
    remote: Arc<FakeRemote>,
    authorizer: Arc<dyn Authorizer>,
) -> ProjectScheduler {
    let options = SchedulerOptions::new(root).with_executors(executors);
    let toolchain = Toolchain {
        steps: Arc::new(ScriptedSteps),
        publisher: Arc::new(ScriptedPublisher),
        scm: Arc::new(FakeProvider(remote)),
    };
    ProjectScheduler::open(options, toolchain, authorizer).unwrap()
}

pub fn project(commands: &[&str]) -> ProjectConfig {
    ProjectConfig {
        steps: commands
            .iter()
            .map(|c| Step::Shell {
                command: c.to_string(),
            })
            .collect(),
        ..Default::default()
    }
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
