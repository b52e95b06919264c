//! Shell build steps.

use async_trait::async_trait;
use buildit_core::executor::{BuildContext, LogLine, LogSender, LogStream, StepRunner, log_system};
use buildit_core::{BuildResult, Error, Result, Step};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::debug;

/// Runs [`Step::Shell`] commands with `<shell> -c` inside the workspace.
pub struct ShellStepRunner {
    shell: PathBuf,
}

impl ShellStepRunner {
    pub fn new(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for ShellStepRunner {
    fn default() -> Self {
        Self::new("sh")
    }
}

#[async_trait]
impl StepRunner for ShellStepRunner {
    async fn run(&self, ctx: &BuildContext, step: &Step, log: &LogSender) -> Result<BuildResult> {
        let Step::Shell { command } = step;
        tokio::fs::create_dir_all(&ctx.workspace).await?;
        log_system(log, format!("$ {command}"));
        debug!(project = %ctx.project, build = ctx.number, %command, "Running shell step");

        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .current_dir(&ctx.workspace)
            .envs(&ctx.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::ExecutionFailed(format!("failed to start {}: {e}", self.shell.display()))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("child stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("child stderr not captured".to_string()))?;

        let (status, out, err) = tokio::join!(
            child.wait(),
            forward(stdout, LogStream::Stdout, log),
            forward(stderr, LogStream::Stderr, log),
        );
        out?;
        err?;
        let status = status?;

        if status.success() {
            return Ok(BuildResult::Success);
        }
        match status.code() {
            Some(code) => log_system(log, format!("Build step exited with code {code}")),
            None => log_system(log, "Build step was terminated by a signal"),
        }
        Ok(BuildResult::Failure)
    }
}

async fn forward(
    reader: impl AsyncRead + Unpin,
    stream: LogStream,
    log: &LogSender,
) -> std::io::Result<()> {
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let _ = log.unbounded_send(LogLine::new(stream, line));
    }
    Ok(())
}
