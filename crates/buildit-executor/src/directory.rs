//! A local directory as a project's source.

use async_trait::async_trait;
use buildit_core::executor::{LogSender, log_system};
use buildit_core::scm::{NullScm, PollOutcome, Scm, ScmConfig, ScmProvider};
use buildit_core::{Error, Result};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

/// Summary of a directory tree used for change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    files: usize,
    bytes: u64,
    newest: Option<SystemTime>,
}

/// Mirrors a local directory into the workspace. A poll reports a change
/// when the tree differs from what the last checkout or poll saw.
pub struct DirectoryScm {
    source: PathBuf,
    seen: Mutex<Option<Fingerprint>>,
}

impl DirectoryScm {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            seen: Mutex::new(None),
        }
    }

    async fn fingerprint(&self) -> Result<Fingerprint> {
        let source = self.source.clone();
        tokio::task::spawn_blocking(move || fingerprint(&source))
            .await
            .map_err(|e| Error::Internal(format!("fingerprint task failed: {e}")))?
    }
}

#[async_trait]
impl Scm for DirectoryScm {
    fn name(&self) -> &'static str {
        "directory"
    }

    async fn poll_changes(&self, workspace: &Path) -> Result<PollOutcome> {
        let current = self.fingerprint().await?;
        let previous = self.seen.lock().replace(current);

        if !workspace.exists() {
            return Ok(PollOutcome::Changes {
                summary: "no workspace yet".to_string(),
            });
        }
        match previous {
            Some(previous) if previous != current => Ok(PollOutcome::Changes {
                summary: format!("{} changed", self.source.display()),
            }),
            _ => Ok(PollOutcome::NoChanges),
        }
    }

    async fn checkout(&self, workspace: &Path, log: &LogSender) -> Result<()> {
        log_system(log, format!("Copying sources from {}", self.source.display()));
        let source = self.source.clone();
        let target = workspace.to_path_buf();
        let copied = tokio::task::spawn_blocking(move || copy_tree(&source, &target))
            .await
            .map_err(|e| Error::Internal(format!("checkout task failed: {e}")))??;
        debug!(source = %self.source.display(), copied, "Checked out directory");

        let current = self.fingerprint().await?;
        *self.seen.lock() = Some(current);
        Ok(())
    }
}

fn fingerprint(dir: &Path) -> Result<Fingerprint> {
    let mut print = Fingerprint {
        files: 0,
        bytes: 0,
        newest: None,
    };
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                pending.push(entry.path());
                continue;
            }
            print.files += 1;
            print.bytes += meta.len();
            let modified = meta.modified()?;
            print.newest = Some(print.newest.map_or(modified, |n| n.max(modified)));
        }
    }
    Ok(print)
}

fn copy_tree(source: &Path, target: &Path) -> Result<usize> {
    let mut copied = 0;
    let mut pending = vec![PathBuf::new()];
    while let Some(relative) = pending.pop() {
        std::fs::create_dir_all(target.join(&relative))?;
        for entry in std::fs::read_dir(source.join(&relative))? {
            let entry = entry?;
            let path = relative.join(entry.file_name());
            if entry.file_type()?.is_dir() {
                pending.push(path);
            } else {
                std::fs::copy(entry.path(), target.join(&path))?;
                copied += 1;
            }
        }
    }
    Ok(copied)
}

/// Maps [`ScmConfig`] to the implementations in this crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalScmProvider;

impl ScmProvider for LocalScmProvider {
    fn for_config(&self, config: &ScmConfig) -> Arc<dyn Scm> {
        match config {
            ScmConfig::None => Arc::new(NullScm),
            ScmConfig::Directory { path } => Arc::new(DirectoryScm::new(path.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_poll_detects_changes_after_checkout() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("src");
        let workspace = dir.path().join("ws");
        std::fs::create_dir_all(source.join("nested")).unwrap();
        std::fs::write(source.join("nested/a.txt"), "one").unwrap();

        let scm = DirectoryScm::new(&source);
        assert!(scm.poll_changes(&workspace).await.unwrap().has_changes());

        let (tx, _rx) = mpsc::unbounded();
        scm.checkout(&workspace, &tx).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(workspace.join("nested/a.txt")).unwrap(),
            "one"
        );
        assert_eq!(
            scm.poll_changes(&workspace).await.unwrap(),
            PollOutcome::NoChanges
        );

        std::fs::write(source.join("b.txt"), "two").unwrap();
        assert!(scm.poll_changes(&workspace).await.unwrap().has_changes());
        assert_eq!(
            scm.poll_changes(&workspace).await.unwrap(),
            PollOutcome::NoChanges
        );
    }

    #[tokio::test]
    async fn test_missing_source_is_an_error() {
        let dir = tempdir().unwrap();
        let scm = DirectoryScm::new(dir.path().join("missing"));
        assert!(scm.poll_changes(dir.path()).await.is_err());
    }

    #[test]
    fn test_provider_maps_config() {
        let provider = LocalScmProvider;
        assert_eq!(provider.for_config(&ScmConfig::None).name(), "none");
        let config = ScmConfig::Directory {
            path: PathBuf::from("/srv/src"),
        };
        assert_eq!(provider.for_config(&config).name(), "directory");
        assert!(provider.for_config(&config).requires_workspace_for_polling());
    }
}
