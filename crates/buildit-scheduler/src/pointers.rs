//! `lastSuccessful` and `lastStable` references.
//!
//! On unix each pointer is a relative symlink `builds/<n>` next to the
//! project's `builds/` directory, so tools can follow it without reading
//! any history. Elsewhere it is a small file holding the build number.
//! A pointer without a qualifying build does not exist on disk.

use buildit_core::{BuildResult, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::history::BuildHistory;
use crate::storage::{fsync_dir, remove_file_if_exists};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PointerKind {
    #[serde(rename = "lastSuccessful")]
    LastSuccessful,
    #[serde(rename = "lastStable")]
    LastStable,
}

impl PointerKind {
    pub const ALL: [PointerKind; 2] = [PointerKind::LastSuccessful, PointerKind::LastStable];

    pub fn file_name(self) -> &'static str {
        match self {
            PointerKind::LastSuccessful => "lastSuccessful",
            PointerKind::LastStable => "lastStable",
        }
    }

    fn accepts(self, result: BuildResult) -> bool {
        match self {
            PointerKind::LastSuccessful => result.is_successful(),
            PointerKind::LastStable => result.is_stable(),
        }
    }
}

impl fmt::Display for PointerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

impl std::str::FromStr for PointerKind {
    type Err = buildit_core::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "lastSuccessful" | "lastSuccessfulBuild" => Ok(PointerKind::LastSuccessful),
            "lastStable" | "lastStableBuild" => Ok(PointerKind::LastStable),
            other => Err(buildit_core::Error::InvalidInput(format!(
                "unknown pointer: {other}"
            ))),
        }
    }
}

/// Values of both pointers after a recompute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Pointers {
    #[serde(rename = "lastSuccessful")]
    pub last_successful: Option<u32>,
    #[serde(rename = "lastStable")]
    pub last_stable: Option<u32>,
}

impl Pointers {
    pub fn get(&self, kind: PointerKind) -> Option<u32> {
        match kind {
            PointerKind::LastSuccessful => self.last_successful,
            PointerKind::LastStable => self.last_stable,
        }
    }
}

pub struct LastBuildPointers {
    dir: PathBuf,
    // Recomputes for one project never interleave.
    lock: Mutex<()>,
}

impl LastBuildPointers {
    /// Pointers stored in the project directory `dir`.
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self, kind: PointerKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }

    /// Rescan history and rewrite both pointers. In-progress builds are
    /// skipped, so the result always reflects terminal results only.
    pub fn recompute(&self, history: &BuildHistory) -> Result<Pointers> {
        let _serialized = self.lock.lock();

        let mut pointers = Pointers::default();
        for build in history.all() {
            let Some(result) = build.result else {
                continue;
            };
            if pointers.last_successful.is_none() && PointerKind::LastSuccessful.accepts(result) {
                pointers.last_successful = Some(build.number);
            }
            if pointers.last_stable.is_none() && PointerKind::LastStable.accepts(result) {
                pointers.last_stable = Some(build.number);
                // Stable implies successful, and newer builds were already seen.
                break;
            }
        }

        for kind in PointerKind::ALL {
            match pointers.get(kind) {
                Some(number) => self.write(kind, number)?,
                None => {
                    remove_file_if_exists(&self.path(kind))?;
                }
            }
        }
        if self.dir.is_dir() {
            fsync_dir(&self.dir)?;
        }

        debug!(
            dir = %self.dir.display(),
            last_successful = ?pointers.last_successful,
            last_stable = ?pointers.last_stable,
            "Recomputed build pointers"
        );
        Ok(pointers)
    }

    /// Read a pointer back from disk.
    pub fn resolve(&self, kind: PointerKind) -> Option<u32> {
        let path = self.path(kind);
        let meta = std::fs::symlink_metadata(&path).ok()?;
        let text = if meta.file_type().is_symlink() {
            std::fs::read_link(&path).ok()?.to_string_lossy().into_owned()
        } else {
            std::fs::read_to_string(&path).ok()?
        };
        parse_target(&text)
    }

    pub fn resolve_all(&self) -> Pointers {
        Pointers {
            last_successful: self.resolve(PointerKind::LastSuccessful),
            last_stable: self.resolve(PointerKind::LastStable),
        }
    }

    #[cfg(unix)]
    fn write(&self, kind: PointerKind, number: u32) -> Result<()> {
        let path = self.path(kind);
        let target = Path::new("builds").join(number.to_string());
        if std::fs::read_link(&path).is_ok_and(|current| current == target) {
            return Ok(());
        }
        std::fs::create_dir_all(&self.dir)?;
        let tmp = self.dir.join(format!(".{}.tmp", kind.file_name()));
        remove_file_if_exists(&tmp)?;
        std::os::unix::fs::symlink(&target, &tmp)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn write(&self, kind: PointerKind, number: u32) -> Result<()> {
        crate::storage::write_atomic(&self.path(kind), number.to_string().as_bytes())
    }
}

fn parse_target(text: &str) -> Option<u32> {
    text.trim()
        .trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildit_core::{Build, ResourceId};
    use chrono::Utc;
    use tempfile::tempdir;

    fn record(project: ResourceId, number: u32, result: Option<BuildResult>) -> Build {
        Build {
            project,
            number,
            queue_id: ResourceId::new(),
            causes: Vec::new(),
            scheduled_at: Utc::now(),
            started_at: Utc::now(),
            finished_at: None,
            result,
            workspace: PathBuf::from("/ws"),
            executor: "executor-1".to_string(),
        }
    }

    fn setup() -> (tempfile::TempDir, ResourceId, BuildHistory, LastBuildPointers) {
        let dir = tempdir().unwrap();
        let project = ResourceId::new();
        let history = BuildHistory::new(project, dir.path().join("builds"));
        let pointers = LastBuildPointers::new(dir.path().to_path_buf());
        (dir, project, history, pointers)
    }

    #[test]
    fn test_recompute_picks_latest_qualifying() {
        let (_dir, project, history, pointers) = setup();
        history.insert(record(project, 1, Some(BuildResult::Success))).unwrap();
        history.insert(record(project, 2, Some(BuildResult::Unstable))).unwrap();
        history.insert(record(project, 3, Some(BuildResult::Failure))).unwrap();
        history.insert(record(project, 4, None)).unwrap();

        let values = pointers.recompute(&history).unwrap();
        assert_eq!(values.last_successful, Some(2));
        assert_eq!(values.last_stable, Some(1));
        assert_eq!(pointers.resolve_all(), values);
    }

    #[test]
    fn test_pointers_removed_when_nothing_qualifies() {
        let (_dir, project, history, pointers) = setup();
        history.insert(record(project, 1, Some(BuildResult::Success))).unwrap();
        pointers.recompute(&history).unwrap();
        assert!(pointers.path(PointerKind::LastStable).symlink_metadata().is_ok());

        history.remove(1).unwrap();
        let values = pointers.recompute(&history).unwrap();
        assert_eq!(values, Pointers::default());
        assert!(pointers.path(PointerKind::LastStable).symlink_metadata().is_err());
        assert!(pointers.path(PointerKind::LastSuccessful).symlink_metadata().is_err());
        assert_eq!(pointers.resolve(PointerKind::LastSuccessful), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_resolves_to_build_dir() {
        let (dir, project, history, pointers) = setup();
        history.insert(record(project, 5, Some(BuildResult::Success))).unwrap();
        pointers.recompute(&history).unwrap();

        let link = pointers.path(PointerKind::LastSuccessful);
        assert_eq!(std::fs::read_link(&link).unwrap(), Path::new("builds/5"));
        let resolved = std::fs::canonicalize(&link).unwrap();
        assert_eq!(resolved, std::fs::canonicalize(dir.path().join("builds/5")).unwrap());
    }

    #[test]
    fn test_parse_target() {
        assert_eq!(parse_target("builds/12"), Some(12));
        assert_eq!(parse_target("12\n"), Some(12));
        assert_eq!(parse_target("builds\\3"), Some(3));
        assert_eq!(parse_target("builds/x"), None);
    }
}
