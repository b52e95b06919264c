//! Build history of a single project.
//!
//! The index of build numbers is read from `builds/` on first use; record
//! bodies are read lazily, one at a time. The index is replaced
//! copy-on-write so readers iterate a consistent snapshot while builds are
//! added or deleted. [`BuildHistory::purge_cache`] drops everything and
//! forces the next read to go back to disk.

use buildit_core::{Build, ResourceId, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::warn;

use crate::storage::{read_json, remove_dir_if_exists, write_json_atomic};

const RECORD_FILE: &str = "build.json";

struct Slot {
    number: u32,
    dir: PathBuf,
    record: OnceLock<Option<Arc<Build>>>,
}

impl Slot {
    fn unloaded(number: u32, dir: PathBuf) -> Self {
        Self {
            number,
            dir,
            record: OnceLock::new(),
        }
    }

    fn loaded(build: Build, dir: PathBuf) -> Self {
        let record = OnceLock::new();
        let number = build.number;
        let _ = record.set(Some(Arc::new(build)));
        Self {
            number,
            dir,
            record,
        }
    }

    fn get(&self, project: ResourceId) -> Option<Arc<Build>> {
        self.record
            .get_or_init(|| load_record(&self.dir, self.number, project))
            .clone()
    }
}

fn load_record(dir: &Path, number: u32, project: ResourceId) -> Option<Arc<Build>> {
    match read_json::<Build>(&dir.join(RECORD_FILE)) {
        Ok(Some(build)) if build.number == number && build.project == project => {
            Some(Arc::new(build))
        }
        Ok(Some(build)) => {
            warn!(
                dir = %dir.display(),
                number = build.number,
                "Ignoring build record that does not belong here"
            );
            None
        }
        Ok(None) => None,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Ignoring unreadable build record");
            None
        }
    }
}

#[derive(Clone, Default)]
struct Index {
    slots: BTreeMap<u32, Arc<Slot>>,
}

pub struct BuildHistory {
    project: ResourceId,
    dir: PathBuf,
    index: RwLock<Option<Arc<Index>>>,
}

impl BuildHistory {
    /// History stored under `dir` (the project's `builds/` directory).
    pub fn new(project: ResourceId, dir: PathBuf) -> Self {
        Self {
            project,
            dir,
            index: RwLock::new(None),
        }
    }

    pub fn build_dir(&self, number: u32) -> PathBuf {
        self.dir.join(number.to_string())
    }

    pub fn get(&self, number: u32) -> Option<Arc<Build>> {
        self.snapshot()
            .slots
            .get(&number)
            .and_then(|slot| slot.get(self.project))
    }

    /// Most recent readable build.
    pub fn latest(&self) -> Option<Arc<Build>> {
        self.all().next()
    }

    /// Builds ordered by number, newest first. Records are read as the
    /// iterator advances; unreadable ones are skipped.
    pub fn all(&self) -> impl Iterator<Item = Arc<Build>> + use<> {
        let project = self.project;
        let slots: Vec<Arc<Slot>> = self.snapshot().slots.values().rev().cloned().collect();
        slots.into_iter().filter_map(move |slot| slot.get(project))
    }

    /// Number of readable builds. Reads every record.
    pub fn len(&self) -> usize {
        self.all().count()
    }

    pub fn is_empty(&self) -> bool {
        self.latest().is_none()
    }

    /// Highest build number present on disk, readable or not.
    pub fn max_number(&self) -> Option<u32> {
        self.snapshot().slots.keys().next_back().copied()
    }

    /// Persist a new build record.
    pub fn insert(&self, build: Build) -> Result<Arc<Build>> {
        self.store(build)
    }

    /// Persist a changed build record.
    pub fn update(&self, build: Build) -> Result<Arc<Build>> {
        self.store(build)
    }

    /// Delete a build and its storage directory.
    pub fn remove(&self, number: u32) -> Result<bool> {
        let mut guard = self.index.write();
        let dir = self.build_dir(number);
        let existed = remove_dir_if_exists(&dir)?;

        let current = guard.get_or_insert_with(|| Arc::new(self.scan()));
        if current.slots.contains_key(&number) {
            let mut next = (**current).clone();
            next.slots.remove(&number);
            *guard = Some(Arc::new(next));
            return Ok(true);
        }
        Ok(existed)
    }

    /// Forget everything held in memory.
    pub fn purge_cache(&self) {
        *self.index.write() = None;
    }

    fn store(&self, build: Build) -> Result<Arc<Build>> {
        if build.project != self.project {
            return Err(buildit_core::Error::Internal(format!(
                "build {} belongs to project {}, not {}",
                build.number, build.project, self.project
            )));
        }

        let mut guard = self.index.write();
        let dir = self.build_dir(build.number);
        write_json_atomic(&dir.join(RECORD_FILE), &build)?;

        let number = build.number;
        let slot = Arc::new(Slot::loaded(build, dir));
        let record = slot.get(self.project);

        let current = guard.get_or_insert_with(|| Arc::new(self.scan()));
        let mut next = (**current).clone();
        next.slots.insert(number, slot);
        *guard = Some(Arc::new(next));

        record.ok_or_else(|| buildit_core::Error::Internal("stored build vanished".to_string()))
    }

    fn snapshot(&self) -> Arc<Index> {
        if let Some(index) = self.index.read().as_ref() {
            return index.clone();
        }
        let mut guard = self.index.write();
        guard.get_or_insert_with(|| Arc::new(self.scan())).clone()
    }

    fn scan(&self) -> Index {
        let mut index = Index::default();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return index,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "Failed to list builds");
                return index;
            }
        };

        for entry in entries.flatten() {
            let Some(number) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            let dir = entry.path();
            if dir.join(RECORD_FILE).is_file() {
                index.slots.insert(number, Arc::new(Slot::unloaded(number, dir)));
            }
        }
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildit_core::BuildResult;
    use chrono::Utc;
    use tempfile::tempdir;

    fn build(project: ResourceId, number: u32, result: Option<BuildResult>) -> Build {
        Build {
            project,
            number,
            queue_id: ResourceId::new(),
            causes: Vec::new(),
            scheduled_at: Utc::now(),
            started_at: Utc::now(),
            finished_at: result.map(|_| Utc::now()),
            result,
            workspace: PathBuf::from("/ws"),
            executor: "executor-1".to_string(),
        }
    }

    #[test]
    fn test_all_is_descending() {
        let dir = tempdir().unwrap();
        let project = ResourceId::new();
        let history = BuildHistory::new(project, dir.path().join("builds"));

        for n in 1..=3 {
            history.insert(build(project, n, Some(BuildResult::Success))).unwrap();
        }

        let numbers: Vec<u32> = history.all().map(|b| b.number).collect();
        assert_eq!(numbers, vec![3, 2, 1]);
        assert_eq!(history.latest().unwrap().number, 3);
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn test_purge_cache_reloads_from_disk() {
        let dir = tempdir().unwrap();
        let project = ResourceId::new();
        let history = BuildHistory::new(project, dir.path().join("builds"));

        history.insert(build(project, 1, None)).unwrap();
        let mut finished = build(project, 1, Some(BuildResult::Unstable));
        finished.executor = "other".to_string();
        history.update(finished).unwrap();
        history.insert(build(project, 2, Some(BuildResult::Success))).unwrap();

        history.purge_cache();
        assert_eq!(history.len(), 2);
        let first = history.get(1).unwrap();
        assert_eq!(first.result, Some(BuildResult::Unstable));
        assert_eq!(first.executor, "other");
    }

    #[test]
    fn test_missing_and_corrupt_records_are_absent() {
        let dir = tempdir().unwrap();
        let builds = dir.path().join("builds");
        let project = ResourceId::new();
        let history = BuildHistory::new(project, builds.clone());

        history.insert(build(project, 1, Some(BuildResult::Success))).unwrap();
        std::fs::create_dir_all(builds.join("2")).unwrap();
        std::fs::create_dir_all(builds.join("3")).unwrap();
        std::fs::write(builds.join("3").join(RECORD_FILE), "{not json").unwrap();
        std::fs::create_dir_all(builds.join("notes")).unwrap();

        history.purge_cache();
        assert_eq!(history.len(), 1);
        assert!(history.get(2).is_none());
        assert!(history.get(3).is_none());
        assert_eq!(history.latest().unwrap().number, 1);
        assert_eq!(history.max_number(), Some(3));
    }

    #[test]
    fn test_remove_deletes_storage() {
        let dir = tempdir().unwrap();
        let project = ResourceId::new();
        let history = BuildHistory::new(project, dir.path().join("builds"));

        history.insert(build(project, 1, Some(BuildResult::Success))).unwrap();
        history.insert(build(project, 2, Some(BuildResult::Success))).unwrap();

        assert!(history.remove(2).unwrap());
        assert!(!history.build_dir(2).exists());
        assert_eq!(history.latest().unwrap().number, 1);
        assert!(!history.remove(7).unwrap());

        history.purge_cache();
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_snapshot_iteration_survives_concurrent_insert() {
        let dir = tempdir().unwrap();
        let project = ResourceId::new();
        let history = BuildHistory::new(project, dir.path().join("builds"));
        history.insert(build(project, 1, Some(BuildResult::Success))).unwrap();

        let mut iter = history.all();
        history.insert(build(project, 2, Some(BuildResult::Success))).unwrap();
        assert_eq!(iter.next().unwrap().number, 1);
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_rejects_foreign_build() {
        let dir = tempdir().unwrap();
        let history = BuildHistory::new(ResourceId::new(), dir.path().join("builds"));
        assert!(history.insert(build(ResourceId::new(), 1, None)).is_err());
    }
}
