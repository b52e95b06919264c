//! Per-project runtime state.

use buildit_core::scm::{Scm, ScmProvider};
use buildit_core::{ProjectConfig, ResourceId, Result};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;
use tracing::warn;

use crate::history::BuildHistory;
use crate::lease::WorkspaceLease;
use crate::pointers::LastBuildPointers;
use crate::storage::{Layout, read_json, write_atomic, write_json_atomic};

const CONFIG_FILE: &str = "config.json";
const NEXT_NUMBER_FILE: &str = "nextBuildNumber";

/// Where a project is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Idle,
    Polling,
    Queued,
    Building,
}

pub struct ProjectState {
    pub id: ResourceId,
    pub dir: PathBuf,
    pub config: RwLock<ProjectConfig>,
    pub lease: WorkspaceLease,
    pub history: Arc<BuildHistory>,
    pub pointers: LastBuildPointers,
    scm: RwLock<Arc<dyn Scm>>,
    next_number: Mutex<u32>,
    polls: AtomicUsize,
    running: AtomicUsize,
}

impl ProjectState {
    /// Create storage for a new project.
    pub fn create(
        layout: &Layout,
        id: ResourceId,
        mut config: ProjectConfig,
        scm: &dyn ScmProvider,
        released: Arc<Notify>,
    ) -> Result<Self> {
        let dir = layout.item_dir(id);
        std::fs::create_dir_all(dir.join("builds"))?;
        write_json_atomic(&dir.join(CONFIG_FILE), &config)?;
        write_atomic(&dir.join(NEXT_NUMBER_FILE), b"1")?;
        config.triggers.start(&id.to_string());
        Ok(Self::assemble(layout, id, dir, config, 1, scm, released))
    }

    /// Load a project from storage.
    pub fn load(
        layout: &Layout,
        id: ResourceId,
        scm: &dyn ScmProvider,
        released: Arc<Notify>,
    ) -> Result<Self> {
        let dir = layout.item_dir(id);
        let mut config: ProjectConfig = read_json(&dir.join(CONFIG_FILE))?.unwrap_or_default();
        config.triggers.start(&id.to_string());

        let stored = match std::fs::read_to_string(dir.join(NEXT_NUMBER_FILE)) {
            Ok(text) => text.trim().parse::<u32>().ok(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let state = Self::assemble(layout, id, dir, config, stored.unwrap_or(1), scm, released);
        // Never hand out a number that already has a build directory.
        let floor = state.history.max_number().map_or(1, |n| n.saturating_add(1));
        let mut next = state.next_number.lock();
        if stored.is_none() || *next < floor {
            if stored.is_some() {
                warn!(project = %id, stored = *next, floor, "Build number file is behind history");
            }
            *next = (*next).max(floor);
            write_atomic(&state.dir.join(NEXT_NUMBER_FILE), next.to_string().as_bytes())?;
        }
        drop(next);
        Ok(state)
    }

    fn assemble(
        layout: &Layout,
        id: ResourceId,
        dir: PathBuf,
        config: ProjectConfig,
        next_number: u32,
        scm: &dyn ScmProvider,
        released: Arc<Notify>,
    ) -> Self {
        let scm = scm.for_config(&config.scm);
        Self {
            id,
            lease: WorkspaceLease::new(layout.workspace(id), released),
            history: Arc::new(BuildHistory::new(id, dir.join("builds"))),
            pointers: LastBuildPointers::new(dir.clone()),
            dir,
            config: RwLock::new(config),
            scm: RwLock::new(scm),
            next_number: Mutex::new(next_number),
            polls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> ProjectConfig {
        self.config.read().clone()
    }

    pub fn is_disabled(&self) -> bool {
        self.config.read().disabled
    }

    /// Replace the configuration, restart its triggers and persist it.
    pub fn replace_config(&self, mut config: ProjectConfig, scm: &dyn ScmProvider) -> Result<()> {
        let mut current = self.config.write();
        write_json_atomic(&self.dir.join(CONFIG_FILE), &config)?;
        if config.scm != current.scm {
            *self.scm.write() = scm.for_config(&config.scm);
        }
        current.triggers.stop();
        config.triggers.start(&self.id.to_string());
        *current = config;
        Ok(())
    }

    /// Apply an in-place change to the configuration and persist it.
    pub fn modify_config<T>(&self, change: impl FnOnce(&mut ProjectConfig) -> T) -> Result<T> {
        let mut current = self.config.write();
        let mut next = current.clone();
        let output = change(&mut next);
        write_json_atomic(&self.dir.join(CONFIG_FILE), &next)?;
        *current = next;
        Ok(output)
    }

    pub fn scm(&self) -> Arc<dyn Scm> {
        self.scm.read().clone()
    }

    /// Take the next build number, persisting its successor first.
    pub fn allocate_number(&self) -> Result<u32> {
        let mut next = self.next_number.lock();
        let number = *next;
        let following = number
            .checked_add(1)
            .ok_or_else(|| buildit_core::Error::Internal("build numbers exhausted".to_string()))?;
        write_atomic(&self.dir.join(NEXT_NUMBER_FILE), following.to_string().as_bytes())?;
        *next = following;
        Ok(number)
    }

    pub fn next_number(&self) -> u32 {
        *self.next_number.lock()
    }

    pub fn build_started(&self) {
        self.running.fetch_add(1, Ordering::SeqCst);
    }

    pub fn build_finished(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn running_builds(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Mark a poll in progress until the returned guard drops.
    pub fn polling(self: &Arc<Self>) -> PollingGuard {
        self.polls.fetch_add(1, Ordering::SeqCst);
        PollingGuard {
            project: self.clone(),
        }
    }

    pub fn is_polling(&self) -> bool {
        self.polls.load(Ordering::SeqCst) > 0
    }
}

pub struct PollingGuard {
    project: Arc<ProjectState>,
}

impl Drop for PollingGuard {
    fn drop(&mut self) {
        self.project.polls.fetch_sub(1, Ordering::SeqCst);
    }
}
