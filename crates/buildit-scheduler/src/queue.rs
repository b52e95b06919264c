//! In-memory build queue.
//!
//! At most one waiting item exists per project; scheduling a project that
//! is already waiting merges the cause into the existing item and hands out
//! another handle to it. Once an executor claims the item it is building,
//! and the next request for the project creates a fresh item. Finished and
//! cancelled items are kept in a bounded "left" list for lookup.

use buildit_core::{Build, Cause, Error, ResourceId, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Notify, watch};
use tracing::{debug, info};

/// Lifecycle state of a queue item.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ItemState {
    Waiting,
    Building { number: u32 },
    Completed { build: Box<Build> },
    Cancelled,
    Failed { message: String },
}

impl ItemState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemState::Completed { .. } | ItemState::Cancelled | ItemState::Failed { .. }
        )
    }

    /// Build number once the item has started.
    pub fn number(&self) -> Option<u32> {
        match self {
            ItemState::Building { number } => Some(*number),
            ItemState::Completed { build } => Some(build.number),
            _ => None,
        }
    }
}

/// Snapshot of a queue item.
#[derive(Debug, Clone, Serialize)]
pub struct QueueItemInfo {
    pub id: ResourceId,
    pub project: ResourceId,
    pub causes: Vec<Cause>,
    pub queued_at: DateTime<Utc>,
    #[serde(flatten)]
    pub state: ItemState,
}

struct Item {
    id: ResourceId,
    project: ResourceId,
    causes: Vec<Cause>,
    queued_at: DateTime<Utc>,
    state: watch::Sender<ItemState>,
}

impl Item {
    fn info(&self) -> QueueItemInfo {
        QueueItemInfo {
            id: self.id,
            project: self.project,
            causes: self.causes.clone(),
            queued_at: self.queued_at,
            state: self.state.borrow().clone(),
        }
    }

    fn handle(&self) -> QueueHandle {
        QueueHandle {
            id: self.id,
            project: self.project,
            state: self.state.subscribe(),
        }
    }
}

/// Handle to a scheduled build. Handles to the same item compare equal.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    id: ResourceId,
    project: ResourceId,
    state: watch::Receiver<ItemState>,
}

impl QueueHandle {
    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn project(&self) -> ResourceId {
        self.project
    }

    pub fn state(&self) -> ItemState {
        self.state.borrow().clone()
    }

    /// Wait until the build has started and return its number.
    pub async fn started(&mut self) -> Result<u32> {
        loop {
            match &*self.state.borrow_and_update() {
                ItemState::Waiting => {}
                ItemState::Cancelled => return Err(Error::Cancelled),
                ItemState::Failed { message } => {
                    return Err(Error::ExecutionFailed(message.clone()));
                }
                other => {
                    if let Some(number) = other.number() {
                        return Ok(number);
                    }
                }
            }
            if self.state.changed().await.is_err() {
                return Err(Error::Cancelled);
            }
        }
    }

    /// Wait for the terminal build record.
    pub async fn wait(mut self) -> Result<Build> {
        loop {
            match &*self.state.borrow_and_update() {
                ItemState::Completed { build } => return Ok((**build).clone()),
                ItemState::Cancelled => return Err(Error::Cancelled),
                ItemState::Failed { message } => {
                    return Err(Error::ExecutionFailed(message.clone()));
                }
                ItemState::Waiting | ItemState::Building { .. } => {}
            }
            if self.state.changed().await.is_err() {
                return Err(Error::Cancelled);
            }
        }
    }
}

impl PartialEq for QueueHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for QueueHandle {}

/// Waiting item handed to an executor.
#[derive(Debug, Clone)]
pub struct StartedItem {
    pub id: ResourceId,
    pub project: ResourceId,
    pub number: u32,
    pub causes: Vec<Cause>,
    pub queued_at: DateTime<Utc>,
}

#[derive(Default)]
struct QueueState {
    seq: u64,
    waiting: BTreeMap<u64, Item>,
    by_project: HashMap<ResourceId, u64>,
    active: HashMap<ResourceId, Item>,
    left: VecDeque<Item>,
    blocked: HashSet<ResourceId>,
}

impl QueueState {
    fn take_waiting(&mut self, project: ResourceId) -> Option<Item> {
        let seq = self.by_project.remove(&project)?;
        self.waiting.remove(&seq)
    }

    fn retire(&mut self, item: Item, capacity: usize) {
        if capacity == 0 {
            return;
        }
        while self.left.len() >= capacity {
            self.left.pop_front();
        }
        self.left.push_back(item);
    }
}

pub struct BuildQueue {
    state: Mutex<QueueState>,
    notify: Arc<Notify>,
    left_capacity: usize,
}

impl BuildQueue {
    pub fn new(left_capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Arc::new(Notify::new()),
            left_capacity,
        }
    }

    /// Wakes executors whenever work may have become available.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Request a build of `project`.
    ///
    /// Returns `None` when the project does not accept builds.
    pub fn schedule(&self, project: ResourceId, cause: Cause) -> Option<QueueHandle> {
        let handle = {
            let mut state = self.state.lock();
            if state.blocked.contains(&project) {
                debug!(%project, "Not scheduling blocked project");
                return None;
            }

            if let Some(seq) = state.by_project.get(&project).copied() {
                let item = state.waiting.get_mut(&seq)?;
                if !item.causes.contains(&cause) {
                    item.causes.push(cause);
                }
                debug!(%project, item = %item.id, "Merged into waiting item");
                return Some(item.handle());
            }

            state.seq += 1;
            let seq = state.seq;
            let (tx, _) = watch::channel(ItemState::Waiting);
            let item = Item {
                id: ResourceId::new(),
                project,
                causes: vec![cause],
                queued_at: Utc::now(),
                state: tx,
            };
            let handle = item.handle();
            info!(%project, item = %item.id, "Queued build");
            state.waiting.insert(seq, item);
            state.by_project.insert(project, seq);
            handle
        };
        self.notify.notify_waiters();
        Some(handle)
    }

    /// Remove the waiting item of `project`. Its handles resolve to cancelled.
    pub fn cancel(&self, project: ResourceId) -> bool {
        let mut state = self.state.lock();
        let Some(item) = state.take_waiting(project) else {
            return false;
        };
        item.state.send_replace(ItemState::Cancelled);
        info!(%project, item = %item.id, "Cancelled queued build");
        state.retire(item, self.left_capacity);
        true
    }

    /// Block or unblock a project. Blocking cancels its waiting item.
    pub fn set_blocked(&self, project: ResourceId, blocked: bool) -> bool {
        let changed = {
            let mut state = self.state.lock();
            if blocked {
                state.blocked.insert(project)
            } else {
                state.blocked.remove(&project)
            }
        };
        if blocked {
            self.cancel(project);
        }
        changed
    }

    /// Forget a project entirely.
    pub fn remove_project(&self, project: ResourceId) {
        self.cancel(project);
        self.state.lock().blocked.remove(&project);
    }

    /// Waiting items, oldest first.
    pub fn waiting(&self) -> Vec<QueueItemInfo> {
        self.state.lock().waiting.values().map(Item::info).collect()
    }

    /// Waiting and building items.
    pub fn items(&self) -> Vec<QueueItemInfo> {
        let state = self.state.lock();
        state
            .waiting
            .values()
            .chain(state.active.values())
            .map(Item::info)
            .collect()
    }

    pub fn get(&self, id: ResourceId) -> Option<QueueItemInfo> {
        let state = self.state.lock();
        state
            .waiting
            .values()
            .chain(state.active.values())
            .chain(state.left.iter())
            .find(|item| item.id == id)
            .map(Item::info)
    }

    pub fn is_waiting(&self, project: ResourceId) -> bool {
        self.state.lock().by_project.contains_key(&project)
    }

    /// True while `project` has a waiting or building item.
    pub fn is_queued_or_building(&self, project: ResourceId) -> bool {
        let state = self.state.lock();
        state.by_project.contains_key(&project)
            || state.active.values().any(|item| item.project == project)
    }

    /// Move a waiting item to building.
    ///
    /// `allocate` runs while the item is guaranteed to still be waiting, so
    /// a build number is never taken for an item that was cancelled. When
    /// it fails the item stays queued.
    pub fn begin(
        &self,
        id: ResourceId,
        allocate: impl FnOnce() -> Result<u32>,
    ) -> Result<Option<StartedItem>> {
        let mut state = self.state.lock();
        let Some((&seq, _)) = state.waiting.iter().find(|(_, item)| item.id == id) else {
            return Ok(None);
        };
        let number = allocate()?;

        let Some(item) = state.waiting.remove(&seq) else {
            return Ok(None);
        };
        state.by_project.remove(&item.project);
        item.state.send_replace(ItemState::Building { number });
        let started = StartedItem {
            id: item.id,
            project: item.project,
            number,
            causes: item.causes.clone(),
            queued_at: item.queued_at,
        };
        state.active.insert(item.id, item);
        Ok(Some(started))
    }

    /// Resolve a building item with its terminal record.
    pub fn complete(&self, id: ResourceId, build: Build) {
        {
            let mut state = self.state.lock();
            if let Some(item) = state.active.remove(&id) {
                item.state.send_replace(ItemState::Completed {
                    build: Box::new(build),
                });
                state.retire(item, self.left_capacity);
            }
        }
        // Items waiting on this project as an upstream may now start.
        self.notify.notify_waiters();
    }

    /// Resolve a building item that could not produce a record.
    pub fn fail(&self, id: ResourceId, message: impl Into<String>) {
        {
            let mut state = self.state.lock();
            if let Some(item) = state.active.remove(&id) {
                item.state.send_replace(ItemState::Failed {
                    message: message.into(),
                });
                state.retire(item, self.left_capacity);
            }
        }
        self.notify.notify_waiters();
    }
}
