//! Project scheduler: owns every project's runtime state and drives
//! polling, queueing and build execution.

use buildit_config::SystemConfig;
use buildit_core::executor::{BuildContext, LogLine, LogSender, Publisher, StepRunner, log_system};
use buildit_core::scm::{PollOutcome, ScmProvider};
use buildit_core::security::{ANONYMOUS, Authorizer, Permission, require};
use buildit_core::{
    Build, BuildResult, Cause, Error, FullName, ItemKind, ProjectConfig, PublisherConfig,
    ResourceId, Result, Step, Trigger, TriggerKind,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::history::BuildHistory;
use crate::lease::{LeaseGuard, LeaseHolder};
use crate::pointers::{PointerKind, Pointers};
use crate::project::{ProjectState, ProjectStatus};
use crate::queue::{BuildQueue, QueueHandle, StartedItem};
use crate::registry::{ItemRecord, ItemRegistry, Renamed};
use crate::storage::{Layout, remove_dir_if_exists};
use crate::{ticker, worker};

/// An executor slot and the labels it offers. An executor always carries
/// its own name as a label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorSpec {
    pub name: String,
    pub labels: BTreeSet<String>,
}

impl ExecutorSpec {
    pub fn new<S: Into<String>>(name: impl Into<String>, labels: impl IntoIterator<Item = S>) -> Self {
        let name = name.into();
        let mut labels: BTreeSet<String> = labels.into_iter().map(Into::into).collect();
        labels.insert(name.clone());
        Self { name, labels }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub root: PathBuf,
    pub executors: Vec<ExecutorSpec>,
    pub tick_interval: Duration,
    pub left_items: usize,
}

impl SchedulerOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::from_system(&SystemConfig {
            root: root.into(),
            ..SystemConfig::default()
        })
    }

    pub fn from_system(config: &SystemConfig) -> Self {
        Self {
            root: config.root.clone(),
            executors: config
                .executors
                .iter()
                .map(|e| ExecutorSpec::new(e.name.clone(), e.labels.iter().cloned()))
                .collect(),
            tick_interval: Duration::from_secs(config.tick_interval_secs),
            left_items: config.left_items,
        }
    }

    pub fn with_executors(mut self, executors: Vec<ExecutorSpec>) -> Self {
        self.executors = executors;
        self
    }
}

/// Collaborators that do the actual work of a build.
#[derive(Clone)]
pub struct Toolchain {
    pub steps: Arc<dyn StepRunner>,
    pub publisher: Arc<dyn Publisher>,
    pub scm: Arc<dyn ScmProvider>,
}

/// Workspace details for display.
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceInfo {
    pub path: PathBuf,
    pub exists: bool,
    #[serde(flatten)]
    pub holder: LeaseHolder,
}

/// A claimed queue item, ready to run on an executor.
pub(crate) struct ClaimedBuild {
    project: Arc<ProjectState>,
    item: StartedItem,
    lease: LeaseGuard,
    executor: String,
}

struct Inner {
    layout: Layout,
    options: SchedulerOptions,
    registry: ItemRegistry,
    projects: RwLock<HashMap<ResourceId, Arc<ProjectState>>>,
    queue: BuildQueue,
    toolchain: Toolchain,
    authorizer: Arc<dyn Authorizer>,
    // Serializes executor claims and item deletion.
    claim: Mutex<()>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct ProjectScheduler {
    inner: Arc<Inner>,
}

impl ProjectScheduler {
    /// Open the storage root and load every project.
    pub fn open(
        options: SchedulerOptions,
        toolchain: Toolchain,
        authorizer: Arc<dyn Authorizer>,
    ) -> Result<Self> {
        let layout = Layout::new(options.root.clone());
        std::fs::create_dir_all(layout.root())?;
        let registry = ItemRegistry::load(layout.items_file())?;
        let queue = BuildQueue::new(options.left_items);

        let mut projects = HashMap::new();
        for record in registry.all() {
            if record.kind != ItemKind::Project {
                continue;
            }
            match ProjectState::load(&layout, record.id, toolchain.scm.as_ref(), queue.notifier()) {
                Ok(state) => {
                    if state.is_disabled() {
                        queue.set_blocked(record.id, true);
                    }
                    projects.insert(record.id, Arc::new(state));
                }
                Err(e) => warn!(project = %record.name, error = %e, "Failed to load project"),
            }
        }
        info!(root = %layout.root().display(), projects = projects.len(), "Opened scheduler");

        Ok(Self {
            inner: Arc::new(Inner {
                layout,
                options,
                registry,
                projects: RwLock::new(projects),
                queue,
                toolchain,
                authorizer,
                claim: Mutex::new(()),
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Spawn the executor workers and the trigger ticker.
    pub fn start(&self) {
        let mut tasks = self.inner.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        for executor in &self.inner.options.executors {
            tasks.push(tokio::spawn(worker::run_executor(
                self.clone(),
                executor.clone(),
                self.inner.shutdown.clone(),
            )));
        }
        tasks.push(tokio::spawn(ticker::run_ticker(
            self.clone(),
            self.inner.options.tick_interval,
            self.inner.shutdown.clone(),
        )));
        info!(executors = self.inner.options.executors.len(), "Scheduler started");
    }

    /// Stop the workers, letting running builds finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Scheduler task ended abnormally");
            }
        }
        info!("Scheduler stopped");
    }

    pub fn queue(&self) -> &BuildQueue {
        &self.inner.queue
    }

    pub fn authorizer(&self) -> &dyn Authorizer {
        self.inner.authorizer.as_ref()
    }

    pub fn has_permission(&self, user: Option<&str>, permission: Permission, name: &FullName) -> bool {
        self.inner.authorizer.has_permission(user, permission, name)
    }

    // --- items -----------------------------------------------------------

    /// Look an item up by name. A miss suggests the closest existing name.
    pub fn resolve(&self, name: &str) -> Result<ItemRecord> {
        let not_found = || {
            let mut message = format!("No such item: {name}");
            if let Some(hint) = self.inner.registry.suggest(name) {
                message.push_str(&format!(". Perhaps you meant {hint}?"));
            }
            Error::NotFound(message)
        };
        let full = FullName::parse(name).map_err(|_| not_found())?;
        self.inner.registry.lookup(&full).ok_or_else(not_found)
    }

    /// Current name of the item with `id`.
    pub fn name_of(&self, id: ResourceId) -> Option<FullName> {
        self.inner.registry.name_of(id)
    }

    /// Items directly inside `folder`, or at the top level.
    pub fn items(&self, folder: Option<&FullName>) -> Vec<ItemRecord> {
        self.inner.registry.children(folder)
    }

    pub fn create_folder(&self, name: &str) -> Result<ResourceId> {
        let full = FullName::parse(name)?;
        self.inner.registry.create(full, ItemKind::Folder)
    }

    pub fn create_project(&self, name: &str, config: ProjectConfig) -> Result<ResourceId> {
        let full = FullName::parse(name)?;
        let id = self.inner.registry.create(full.clone(), ItemKind::Project)?;
        let disabled = config.disabled;
        let state = match ProjectState::create(
            &self.inner.layout,
            id,
            config,
            self.inner.toolchain.scm.as_ref(),
            self.inner.queue.notifier(),
        ) {
            Ok(state) => state,
            Err(e) => {
                if let Err(cleanup) = self.inner.registry.remove(&full) {
                    warn!(project = %full, error = %cleanup, "Failed to roll back item creation");
                }
                return Err(e);
            }
        };
        if disabled {
            self.inner.queue.set_blocked(id, true);
        }
        self.inner.projects.write().insert(id, Arc::new(state));
        Ok(id)
    }

    /// Rename an item within its folder. Returns the new full name.
    pub fn rename(&self, name: &str, new_name: &str) -> Result<FullName> {
        let record = self.resolve(name)?;
        let renamed = self.inner.registry.rename(&record.name, new_name)?;
        self.after_relocate(&renamed);
        Ok(new_full_name(&record, &renamed))
    }

    /// Move an item into `folder`, or to the top level.
    pub fn move_item(&self, name: &str, folder: Option<&str>) -> Result<FullName> {
        let record = self.resolve(name)?;
        let folder = match folder {
            Some(folder) => Some(self.resolve(folder)?.name),
            None => None,
        };
        let renamed = self.inner.registry.move_item(&record.name, folder.as_ref())?;
        self.after_relocate(&renamed);
        Ok(new_full_name(&record, &renamed))
    }

    fn after_relocate(&self, renamed: &[Renamed]) {
        if renamed.is_empty() {
            return;
        }
        let projects: Vec<Arc<ProjectState>> = self.inner.projects.read().values().cloned().collect();
        for project in &projects {
            if renamed.iter().any(|r| r.id == project.id) {
                project.history.purge_cache();
            }

            let references_moved = project
                .config
                .read()
                .upstream_names()
                .into_iter()
                .any(|upstream| moved_to(renamed, upstream).is_some());
            if !references_moved {
                continue;
            }
            let rewritten = project.modify_config(|config| {
                if let Some(Trigger::Upstream { projects, threshold }) =
                    config.triggers.get(TriggerKind::Upstream).cloned()
                {
                    let projects = projects
                        .into_iter()
                        .map(|upstream| moved_to(renamed, &upstream).unwrap_or(upstream))
                        .collect();
                    config.triggers.add(Trigger::upstream(projects, threshold));
                }
            });
            if let Err(e) = rewritten {
                warn!(project = %project.id, error = %e, "Failed to rewrite upstream references");
            }
        }
    }

    /// Delete a project. Returns the containing folder, if any.
    pub fn delete_project(&self, name: &str) -> Result<Option<FullName>> {
        self.project(name)?;
        self.delete_item(name)
    }

    /// Delete an item and everything inside it. Returns the containing
    /// folder, if any.
    ///
    /// Blocking: removes the item's storage before returning.
    pub fn delete_item(&self, name: &str) -> Result<Option<FullName>> {
        let record = self.resolve(name)?;
        let removed = {
            let _claim = self.inner.claim.lock();

            let doomed: Vec<ItemRecord> = self
                .inner
                .registry
                .all()
                .into_iter()
                .filter(|r| r.name.is_within(&record.name))
                .collect();
            for item in &doomed {
                if self.project_by_id(item.id).is_some_and(|p| p.running_builds() > 0) {
                    return Err(Error::Conflict(format!("{} has a build in progress", item.name)));
                }
            }

            let removed = self.inner.registry.remove(&record.name)?;
            for item in removed.iter().filter(|item| item.kind == ItemKind::Project) {
                self.inner.queue.remove_project(item.id);
                self.inner.projects.write().remove(&item.id);
            }
            removed
        };

        // Nothing can claim the removed projects any more.
        for item in removed.iter().filter(|item| item.kind == ItemKind::Project) {
            for dir in [self.inner.layout.item_dir(item.id), self.inner.layout.workspace(item.id)] {
                if let Err(e) = remove_dir_if_exists(&dir) {
                    warn!(item = %item.name, dir = %dir.display(), error = %e, "Failed to remove item storage");
                }
            }
        }
        Ok(record.name.parent())
    }

    // --- configuration ---------------------------------------------------

    pub fn config(&self, name: &str) -> Result<ProjectConfig> {
        Ok(self.project(name)?.1.config())
    }

    /// Replace a project's configuration wholesale.
    pub fn update_config(&self, name: &str, config: ProjectConfig) -> Result<()> {
        let (full, project) = self.project(name)?;
        let disabled = config.disabled;
        self.with_blocking(&project, disabled, || {
            project.replace_config(config, self.inner.toolchain.scm.as_ref())
        })?;
        info!(project = %full, "Updated configuration");
        Ok(())
    }

    pub fn add_trigger(&self, name: &str, trigger: Trigger) -> Result<Option<Trigger>> {
        let (_, project) = self.project(name)?;
        project.modify_config(|config| config.triggers.add(trigger))
    }

    pub fn remove_trigger(&self, name: &str, kind: TriggerKind) -> Result<Option<Trigger>> {
        let (_, project) = self.project(name)?;
        project.modify_config(|config| config.triggers.remove(kind))
    }

    /// Disabling cancels a waiting build; a running build carries on.
    pub fn set_disabled(&self, name: &str, disabled: bool) -> Result<()> {
        let (full, project) = self.project(name)?;
        self.with_blocking(&project, disabled, || {
            project.modify_config(|config| config.disabled = disabled)
        })?;
        info!(project = %full, disabled, "Changed project state");
        Ok(())
    }

    /// Block the queue before a change that disables the project, then
    /// settle it on whatever the stored config says.
    fn with_blocking<T>(
        &self,
        project: &ProjectState,
        disabling: bool,
        change: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        if disabling {
            self.inner.queue.set_blocked(project.id, true);
        }
        let outcome = change();
        self.inner.queue.set_blocked(project.id, project.is_disabled());
        outcome
    }

    // --- scheduling ------------------------------------------------------

    /// Request a build. `None` means the project does not accept builds.
    pub fn schedule_build(&self, name: &str, cause: Cause) -> Result<Option<QueueHandle>> {
        let (_, project) = self.project(name)?;
        Ok(self.schedule_project(&project, cause))
    }

    fn schedule_project(&self, project: &ProjectState, cause: Cause) -> Option<QueueHandle> {
        if project.is_disabled() {
            return None;
        }
        self.inner.queue.schedule(project.id, cause)
    }

    /// Cancel a build that has not started yet.
    pub fn cancel_build(&self, name: &str) -> Result<bool> {
        let (_, project) = self.project(name)?;
        Ok(self.inner.queue.cancel(project.id))
    }

    /// Run a change-detection pass and schedule a build on change.
    pub async fn poll(&self, name: &str, cancel: &CancellationToken) -> Result<PollOutcome> {
        let (_, project) = self.project(name)?;
        self.poll_project(project, cancel).await
    }

    async fn poll_project(
        &self,
        project: Arc<ProjectState>,
        cancel: &CancellationToken,
    ) -> Result<PollOutcome> {
        let _polling = project.polling();
        let scm = project.scm();
        let lease = if scm.requires_workspace_for_polling() {
            Some(project.lease.acquire_for_poll(cancel).await?)
        } else {
            None
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            outcome = scm.poll_changes(project.lease.path()) => outcome?,
        };
        drop(lease);

        if let PollOutcome::Changes { summary } = &outcome {
            debug!(project = %project.id, %summary, "Changes detected");
            self.schedule_project(&project, Cause::ScmChange);
        }
        Ok(outcome)
    }

    /// Fire every armed timer and SCM trigger due in `(from, to]`.
    /// SCM polls run as background tasks.
    pub fn fire_due(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<(ResourceId, TriggerKind)> {
        let projects: Vec<Arc<ProjectState>> = self.inner.projects.read().values().cloned().collect();
        let mut fired = Vec::new();
        for project in projects {
            let due: Vec<TriggerKind> = {
                let config = project.config.read();
                if config.disabled {
                    continue;
                }
                config
                    .triggers
                    .armed()
                    .filter(|(_, schedule)| schedule.fires_between(from, to))
                    .map(|(trigger, _)| trigger.kind())
                    .collect()
            };
            for kind in due {
                match kind {
                    TriggerKind::Timer => {
                        self.schedule_project(&project, Cause::Timer);
                    }
                    TriggerKind::Scm => {
                        if project.is_polling() {
                            debug!(project = %project.id, "Skipping poll, one is already running");
                            continue;
                        }
                        let scheduler = self.clone();
                        let project = project.clone();
                        let cancel = self.inner.shutdown.child_token();
                        tokio::spawn(async move {
                            let id = project.id;
                            if let Err(e) = scheduler.poll_project(project, &cancel).await {
                                warn!(project = %id, error = %e, "Polling failed");
                            }
                        });
                    }
                    TriggerKind::Upstream => continue,
                }
                fired.push((project.id, kind));
            }
        }
        fired
    }

    /// Claim the oldest waiting item this executor can run.
    pub(crate) fn try_claim(&self, executor: &ExecutorSpec) -> Option<ClaimedBuild> {
        let _claim = self.inner.claim.lock();
        for item in self.inner.queue.waiting() {
            let Some(project) = self.project_by_id(item.project) else {
                continue;
            };
            let (disabled, label, concurrent, block, upstream) = {
                let config = project.config.read();
                (
                    config.disabled,
                    config.assigned_label.clone(),
                    config.concurrent_build,
                    config.block_when_upstream_building,
                    config
                        .upstream_names()
                        .into_iter()
                        .map(str::to_string)
                        .collect::<Vec<_>>(),
                )
            };

            if disabled {
                continue;
            }
            if label.as_ref().is_some_and(|l| !l.matches(&executor.labels)) {
                continue;
            }
            if block && self.upstream_busy(&upstream) {
                debug!(project = %project.id, "Waiting for upstream projects");
                continue;
            }
            let Some(pending) = project.lease.try_acquire_for_build(concurrent) else {
                continue;
            };
            let started = match self.inner.queue.begin(item.id, || project.allocate_number()) {
                Ok(Some(started)) => started,
                Ok(None) => continue,
                Err(e) => {
                    warn!(project = %project.id, error = %e, "Failed to allocate build number");
                    continue;
                }
            };
            let lease = pending.bind(started.number);
            project.build_started();
            return Some(ClaimedBuild {
                project,
                item: started,
                lease,
                executor: executor.name.clone(),
            });
        }
        None
    }

    fn upstream_busy(&self, upstream: &[String]) -> bool {
        upstream
            .iter()
            .filter_map(|name| FullName::parse(name).ok())
            .filter_map(|name| self.inner.registry.lookup(&name))
            .any(|record| self.inner.queue.is_queued_or_building(record.id))
    }

    /// Run a claimed build to completion.
    pub(crate) async fn execute(&self, claimed: ClaimedBuild) {
        let ClaimedBuild {
            project,
            item,
            lease,
            executor,
        } = claimed;
        let number = item.number;

        let Some(name) = self.inner.registry.name_of(project.id) else {
            drop(lease);
            project.build_finished();
            self.inner.queue.fail(item.id, "project was deleted");
            return;
        };

        let (steps, publishers) = {
            let config = project.config.read();
            (config.steps.clone(), config.publishers.clone())
        };
        let workspace = project.lease.path().to_path_buf();
        let build_dir = project.history.build_dir(number);
        let mut build = Build {
            project: project.id,
            number,
            queue_id: item.id,
            causes: item.causes.clone(),
            scheduled_at: item.queued_at,
            started_at: Utc::now(),
            finished_at: None,
            result: None,
            workspace: workspace.clone(),
            executor: executor.clone(),
        };

        let prepared = std::fs::create_dir_all(&workspace)
            .map_err(Error::from)
            .and_then(|_| project.history.insert(build.clone()));
        if let Err(e) = prepared {
            error!(project = %name, build = number, error = %e, "Failed to start build");
            drop(lease);
            project.build_finished();
            self.inner.queue.fail(item.id, e.to_string());
            return;
        }
        info!(project = %name, build = number, %executor, "Build started");

        let (log, writer) = spawn_log_writer(build_dir.join("log"));
        for cause in &build.causes {
            log_system(&log, cause.to_string());
        }
        let ctx = BuildContext::new(name.clone(), project.id, number, workspace, build_dir);
        let result = self.run_build(&project, &ctx, &steps, &publishers, &log).await;
        log_system(&log, format!("Finished: {result}"));
        drop(log);
        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(project = %name, build = number, error = %e, "Failed to write build log"),
            Err(e) => warn!(project = %name, build = number, error = %e, "Build log writer failed"),
        }

        build.result = Some(result);
        build.finished_at = Some(Utc::now());
        let persisted = {
            let project = project.clone();
            let record = build.clone();
            tokio::task::spawn_blocking(move || {
                let stored = project.history.update(record);
                (stored, project.pointers.recompute(&project.history))
            })
            .await
        };
        let (stored, recomputed) = match persisted {
            Ok(outcome) => outcome,
            Err(e) => {
                let message = format!("build record task failed: {e}");
                (Err(Error::Internal(message.clone())), Err(Error::Internal(message)))
            }
        };
        if let Err(e) = &stored {
            error!(project = %name, build = number, error = %e, "Failed to record build result");
        }
        if let Err(e) = recomputed {
            warn!(project = %name, build = number, error = %e, "Failed to update build pointers");
        }

        drop(lease);
        project.build_finished();
        info!(project = %name, build = number, %result, "Build finished");

        // Downstream items are queued before the upstream item resolves.
        self.schedule_downstream(&name, number, result);
        match stored {
            Ok(_) => self.inner.queue.complete(item.id, build),
            Err(e) => self.inner.queue.fail(item.id, e.to_string()),
        }
    }

    async fn run_build(
        &self,
        project: &ProjectState,
        ctx: &BuildContext,
        steps: &[Step],
        publishers: &[PublisherConfig],
        log: &LogSender,
    ) -> BuildResult {
        let mut result = BuildResult::Success;

        if let Err(e) = project.scm().checkout(&ctx.workspace, log).await {
            log_system(log, format!("Checkout failed: {e}"));
            result = BuildResult::Failure;
        }

        if result.is_successful() {
            for step in steps {
                match self.inner.toolchain.steps.run(ctx, step, log).await {
                    Ok(step_result) => result = result.combine(step_result),
                    Err(e) => {
                        log_system(log, format!("Build step failed: {e}"));
                        result = result.combine(BuildResult::Failure);
                    }
                }
                if !result.is_successful() {
                    break;
                }
            }
        }

        for publisher in publishers {
            match self.inner.toolchain.publisher.publish(ctx, publisher, result, log).await {
                Ok(published) => result = result.combine(published),
                Err(e) => {
                    log_system(log, format!("Publisher failed: {e}"));
                    result = result.combine(BuildResult::Failure);
                }
            }
        }
        result
    }

    fn schedule_downstream(&self, upstream: &FullName, number: u32, result: BuildResult) {
        let projects: Vec<Arc<ProjectState>> = self.inner.projects.read().values().cloned().collect();
        for project in projects {
            let qualifies = {
                let config = project.config.read();
                match config.triggers.get(TriggerKind::Upstream) {
                    Some(Trigger::Upstream { projects, threshold }) => {
                        names_match(projects, upstream) && result.is_better_or_equal(*threshold)
                    }
                    _ => false,
                }
            };
            if !qualifies {
                continue;
            }
            let cause = Cause::Upstream {
                project: upstream.to_string(),
                number,
            };
            if self.schedule_project(&project, cause).is_some() {
                info!(upstream = %upstream, build = number, downstream = %project.id, "Triggered downstream build");
            }
        }
    }

    // --- history and state -------------------------------------------------

    pub fn history(&self, name: &str) -> Result<Arc<BuildHistory>> {
        Ok(self.project(name)?.1.history.clone())
    }

    pub fn build(&self, name: &str, number: u32) -> Result<Arc<Build>> {
        let (full, project) = self.project(name)?;
        project
            .history
            .get(number)
            .ok_or_else(|| Error::NotFound(format!("{full} has no build #{number}")))
    }

    pub async fn log(&self, name: &str, number: u32) -> Result<String> {
        let (full, project) = self.project(name)?;
        let path = project.history.build_dir(number).join("log");
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("{full} has no log for build #{number}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete one build and recompute the pointers. Blocking.
    pub fn delete_build(&self, name: &str, number: u32) -> Result<bool> {
        let (full, project) = self.project(name)?;
        if project.history.get(number).is_some_and(|b| b.is_building()) {
            return Err(Error::Conflict(format!("{full} #{number} is still building")));
        }
        let removed = project.history.remove(number)?;
        if removed {
            project.pointers.recompute(&project.history)?;
            info!(project = %full, build = number, "Deleted build");
        }
        Ok(removed)
    }

    pub fn pointer(&self, name: &str, kind: PointerKind) -> Result<Option<u32>> {
        Ok(self.project(name)?.1.pointers.resolve(kind))
    }

    pub fn pointers(&self, name: &str) -> Result<Pointers> {
        Ok(self.project(name)?.1.pointers.resolve_all())
    }

    pub fn pointer_path(&self, name: &str, kind: PointerKind) -> Result<PathBuf> {
        Ok(self.project(name)?.1.pointers.path(kind))
    }

    pub fn state(&self, name: &str) -> Result<ProjectStatus> {
        let (_, project) = self.project(name)?;
        let status = if project.running_builds() > 0 {
            ProjectStatus::Building
        } else if self.inner.queue.is_waiting(project.id) {
            ProjectStatus::Queued
        } else if project.is_polling() {
            ProjectStatus::Polling
        } else {
            ProjectStatus::Idle
        };
        Ok(status)
    }

    pub fn next_build_number(&self, name: &str) -> Result<u32> {
        Ok(self.project(name)?.1.next_number())
    }

    // --- workspace ---------------------------------------------------------

    pub fn workspace(&self, name: &str) -> Result<WorkspaceInfo> {
        let (_, project) = self.project(name)?;
        let path = project.lease.path().to_path_buf();
        Ok(WorkspaceInfo {
            exists: path.is_dir(),
            path,
            holder: project.lease.holder(),
        })
    }

    /// Delete the workspace. Requires [`Permission::Wipeout`].
    pub async fn wipe_workspace(
        &self,
        name: &str,
        user: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (full, project) = self.project(name)?;
        require(self.inner.authorizer.as_ref(), user, Permission::Wipeout, &full)?;
        project.lease.wipe(cancel).await?;
        info!(project = %full, user = user.unwrap_or(ANONYMOUS), "Wiped workspace");
        Ok(())
    }

    // --- relationships -----------------------------------------------------

    /// Projects this one is triggered by, limited to what `user` may read.
    pub fn upstream_projects(&self, name: &str, user: Option<&str>) -> Result<Vec<FullName>> {
        let (_, project) = self.project(name)?;
        let config = project.config();
        Ok(config
            .upstream_names()
            .into_iter()
            .filter_map(|upstream| FullName::parse(upstream).ok())
            .filter(|upstream| {
                self.inner
                    .registry
                    .lookup(upstream)
                    .is_some_and(|r| r.kind == ItemKind::Project)
            })
            .filter(|upstream| self.has_permission(user, Permission::Read, upstream))
            .collect())
    }

    /// Projects triggered by this one, limited to what `user` may read.
    pub fn downstream_projects(&self, name: &str, user: Option<&str>) -> Result<Vec<FullName>> {
        let (full, _) = self.project(name)?;
        let projects: Vec<Arc<ProjectState>> = self.inner.projects.read().values().cloned().collect();
        let mut downstream: Vec<FullName> = projects
            .iter()
            .filter(|p| names_match(&p.config().upstream_names(), &full))
            .filter_map(|p| self.inner.registry.name_of(p.id))
            .filter(|n| self.has_permission(user, Permission::Read, n))
            .collect();
        downstream.sort();
        Ok(downstream)
    }

    // --- lookup ------------------------------------------------------------

    fn project(&self, name: &str) -> Result<(FullName, Arc<ProjectState>)> {
        let record = self.resolve(name)?;
        if record.kind != ItemKind::Project {
            return Err(Error::InvalidInput(format!("{} is a folder, not a project", record.name)));
        }
        let project = self
            .project_by_id(record.id)
            .ok_or_else(|| Error::NotFound(format!("{} is not loaded", record.name)))?;
        Ok((record.name, project))
    }

    fn project_by_id(&self, id: ResourceId) -> Option<Arc<ProjectState>> {
        self.inner.projects.read().get(&id).cloned()
    }
}

fn new_full_name(record: &ItemRecord, renamed: &[Renamed]) -> FullName {
    renamed
        .iter()
        .find(|r| r.id == record.id)
        .map(|r| r.to.clone())
        .unwrap_or_else(|| record.name.clone())
}

fn moved_to(renamed: &[Renamed], upstream: &str) -> Option<String> {
    let name = FullName::parse(upstream).ok()?;
    renamed
        .iter()
        .find(|r| r.from == name)
        .map(|r| r.to.to_string())
}

fn names_match<S: AsRef<str>>(names: &[S], target: &FullName) -> bool {
    names
        .iter()
        .any(|n| FullName::parse(n.as_ref()).is_ok_and(|n| n == *target))
}

fn spawn_log_writer(path: PathBuf) -> (LogSender, JoinHandle<std::io::Result<()>>) {
    let (tx, mut rx) = futures::channel::mpsc::unbounded::<LogLine>();
    let handle = tokio::spawn(async move {
        let file = tokio::fs::File::create(&path).await?;
        let mut out = tokio::io::BufWriter::new(file);
        while let Some(line) = rx.next().await {
            out.write_all(format!("{line}\n").as_bytes()).await?;
        }
        out.flush().await?;
        out.into_inner().sync_all().await?;
        Ok(())
    });
    (tx, handle)
}
