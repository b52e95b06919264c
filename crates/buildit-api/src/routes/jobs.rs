//! Project and folder endpoints under `/job/...`.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use buildit_config::ItemBody;
use buildit_core::security::{ANONYMOUS, Permission};
use buildit_core::{
    Build, BuildResult, Cause, FullName, ItemKind, ProjectConfig, Trigger,
};
use buildit_scheduler::{PointerKind, ProjectStatus, WorkspaceInfo};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{ItemRef, job_url, parse_job_path, request_user, require, require_read};
use crate::AppState;
use crate::error::ApiError;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ActionQuery {
    /// Target name for `doRename` and `createItem`.
    new_name: Option<String>,
    name: Option<String>,
    /// `project` or `folder` for `createItem` without a definition.
    mode: Option<String>,
    /// Destination folder for `move`; empty for the top level.
    folder: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ItemSummary {
    #[serde(flatten)]
    item: ItemRef,
    kind: ItemKind,
}

#[derive(Debug, Serialize)]
struct FolderSummary {
    name: String,
    url: String,
    kind: ItemKind,
    items: Vec<ItemSummary>,
}

#[derive(Debug, Serialize)]
struct BuildSummary {
    number: u32,
    url: String,
    building: bool,
    result: Option<BuildResult>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct ProjectSummary {
    name: String,
    url: String,
    kind: ItemKind,
    description: Option<String>,
    disabled: bool,
    buildable: bool,
    concurrent_build: bool,
    assigned_label: Option<String>,
    state: ProjectStatus,
    in_queue: bool,
    next_build_number: u32,
    builds: Vec<BuildSummary>,
    last_successful_build: Option<u32>,
    last_stable_build: Option<u32>,
    triggers: Vec<Trigger>,
    upstream_projects: Vec<ItemRef>,
    downstream_projects: Vec<ItemRef>,
}

#[derive(Debug, Serialize)]
struct WorkspaceView {
    #[serde(flatten)]
    info: WorkspaceInfo,
    files: Vec<String>,
    actions: Vec<&'static str>,
}

/// Top-level items.
pub(crate) async fn root_index(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ItemSummary>>, ApiError> {
    let user = request_user(&headers);
    Ok(Json(visible_items(&state, user.as_deref(), None)))
}

pub(crate) async fn create_root_item(
    State(state): State<AppState>,
    Query(query): Query<ActionQuery>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, ApiError> {
    let user = request_user(&headers);
    create_item(&state, user.as_deref(), None, &query, &body)
}

pub(crate) async fn get_job(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (name, action) = parse_job_path(&path)
        .ok_or_else(|| ApiError::NotFound(format!("No such item: {path}")))?;
    let user = request_user(&headers);
    let user = user.as_deref();
    let record = state.scheduler.resolve(&name)?;
    require_read(&state, user, &record.name)?;

    let action: Vec<&str> = action.iter().map(String::as_str).collect();
    match (record.kind, action.as_slice()) {
        (ItemKind::Folder, [] | ["api", "json"]) => {
            let summary = FolderSummary {
                name: record.name.to_string(),
                url: job_url(&record.name),
                kind: ItemKind::Folder,
                items: visible_items(&state, user, Some(&record.name)),
            };
            Ok(Json(summary).into_response())
        }
        (ItemKind::Project, [] | ["api", "json"]) => {
            Ok(Json(project_summary(&state, user, &record.name)?).into_response())
        }
        (ItemKind::Project, ["ws"]) => Ok(Json(workspace_view(&state, user, &record.name).await?).into_response()),
        (ItemKind::Project, [build] | [build, "api", "json"]) => {
            let number = build_number(&state, &record.name, build)?;
            let build: Build = (*state.scheduler.build(record.name.as_str(), number)?).clone();
            Ok(Json(build).into_response())
        }
        (ItemKind::Project, [build, "consoleText"]) => {
            let number = build_number(&state, &record.name, build)?;
            let log = state.scheduler.log(record.name.as_str(), number).await?;
            Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], log).into_response())
        }
        _ => Err(ApiError::NotFound(format!(
            "{} has no page {}",
            record.name,
            action.join("/")
        ))),
    }
}

pub(crate) async fn post_job(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<ActionQuery>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, ApiError> {
    let (name, action) = parse_job_path(&path)
        .ok_or_else(|| ApiError::NotFound(format!("No such item: {path}")))?;
    let user = request_user(&headers);
    let user = user.as_deref();
    let record = state.scheduler.resolve(&name)?;
    require_read(&state, user, &record.name)?;
    let name = record.name;

    let action: Vec<&str> = action.iter().map(String::as_str).collect();
    match (record.kind, action.as_slice()) {
        (ItemKind::Project, ["build"]) => trigger_build(&state, user, &name),
        (ItemKind::Project, ["doWipeOutWorkspace"]) => {
            state
                .scheduler
                .wipe_workspace(name.as_str(), user, &CancellationToken::new())
                .await?;
            Ok(Json(json!({ "status": "wiped" })).into_response())
        }
        (kind, ["config.kdl"]) => {
            require(&state, user, Permission::Configure, &name)?;
            submit_config(&state, &name, kind, &body)
        }
        (ItemKind::Project, ["disable"]) | (ItemKind::Project, ["enable"]) => {
            require(&state, user, Permission::Configure, &name)?;
            let disabled = action == ["disable"];
            state.scheduler.set_disabled(name.as_str(), disabled)?;
            Ok(Json(json!({ "disabled": disabled })).into_response())
        }
        (ItemKind::Project, ["cancelQueue"]) => {
            require(&state, user, Permission::Build, &name)?;
            let cancelled = state.scheduler.cancel_build(name.as_str())?;
            Ok(Json(json!({ "cancelled": cancelled })).into_response())
        }
        (ItemKind::Project, ["polling"]) => {
            require(&state, user, Permission::Build, &name)?;
            let scheduler = state.scheduler.clone();
            let target = name.clone();
            tokio::spawn(async move {
                if let Err(e) = scheduler.poll(target.as_str(), &CancellationToken::new()).await {
                    warn!(project = %target, error = %e, "Polling failed");
                }
            });
            Ok((StatusCode::ACCEPTED, Json(json!({ "status": "polling" }))).into_response())
        }
        (ItemKind::Project, [build, "doDelete"]) => {
            require(&state, user, Permission::Delete, &name)?;
            let number = build_number(&state, &name, build)?;
            let scheduler = state.scheduler.clone();
            let target = name.clone();
            blocking(move || scheduler.delete_build(target.as_str(), number)).await?;
            Ok(redirect(&job_url(&name)))
        }
        (ItemKind::Folder, ["createItem"]) => create_item(&state, user, Some(&name), &query, &body),
        (_, ["doDelete"]) => {
            require(&state, user, Permission::Delete, &name)?;
            let scheduler = state.scheduler.clone();
            let target = name.clone();
            let parent = blocking(move || scheduler.delete_item(target.as_str())).await?;
            info!(item = %name, user = user.unwrap_or(ANONYMOUS), "Deleted item");
            Ok(redirect(&parent.as_ref().map_or_else(|| "/".to_string(), job_url)))
        }
        (_, ["doRename"]) => {
            require(&state, user, Permission::Configure, &name)?;
            let new_name = query
                .new_name
                .as_deref()
                .ok_or_else(|| ApiError::BadRequest("newName is required".to_string()))?;
            let renamed = state.scheduler.rename(name.as_str(), new_name)?;
            Ok(redirect(&job_url(&renamed)))
        }
        (_, ["move"]) => {
            require(&state, user, Permission::Configure, &name)?;
            let folder = query.folder.as_deref().filter(|f| !f.is_empty());
            let moved = state.scheduler.move_item(name.as_str(), folder)?;
            Ok(redirect(&job_url(&moved)))
        }
        _ => Err(ApiError::NotFound(format!(
            "{} has no action {}",
            name,
            action.join("/")
        ))),
    }
}

/// Run storage removal off the async workers.
async fn blocking<T: Send + 'static>(
    work: impl FnOnce() -> buildit_core::Result<T> + Send + 'static,
) -> Result<T, ApiError> {
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ApiError::Internal(format!("storage task failed: {e}")))?
        .map_err(ApiError::from)
}

fn trigger_build(state: &AppState, user: Option<&str>, name: &FullName) -> Result<Response, ApiError> {
    require(state, user, Permission::Build, name)?;
    let cause = Cause::User {
        user: user.unwrap_or(ANONYMOUS).to_string(),
    };
    let handle = state
        .scheduler
        .schedule_build(name.as_str(), cause)?
        .ok_or_else(|| ApiError::Conflict(format!("{name} is disabled")))?;

    let location = format!("/queue/item/{}/", handle.id());
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, location.clone())],
        Json(json!({ "id": handle.id().to_string(), "url": location })),
    )
        .into_response())
}

fn submit_config(state: &AppState, name: &FullName, kind: ItemKind, body: &str) -> Result<Response, ApiError> {
    let definition = buildit_config::parse_item(body)?;
    match (kind, definition.body) {
        (ItemKind::Project, ItemBody::Project(config)) => {
            state.scheduler.update_config(name.as_str(), *config)?;
        }
        (ItemKind::Folder, ItemBody::Folder { .. }) => {}
        (ItemKind::Project, ItemBody::Folder { .. }) => {
            return Err(ApiError::BadRequest(format!(
                "expected a project definition for {name} but got a folder"
            )));
        }
        (ItemKind::Folder, ItemBody::Project(_)) => {
            return Err(ApiError::BadRequest(format!(
                "expected a folder definition for {name} but got a project"
            )));
        }
    }
    Ok(Json(json!({ "status": "updated" })).into_response())
}

fn create_item(
    state: &AppState,
    user: Option<&str>,
    parent: Option<&FullName>,
    query: &ActionQuery,
    body: &str,
) -> Result<Response, ApiError> {
    let definition = if body.trim().is_empty() {
        None
    } else {
        Some(buildit_config::parse_item(body)?)
    };
    let leaf = query
        .name
        .as_deref()
        .or(query.new_name.as_deref())
        .or(definition.as_ref().map(|d| d.name.as_str()))
        .ok_or_else(|| ApiError::BadRequest("name is required".to_string()))?;
    let full = FullName::within(parent, leaf)?;
    require(state, user, Permission::Configure, &full)?;

    match definition.map(|d| d.body) {
        Some(ItemBody::Project(config)) => {
            state.scheduler.create_project(full.as_str(), *config)?;
        }
        Some(ItemBody::Folder { .. }) => {
            state.scheduler.create_folder(full.as_str())?;
        }
        None => match query.mode.as_deref().unwrap_or("project") {
            "project" => {
                state.scheduler.create_project(full.as_str(), ProjectConfig::default())?;
            }
            "folder" => {
                state.scheduler.create_folder(full.as_str())?;
            }
            other => return Err(ApiError::BadRequest(format!("unknown item mode: {other}"))),
        },
    }

    let url = job_url(&full);
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, url.clone())],
        Json(json!({ "name": full.to_string(), "url": url })),
    )
        .into_response())
}

fn project_summary(state: &AppState, user: Option<&str>, name: &FullName) -> Result<ProjectSummary, ApiError> {
    let scheduler = &state.scheduler;
    let config = scheduler.config(name.as_str())?;
    let history = scheduler.history(name.as_str())?;
    let pointers = scheduler.pointers(name.as_str())?;
    let project_url = job_url(name);
    let status = scheduler.state(name.as_str())?;

    let builds = history
        .all()
        .map(|build| BuildSummary {
            number: build.number,
            url: format!("{project_url}{}/", build.number),
            building: build.is_building(),
            result: build.result,
            started_at: build.started_at,
            finished_at: build.finished_at,
        })
        .collect();

    Ok(ProjectSummary {
        name: name.to_string(),
        url: project_url.clone(),
        kind: ItemKind::Project,
        description: config.description.clone(),
        disabled: config.disabled,
        buildable: !config.disabled,
        concurrent_build: config.concurrent_build,
        assigned_label: config.assigned_label.as_ref().map(ToString::to_string),
        state: status,
        in_queue: status == ProjectStatus::Queued,
        next_build_number: scheduler.next_build_number(name.as_str())?,
        builds,
        last_successful_build: pointers.last_successful,
        last_stable_build: pointers.last_stable,
        triggers: config.triggers.list().into_iter().cloned().collect(),
        upstream_projects: scheduler
            .upstream_projects(name.as_str(), user)?
            .iter()
            .map(ItemRef::from)
            .collect(),
        downstream_projects: scheduler
            .downstream_projects(name.as_str(), user)?
            .iter()
            .map(ItemRef::from)
            .collect(),
    })
}

async fn workspace_view(state: &AppState, user: Option<&str>, name: &FullName) -> Result<WorkspaceView, ApiError> {
    let info = state.scheduler.workspace(name.as_str())?;
    let mut files = Vec::new();
    if info.exists {
        let mut entries = tokio::fs::read_dir(&info.path)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?
        {
            files.push(entry.file_name().to_string_lossy().into_owned());
        }
        files.sort();
    }

    let mut actions = Vec::new();
    if state.scheduler.has_permission(user, Permission::Wipeout, name) {
        actions.push("doWipeOutWorkspace");
    }
    Ok(WorkspaceView { info, files, actions })
}

/// A build number, `lastBuild`, or a pointer name such as `lastStableBuild`.
fn build_number(state: &AppState, name: &FullName, reference: &str) -> Result<u32, ApiError> {
    if let Ok(number) = reference.parse::<u32>() {
        return Ok(number);
    }
    let resolved = if reference == "lastBuild" {
        state.scheduler.history(name.as_str())?.latest().map(|b| b.number)
    } else {
        let kind: PointerKind = reference
            .parse()
            .map_err(|_| ApiError::NotFound(format!("{name} has no page {reference}")))?;
        state.scheduler.pointer(name.as_str(), kind)?
    };
    resolved.ok_or_else(|| ApiError::NotFound(format!("{name} has no {reference}")))
}

fn visible_items(state: &AppState, user: Option<&str>, folder: Option<&FullName>) -> Vec<ItemSummary> {
    state
        .scheduler
        .items(folder)
        .into_iter()
        .filter(|record| state.scheduler.has_permission(user, Permission::Read, &record.name))
        .map(|record| ItemSummary {
            item: ItemRef::from(&record.name),
            kind: record.kind,
        })
        .collect()
}

fn redirect(location: &str) -> Response {
    (StatusCode::SEE_OTHER, [(header::LOCATION, location.to_string())]).into_response()
}
