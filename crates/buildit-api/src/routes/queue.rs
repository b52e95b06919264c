//! Build queue endpoints.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use buildit_core::ResourceId;
use buildit_core::security::Permission;
use buildit_scheduler::{ItemState, QueueItemInfo};
use serde::Serialize;
use serde_json::{Value, json};

use super::{ItemRef, job_url, request_user, require, require_read};
use crate::AppState;
use crate::error::ApiError;

#[derive(Debug, Serialize)]
struct BuildRef {
    number: u32,
    url: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct QueueItemView {
    #[serde(flatten)]
    info: QueueItemInfo,
    url: String,
    task: Option<ItemRef>,
    executable: Option<BuildRef>,
}

pub(crate) async fn get_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<QueueItemView>, ApiError> {
    let user = request_user(&headers);
    let info = lookup(&state, &id)?;
    let name = state.scheduler.name_of(info.project);
    if let Some(name) = &name {
        require_read(&state, user.as_deref(), name)?;
    }

    let executable = match (&name, info.state.number()) {
        (Some(name), Some(number)) => Some(BuildRef {
            number,
            url: format!("{}{number}/", job_url(name)),
        }),
        _ => None,
    };
    Ok(Json(QueueItemView {
        url: format!("/queue/item/{}/", info.id),
        task: name.as_ref().map(ItemRef::from),
        executable,
        info,
    }))
}

pub(crate) async fn cancel_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let user = request_user(&headers);
    let info = lookup(&state, &id)?;
    let name = state
        .scheduler
        .name_of(info.project)
        .ok_or_else(|| ApiError::NotFound(format!("No such queue item: {id}")))?;
    require_read(&state, user.as_deref(), &name)?;
    require(&state, user.as_deref(), Permission::Build, &name)?;

    let cancelled = info.state == ItemState::Waiting && state.scheduler.queue().cancel(info.project);
    Ok(Json(json!({ "cancelled": cancelled })))
}

fn lookup(state: &AppState, id: &str) -> Result<QueueItemInfo, ApiError> {
    let not_found = || ApiError::NotFound(format!("No such queue item: {id}"));
    let id: ResourceId = id.parse().map_err(|_| not_found())?;
    state.scheduler.queue().get(id).ok_or_else(not_found)
}
